//! The monitor's expression language: a tokenizer and a precedence-scanning evaluator over
//! live machine state.

use nom_locate::LocatedSpan;
use thiserror::Error;

use crate::emu::EmuError;

pub mod eval;
pub mod lexer;

pub use eval::Evaluator;

pub type Span<'a> = LocatedSpan<&'a str>;

/// Maximum number of tokens in one expression.
pub const MAX_TOKENS: usize = 32;
/// Maximum length of a single token's text.
pub const MAX_TOKEN_LEN: usize = 31;

/// A malformed token range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("missing operand")]
    EmptyRange,
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("no operator joins the operands")]
    MissingOperator,
    #[error("unexpected `{0}`")]
    UnexpectedToken(String),
}

/// An error for lexing or evaluating an expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("no token matches at offset {offset}")]
    Lex { offset: usize },
    #[error("expression has more than {} tokens", MAX_TOKENS)]
    TooManyTokens,
    #[error("token at offset {offset} is longer than {} bytes", MAX_TOKEN_LEN)]
    TokenTooLong { offset: usize },
    #[error("literal `{0}` does not fit in 32 bits")]
    BadLiteral(String),
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown register `${0}`")]
    UnknownRegister(String),
    #[error("`{0}` cannot be used as a {1} operator")]
    UnsupportedOperator(Op, &'static str),
    #[error(transparent)]
    Memory(#[from] EmuError),
}

/// Operators. `Neg` and `Deref` never come out of the lexer; they are what `-` and `*` turn
/// into in unary position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    And,
    Or,
    Not,
    Neg,
    Deref,
}

impl Op {
    /// Precedence tier. The main operator of a range is the one with the highest tier.
    pub fn tier(self) -> u8 {
        match self {
            Op::Neg | Op::Not => 1,
            Op::Deref => 2,
            Op::Mul | Op::Div => 3,
            Op::Add | Op::Sub => 4,
            Op::Eq | Op::Ne => 5,
            Op::And => 6,
            Op::Or => 7,
        }
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Op::Neg | Op::Not | Op::Deref)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub | Op::Neg => "-",
            Op::Mul | Op::Deref => "*",
            Op::Div => "/",
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::And => "&&",
            Op::Or => "||",
            Op::Not => "!",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// The kinds of token an expression is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Decimal literal.
    Num,
    /// `0x`-prefixed literal.
    Hex,
    /// Register reference; the text holds the name without its `$`.
    Reg,
    Op(Op),
    LParen,
    RParen,
}

impl TokenKind {
    /// Literals and closing parentheses end an operand.
    pub fn ends_operand(self) -> bool {
        matches!(
            self,
            TokenKind::Num | TokenKind::Hex | TokenKind::Reg | TokenKind::RParen
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, text: &str) -> Self {
        Self {
            kind,
            text: text.to_string(),
        }
    }
}

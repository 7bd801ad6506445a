use crate::{
    emu::registers::MachineState,
    plat::{Register, Width},
};

use super::{lexer::lex_expr, ExprError, Op, SyntaxError, Token, TokenKind, MAX_TOKENS};

/// Turns `-` and `*` in unary position into negation and dereference.
///
/// A token is in unary position when it is the first token or follows anything that cannot
/// end an operand (an operator or an opening parenthesis).
pub fn disambiguate(tokens: &mut [Token]) {
    for i in 0..tokens.len() {
        if i > 0 && tokens[i - 1].kind.ends_operand() {
            continue;
        }
        tokens[i].kind = match tokens[i].kind {
            TokenKind::Op(Op::Sub) => TokenKind::Op(Op::Neg),
            TokenKind::Op(Op::Mul) => TokenKind::Op(Op::Deref),
            kind => kind,
        };
    }
}

/// Evaluates monitor expressions against a machine.
///
/// Owns the token buffer, which is rebuilt on every call. Recursive evaluation only ever
/// carries index ranges into it, so dereferences nested at any depth share it safely.
pub struct Evaluator {
    tokens: Vec<Token>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            tokens: Vec::with_capacity(MAX_TOKENS),
        }
    }

    /// Lexes and evaluates `expr`. Arithmetic is 32-bit two's complement.
    ///
    /// The value is the 32-bit result reinterpreted as `i32`, so `0xffffffff` comes back as
    /// -1. Cast to `u32` for the unsigned view.
    pub fn evaluate<M: MachineState + ?Sized>(
        &mut self,
        expr: &str,
        machine: &M,
    ) -> Result<i32, ExprError> {
        lex_expr(expr, &mut self.tokens)?;
        disambiguate(&mut self.tokens);
        let range = RangeEval {
            tokens: &self.tokens,
            machine,
        };
        range.eval(0, self.tokens.len())
    }

    /// The tokens of the last evaluated expression, after disambiguation.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

struct RangeEval<'t, 'm, M: ?Sized> {
    tokens: &'t [Token],
    machine: &'m M,
}

impl<'t, 'm, M: MachineState + ?Sized> RangeEval<'t, 'm, M> {
    /// Evaluates the tokens in `lo..hi`.
    fn eval(&self, lo: usize, hi: usize) -> Result<i32, ExprError> {
        if lo >= hi {
            return Err(SyntaxError::EmptyRange.into());
        }
        if hi - lo == 1 {
            return self.literal(&self.tokens[lo]);
        }
        if self.parenthesized(lo, hi) {
            return self.eval(lo + 1, hi - 1);
        }
        let (pos, op) = self.main_operator(lo, hi)?;
        if op.is_unary() {
            let operand = self.eval(pos + 1, hi)?;
            self.unary(op, operand)
        } else {
            // both sides are always evaluated, errors included
            let left = self.eval(lo, pos)?;
            let right = self.eval(pos + 1, hi)?;
            binary(op, left, right)
        }
    }

    fn literal(&self, tok: &Token) -> Result<i32, ExprError> {
        let bad = || ExprError::BadLiteral(tok.text.clone());
        match tok.kind {
            TokenKind::Num => tok.text.parse::<u32>().map(|v| v as i32).map_err(|_| bad()),
            TokenKind::Hex => u32::from_str_radix(&tok.text[2..], 16)
                .map(|v| v as i32)
                .map_err(|_| bad()),
            TokenKind::Reg => {
                if let Some(reg) = Register::from_name(&tok.text) {
                    Ok(self.machine.reg(reg) as i32)
                } else if tok.text.eq_ignore_ascii_case("eip") {
                    Ok(self.machine.eip() as i32)
                } else {
                    Err(ExprError::UnknownRegister(tok.text.clone()))
                }
            }
            TokenKind::Op(_) | TokenKind::LParen | TokenKind::RParen => {
                Err(SyntaxError::UnexpectedToken(tok.text.clone()).into())
            }
        }
    }

    /// Whether `lo..hi` is wrapped in one matching pair of parentheses.
    fn parenthesized(&self, lo: usize, hi: usize) -> bool {
        if self.tokens[lo].kind != TokenKind::LParen || self.tokens[hi - 1].kind != TokenKind::RParen
        {
            return false;
        }
        let mut balance = 0i32;
        for (i, tok) in self.tokens[lo..hi].iter().enumerate() {
            match tok.kind {
                TokenKind::LParen => balance += 1,
                TokenKind::RParen => balance -= 1,
                _ => {}
            }
            if balance == 0 && lo + i < hi - 1 {
                return false;
            }
        }
        balance == 0
    }

    /// Finds the operator `lo..hi` splits at: among the binary operators outside any
    /// parentheses, the one with the highest tier, rightmost on ties. With no binary operator
    /// the range must start with a unary one.
    fn main_operator(&self, lo: usize, hi: usize) -> Result<(usize, Op), ExprError> {
        let mut balance = 0i32;
        let mut best: Option<(usize, Op)> = None;
        for (i, tok) in self.tokens.iter().enumerate().take(hi).skip(lo) {
            match tok.kind {
                TokenKind::LParen => balance += 1,
                TokenKind::RParen => {
                    balance -= 1;
                    if balance < 0 {
                        return Err(SyntaxError::UnbalancedParens.into());
                    }
                }
                TokenKind::Op(op) if balance == 0 && !op.is_unary() => {
                    if best.map_or(true, |(_, b)| op.tier() >= b.tier()) {
                        best = Some((i, op));
                    }
                }
                _ => {}
            }
        }
        if balance != 0 {
            return Err(SyntaxError::UnbalancedParens.into());
        }
        if let Some(found) = best {
            return Ok(found);
        }
        match self.tokens[lo].kind {
            TokenKind::Op(op) if op.is_unary() => Ok((lo, op)),
            _ => Err(SyntaxError::MissingOperator.into()),
        }
    }

    fn unary(&self, op: Op, operand: i32) -> Result<i32, ExprError> {
        match op {
            Op::Neg => Ok(operand.wrapping_neg()),
            Op::Not => Ok(i32::from(operand == 0)),
            Op::Deref => Ok(self.machine.vaddr_read(operand as u32, Width::Long)? as i32),
            _ => Err(ExprError::UnsupportedOperator(op, "unary")),
        }
    }
}

fn binary(op: Op, left: i32, right: i32) -> Result<i32, ExprError> {
    let value = match op {
        Op::Add => left.wrapping_add(right),
        Op::Sub => left.wrapping_sub(right),
        Op::Mul => left.wrapping_mul(right),
        Op::Div => {
            if right == 0 {
                return Err(ExprError::DivisionByZero);
            }
            left.wrapping_div(right)
        }
        Op::Eq => i32::from(left == right),
        Op::Ne => i32::from(left != right),
        Op::And => i32::from(left != 0 && right != 0),
        Op::Or => i32::from(left != 0 || right != 0),
        Op::Not | Op::Neg | Op::Deref => {
            return Err(ExprError::UnsupportedOperator(op, "binary"));
        }
    };
    Ok(value)
}

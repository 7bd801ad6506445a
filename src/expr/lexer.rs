use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, digit1, hex_digit1, multispace1},
    combinator::{consumed, map, recognize, value},
    sequence::preceded,
    IResult,
};

use super::{ExprError, Op, Span, Token, TokenKind, MAX_TOKENS, MAX_TOKEN_LEN};

/// Operators, longest spellings first so `==` is never read as two tokens.
pub fn lex_operator(inp: Span) -> IResult<Span, TokenKind> {
    alt((
        value(TokenKind::Op(Op::Eq), tag("==")),
        value(TokenKind::Op(Op::Ne), tag("!=")),
        value(TokenKind::Op(Op::And), tag("&&")),
        value(TokenKind::Op(Op::Or), tag("||")),
        value(TokenKind::Op(Op::Add), tag("+")),
        value(TokenKind::Op(Op::Sub), tag("-")),
        value(TokenKind::Op(Op::Mul), tag("*")),
        value(TokenKind::Op(Op::Div), tag("/")),
        value(TokenKind::Op(Op::Not), tag("!")),
        value(TokenKind::LParen, tag("(")),
        value(TokenKind::RParen, tag(")")),
    ))(inp)
}

pub fn lex_hex(inp: Span) -> IResult<Span, Span> {
    recognize(preceded(alt((tag("0x"), tag("0X"))), hex_digit1))(inp)
}

pub fn lex_register(inp: Span) -> IResult<Span, Span> {
    preceded(tag("$"), alpha1)(inp)
}

/// Tries each pattern in priority order at the start of `inp`. Whitespace yields `None`.
pub fn lex_token(inp: Span) -> IResult<Span, Option<(TokenKind, Span)>> {
    alt((
        value(None, multispace1),
        map(consumed(lex_operator), |(s, kind)| Some((kind, s))),
        map(lex_hex, |s| Some((TokenKind::Hex, s))),
        map(digit1, |s| Some((TokenKind::Num, s))),
        map(lex_register, |s| Some((TokenKind::Reg, s))),
    ))(inp)
}

/// Lexes `expr` into `out`, replacing its previous contents.
///
/// # Errors
///
/// Fails with [`ExprError::Lex`] at the first position no pattern matches, and when the
/// token or token-length bounds are exceeded.
pub fn lex_expr(expr: &str, out: &mut Vec<Token>) -> Result<(), ExprError> {
    out.clear();
    let mut rest = Span::new(expr);
    while !rest.fragment().is_empty() {
        let offset = rest.location_offset();
        let (next, tok) = lex_token(rest).map_err(|_| ExprError::Lex { offset })?;
        rest = next;
        let Some((kind, span)) = tok else {
            continue;
        };
        log::trace!(
            "matched {:?} at offset {} with len {}: {}",
            kind,
            offset,
            span.fragment().len(),
            span.fragment()
        );
        if span.fragment().len() > MAX_TOKEN_LEN {
            return Err(ExprError::TokenTooLong { offset });
        }
        if out.len() == MAX_TOKENS {
            return Err(ExprError::TooManyTokens);
        }
        out.push(Token::new(kind, span.fragment()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(expr: &str) -> Result<Vec<Token>, ExprError> {
        let mut toks = Vec::new();
        lex_expr(expr, &mut toks).map(|_| toks)
    }

    fn kinds(expr: &str) -> Vec<TokenKind> {
        lex(expr).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_lex_mixed() {
        let toks = lex(" ($eax + 0x1A)*  12 ").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::new(TokenKind::LParen, "("),
                Token::new(TokenKind::Reg, "eax"),
                Token::new(TokenKind::Op(Op::Add), "+"),
                Token::new(TokenKind::Hex, "0x1A"),
                Token::new(TokenKind::RParen, ")"),
                Token::new(TokenKind::Op(Op::Mul), "*"),
                Token::new(TokenKind::Num, "12"),
            ]
        );
    }

    #[test]
    fn test_longest_operator_wins() {
        assert_eq!(
            kinds("1==2!=!3"),
            vec![
                TokenKind::Num,
                TokenKind::Op(Op::Eq),
                TokenKind::Num,
                TokenKind::Op(Op::Ne),
                TokenKind::Op(Op::Not),
                TokenKind::Num,
            ]
        );
        assert_eq!(
            kinds("1&&0||1"),
            vec![
                TokenKind::Num,
                TokenKind::Op(Op::And),
                TokenKind::Num,
                TokenKind::Op(Op::Or),
                TokenKind::Num,
            ]
        );
    }

    #[test]
    fn test_hex_needs_digits() {
        assert_eq!(lex("0x"), Err(ExprError::Lex { offset: 1 }));
        assert_eq!(lex("0XfF").unwrap(), vec![Token::new(TokenKind::Hex, "0XfF")]);
    }

    #[test]
    fn test_lex_failures() {
        assert_eq!(lex("1 & 2"), Err(ExprError::Lex { offset: 2 }));
        assert_eq!(lex("$"), Err(ExprError::Lex { offset: 0 }));
        assert_eq!(lex("eax"), Err(ExprError::Lex { offset: 0 }));
    }

    #[test]
    fn test_capacity() {
        let ok = vec!["1"; 16].join("+");
        assert_eq!(lex(&ok).unwrap().len(), 31);
        let full = vec!["1"; 17].join("+");
        assert_eq!(lex(&full), Err(ExprError::TooManyTokens));
        let long = "9".repeat(MAX_TOKEN_LEN + 1);
        assert_eq!(
            lex(&format!("1+{}", long)),
            Err(ExprError::TokenTooLong { offset: 2 })
        );
    }

    #[test]
    fn test_buffer_is_reset() {
        let mut toks = Vec::new();
        lex_expr("1+2", &mut toks).unwrap();
        lex_expr("7", &mut toks).unwrap();
        assert_eq!(toks, vec![Token::new(TokenKind::Num, "7")]);
    }
}

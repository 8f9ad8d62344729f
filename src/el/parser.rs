//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 条件表达式解析器
//!
//! 语法（优先级从低到高）：
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := "!" unary | compare
//! compare := operand (op operand)?
//! operand := "(" or ")" | literal | variable
//! variable:= "#" ident ("." ident | "[" literal "]")*
//! ```

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{cut, map, map_res, not, opt, peek, recognize, value},
    error::{convert_error, VerboseError},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::Value;

use super::ast::{compile_matches, Accessor, CompareOp, Expr};
use super::EvaluationError;

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// 解析完整表达式（不含外层 `{}`）
pub fn parse_expression(source: &str) -> Result<Expr, EvaluationError> {
    let input = source.trim();
    if input.is_empty() {
        return Err(EvaluationError::Parse("表达式为空".to_string()));
    }

    match ws(or_expr)(input) {
        Ok(("", expr)) => Ok(expr),
        Ok((remaining, _)) => Err(EvaluationError::Parse(format!(
            "unexpected trailing input: {remaining:?}"
        ))),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(EvaluationError::Parse(convert_error(input, e)))
        }
        Err(nom::Err::Incomplete(_)) => Err(EvaluationError::Parse("incomplete input".into())),
    }
}

fn or_expr(input: &str) -> Res<'_, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(alt((tag("||"), keyword("or")))), and_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e))),
    ))
}

fn and_expr(input: &str) -> Res<'_, Expr> {
    let (input, first) = unary_expr(input)?;
    let (input, rest) =
        many0(preceded(ws(alt((tag("&&"), keyword("and")))), unary_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e))),
    ))
}

fn unary_expr(input: &str) -> Res<'_, Expr> {
    alt((
        map(
            preceded(ws(terminated(char('!'), not(char('=')))), unary_expr),
            |e| Expr::Not(Box::new(e)),
        ),
        compare_expr,
    ))(input)
}

fn compare_expr(input: &str) -> Res<'_, Expr> {
    let (input, left) = ws(operand)(input)?;
    let (input, tail) = opt(pair(ws(compare_op), cut(ws(operand))))(input)?;

    let expr = match tail {
        None => left,
        Some((CompareOp::Matches, Expr::Literal(Value::String(pattern)))) => {
            match compile_matches(&pattern) {
                Ok(pattern) => Expr::Matches {
                    left: Box::new(left),
                    pattern,
                },
                Err(_) => {
                    return Err(nom::Err::Failure(VerboseError {
                        errors: vec![(
                            input,
                            nom::error::VerboseErrorKind::Context("invalid regex"),
                        )],
                    }))
                }
            }
        }
        Some((op, right)) => Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
    };

    Ok((input, expr))
}

fn compare_op(input: &str) -> Res<'_, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Matches, keyword("matches")),
        value(CompareOp::Contains, keyword("contains")),
        value(CompareOp::StartsWith, keyword("startsWith")),
        value(CompareOp::EndsWith, keyword("endsWith")),
    ))(input)
}

fn operand(input: &str) -> Res<'_, Expr> {
    alt((
        delimited(char('('), ws(or_expr), char(')')),
        map(literal, Expr::Literal),
        variable,
    ))(input)
}

fn variable(input: &str) -> Res<'_, Expr> {
    let (input, root) = preceded(char('#'), identifier)(input)?;
    let (input, path) = many0(accessor)(input)?;
    Ok((
        input,
        Expr::Variable {
            root: root.to_string(),
            path,
        },
    ))
}

fn accessor(input: &str) -> Res<'_, Accessor> {
    alt((
        map(preceded(char('.'), identifier), |name: &str| {
            Accessor::Field(name.to_string())
        }),
        map(
            delimited(char('['), ws(alt((string_literal, number_literal))), char(']')),
            Accessor::Index,
        ),
    ))(input)
}

fn literal(input: &str) -> Res<'_, Value> {
    alt((
        string_literal,
        number_literal,
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        value(Value::Null, keyword("null")),
    ))(input)
}

/// 单引号或双引号字符串，引号通过重复转义（`'it''s'`）
fn string_literal(input: &str) -> Res<'_, Value> {
    alt((quoted('\''), quoted('"')))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> Res<'a, Value> {
    let doubled: &'static str = if quote == '\'' { "''" } else { "\"\"" };
    let stop: &'static str = if quote == '\'' { "'" } else { "\"" };
    map(
        delimited(
            char(quote),
            many0(alt((value(stop, tag(doubled)), is_not(stop)))),
            char(quote),
        ),
        |parts: Vec<&str>| Value::String(parts.concat()),
    )
}

fn number_literal(input: &str) -> Res<'_, Value> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(tuple((char('.'), cut(digit1)))),
        ))),
        |s: &str| -> Result<Value, String> {
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::from(i));
            }
            let f = s.parse::<f64>().map_err(|e| e.to_string())?;
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| format!("invalid number: {}", s))
        },
    )(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    terminated(tag_no_case(word), not(peek(satisfy(is_identifier_char))))
}

fn identifier(input: &str) -> Res<'_, &str> {
    recognize(pair(
        take_while1(is_identifier_start),
        take_while(is_identifier_char),
    ))(input)
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$')
}

fn ws<'a, F, O>(mut inner: F) -> impl FnMut(&'a str) -> Res<'a, O>
where
    F: FnMut(&'a str) -> Res<'a, O>,
{
    move |input: &'a str| {
        let (input, _) = multispace0(input)?;
        let (input, result) = inner(input)?;
        let (input, _) = multispace0(input)?;
        Ok((input, result))
    }
}

//! Query text parser.
//!
//! ```text
//! Expr    := Or
//! Or      := And ("OR" And)*
//! And     := Not ("AND" Not | Not)*        juxtaposition means AND
//! Not     := "NOT" Not | "(" Expr ")" | Atom
//! Atom    := Token | Key "=" Value | Key "=" "*" | "*" "=" Value
//!          | QuotedString
//! ```
//!
//! Keywords are case-insensitive. Quoted strings become phrase tokens
//! and support backslash escapes.

use anyhow::{format_err, Error};
use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, multispace0},
    combinator::{all_consuming, map},
    sequence::{delimited, preceded},
    IResult,
};

use super::expr::{Expr, Predicate};

/// Characters that terminate a bare word.
fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '=' | '"')
}

fn word(input: &str) -> IResult<&str, &str> {
    take_while1(is_word_char)(input)
}

fn is_keyword(word: &str) -> bool {
    word.eq_ignore_ascii_case("and")
        || word.eq_ignore_ascii_case("or")
        || word.eq_ignore_ascii_case("not")
}

fn fail(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
}

/// A specific keyword, matched as a whole word.
fn keyword<'a>(kw: &'static str) -> impl Fn(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (rest, w) = word(input)?;
        if w.eq_ignore_ascii_case(kw) {
            Ok((rest, w))
        } else {
            Err(fail(input))
        }
    }
}

/// A double-quoted string with backslash escapes.
fn quoted_string(input: &str) -> IResult<&str, String> {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, '"')) => {}
        _ => return Err(fail(input)),
    }

    let mut value = String::new();
    let mut escaped = false;
    for (idx, c) in chars {
        if escaped {
            value.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Ok((&input[idx + 1..], value));
        } else {
            value.push(c);
        }
    }
    Err(fail(input))
}

/// A bare word that is not a keyword.
fn plain_word(input: &str) -> IResult<&str, &str> {
    let (rest, w) = word(input)?;
    if is_keyword(w) {
        return Err(fail(input));
    }
    Ok((rest, w))
}

/// The value side of a `key=value` pair.
fn value(input: &str) -> IResult<&str, String> {
    alt((quoted_string, map(word, |w: &str| w.to_string())))(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    // quoted phrase
    if let Ok((rest, phrase)) = quoted_string(input) {
        return Ok((rest, Expr::Pred(Predicate::Token(phrase))));
    }

    let (rest, w) = plain_word(input)?;

    // key=..., *=... forms
    if let Ok((rest, _)) = char::<_, nom::error::Error<&str>>('=')(rest) {
        if w == "*" {
            let (rest, v) = value(rest)?;
            return Ok((rest, Expr::Pred(Predicate::ValueExists(v))));
        }
        if let Ok((after_star, _)) = char::<_, nom::error::Error<&str>>('*')(rest) {
            // a bare `*` only; `key=*foo` is a literal value
            if after_star.chars().next().map_or(true, |c| !is_word_char(c)) {
                return Ok((after_star, Expr::Pred(Predicate::KeyExists(w.to_string()))));
            }
        }
        let (rest, v) = value(rest)?;
        return Ok((rest, Expr::Pred(Predicate::Kv(w.to_string(), v))));
    }

    if w == "*" {
        return Err(fail(input));
    }

    Ok((rest, Expr::Pred(Predicate::Token(w.to_string()))))
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    let input = multispace0(input)?.0;
    alt((
        map(preceded(keyword("not"), not_expr), |e| {
            Expr::Not(Box::new(e))
        }),
        delimited(
            char('('),
            expr,
            preceded(multispace0, char(')')),
        ),
        atom,
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (mut rest, first) = not_expr(input)?;
    let mut items = vec![first];

    loop {
        let trimmed = multispace0::<_, nom::error::Error<&str>>(rest)?.0;
        // explicit AND
        if let Ok((after, _)) = keyword("and")(trimmed) {
            let (after, item) = not_expr(after)?;
            items.push(item);
            rest = after;
            continue;
        }
        // juxtaposition, unless the next word is an OR
        if keyword("or")(trimmed).is_ok() {
            break;
        }
        match not_expr(trimmed) {
            Ok((after, item)) => {
                items.push(item);
                rest = after;
            }
            Err(_) => break,
        }
    }

    if items.len() == 1 {
        Ok((rest, items.pop().unwrap()))
    } else {
        Ok((rest, Expr::And(items)))
    }
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (mut rest, first) = and_expr(input)?;
    let mut items = vec![first];

    loop {
        let trimmed = multispace0::<_, nom::error::Error<&str>>(rest)?.0;
        match keyword("or")(trimmed) {
            Ok((after, _)) => {
                let (after, item) = and_expr(after)?;
                items.push(item);
                rest = after;
            }
            Err(_) => break,
        }
    }

    if items.len() == 1 {
        Ok((rest, items.pop().unwrap()))
    } else {
        Ok((rest, Expr::Or(items)))
    }
}

/// Parse a query expression. Empty input is an error; callers express
/// "no filter" with `Query { expr: None, .. }`.
pub fn parse_query(input: &str) -> Result<Expr, Error> {
    match all_consuming(delimited(multispace0, expr, multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(err) => Err(format_err!("unable to parse query {:?} - {}", input, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(t: &str) -> Expr {
        Expr::Pred(Predicate::Token(t.to_string()))
    }

    #[test]
    fn parses_single_token() {
        assert_eq!(parse_query("error").unwrap(), token("error"));
    }

    #[test]
    fn juxtaposition_is_and() {
        assert_eq!(
            parse_query("error timeout").unwrap(),
            Expr::And(vec![token("error"), token("timeout")])
        );
        assert_eq!(
            parse_query("error AND timeout").unwrap(),
            parse_query("error timeout").unwrap()
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            parse_query("a or b").unwrap(),
            parse_query("a OR b").unwrap()
        );
        assert_eq!(
            parse_query("not a").unwrap(),
            parse_query("NOT a").unwrap()
        );
    }

    #[test]
    fn precedence_and_parens() {
        // OR binds weaker than AND
        assert_eq!(
            parse_query("a b OR c").unwrap(),
            Expr::Or(vec![Expr::And(vec![token("a"), token("b")]), token("c")])
        );
        assert_eq!(
            parse_query("(error OR warn) AND NOT debug").unwrap(),
            Expr::And(vec![
                Expr::Or(vec![token("error"), token("warn")]),
                Expr::Not(Box::new(token("debug"))),
            ])
        );
    }

    #[test]
    fn kv_forms() {
        assert_eq!(
            parse_query("service=api").unwrap(),
            Expr::Pred(Predicate::Kv("service".to_string(), "api".to_string()))
        );
        assert_eq!(
            parse_query("service=*").unwrap(),
            Expr::Pred(Predicate::KeyExists("service".to_string()))
        );
        assert_eq!(
            parse_query("*=api").unwrap(),
            Expr::Pred(Predicate::ValueExists("api".to_string()))
        );
        assert_eq!(
            parse_query("msg=\"hello world\"").unwrap(),
            Expr::Pred(Predicate::Kv("msg".to_string(), "hello world".to_string()))
        );
    }

    #[test]
    fn quoted_phrase_is_a_token() {
        assert_eq!(
            parse_query("\"connection reset\"").unwrap(),
            token("connection reset")
        );
        assert_eq!(
            parse_query(r#""say \"hi\"""#).unwrap(),
            token("say \"hi\"")
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_query("").is_err());
        assert!(parse_query("(unbalanced").is_err());
        assert!(parse_query("a )").is_err());
        assert!(parse_query("\"unterminated").is_err());
    }

    #[test]
    fn nested_not() {
        assert_eq!(
            parse_query("NOT NOT a").unwrap(),
            Expr::Not(Box::new(Expr::Not(Box::new(token("a")))))
        );
    }
}

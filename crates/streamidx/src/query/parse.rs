//! Query parsing.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::{CmpOp, Condition, Query, Side, Term};
use crate::stream::Direction;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated quote in query")]
    UnterminatedQuote,
    #[error("term {0:?} is missing a ':'")]
    MissingColon(String),
    #[error("unknown filter key {0:?}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    BadValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0} cannot be negated or used in a subquery")]
    BadModifier(String),
}

fn bad(key: &str, value: &str, reason: impl Into<String>) -> ParseError {
    ParseError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

pub fn parse(input: &str) -> Result<Query, ParseError> {
    let mut query = Query::default();
    for token in tokenize(input)? {
        parse_term(&token, &mut query)?;
    }
    Ok(query)
}

/// Splits on whitespace while keeping quoted sections (with `\"` and `\\`
/// escapes) inside a single token.
fn tokenize(input: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '\\' if in_quotes => {
                current.push(ch);
                match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err(ParseError::UnterminatedQuote),
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(ParseError::UnterminatedQuote);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn parse_term(token: &str, query: &mut Query) -> Result<(), ParseError> {
    let mut rest = token;
    let negated = rest.starts_with('-');
    if negated {
        rest = &rest[1..];
    }
    let subquery = rest.starts_with('@');
    if subquery {
        rest = &rest[1..];
    }

    let Some((key, raw_value)) = rest.split_once(':') else {
        return Err(ParseError::MissingColon(token.to_string()));
    };
    let value = unquote(raw_value);

    // Structural keys are not filter terms and take no modifiers.
    match key {
        "group" | "limit" | "sort" => {
            if negated || subquery {
                return Err(ParseError::BadModifier(key.to_string()));
            }
            match key {
                "group" => query.grouping = Some(value),
                "limit" => {
                    let n = value.parse().map_err(|_| bad(key, &value, "not a number"))?;
                    query.limit = Some(n);
                }
                _ => {
                    if value != "id" {
                        return Err(bad(key, &value, "only id sorting is supported"));
                    }
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let term = match key {
        "id" => parse_ids(key, &value)?,
        "data" => parse_data(None, None, &value)?,
        "cdata" => parse_data(Some(Direction::ClientToServer), None, &value)?,
        "sdata" => parse_data(Some(Direction::ServerToClient), None, &value)?,
        _ if key.starts_with("data.") => {
            let converter = &key["data.".len()..];
            if converter.is_empty() {
                return Err(ParseError::UnknownKey(key.to_string()));
            }
            parse_data(None, Some(converter.to_string()), &value)?
        }
        "time" => parse_time(key, &value)?,
        "chost" => Term::Host {
            side: Side::Client,
            value,
        },
        "shost" => Term::Host {
            side: Side::Server,
            value,
        },
        "cport" => Term::Port {
            side: Side::Client,
            value: value.parse().map_err(|_| bad(key, &value, "not a port"))?,
        },
        "sport" => Term::Port {
            side: Side::Server,
            value: value.parse().map_err(|_| bad(key, &value, "not a port"))?,
        },
        "protocol" => Term::Protocol(value),
        "tag" | "service" | "mark" | "generated" => {
            if value.is_empty() {
                return Err(bad(key, &value, "empty tag name"));
            }
            Term::Tag(format!("{key}/{value}"))
        }
        _ => return Err(ParseError::UnknownKey(key.to_string())),
    };

    query.conditions.0.push(Condition {
        negated,
        subquery,
        term,
    });
    Ok(())
}

fn parse_ids(key: &str, value: &str) -> Result<Term, ParseError> {
    if value == "-1" {
        return Ok(Term::Ids(Vec::new()));
    }
    let mut ids = Vec::new();
    for part in value.split(',') {
        let id = part
            .trim()
            .parse()
            .map_err(|_| bad(key, value, format!("bad id {part:?}")))?;
        ids.push(id);
    }
    Ok(Term::Ids(ids))
}

fn parse_data(
    direction: Option<Direction>,
    converter: Option<String>,
    value: &str,
) -> Result<Term, ParseError> {
    // Validate at parse time so tag definitions fail fast; the evaluator
    // compiles again.
    regex::bytes::Regex::new(value).map_err(|e| bad("data", value, e.to_string()))?;
    Ok(Term::Data {
        direction,
        converter,
        pattern: value.to_string(),
    })
}

fn parse_time(key: &str, value: &str) -> Result<Term, ParseError> {
    let (op, rest) = match value.as_bytes().first() {
        Some(b'>') => (CmpOp::After, &value[1..]),
        Some(b'<') => (CmpOp::Before, &value[1..]),
        _ => return Err(bad(key, value, "expected '<' or '>'")),
    };
    if rest.starts_with('-') || rest.starts_with('+') {
        let offset = parse_offset(rest).ok_or_else(|| bad(key, value, "bad offset"))?;
        return Ok(Term::TimeRelative { op, offset });
    }
    let at = DateTime::parse_from_rfc3339(rest)
        .map_err(|e| bad(key, value, e.to_string()))?
        .with_timezone(&Utc);
    Ok(Term::TimeAbsolute { op, at })
}

/// Parses `+5m` / `-30s` / `+2h` style offsets.
fn parse_offset(s: &str) -> Option<Duration> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'-' => (-1i64, &s[1..]),
        b'+' => (1i64, &s[1..]),
        _ => return None,
    };
    let unit = rest.as_bytes().last()?;
    let amount: i64 = rest[..rest.len() - 1].parse().ok()?;
    let seconds = match unit {
        b's' => amount,
        b'm' => amount * 60,
        b'h' => amount * 3600,
        _ => return None,
    };
    Some(Duration::seconds(sign * seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_data_with_spaces() {
        let q = parse("data:\"GET / HTTP\"").unwrap();
        assert_eq!(q.conditions.0.len(), 1);
        match &q.conditions.0[0].term {
            Term::Data { pattern, direction, converter } => {
                assert_eq!(pattern, "GET / HTTP");
                assert!(direction.is_none());
                assert!(converter.is_none());
            }
            other => panic!("unexpected term {other:?}"),
        }
    }

    #[test]
    fn parses_converter_qualified_data() {
        let q = parse("data.websockets:\"ping\"").unwrap();
        match &q.conditions.0[0].term {
            Term::Data { converter, .. } => assert_eq!(converter.as_deref(), Some("websockets")),
            other => panic!("unexpected term {other:?}"),
        }
    }

    #[test]
    fn parses_modifiers() {
        let q = parse("-cdata:\"x\" @service:http").unwrap();
        assert!(q.conditions.0[0].negated);
        assert!(!q.conditions.0[0].subquery);
        assert!(q.conditions.0[1].subquery);
        assert_eq!(q.conditions.0[1].term, Term::Tag("service/http".into()));
    }

    #[test]
    fn parses_times() {
        match parse("time:>2024-05-01T12:00:00Z").unwrap().conditions.0[0].term {
            Term::TimeAbsolute { op, .. } => assert_eq!(op, CmpOp::After),
            ref other => panic!("unexpected term {other:?}"),
        }
        match parse("time:<-5m").unwrap().conditions.0[0].term {
            Term::TimeRelative { op, offset } => {
                assert_eq!(op, CmpOp::Before);
                assert_eq!(offset, Duration::seconds(-300));
            }
            ref other => panic!("unexpected term {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(parse("data:\"x"), Err(ParseError::UnterminatedQuote)));
        assert!(matches!(parse("justaword"), Err(ParseError::MissingColon(_))));
        assert!(matches!(parse("frobnicate:1"), Err(ParseError::UnknownKey(_))));
        assert!(matches!(parse("id:abc"), Err(ParseError::BadValue { .. })));
        assert!(matches!(parse("-group:chost"), Err(ParseError::BadModifier(_))));
        assert!(matches!(parse("data:\"[unclosed\""), Err(ParseError::BadValue { .. })));
    }

    #[test]
    fn empty_query_is_valid() {
        let q = parse("   ").unwrap();
        assert!(q.conditions.0.is_empty());
    }
}

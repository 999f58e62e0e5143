//! The two template grammars that normalize into [`Segment`]s.
//!
//! The structured dialect uses curly braces (`{VAR}`, `{R:1}`, `{C:2}`,
//! `{ToLower:{R:1}}`, `{map:{R:1}}`), the directive dialect uses the
//! percent/dollar forms (`%{VAR}`, `$1`, `%2`). Both end up in the same
//! segment model so the evaluator never knows which dialect authored a
//! pattern.

use super::{Pattern, Segment};
use crate::context::is_known_variable;
use crate::error::ParseError;
use crate::maps::RewriteMaps;

/// Parse a curly-brace template, validating variable and map names.
pub(crate) fn parse_braces(input: &str, maps: &RewriteMaps) -> Result<Pattern, ParseError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = input.char_indices();

    while let Some((start, c)) = chars.next() {
        match c {
            '{' => {
                let inner = balanced(input, start)?;
                // skip over the consumed group, including both braces
                for _ in 0..inner.chars().count() + 1 {
                    chars.next();
                }
                flush(&mut literal, &mut segments);
                segments.push(group(inner, maps)?);
            }
            '}' => {
                return Err(ParseError::new(format!(
                    "unbalanced '}}' in pattern '{input}'"
                )));
            }
            c => literal.push(c),
        }
    }
    flush(&mut literal, &mut segments);
    Ok(Pattern::from_segments(segments))
}

/// Parse a percent/dollar template, validating variable names.
pub(crate) fn parse_directive(input: &str) -> Result<Pattern, ParseError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => literal.push(chars.next().unwrap_or('\\')),
            '$' => match chars.peek().and_then(|c| c.to_digit(10)) {
                Some(n) => {
                    chars.next();
                    flush(&mut literal, &mut segments);
                    segments.push(Segment::RuleBackRef(n as usize));
                }
                None => literal.push('$'),
            },
            '%' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(ParseError::new(format!(
                            "unterminated variable reference in pattern '{input}'"
                        )));
                    }
                    if !is_known_variable(&name) {
                        return Err(ParseError::new(format!(
                            "unrecognized server variable '{name}'"
                        )));
                    }
                    flush(&mut literal, &mut segments);
                    segments.push(Segment::ServerVariable(name));
                }
                Some(d) if d.is_ascii_digit() => {
                    let n = chars.next().and_then(|c| c.to_digit(10)).unwrap_or(0);
                    flush(&mut literal, &mut segments);
                    segments.push(Segment::ConditionBackRef(n as usize));
                }
                _ => literal.push('%'),
            },
            c => literal.push(c),
        }
    }
    flush(&mut literal, &mut segments);
    Ok(Pattern::from_segments(segments))
}

fn flush(literal: &mut String, segments: &mut Vec<Segment>) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

/// Extract the content of the brace group opening at `start`.
fn balanced(input: &str, start: usize) -> Result<&str, ParseError> {
    let mut depth = 0usize;
    for (i, c) in input[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&input[start + 1..start + i]);
                }
            }
            _ => {}
        }
    }
    Err(ParseError::new(format!(
        "unbalanced '{{' in pattern '{input}'"
    )))
}

/// Interpret the content of one `{...}` group.
fn group(content: &str, maps: &RewriteMaps) -> Result<Segment, ParseError> {
    let colon = top_level_colon(content);
    let Some(colon) = colon else {
        if is_known_variable(content) {
            return Ok(Segment::ServerVariable(content.to_owned()));
        }
        return Err(ParseError::new(format!(
            "unrecognized server variable '{content}'"
        )));
    };

    let (head, tail) = (&content[..colon], &content[colon + 1..]);
    match head {
        "R" | "C" => {
            let index: usize = tail.parse().map_err(|_| {
                ParseError::new(format!("invalid back-reference index '{tail}'"))
            })?;
            match head {
                "R" => Ok(Segment::RuleBackRef(index)),
                _ => Ok(Segment::ConditionBackRef(index)),
            }
        }
        "ToLower" | "ToUpper" => Ok(Segment::CaseConvert {
            inner: parse_braces(tail, maps)?,
            lower: head == "ToLower",
        }),
        "UrlEncode" => Ok(Segment::UrlEncode(parse_braces(tail, maps)?)),
        map if maps.contains(map) => Ok(Segment::MapLookup {
            map: map.to_owned(),
            key: parse_braces(tail, maps)?,
        }),
        other => Err(ParseError::new(format!(
            "unknown rewrite map or function '{other}'"
        ))),
    }
}

/// First `:` outside any nested brace group, if any.
fn top_level_colon(content: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in content.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_braces_variables_and_refs() {
        let maps = RewriteMaps::default();
        let pattern = parse_braces("article.aspx?id={R:1}&host={HTTP_HOST}", &maps).unwrap();
        assert_eq!(
            pattern,
            Pattern::from_segments(vec![
                Segment::Literal("article.aspx?id=".into()),
                Segment::RuleBackRef(1),
                Segment::Literal("&host=".into()),
                Segment::ServerVariable("HTTP_HOST".into()),
            ])
        );
    }

    #[test]
    fn test_braces_nested() {
        let mut maps = RewriteMaps::default();
        maps.insert("apiMap", Default::default());
        let pattern = parse_braces("{ToLower:{apiMap:{C:1}}}", &maps).unwrap();
        assert_eq!(
            pattern,
            Pattern::from_segments(vec![Segment::CaseConvert {
                inner: Pattern::from_segments(vec![Segment::MapLookup {
                    map: "apiMap".into(),
                    key: Pattern::from_segments(vec![Segment::ConditionBackRef(1)]),
                }]),
                lower: true,
            }])
        );
    }

    #[test]
    fn test_braces_rejects_unknown_names() {
        let maps = RewriteMaps::default();
        let err = parse_braces("{SERVER_SOFTWARE}", &maps).unwrap_err();
        assert!(err.message.contains("unrecognized server variable"));

        let err = parse_braces("{missingMap:{R:1}}", &maps).unwrap_err();
        assert!(err.message.contains("unknown rewrite map"));

        assert!(parse_braces("{R:1", &maps).is_err());
        assert!(parse_braces("}x", &maps).is_err());
    }

    #[test]
    fn test_directive_refs() {
        let pattern = parse_directive("/new/$1?from=%2&host=%{HTTP_HOST}").unwrap();
        assert_eq!(
            pattern,
            Pattern::from_segments(vec![
                Segment::Literal("/new/".into()),
                Segment::RuleBackRef(1),
                Segment::Literal("?from=".into()),
                Segment::ConditionBackRef(2),
                Segment::Literal("&host=".into()),
                Segment::ServerVariable("HTTP_HOST".into()),
            ])
        );
    }

    #[test]
    fn test_directive_escapes_and_plain_symbols() {
        let pattern = parse_directive(r"/price\$1/100%").unwrap();
        assert_eq!(
            pattern,
            Pattern::from_segments(vec![Segment::Literal("/price$1/100%".into())])
        );
    }

    #[test]
    fn test_directive_rejects_unknown_variable() {
        let err = parse_directive("%{NOT_A_VAR}").unwrap_err();
        assert!(err.message.contains("unrecognized server variable"));
    }
}

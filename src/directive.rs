//! Line-oriented `mod_rewrite`-style rule text, the directive front end.
//!
//! Supports the classic trio:
//!
//! ```text
//! RewriteEngine on
//! RewriteCond %{QUERY_STRING} legacy=1      [NC]
//! RewriteRule ^old/(.*)$      /new/$1       [R=301,L]
//! ```
//!
//! `RewriteCond` lines attach to the next `RewriteRule`; `RewriteEngine`
//! toggles the enabled flag of every rule that follows it. Everything
//! compiles into the same rule model as the structured dialect.

use std::str::FromStr;

use super::condition::{Condition, ConditionSet, LogicalGrouping};
use super::error::{ParseError, ParseErrors};
use super::matcher::{EngineOptions, MatchPrimitive};
use super::pattern::{parse_directive, Pattern};
use super::rule::{Action, Rule};
use super::RuleSet;

/// Parse directive text into a [`RuleSet`], collecting every diagnostic.
pub(crate) fn load(text: &str, options: EngineOptions) -> Result<RuleSet, ParseErrors> {
    let mut rules = RuleSet::default();
    let mut errors: Vec<ParseError> = Vec::new();
    let mut pending: Vec<Condition> = Vec::new();
    let mut enabled = true;
    let mut count = 0usize;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let result = parse_line(line, &mut pending, &mut enabled, &mut count, options);
        match result {
            Ok(Some(mut rule)) => {
                rule.enabled = enabled;
                rules.add(rule);
            }
            Ok(None) => {}
            Err(mut err) => {
                err.line = line_no;
                err.column = 1;
                errors.push(err);
            }
        }
    }
    if !pending.is_empty() {
        errors.push(ParseError::new(
            "RewriteCond without a following RewriteRule",
        ));
    }
    match errors.is_empty() {
        true => Ok(rules),
        false => Err(ParseErrors(errors)),
    }
}

fn parse_line(
    line: &str,
    pending: &mut Vec<Condition>,
    enabled: &mut bool,
    count: &mut usize,
    options: EngineOptions,
) -> Result<Option<Rule>, ParseError> {
    let (ident, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| ParseError::new("missing directive arguments"))?;
    match ident.to_lowercase().as_str() {
        "rewriteengine" | "engine" => {
            *enabled = match rest.trim().to_lowercase().as_str() {
                "on" => true,
                "off" => false,
                other => {
                    return Err(ParseError::new(format!(
                        "invalid RewriteEngine state '{other}'"
                    )));
                }
            };
            Ok(None)
        }
        "rewritecond" | "cond" => {
            pending.push(parse_condition(rest, options)?);
            Ok(None)
        }
        "rewriterule" | "rule" | "rewrite" => {
            *count += 1;
            let mut rule = parse_rule(rest, *count, options)?;
            if !pending.is_empty() {
                rule.conditions = Some(ConditionSet::new(
                    LogicalGrouping::MatchAll,
                    false,
                    std::mem::take(pending),
                ));
            }
            Ok(Some(rule))
        }
        _ => Err(ParseError::new(format!("invalid directive '{ident}'"))),
    }
}

fn parse_condition(rest: &str, options: EngineOptions) -> Result<Condition, ParseError> {
    let mut tokens = tokenize(rest)?.into_iter();
    let input = tokens
        .next()
        .ok_or_else(|| ParseError::new("RewriteCond is missing an input"))?;
    let pattern = tokens
        .next()
        .ok_or_else(|| ParseError::new("RewriteCond is missing a pattern"))?;
    let flags = match tokens.next() {
        Some(flags) => CondFlagList::from_str(&flags)?.0,
        None => Vec::new(),
    };
    if let Some(extra) = tokens.next() {
        return Err(ParseError::new(format!(
            "unexpected token '{extra}' after RewriteCond flags"
        )));
    }

    let nocase = flags.iter().any(|f| matches!(f, CondFlag::NoCase));
    let or_next = flags.iter().any(|f| matches!(f, CondFlag::Or));

    let negate = pattern.starts_with('!');
    let pattern = pattern.trim_start_matches('!');
    let matcher = match pattern {
        "-f" => MatchPrimitive::IsFile { negate },
        "-d" => MatchPrimitive::IsDirectory { negate },
        p if p.starts_with('=') => MatchPrimitive::exact(&p[1..], nocase, negate),
        p => MatchPrimitive::regex(p, nocase, negate, options)?,
    };
    Ok(Condition {
        input: parse_directive(&input)?,
        matcher,
        or_next,
    })
}

fn parse_rule(rest: &str, count: usize, options: EngineOptions) -> Result<Rule, ParseError> {
    let mut tokens = tokenize(rest)?.into_iter();
    let pattern = tokens
        .next()
        .ok_or_else(|| ParseError::new("RewriteRule is missing a pattern"))?;
    let substitution = tokens
        .next()
        .ok_or_else(|| ParseError::new("RewriteRule is missing a substitution"))?;
    let flags = match tokens.next() {
        Some(flags) => RuleFlagList::from_str(&flags)?.0,
        None => Vec::new(),
    };
    if let Some(extra) = tokens.next() {
        return Err(ParseError::new(format!(
            "unexpected token '{extra}' after RewriteRule flags"
        )));
    }

    let nocase = flags.iter().any(|f| matches!(f, RuleFlag::NoCase));
    let noescape = flags.iter().any(|f| matches!(f, RuleFlag::NoEscape));
    let stop = flags
        .iter()
        .any(|f| matches!(f, RuleFlag::Last | RuleFlag::End));
    let qsa = flags.iter().any(|f| matches!(f, RuleFlag::QueryAppend));
    let qsd = flags.iter().any(|f| matches!(f, RuleFlag::QueryDiscard));

    let negate = pattern.starts_with('!');
    let initial_match =
        MatchPrimitive::regex(pattern.trim_start_matches('!'), nocase, negate, options)?;

    let target = |escape: bool| -> Result<Pattern, ParseError> {
        if substitution == "-" {
            return Err(ParseError::new(
                "substitution '-' cannot be combined with a redirect",
            ));
        }
        let pattern = parse_directive(&substitution)?;
        Ok(match escape {
            true => pattern.escape_back_references(),
            false => pattern,
        })
    };
    // substitutions without an own query string keep the original one
    let append_query = qsa || !substitution.contains('?');

    let redirect = flags.iter().find_map(|f| match f {
        RuleFlag::Redirect(status) => Some(*status),
        _ => None,
    });
    let response = flags.iter().find_map(|f| match f {
        RuleFlag::Status(status, reason) => Some((*status, *reason)),
        _ => None,
    });

    // redirect targets leave the server, so back-references are escaped
    // unless NE says otherwise; internal rewrites take the substitution raw
    let action = if let Some(status) = redirect {
        Action::Redirect {
            pattern: target(!noescape)?,
            status,
            append_query,
            delete_query: qsd,
        }
    } else if let Some((status, reason)) = response {
        Action::CustomResponse {
            status,
            reason: Some(reason.to_owned()),
            body: None,
        }
    } else if substitution == "-" {
        Action::None
    } else {
        Action::Rewrite {
            pattern: target(false)?,
            append_query,
            delete_query: qsd,
        }
    };

    Ok(Rule::new(format!("rule:{count}"), initial_match, action).stop_processing(stop))
}

/// Quote-aware whitespace tokenizer for directive arguments.
fn tokenize(s: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    current.push(c);
                }
                if !closed {
                    return Err(ParseError::new("quotation never closed in expression"));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

#[derive(Clone, Copy, Debug)]
enum CondFlag {
    NoCase,
    Or,
}

struct CondFlagList(Vec<CondFlag>);

impl FromStr for CondFlagList {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_flags(s)?
            .into_iter()
            .map(|flag| match flag.to_lowercase().as_str() {
                "i" | "insensitive" | "nc" | "nocase" => Ok(CondFlag::NoCase),
                "or" | "ornext" => Ok(CondFlag::Or),
                _ => Err(ParseError::new(format!("invalid condition flag '{flag}'"))),
            })
            .collect::<Result<Vec<_>, _>>()?))
    }
}

#[derive(Clone, Copy, Debug)]
enum RuleFlag {
    NoCase,
    NoEscape,
    Last,
    End,
    QueryAppend,
    QueryDiscard,
    Redirect(u16),
    Status(u16, &'static str),
}

struct RuleFlagList(Vec<RuleFlag>);

impl FromStr for RuleFlagList {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let flags = parse_flags(s)?
            .into_iter()
            .map(|flag| {
                let (prefix, suffix) = match flag.split_once('=') {
                    Some((prefix, suffix)) => (prefix.to_owned(), suffix.to_owned()),
                    None => (flag, String::new()),
                };
                match prefix.to_lowercase().as_str() {
                    "end" => Ok(RuleFlag::End),
                    "l" | "last" => Ok(RuleFlag::Last),
                    "i" | "insensitive" | "nc" | "nocase" => Ok(RuleFlag::NoCase),
                    "ne" | "noescape" => Ok(RuleFlag::NoEscape),
                    "qsa" | "qsappend" => Ok(RuleFlag::QueryAppend),
                    "qsd" | "qsdiscard" => Ok(RuleFlag::QueryDiscard),
                    "r" | "redirect" => Ok(RuleFlag::Redirect(parse_status(&suffix, 302)?)),
                    "f" | "forbidden" => Ok(RuleFlag::Status(403, "Forbidden")),
                    "g" | "gone" => Ok(RuleFlag::Status(410, "Gone")),
                    _ => Err(ParseError::new(format!("invalid rule flag '{prefix}'"))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let resolves = flags
            .iter()
            .filter(|f| matches!(f, RuleFlag::Redirect(_) | RuleFlag::Status(..)))
            .count();
        if resolves > 1 {
            return Err(ParseError::new("rule flags used are mutually exclusive"));
        }
        Ok(Self(flags))
    }
}

fn parse_flags(s: &str) -> Result<Vec<String>, ParseError> {
    if !s.starts_with('[') || !s.ends_with(']') {
        return Err(ParseError::new(format!(
            "flag definitions missing brackets: '{s}'"
        )));
    }
    let flags: Vec<String> = s[1..s.len() - 1]
        .split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();
    match flags.is_empty() {
        true => Err(ParseError::new("flag definitions are empty")),
        false => Ok(flags),
    }
}

fn parse_status(s: &str, default: u16) -> Result<u16, ParseError> {
    if s.is_empty() {
        return Ok(default);
    }
    let status: u16 = s
        .parse()
        .map_err(|_| ParseError::new(format!("invalid status code '{s}'")))?;
    match (100..600).contains(&status) {
        true => Ok(status),
        false => Err(ParseError::new(format!("invalid status code '{s}'"))),
    }
}

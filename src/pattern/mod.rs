//! Template patterns that expand into runtime strings.
//!
//! Both rule dialects parse their substitution and condition-input syntax
//! into the same flat [`Segment`] model, so evaluation is dialect-agnostic:
//! a pattern is a straight-line template evaluated left to right with no
//! branching and no shared mutable state.

mod parse;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use super::context::RewriteContext;
use super::error::EvalError;
use super::maps::RewriteMaps;

pub(crate) use parse::{parse_braces, parse_directive};

// https://url.spec.whatwg.org/#percent-encoded-bytes
const ESCAPE: &AsciiSet = &CONTROLS
    .add(b'~')
    .add(b' ') // fragment encoding
    .add(b'\'')
    .add(b'"')
    .add(b'`')
    .add(b'#') // query encoding
    .add(b'<')
    .add(b'>')
    .add(b'?') // path encoding
    .add(b'^')
    .add(b'{')
    .add(b'}')
    .add(b'/') // user-info encoding
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'$') // component encoding
    .add(b'&')
    .add(b'+')
    .add(b',');

pub(crate) fn url_escape(s: &str) -> String {
    utf8_percent_encode(s, ESCAPE).to_string()
}

/// Captured strings from one successful match, addressable by position.
///
/// Index 0 is the whole matched text. Rule-match and condition-match sets
/// are kept independent during a rule evaluation; under track-all-captures
/// mode the condition set grows by concatenation across conditions.
#[derive(Clone, Debug, Default)]
pub struct BackReferences(Vec<String>);

impl BackReferences {
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace the set with the given captures.
    pub fn assign(&mut self, captures: Vec<String>) {
        self.0 = captures;
    }

    /// Append captures, preserving everything gathered so far.
    pub fn extend(&mut self, captures: Vec<String>) {
        self.0.extend(captures);
    }
}

impl From<Vec<String>> for BackReferences {
    fn from(captures: Vec<String>) -> Self {
        Self(captures)
    }
}

/// One template piece.
#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Literal(String),
    ServerVariable(String),
    RuleBackRef(usize),
    ConditionBackRef(usize),
    MapLookup { map: String, key: Pattern },
    CaseConvert { inner: Pattern, lower: bool },
    UrlEncode(Pattern),
}

/// Ordered sequence of segments, evaluated by concatenation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    pub(crate) fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Pattern holding a single literal.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Literal(text.into())],
        }
    }

    /// True when no segment expands dynamically.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Wrap every back-reference segment in a [`Segment::UrlEncode`].
    ///
    /// Used by actions whose substitution escapes captured values while
    /// leaving the authored literal text untouched.
    pub(crate) fn escape_back_references(self) -> Self {
        let segments = self
            .segments
            .into_iter()
            .map(|segment| match segment {
                s @ (Segment::RuleBackRef(_) | Segment::ConditionBackRef(_)) => {
                    Segment::UrlEncode(Pattern::from_segments(vec![s]))
                }
                Segment::CaseConvert { inner, lower } => Segment::CaseConvert {
                    inner: inner.escape_back_references(),
                    lower,
                },
                other => other,
            })
            .collect();
        Self { segments }
    }

    /// Expand the template into its runtime string.
    ///
    /// Out-of-range back-references and missing map keys are fatal: they
    /// signal a defect in the authored rules and must not be silently
    /// replaced with empty text.
    pub fn evaluate(
        &self,
        ctx: &RewriteContext<'_>,
        rule_refs: &BackReferences,
        cond_refs: &BackReferences,
        maps: &RewriteMaps,
    ) -> Result<String, EvalError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::ServerVariable(name) => out.push_str(&ctx.server_variable(name)),
                Segment::RuleBackRef(index) => {
                    let value =
                        rule_refs
                            .get(*index)
                            .ok_or_else(|| EvalError::RuleBackRefOutOfRange {
                                index: *index,
                                count: rule_refs.len(),
                            })?;
                    out.push_str(value);
                }
                Segment::ConditionBackRef(index) => {
                    let value =
                        cond_refs
                            .get(*index)
                            .ok_or_else(|| EvalError::ConditionBackRefOutOfRange {
                                index: *index,
                                count: cond_refs.len(),
                            })?;
                    out.push_str(value);
                }
                Segment::MapLookup { map, key } => {
                    let key = key.evaluate(ctx, rule_refs, cond_refs, maps)?;
                    let value = maps
                        .get(map)
                        .and_then(|m| m.get(&key))
                        .ok_or_else(|| EvalError::MapKeyMissing {
                            map: map.clone(),
                            key: key.clone(),
                        })?;
                    out.push_str(value);
                }
                Segment::CaseConvert { inner, lower } => {
                    let value = inner.evaluate(ctx, rule_refs, cond_refs, maps)?;
                    match lower {
                        true => out.push_str(&value.to_lowercase()),
                        false => out.push_str(&value.to_uppercase()),
                    }
                }
                Segment::UrlEncode(inner) => {
                    let value = inner.evaluate(ctx, rule_refs, cond_refs, maps)?;
                    out.push_str(&url_escape(&value));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::RewriteMap;

    fn ctx() -> RewriteContext<'static> {
        RewriteContext::new("http", "example.com", "/article/10/hey", "p=1")
    }

    fn refs(values: &[&str]) -> BackReferences {
        BackReferences::from(values.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_literal_only() {
        let pattern = Pattern::literal("/static/index.html");
        let out = pattern
            .evaluate(&ctx(), &refs(&["a", "b"]), &refs(&[]), &RewriteMaps::default())
            .unwrap();
        assert_eq!(out, "/static/index.html");
    }

    #[test]
    fn test_back_references() {
        let pattern = Pattern::from_segments(vec![
            Segment::Literal("article.aspx?id=".into()),
            Segment::RuleBackRef(1),
            Segment::Literal("&title=".into()),
            Segment::RuleBackRef(2),
        ]);
        let rule_refs = refs(&["article/10/hey", "10", "hey"]);
        let out = pattern
            .evaluate(&ctx(), &rule_refs, &refs(&[]), &RewriteMaps::default())
            .unwrap();
        assert_eq!(out, "article.aspx?id=10&title=hey");
    }

    #[test]
    fn test_out_of_range_is_fatal() {
        let pattern = Pattern::from_segments(vec![Segment::ConditionBackRef(9)]);
        let err = pattern
            .evaluate(&ctx(), &refs(&[]), &refs(&["a", "b", "c", "d", "e"]), &RewriteMaps::default())
            .unwrap_err();
        assert_eq!(err, EvalError::ConditionBackRefOutOfRange { index: 9, count: 5 });
        let message = err.to_string();
        assert!(message.contains("{C:9}"), "{message}");
        assert!(message.contains('5'), "{message}");
    }

    #[test]
    fn test_map_lookup() {
        let mut maps = RewriteMaps::default();
        let map: RewriteMap = [("diagnostics", "/status/detail")].into_iter().collect();
        maps.insert("apiMap", map);

        let pattern = Pattern::from_segments(vec![Segment::MapLookup {
            map: "apiMap".into(),
            key: Pattern::from_segments(vec![Segment::RuleBackRef(1)]),
        }]);
        let out = pattern
            .evaluate(&ctx(), &refs(&["x", "DIAGNOSTICS"]), &refs(&[]), &maps)
            .unwrap();
        assert_eq!(out, "/status/detail");

        let err = pattern
            .evaluate(&ctx(), &refs(&["x", "unknown"]), &refs(&[]), &maps)
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::MapKeyMissing {
                map: "apiMap".into(),
                key: "unknown".into()
            }
        );
    }

    #[test]
    fn test_case_convert_and_encode() {
        let pattern = Pattern::from_segments(vec![
            Segment::CaseConvert {
                inner: Pattern::from_segments(vec![Segment::RuleBackRef(1)]),
                lower: true,
            },
            Segment::Literal("/".into()),
            Segment::UrlEncode(Pattern::from_segments(vec![Segment::RuleBackRef(2)])),
        ]);
        let out = pattern
            .evaluate(&ctx(), &refs(&["m", "HElLo", "a/b c"]), &refs(&[]), &RewriteMaps::default())
            .unwrap();
        assert_eq!(out, "hello/a%2Fb%20c");
    }

    #[test]
    fn test_escape_back_references_keeps_literals() {
        let pattern = Pattern::from_segments(vec![
            Segment::Literal("/index?page=".into()),
            Segment::RuleBackRef(1),
        ])
        .escape_back_references();
        let out = pattern
            .evaluate(&ctx(), &refs(&["m", "1/2/3"]), &refs(&[]), &RewriteMaps::default())
            .unwrap();
        assert_eq!(out, "/index?page=1%2F2%2F3");
    }
}

//! Structured rule documents, the IIS-style front end.
//!
//! The document mirrors the classic `rewrite/rules/rule` layout with its
//! attribute spellings intact, expressed as TOML and deserialized through
//! serde:
//!
//! ```toml
//! [[rewrite.rules]]
//! name = "redirect blog posts"
//! stopProcessing = true
//!
//! [rewrite.rules.match]
//! url = "^article/([0-9]+)/([_0-9a-z-]+)$"
//!
//! [rewrite.rules.action]
//! type = "Redirect"
//! url = "blogposts/{R:1}"
//! redirectType = "Found"
//!
//! [rewrite.rewriteMaps.staticRewrites]
//! "/heavy" = "/heavy.aspx"
//! ```
//!
//! Loading fails closed: every diagnostic is collected and reported with
//! a document position where one exists, or the owning rule's name.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::condition::{Condition, ConditionSet, LogicalGrouping};
use super::error::{ParseError, ParseErrors};
use super::matcher::{EngineOptions, MatchPrimitive};
use super::maps::{RewriteMap, RewriteMaps};
use super::pattern::parse_braces;
use super::rule::{Action, Rule, ServerVariableAssignment};
use super::RuleSet;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    rewrite: RewriteSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RewriteSection {
    #[serde(default)]
    rules: Vec<RuleEntry>,
    #[serde(default)]
    rewrite_maps: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RuleEntry {
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    global: bool,
    #[serde(default)]
    stop_processing: bool,
    #[serde(default)]
    pattern_syntax: PatternSyntax,
    #[serde(rename = "match")]
    initial_match: MatchEntry,
    conditions: Option<ConditionsEntry>,
    #[serde(default)]
    server_variables: Vec<SetEntry>,
    action: ActionEntry,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
enum PatternSyntax {
    #[default]
    #[serde(rename = "ECMAScript")]
    EcmaScript,
    ExactMatch,
    Wildcard,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MatchEntry {
    url: String,
    #[serde(default = "default_true")]
    ignore_case: bool,
    #[serde(default)]
    negate: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConditionsEntry {
    #[serde(default)]
    logical_grouping: GroupingEntry,
    #[serde(default)]
    track_all_captures: bool,
    #[serde(default)]
    add: Vec<ConditionEntry>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
enum GroupingEntry {
    #[default]
    MatchAll,
    MatchAny,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConditionEntry {
    input: String,
    pattern: Option<String>,
    #[serde(default)]
    match_type: MatchType,
    #[serde(default = "default_true")]
    ignore_case: bool,
    #[serde(default)]
    negate: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
enum MatchType {
    #[default]
    Pattern,
    IsFile,
    IsDirectory,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SetEntry {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ActionEntry {
    #[serde(rename = "type")]
    kind: ActionType,
    url: Option<String>,
    #[serde(default = "default_true")]
    append_query_string: bool,
    #[serde(default)]
    delete_query_string: bool,
    #[serde(default)]
    escape_back_references: bool,
    #[serde(default)]
    redirect_type: RedirectType,
    status_code: Option<u16>,
    status_reason: Option<String>,
    status_description: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
enum ActionType {
    #[default]
    None,
    Rewrite,
    Redirect,
    CustomResponse,
    AbortRequest,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
enum RedirectType {
    #[default]
    Permanent,
    Found,
    SeeOther,
    Temporary,
}

impl RedirectType {
    fn status(self) -> u16 {
        match self {
            Self::Permanent => 301,
            Self::Found => 302,
            Self::SeeOther => 303,
            Self::Temporary => 307,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Deserialize and compile a structured document into a [`RuleSet`].
pub(crate) fn load(doc: &str, options: EngineOptions) -> Result<RuleSet, ParseErrors> {
    let document: Document = toml::from_str(doc).map_err(|err| {
        let (line, column) = err
            .span()
            .map(|span| line_column(doc, span.start))
            .unwrap_or((0, 0));
        ParseErrors::from(ParseError::at(err.message(), line, column))
    })?;

    let mut rules = RuleSet::default();
    for (name, entries) in document.rewrite.rewrite_maps {
        let map: RewriteMap = entries.into_iter().collect();
        rules.add_map(name, map);
    }

    let mut errors = Vec::new();
    for entry in document.rewrite.rules {
        match build_rule(entry, &rules.maps, options) {
            Ok(rule) => {
                rules.add(rule);
            }
            Err(mut batch) => errors.append(&mut batch),
        }
    }
    match errors.is_empty() {
        true => Ok(rules),
        false => Err(ParseErrors(errors)),
    }
}

fn build_rule(
    entry: RuleEntry,
    maps: &RewriteMaps,
    options: EngineOptions,
) -> Result<Rule, Vec<ParseError>> {
    let mut errors = Vec::new();
    let name = entry.name.clone();
    let fail = |err: ParseError, errors: &mut Vec<ParseError>| errors.push(err.in_rule(&name));

    let initial_match = match build_initial_match(&entry, options) {
        Ok(primitive) => Some(primitive),
        Err(err) => {
            fail(err, &mut errors);
            None
        }
    };

    let conditions = match entry.conditions {
        Some(conditions) => match build_conditions(conditions, maps, options) {
            Ok(set) => Some(set),
            Err(batch) => {
                for err in batch {
                    fail(err, &mut errors);
                }
                None
            }
        },
        None => None,
    };

    let mut server_variables = Vec::new();
    for set in entry.server_variables {
        let assignment = ServerVariableAssignment::target_for(&set.name).and_then(|target| {
            Ok(ServerVariableAssignment {
                target,
                value: parse_braces(&set.value, maps)?,
            })
        });
        match assignment {
            Ok(assignment) => server_variables.push(assignment),
            Err(err) => fail(err, &mut errors),
        }
    }

    let action = match build_action(entry.action, maps) {
        Ok(action) => Some(action),
        Err(err) => {
            fail(err, &mut errors);
            None
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }
    let mut rule = Rule::new(entry.name, initial_match.unwrap(), action.unwrap())
        .global(entry.global)
        .stop_processing(entry.stop_processing);
    rule.enabled = entry.enabled;
    rule.conditions = conditions;
    rule.server_variables = server_variables;
    Ok(rule)
}

fn build_initial_match(entry: &RuleEntry, options: EngineOptions) -> Result<MatchPrimitive, ParseError> {
    let m = &entry.initial_match;
    match entry.pattern_syntax {
        PatternSyntax::EcmaScript => MatchPrimitive::regex(&m.url, m.ignore_case, m.negate, options),
        PatternSyntax::ExactMatch => Ok(MatchPrimitive::exact(&m.url, m.ignore_case, m.negate)),
        PatternSyntax::Wildcard => Err(ParseError::new(
            "wildcard pattern syntax is not supported",
        )),
    }
}

fn build_conditions(
    entry: ConditionsEntry,
    maps: &RewriteMaps,
    options: EngineOptions,
) -> Result<ConditionSet, Vec<ParseError>> {
    let grouping = match entry.logical_grouping {
        GroupingEntry::MatchAll => LogicalGrouping::MatchAll,
        GroupingEntry::MatchAny => LogicalGrouping::MatchAny,
    };

    let mut errors = Vec::new();
    let mut conditions = Vec::new();
    for add in entry.add {
        match build_condition(add, maps, options) {
            Ok(condition) => conditions.push(condition),
            Err(err) => errors.push(err),
        }
    }
    match errors.is_empty() {
        true => Ok(ConditionSet::new(grouping, entry.track_all_captures, conditions)),
        false => Err(errors),
    }
}

fn build_condition(
    entry: ConditionEntry,
    maps: &RewriteMaps,
    options: EngineOptions,
) -> Result<Condition, ParseError> {
    let input = parse_braces(&entry.input, maps)?;
    let matcher = match entry.match_type {
        MatchType::Pattern => {
            let pattern = entry.pattern.as_deref().ok_or_else(|| {
                ParseError::new("condition with matchType 'Pattern' requires a pattern")
            })?;
            MatchPrimitive::regex(pattern, entry.ignore_case, entry.negate, options)?
        }
        MatchType::IsFile => MatchPrimitive::IsFile {
            negate: entry.negate,
        },
        MatchType::IsDirectory => MatchPrimitive::IsDirectory {
            negate: entry.negate,
        },
    };
    Ok(Condition {
        input,
        matcher,
        or_next: false,
    })
}

fn build_action(entry: ActionEntry, maps: &RewriteMaps) -> Result<Action, ParseError> {
    let url_pattern = |entry: &ActionEntry| -> Result<_, ParseError> {
        let url = entry
            .url
            .as_deref()
            .ok_or_else(|| ParseError::new("action requires a url"))?;
        let pattern = parse_braces(url, maps)?;
        Ok(match entry.escape_back_references {
            true => pattern.escape_back_references(),
            false => pattern,
        })
    };

    match entry.kind {
        ActionType::None => Ok(Action::None),
        ActionType::Rewrite => Ok(Action::Rewrite {
            pattern: url_pattern(&entry)?,
            append_query: entry.append_query_string,
            delete_query: entry.delete_query_string,
        }),
        ActionType::Redirect => Ok(Action::Redirect {
            pattern: url_pattern(&entry)?,
            status: entry
                .status_code
                .unwrap_or_else(|| entry.redirect_type.status()),
            append_query: entry.append_query_string,
            delete_query: entry.delete_query_string,
        }),
        ActionType::CustomResponse => Ok(Action::CustomResponse {
            status: entry
                .status_code
                .ok_or_else(|| ParseError::new("CustomResponse action requires a statusCode"))?,
            reason: entry.status_reason,
            body: entry.status_description,
        }),
        ActionType::AbortRequest => Ok(Action::Abort),
    }
}

fn line_column(doc: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;
    for (i, c) in doc.char_indices() {
        if i >= offset {
            break;
        }
        match c {
            '\n' => {
                line += 1;
                column = 1;
            }
            _ => column += 1,
        }
    }
    (line, column)
}

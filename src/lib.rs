//! Framework agnostic URL rewrite and redirect rule engine.
//!
//! Rules come from either of two dialects (an IIS-style structured
//! document or Apache `mod_rewrite`-style directives) and compile into
//! one shared rule model evaluated per request. The compiled [`Engine`]
//! is immutable and can serve any number of concurrent requests; each
//! request gets its own short-lived [`RewriteContext`].
//!
//! # Example
//!
//! ```
//! use url_rewrite::{Engine, RewriteContext};
//!
//! let engine = Engine::from_directives(r#"
//!     RewriteRule ^blocked/(.*)$ -           [F]
//!     RewriteRule ^file/(.*)$    /static/$1  [NE,L]
//! "#, Default::default()).expect("failed to process rules");
//!
//! let mut ctx = RewriteContext::from_uri("http://localhost/file/docs/readme.txt");
//! engine.apply(&mut ctx).unwrap();
//! assert_eq!(ctx.path, "/static/docs/readme.txt");
//! ```

mod condition;
mod context;
mod directive;
pub mod error;
mod maps;
mod matcher;
mod pattern;
mod rule;
mod structured;

use tracing::{debug, trace};

pub use condition::{Condition, ConditionSet, LogicalGrouping};
pub use context::{DiskProbe, FileProbe, Headers, NoopProbe, RewriteContext};
pub use maps::{RewriteMap, RewriteMaps};
pub use matcher::{EngineOptions, MatchOutcome, MatchPrimitive};
pub use pattern::{BackReferences, Pattern};
pub use rule::{Action, Rule, RuleResult, ServerVariableAssignment, VariableTarget};

use error::{EvalError, ParseErrors};
use pattern::BackReferences as Refs;

/// How a request leaves the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The (possibly rewritten) request continues downstream.
    Forward,
    /// A response was finalized in the context; nothing runs downstream.
    Finish,
    /// The connection should be dropped without a response.
    Abort,
}

/// Ordered, compiled rule collection shared by every request.
///
/// Globally scoped rules run before path-scoped rules, each group in its
/// declared order. Built once at startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub(crate) global: Vec<Rule>,
    pub(crate) path: Vec<Rule>,
    pub(crate) maps: RewriteMaps,
}

impl RuleSet {
    pub fn add(&mut self, rule: Rule) -> &mut Self {
        match rule.global {
            true => self.global.push(rule),
            false => self.path.push(rule),
        }
        self
    }

    pub fn add_map(&mut self, name: impl Into<String>, map: RewriteMap) -> &mut Self {
        self.maps.insert(name, map);
        self
    }

    pub fn maps(&self) -> &RewriteMaps {
        &self.maps
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.path.is_empty()
    }
}

/// Compiled rewrite engine, the per-request entry point.
#[derive(Debug, Default)]
pub struct Engine {
    rules: RuleSet,
}

impl Engine {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Load an IIS-style structured rule document.
    pub fn from_structured(doc: &str, options: EngineOptions) -> Result<Self, ParseErrors> {
        Ok(Self::new(structured::load(doc, options)?))
    }

    /// Load Apache `mod_rewrite`-style directive text.
    pub fn from_directives(text: &str, options: EngineOptions) -> Result<Self, ParseErrors> {
        Ok(Self::new(directive::load(text, options)?))
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Run every applicable rule against the request in `ctx`.
    ///
    /// Mutates the context in place and reports whether the request
    /// should continue downstream, finish with the recorded response, or
    /// abort the connection. Errors are rule-authoring defects surfaced
    /// at evaluation time (bad back-reference index, missing map key).
    pub fn apply(&self, ctx: &mut RewriteContext<'_>) -> Result<Outcome, EvalError> {
        let rules = self.rules.global.iter().chain(self.rules.path.iter());
        for rule in rules.filter(|r| r.enabled) {
            match self.run_rule(rule, ctx)? {
                RuleResult::Continue => continue,
                RuleResult::StopRules => break,
                RuleResult::EndResponse => {
                    return Ok(match ctx.aborted {
                        true => Outcome::Abort,
                        false => Outcome::Finish,
                    });
                }
            }
        }
        Ok(Outcome::Forward)
    }

    fn run_rule(&self, rule: &Rule, ctx: &mut RewriteContext<'_>) -> Result<RuleResult, EvalError> {
        // Global rules see the full absolute URI; path rules the bare path.
        let input = match rule.global {
            true => ctx.absolute_uri(),
            false => ctx.path.trim_start_matches('/').to_owned(),
        };
        let outcome = rule.initial_match.evaluate(&input, ctx.probe);
        if !outcome.success {
            debug!(rule = %rule.name, "rule did not match");
            return Ok(RuleResult::Continue);
        }
        let rule_refs = Refs::from(outcome.captures);

        let cond_refs = match &rule.conditions {
            Some(set) => match set.evaluate(ctx, &rule_refs, &self.rules.maps)? {
                Some(refs) => refs,
                None => {
                    debug!(rule = %rule.name, "rule conditions did not match");
                    return Ok(RuleResult::Continue);
                }
            },
            None => Refs::default(),
        };

        for assignment in &rule.server_variables {
            assignment.apply(ctx, &rule_refs, &cond_refs, &self.rules.maps)?;
        }

        trace!(rule = %rule.name, "rule matched, applying action");
        let result = rule.action.apply(ctx, &rule_refs, &cond_refs, &self.rules.maps)?;
        Ok(match (result, rule.stop_processing) {
            (RuleResult::Continue, true) => RuleResult::StopRules,
            (result, _) => result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> EngineOptions {
        EngineOptions::default()
    }

    #[test]
    fn test_disabled_rules_are_excluded() {
        let mut rules = RuleSet::default();
        let mut rule = Rule::new(
            "disabled",
            MatchPrimitive::regex(".*", false, false, options()).unwrap(),
            Action::CustomResponse {
                status: 403,
                reason: None,
                body: None,
            },
        );
        rule.enabled = false;
        rules.add(rule);

        let engine = Engine::new(rules);
        let mut ctx = RewriteContext::from_uri("http://localhost/anything");
        assert_eq!(engine.apply(&mut ctx).unwrap(), Outcome::Forward);
        assert_eq!(ctx.status, None);
    }

    #[test]
    fn test_stop_processing_halts_loop() {
        let mut rules = RuleSet::default();
        rules.add(
            Rule::new(
                "first",
                MatchPrimitive::regex("^a$", false, false, options()).unwrap(),
                Action::Rewrite {
                    pattern: Pattern::literal("/b"),
                    append_query: true,
                    delete_query: false,
                },
            )
            .stop_processing(true),
        );
        rules.add(Rule::new(
            "second",
            MatchPrimitive::regex("^b$", false, false, options()).unwrap(),
            Action::CustomResponse {
                status: 410,
                reason: None,
                body: None,
            },
        ));

        let engine = Engine::new(rules);
        let mut ctx = RewriteContext::from_uri("http://localhost/a");
        assert_eq!(engine.apply(&mut ctx).unwrap(), Outcome::Forward);
        assert_eq!(ctx.path, "/b");
        // the second rule would have matched the rewritten path
        assert_eq!(ctx.status, None);
    }

    #[test]
    fn test_rewrite_feeds_next_rule() {
        let mut rules = RuleSet::default();
        rules.add(Rule::new(
            "first",
            MatchPrimitive::regex("^a$", false, false, options()).unwrap(),
            Action::Rewrite {
                pattern: Pattern::literal("/b"),
                append_query: true,
                delete_query: false,
            },
        ));
        rules.add(Rule::new(
            "second",
            MatchPrimitive::regex("^b$", false, false, options()).unwrap(),
            Action::Rewrite {
                pattern: Pattern::literal("/c"),
                append_query: true,
                delete_query: false,
            },
        ));

        let engine = Engine::new(rules);
        let mut ctx = RewriteContext::from_uri("http://localhost/a");
        assert_eq!(engine.apply(&mut ctx).unwrap(), Outcome::Forward);
        assert_eq!(ctx.path, "/c");
    }

    #[test]
    fn test_global_rules_run_first_and_see_full_uri() {
        let mut rules = RuleSet::default();
        rules.add(
            Rule::new(
                "canonical host",
                MatchPrimitive::regex("^http://old\\.example\\.com/(.*)$", false, false, options())
                    .unwrap(),
                Action::Redirect {
                    pattern: Pattern::literal("http://example.com/moved"),
                    status: 301,
                    append_query: false,
                    delete_query: false,
                },
            )
            .global(true),
        );

        let engine = Engine::new(rules);
        let mut ctx = RewriteContext::from_uri("http://old.example.com/any/path");
        assert_eq!(engine.apply(&mut ctx).unwrap(), Outcome::Finish);
        assert_eq!(
            ctx.response_headers.get("Location"),
            Some("http://example.com/moved")
        );
        assert_eq!(ctx.status, Some(301));
    }

    #[test]
    fn test_abort_outcome() {
        let mut rules = RuleSet::default();
        rules.add(Rule::new(
            "drop",
            MatchPrimitive::regex("^secret", false, false, options()).unwrap(),
            Action::Abort,
        ));
        let engine = Engine::new(rules);
        let mut ctx = RewriteContext::from_uri("http://localhost/secret/path");
        assert_eq!(engine.apply(&mut ctx).unwrap(), Outcome::Abort);
        assert!(ctx.aborted);
    }

    #[test]
    fn test_server_variable_assignments() {
        let mut rules = RuleSet::default();
        let mut rule = Rule::new(
            "mark",
            MatchPrimitive::regex("^(.*)$", false, false, options()).unwrap(),
            Action::None,
        );
        rule.server_variables.push(ServerVariableAssignment {
            target: ServerVariableAssignment::target_for("HTTP_X_ORIGINAL_URL").unwrap(),
            value: pattern::parse_braces("{REQUEST_URI}", &RewriteMaps::default()).unwrap(),
        });
        rule.server_variables.push(ServerVariableAssignment {
            target: ServerVariableAssignment::target_for("RESPONSE_X_REWRITE").unwrap(),
            value: Pattern::literal("1"),
        });
        rules.add(rule);

        let engine = Engine::new(rules);
        let mut ctx = RewriteContext::from_uri("http://localhost/page?x=1");
        engine.apply(&mut ctx).unwrap();
        assert_eq!(ctx.request_headers.get("X-Original-Url"), Some("/page"));
        assert_eq!(ctx.response_headers.get("X-Rewrite"), Some("1"));
    }
}

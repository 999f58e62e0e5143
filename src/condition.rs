//! Ordered, AND/OR-grouped condition evaluation.

use tracing::trace;

use super::context::RewriteContext;
use super::error::EvalError;
use super::maps::RewriteMaps;
use super::matcher::MatchPrimitive;
use super::pattern::{BackReferences, Pattern};

/// Whether a condition set requires every condition or any one of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogicalGrouping {
    #[default]
    MatchAll,
    MatchAny,
}

/// One secondary match: a dynamically computed input string tested
/// against a match primitive.
///
/// `or_next` joins this condition to the following one with OR; the
/// structured dialect sets it on every condition under `MatchAny`, the
/// directive dialect per its `[OR]` flag.
#[derive(Debug)]
pub struct Condition {
    pub input: Pattern,
    pub matcher: MatchPrimitive,
    pub or_next: bool,
}

/// The full condition block of one rule.
#[derive(Debug, Default)]
pub struct ConditionSet {
    pub track_all_captures: bool,
    pub conditions: Vec<Condition>,
}

impl ConditionSet {
    /// Build a set, deriving the OR joins from the grouping.
    pub fn new(grouping: LogicalGrouping, track_all_captures: bool, mut conditions: Vec<Condition>) -> Self {
        if grouping == LogicalGrouping::MatchAny {
            for condition in conditions.iter_mut() {
                condition.or_next = true;
            }
        }
        Self {
            track_all_captures,
            conditions,
        }
    }

    /// Walk the conditions in declared order.
    ///
    /// Returns the combined condition back-references on success, `None`
    /// when the set fails. Each OR chain is evaluated at most once: after
    /// a success the remaining members of the chain are skipped. An
    /// AND-joined failure fails the whole set immediately.
    ///
    /// Without `track_all_captures` only the most recent capturing
    /// condition's captures survive; with it every successful condition
    /// appends its captures in declaration order, so a capture's position
    /// is the cumulative count of all captures recorded before it. A
    /// success without captures never clears what earlier conditions
    /// captured.
    pub fn evaluate(
        &self,
        ctx: &RewriteContext<'_>,
        rule_refs: &BackReferences,
        maps: &RewriteMaps,
    ) -> Result<Option<BackReferences>, EvalError> {
        let mut refs = BackReferences::default();
        let mut or_succeeded = false;
        let mut succeeded = true;

        for condition in &self.conditions {
            if or_succeeded && condition.or_next {
                continue;
            } else if or_succeeded {
                // one skip for the condition that closes a satisfied chain
                or_succeeded = false;
                continue;
            }

            let input = condition.input.evaluate(ctx, rule_refs, &refs, maps)?;
            let outcome = condition.matcher.evaluate(&input, ctx.probe);
            trace!(input = %input, success = outcome.success, "condition evaluated");
            succeeded = outcome.success;

            if condition.or_next {
                or_succeeded = outcome.success;
            } else if !outcome.success {
                return Ok(None);
            }

            // capture-less successes (negated or file-test conditions)
            // leave the previously captured values addressable
            if outcome.success && !outcome.captures.is_empty() {
                match self.track_all_captures {
                    true => refs.extend(outcome.captures),
                    false => refs.assign(outcome.captures),
                }
            }
        }
        Ok(succeeded.then_some(refs))
    }
}

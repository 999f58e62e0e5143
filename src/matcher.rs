//! Match primitives shared by initial-match and condition evaluation.

use fancy_regex::{Regex, RegexBuilder};
use tracing::warn;
use unicase::UniCase;

use super::context::FileProbe;
use super::error::ParseError;

/// Backtracking budget for compiled patterns in normal operation.
const MATCH_LIMIT: usize = 1_000_000;

/// Reduced budget for hosts that prefer to fail suspect patterns fast.
const LOW_MATCH_LIMIT: usize = 10_000;

/// Engine-wide evaluation settings, fixed at rule-compile time.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineOptions {
    /// Compile every regex with the reduced backtracking budget.
    ///
    /// Exceeding the budget at match time is treated as a non-match for
    /// that rule or condition, never as a request-fatal error.
    pub lower_match_limit: bool,
}

impl EngineOptions {
    fn match_limit(&self) -> usize {
        match self.lower_match_limit {
            true => LOW_MATCH_LIMIT,
            false => MATCH_LIMIT,
        }
    }
}

/// Result of evaluating one match primitive.
///
/// `captures[0]` is the whole matched text; further entries follow the
/// pattern's group order, with unmatched optional groups as empty strings.
/// A negated primitive that "succeeds" carries no captures.
#[derive(Clone, Debug, Default)]
pub struct MatchOutcome {
    pub success: bool,
    pub captures: Vec<String>,
}

impl MatchOutcome {
    fn failed() -> Self {
        Self::default()
    }

    fn empty_success() -> Self {
        Self {
            success: true,
            captures: Vec::new(),
        }
    }
}

/// One compiled matcher.
///
/// Closed set: regex and exact-string comparison against an input string,
/// and the two file-system tests which delegate entirely to the host's
/// [`FileProbe`] and never touch the regex machinery.
#[derive(Debug)]
pub enum MatchPrimitive {
    Regex { regex: Regex, negate: bool },
    Exact {
        value: String,
        ignore_case: bool,
        negate: bool,
    },
    IsFile { negate: bool },
    IsDirectory { negate: bool },
}

impl MatchPrimitive {
    /// Compile a regex primitive under the engine's backtracking budget.
    pub fn regex(
        pattern: &str,
        ignore_case: bool,
        negate: bool,
        options: EngineOptions,
    ) -> Result<Self, ParseError> {
        let pattern = match ignore_case {
            true => format!("(?i){pattern}"),
            false => pattern.to_owned(),
        };
        let regex = RegexBuilder::new(&pattern)
            .backtrack_limit(options.match_limit())
            .build()
            .map_err(|err| ParseError::new(format!("invalid regex pattern: {err}")))?;
        Ok(Self::Regex { regex, negate })
    }

    pub fn exact(value: &str, ignore_case: bool, negate: bool) -> Self {
        Self::Exact {
            value: value.to_owned(),
            ignore_case,
            negate,
        }
    }

    /// Evaluate against the given input, probing the file system where the
    /// primitive calls for it.
    pub fn evaluate(&self, input: &str, probe: &dyn FileProbe) -> MatchOutcome {
        match self {
            Self::Regex { regex, negate } => {
                let caps = match regex.captures(input) {
                    Ok(caps) => caps,
                    // Budget exhaustion on adversarial input degrades to a
                    // plain non-match for this rule.
                    Err(err) => {
                        warn!(error = %err, "regex evaluation aborted, treating as non-match");
                        None
                    }
                };
                match (caps, negate) {
                    (Some(caps), false) => MatchOutcome {
                        success: true,
                        captures: (0..caps.len())
                            .map(|i| caps.get(i).map(|m| m.as_str()).unwrap_or("").to_owned())
                            .collect(),
                    },
                    (Some(_), true) => MatchOutcome::failed(),
                    (None, false) => MatchOutcome::failed(),
                    (None, true) => MatchOutcome::empty_success(),
                }
            }
            Self::Exact {
                value,
                ignore_case,
                negate,
            } => {
                let equal = match ignore_case {
                    true => UniCase::new(input) == UniCase::new(value.as_str()),
                    false => input == value,
                };
                match (equal, negate) {
                    (true, false) => MatchOutcome {
                        success: true,
                        captures: vec![input.to_owned()],
                    },
                    (true, true) | (false, false) => MatchOutcome::failed(),
                    (false, true) => MatchOutcome::empty_success(),
                }
            }
            Self::IsFile { negate } => Self::probe_outcome(probe.is_file(input), *negate),
            Self::IsDirectory { negate } => Self::probe_outcome(probe.is_dir(input), *negate),
        }
    }

    fn probe_outcome(result: std::io::Result<bool>, negate: bool) -> MatchOutcome {
        let exists = match result {
            Ok(exists) => exists,
            // Probe failures come from the host collaborator; report them
            // as a non-match for this condition, not an engine error.
            Err(err) => {
                warn!(error = %err, "file probe failed, treating as non-match");
                false
            }
        };
        match exists != negate {
            true => MatchOutcome::empty_success(),
            false => MatchOutcome::failed(),
        }
    }
}

use std::fmt;

use thiserror::Error;

/// Error tied to one location in a rule document.
///
/// `line` and `column` are 1-based; both are `0` when the error is not
/// attached to a document position (for example a semantic error found
/// after deserialization, which names the offending rule instead).
#[derive(Debug, Error, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    /// Error with a known document position.
    pub fn at(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }

    /// Error without a document position.
    pub fn new(message: impl Into<String>) -> Self {
        Self::at(message, 0, 0)
    }

    /// Prefix the message with the rule it belongs to.
    pub fn in_rule(mut self, name: &str) -> Self {
        self.message = format!("rule '{name}': {}", self.message);
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            0 => write!(f, "{}", self.message),
            _ => write!(f, "{} (line {}, column {})", self.message, self.line, self.column),
        }
    }
}

/// Aggregate of every error found while loading a rule document.
///
/// Loaders collect all diagnostics instead of stopping at the first,
/// then fail closed with the full batch.
#[derive(Debug, Error)]
pub struct ParseErrors(pub Vec<ParseError>);

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl From<ParseError> for ParseErrors {
    fn from(err: ParseError) -> Self {
        Self(vec![err])
    }
}

/// Fatal errors raised while evaluating compiled rules.
///
/// These indicate rule-authoring defects and are never swallowed:
/// an out-of-range back-reference or a missing rewrite-map key must
/// surface to the host rather than degrade to an empty string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("back-reference {{R:{index}}} out of range: only {count} rule captures available")]
    RuleBackRefOutOfRange { index: usize, count: usize },

    #[error("back-reference {{C:{index}}} out of range: only {count} condition captures available")]
    ConditionBackRefOutOfRange { index: usize, count: usize },

    #[error("rewrite map '{map}' has no entry for key '{key}'")]
    MapKeyMissing { map: String, key: String },
}

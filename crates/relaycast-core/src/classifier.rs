//! Relay diagnostic output classification.
//!
//! The relay executable reports its progress only as human-readable text on
//! stderr. [`Classifier`] turns each line into at most one
//! [`Classification`] using a [`PatternTable`] that lives in configuration,
//! so new executable versions can be accommodated without code changes.

use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of classifying one diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The destination rejected the credential or the egress URL.
    AuthError,
    /// Connection-level problem the relay executable retries by itself.
    TransientNetworkIssue,
    /// The egress connection / stream mapping was established.
    ConnectedSuccess,
    /// Media frames are flowing.
    FrameProgress,
}

impl Classification {
    /// Whether this classification ends the relay session.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::AuthError)
    }
}

/// Regular expressions per classification tag, matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternTable {
    pub auth_error: Vec<String>,
    pub transient_network: Vec<String>,
    pub connected: Vec<String>,
    pub frame_progress: Vec<String>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self {
            auth_error: vec![
                r"server returned 40[134]".into(),
                r"\b40[13] (forbidden|unauthorized)".into(),
                r"\bunauthorized\b".into(),
                r"authentication failed".into(),
                r"invalid (stream )?key".into(),
            ],
            transient_network: vec![
                r"connection refused".into(),
                r"connection timed out".into(),
                r"connection reset by peer".into(),
                r"cannot open connection".into(),
                r"i/o error".into(),
                r"input/output error".into(),
                r"resource temporarily unavailable".into(),
                r"broken pipe".into(),
                r"error number -10049".into(),
            ],
            connected: vec![r"stream mapping:".into(), r"stream publish started".into()],
            frame_progress: vec![r"\bframe=\s*\d+".into()],
        }
    }
}

/// Compiled form of a [`PatternTable`].
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<(Classification, RegexSet)>,
}

impl Classifier {
    /// Compile the pattern table. Fails on the first invalid expression.
    pub fn new(table: &PatternTable) -> Result<Self> {
        // Order is precedence: a line carrying both an auth failure and a
        // progress counter is an auth failure.
        let ordered = [
            (Classification::AuthError, &table.auth_error),
            (Classification::TransientNetworkIssue, &table.transient_network),
            (Classification::ConnectedSuccess, &table.connected),
            (Classification::FrameProgress, &table.frame_progress),
        ];
        let mut rules = Vec::with_capacity(ordered.len());
        for (tag, patterns) in ordered {
            let set = RegexSetBuilder::new(patterns)
                .case_insensitive(true)
                .build()?;
            rules.push((tag, set));
        }
        Ok(Self { rules })
    }

    /// Classify a single diagnostic line.
    pub fn classify(&self, line: &str) -> Option<Classification> {
        self.rules
            .iter()
            .find(|(_, set)| set.is_match(line))
            .map(|(tag, _)| *tag)
    }
}

impl Default for Classifier {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self::new(&PatternTable::default()).expect("built-in patterns compile")
    }
}

//! Core enums shared by the pipeline and the container indexer.
//!
//! All enums serialize in lowercase so they can be used directly in
//! configuration files and engine messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Terminal outcome of a filtered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Original bytes were delivered.
    Pass,
    /// A placeholder was delivered instead of the original bytes.
    Block,
    /// Filtering failed and the original bytes were delivered.
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Block => write!(f, "block"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Process-wide sensitivity preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    /// Low block rate observed; most permissive threshold.
    Trusted,
    /// Default operating point.
    Neutral,
    /// High block rate observed; strictest threshold.
    Untrusted,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trusted => write!(f, "trusted"),
            Self::Neutral => write!(f, "neutral"),
            Self::Untrusted => write!(f, "untrusted"),
        }
    }
}

impl FromStr for Zone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trusted" => Ok(Self::Trusted),
            "neutral" => Ok(Self::Neutral),
            "untrusted" => Ok(Self::Untrusted),
            other => Err(Error::invalid_input(format!("unknown zone '{other}'"))),
        }
    }
}

/// Which filter flow handles a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Verdict recorded on a stream, a fragment, or an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// No decision has been made yet.
    #[default]
    Unknown,
    Pass,
    Block,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Pass => write!(f, "pass"),
            Self::Block => write!(f, "block"),
        }
    }
}

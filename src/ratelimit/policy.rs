//! Admission policies deciding how much of a batch is kept.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LimiterError;

/// How a batch is treated when the window cannot hold all of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// All-or-nothing: the batch is admitted only if it fits entirely
    #[default]
    Binary,
    /// Partial fill: admit as much of the batch as fits
    Nary,
    /// Lenient: admit the whole batch whenever any capacity remains
    Uniform,
}

/// The outcome of applying an [`AdmissionMode`] to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Keep every inserted entry
    Full,
    /// Keep the first `n` inserted entries and remove the rest
    Partial(u64),
    /// Remove every inserted entry and reject the call
    Reject,
}

impl Admission {
    /// Number of entries kept out of a batch of `batch` entries.
    pub fn acknowledged(&self, batch: u64) -> u64 {
        match self {
            Admission::Full => batch,
            Admission::Partial(n) => *n,
            Admission::Reject => 0,
        }
    }
}

impl AdmissionMode {
    /// Decide the fate of a batch.
    ///
    /// `original` is the in-window count before the batch was inserted.
    pub fn decide(&self, original: u64, batch: u64, limit: u64) -> Admission {
        if original >= limit {
            return Admission::Reject;
        }

        let fits = original.saturating_add(batch) <= limit;
        match self {
            AdmissionMode::Binary if !fits => Admission::Reject,
            AdmissionMode::Nary if !fits => Admission::Partial(limit - original),
            _ => Admission::Full,
        }
    }

    /// The lower-case name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionMode::Binary => "binary",
            AdmissionMode::Nary => "nary",
            AdmissionMode::Uniform => "uniform",
        }
    }
}

impl fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdmissionMode {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(AdmissionMode::Binary),
            "nary" => Ok(AdmissionMode::Nary),
            "uniform" => Ok(AdmissionMode::Uniform),
            other => Err(LimiterError::Config(format!(
                "mode must be one of binary, nary, uniform (got {:?})",
                other
            ))),
        }
    }
}

//! Shared types and utilities used across the request-orchestrator crates.
//!
//! This crate stays intentionally small so every other crate in the
//! workspace can depend on it without pulling in heavy transitive costs.
//!
//! - [`observability`]: centralised `tracing` initialisation
//! - [`Error`] and [`Result`]: shared error handling for crate boundaries
//! - [`AcceptedStatus`]: the caller-supplied set of HTTP status codes that
//!   count as a satisfying response for a request

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod observability;

/// Error types shared across crate boundaries.
///
/// Crate-local errors (`StoreError`, `RequesterError`, ...) convert into this
/// via `#[from]` at the points where they cross into shared code; the
/// binary and the HTTP handlers collapse everything down to this type (or to
/// `anyhow::Error` at the outermost wiring layer).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(String),

    #[error("request error: {0}")]
    Request(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Convenient alias for results that use [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The set of HTTP status codes a caller will accept as "satisfied".
///
/// Stored as a `Vec` rather than a `HashSet` because it round-trips through
/// the comma-joined wire format (`"200,301,302"`) in request order, matching
/// the external API's stringify/destringify pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedStatus(pub Vec<u16>);

impl Default for AcceptedStatus {
    fn default() -> Self {
        Self(vec![200])
    }
}

impl AcceptedStatus {
    pub fn contains(&self, code: u16) -> bool {
        self.0.contains(&code)
    }

    /// Parse the comma-joined wire format, e.g. `"200,301"` or `"200"`.
    pub fn parse(raw: &str) -> std::result::Result<Self, std::num::ParseIntError> {
        let codes = raw
            .split(',')
            .map(|s| s.trim().parse::<u16>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self(codes))
    }

    /// Merge another accepted-status set into this one, keeping first-seen
    /// order and dropping duplicates. Used when a re-registered request
    /// widens the set of status codes it will accept.
    pub fn union(&self, other: &AcceptedStatus) -> Self {
        let mut codes = self.0.clone();
        for code in &other.0 {
            if !codes.contains(code) {
                codes.push(*code);
            }
        }
        Self(codes)
    }
}

impl fmt::Display for AcceptedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{joined}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_status_round_trips_single_code() {
        let parsed = AcceptedStatus::parse("200").unwrap();
        assert_eq!(parsed, AcceptedStatus(vec![200]));
        assert_eq!(parsed.to_string(), "200");
    }

    #[test]
    fn accepted_status_round_trips_multiple_codes() {
        let parsed = AcceptedStatus::parse("200, 301,302").unwrap();
        assert_eq!(parsed, AcceptedStatus(vec![200, 301, 302]));
        assert_eq!(parsed.to_string(), "200,301,302");
    }

    #[test]
    fn accepted_status_contains() {
        let s = AcceptedStatus(vec![200, 304]);
        assert!(s.contains(304));
        assert!(!s.contains(404));
    }

    #[test]
    fn union_appends_new_codes_and_skips_duplicates() {
        let a = AcceptedStatus(vec![200]);
        let b = AcceptedStatus(vec![200, 301]);
        assert_eq!(a.union(&b), AcceptedStatus(vec![200, 301]));
    }
}

//! Error kinds shared across the ACM core.
//!
//! One flat enum, one variant per semantic kind, the same shape as the
//! teacher's `RailpackError`/`ApiError`: a `thiserror`-derived enum rather
//! than a tree of nested error types per module.

use thiserror::Error;

/// Errors surfaced by the automatic certificate management subsystem.
#[derive(Error, Debug)]
pub enum AcmeError {
    /// Malformed domain, IP literal, disallowed wildcard shape.
    #[error("invalid domain: {0}")]
    Validation(String),

    /// Host not present in the configured admission policy.
    #[error("host not configured: {0}")]
    Admission(String),

    /// Network, TLS, or I/O failure talking to the ACME server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The ACME server returned an RFC 7807 problem document (or a bare
    /// non-success status with no problem document, in which case `detail`
    /// carries whatever body text was returned).
    #[error("ACME server error ({problem_type}): {detail}")]
    Protocol { problem_type: String, detail: String },

    /// A polling loop exhausted its budget without reaching the expected
    /// status; `last_observed` carries the last status seen.
    #[error("polling budget exhausted, last observed state: {0}")]
    State(String),

    /// Disk read/write/permissions failure. Non-fatal for reads (callers
    /// treat it as a cache miss); fatal for writes that must persist a
    /// freshly issued certificate.
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, AcmeError>;

impl From<reqwest::Error> for AcmeError {
    fn from(err: reqwest::Error) -> Self {
        AcmeError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for AcmeError {
    fn from(err: std::io::Error) -> Self {
        AcmeError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AcmeError {
    fn from(err: serde_json::Error) -> Self {
        AcmeError::Protocol {
            problem_type: "about:blank".into(),
            detail: format!("malformed JSON from ACME server: {err}"),
        }
    }
}

//! Domain validator (C7): a small pure-function module that rejects
//! malformed domains and disallowed wildcard shapes before they reach the
//! host admission policy or the ACME wire client.

use lazy_static::lazy_static;
use regex::Regex;

use super::error::{AcmeError, Result};

lazy_static! {
    /// Labels of alphanumerics and hyphens (no leading/trailing hyphen),
    /// dot-joined. Deliberately excludes underscores and other
    /// hostname-unsafe characters IDNA processing alone wouldn't reject.
    static ref HOSTNAME_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*$"
    )
    .unwrap();
}

/// The validated, IDNA-normalized shape of a domain pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainForm {
    /// An exact host, e.g. `example.com`.
    Exact(String),
    /// A single-level wildcard, carrying the base domain with `*.` stripped,
    /// e.g. `*.example.com` becomes `Wildcard("example.com")`.
    Wildcard(String),
}

/// Validate a domain or single-level wildcard pattern.
///
/// Rejects: empty strings, more than one `*`, a `*` not in the first
/// position, a `*` not immediately followed by `.`, and anything that fails
/// IDNA lookup conversion or doesn't match [`HOSTNAME_REGEX`] afterwards.
pub fn validate_domain(input: &str) -> Result<DomainForm> {
    if input.is_empty() {
        return Err(AcmeError::Validation("domain is empty".into()));
    }

    let star_count = input.matches('*').count();
    if star_count > 1 {
        return Err(AcmeError::Validation(format!(
            "domain '{input}' may contain at most one '*'"
        )));
    }

    if star_count == 1 {
        if !input.starts_with('*') {
            return Err(AcmeError::Validation(format!(
                "domain '{input}': '*' must be the first character"
            )));
        }
        if !input.starts_with("*.") {
            return Err(AcmeError::Validation(format!(
                "domain '{input}': '*' must be followed by '.'"
            )));
        }
        let rest = &input[2..];
        let ascii = to_ascii(rest)?;
        check_hostname(&ascii)?;
        Ok(DomainForm::Wildcard(ascii))
    } else {
        let ascii = to_ascii(input)?;
        check_hostname(&ascii)?;
        Ok(DomainForm::Exact(ascii))
    }
}

fn to_ascii(input: &str) -> Result<String> {
    idna::domain_to_ascii(input)
        .map_err(|e| AcmeError::Validation(format!("invalid domain '{input}': {e}")))
}

fn check_hostname(ascii: &str) -> Result<()> {
    if ascii.is_empty() || !HOSTNAME_REGEX.is_match(ascii) {
        return Err(AcmeError::Validation(format!(
            "'{ascii}' is not a valid hostname"
        )));
    }
    Ok(())
}

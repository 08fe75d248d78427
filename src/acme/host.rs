//! Host admission policy (C4): the set of hostnames fortify is willing to
//! request certificates for. Exact hosts and single-level wildcards only —
//! construction rejects anything [`super::domain::validate_domain`] rejects.

use std::collections::HashSet;

use super::domain::{validate_domain, DomainForm};
use super::error::Result;

/// An immutable set of admitted hosts, built once from configuration.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    exact: HashSet<String>,
    /// Full wildcard patterns, stored as `*.<base>` so a substituted
    /// candidate host label can be compared directly.
    wildcards: HashSet<String>,
}

impl HostPolicy {
    /// Validate and compile a list of configured host patterns.
    ///
    /// A wildcard pattern `*.D` also admits the bare domain `D` itself —
    /// one registered pattern covers both its exact form and one level of
    /// subdomain.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut exact = HashSet::new();
        let mut wildcards = HashSet::new();

        for pattern in patterns {
            match validate_domain(pattern)? {
                DomainForm::Exact(d) => {
                    exact.insert(d);
                }
                DomainForm::Wildcard(d) => {
                    wildcards.insert(format!("*.{d}"));
                    exact.insert(d);
                }
            }
        }

        Ok(Self { exact, wildcards })
    }

    /// Whether `host` (as seen on the wire — TLS SNI or an HTTP `Host`
    /// header) is covered by this policy. Case-insensitive and punycode
    /// aware; falls back to the lowercased raw string if IDNA conversion
    /// fails so callers still get a definite accept/reject rather than an
    /// error from what is meant to be a cheap, infallible check.
    pub fn admits(&self, host: &str) -> bool {
        let host = host.trim().trim_end_matches('.');
        let normalized = idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_ascii_lowercase());

        if self.exact.contains(&normalized) {
            return true;
        }

        let labels: Vec<&str> = normalized.split('.').collect();
        for i in 0..labels.len() {
            let mut parts = labels.clone();
            parts[i] = "*";
            let candidate = parts.join(".");
            if self.wildcards.contains(&candidate) {
                return true;
            }
        }

        false
    }

    /// All exactly-admitted hosts, for cache bootstrap scans and diagnostics.
    pub fn exact_hosts(&self) -> impl Iterator<Item = &str> {
        self.exact.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(patterns: &[&str]) -> HostPolicy {
        HostPolicy::new(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn exact_host_admits_itself_only() {
        let p = policy(&["example.com"]);
        assert!(p.admits("example.com"));
        assert!(!p.admits("api.example.com"));
        assert!(!p.admits("other.com"));
    }

    #[test]
    fn wildcard_admits_base_and_one_level_of_subdomain() {
        let p = policy(&["*.example.com"]);
        assert!(p.admits("example.com"));
        assert!(p.admits("api.example.com"));
        assert!(p.admits("www.example.com"));
    }

    #[test]
    fn wildcard_does_not_admit_two_levels_of_subdomain() {
        let p = policy(&["*.example.com"]);
        assert!(!p.admits("a.b.example.com"));
    }

    #[test]
    fn admission_is_case_insensitive_and_punycode_aware() {
        let p = policy(&["example.com"]);
        assert!(p.admits("EXAMPLE.com"));
        assert!(p.admits("EXAMPLE.COM"));
    }

    #[test]
    fn unrelated_host_is_rejected() {
        let p = policy(&["example.com", "*.foo.org"]);
        assert!(!p.admits("bar.org"));
        assert!(!p.admits("sub.bar.org"));
    }

    #[test]
    fn construction_rejects_invalid_patterns() {
        assert!(HostPolicy::new(&["*.*.com".to_string()]).is_err());
        assert!(HostPolicy::new(&["ex*.com".to_string()]).is_err());
    }
}

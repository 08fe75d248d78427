//! Automatic Certificate Management core: key/crypto primitives (C1), the
//! ACME wire client (C2), the certificate cache (C3), host admission (C4),
//! the HTTP-01 challenge responder (C5), the certificate resolver (C6), and
//! the domain validator (C7).

pub mod cache;
pub mod challenge;
pub mod client;
pub mod domain;
pub mod error;
pub mod host;
pub mod key;
pub mod resolver;

pub use cache::{CertCache, CertEntry};
pub use challenge::{ChallengeContext, ChallengeLayer, ChallengeStore, Transport};
pub use domain::{validate_domain, DomainForm};
pub use error::{AcmeError, Result};
pub use host::HostPolicy;
pub use key::AccountKey;
pub use resolver::{AcmeSettings, CertificateResolver};

/// Let's Encrypt's production ACME directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt's staging ACME directory, for testing issuance without
/// hitting production rate limits.
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

//! Certificate cache & store (C3): an in-memory tier backed by a two-file
//! on-disk layout per domain, the same `DashMap`-fronted shape as the
//! teacher's `proxy::tls::CertStore`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use x509_parser::prelude::*;

use super::error::{AcmeError, Result};

/// Margin within which a cached certificate is treated as no longer valid
/// and eligible for renewal, even though it hasn't technically expired yet.
pub const RENEWAL_MARGIN: ChronoDuration = ChronoDuration::hours(72);

/// A certificate and its private key, plus the validity window read out of
/// the leaf certificate at load time.
#[derive(Clone)]
pub struct CertEntry {
    pub domain: String,
    /// PEM-encoded certificate chain, leaf first.
    pub certificate_pem: String,
    /// PEM-encoded private key for the leaf certificate.
    pub private_key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertEntry {
    /// Valid when `now` is past `not_before` and more than [`RENEWAL_MARGIN`]
    /// away from `not_after`. Equal to the margin is *not* valid — renewal
    /// kicks in one tick before expiry would otherwise bite.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && (self.not_after - now) > RENEWAL_MARGIN
    }

    /// The combined PEM blob written to disk: private key first, then the
    /// certificate chain, matching the `ong_acme_certificate_and_key.crt`
    /// layout.
    pub fn combined_pem(&self) -> String {
        format!("{}{}", self.private_key_pem, self.certificate_pem)
    }

    pub fn from_parts(domain: &str, private_key_pem: String, certificate_pem: String) -> Result<Self> {
        let (not_before, not_after) = leaf_validity(&certificate_pem)?;
        Ok(Self {
            domain: domain.to_string(),
            certificate_pem,
            private_key_pem,
            not_before,
            not_after,
        })
    }

    fn from_combined_pem(domain: &str, combined: &str) -> Result<Self> {
        let blocks = pem::parse_many(combined.as_bytes())
            .map_err(|e| AcmeError::Storage(format!("malformed PEM for {domain}: {e}")))?;

        let mut private_key_pem = None;
        let mut certificate_pem = String::new();
        for block in &blocks {
            if block.tag().contains("PRIVATE KEY") {
                if private_key_pem.is_none() {
                    private_key_pem = Some(pem::encode(block));
                }
            } else if block.tag() == "CERTIFICATE" {
                certificate_pem.push_str(&pem::encode(block));
            }
        }

        let private_key_pem = private_key_pem
            .ok_or_else(|| AcmeError::Storage(format!("no private key found for {domain}")))?;
        if certificate_pem.is_empty() {
            return Err(AcmeError::Storage(format!(
                "no certificate found for {domain}"
            )));
        }

        Self::from_parts(domain, private_key_pem, certificate_pem)
    }
}

fn leaf_validity(certificate_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let blocks = pem::parse_many(certificate_pem.as_bytes())
        .map_err(|e| AcmeError::Storage(format!("malformed certificate PEM: {e}")))?;
    let leaf = blocks
        .first()
        .ok_or_else(|| AcmeError::Storage("certificate chain is empty".into()))?;
    let (_, cert) = X509Certificate::from_der(leaf.contents())
        .map_err(|e| AcmeError::Storage(format!("malformed leaf certificate: {e}")))?;
    let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| AcmeError::Storage("certificate notBefore out of range".into()))?;
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| AcmeError::Storage("certificate notAfter out of range".into()))?;
    Ok((not_before, not_after))
}

/// Filenames fixed by the on-disk layout; kept literal rather than
/// configurable since they double as the crate's compatibility contract
/// with whatever process bootstraps the cache directory.
const ACCOUNT_KEY_FILE: &str = "ong_acme_account_private.key";
const CERT_AND_KEY_FILE: &str = "ong_acme_certificate_and_key.crt";
const CERT_KEY_FILE: &str = "ong_acme_certificate.key";
const TOKEN_FILE: &str = "ong_acme_certificate.token";

pub fn account_key_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(ACCOUNT_KEY_FILE)
}

pub fn domain_dir(cache_dir: &Path, domain: &str) -> PathBuf {
    cache_dir.join(domain)
}

pub fn cert_and_key_path(cache_dir: &Path, domain: &str) -> PathBuf {
    domain_dir(cache_dir, domain).join(CERT_AND_KEY_FILE)
}

pub fn cert_key_path(cache_dir: &Path, domain: &str) -> PathBuf {
    domain_dir(cache_dir, domain).join(CERT_KEY_FILE)
}

pub fn token_path(cache_dir: &Path, domain: &str) -> PathBuf {
    domain_dir(cache_dir, domain).join(TOKEN_FILE)
}

/// Two-tier certificate store: an in-memory `DashMap` fronting per-domain
/// files under `cache_dir`.
pub struct CertCache {
    memory: DashMap<String, Arc<CertEntry>>,
    cache_dir: PathBuf,
}

impl CertCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            memory: DashMap::new(),
            cache_dir,
        }
    }

    /// Scan `cache_dir` for per-domain certificates and warm the in-memory
    /// tier with whatever parses and is still valid. Malformed or expired
    /// entries are skipped, not deleted — a later procurement overwrites
    /// them in place.
    pub async fn bootstrap(cache_dir: PathBuf) -> Result<Self> {
        let cache = Self::new(cache_dir.clone());
        let mut entries = match tokio::fs::read_dir(&cache_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(cache),
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let domain = match path.file_name().and_then(|n| n.to_str()) {
                Some(d) => d.to_string(),
                None => continue,
            };
            match cache.load_from_disk(&domain).await {
                Ok(Some(_)) => debug!(domain = %domain, "loaded cached certificate"),
                Ok(None) => debug!(domain = %domain, "cached certificate absent or expired, skipping"),
                Err(e) => warn!(domain = %domain, error = %e, "failed to load cached certificate"),
            }
        }

        Ok(cache)
    }

    /// Fast path: an in-memory lookup only, no disk I/O. Returns `None` if
    /// absent or no longer within the renewal margin.
    pub fn get(&self, domain: &str) -> Option<Arc<CertEntry>> {
        let entry = self.memory.get(domain)?;
        if entry.is_valid_at(Utc::now()) {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Slow path: read the combined PEM file from disk, validate it, and if
    /// valid, populate the in-memory tier and return it.
    pub async fn load_from_disk(&self, domain: &str) -> Result<Option<Arc<CertEntry>>> {
        let path = cert_and_key_path(&self.cache_dir, domain);
        let combined = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(_) => return Ok(None),
        };

        let entry = match CertEntry::from_combined_pem(domain, &combined) {
            Ok(entry) => entry,
            Err(_) => return Ok(None),
        };

        if !entry.is_valid_at(Utc::now()) {
            return Ok(None);
        }

        let entry = Arc::new(entry);
        self.memory.insert(domain.to_string(), entry.clone());
        Ok(Some(entry))
    }

    /// Persist a freshly issued certificate: write the combined PEM (mode
    /// 0600) and the standalone per-domain private key file (also 0600) to
    /// disk, then populate the in-memory tier. The in-memory tier is
    /// populated regardless of whether the disk writes succeed — a
    /// handshake already holding this certificate must not fail just
    /// because the disk is unwritable; the caller logs the returned error
    /// instead.
    pub async fn store(&self, entry: CertEntry) -> Result<()> {
        let combined_path = cert_and_key_path(&self.cache_dir, &entry.domain);
        let key_path = cert_key_path(&self.cache_dir, &entry.domain);
        let combined = entry.combined_pem();
        let private_key_pem = entry.private_key_pem.clone();
        self.memory.insert(entry.domain.clone(), Arc::new(entry));
        crate::util::atomic_write(&combined_path, combined.as_bytes(), 0o600).await?;
        crate::util::atomic_write(&key_path, private_key_pem.as_bytes(), 0o600).await?;
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn self_signed_pem(domain: &str, validity_days: i64) -> (String, String) {
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        let now = std::time::SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + StdDuration::from_secs(86400 * validity_days.max(1) as u64)).into();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (key_pair.serialize_pem(), cert.pem())
    }

    #[test]
    fn fresh_certificate_is_valid() {
        let (key_pem, cert_pem) = self_signed_pem("example.com", 90);
        let entry = CertEntry::from_parts("example.com", key_pem, cert_pem).unwrap();
        assert!(entry.is_valid_at(Utc::now()));
    }

    #[test]
    fn certificate_within_renewal_margin_is_not_valid() {
        let (key_pem, cert_pem) = self_signed_pem("example.com", 2);
        let entry = CertEntry::from_parts("example.com", key_pem, cert_pem).unwrap();
        assert!(!entry.is_valid_at(Utc::now()));
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let dir = std::env::temp_dir().join(format!("fortify-test-cache-{}", std::process::id()));
        let cache = CertCache::new(dir.clone());

        let (key_pem, cert_pem) = self_signed_pem("example.com", 90);
        let entry = CertEntry::from_parts("example.com", key_pem, cert_pem).unwrap();
        cache.store(entry).await.unwrap();

        assert!(cache.get("example.com").is_some());
        assert!(cache.get("other.com").is_none());
        assert!(tokio::fs::metadata(cert_key_path(&dir, "example.com"))
            .await
            .is_ok());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn load_from_disk_returns_none_for_missing_domain() {
        let dir = std::env::temp_dir().join(format!("fortify-test-cache2-{}", std::process::id()));
        let cache = CertCache::new(dir.clone());
        assert!(cache.load_from_disk("nowhere.example").await.unwrap().is_none());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn bootstrap_skips_expired_certificates() {
        let dir = std::env::temp_dir().join(format!("fortify-test-cache3-{}", std::process::id()));
        let (key_pem, cert_pem) = self_signed_pem("stale.example", 1);
        let entry = CertEntry::from_parts("stale.example", key_pem, cert_pem).unwrap();
        let seed = CertCache::new(dir.clone());
        seed.store(entry).await.unwrap();

        let cache = CertCache::bootstrap(dir.clone()).await.unwrap();
        assert!(cache.get("stale.example").is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}

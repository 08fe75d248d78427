//! Certificate resolver (C6): the orchestrator that ties the host policy,
//! cache, challenge store, and wire client together behind one operation,
//! `resolve_certificate`. Single-flight procurement is a process-wide
//! `tokio::sync::Mutex<()>`, unconditionally exclusive since the guarded
//! section always mutates shared state (account registration, directory
//! caching, cache writes).

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::cache::{CertCache, CertEntry};
use super::challenge::ChallengeStore;
use super::client::{AcmeClient, Directory, OrderStatus};
use super::error::{AcmeError, Result};
use super::host::HostPolicy;
use super::key::{self, AccountKey};

/// Upper bound on a single procurement: the context passed to the ACME
/// client is independent of whatever triggered resolution (a TLS handshake
/// may abort long before this elapses; procurement keeps running so the
/// next handshake finds a cached certificate).
const PROCUREMENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct AcmeSettings {
    pub email: String,
    pub directory_url: String,
    pub cache_dir: PathBuf,
    pub hosts: Vec<String>,
}

/// Account state resolved lazily on first ACME interaction and then reused
/// for the lifetime of the process: the key is persisted to disk, but the
/// server-assigned KID is only ever held in memory, re-derived via a single
/// `newAccount` call each time the process starts (ACME CAs return the
/// existing account for a key they've already registered, so this stays a
/// cheap lookup rather than a fresh registration).
struct Account {
    key: Arc<AccountKey>,
    kid: String,
}

pub struct CertificateResolver {
    hosts: HostPolicy,
    cache: CertCache,
    pub challenges: Arc<ChallengeStore>,
    pub account_key_slot: Arc<RwLock<Option<Arc<AccountKey>>>>,
    client: AcmeClient,
    account: Mutex<Option<Account>>,
    directory: RwLock<Option<Directory>>,
    procurement: Mutex<()>,
    settings: AcmeSettings,
}

impl CertificateResolver {
    pub async fn new(settings: AcmeSettings) -> Result<Self> {
        let hosts = HostPolicy::new(&settings.hosts)?;
        let cache = CertCache::bootstrap(settings.cache_dir.clone()).await?;
        let challenges = Arc::new(ChallengeStore::new(settings.cache_dir.clone()));
        let client = AcmeClient::new(settings.directory_url.clone())?;

        Ok(Self {
            hosts,
            cache,
            challenges,
            account_key_slot: Arc::new(RwLock::new(None)),
            client,
            account: Mutex::new(None),
            directory: RwLock::new(None),
            procurement: Mutex::new(()),
            settings,
        })
    }

    /// Public operation: resolve the certificate for `server_name`, issuing
    /// one via ACME if none is cached and the name is admitted.
    ///
    /// 1. Normalize `server_name` (trim trailing dot, IDNA-lowercase) and
    ///    reject anything with fewer than two labels.
    /// 2. Fast path: an in-memory cache hit returns immediately, no lock.
    /// 3. Slow path: take the procurement mutex, re-check the cache (another
    ///    caller may have just finished), then the disk tier. Only a miss at
    ///    both of those gates host admission — a certificate already on disk
    ///    or in memory keeps being served even if it's since fallen out of
    ///    the configured host policy, since admission is only meant to gate
    ///    a *fresh* ACME delegation, not an existing cache/disk hit.
    pub async fn resolve_certificate(&self, server_name: &str) -> Result<Arc<CertEntry>> {
        let normalized = normalize_server_name(server_name)?;

        if let Some(entry) = self.cache.get(&normalized) {
            return Ok(entry);
        }

        let _guard = self.procurement.lock().await;

        if let Some(entry) = self.cache.get(&normalized) {
            return Ok(entry);
        }
        if let Some(entry) = self.cache.load_from_disk(&normalized).await? {
            return Ok(entry);
        }

        if !self.hosts.admits(&normalized) {
            return Err(AcmeError::Admission(normalized));
        }

        info!(domain = %normalized, "no valid cached certificate, starting ACME issuance");
        let entry = tokio::time::timeout(PROCUREMENT_TIMEOUT, self.issue_certificate(&normalized))
            .await
            .map_err(|_| {
                AcmeError::State(format!(
                    "procurement for {normalized} exceeded the {}s budget",
                    PROCUREMENT_TIMEOUT.as_secs()
                ))
            })??;
        if let Err(e) = self.cache.store((*entry).clone()).await {
            warn!(domain = %normalized, error = %e, "failed to persist freshly issued certificate to disk");
        }
        Ok(entry)
    }

    /// Synchronous, memory-only lookup for callers that want to wire a
    /// single shared `rustls::ServerConfig` through `rustls`'s own
    /// `ResolvesServerCert` hook rather than drive resolution from the
    /// accept loop. Never issues a certificate — a miss here always means
    /// "not yet cached", not "not admitted".
    pub fn fast_path(&self, server_name: &str) -> Option<Arc<CertEntry>> {
        let normalized = normalize_server_name(server_name).ok()?;
        if !self.hosts.admits(&normalized) {
            return None;
        }
        self.cache.get(&normalized)
    }

    async fn directory(&self) -> Result<Directory> {
        if let Some(dir) = self.directory.read().await.as_ref() {
            return Ok(dir.clone());
        }
        let dir = self.client.directory().await?;
        *self.directory.write().await = Some(dir.clone());
        Ok(dir)
    }

    /// Resolve the account key and KID, creating/registering them on first
    /// use and reusing them for the rest of the process's lifetime.
    async fn ensure_account(&self) -> Result<(Arc<AccountKey>, String)> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok((account.key.clone(), account.kid.clone()));
        }

        let key_path = super::cache::account_key_path(&self.settings.cache_dir);
        let key = Arc::new(key::get_or_create_account_key(&key_path).await?);
        *self.account_key_slot.write().await = Some(key.clone());

        let directory = self.directory().await?;
        let kid = self
            .client
            .new_account(&directory, &key, &self.settings.email)
            .await?;

        *slot = Some(Account {
            key: key.clone(),
            kid: kid.clone(),
        });
        Ok((key, kid))
    }

    async fn issue_certificate(&self, domain: &str) -> Result<Arc<CertEntry>> {
        let (key, kid) = self.ensure_account().await?;
        let directory = self.directory().await?;

        let created = self
            .client
            .new_order(&directory, &key, &kid, domain)
            .await?;

        for auth_url in &created.order.authorizations {
            self.complete_authorization(&directory, &key, &kid, domain, auth_url)
                .await?;
        }

        let order = self
            .client
            .poll_order(&directory, &key, &kid, &created.url, OrderStatus::Ready)
            .await?;

        let (csr_key_pem, csr_der) = key::create_csr(&[domain.to_string()])?;
        self.client
            .finalize(&directory, &key, &kid, &order.finalize, &csr_der)
            .await?;

        let finalized = self
            .client
            .poll_order(&directory, &key, &kid, &created.url, OrderStatus::Valid)
            .await?;

        let certificate_url = finalized.certificate.ok_or_else(|| {
            AcmeError::Protocol {
                problem_type: "urn:ietf:params:acme:error:malformed".into(),
                detail: "valid order carried no certificate URL".into(),
            }
        })?;
        let chain_pem = self
            .client
            .download_certificate(&directory, &key, &kid, &certificate_url)
            .await?;

        let entry = CertEntry::from_parts(domain, csr_key_pem, chain_pem)?;
        info!(domain = %domain, "issued new certificate");
        Ok(Arc::new(entry))
    }

    async fn complete_authorization(
        &self,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        domain: &str,
        auth_url: &str,
    ) -> Result<()> {
        let auth = self
            .client
            .fetch_authorization(directory, key, kid, auth_url)
            .await?;

        if auth.status == "valid" {
            return Ok(());
        }

        let challenge = auth
            .challenges
            .iter()
            .find(|c| c.challenge_type == "http-01")
            .ok_or_else(|| AcmeError::Protocol {
                problem_type: "urn:ietf:params:acme:error:unsupportedIdentifier".into(),
                detail: "no http-01 challenge offered".into(),
            })?;

        self.challenges.put(domain, &challenge.token).await?;

        self.client
            .respond_to_challenge(directory, key, kid, &challenge.url)
            .await?;

        let result = self
            .client
            .poll_authorization(directory, key, kid, auth_url)
            .await;

        self.challenges.remove(domain);

        match result {
            Ok(_) => {
                info!(domain = %domain, "authorization validated");
                Ok(())
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "authorization failed");
                Err(e)
            }
        }
    }
}

/// Trim a trailing dot, lowercase/IDNA-normalize, and require at least two
/// labels — a bare TLD or single label is never a certificate we'd request.
fn normalize_server_name(server_name: &str) -> Result<String> {
    let trimmed = server_name.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(AcmeError::Validation("server name is empty".into()));
    }
    if trimmed.parse::<IpAddr>().is_ok() {
        return Err(AcmeError::Validation(format!(
            "'{trimmed}' is an IP literal, not a domain"
        )));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|e| AcmeError::Validation(format!("invalid server name '{trimmed}': {e}")))?;
    if ascii.split('.').count() < 2 {
        return Err(AcmeError::Validation(format!(
            "server name '{ascii}' has fewer than two labels"
        )));
    }
    Ok(ascii)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_dot_and_lowercases() {
        assert_eq!(
            normalize_server_name("Example.COM.").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn normalize_rejects_single_label() {
        assert!(normalize_server_name("localhost").is_err());
    }

    #[test]
    fn normalize_rejects_empty() {
        assert!(normalize_server_name("").is_err());
    }

    #[test]
    fn normalize_rejects_ip_literals() {
        assert!(normalize_server_name("192.168.1.1").is_err());
        assert!(normalize_server_name("::1").is_err());
    }

    #[tokio::test]
    async fn resolve_certificate_rejects_unadmitted_host() {
        let dir = std::env::temp_dir().join(format!("fortify-test-resolver-{}", std::process::id()));
        let settings = AcmeSettings {
            email: "ops@example.com".into(),
            directory_url: "https://acme.invalid/directory".into(),
            cache_dir: dir.clone(),
            hosts: vec!["example.com".into()],
        };
        let resolver = CertificateResolver::new(settings).await.unwrap();

        let result = resolver.resolve_certificate("not-admitted.com").await;
        assert!(matches!(result, Err(AcmeError::Admission(_))));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}

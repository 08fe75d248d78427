//! Configuration loaded from TOML, with `serde(default = "...")` fallbacks
//! per field, scoped to what this crate actually needs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            acme: AcmeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults (with a
    /// warning) if the file is missing or fails to parse, rather than
    /// treating a missing config file as fatal.
    pub async fn load(path: &std::path::Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse configuration, using defaults");
                    Config::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "no configuration file found, using defaults");
                Config::default()
            }
        }
    }
}

fn default_tls_bind() -> String {
    "0.0.0.0:443".to_string()
}

fn default_http_bind() -> String {
    "0.0.0.0:80".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_tls_bind")]
    pub tls_bind: String,
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tls_bind: default_tls_bind(),
            http_bind: default_http_bind(),
        }
    }
}

/// Whether we're running under a test harness — switches the ACME
/// directory to staging and pins the cache dir to `/tmp/ong_acme`, so tests
/// never hit the real Let's Encrypt endpoint or pollute a developer's home
/// directory.
fn running_in_tests() -> bool {
    std::env::var("ONG_RUNNING_IN_TESTS")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

fn default_acme_directory_url() -> String {
    if running_in_tests() {
        crate::acme::LETS_ENCRYPT_STAGING.to_string()
    } else {
        crate::acme::LETS_ENCRYPT_PRODUCTION.to_string()
    }
}

/// The OS-dependent "user config directory", without pulling in a
/// dedicated crate for what's a one-line lookup: `%APPDATA%` on Windows,
/// `$XDG_CONFIG_HOME` (falling back to `~/.config`) elsewhere.
fn user_config_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
    }
}

/// Cache root resolution order: the user's config directory, then
/// `/dev/shm`, then `/tmp`, with `ong_acme` appended — unconditionally
/// `/tmp/ong_acme` under a test harness so tests never touch a developer's
/// real config directory.
fn default_cache_dir() -> PathBuf {
    if running_in_tests() {
        return PathBuf::from("/tmp/ong_acme");
    }
    if let Some(dir) = user_config_dir() {
        return dir.join("ong_acme");
    }
    if std::path::Path::new("/dev/shm").is_dir() {
        return PathBuf::from("/dev/shm/ong_acme");
    }
    PathBuf::from("/tmp/ong_acme")
}

/// Recognised ACME configuration: the admitted host list, the contact
/// email, and the ACME directory URL. `cache_dir` is a crate-internal
/// override, primarily useful in tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    #[serde(default)]
    pub tls_hosts: Vec<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_acme_directory_url")]
    pub acme_directory_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            tls_hosts: Vec::new(),
            email: String::new(),
            acme_directory_url: default_acme_directory_url(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_binds() {
        let config = Config::default();
        assert_eq!(config.server.tls_bind, "0.0.0.0:443");
        assert_eq!(config.server.http_bind, "0.0.0.0:80");
        assert_eq!(config.acme.acme_directory_url, crate::acme::LETS_ENCRYPT_PRODUCTION);
    }

    #[test]
    fn parses_partial_toml_with_defaults_filled_in() {
        let toml_text = r#"
            [acme]
            tls_hosts = ["example.com", "*.example.com"]
            email = "ops@example.com"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.acme.tls_hosts, vec!["example.com", "*.example.com"]);
        assert_eq!(config.acme.email, "ops@example.com");
        assert_eq!(config.acme.acme_directory_url, crate::acme::LETS_ENCRYPT_PRODUCTION);
        assert_eq!(config.server.tls_bind, "0.0.0.0:443");
    }

    #[tokio::test]
    async fn load_falls_back_to_defaults_when_file_missing() {
        let path = std::env::temp_dir().join("fortify-test-missing-config.toml");
        let config = Config::load(&path).await;
        assert_eq!(config.server.tls_bind, "0.0.0.0:443");
    }
}

//! Registry configuration

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use storage::StorageConfig;

use crate::auth::{AllowAll, AuthGate, StaticTokens, TokenGrant};

/// Everything needed to run a registry, usually read from a TOML file.
///
/// ```toml
/// bucket = "registry"
/// endpoint = "registry.example.com"
/// session-max-age-secs = 3600
///
/// [storage]
/// driver = "local"
/// path = "/var/lib/registry"
///
/// [[tokens]]
/// token = "s3cret"
/// repositories = ["library/*"]
/// actions = ["pull", "push"]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Storage backend
    pub storage: StorageConfig,

    /// Bucket all registry data lives in
    pub bucket: String,

    /// Public host name. Upload locations are absolute URLs on this host when set.
    pub endpoint: Option<String>,

    /// Upload sessions idle for longer than this are reaped.
    pub session_max_age_secs: u64,

    /// How often to look for idle sessions.
    pub sweep_interval_secs: u64,

    /// Deadline for a single protocol operation. Unbounded when unset.
    pub io_timeout_secs: Option<u64>,

    /// Largest request body accepted, in bytes.
    pub max_body_size: usize,

    /// Access tokens. When empty, every request is allowed.
    pub tokens: Vec<TokenGrant>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            bucket: "registry".to_owned(),
            endpoint: None,
            session_max_age_secs: 60 * 60,
            sweep_interval_secs: 60,
            io_timeout_secs: None,
            max_body_size: 64 * 1024 * 1024,
            tokens: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// See [`RegistryConfig::session_max_age_secs`].
    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    /// See [`RegistryConfig::sweep_interval_secs`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// See [`RegistryConfig::io_timeout_secs`].
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }

    /// The auth gate described by `tokens`.
    pub fn auth(&self) -> Arc<dyn AuthGate> {
        if self.tokens.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(StaticTokens::new(self.tokens.iter().cloned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: RegistryConfig = toml_edit::de::from_str("").unwrap();
        assert_eq!(config.bucket, "registry");
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.session_max_age(), Duration::from_secs(3600));
        assert_eq!(config.io_timeout(), None);
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn full_config() {
        let config: RegistryConfig = toml_edit::de::from_str(
            r#"
            bucket = "blobs"
            endpoint = "registry.example.com"
            session-max-age-secs = 120
            io-timeout-secs = 30

            [storage]
            driver = "local"
            path = "/var/lib/registry"

            [[tokens]]
            token = "s3cret"
            repositories = ["library/*"]
            actions = ["pull"]
            "#,
        )
        .unwrap();

        assert_eq!(config.bucket, "blobs");
        assert_eq!(config.endpoint.as_deref(), Some("registry.example.com"));
        assert_eq!(config.session_max_age(), Duration::from_secs(120));
        assert_eq!(config.io_timeout(), Some(Duration::from_secs(30)));
        assert!(
            matches!(&config.storage, StorageConfig::Local { path } if path == "/var/lib/registry")
        );
        assert_eq!(config.tokens.len(), 1);
        assert_eq!(config.tokens[0].repositories, vec!["library/*".to_owned()]);
    }
}

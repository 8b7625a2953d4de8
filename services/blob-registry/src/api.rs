//! API server builder and router

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Json;
use axum::routing::get;
use serde_json::json;
use storage::{MemoryStorage, StorageError};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::auth::{AllowAll, AuthGate};
use crate::config::RegistryConfig;
use crate::protocol::BlobProtocol;
use crate::store::BlobStore;
use crate::upload::UploadManager;

/// Sent with every response.
pub const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

const DEFAULT_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Registry builder for configuring and creating the registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    auth: Option<Arc<dyn AuthGate>>,
    endpoint: Option<String>,
    io_timeout: Option<Duration>,
    max_body_size: Option<usize>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder with every setting taken from `config`, including storage.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, StorageError> {
        Ok(Self::new()
            .storage(config.storage.clone().build()?)
            .bucket(config.bucket.clone())
            .auth(config.auth())
            .endpoint(config.endpoint.clone())
            .io_timeout(config.io_timeout())
            .max_body_size(config.max_body_size))
    }

    /// Set the storage backend. Defaults to in-memory storage.
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the gate every request must pass. Defaults to [`AllowAll`].
    pub fn auth(mut self, auth: Arc<dyn AuthGate>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Public host name used for absolute upload locations.
    pub fn endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Deadline for each protocol operation.
    pub fn io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Largest request body accepted.
    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = Some(limit);
        self
    }

    /// Build the registry, keeping hold of its upload sessions.
    pub fn registry(self) -> Registry {
        let storage = self
            .storage
            .unwrap_or_else(|| MemoryStorage::new().into());
        let bucket = self.bucket.unwrap_or_else(|| "registry".to_string());
        let auth = self.auth.unwrap_or_else(|| Arc::new(AllowAll));

        let uploads = UploadManager::new(BlobStore::new(storage.bucket(bucket)));
        let protocol = BlobProtocol::new(uploads, auth)
            .endpoint(self.endpoint)
            .io_timeout(self.io_timeout);

        Registry {
            protocol,
            max_body_size: self.max_body_size.unwrap_or(DEFAULT_BODY_LIMIT),
        }
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        self.registry().router()
    }
}

/// A built registry.
#[derive(Debug, Clone)]
pub struct Registry {
    protocol: BlobProtocol,
    max_body_size: usize,
}

impl Registry {
    /// Upload session manager, for background maintenance.
    pub fn uploads(&self) -> &UploadManager {
        self.protocol.uploads()
    }

    /// The HTTP routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2/", get(api_version_check))
            .merge(crate::blob::router())
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(SetResponseHeaderLayer::overriding(
                API_VERSION,
                HeaderValue::from_static("registry/2.0"),
            ))
            .with_state(self.protocol.clone())
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let registry = RegistryBuilder::new()
            .storage(storage.into())
            .bucket("test")
            .registry();

        assert_eq!(registry.uploads().active_sessions(), 0);
        let _router = registry.router();
    }

    #[test]
    fn test_builder_from_config() {
        let config = RegistryConfig::default();
        let _router = RegistryBuilder::from_config(&config).unwrap().build();
    }
}

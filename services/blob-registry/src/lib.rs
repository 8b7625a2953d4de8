//! # Blob Registry
//!
//! The blob half of an OCI container registry, following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//!
//! ## Features
//!
//! - Content-addressable blob storage with digest verification
//! - Resumable, chunked uploads with idle session expiry
//! - Single-request uploads
//! - Pluggable storage backend via the `storage` crate
//! - Pluggable authorization via [`AuthGate`]
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use blob_registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
pub mod auth;
mod blob;
mod config;
pub mod digest;
mod error;
pub mod protocol;
mod repository;
mod store;
pub mod upload;

pub use api::{API_VERSION, Registry, RegistryBuilder};
pub use auth::{AllowAll, AuthGate, StaticTokens, TokenGrant};
pub use blob::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};
pub use config::RegistryConfig;
pub use digest::{Algorithm, Digest, DigestError};
pub use error::{ErrorCode, ErrorDescriptor, ErrorEntry, ErrorEnvelope, RegistryError, RegistryResult};
pub use protocol::BlobProtocol;
pub use repository::Repository;
pub use store::{Blob, BlobStore};
pub use upload::{SessionId, SessionState, UploadManager, UploadSession};

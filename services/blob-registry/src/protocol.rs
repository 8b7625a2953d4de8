//! Blob protocol operations, independent of the HTTP layer.
//!
//! Requests arrive as plain values carrying the raw strings the client sent,
//! so that authorization always runs before anything is parsed or touched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::Instrument;

use crate::auth::{Action, AuthGate, AuthRequest, Authorization};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::repository::Repository;
use crate::store::{Blob, BlobStore};
use crate::upload::{SessionId, UploadManager};

/// The `Range` header value acknowledging `offset` staged bytes.
///
/// Ranges are inclusive, so an empty upload reports `bytes=0-0`.
pub fn range_header(offset: u64) -> String {
    format!("bytes=0-{}", offset.saturating_sub(1))
}

/// Parse a chunk's `Content-Range` into inclusive `(start, end)` offsets.
///
/// Accepts `start-end`, `bytes=start-end` and `bytes start-end/total`.
pub fn parse_content_range(value: &str) -> RegistryResult<(u64, u64)> {
    let invalid =
        || RegistryError::BlobUploadInvalid(format!("malformed content range {value:?}"));

    let range = value.trim();
    let range = range
        .strip_prefix("bytes=")
        .or_else(|| range.strip_prefix("bytes "))
        .unwrap_or(range);
    let range = range.split_once('/').map_or(range, |(range, _)| range);

    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;

    if end < start {
        return Err(invalid());
    }

    Ok((start, end))
}

/// A single protocol request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Raw `Authorization` header
    pub authorization: Option<String>,
    /// Repository namespace, unvalidated
    pub namespace: String,
    /// Repository name, unvalidated
    pub repository: String,
    /// The operation
    pub op: BlobRequest,
}

/// Blob operations.
#[derive(Debug, Clone)]
pub enum BlobRequest {
    /// Does the blob exist, and how big is it?
    Check {
        /// Digest text
        digest: String,
    },

    /// Download a blob.
    Fetch {
        /// Digest text
        digest: String,
    },

    /// Open an upload session. With a digest, `body` is the whole blob and
    /// is committed at once.
    StartUpload {
        /// Digest text for a single-request upload
        digest: Option<String>,
        /// Blob content for a single-request upload
        body: Bytes,
    },

    /// How much of an upload has been received?
    Status {
        /// Session id text
        session: String,
    },

    /// Append a chunk.
    Chunk {
        /// Session id text
        session: String,
        /// `Content-Range`, if the client sent one
        range: Option<String>,
        /// Chunk bytes
        body: Bytes,
    },

    /// Append any trailing bytes and commit.
    Finalize {
        /// Session id text
        session: String,
        /// Digest text the content must match
        digest: String,
        /// Trailing bytes, often empty
        body: Bytes,
    },

    /// Discard an upload.
    Abort {
        /// Session id text
        session: String,
    },
}

impl BlobRequest {
    /// The access the operation needs.
    pub fn action(&self) -> Action {
        match self {
            BlobRequest::Check { .. } | BlobRequest::Fetch { .. } => Action::Pull,
            _ => Action::Push,
        }
    }
}

/// Where an upload stands, as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    /// Session id
    pub session: SessionId,
    /// URL the client continues the upload at
    pub location: String,
    /// Bytes received so far
    pub offset: u64,
}

/// Successful protocol responses.
#[derive(Debug, Clone)]
pub enum BlobResponse {
    /// The blob exists.
    Found(Blob),

    /// Blob content.
    Content {
        /// The blob
        blob: Blob,
        /// Its bytes
        data: Bytes,
    },

    /// Upload session opened, or chunk accepted.
    Accepted(UploadProgress),

    /// Current upload progress.
    Status(UploadProgress),

    /// Blob committed.
    Created {
        /// The committed blob
        blob: Blob,
        /// URL the blob can be fetched from
        location: String,
    },

    /// Upload discarded.
    Deleted,
}

/// Carries out blob protocol requests.
#[derive(Clone)]
pub struct BlobProtocol {
    uploads: UploadManager,
    auth: Arc<dyn AuthGate>,
    endpoint: Option<String>,
    io_timeout: Option<Duration>,
}

impl fmt::Debug for BlobProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobProtocol")
            .field("endpoint", &self.endpoint)
            .field("io_timeout", &self.io_timeout)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl BlobProtocol {
    /// Create a protocol handler over `uploads`, asking `auth` about every request.
    pub fn new(uploads: UploadManager, auth: Arc<dyn AuthGate>) -> Self {
        Self {
            uploads,
            auth,
            endpoint: None,
            io_timeout: None,
        }
    }

    /// Host that upload locations are made absolute against.
    pub fn endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Deadline for each operation.
    pub fn io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// The upload sessions this handler manages.
    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    fn store(&self) -> &BlobStore {
        self.uploads.store()
    }

    /// Handle one request.
    #[tracing::instrument(
        skip_all,
        fields(
            namespace = %request.namespace,
            repository = %request.repository,
            action = %request.op.action(),
        )
    )]
    pub async fn handle(&self, request: Request) -> RegistryResult<BlobResponse> {
        let name = format!("{}/{}", request.namespace, request.repository);
        let Authorization { allowed, .. } = self
            .auth
            .authorize(&AuthRequest {
                action: request.op.action(),
                repository: &name,
                credentials: request.authorization.as_deref(),
            })
            .await;

        if !allowed {
            return Err(RegistryError::Unauthorized(format!(
                "{} access to {name} denied",
                request.op.action()
            )));
        }

        let repository = Repository::new(request.namespace, request.repository)?;

        match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, self.dispatch(repository, request.op))
                .await
                .map_err(|_| RegistryError::Timeout(limit))?,
            None => self.dispatch(repository, request.op).await,
        }
    }

    async fn dispatch(
        &self,
        repository: Repository,
        op: BlobRequest,
    ) -> RegistryResult<BlobResponse> {
        match op {
            BlobRequest::Check { digest } => {
                let blob = self.store().stat(&digest.parse()?).await?;
                Ok(BlobResponse::Found(blob))
            }
            BlobRequest::Fetch { digest } => {
                let digest: Digest = digest.parse()?;
                let blob = self.store().stat(&digest).await?;
                let data = self.store().get(&digest).await?;
                Ok(BlobResponse::Content { blob, data })
            }
            BlobRequest::StartUpload { digest: None, .. } => {
                let session = self.uploads.create_session(repository.clone()).await?;
                Ok(BlobResponse::Accepted(self.progress(&repository, session, 0)))
            }
            BlobRequest::StartUpload {
                digest: Some(digest),
                body,
            } => self.monolithic(repository, &digest.parse()?, body).await,
            BlobRequest::Status { session } => {
                let session = self.owned_session(&repository, &session).await?;
                let offset = self.uploads.status(&session).await?;
                Ok(BlobResponse::Status(self.progress(&repository, session, offset)))
            }
            BlobRequest::Chunk {
                session,
                range,
                body,
            } => {
                let session = self.owned_session(&repository, &session).await?;
                let offset = match range {
                    Some(range) => {
                        let (start, end) = parse_content_range(&range)?;
                        let spans = (end - start).checked_add(1);
                        if !body.is_empty() && spans != Some(body.len() as u64) {
                            return Err(RegistryError::BlobUploadInvalid(format!(
                                "content range {range:?} does not match {} byte body",
                                body.len()
                            )));
                        }
                        self.uploads.append_chunk(&session, start, body).await?
                    }
                    None => self.uploads.append(&session, body).await?,
                };
                Ok(BlobResponse::Accepted(self.progress(&repository, session, offset)))
            }
            BlobRequest::Finalize {
                session,
                digest,
                body,
            } => {
                let digest: Digest = digest.parse()?;
                let session = self.owned_session(&repository, &session).await?;
                if !body.is_empty() {
                    self.uploads.append(&session, body).await?;
                }
                let blob = self.uploads.commit(&session, &digest).await?;
                Ok(self.created(&repository, blob))
            }
            BlobRequest::Abort { session } => {
                let session = self.owned_session(&repository, &session).await?;
                self.uploads.abort(&session).await?;
                Ok(BlobResponse::Deleted)
            }
        }
    }

    /// Upload a whole blob in one request.
    async fn monolithic(
        &self,
        repository: Repository,
        digest: &Digest,
        body: Bytes,
    ) -> RegistryResult<BlobResponse> {
        let session = self.uploads.create_session(repository.clone()).await?;
        let pending = PendingUpload {
            uploads: self.uploads.clone(),
            session: Some(session),
        };

        let committed = async {
            self.uploads.append(&session, body).await?;
            self.uploads.commit(&session, digest).await
        }
        .await;

        let response = match committed {
            Ok(blob) => Ok(self.created(&repository, blob)),
            Err(error) => {
                // The client never learned this session's id.
                if let Err(abort) = self.uploads.abort(&session).await {
                    tracing::warn!(%session, error = %abort, "unable to discard failed upload");
                }
                Err(error)
            }
        };
        pending.settle();
        response
    }

    /// Resolve a session id, which must belong to `repository`.
    async fn owned_session(
        &self,
        repository: &Repository,
        session: &str,
    ) -> RegistryResult<SessionId> {
        let id: SessionId = session.parse()?;
        let owner = self.uploads.session(&id).await?.repository;
        if &owner != repository {
            tracing::debug!(%id, %owner, "session belongs to another repository");
            return Err(RegistryError::SessionNotFound(session.to_owned()));
        }
        Ok(id)
    }

    fn location(&self, path: String) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("https://{endpoint}{path}"),
            None => path,
        }
    }

    fn progress(
        &self,
        repository: &Repository,
        session: SessionId,
        offset: u64,
    ) -> UploadProgress {
        UploadProgress {
            session,
            location: self.location(format!("/v2/{repository}/blobs/uploads/{session}")),
            offset,
        }
    }

    fn created(&self, repository: &Repository, blob: Blob) -> BlobResponse {
        let location = self.location(format!("/v2/{repository}/blobs/{}", blob.digest));
        BlobResponse::Created { blob, location }
    }
}

/// The session behind a single-request upload, discarded in the background if
/// the request is dropped before the upload settles.
#[derive(Debug)]
struct PendingUpload {
    uploads: UploadManager,
    session: Option<SessionId>,
}

impl PendingUpload {
    fn settle(mut self) {
        self.session = None;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%session, "no runtime left to discard abandoned upload");
            return;
        };

        let uploads = self.uploads.clone();
        runtime.spawn(
            async move {
                match uploads.abort(&session).await {
                    Ok(()) => tracing::debug!(%session, "discarded abandoned upload"),
                    // A commit left running by the request got there first.
                    Err(error) => tracing::debug!(%session, %error, "abandoned upload settled"),
                }
            }
            .in_current_span(),
        );
    }
}

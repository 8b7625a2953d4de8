//! HTTP routes for blob operations
//!
//! Each handler turns the HTTP request into a [`protocol::Request`] and the
//! result back into a response. All decisions are made by [`BlobProtocol`].

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use serde::Deserialize;

use crate::error::RegistryResult;
use crate::protocol::{self, BlobProtocol, BlobRequest, BlobResponse, UploadProgress};

/// Digest of the blob in a response.
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

/// Upload session id in a response.
pub const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

const OCTET_STREAM: &str = "application/octet-stream";

/// Router for blob operations
pub fn router() -> Router<BlobProtocol> {
    Router::new()
        .route(
            "/v2/{namespace}/{repository}/blobs/{digest}",
            get(fetch_blob).head(check_blob),
        )
        .route(
            "/v2/{namespace}/{repository}/blobs/uploads/",
            post(start_upload),
        )
        .route(
            "/v2/{namespace}/{repository}/blobs/uploads/{session}",
            get(upload_status)
                .patch(upload_chunk)
                .put(finalize_upload)
                .delete(abort_upload),
        )
}

#[derive(Debug, Deserialize)]
struct DigestQuery {
    digest: Option<String>,
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

fn request(
    headers: &HeaderMap,
    namespace: String,
    repository: String,
    op: BlobRequest,
) -> protocol::Request {
    protocol::Request {
        authorization: header_value(headers, header::AUTHORIZATION),
        namespace,
        repository,
        op,
    }
}

/// Check if a blob exists
async fn check_blob(
    State(protocol): State<BlobProtocol>,
    Path((namespace, repository, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<BlobResponse> {
    let op = BlobRequest::Check { digest };
    protocol
        .handle(request(&headers, namespace, repository, op))
        .await
}

/// Download a blob
async fn fetch_blob(
    State(protocol): State<BlobProtocol>,
    Path((namespace, repository, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<BlobResponse> {
    let op = BlobRequest::Fetch { digest };
    protocol
        .handle(request(&headers, namespace, repository, op))
        .await
}

/// Start an upload, or upload a whole blob when `?digest=` is given
async fn start_upload(
    State(protocol): State<BlobProtocol>,
    Path((namespace, repository)): Path<(String, String)>,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<BlobResponse> {
    let op = BlobRequest::StartUpload {
        digest: query.digest,
        body,
    };
    protocol
        .handle(request(&headers, namespace, repository, op))
        .await
}

async fn upload_status(
    State(protocol): State<BlobProtocol>,
    Path((namespace, repository, session)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<BlobResponse> {
    let op = BlobRequest::Status { session };
    protocol
        .handle(request(&headers, namespace, repository, op))
        .await
}

async fn upload_chunk(
    State(protocol): State<BlobProtocol>,
    Path((namespace, repository, session)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<BlobResponse> {
    let op = BlobRequest::Chunk {
        session,
        range: header_value(&headers, header::CONTENT_RANGE),
        body,
    };
    protocol
        .handle(request(&headers, namespace, repository, op))
        .await
}

/// Complete an upload
async fn finalize_upload(
    State(protocol): State<BlobProtocol>,
    Path((namespace, repository, session)): Path<(String, String, String)>,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<BlobResponse> {
    // An empty digest fails to parse, after authorization has had its say.
    let op = BlobRequest::Finalize {
        session,
        digest: query.digest.unwrap_or_default(),
        body,
    };
    protocol
        .handle(request(&headers, namespace, repository, op))
        .await
}

/// Cancel an upload
async fn abort_upload(
    State(protocol): State<BlobProtocol>,
    Path((namespace, repository, session)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<BlobResponse> {
    let op = BlobRequest::Abort { session };
    protocol
        .handle(request(&headers, namespace, repository, op))
        .await
}

fn progress_response(status: StatusCode, progress: UploadProgress) -> Response {
    (
        status,
        [
            (header::LOCATION, progress.location),
            (header::RANGE, protocol::range_header(progress.offset)),
            (DOCKER_UPLOAD_UUID, progress.session.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

impl IntoResponse for BlobResponse {
    fn into_response(self) -> Response {
        match self {
            BlobResponse::Found(blob) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, OCTET_STREAM.to_owned()),
                    (header::CONTENT_LENGTH, blob.size.to_string()),
                    (DOCKER_CONTENT_DIGEST, blob.digest.to_string()),
                ],
            )
                .into_response(),
            BlobResponse::Content { blob, data } => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, OCTET_STREAM.to_owned()),
                    (DOCKER_CONTENT_DIGEST, blob.digest.to_string()),
                ],
                data,
            )
                .into_response(),
            BlobResponse::Accepted(progress) => progress_response(StatusCode::ACCEPTED, progress),
            BlobResponse::Status(progress) => progress_response(StatusCode::NO_CONTENT, progress),
            BlobResponse::Created { blob, location } => (
                StatusCode::CREATED,
                [
                    (header::LOCATION, location),
                    (DOCKER_CONTENT_DIGEST, blob.digest.to_string()),
                    (header::CONTENT_LENGTH, "0".to_owned()),
                ],
            )
                .into_response(),
            BlobResponse::Deleted => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

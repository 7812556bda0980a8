use crate::auth::Auth;
use crate::error::{ok, ApiError, Envelope};
use crate::AppState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway::{BatchCopyOutcome, CopyItem, CopyJobOptions};
use models::Error;
use storage::{OpContext, StreamDescriptor, UploadBody};
use tokio_util::io::ReaderStream;

#[derive(Debug, serde::Deserialize)]
pub struct PathQuery {
    pub path: String,
    /// Accepted for compatibility; listings are always fresh.
    #[serde(default)]
    #[allow(dead_code)]
    pub refresh: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Auth(principal): Auth,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let token = headers.get("x-fs-path-token").and_then(|v| v.to_str().ok());
    let ctx = OpContext::default();
    let listing = state.fs.list(&principal, &query.path, token, &ctx).await?;
    Ok(ok(listing))
}

pub async fn get(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let info = state.fs.stat(&principal, &query.path, &ctx).await?;
    Ok(ok(info))
}

#[derive(Debug, serde::Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

pub async fn search(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let hits = state.fs.search(&principal, &query.q, &ctx).await?;
    Ok(ok(hits))
}

/// One parsed `Range: bytes=` header: a single inclusive window.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ByteRange {
    From(u64),
    Window(u64, u64),
    Suffix(u64),
}

pub(crate) fn parse_range(header: &str) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?.trim();
    // Multi-range requests fall back to the full body.
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    match (start.is_empty(), end.is_empty()) {
        (true, false) => end.parse().ok().map(ByteRange::Suffix),
        (false, true) => start.parse().ok().map(ByteRange::From),
        (false, false) => {
            let (start, end) = (start.parse().ok()?, end.parse().ok()?);
            (start <= end).then_some(ByteRange::Window(start, end))
        }
        (true, true) => None,
    }
}

fn content_headers(descriptor: &StreamDescriptor) -> Vec<(header::HeaderName, String)> {
    let mut headers = vec![(header::ACCEPT_RANGES, "bytes".to_string())];
    headers.push((
        header::CONTENT_TYPE,
        descriptor.content_type.clone().unwrap_or_else(|| "application/octet-stream".into()),
    ));
    if let Some(etag) = &descriptor.etag {
        headers.push((header::ETAG, format!("\"{etag}\"")));
    }
    if let Some(modified) = descriptor.last_modified {
        headers.push((header::LAST_MODIFIED, modified.to_rfc2822()));
    }
    headers
}

/// Stream file content, honoring a single-range request with 206. When the
/// backend ignores the range, the descriptor slices the full stream, so
/// the client still sees exactly the requested window.
pub async fn download(
    State(state): State<AppState>,
    Auth(principal): Auth,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let ctx = OpContext::default();
    let (descriptor, _target) = state.fs.download(&principal, &query.path, &ctx).await?;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    let mut builder = Response::builder();
    for (name, value) in content_headers(&descriptor) {
        builder = builder.header(name, value);
    }

    match (range, descriptor.size) {
        (Some(range), Some(size)) => {
            let (start, end) = match range {
                ByteRange::From(start) => (start, size.saturating_sub(1)),
                ByteRange::Window(start, end) => (start, end.min(size.saturating_sub(1))),
                ByteRange::Suffix(len) => (size.saturating_sub(len), size.saturating_sub(1)),
            };
            if start >= size {
                let resp = builder
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                    .body(Body::empty())
                    .map_err(Error::internal)?;
                return Ok(resp);
            }
            let reader = descriptor.open_range(start, Some(end), &ctx.cancel).await?;
            let resp = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
                .header(header::CONTENT_LENGTH, end - start + 1)
                .body(Body::from_stream(ReaderStream::new(reader)))
                .map_err(Error::internal)?;
            Ok(resp)
        }
        _ => {
            if let Some(size) = descriptor.size {
                builder = builder.header(header::CONTENT_LENGTH, size);
            }
            let reader = descriptor.open_full(&ctx.cancel).await?;
            let resp = builder
                .status(StatusCode::OK)
                .body(Body::from_stream(ReaderStream::new(reader)))
                .map_err(Error::internal)?;
            Ok(resp)
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLinkQuery {
    pub path: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub force_download: Option<bool>,
}

pub async fn file_link(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(query): Query<FileLinkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let link = state
        .fs
        .file_link(
            &principal,
            &query.path,
            query.expires_in,
            query.force_download.unwrap_or(false),
        )
        .await?;
    Ok(ok(link))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub path: String,
    #[serde(default)]
    pub overwrite: Option<bool>,
}

pub async fn upload(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let stream = body.into_data_stream();
    let reader = tokio_util::io::StreamReader::new(futures::TryStreamExt::map_err(
        stream,
        |err| std::io::Error::new(std::io::ErrorKind::Other, err),
    ));
    let result = state
        .fs
        .write(
            &principal,
            &query.path,
            UploadBody::Stream { reader: Box::pin(reader), size },
            query.overwrite.unwrap_or(true),
            &ctx,
        )
        .await?;
    Ok(ok(result))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MkdirBody {
    pub path: String,
}

pub async fn mkdir(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<MkdirBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let created = state.fs.create_directory(&principal, &body.path, &ctx).await?;
    Ok(ok(created))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameBody {
    pub old_path: String,
    pub new_path: String,
}

pub async fn rename(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<RenameBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let renamed = state.fs.rename(&principal, &body.old_path, &body.new_path, &ctx).await?;
    Ok(ok(renamed))
}

#[derive(Debug, serde::Deserialize)]
pub struct BatchRemoveBody {
    pub paths: Vec<String>,
}

pub async fn batch_remove(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<BatchRemoveBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.paths.is_empty() {
        return Err(ApiError(Error::Validation("paths must not be empty".into())));
    }
    let ctx = OpContext::default();
    let removed = state.fs.batch_delete(&principal, &body.paths, &ctx).await?;
    Ok(ok(removed))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCopyBody {
    pub items: Vec<CopyItem>,
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

pub async fn batch_copy(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<BatchCopyBody>,
) -> Result<Json<Envelope<BatchCopyOutcome>>, ApiError> {
    let ctx = OpContext::default();
    let outcome = state
        .jobs
        .batch_copy(
            &principal,
            body.items,
            CopyJobOptions {
                skip_existing: body.skip_existing,
                max_concurrency: body.max_concurrency,
            },
            &ctx,
        )
        .await?;
    Ok(ok(outcome))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFile {
    pub target_path: String,
    pub s3_path: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCopyCommitBody {
    pub target_mount_id: String,
    pub files: Vec<CommitFile>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub target_path: String,
    pub success: bool,
}

pub async fn batch_copy_commit(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<BatchCopyCommitBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let files: Vec<(String, String)> =
        body.files.into_iter().map(|f| (f.target_path, f.s3_path)).collect();
    let committed = state
        .fs
        .commit_batch_copy(&principal, &body.target_mount_id, &files, &ctx)
        .await?;
    Ok(ok(committed
        .into_iter()
        .map(|(target_path, success)| CommitResult { target_path, success })
        .collect::<Vec<_>>()))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignUploadBody {
    pub path: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

pub async fn presign_upload(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<PresignUploadBody>,
) -> Result<impl IntoResponse, ApiError> {
    let presigned =
        state.fs.presign_upload(&principal, &body.path, body.expires_in).await?;
    Ok(ok(presigned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-0"), Some(ByteRange::Window(0, 0)));
        assert_eq!(parse_range("bytes=6-10"), Some(ByteRange::Window(6, 10)));
        assert_eq!(parse_range("bytes=5-"), Some(ByteRange::From(5)));
        assert_eq!(parse_range("bytes=-4"), Some(ByteRange::Suffix(4)));
        assert_eq!(parse_range("bytes=10-5"), None);
        assert_eq!(parse_range("bytes=0-0,5-9"), None);
        assert_eq!(parse_range("items=0-1"), None);
        assert_eq!(parse_range("bytes=-"), None);
    }
}

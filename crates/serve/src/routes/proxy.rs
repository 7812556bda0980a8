use crate::error::ApiError;
use crate::routes::fs::{parse_range, ByteRange};
use crate::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use gateway::ProxyQuery;
use models::Error;
use storage::OpContext;
use tokio_util::io::ReaderStream;

#[derive(Debug, serde::Deserialize)]
pub struct ProxyParams {
    pub sign: String,
    pub ts: i64,
    #[serde(default)]
    pub download: Option<String>,
}

/// The signed public gateway: `GET /api/p/<virtual-path>?sign=&ts=`.
/// The signature authorizes the request; no principal is involved.
pub async fn proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<ProxyParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let virtual_path = format!("/{path}");
    let query = ProxyQuery { sign: params.sign.clone(), ts: params.ts };
    let target = state.fs.verify_proxy(&virtual_path, &query).await?;

    let ctx = OpContext::default();
    let descriptor = target.driver.download(&target.subpath, &ctx).await?;

    let mut builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_TYPE,
            descriptor.content_type.clone().unwrap_or_else(|| "application/octet-stream".into()),
        );
    if let Some(etag) = &descriptor.etag {
        builder = builder.header(header::ETAG, format!("\"{etag}\""));
    }
    if matches!(params.download.as_deref(), Some("1") | Some("true")) {
        let name = vpath::file_name(&virtual_path);
        builder = builder
            .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\""));
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    match (range, descriptor.size) {
        (Some(range), Some(size)) => {
            let (start, end) = match range {
                ByteRange::From(start) => (start, size.saturating_sub(1)),
                ByteRange::Window(start, end) => (start, end.min(size.saturating_sub(1))),
                ByteRange::Suffix(len) => (size.saturating_sub(len), size.saturating_sub(1)),
            };
            if start >= size {
                return Ok(builder
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                    .body(Body::empty())
                    .map_err(Error::internal)?);
            }
            let reader = descriptor.open_range(start, Some(end), &ctx.cancel).await?;
            Ok(builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
                .header(header::CONTENT_LENGTH, end - start + 1)
                .body(Body::from_stream(ReaderStream::new(reader)))
                .map_err(Error::internal)?)
        }
        _ => {
            if let Some(size) = descriptor.size {
                builder = builder.header(header::CONTENT_LENGTH, size);
            }
            let reader = descriptor.open_full(&ctx.cancel).await?;
            Ok(builder
                .status(StatusCode::OK)
                .body(Body::from_stream(ReaderStream::new(reader)))
                .map_err(Error::internal)?)
        }
    }
}

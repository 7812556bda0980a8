mod xml;

use crate::descriptor::{ByteReader, CancellableReader, RangedReader, StreamDescriptor, StreamSource};
use crate::driver::{
    BatchDeleteResult, Capability, CopyOptions, CopyResult, CopyStatus, CreateDirResult,
    DeleteFailure, Listing, OpContext, RenameResult, StorageDriver, UploadBody, UploadResult,
};
use futures::TryStreamExt;
use models::{DirEntry, DriverKind, Error, FileInfo};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE};
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;
pub use xml::DavResource;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop>
<D:displayname/><D:getcontentlength/><D:getlastmodified/>
<D:getetag/><D:getcontenttype/><D:resourcetype/>
</D:prop></D:propfind>"#;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebdavConfig {
    /// Base collection URL, e.g. `https://dav.example.com/remote.php/dav/files/user/`.
    pub endpoint: String,
    pub username: String,
    /// Decrypted on init and cached in memory only.
    pub password: String,
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: std::time::Duration,
}

fn default_connect_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(10)
}

/// WebDAV backend: PROPFIND listings, GET/PUT content, MOVE/COPY, MKCOL.
#[derive(Debug)]
pub struct WebdavDriver {
    http: reqwest::Client,
    endpoint: Url,
    username: String,
    password: String,
}

fn status_error(context: &str, status: StatusCode) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(context.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Forbidden(format!("webdav rejected credentials ({context})"))
        }
        StatusCode::CONFLICT => Error::Conflict(context.to_string()),
        other => Error::upstream(other.as_u16(), None, context.to_string()),
    }
}

fn propfind() -> Method {
    Method::from_bytes(b"PROPFIND").expect("static method name")
}

impl WebdavDriver {
    pub const CAPABILITIES: Capability = Capability::READER
        .union(Capability::WRITER)
        .union(Capability::ATOMIC)
        .union(Capability::PROXY);

    pub fn new(config: WebdavConfig) -> Result<Self, Error> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|err| Error::Validation(format!("invalid endpoint: {err}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::Validation("endpoint must be an absolute http(s) URL".into()));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.tls_insecure)
            .build()
            .map_err(Error::internal)?;

        Ok(Self { http, endpoint, username: config.username, password: config.password })
    }

    fn url_for(&self, subpath: &str, as_dir: bool) -> Result<Url, Error> {
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Validation("endpoint cannot be a base URL".into()))?;
            segments.pop_if_empty();
            for segment in canonical.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
            if as_dir {
                segments.push("");
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http.request(method, url).basic_auth(&self.username, Some(&self.password))
    }

    async fn propfind_resources(
        &self,
        url: Url,
        depth: &str,
        context: &str,
    ) -> Result<Vec<DavResource>, Error> {
        let resp = self
            .request(propfind(), url)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("{context}: {err}")))?;

        let status = resp.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(status_error(context, status));
        }
        let body = resp.bytes().await.map_err(Error::internal)?;
        xml::parse_multistatus(&body)
    }

    fn entry_from(&self, resource: &DavResource) -> DirEntry {
        DirEntry {
            name: resource.name(),
            is_directory: resource.is_collection,
            size: if resource.is_collection {
                0
            } else {
                resource.content_length.unwrap_or_default()
            },
            modified: resource.last_modified,
            etag: resource.etag.clone(),
            mime: if resource.is_collection { None } else { resource.content_type.clone() },
        }
    }

    /// MKCOL every missing ancestor collection of `subpath`.
    async fn ensure_parents(&self, subpath: &str) -> Result<(), Error> {
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let segments: Vec<&str> = canonical.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() <= 1 {
            return Ok(());
        }

        let mut ancestor = String::new();
        for segment in &segments[..segments.len() - 1] {
            ancestor.push('/');
            ancestor.push_str(segment);
            let url = self.url_for(&ancestor, true)?;
            let resp = self
                .request(Method::from_bytes(b"MKCOL").expect("static method name"), url)
                .send()
                .await
                .map_err(|err| Error::upstream(0, None, format!("webdav MKCOL: {err}")))?;
            // 405: the collection already exists.
            if !resp.status().is_success() && resp.status() != StatusCode::METHOD_NOT_ALLOWED {
                return Err(status_error("webdav MKCOL", resp.status()));
            }
        }
        Ok(())
    }

    async fn delete_one(&self, subpath: &str) -> Result<(), Error> {
        let url = self.url_for(subpath, false)?;
        let resp = self
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav DELETE: {err}")))?;
        if resp.status().is_success() || resp.status() == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            Err(status_error(subpath, resp.status()))
        }
    }

    fn stat_from(&self, canonical: &str, resource: &DavResource) -> FileInfo {
        FileInfo {
            name: resource.name(),
            path: canonical.to_string(),
            is_directory: resource.is_collection,
            size: if resource.is_collection {
                0
            } else {
                resource.content_length.unwrap_or_default()
            },
            modified: resource.last_modified,
            etag: resource.etag.clone(),
            mime: if resource.is_collection { None } else { resource.content_type.clone() },
            is_virtual: false,
        }
    }
}

fn response_reader(resp: reqwest::Response, cancel: &CancellationToken) -> ByteReader {
    let stream = resp
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
    Box::pin(CancellableReader::new(
        tokio_util::io::StreamReader::new(Box::pin(stream)),
        cancel.clone(),
    ))
}

struct WebdavSource {
    http: reqwest::Client,
    url: Url,
    username: String,
    password: String,
}

#[async_trait::async_trait]
impl StreamSource for WebdavSource {
    async fn open_full(&self, cancel: &CancellationToken) -> Result<ByteReader, Error> {
        let resp = self
            .http
            .get(self.url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav GET: {err}")))?;
        if !resp.status().is_success() {
            return Err(status_error("webdav GET", resp.status()));
        }
        Ok(response_reader(resp, cancel))
    }

    async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<RangedReader, Error> {
        let range = match end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        let resp = self
            .http
            .get(self.url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header(RANGE, range)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav GET: {err}")))?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                Ok(RangedReader { reader: response_reader(resp, cancel), range_honored: true })
            }
            // Common server bug: the Range header is silently ignored.
            StatusCode::OK => {
                Ok(RangedReader { reader: response_reader(resp, cancel), range_honored: false })
            }
            other => Err(status_error("webdav GET range", other)),
        }
    }

    fn supports_range(&self) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl StorageDriver for WebdavDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Webdav
    }

    fn capabilities(&self) -> Capability {
        Self::CAPABILITIES
    }

    #[tracing::instrument(skip(self, ctx), fields(driver = "webdav"))]
    async fn list_directory(&self, subpath: &str, ctx: &OpContext) -> Result<Listing, Error> {
        ctx.check_cancelled()?;
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let url = self.url_for(subpath, true)?;
        let request_path =
            percent_encoding::percent_decode_str(url.path()).decode_utf8_lossy().into_owned();

        let resources = self.propfind_resources(url, "1", "webdav PROPFIND").await?;
        let items = resources
            .iter()
            .filter(|r| {
                // Depth-1 responses include the collection itself; skip it.
                r.decoded_path().trim_end_matches('/') != request_path.trim_end_matches('/')
            })
            .map(|r| self.entry_from(r))
            .collect();

        Ok(Listing { items, is_root: canonical == "/" })
    }

    async fn stat(&self, subpath: &str, ctx: &OpContext) -> Result<FileInfo, Error> {
        ctx.check_cancelled()?;
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let url = self.url_for(subpath, false)?;
        let resources = self.propfind_resources(url, "0", "webdav PROPFIND").await?;
        let resource = resources
            .first()
            .ok_or_else(|| Error::NotFound(subpath.to_string()))?;
        Ok(self.stat_from(&canonical, resource))
    }

    async fn download(&self, subpath: &str, ctx: &OpContext) -> Result<StreamDescriptor, Error> {
        ctx.check_cancelled()?;
        let url = self.url_for(subpath, false)?;

        // HEAD probe; recover metadata via PROPFIND when the server omits
        // Content-Length or does not implement HEAD.
        let head = self
            .request(Method::HEAD, url.clone())
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav HEAD: {err}")))?;

        let mut size = None;
        let mut content_type = None;
        let mut etag = None;
        let mut last_modified = None;

        if head.status().is_success() {
            size = head
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            content_type = head
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            etag = head
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string());
            last_modified = head
                .headers()
                .get(LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc));
        } else if head.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(subpath.to_string()));
        }

        if size.is_none() {
            let info = self.stat(subpath, ctx).await?;
            if info.is_directory {
                return Err(Error::Validation(format!("{subpath} is a directory")));
            }
            size = Some(info.size);
            content_type = content_type.or(info.mime);
            etag = etag.or(info.etag);
            last_modified = last_modified.or(info.modified);
        }

        Ok(StreamDescriptor::new(
            size,
            content_type,
            etag,
            last_modified,
            Box::new(WebdavSource {
                http: self.http.clone(),
                url,
                username: self.username.clone(),
                password: self.password.clone(),
            }),
        ))
    }

    #[tracing::instrument(skip(self, body, ctx), fields(driver = "webdav"))]
    async fn upload(
        &self,
        subpath: &str,
        body: UploadBody,
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        ctx.check_cancelled()?;
        self.ensure_parents(subpath).await?;
        let url = self.url_for(subpath, false)?;

        let mut req = self.request(Method::PUT, url);
        req = match body {
            UploadBody::Buffer(bytes) => req.body(bytes),
            UploadBody::Stream { reader, size } => {
                let reader = CancellableReader::new(reader, ctx.cancel.clone());
                let stream = tokio_util::io::ReaderStream::new(reader);
                if let Some(size) = size {
                    req = req.header(CONTENT_LENGTH, size);
                }
                req.body(reqwest::Body::wrap_stream(stream))
            }
        };

        let resp = req
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav PUT: {err}")))?;
        if !resp.status().is_success() {
            return Err(status_error("webdav PUT", resp.status()));
        }

        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        Ok(UploadResult { storage_path: canonical })
    }

    async fn create_directory(
        &self,
        subpath: &str,
        ctx: &OpContext,
    ) -> Result<CreateDirResult, Error> {
        ctx.check_cancelled()?;
        self.ensure_parents(subpath).await?;
        let url = self.url_for(subpath, true)?;
        let resp = self
            .request(Method::from_bytes(b"MKCOL").expect("static method name"), url)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav MKCOL: {err}")))?;

        match resp.status() {
            StatusCode::CREATED => Ok(CreateDirResult { already_existed: false }),
            StatusCode::METHOD_NOT_ALLOWED => Ok(CreateDirResult { already_existed: true }),
            other => Err(status_error("webdav MKCOL", other)),
        }
    }

    async fn rename(
        &self,
        old_subpath: &str,
        new_subpath: &str,
        ctx: &OpContext,
    ) -> Result<RenameResult, Error> {
        ctx.check_cancelled()?;
        let src = self.url_for(old_subpath, false)?;
        let dst = self.url_for(new_subpath, false)?;
        let resp = self
            .request(Method::from_bytes(b"MOVE").expect("static method name"), src)
            .header("Destination", dst.to_string())
            .header("Overwrite", "T")
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav MOVE: {err}")))?;
        if !resp.status().is_success() {
            return Err(status_error("webdav MOVE", resp.status()));
        }
        Ok(RenameResult {
            success: true,
            source: old_subpath.to_string(),
            target: new_subpath.to_string(),
        })
    }

    async fn copy(
        &self,
        src_subpath: &str,
        dst_subpath: &str,
        opts: &CopyOptions,
        ctx: &OpContext,
    ) -> Result<CopyResult, Error> {
        ctx.check_cancelled()?;
        if opts.precheck && opts.skip_existing && self.exists(dst_subpath, ctx).await? {
            return Ok(CopyResult {
                status: CopyStatus::Skipped,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: Some("target exists".to_string()),
            });
        }

        let src = self.url_for(src_subpath, false)?;
        let dst = self.url_for(dst_subpath, false)?;
        let resp = self
            .request(Method::from_bytes(b"COPY").expect("static method name"), src)
            .header("Destination", dst.to_string())
            .header("Overwrite", "T")
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("webdav COPY: {err}")))?;

        Ok(if resp.status().is_success() {
            CopyResult {
                status: CopyStatus::Success,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: None,
            }
        } else {
            CopyResult {
                status: CopyStatus::Failed,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: Some(format!("status {}", resp.status())),
            }
        })
    }

    async fn batch_delete(
        &self,
        subpaths: &[String],
        ctx: &OpContext,
    ) -> Result<BatchDeleteResult, Error> {
        let mut result = BatchDeleteResult::default();
        for subpath in subpaths {
            ctx.check_cancelled()?;
            match self.delete_one(subpath).await {
                Ok(()) => result.successes += 1,
                Err(err) => result
                    .failures
                    .push(DeleteFailure { path: subpath.clone(), error: err.to_string() }),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> WebdavDriver {
        WebdavDriver::new(WebdavConfig {
            endpoint: "https://dav.example.com/remote.php/dav/files/alice/".to_string(),
            username: "alice".to_string(),
            password: "secret".to_string(),
            tls_insecure: false,
            connect_timeout: std::time::Duration::from_secs(10),
        })
        .unwrap()
    }

    #[test]
    fn test_url_encoding_of_segments() {
        let drv = driver();
        let url = drv.url_for("a b/c#d.txt", false).unwrap();
        assert_eq!(
            url.as_str(),
            "https://dav.example.com/remote.php/dav/files/alice/a%20b/c%23d.txt"
        );

        let dir = drv.url_for("docs", true).unwrap();
        assert_eq!(dir.as_str(), "https://dav.example.com/remote.php/dav/files/alice/docs/");
    }

    #[test]
    fn test_url_for_root() {
        let drv = driver();
        let url = drv.url_for("", true).unwrap();
        assert_eq!(url.as_str(), "https://dav.example.com/remote.php/dav/files/alice/");
    }

    #[test]
    fn test_traversal_rejected() {
        let drv = driver();
        assert!(drv.url_for("../outside", false).is_err());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let err = WebdavDriver::new(WebdavConfig {
            endpoint: "not a url".to_string(),
            username: String::new(),
            password: String::new(),
            tls_insecure: false,
            connect_timeout: std::time::Duration::from_secs(1),
        })
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }
}

mod auth;

use crate::descriptor::{ByteReader, CancellableReader, RangedReader, StreamDescriptor, StreamSource};
use crate::driver::{
    BatchDeleteResult, Capability, CopyOptions, CopyResult, CopyStatus, CreateDirResult,
    DeleteFailure, LinkKind, Listing, OpContext, PresignOptions, PresignedDownload, RenameResult,
    StorageDriver, UploadBody, UploadResult,
};
use crate::multipart::{CompletedPart, MultipartInit, MultipartInitResult, PartInfo, PartPlan};
use auth::TokenManager;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use models::{DirEntry, DriverKind, Error, FileInfo};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Bodies at or below this size go to `PUT .../content` in one shot.
const SIMPLE_UPLOAD_MAX: u64 = 4 * 1024 * 1024;

/// Native drive download URLs are valid for about an hour.
const DOWNLOAD_URL_TTL_SECS: i64 = 3600;

const RETRY_ATTEMPTS: u32 = 3;

/// Path segments keep unreserved characters; everything else is encoded.
const SEGMENT_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/')
    .add(b'\\')
    .add(b'&')
    .add(b'+');

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub refresh_token: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Pluggable token-renewal endpoint; see [`auth::TokenManager`].
    #[serde(default)]
    pub online_api_url: Option<String>,
    /// Drive-relative folder every subpath is rooted under.
    #[serde(default)]
    pub root_prefix: Option<String>,
}

fn default_tenant() -> String {
    "common".to_string()
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    e_tag: Option<String>,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(default)]
    file: Option<GraphFile>,
    #[serde(default, rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
    #[serde(default)]
    parent_reference: Option<ParentReference>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFile {
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentReference {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ChildrenPage {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionState {
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

impl DriveItem {
    fn is_folder(&self) -> bool {
        self.folder.is_some()
    }

    fn mime(&self) -> Option<String> {
        self.file.as_ref().and_then(|f| f.mime_type.clone())
    }
}

/// Microsoft Graph drive backend (`/me/drive`).
pub struct GraphDriver {
    http: reqwest::Client,
    auth: TokenManager,
    prefix: String,
}

impl GraphDriver {
    pub const CAPABILITIES: Capability = Capability::READER
        .union(Capability::WRITER)
        .union(Capability::ATOMIC)
        .union(Capability::DIRECT_LINK)
        .union(Capability::MULTIPART)
        .union(Capability::PROXY)
        .union(Capability::SEARCH);

    pub fn new(config: GraphConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(Error::internal)?;
        let auth = TokenManager::new(
            http.clone(),
            config.client_id,
            config.client_secret,
            config.tenant,
            config.refresh_token,
            config.online_api_url,
        );
        Ok(Self {
            http,
            auth,
            prefix: config
                .root_prefix
                .as_deref()
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_default(),
        })
    }

    /// Drive-relative path for a subpath, without leading slash.
    fn rel_path(&self, subpath: &str) -> Result<String, Error> {
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let rel = canonical.trim_start_matches('/');
        Ok(if self.prefix.is_empty() {
            rel.to_string()
        } else if rel.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{rel}", self.prefix)
        })
    }

    fn encode(rel: &str) -> String {
        rel.split('/')
            .map(|seg| utf8_percent_encode(seg, SEGMENT_SET).to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Compose `/me/drive/root:/<path>:/<op>` style URLs, degrading to the
    /// bare root form when the path is empty.
    fn item_url(&self, subpath: &str, op: &str) -> Result<String, Error> {
        let rel = self.rel_path(subpath)?;
        Ok(if rel.is_empty() {
            if op.is_empty() {
                format!("{GRAPH_BASE}/me/drive/root")
            } else {
                format!("{GRAPH_BASE}/me/drive/root/{op}")
            }
        } else {
            let encoded = Self::encode(&rel);
            if op.is_empty() {
                format!("{GRAPH_BASE}/me/drive/root:/{encoded}")
            } else {
                format!("{GRAPH_BASE}/me/drive/root:/{encoded}:/{op}")
            }
        })
    }

    /// The `parentReference.path` form for a drive-relative directory.
    fn parent_reference(&self, rel_dir: &str) -> String {
        if rel_dir.is_empty() {
            "/drive/root:".to_string()
        } else {
            format!("/drive/root:/{rel_dir}")
        }
    }

    /// Issue a request with auth, honoring Retry-After on 429 and backing
    /// off on transient 5xx, capped at [`RETRY_ATTEMPTS`].
    async fn send<F>(&self, context: &str, make: F) -> Result<reqwest::Response, Error>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let token = self.auth.access_token().await?;
            let resp = make(&token)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|err| Error::upstream(0, None, format!("{context}: {err}")))?;
            let status = resp.status();

            if status.is_success() {
                return Ok(resp);
            }
            match status {
                StatusCode::TOO_MANY_REQUESTS if attempt < RETRY_ATTEMPTS => {
                    let delay = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(1);
                    tracing::warn!(context, delay, "graph throttled, honoring Retry-After");
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                }
                status if status.is_server_error() && attempt < RETRY_ATTEMPTS => {
                    let backoff = std::time::Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    tracing::warn!(context, %status, ?backoff, "graph transient error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                StatusCode::NOT_FOUND => return Err(Error::NotFound(context.to_string())),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(Error::Forbidden(format!("graph rejected request ({context})")))
                }
                StatusCode::CONFLICT => return Err(Error::Conflict(context.to_string())),
                status => {
                    let code = graph_error_code(resp).await;
                    return Err(Error::upstream(status.as_u16(), code, context.to_string()));
                }
            }
        }
    }

    async fn fetch_item(&self, subpath: &str) -> Result<DriveItem, Error> {
        let url = self.item_url(subpath, "")?;
        let resp = self.send("graph get item", move |_| self.http.get(&url)).await?;
        resp.json().await.map_err(|err| Error::upstream(0, None, format!("graph item body: {err}")))
    }

    fn info_from(&self, canonical: &str, item: &DriveItem) -> FileInfo {
        FileInfo {
            name: item.name.clone(),
            path: canonical.to_string(),
            is_directory: item.is_folder(),
            size: if item.is_folder() { 0 } else { item.size.unwrap_or_default() },
            modified: item.last_modified_date_time,
            etag: item.e_tag.clone(),
            mime: item.mime(),
            is_virtual: false,
        }
    }

    async fn create_upload_session(&self, subpath: &str) -> Result<UploadSessionState, Error> {
        let url = self.item_url(subpath, "createUploadSession")?;
        let name = vpath::file_name(
            &vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?,
        )
        .to_string();
        let body = serde_json::json!({
            "item": {
                "@microsoft.graph.conflictBehavior": "replace",
                "name": name,
            }
        });
        let resp = self
            .send("graph createUploadSession", move |_| self.http.post(&url).json(&body))
            .await?;
        let session: UploadSessionState = resp
            .json()
            .await
            .map_err(|err| Error::upstream(0, None, format!("graph session body: {err}")))?;
        if session.upload_url.is_none() {
            return Err(Error::upstream(0, None, "graph returned no uploadUrl"));
        }
        Ok(session)
    }

    /// Single ranged PUT of a complete known-size body to a session URL.
    async fn put_session_body(
        &self,
        upload_url: &str,
        body: reqwest::Body,
        total: u64,
    ) -> Result<(), Error> {
        let range = format!("bytes 0-{}/{total}", total.saturating_sub(1));
        let resp = self
            .http
            .put(upload_url)
            .header(CONTENT_LENGTH, total)
            .header(CONTENT_RANGE, range)
            .body(body)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("graph session PUT: {err}")))?;
        if !resp.status().is_success() {
            return Err(Error::upstream(
                resp.status().as_u16(),
                None,
                "graph session PUT rejected",
            ));
        }
        Ok(())
    }

    /// Probe an upload session URL. 404 means the provider discarded it.
    async fn probe_session(&self, upload_url: &str) -> Result<UploadSessionState, Error> {
        let resp = self
            .http
            .get(upload_url)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("graph session probe: {err}")))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::UploadSessionNotFound),
            status if status.is_success() => resp
                .json()
                .await
                .map_err(|err| Error::upstream(0, None, format!("graph session body: {err}"))),
            status => Err(Error::upstream(status.as_u16(), None, "graph session probe")),
        }
    }
}

async fn graph_error_code(resp: reqwest::Response) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: Inner,
    }
    #[derive(serde::Deserialize)]
    struct Inner {
        code: String,
    }
    resp.json::<Envelope>().await.ok().map(|e| e.error.code)
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

/// Streams from the item's pre-authorized download URL.
struct GraphSource {
    http: reqwest::Client,
    download_url: String,
}

#[async_trait::async_trait]
impl StreamSource for GraphSource {
    async fn open_full(&self, cancel: &CancellationToken) -> Result<ByteReader, Error> {
        let resp = self
            .http
            .get(&self.download_url)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("graph download: {err}")))?;
        if !resp.status().is_success() {
            return Err(Error::upstream(resp.status().as_u16(), None, "graph download"));
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
            .get(&self.download_url)
            .header(RANGE, range)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("graph download: {err}")))?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                Ok(RangedReader { reader: response_reader(resp, cancel), range_honored: true })
            }
            StatusCode::OK => {
                Ok(RangedReader { reader: response_reader(resp, cancel), range_honored: false })
            }
            status => Err(Error::upstream(status.as_u16(), None, "graph ranged download")),
        }
    }

    fn supports_range(&self) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl StorageDriver for GraphDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Graph
    }

    fn capabilities(&self) -> Capability {
        Self::CAPABILITIES
    }

    #[tracing::instrument(skip(self, ctx), fields(driver = "graph"))]
    async fn list_directory(&self, subpath: &str, ctx: &OpContext) -> Result<Listing, Error> {
        ctx.check_cancelled()?;
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let mut url = format!("{}?$top=200", self.item_url(subpath, "children")?);
        let mut items = Vec::new();

        loop {
            ctx.check_cancelled()?;
            let page_url = url.clone();
            let resp =
                self.send("graph list children", move |_| self.http.get(&page_url)).await?;
            let page: ChildrenPage = resp
                .json()
                .await
                .map_err(|err| Error::upstream(0, None, format!("graph children body: {err}")))?;

            items.extend(page.value.iter().map(|item| DirEntry {
                name: item.name.clone(),
                is_directory: item.is_folder(),
                size: if item.is_folder() { 0 } else { item.size.unwrap_or_default() },
                modified: item.last_modified_date_time,
                etag: item.e_tag.clone(),
                mime: item.mime(),
            }));

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Listing { items, is_root: canonical == "/" })
    }

    async fn stat(&self, subpath: &str, ctx: &OpContext) -> Result<FileInfo, Error> {
        ctx.check_cancelled()?;
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let item = self.fetch_item(subpath).await?;
        Ok(self.info_from(&canonical, &item))
    }

    async fn download(&self, subpath: &str, ctx: &OpContext) -> Result<StreamDescriptor, Error> {
        ctx.check_cancelled()?;
        let item = self.fetch_item(subpath).await?;
        if item.is_folder() {
            return Err(Error::Validation(format!("{subpath} is a directory")));
        }
        let download_url = match &item.download_url {
            Some(url) => url.clone(),
            // Rare: no pre-authorized URL on the item; go through /content,
            // which redirects to one.
            None => {
                let url = self.item_url(subpath, "content")?;
                let resp =
                    self.send("graph content", move |_| self.http.get(&url)).await?;
                resp.url().to_string()
            }
        };

        Ok(StreamDescriptor::new(
            item.size,
            item.mime(),
            item.e_tag.clone(),
            item.last_modified_date_time,
            Box::new(GraphSource { http: self.http.clone(), download_url }),
        ))
    }

    #[tracing::instrument(skip(self, body, ctx), fields(driver = "graph"))]
    async fn upload(
        &self,
        subpath: &str,
        body: UploadBody,
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        ctx.check_cancelled()?;
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;

        // Large bodies with a known size stream straight through an upload
        // session. Everything else (small or unsized) is drained first; the
        // session PUT needs a total length for its Content-Range.
        if let UploadBody::Stream { reader, size: Some(total) } = body {
            if total > SIMPLE_UPLOAD_MAX {
                let session = self.create_upload_session(subpath).await?;
                let upload_url = session.upload_url.as_deref().unwrap_or_default().to_string();
                let stream = tokio_util::io::ReaderStream::new(CancellableReader::new(
                    reader,
                    ctx.cancel.clone(),
                ));
                self.put_session_body(&upload_url, reqwest::Body::wrap_stream(stream), total)
                    .await?;
                return Ok(UploadResult { storage_path: canonical });
            }
            let bytes =
                UploadBody::Stream { reader, size: Some(total) }.into_bytes().await?;
            return self.upload(subpath, UploadBody::Buffer(bytes), ctx).await;
        }

        let bytes = body.into_bytes().await?;
        let total = bytes.len() as u64;
        if total <= SIMPLE_UPLOAD_MAX {
            let url = self.item_url(subpath, "content")?;
            let payload = bytes.clone();
            self.send("graph simple upload", move |_| {
                self.http.put(&url).body(payload.clone())
            })
            .await?;
        } else {
            let session = self.create_upload_session(subpath).await?;
            let upload_url = session.upload_url.as_deref().unwrap_or_default().to_string();
            self.put_session_body(&upload_url, reqwest::Body::from(bytes), total).await?;
        }
        Ok(UploadResult { storage_path: canonical })
    }

    async fn create_directory(
        &self,
        subpath: &str,
        ctx: &OpContext,
    ) -> Result<CreateDirResult, Error> {
        ctx.check_cancelled()?;
        let canonical =
            vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let parent = vpath::parent_dir(&canonical);
        let name = vpath::file_name(&canonical).to_string();
        if name.is_empty() {
            return Ok(CreateDirResult { already_existed: true });
        }

        let url = self.item_url(parent.trim_end_matches('/'), "children")?;
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        match self
            .send("graph create folder", move |_| self.http.post(&url).json(&body))
            .await
        {
            Ok(_) => Ok(CreateDirResult { already_existed: false }),
            Err(Error::Conflict(_)) => Ok(CreateDirResult { already_existed: true }),
            Err(err) => Err(err),
        }
    }

    async fn rename(
        &self,
        old_subpath: &str,
        new_subpath: &str,
        ctx: &OpContext,
    ) -> Result<RenameResult, Error> {
        ctx.check_cancelled()?;
        let new_canonical =
            vpath::canonicalize(new_subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let new_parent_rel =
            self.rel_path(vpath::parent_dir(&new_canonical).trim_end_matches('/'))?;

        let url = self.item_url(old_subpath, "")?;
        let body = serde_json::json!({
            "name": vpath::file_name(&new_canonical),
            "parentReference": { "path": self.parent_reference(&new_parent_rel) },
        });
        self.send("graph rename", move |_| {
            self.http.request(Method::PATCH, &url).json(&body)
        })
        .await?;

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

        let dst_canonical =
            vpath::canonicalize(dst_subpath).map_err(|e| Error::Validation(e.to_string()))?;
        let dst_parent_rel =
            self.rel_path(vpath::parent_dir(&dst_canonical).trim_end_matches('/'))?;

        let url = self.item_url(src_subpath, "copy")?;
        let body = serde_json::json!({
            "name": vpath::file_name(&dst_canonical),
            "parentReference": { "path": self.parent_reference(&dst_parent_rel) },
            "@microsoft.graph.conflictBehavior": "replace",
        });
        let resp = match self
            .send("graph copy", move |_| self.http.post(&url).json(&body))
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                return Ok(CopyResult {
                    status: CopyStatus::Failed,
                    source: src_subpath.to_string(),
                    target: dst_subpath.to_string(),
                    reason: Some(err.to_string()),
                })
            }
        };

        // 202 + Location: poll the monitor until the copy lands.
        if resp.status() == StatusCode::ACCEPTED {
            let Some(monitor) = resp
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                return Ok(CopyResult {
                    status: CopyStatus::Success,
                    source: src_subpath.to_string(),
                    target: dst_subpath.to_string(),
                    reason: None,
                });
            };

            for attempt in 1..=10u32 {
                ctx.check_cancelled()?;
                tokio::time::sleep(std::time::Duration::from_millis(200 * u64::from(attempt)))
                    .await;
                #[derive(serde::Deserialize)]
                struct Monitor {
                    #[serde(default)]
                    status: String,
                }
                let Ok(poll) = self.http.get(&monitor).send().await else { continue };
                let Ok(state) = poll.json::<Monitor>().await else { continue };
                match state.status.as_str() {
                    "completed" => {
                        return Ok(CopyResult {
                            status: CopyStatus::Success,
                            source: src_subpath.to_string(),
                            target: dst_subpath.to_string(),
                            reason: None,
                        })
                    }
                    "failed" => {
                        return Ok(CopyResult {
                            status: CopyStatus::Failed,
                            source: src_subpath.to_string(),
                            target: dst_subpath.to_string(),
                            reason: Some("provider reported copy failure".to_string()),
                        })
                    }
                    _ => {}
                }
            }
            return Ok(CopyResult {
                status: CopyStatus::Failed,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: Some("copy monitor did not complete in time".to_string()),
            });
        }

        Ok(CopyResult {
            status: CopyStatus::Success,
            source: src_subpath.to_string(),
            target: dst_subpath.to_string(),
            reason: None,
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
            let url = match self.item_url(subpath, "") {
                Ok(url) => url,
                Err(err) => {
                    result
                        .failures
                        .push(DeleteFailure { path: subpath.clone(), error: err.to_string() });
                    continue;
                }
            };
            // 204 is the success response for item deletion.
            match self.send("graph delete", move |_| self.http.delete(&url)).await {
                Ok(_) => result.successes += 1,
                Err(err) => result
                    .failures
                    .push(DeleteFailure { path: subpath.clone(), error: err.to_string() }),
            }
        }
        Ok(result)
    }

    async fn search(&self, query: &str, ctx: &OpContext) -> Result<Vec<FileInfo>, Error> {
        ctx.check_cancelled()?;
        let escaped = query.replace('\'', "''");
        let url = format!(
            "{GRAPH_BASE}/me/drive/root/search(q='{}')",
            utf8_percent_encode(&escaped, SEGMENT_SET)
        );
        let resp = self.send("graph search", move |_| self.http.get(&url)).await?;
        let page: ChildrenPage = resp
            .json()
            .await
            .map_err(|err| Error::upstream(0, None, format!("graph search body: {err}")))?;

        let drive_root = "/drive/root:";
        Ok(page
            .value
            .iter()
            .map(|item| {
                // Reconstruct the driver-relative path from parentReference.
                let parent = item
                    .parent_reference
                    .as_ref()
                    .and_then(|p| p.path.as_deref())
                    .and_then(|p| p.split_once(drive_root).map(|(_, rest)| rest))
                    .unwrap_or("");
                let full = format!("{parent}/{}", item.name);
                let rel = full
                    .trim_start_matches('/')
                    .strip_prefix(&self.prefix)
                    .map(|r| r.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| full.trim_start_matches('/').to_string());
                self.info_from(&format!("/{rel}"), item)
            })
            .collect())
    }

    async fn presign_download(
        &self,
        subpath: &str,
        _opts: &PresignOptions,
    ) -> Result<PresignedDownload, Error> {
        let item = self.fetch_item(subpath).await?;
        match item.download_url {
            Some(url) => Ok(PresignedDownload {
                url,
                kind: LinkKind::NativeDirect,
                expires_at: Some(Utc::now() + chrono::Duration::seconds(DOWNLOAD_URL_TTL_SECS)),
            }),
            // No native URL: the caller should fall back to the proxy path.
            None => Err(Error::Validation(
                "graph item exposes no direct download URL".to_string(),
            )),
        }
    }

    async fn init_multipart(
        &self,
        subpath: &str,
        init: &MultipartInit,
        ctx: &OpContext,
    ) -> Result<MultipartInitResult, Error> {
        ctx.check_cancelled()?;
        let session = self.create_upload_session(subpath).await?;
        let upload_url = session.upload_url.clone().unwrap_or_default();

        // Single-session strategy: the session URL is the uploadId, and every
        // part is PUT to it with a Content-Range.
        let parts = (1..=init.part_count())
            .map(|number| PartPlan {
                part_number: number,
                size: init.part_len(number),
                url: Some(upload_url.clone()),
            })
            .collect();

        Ok(MultipartInitResult {
            upload_id: upload_url.clone(),
            part_size: init.part_size,
            part_count: init.part_count(),
            parts,
            provider_meta: serde_json::json!({ "uploadUrl": upload_url }),
            expires_at: session.expiration_date_time,
        })
    }

    async fn complete_multipart(
        &self,
        subpath: &str,
        upload_id: &str,
        _parts: &[CompletedPart],
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        ctx.check_cancelled()?;
        // The provider finalizes the item on the last ranged PUT; completion
        // verifies that every byte arrived and the item exists.
        match self.probe_session(upload_id).await {
            // A consumed session 404s once the item has landed.
            Err(Error::UploadSessionNotFound) => {}
            Ok(session) if !session.next_expected_ranges.is_empty() => {
                return Err(Error::Conflict(format!(
                    "upload incomplete, next expected range {}",
                    session.next_expected_ranges[0]
                )))
            }
            Ok(_) => {}
            Err(err) => return Err(err),
        }

        let info = self.stat(subpath, ctx).await?;
        Ok(UploadResult { storage_path: info.path })
    }

    async fn abort_multipart(
        &self,
        _subpath: &str,
        upload_id: &str,
        ctx: &OpContext,
    ) -> Result<(), Error> {
        ctx.check_cancelled()?;
        let resp = self
            .http
            .delete(upload_id)
            .send()
            .await
            .map_err(|err| Error::upstream(0, None, format!("graph session abort: {err}")))?;
        // An already-gone session is an acceptable abort outcome.
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::upstream(resp.status().as_u16(), None, "graph session abort"))
        }
    }

    /// Completed parts are `bytes_uploaded / part_size`, floor division: a
    /// misaligned trailing chunk is reported as incomplete and re-uploaded
    /// on resume.
    async fn list_parts(
        &self,
        _subpath: &str,
        upload_id: &str,
        part_size: u64,
        ctx: &OpContext,
    ) -> Result<Vec<PartInfo>, Error> {
        ctx.check_cancelled()?;
        if part_size == 0 {
            return Err(Error::Validation("partSize must be positive".to_string()));
        }
        let session = self.probe_session(upload_id).await?;

        // No expected ranges left means the session is fully uploaded.
        let Some(first_range) = session.next_expected_ranges.first() else {
            return Ok(Vec::new());
        };
        let bytes_uploaded = first_range
            .split('-')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_default();
        let completed = bytes_uploaded / part_size;
        Ok((1..=completed as u32)
            .map(|number| PartInfo { part_number: number, size: part_size, etag: None })
            .collect())
    }

    async fn refresh_part_urls(
        &self,
        _subpath: &str,
        upload_id: &str,
        part_numbers: &[u32],
        ctx: &OpContext,
    ) -> Result<Vec<PartPlan>, Error> {
        ctx.check_cancelled()?;
        // The session URL never rotates; verify it is still alive and hand
        // the same URL back.
        self.probe_session(upload_id).await?;
        Ok(part_numbers
            .iter()
            .map(|&number| PartPlan {
                part_number: number,
                size: 0,
                url: Some(upload_id.to_string()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(prefix: Option<&str>) -> GraphDriver {
        GraphDriver::new(GraphConfig {
            client_id: "client".into(),
            client_secret: Some("secret".into()),
            refresh_token: "refresh".into(),
            tenant: "common".into(),
            online_api_url: None,
            root_prefix: prefix.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn test_item_url_composition() {
        let drv = driver(None);
        assert_eq!(
            drv.item_url("a/b.txt", "content").unwrap(),
            "https://graph.microsoft.com/v1.0/me/drive/root:/a/b.txt:/content"
        );
        assert_eq!(
            drv.item_url("", "children").unwrap(),
            "https://graph.microsoft.com/v1.0/me/drive/root/children"
        );
        assert_eq!(
            drv.item_url("a b/c&d.txt", "").unwrap(),
            "https://graph.microsoft.com/v1.0/me/drive/root:/a%20b/c%26d.txt"
        );
    }

    #[test]
    fn test_item_url_with_prefix() {
        let drv = driver(Some("apps/gateway"));
        assert_eq!(
            drv.item_url("", "children").unwrap(),
            "https://graph.microsoft.com/v1.0/me/drive/root:/apps/gateway:/children"
        );
        assert_eq!(
            drv.item_url("x.txt", "content").unwrap(),
            "https://graph.microsoft.com/v1.0/me/drive/root:/apps/gateway/x.txt:/content"
        );
    }

    #[test]
    fn test_parent_reference() {
        let drv = driver(None);
        assert_eq!(drv.parent_reference(""), "/drive/root:");
        assert_eq!(drv.parent_reference("docs/sub"), "/drive/root:/docs/sub");
    }

    #[test]
    fn test_floor_division_part_count() {
        // 7 MiB uploaded at 5 MiB parts: one complete part; the partial
        // trailing chunk is re-uploaded on resume.
        let part_size: u64 = 5 * 1024 * 1024;
        let bytes_uploaded: u64 = 7 * 1024 * 1024;
        assert_eq!(bytes_uploaded / part_size, 1);
    }
}

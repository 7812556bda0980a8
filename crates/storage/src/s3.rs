use crate::descriptor::{ByteReader, CancellableReader, RangedReader, StreamDescriptor, StreamSource};
use crate::driver::{
    BatchDeleteResult, Capability, CopyOptions, CopyResult, CopyStatus, CreateDirResult,
    DeleteFailure, LinkKind, Listing, OpContext, PresignOptions, PresignedDownload,
    PresignedUpload, RenameResult, StorageDriver, UploadBody, UploadResult,
};
use crate::multipart::{
    CompletedPart, MultipartInit, MultipartInitResult, OngoingUpload, PartInfo, PartPlan,
};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, Delete, ObjectIdentifier};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use models::{DirEntry, DriverKind, Error, FileInfo};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Bodies at or below this size go through a single PutObject.
const SINGLE_SHOT_MAX: u64 = 16 * 1024 * 1024;

/// S3 requires every part except the last to be at least 5 MiB.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// DeleteObjects accepts at most this many keys per call.
const MAX_KEYS_PER_DELETE: usize = 1000;

const COPY_SOURCE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub custom_host: Option<String>,
    #[serde(default)]
    pub root_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub force_path_style: bool,
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_secs: u64,
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

fn default_true() -> bool {
    true
}
fn default_presign_ttl() -> u64 {
    3600
}
fn default_part_size() -> u64 {
    8 * 1024 * 1024
}
fn default_upload_concurrency() -> usize {
    4
}

/// S3-compatible object store. Directories are flattened to zero-byte
/// objects with a trailing `/` so listings can report folders.
pub struct S3Driver {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    custom_host: Option<url::Url>,
    presign_ttl: std::time::Duration,
    part_size: u64,
    upload_concurrency: usize,
}

fn upstream<E>(context: &str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = match &err {
        SdkError::ServiceError(se) => se.raw().status().as_u16(),
        _ => 0,
    };
    let code = err.code().map(str::to_string);
    Error::upstream(status, code, context.to_string())
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

/// Compute the object key for a canonical subpath under an optional prefix.
fn join_key(prefix: &str, subpath: &str) -> Result<String, Error> {
    let canonical = vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
    let rel = canonical.trim_start_matches('/');
    Ok(if prefix.is_empty() {
        rel.to_string()
    } else if rel.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{rel}")
    })
}

/// Rewrite a presigned URL onto a custom host, keeping path and query.
fn rewrite_host(presigned: &str, custom: &url::Url) -> Result<String, Error> {
    let parsed = url::Url::parse(presigned).map_err(Error::internal)?;
    let mut out = custom.clone();
    out.set_path(parsed.path());
    out.set_query(parsed.query());
    Ok(out.to_string())
}

impl S3Driver {
    pub const CAPABILITIES: Capability = Capability::READER
        .union(Capability::WRITER)
        .union(Capability::ATOMIC)
        .union(Capability::PRESIGNED)
        .union(Capability::DIRECT_LINK)
        .union(Capability::MULTIPART)
        .union(Capability::PROXY);

    pub async fn new(config: S3Config) -> Result<Self, Error> {
        let custom_host = config
            .custom_host
            .as_deref()
            .map(url::Url::parse)
            .transpose()
            .map_err(|err| Error::Validation(format!("invalid customHost: {err}")))?;

        let credentials = aws_credential_types::Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "storage-config",
        );
        let region = aws_sdk_s3::config::Region::new(
            config.region.clone().unwrap_or_else(|| "us-east-1".to_string()),
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(region)
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: config.bucket,
            prefix: config
                .root_prefix
                .as_deref()
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_default(),
            custom_host,
            presign_ttl: std::time::Duration::from_secs(config.presign_ttl_secs.max(1)),
            part_size: config.part_size.max(MIN_PART_SIZE),
            upload_concurrency: config.upload_concurrency.clamp(1, 16),
        })
    }

    fn key(&self, subpath: &str) -> Result<String, Error> {
        join_key(&self.prefix, subpath)
    }

    fn dir_prefix(&self, subpath: &str) -> Result<String, Error> {
        let key = self.key(subpath)?;
        Ok(if key.is_empty() { key } else { format!("{key}/") })
    }

    fn copy_source(&self, key: &str) -> String {
        utf8_percent_encode(&format!("{}/{}", self.bucket, key), COPY_SOURCE_SET).to_string()
    }

    async fn put_bytes(&self, key: &str, bytes: Bytes, mime: Option<String>) -> Result<(), Error> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));
        if let Some(mime) = mime {
            req = req.content_type(mime);
        }
        req.send().await.map_err(|err| upstream("s3 PutObject", err))?;
        Ok(())
    }

    /// Managed multipart upload for large or unsized bodies: sequential
    /// chunk reads, bounded-concurrency part PUTs, bounded retries.
    async fn upload_multipart(
        &self,
        key: &str,
        mut reader: ByteReader,
        ctx: &OpContext,
    ) -> Result<(), Error> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| upstream("s3 CreateMultipartUpload", err))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::upstream(0, None, "s3 returned no uploadId"))?
            .to_string();

        let result = self.upload_parts(key, &upload_id, &mut reader, ctx).await;
        match result {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|err| upstream("s3 CompleteMultipartUpload", err))?;
                Ok(())
            }
            Err(err) => {
                // Best effort: don't leave the orphan upload behind.
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut ByteReader,
        ctx: &OpContext,
    ) -> Result<Vec<aws_sdk_s3::types::CompletedPart>, Error> {
        let mut tasks = tokio::task::JoinSet::new();
        let mut completed: Vec<aws_sdk_s3::types::CompletedPart> = Vec::new();
        let mut part_number: i32 = 0;

        loop {
            ctx.check_cancelled()?;
            let chunk = read_chunk(reader, self.part_size).await?;
            if chunk.is_empty() && part_number > 0 {
                break;
            }
            part_number += 1;
            let is_last = (chunk.len() as u64) < self.part_size;

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let number = part_number;
            tasks.spawn(async move {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    let sent = client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(number)
                        .body(ByteStream::from(chunk.clone()))
                        .send()
                        .await;
                    match sent {
                        Ok(out) => {
                            return Ok(aws_sdk_s3::types::CompletedPart::builder()
                                .part_number(number)
                                .set_e_tag(out.e_tag().map(str::to_string))
                                .build());
                        }
                        Err(err) if attempt < 3 => {
                            tracing::warn!(part = number, attempt, ?err, "retrying part upload");
                            tokio::time::sleep(std::time::Duration::from_millis(
                                250 * u64::from(attempt),
                            ))
                            .await;
                        }
                        Err(err) => return Err(upstream("s3 UploadPart", err)),
                    }
                }
            });

            while tasks.len() >= self.upload_concurrency {
                match tasks.join_next().await {
                    Some(Ok(part)) => completed.push(part?),
                    Some(Err(join)) => return Err(Error::internal(join)),
                    None => break,
                }
            }
            if is_last {
                break;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(part) => completed.push(part?),
                Err(join) => return Err(Error::internal(join)),
            }
        }
        completed.sort_by_key(|p| p.part_number());
        Ok(completed)
    }

    async fn collect_prefix_keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = &token {
                req = req.continuation_token(token.clone());
            }
            let page = req.send().await.map_err(|err| upstream("s3 ListObjectsV2", err))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            match page.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_keys(&self, keys: Vec<String>) -> Result<BatchDeleteResult, Error> {
        let mut result = BatchDeleteResult::default();
        for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build().map_err(Error::internal))
                .collect::<Result<Vec<_>, _>>()?;
            let delete =
                Delete::builder().set_objects(Some(objects)).build().map_err(Error::internal)?;
            let out = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| upstream("s3 DeleteObjects", err))?;

            let errors = out.errors();
            for err in errors {
                result.failures.push(DeleteFailure {
                    path: err.key().unwrap_or_default().to_string(),
                    error: err.message().unwrap_or("delete failed").to_string(),
                });
            }
            result.successes += (chunk.len() - errors.len()) as u64;
        }
        Ok(result)
    }

    fn presign_expiry(&self, opts: &PresignOptions) -> (std::time::Duration, DateTime<Utc>) {
        let ttl = opts
            .expires_in
            .map(std::time::Duration::from_secs)
            .unwrap_or(self.presign_ttl);
        (ttl, Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)))
    }

    async fn presign_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<String, Error> {
        let cfg = PresigningConfig::expires_in(self.presign_ttl).map_err(Error::internal)?;
        let req = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .presigned(cfg)
            .await
            .map_err(|err| upstream("s3 presign UploadPart", err))?;
        match &self.custom_host {
            Some(host) => rewrite_host(req.uri(), host),
            None => Ok(req.uri().to_string()),
        }
    }
}

struct S3Source {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
}

impl S3Source {
    async fn open(&self, range: Option<String>, cancel: &CancellationToken) -> Result<ByteReader, Error> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .set_range(range)
            .send()
            .await
            .map_err(|err| {
                let missing =
                    matches!(err.as_service_error(), Some(service) if service.is_no_such_key());
                if missing {
                    Error::NotFound(self.key.clone())
                } else {
                    upstream("s3 GetObject", err)
                }
            })?;
        Ok(Box::pin(CancellableReader::new(out.body.into_async_read(), cancel.clone())))
    }
}

#[async_trait::async_trait]
impl StreamSource for S3Source {
    async fn open_full(&self, cancel: &CancellationToken) -> Result<ByteReader, Error> {
        self.open(None, cancel).await
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
        let reader = self.open(Some(range), cancel).await?;
        Ok(RangedReader { reader, range_honored: true })
    }

    fn supports_range(&self) -> bool {
        true
    }
}

async fn read_chunk(reader: &mut ByteReader, size: u64) -> Result<Bytes, Error> {
    let mut buf = Vec::with_capacity(size as usize);
    let mut take = reader.take(size);
    take.read_to_end(&mut buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::Interrupted {
            Error::Cancelled
        } else {
            Error::internal(err)
        }
    })?;
    Ok(buf.into())
}

#[async_trait::async_trait]
impl StorageDriver for S3Driver {
    fn kind(&self) -> DriverKind {
        DriverKind::S3
    }

    fn capabilities(&self) -> Capability {
        Self::CAPABILITIES
    }

    #[tracing::instrument(skip(self, ctx), fields(driver = "s3"))]
    async fn list_directory(&self, subpath: &str, ctx: &OpContext) -> Result<Listing, Error> {
        ctx.check_cancelled()?;
        let dir = self.dir_prefix(subpath)?;
        let is_root = dir.is_empty() || dir == format!("{}/", self.prefix);

        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(dir.clone())
                .delimiter("/");
            if let Some(token) = &token {
                req = req.continuation_token(token.clone());
            }
            let page = req.send().await.map_err(|err| upstream("s3 ListObjectsV2", err))?;

            for common in page.common_prefixes() {
                let Some(prefix) = common.prefix() else { continue };
                let name = prefix
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                if name.is_empty() {
                    continue;
                }
                items.push(DirEntry {
                    name,
                    is_directory: true,
                    size: 0,
                    modified: None,
                    etag: None,
                    mime: None,
                });
            }
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if key == dir {
                    continue; // The folder placeholder itself.
                }
                let name = key.rsplit('/').next().unwrap_or_default().to_string();
                if name.is_empty() {
                    continue;
                }
                items.push(DirEntry {
                    mime: mime_guess::from_path(&name).first_raw().map(str::to_string),
                    etag: object.e_tag().map(|t| t.trim_matches('"').to_string()),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    modified: object.last_modified().and_then(to_chrono),
                    name,
                    is_directory: false,
                });
            }

            match page.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Listing { items, is_root })
    }

    async fn stat(&self, subpath: &str, ctx: &OpContext) -> Result<FileInfo, Error> {
        ctx.check_cancelled()?;
        let canonical = vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        if canonical == "/" {
            return Ok(FileInfo {
                name: String::new(),
                path: canonical,
                is_directory: true,
                size: 0,
                modified: None,
                etag: None,
                mime: None,
                is_virtual: false,
            });
        }

        let key = self.key(subpath)?;
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(head) => {
                return Ok(FileInfo {
                    name: vpath::file_name(&canonical).to_string(),
                    path: canonical,
                    is_directory: false,
                    size: head.content_length().unwrap_or_default().max(0) as u64,
                    modified: head.last_modified().and_then(to_chrono),
                    etag: head.e_tag().map(|t| t.trim_matches('"').to_string()),
                    mime: head.content_type().map(str::to_string),
                    is_virtual: false,
                })
            }
            Err(err) => {
                let not_found =
                    matches!(err.as_service_error(), Some(service) if service.is_not_found());
                if !not_found {
                    return Err(upstream("s3 HeadObject", err));
                }
            }
        }

        // Not an object: a directory exists iff anything lives under it.
        let dir = self.dir_prefix(subpath)?;
        let page = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(dir)
            .max_keys(1)
            .send()
            .await
            .map_err(|err| upstream("s3 ListObjectsV2", err))?;
        if page.key_count().unwrap_or(0) > 0 {
            Ok(FileInfo {
                name: vpath::file_name(&canonical).to_string(),
                path: canonical,
                is_directory: true,
                size: 0,
                modified: None,
                etag: None,
                mime: None,
                is_virtual: false,
            })
        } else {
            Err(Error::NotFound(subpath.to_string()))
        }
    }

    async fn download(&self, subpath: &str, ctx: &OpContext) -> Result<StreamDescriptor, Error> {
        let info = self.stat(subpath, ctx).await?;
        if info.is_directory {
            return Err(Error::Validation(format!("{subpath} is a directory")));
        }
        Ok(StreamDescriptor::new(
            Some(info.size),
            info.mime,
            info.etag,
            info.modified,
            Box::new(S3Source {
                client: self.client.clone(),
                bucket: self.bucket.clone(),
                key: self.key(subpath)?,
            }),
        ))
    }

    #[tracing::instrument(skip(self, body, ctx), fields(driver = "s3"))]
    async fn upload(
        &self,
        subpath: &str,
        body: UploadBody,
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        ctx.check_cancelled()?;
        let key = self.key(subpath)?;
        let mime = mime_guess::from_path(subpath).first_raw().map(str::to_string);

        match body {
            UploadBody::Buffer(bytes) if bytes.len() as u64 <= SINGLE_SHOT_MAX => {
                self.put_bytes(&key, bytes, mime).await?;
            }
            UploadBody::Stream { mut reader, size: Some(size) } if size <= SINGLE_SHOT_MAX => {
                let mut buf = Vec::with_capacity(size as usize);
                reader.read_to_end(&mut buf).await.map_err(Error::internal)?;
                self.put_bytes(&key, buf.into(), mime).await?;
            }
            UploadBody::Buffer(bytes) => {
                let reader: ByteReader = Box::pin(std::io::Cursor::new(bytes));
                self.upload_multipart(&key, reader, ctx).await?;
            }
            UploadBody::Stream { reader, .. } => {
                self.upload_multipart(&key, reader, ctx).await?;
            }
        }

        let canonical = vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        Ok(UploadResult { storage_path: canonical })
    }

    async fn create_directory(
        &self,
        subpath: &str,
        ctx: &OpContext,
    ) -> Result<CreateDirResult, Error> {
        ctx.check_cancelled()?;
        let dir = self.dir_prefix(subpath)?;
        if dir.is_empty() {
            return Ok(CreateDirResult { already_existed: true });
        }
        let page = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(dir.clone())
            .max_keys(1)
            .send()
            .await
            .map_err(|err| upstream("s3 ListObjectsV2", err))?;
        if page.key_count().unwrap_or(0) > 0 {
            return Ok(CreateDirResult { already_existed: true });
        }
        self.put_bytes(&dir, Bytes::new(), None).await?;
        Ok(CreateDirResult { already_existed: false })
    }

    async fn rename(
        &self,
        old_subpath: &str,
        new_subpath: &str,
        ctx: &OpContext,
    ) -> Result<RenameResult, Error> {
        let copied = self
            .copy(old_subpath, new_subpath, &CopyOptions { skip_existing: false, precheck: false }, ctx)
            .await?;
        if copied.status != CopyStatus::Success {
            return Err(Error::upstream(
                0,
                None,
                format!("s3 rename copy failed: {}", copied.reason.unwrap_or_default()),
            ));
        }
        let key = self.key(old_subpath)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| upstream("s3 DeleteObject", err))?;
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

        let src_key = self.key(src_subpath)?;
        let dst_key = self.key(dst_subpath)?;
        let sent = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(&src_key))
            .key(&dst_key)
            .send()
            .await;

        Ok(match sent {
            Ok(_) => CopyResult {
                status: CopyStatus::Success,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: None,
            },
            Err(err) => CopyResult {
                status: CopyStatus::Failed,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: Some(upstream("s3 CopyObject", err).to_string()),
            },
        })
    }

    async fn batch_delete(
        &self,
        subpaths: &[String],
        ctx: &OpContext,
    ) -> Result<BatchDeleteResult, Error> {
        ctx.check_cancelled()?;
        let mut keys = Vec::new();
        let mut result = BatchDeleteResult::default();

        for subpath in subpaths {
            let is_dir_path = subpath.ends_with('/');
            let key = match self.key(subpath) {
                Ok(key) => key,
                Err(err) => {
                    result
                        .failures
                        .push(DeleteFailure { path: subpath.clone(), error: err.to_string() });
                    continue;
                }
            };
            if is_dir_path {
                // Expand a directory to every key beneath it.
                let expanded = self.collect_prefix_keys(&format!("{key}/")).await?;
                keys.push(format!("{key}/"));
                keys.extend(expanded);
            } else {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();

        let deleted = self.delete_keys(keys).await?;
        result.successes += deleted.successes;
        result.failures.extend(deleted.failures);
        Ok(result)
    }

    async fn presign_upload(
        &self,
        subpath: &str,
        opts: &PresignOptions,
    ) -> Result<PresignedUpload, Error> {
        let key = self.key(subpath)?;
        let (ttl, expires_at) = self.presign_expiry(opts);
        let cfg = PresigningConfig::expires_in(ttl).map_err(Error::internal)?;
        let req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(cfg)
            .await
            .map_err(|err| upstream("s3 presign PutObject", err))?;

        let url = match &self.custom_host {
            Some(host) => rewrite_host(req.uri(), host)?,
            None => req.uri().to_string(),
        };
        let headers: HashMap<String, String> = req
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Ok(PresignedUpload {
            url,
            headers: (!headers.is_empty()).then_some(headers),
            method: "PUT".to_string(),
            storage_path: vpath::canonicalize(subpath)
                .map_err(|e| Error::Validation(e.to_string()))?,
            expires_at,
        })
    }

    async fn presign_download(
        &self,
        subpath: &str,
        opts: &PresignOptions,
    ) -> Result<PresignedDownload, Error> {
        let key = self.key(subpath)?;
        let (ttl, expires_at) = self.presign_expiry(opts);
        let cfg = PresigningConfig::expires_in(ttl).map_err(Error::internal)?;

        let mut req = self.client.get_object().bucket(&self.bucket).key(&key);
        if opts.force_download {
            let name = key.rsplit('/').next().unwrap_or("download");
            req = req.response_content_disposition(format!("attachment; filename=\"{name}\""));
        }
        let presigned =
            req.presigned(cfg).await.map_err(|err| upstream("s3 presign GetObject", err))?;

        Ok(match &self.custom_host {
            Some(host) => PresignedDownload {
                url: rewrite_host(presigned.uri(), host)?,
                kind: LinkKind::CustomHost,
                expires_at: Some(expires_at),
            },
            None => PresignedDownload {
                url: presigned.uri().to_string(),
                kind: LinkKind::NativeDirect,
                expires_at: Some(expires_at),
            },
        })
    }

    async fn init_multipart(
        &self,
        subpath: &str,
        init: &MultipartInit,
        ctx: &OpContext,
    ) -> Result<MultipartInitResult, Error> {
        ctx.check_cancelled()?;
        if init.part_size < MIN_PART_SIZE && init.file_size > init.part_size {
            return Err(Error::Validation(format!(
                "partSize must be at least {MIN_PART_SIZE} bytes"
            )));
        }
        let key = self.key(subpath)?;
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| upstream("s3 CreateMultipartUpload", err))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::upstream(0, None, "s3 returned no uploadId"))?
            .to_string();

        let mut parts = Vec::with_capacity(init.part_count() as usize);
        for number in 1..=init.part_count() {
            parts.push(PartPlan {
                part_number: number,
                size: init.part_len(number),
                url: Some(self.presign_part_url(&key, &upload_id, number).await?),
            });
        }

        Ok(MultipartInitResult {
            upload_id,
            part_size: init.part_size,
            part_count: init.part_count(),
            parts,
            provider_meta: serde_json::json!({ "key": key }),
            expires_at: Some(
                Utc::now()
                    + chrono::Duration::from_std(self.presign_ttl)
                        .unwrap_or_else(|_| chrono::Duration::hours(1)),
            ),
        })
    }

    async fn complete_multipart(
        &self,
        subpath: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        ctx.check_cancelled()?;
        let key = self.key(subpath)?;
        let assembled: Vec<_> = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .set_e_tag(p.etag.clone())
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(assembled)).build())
            .send()
            .await
            .map_err(|err| upstream("s3 CompleteMultipartUpload", err))?;

        let canonical = vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        Ok(UploadResult { storage_path: canonical })
    }

    async fn abort_multipart(
        &self,
        subpath: &str,
        upload_id: &str,
        ctx: &OpContext,
    ) -> Result<(), Error> {
        ctx.check_cancelled()?;
        let key = self.key(subpath)?;
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| upstream("s3 AbortMultipartUpload", err))?;
        Ok(())
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        ctx: &OpContext,
    ) -> Result<Vec<OngoingUpload>, Error> {
        ctx.check_cancelled()?;
        let dir = self.dir_prefix(prefix)?;
        let out = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(dir)
            .send()
            .await
            .map_err(|err| upstream("s3 ListMultipartUploads", err))?;
        Ok(out
            .uploads()
            .iter()
            .filter_map(|u| {
                Some(OngoingUpload {
                    storage_path: u.key()?.to_string(),
                    upload_id: u.upload_id()?.to_string(),
                    initiated: u.initiated().and_then(to_chrono),
                })
            })
            .collect())
    }

    async fn list_parts(
        &self,
        subpath: &str,
        upload_id: &str,
        _part_size: u64,
        ctx: &OpContext,
    ) -> Result<Vec<PartInfo>, Error> {
        ctx.check_cancelled()?;
        let key = self.key(subpath)?;
        let out = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| {
                let gone = matches!(
                    err.as_service_error(),
                    Some(service) if service.code() == Some("NoSuchUpload")
                );
                if gone {
                    Error::UploadSessionNotFound
                } else {
                    upstream("s3 ListParts", err)
                }
            })?;
        Ok(out
            .parts()
            .iter()
            .filter_map(|p| {
                Some(PartInfo {
                    part_number: p.part_number()? as u32,
                    size: p.size().unwrap_or_default().max(0) as u64,
                    etag: p.e_tag().map(|t| t.trim_matches('"').to_string()),
                })
            })
            .collect())
    }

    async fn refresh_part_urls(
        &self,
        subpath: &str,
        upload_id: &str,
        part_numbers: &[u32],
        ctx: &OpContext,
    ) -> Result<Vec<PartPlan>, Error> {
        ctx.check_cancelled()?;
        let key = self.key(subpath)?;
        let mut plans = Vec::with_capacity(part_numbers.len());
        for &number in part_numbers {
            plans.push(PartPlan {
                part_number: number,
                size: 0,
                url: Some(self.presign_part_url(&key, upload_id, number).await?),
            });
        }
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_joins_prefix() {
        assert_eq!(join_key("", "a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(join_key("base", "a/b.txt").unwrap(), "base/a/b.txt");
        assert_eq!(join_key("base", "/").unwrap(), "base");
        assert_eq!(join_key("", "/").unwrap(), "");
        assert!(join_key("base", "../x").is_err());
    }

    #[test]
    fn test_copy_source_encoding() {
        let driver_prefixless = |key: &str| {
            utf8_percent_encode(&format!("bkt/{key}"), COPY_SOURCE_SET).to_string()
        };
        assert_eq!(driver_prefixless("a/b.txt"), "bkt/a/b.txt");
        assert_eq!(driver_prefixless("a b/c#d.txt"), "bkt/a%20b/c%23d.txt");
    }

    #[test]
    fn test_rewrite_host_keeps_path_and_query() {
        let custom = url::Url::parse("https://cdn.example.com").unwrap();
        let rewritten = rewrite_host(
            "https://s3.internal:9000/bucket/key.txt?X-Amz-Signature=abc&X-Amz-Expires=3600",
            &custom,
        )
        .unwrap();
        assert_eq!(
            rewritten,
            "https://cdn.example.com/bucket/key.txt?X-Amz-Signature=abc&X-Amz-Expires=3600"
        );
    }
}

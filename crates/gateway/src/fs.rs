use crate::resolver::{MountResolver, Resolved};
use crate::store::MountStore;
use chrono::Utc;
use models::{
    DirEntry, DirListing, Error, FileInfo, Mount, Principal, StorageConfig, UploadSession,
};
use std::collections::HashMap;
use std::sync::Arc;
use storage::{
    BatchDeleteResult, Capability, CopyOptions, CopyStatus, CreateDirResult, DeleteFailure,
    LinkKind, OpContext, PresignOptions, PresignedDownload, PresignedUpload, RenameResult,
    StorageDriver, StreamDescriptor, UploadBody, UploadResult,
};

/// A resolved mount with its live driver, ready for dispatch.
pub struct Target {
    pub mount: Mount,
    pub config: StorageConfig,
    pub subpath: String,
    pub driver: Arc<dyn StorageDriver>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("mount", &self.mount)
            .field("config", &self.config)
            .field("subpath", &self.subpath)
            .field("driver", &self.driver.kind())
            .finish()
    }
}

/// `sign`/`ts` query parameters of a proxy request.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProxyQuery {
    pub sign: String,
    pub ts: i64,
}

/// Per-item outcome of a cross-storage copy, fed into job stats.
pub struct ItemCopied {
    pub status: CopyStatus,
    pub bytes: u64,
    pub reason: Option<String>,
}

/// Orchestrates the public operations over virtual paths: resolves mounts,
/// gates on driver capabilities, synthesizes virtual directories, and
/// splits cross-storage copies into download + upload pipelines.
pub struct FileSystem {
    store: Arc<dyn MountStore>,
    resolver: MountResolver,
    drivers: tokio::sync::RwLock<HashMap<String, Arc<dyn StorageDriver>>>,
}

impl FileSystem {
    pub fn new(store: Arc<dyn MountStore>) -> Self {
        Self {
            resolver: MountResolver::new(store.clone()),
            store,
            drivers: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &MountResolver {
        &self.resolver
    }

    /// Driver instances are per storage config, built once and reused; they
    /// are internally safe for concurrent operations.
    pub async fn driver_for(&self, config: &StorageConfig) -> Result<Arc<dyn StorageDriver>, Error> {
        if let Some(driver) = self.drivers.read().await.get(&config.id) {
            return Ok(driver.clone());
        }
        let driver = storage::build_driver(config).await?;
        self.drivers.write().await.insert(config.id.clone(), driver.clone());
        Ok(driver)
    }

    /// Evict a cached driver, e.g. after a config update.
    pub async fn evict_driver(&self, config_id: &str) {
        self.drivers.write().await.remove(config_id);
    }

    async fn target(&self, principal: &Principal, canonical: &str) -> Result<Target, Error> {
        match self.resolver.resolve(principal, canonical).await? {
            Resolved::Mount { mount, config, subpath } => {
                let driver = self.driver_for(&config).await?;
                Ok(Target { mount, config, subpath, driver })
            }
            Resolved::VirtualDirectory { path, .. } => Err(Error::Validation(format!(
                "{path} is a virtual directory"
            ))),
        }
    }

    fn require(driver: &Arc<dyn StorageDriver>, cap: Capability, op: &str) -> Result<(), Error> {
        if driver.has(cap) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "{} driver does not support {op}",
                driver.kind()
            )))
        }
    }

    #[tracing::instrument(skip(self, principal, ctx), fields(principal = %principal.id()))]
    pub async fn list(
        &self,
        principal: &Principal,
        path: &str,
        path_token: Option<&str>,
        ctx: &OpContext,
    ) -> Result<DirListing, Error> {
        let canonical = canonicalize(path)?;
        self.resolver.check_path_token(principal, &canonical, path_token).await?;

        match self.resolver.resolve(principal, &canonical).await? {
            Resolved::VirtualDirectory { path, children } => Ok(DirListing {
                items: children
                    .into_iter()
                    .map(|name| DirEntry {
                        name,
                        is_directory: true,
                        size: 0,
                        modified: None,
                        etag: None,
                        mime: None,
                    })
                    .collect(),
                is_root: path == "/",
                is_virtual: true,
                path,
            }),
            Resolved::Mount { mount, config, subpath } => {
                let driver = self.driver_for(&config).await?;
                Self::require(&driver, Capability::READER, "list")?;
                let listing = driver.list_directory(&subpath, ctx).await?;
                self.store.touch_mount(&mount.id, Utc::now()).await?;
                Ok(DirListing {
                    path: canonical,
                    items: listing.items,
                    is_root: listing.is_root,
                    is_virtual: false,
                })
            }
        }
    }

    pub async fn stat(
        &self,
        principal: &Principal,
        path: &str,
        ctx: &OpContext,
    ) -> Result<FileInfo, Error> {
        let canonical = canonicalize(path)?;
        match self.resolver.resolve(principal, &canonical).await? {
            Resolved::VirtualDirectory { path, .. } => Ok(FileInfo {
                name: vpath::file_name(&path).to_string(),
                path,
                is_directory: true,
                size: 0,
                modified: None,
                etag: None,
                mime: None,
                is_virtual: true,
            }),
            Resolved::Mount { config, subpath, .. } => {
                let driver = self.driver_for(&config).await?;
                Self::require(&driver, Capability::READER, "stat")?;
                let mut info = driver.stat(&subpath, ctx).await?;
                info.path = canonical.clone();
                if info.name.is_empty() {
                    info.name = vpath::file_name(&canonical).to_string();
                }
                Ok(info)
            }
        }
    }

    pub async fn download(
        &self,
        principal: &Principal,
        path: &str,
        ctx: &OpContext,
    ) -> Result<(StreamDescriptor, Target), Error> {
        let canonical = canonicalize(path)?;
        let target = self.target(principal, &canonical).await?;
        Self::require(&target.driver, Capability::READER, "download")?;
        let descriptor = target.driver.download(&target.subpath, ctx).await?;
        self.store.touch_mount(&target.mount.id, Utc::now()).await?;
        Ok((descriptor, target))
    }

    pub async fn write(
        &self,
        principal: &Principal,
        path: &str,
        body: UploadBody,
        overwrite: bool,
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        let canonical = canonicalize(path)?;
        let target = self.target(principal, &canonical).await?;
        Self::require(&target.driver, Capability::WRITER, "write")?;
        if overwrite {
            target.driver.update(&target.subpath, body, ctx).await
        } else {
            if target.driver.exists(&target.subpath, ctx).await? {
                return Err(Error::Conflict(format!("{canonical} already exists")));
            }
            target.driver.upload(&target.subpath, body, ctx).await
        }
    }

    pub async fn create_directory(
        &self,
        principal: &Principal,
        path: &str,
        ctx: &OpContext,
    ) -> Result<CreateDirResult, Error> {
        let canonical = canonicalize(path)?;
        let target = self.target(principal, &canonical).await?;
        Self::require(&target.driver, Capability::WRITER, "create_directory")?;
        target.driver.create_directory(&target.subpath, ctx).await
    }

    pub async fn rename(
        &self,
        principal: &Principal,
        old_path: &str,
        new_path: &str,
        ctx: &OpContext,
    ) -> Result<RenameResult, Error> {
        let old_canonical = canonicalize(old_path)?;
        let new_canonical = canonicalize(new_path)?;
        let source = self.target(principal, &old_canonical).await?;
        let dest = self.target(principal, &new_canonical).await?;

        if source.mount.id != dest.mount.id {
            return Err(Error::Validation(
                "rename across mounts is not supported; use copy".to_string(),
            ));
        }
        Self::require(&source.driver, Capability::WRITER, "rename")?;
        let mut result = source.driver.rename(&source.subpath, &dest.subpath, ctx).await?;
        result.source = old_canonical;
        result.target = new_canonical;
        Ok(result)
    }

    /// Delete paths that may span several mounts: group by mount, fan out
    /// per-driver batch deletes, and aggregate outcomes.
    pub async fn batch_delete(
        &self,
        principal: &Principal,
        paths: &[String],
        ctx: &OpContext,
    ) -> Result<BatchDeleteResult, Error> {
        let mut grouped: HashMap<String, (Target, Vec<String>)> = HashMap::new();
        let mut result = BatchDeleteResult::default();

        for path in paths {
            let canonical = match canonicalize(path) {
                Ok(canonical) => canonical,
                Err(err) => {
                    result
                        .failures
                        .push(DeleteFailure { path: path.clone(), error: err.to_string() });
                    continue;
                }
            };
            match self.target(principal, &canonical).await {
                Ok(target) => {
                    grouped
                        .entry(target.mount.id.clone())
                        .or_insert_with(|| (target, Vec::new()))
                        .1
                        .push(canonical);
                }
                Err(err) => {
                    result
                        .failures
                        .push(DeleteFailure { path: canonical, error: err.to_string() });
                }
            }
        }

        for (_, (target, paths)) in grouped {
            Self::require(&target.driver, Capability::WRITER, "delete")?;
            let subpaths: Vec<String> = paths
                .iter()
                .filter_map(|canonical| {
                    vpath::strip_mount_prefix(&target.mount.mount_path, canonical)
                        .map(str::to_string)
                })
                .collect();
            let deleted = target.driver.batch_delete(&subpaths, ctx).await?;
            result.successes += deleted.successes;
            // Report failures with their full virtual path.
            result.failures.extend(deleted.failures.into_iter().map(|f| DeleteFailure {
                path: format!(
                    "{}/{}",
                    target.mount.mount_path.trim_end_matches('/'),
                    f.path.trim_start_matches('/')
                ),
                error: f.error,
            }));
        }
        Ok(result)
    }

    /// The per-item copy policy shared by direct copies and the job engine:
    /// same-mount ATOMIC copies go through the driver; everything else is
    /// a download-from-source + upload-to-target pipeline.
    pub async fn copy_item(
        &self,
        principal: &Principal,
        source_path: &str,
        target_path: &str,
        opts: &CopyOptions,
        ctx: &OpContext,
    ) -> Result<ItemCopied, Error> {
        let src_canonical = canonicalize(source_path)?;
        let dst_canonical = canonicalize(target_path)?;
        let source = self.target(principal, &src_canonical).await?;
        let dest = self.target(principal, &dst_canonical).await?;
        Self::require(&source.driver, Capability::READER, "copy")?;
        Self::require(&dest.driver, Capability::WRITER, "copy")?;

        if source.mount.id == dest.mount.id && source.driver.has(Capability::ATOMIC) {
            let copied =
                source.driver.copy(&source.subpath, &dest.subpath, opts, ctx).await?;
            return Ok(ItemCopied { status: copied.status, bytes: 0, reason: copied.reason });
        }

        let info = source.driver.stat(&source.subpath, ctx).await?;
        if info.is_directory {
            return Ok(ItemCopied {
                status: CopyStatus::Failed,
                bytes: 0,
                reason: Some("cross-storage directory copy is not supported per item".into()),
            });
        }
        if opts.precheck
            && opts.skip_existing
            && dest.driver.exists(&dest.subpath, ctx).await?
        {
            return Ok(ItemCopied {
                status: CopyStatus::Skipped,
                bytes: 0,
                reason: Some("target exists".into()),
            });
        }

        let descriptor = source.driver.download(&source.subpath, ctx).await?;
        let reader = descriptor.open_full(&ctx.cancel).await?;
        dest.driver
            .upload(
                &dest.subpath,
                UploadBody::Stream { reader, size: descriptor.size },
                ctx,
            )
            .await?;
        Ok(ItemCopied { status: CopyStatus::Success, bytes: info.size, reason: None })
    }

    /// True when both paths land on the same mount (so a batch copy can be
    /// answered synchronously with the driver's server-side copy).
    pub async fn same_mount(
        &self,
        principal: &Principal,
        source_path: &str,
        target_path: &str,
    ) -> Result<bool, Error> {
        let src = self.target(principal, &canonicalize(source_path)?).await?;
        let dst = self.target(principal, &canonicalize(target_path)?).await?;
        Ok(src.mount.id == dst.mount.id && src.driver.has(Capability::ATOMIC))
    }

    /// A client-facing link for a file: native presigned or custom-host
    /// when the driver supports direct links, else a signed proxy URL.
    pub async fn file_link(
        &self,
        principal: &Principal,
        path: &str,
        expires_in: Option<u64>,
        force_download: bool,
    ) -> Result<PresignedDownload, Error> {
        let canonical = canonicalize(path)?;
        let target = self.target(principal, &canonical).await?;
        let opts = PresignOptions { expires_in, force_download };

        if target.driver.has(Capability::DIRECT_LINK) {
            match target.driver.presign_download(&target.subpath, &opts).await {
                Ok(link) => return Ok(link),
                // No direct URL available; fall back to the proxy path.
                Err(Error::Validation(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.proxy_link(&target, &canonical, expires_in, force_download)
    }

    /// A presigned upload slot for direct-to-backend writes.
    pub async fn presign_upload(
        &self,
        principal: &Principal,
        path: &str,
        expires_in: Option<u64>,
    ) -> Result<PresignedUpload, Error> {
        let canonical = canonicalize(path)?;
        let target = self.target(principal, &canonical).await?;
        Self::require(&target.driver, Capability::PRESIGNED, "presign_upload")?;
        target
            .driver
            .presign_upload(&target.subpath, &PresignOptions { expires_in, force_download: false })
            .await
    }

    fn proxy_link(
        &self,
        target: &Target,
        canonical: &str,
        expires_in: Option<u64>,
        force_download: bool,
    ) -> Result<PresignedDownload, Error> {
        Self::require(&target.driver, Capability::PROXY, "proxy url")?;
        if !target.mount.web_proxy {
            return Err(Error::Validation(format!(
                "mount {} does not allow proxy access",
                target.mount.mount_path
            )));
        }

        let now = Utc::now().timestamp();
        let expires_at = expires_in.map(|secs| now + secs as i64);
        let signed =
            vpath::sign_path(canonical, target.mount.sign_secret.as_bytes(), now, expires_at);

        let mut url = format!(
            "/api/p{}?sign={}&ts={}",
            canonical, signed.sign, signed.ts
        );
        if force_download {
            url.push_str("&download=1");
        }
        Ok(PresignedDownload {
            url,
            kind: LinkKind::Proxy,
            expires_at: expires_at
                .and_then(|ts| chrono::DateTime::<Utc>::from_timestamp(ts, 0)),
        })
    }

    /// Resolve and authorize a signed proxy request. The signature is the
    /// authorization: no principal is involved.
    pub async fn verify_proxy(
        &self,
        path: &str,
        query: &ProxyQuery,
    ) -> Result<Target, Error> {
        let canonical = canonicalize(path)?;
        // Proxy resolution spans all mounts; visibility is the signature.
        let admin = Principal::system();
        let target = self.target(&admin, &canonical).await?;
        Self::require(&target.driver, Capability::PROXY, "proxy")?;
        if !target.mount.web_proxy {
            return Err(Error::Forbidden("proxy access is disabled for this mount".into()));
        }

        vpath::verify_path(
            &canonical,
            target.mount.sign_secret.as_bytes(),
            &query.sign,
            query.ts,
            Utc::now().timestamp(),
        )
        .map_err(|err| Error::Forbidden(err.to_string()))?;
        Ok(target)
    }

    /// Fan a search out to every visible mount whose driver supports it.
    pub async fn search(
        &self,
        principal: &Principal,
        query: &str,
        ctx: &OpContext,
    ) -> Result<Vec<FileInfo>, Error> {
        let mut hits = Vec::new();
        for (mount, config) in self.resolver.visible_mounts(principal).await? {
            let driver = self.driver_for(&config).await?;
            if !driver.has(Capability::SEARCH) {
                continue;
            }
            match driver.search(query, ctx).await {
                Ok(found) => {
                    hits.extend(found.into_iter().map(|mut info| {
                        info.path = format!(
                            "{}/{}",
                            mount.mount_path.trim_end_matches('/'),
                            info.path.trim_start_matches('/')
                        );
                        info
                    }));
                }
                Err(err) => {
                    tracing::warn!(mount = %mount.id, ?err, "search failed on mount");
                }
            }
        }
        Ok(hits)
    }

    /// Verify client-side cross-storage copies: after the client uploaded
    /// to presigned targets, confirm each storage path landed.
    pub async fn commit_batch_copy(
        &self,
        principal: &Principal,
        target_mount_id: &str,
        files: &[(String, String)], // (target_path, storage_path)
        ctx: &OpContext,
    ) -> Result<Vec<(String, bool)>, Error> {
        let mount = self
            .store
            .get_mount(target_mount_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mount {target_mount_id}")))?;
        let config = self
            .store
            .get_storage_config(&mount.storage_config_id)
            .await?
            .ok_or_else(|| Error::NotFound("storage config".to_string()))?;
        if !principal.may_use_config(&config.id, config.is_public) {
            return Err(Error::Forbidden("mount is not visible to this principal".into()));
        }
        let driver = self.driver_for(&config).await?;

        let mut out = Vec::with_capacity(files.len());
        for (target_path, storage_path) in files {
            let landed = driver.exists(storage_path, ctx).await.unwrap_or(false);
            out.push((target_path.clone(), landed));
        }
        Ok(out)
    }

    /// Session-scoped target resolution for the multipart lifecycle.
    pub async fn target_for_session(
        &self,
        session: &UploadSession,
    ) -> Result<(Arc<dyn StorageDriver>, String), Error> {
        let mount = self
            .store
            .get_mount(&session.mount_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mount {}", session.mount_id)))?;
        let config = self
            .store
            .get_storage_config(&session.storage_config_id)
            .await?
            .ok_or_else(|| Error::NotFound("storage config".to_string()))?;
        let driver = self.driver_for(&config).await?;
        let subpath = vpath::strip_mount_prefix(&mount.mount_path, &session.fs_path)
            .ok_or_else(|| Error::Validation("session path left its mount".to_string()))?
            .to_string();
        Ok((driver, subpath))
    }

    pub async fn resolve_for(
        &self,
        principal: &Principal,
        path: &str,
    ) -> Result<Target, Error> {
        let canonical = canonicalize(path)?;
        self.target(principal, &canonical).await
    }
}

fn canonicalize(path: &str) -> Result<String, Error> {
    vpath::canonicalize(path).map_err(|err| Error::Validation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use models::{DriverKind, WebdavPolicy};
    use tokio::io::AsyncReadExt;

    async fn fixture() -> (Arc<MemoryStore>, FileSystem, tempfile::TempDir, tempfile::TempDir) {
        let store = MemoryStore::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        for (i, dir) in [&dir_a, &dir_b].into_iter().enumerate() {
            store
                .put_storage_config(StorageConfig {
                    id: format!("s{i}"),
                    kind: DriverKind::Local,
                    config: serde_json::json!({
                        "rootPath": dir.path().to_string_lossy(),
                    }),
                    is_public: true,
                    is_default: i == 0,
                    owner_id: "admin".into(),
                })
                .await;
            store
                .put_mount(Mount {
                    id: format!("m{i}"),
                    mount_path: format!("/m{i}"),
                    storage_config_id: format!("s{i}"),
                    cache_ttl: 0,
                    web_proxy: true,
                    webdav_policy: WebdavPolicy::Redirect,
                    owner: "admin".into(),
                    sign_secret: "proxy-secret".into(),
                    created_at: Utc::now(),
                    last_used_at: None,
                })
                .await;
        }

        let fs = FileSystem::new(store.clone());
        (store, fs, dir_a, dir_b)
    }

    fn admin() -> Principal {
        Principal::Admin { id: "root".into() }
    }

    async fn read_all(mut reader: storage::ByteReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_write_then_list_and_stat() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();

        fs.write(&admin(), "/m0/docs/hello.txt", UploadBody::from_bytes(&b"hi"[..]), true, &ctx)
            .await
            .unwrap();

        let listing = fs.list(&admin(), "/m0/docs", None, &ctx).await.unwrap();
        assert!(!listing.is_virtual);
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].name, "hello.txt");

        let info = fs.stat(&admin(), "/m0/docs/hello.txt", &ctx).await.unwrap();
        assert_eq!(info.path, "/m0/docs/hello.txt");
        assert_eq!(info.size, 2);
    }

    #[tokio::test]
    async fn test_virtual_root_listing() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();

        let listing = fs.list(&admin(), "/", None, &ctx).await.unwrap();
        assert!(listing.is_virtual);
        assert!(listing.is_root);
        let names: Vec<_> = listing.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["m0", "m1"]);
        assert!(listing.items.iter().all(|i| i.is_directory && i.size == 0));

        let info = fs.stat(&admin(), "/", &ctx).await.unwrap();
        assert!(info.is_virtual);
    }

    #[tokio::test]
    async fn test_cross_mount_copy_item_streams_bytes() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        let payload = b"cross-storage payload".as_slice();

        fs.write(&admin(), "/m0/src.bin", UploadBody::from_bytes(payload), true, &ctx)
            .await
            .unwrap();

        let opts = CopyOptions { skip_existing: true, precheck: true };
        let copied =
            fs.copy_item(&admin(), "/m0/src.bin", "/m1/dst.bin", &opts, &ctx).await.unwrap();
        assert_eq!(copied.status, CopyStatus::Success);
        assert_eq!(copied.bytes, payload.len() as u64);

        let (descriptor, _) = fs.download(&admin(), "/m1/dst.bin", &ctx).await.unwrap();
        assert_eq!(read_all(descriptor.open_full(&ctx.cancel).await.unwrap()).await, payload);

        // A second pass with skipExisting re-checks and skips.
        let copied =
            fs.copy_item(&admin(), "/m0/src.bin", "/m1/dst.bin", &opts, &ctx).await.unwrap();
        assert_eq!(copied.status, CopyStatus::Skipped);
    }

    #[tokio::test]
    async fn test_same_mount_copy_uses_driver() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();

        fs.write(&admin(), "/m0/a.txt", UploadBody::from_bytes(&b"x"[..]), true, &ctx)
            .await
            .unwrap();
        assert!(fs.same_mount(&admin(), "/m0/a.txt", "/m0/b.txt").await.unwrap());

        let copied = fs
            .copy_item(&admin(), "/m0/a.txt", "/m0/b.txt", &CopyOptions::default(), &ctx)
            .await
            .unwrap();
        assert_eq!(copied.status, CopyStatus::Success);
    }

    #[tokio::test]
    async fn test_batch_delete_spans_mounts() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();

        fs.write(&admin(), "/m0/one.txt", UploadBody::from_bytes(&b"1"[..]), true, &ctx)
            .await
            .unwrap();
        fs.write(&admin(), "/m1/two.txt", UploadBody::from_bytes(&b"2"[..]), true, &ctx)
            .await
            .unwrap();

        let result = fs
            .batch_delete(
                &admin(),
                &[
                    "/m0/one.txt".to_string(),
                    "/m1/two.txt".to_string(),
                    "/m1/missing.txt".to_string(),
                ],
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result.successes, 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path, "/m1/missing.txt");
    }

    #[tokio::test]
    async fn test_rename_across_mounts_rejected() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        fs.write(&admin(), "/m0/f.txt", UploadBody::from_bytes(&b"x"[..]), true, &ctx)
            .await
            .unwrap();
        let err =
            fs.rename(&admin(), "/m0/f.txt", "/m1/f.txt", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_proxy_link_round_trip() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        fs.write(&admin(), "/m0/p.txt", UploadBody::from_bytes(&b"proxied"[..]), true, &ctx)
            .await
            .unwrap();

        let link = fs.file_link(&admin(), "/m0/p.txt", Some(300), false).await.unwrap();
        assert_eq!(link.kind, LinkKind::Proxy);
        assert!(link.url.starts_with("/api/p/m0/p.txt?sign="));

        // Extract sign and ts back out of the generated URL.
        let query = link.url.split_once('?').unwrap().1;
        let mut sign = None;
        let mut ts = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("sign", v)) => sign = Some(v.to_string()),
                Some(("ts", v)) => ts = v.parse::<i64>().ok(),
                _ => {}
            }
        }
        let proxy = ProxyQuery { sign: sign.unwrap(), ts: ts.unwrap() };

        let target = fs.verify_proxy("/m0/p.txt", &proxy).await.unwrap();
        assert_eq!(target.mount.id, "m0");
        let descriptor = target.driver.download(&target.subpath, &ctx).await.unwrap();
        assert_eq!(
            read_all(descriptor.open_full(&ctx.cancel).await.unwrap()).await,
            b"proxied"
        );

        // A tampered signature is rejected.
        let bad = ProxyQuery { sign: "AAAA.0".into(), ts: proxy.ts };
        assert_eq!(fs.verify_proxy("/m0/p.txt", &bad).await.unwrap_err().code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_search_prefixes_mount_path() {
        let (_store, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        fs.write(&admin(), "/m0/findme-report.txt", UploadBody::from_bytes(&b"x"[..]), true, &ctx)
            .await
            .unwrap();

        let hits = fs.search(&admin(), "findme", &ctx).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/m0/findme-report.txt");
    }
}

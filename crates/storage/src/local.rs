use crate::descriptor::{ByteReader, CancellableReader, RangedReader, StreamDescriptor, StreamSource};
use crate::driver::{
    BatchDeleteResult, Capability, CopyOptions, CopyResult, CopyStatus, CreateDirResult,
    DeleteFailure, Listing, OpContext, RenameResult, StorageDriver, UploadBody, UploadResult,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use models::{DirEntry, DriverKind, Error, FileInfo};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

/// Results returned by a single search call are capped here.
const SEARCH_LIMIT: usize = 500;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    pub root_path: String,
    #[serde(default)]
    pub trash_path: Option<String>,
    /// Octal permission string applied to created directories, e.g. "0755".
    #[serde(default)]
    pub dir_permission: Option<String>,
    /// Octal permission string applied to written files, e.g. "0644".
    #[serde(default)]
    pub file_permission: Option<String>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub auto_create_root: bool,
}

/// Jailed POSIX directory tree.
pub struct LocalDriver {
    root: PathBuf,
    trash: Option<PathBuf>,
    dir_mode: Option<u32>,
    file_mode: Option<u32>,
    readonly: bool,
}

fn parse_octal(s: &str) -> Result<u32, Error> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|_| Error::Validation(format!("invalid octal permission {s:?}")))
}

impl LocalDriver {
    pub const CAPABILITIES: Capability = Capability::READER
        .union(Capability::WRITER)
        .union(Capability::ATOMIC)
        .union(Capability::PROXY)
        .union(Capability::SEARCH);

    pub async fn new(config: LocalConfig) -> Result<Self, Error> {
        let root = PathBuf::from(&config.root_path);
        if !root.is_absolute() {
            return Err(Error::Validation(format!(
                "rootPath must be absolute, got {:?}",
                config.root_path
            )));
        }

        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::DriverUnsupportedEnv(format!(
                    "root {:?} exists but is not a directory",
                    root
                )))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && config.auto_create_root => {
                tokio::fs::create_dir_all(&root).await.map_err(|err| {
                    Error::DriverUnsupportedEnv(format!("cannot create root {:?}: {err}", root))
                })?;
            }
            Err(err) => {
                return Err(Error::DriverUnsupportedEnv(format!(
                    "root {:?} is not accessible: {err}",
                    root
                )))
            }
        }

        // Readability, and writability unless readonly.
        let root = tokio::fs::canonicalize(&root)
            .await
            .map_err(|err| Error::DriverUnsupportedEnv(format!("cannot resolve root: {err}")))?;
        tokio::fs::read_dir(&root)
            .await
            .map_err(|err| Error::DriverUnsupportedEnv(format!("root is not readable: {err}")))?;
        if !config.readonly {
            let probe = root.join(format!(".fg-write-probe-{}", std::process::id()));
            tokio::fs::write(&probe, b"")
                .await
                .map_err(|err| Error::DriverUnsupportedEnv(format!("root is not writable: {err}")))?;
            let _ = tokio::fs::remove_file(&probe).await;
        }

        Ok(Self {
            root,
            trash: config.trash_path.map(PathBuf::from),
            dir_mode: config.dir_permission.as_deref().map(parse_octal).transpose()?,
            file_mode: config.file_permission.as_deref().map(parse_octal).transpose()?,
            readonly: config.readonly,
        })
    }

    fn require_writable(&self) -> Result<(), Error> {
        if self.readonly {
            Err(Error::DriverReadonly)
        } else {
            Ok(())
        }
    }

    /// Canonicalize `subpath`, join it to the root, and verify that no
    /// existing segment is a symlink escaping the root. The walk stops at
    /// the first nonexistent segment, so it also guards paths about to be
    /// created.
    async fn resolve(&self, subpath: &str) -> Result<PathBuf, Error> {
        let canonical = vpath::canonicalize(subpath).map_err(|err| Error::Validation(err.to_string()))?;
        let rel = canonical.trim_start_matches('/');
        let joined = self.root.join(rel);

        // Defense in depth: canonicalize() already rejects `..`.
        if !joined.starts_with(&self.root) {
            return Err(Error::DriverPathOutOfRoot(canonical));
        }

        let mut cursor = self.root.clone();
        for segment in rel.split('/').filter(|s| !s.is_empty()) {
            cursor.push(segment);
            let meta = match tokio::fs::symlink_metadata(&cursor).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
                Err(err) => return Err(Error::internal(err)),
            };
            if meta.file_type().is_symlink() {
                let resolved = tokio::fs::canonicalize(&cursor)
                    .await
                    .map_err(|_| Error::DriverSymlinkEscape(canonical.clone()))?;
                if !resolved.starts_with(&self.root) {
                    return Err(Error::DriverSymlinkEscape(canonical));
                }
            }
        }
        Ok(joined)
    }

    async fn apply_file_mode(&self, path: &Path) -> Result<(), Error> {
        #[cfg(unix)]
        if let Some(mode) = self.file_mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(Error::internal)?;
        }
        Ok(())
    }

    async fn apply_dir_mode(&self, path: &Path) -> Result<(), Error> {
        #[cfg(unix)]
        if let Some(mode) = self.dir_mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(Error::internal)?;
        }
        Ok(())
    }

    async fn entry_of(&self, path: &Path, name: String) -> Result<DirEntry, Error> {
        let meta = tokio::fs::metadata(path).await.map_err(Error::internal)?;
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        let is_directory = meta.is_dir();
        Ok(DirEntry {
            mime: (!is_directory)
                .then(|| mime_guess::from_path(path).first_raw().map(str::to_string))
                .flatten(),
            etag: (!is_directory).then(|| etag_of(meta.len(), modified)),
            size: if is_directory { 0 } else { meta.len() },
            name,
            is_directory,
            modified,
        })
    }

    /// Move one path into the trash, collide-proofed with a millisecond
    /// suffix; falls back to copy+unlink across devices.
    async fn move_to_trash(&self, path: &Path, trash: &Path) -> Result<(), Error> {
        tokio::fs::create_dir_all(trash).await.map_err(Error::internal)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".to_string());
        let target = trash.join(format!("{name}.{}", Utc::now().timestamp_millis()));

        match tokio::fs::rename(path, &target).await {
            Ok(()) => Ok(()),
            // EXDEV: trash lives on another filesystem.
            Err(err) if err.raw_os_error() == Some(18) => {
                let meta = tokio::fs::symlink_metadata(path).await.map_err(Error::internal)?;
                if meta.is_dir() {
                    copy_tree(path.to_path_buf(), target).await?;
                    tokio::fs::remove_dir_all(path).await.map_err(Error::internal)?;
                } else {
                    tokio::fs::copy(path, &target).await.map_err(Error::internal)?;
                    tokio::fs::remove_file(path).await.map_err(Error::internal)?;
                }
                Ok(())
            }
            Err(err) => Err(Error::internal(err)),
        }
    }

    async fn delete_one(&self, subpath: &str, ctx: &OpContext) -> Result<(), Error> {
        ctx.check_cancelled()?;
        let path = self.resolve(subpath).await?;
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(subpath.to_string()))
            }
            Err(err) => return Err(Error::internal(err)),
        };

        if let Some(trash) = &self.trash {
            return self.move_to_trash(&path, trash).await;
        }
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await.map_err(Error::internal)
        } else {
            tokio::fs::remove_file(&path).await.map_err(Error::internal)
        }
    }
}

fn etag_of(len: u64, modified: Option<DateTime<Utc>>) -> String {
    let millis = modified.map(|m| m.timestamp_millis()).unwrap_or_default();
    format!("{len:x}-{millis:x}")
}

fn copy_tree(src: PathBuf, dst: PathBuf) -> BoxFuture<'static, Result<(), Error>> {
    async move {
        tokio::fs::create_dir_all(&dst).await.map_err(Error::internal)?;
        let mut entries = tokio::fs::read_dir(&src).await.map_err(Error::internal)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::internal)? {
            let meta = entry.metadata().await.map_err(Error::internal)?;
            let target = dst.join(entry.file_name());
            if meta.is_dir() {
                copy_tree(entry.path(), target).await?;
            } else {
                tokio::fs::copy(entry.path(), target).await.map_err(Error::internal)?;
            }
        }
        Ok(())
    }
    .boxed()
}

struct LocalSource {
    path: PathBuf,
}

#[async_trait::async_trait]
impl StreamSource for LocalSource {
    async fn open_full(&self, cancel: &CancellationToken) -> Result<ByteReader, Error> {
        let file = tokio::fs::File::open(&self.path).await.map_err(Error::internal)?;
        Ok(Box::pin(CancellableReader::new(file, cancel.clone())))
    }

    async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<RangedReader, Error> {
        let mut file = tokio::fs::File::open(&self.path).await.map_err(Error::internal)?;
        file.seek(SeekFrom::Start(start)).await.map_err(Error::internal)?;
        let reader: ByteReader = match end {
            Some(end) => Box::pin(CancellableReader::new(
                file.take(end.saturating_sub(start) + 1),
                cancel.clone(),
            )),
            None => Box::pin(CancellableReader::new(file, cancel.clone())),
        };
        Ok(RangedReader { reader, range_honored: true })
    }

    fn supports_range(&self) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl StorageDriver for LocalDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Local
    }

    fn capabilities(&self) -> Capability {
        Self::CAPABILITIES
    }

    #[tracing::instrument(skip(self, ctx), fields(driver = "local"))]
    async fn list_directory(&self, subpath: &str, ctx: &OpContext) -> Result<Listing, Error> {
        ctx.check_cancelled()?;
        let path = self.resolve(subpath).await?;
        let mut dir = match tokio::fs::read_dir(&path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(subpath.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotADirectory => {
                return Err(Error::Validation(format!("{subpath} is not a directory")))
            }
            Err(err) => return Err(Error::internal(err)),
        };

        let mut items = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(Error::internal)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            items.push(self.entry_of(&entry.path(), name).await?);
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Listing { items, is_root: path == self.root })
    }

    async fn stat(&self, subpath: &str, ctx: &OpContext) -> Result<FileInfo, Error> {
        ctx.check_cancelled()?;
        let path = self.resolve(subpath).await?;
        let canonical = vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let modified = meta.modified().ok().map(DateTime::<Utc>::from);
                let is_directory = meta.is_dir();
                Ok(FileInfo {
                    name: vpath::file_name(&canonical).to_string(),
                    mime: (!is_directory)
                        .then(|| mime_guess::from_path(&path).first_raw().map(str::to_string))
                        .flatten(),
                    etag: (!is_directory).then(|| etag_of(meta.len(), modified)),
                    size: if is_directory { 0 } else { meta.len() },
                    path: canonical,
                    is_directory,
                    modified,
                    is_virtual: false,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(subpath.to_string()))
            }
            Err(err) => Err(Error::internal(err)),
        }
    }

    async fn download(&self, subpath: &str, ctx: &OpContext) -> Result<StreamDescriptor, Error> {
        let info = self.stat(subpath, ctx).await?;
        if info.is_directory {
            return Err(Error::Validation(format!("{subpath} is a directory")));
        }
        let path = self.resolve(subpath).await?;
        Ok(StreamDescriptor::new(
            Some(info.size),
            info.mime,
            info.etag,
            info.modified,
            Box::new(LocalSource { path }),
        ))
    }

    #[tracing::instrument(skip(self, body, ctx), fields(driver = "local"))]
    async fn upload(
        &self,
        subpath: &str,
        body: UploadBody,
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        self.require_writable()?;
        ctx.check_cancelled()?;
        let path = self.resolve(subpath).await?;

        if let Some(parent) = path.parent() {
            if !parent.starts_with(&self.root) {
                return Err(Error::DriverPathOutOfRoot(subpath.to_string()));
            }
            tokio::fs::create_dir_all(parent).await.map_err(Error::internal)?;
        }

        let mut file = tokio::fs::File::create(&path).await.map_err(Error::internal)?;
        match body {
            UploadBody::Buffer(bytes) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(&bytes).await.map_err(Error::internal)?;
                file.flush().await.map_err(Error::internal)?;
            }
            UploadBody::Stream { reader, .. } => {
                let mut reader = CancellableReader::new(reader, ctx.cancel.clone());
                tokio::io::copy(&mut reader, &mut file).await.map_err(|err| {
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        Error::Cancelled
                    } else {
                        Error::internal(err)
                    }
                })?;
            }
        }
        self.apply_file_mode(&path).await?;

        let canonical = vpath::canonicalize(subpath).map_err(|e| Error::Validation(e.to_string()))?;
        Ok(UploadResult { storage_path: canonical })
    }

    async fn create_directory(
        &self,
        subpath: &str,
        ctx: &OpContext,
    ) -> Result<CreateDirResult, Error> {
        self.require_writable()?;
        ctx.check_cancelled()?;
        let path = self.resolve(subpath).await?;
        if tokio::fs::try_exists(&path).await.map_err(Error::internal)? {
            let meta = tokio::fs::metadata(&path).await.map_err(Error::internal)?;
            if !meta.is_dir() {
                return Err(Error::Conflict(format!("{subpath} exists and is not a directory")));
            }
            return Ok(CreateDirResult { already_existed: true });
        }
        tokio::fs::create_dir_all(&path).await.map_err(Error::internal)?;
        self.apply_dir_mode(&path).await?;
        Ok(CreateDirResult { already_existed: false })
    }

    async fn rename(
        &self,
        old_subpath: &str,
        new_subpath: &str,
        ctx: &OpContext,
    ) -> Result<RenameResult, Error> {
        self.require_writable()?;
        ctx.check_cancelled()?;
        let old = self.resolve(old_subpath).await?;
        let new = self.resolve(new_subpath).await?;

        if !tokio::fs::try_exists(&old).await.map_err(Error::internal)? {
            return Err(Error::NotFound(old_subpath.to_string()));
        }
        if let Some(parent) = new.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::internal)?;
        }
        tokio::fs::rename(&old, &new).await.map_err(Error::internal)?;
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
        self.require_writable()?;
        ctx.check_cancelled()?;
        let src = self.resolve(src_subpath).await?;
        let dst = self.resolve(dst_subpath).await?;

        let meta = match tokio::fs::metadata(&src).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(src_subpath.to_string()))
            }
            Err(err) => return Err(Error::internal(err)),
        };

        if opts.precheck
            && opts.skip_existing
            && tokio::fs::try_exists(&dst).await.map_err(Error::internal)?
        {
            return Ok(CopyResult {
                status: CopyStatus::Skipped,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: Some("target exists".to_string()),
            });
        }

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::internal)?;
        }
        let outcome = if meta.is_dir() {
            copy_tree(src, dst).await
        } else {
            tokio::fs::copy(&src, &dst).await.map(|_| ()).map_err(Error::internal)
        };

        Ok(match outcome {
            Ok(()) => CopyResult {
                status: CopyStatus::Success,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: None,
            },
            Err(err) => CopyResult {
                status: CopyStatus::Failed,
                source: src_subpath.to_string(),
                target: dst_subpath.to_string(),
                reason: Some(err.to_string()),
            },
        })
    }

    async fn batch_delete(
        &self,
        subpaths: &[String],
        ctx: &OpContext,
    ) -> Result<BatchDeleteResult, Error> {
        self.require_writable()?;
        let mut result = BatchDeleteResult::default();
        for subpath in subpaths {
            match self.delete_one(subpath, ctx).await {
                Ok(()) => result.successes += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => result
                    .failures
                    .push(DeleteFailure { path: subpath.clone(), error: err.to_string() }),
            }
        }
        Ok(result)
    }

    async fn search(&self, query: &str, ctx: &OpContext) -> Result<Vec<FileInfo>, Error> {
        let needle = query.to_lowercase();
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            ctx.check_cancelled()?;
            if out.len() >= SEARCH_LIMIT {
                break;
            }
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await.map_err(Error::internal)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = entry.path();
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if meta.is_dir() {
                    stack.push(path.clone());
                }
                if name.to_lowercase().contains(&needle) {
                    let rel = path.strip_prefix(&self.root).unwrap_or(&path);
                    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
                    out.push(FileInfo {
                        name,
                        path: format!("/{}", rel.to_string_lossy()),
                        is_directory: meta.is_dir(),
                        size: if meta.is_dir() { 0 } else { meta.len() },
                        modified,
                        etag: None,
                        mime: None,
                        is_virtual: false,
                    });
                    if out.len() >= SEARCH_LIMIT {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn driver(dir: &tempfile::TempDir) -> LocalDriver {
        LocalDriver::new(LocalConfig {
            root_path: dir.path().to_string_lossy().into_owned(),
            trash_path: None,
            dir_permission: None,
            file_permission: None,
            readonly: false,
            auto_create_root: false,
        })
        .await
        .unwrap()
    }

    async fn read_all(mut reader: ByteReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();

        drv.upload("a/b.txt", UploadBody::from_bytes(&b"hello world"[..]), &ctx)
            .await
            .unwrap();

        let desc = drv.download("a/b.txt", &ctx).await.unwrap();
        assert_eq!(desc.size, Some(11));
        assert!(desc.supports_range());
        assert_eq!(read_all(desc.open_full(&ctx.cancel).await.unwrap()).await, b"hello world");

        let ranged = desc.open_range(6, Some(10), &ctx.cancel).await.unwrap();
        assert_eq!(read_all(ranged).await, b"world");
    }

    #[tokio::test]
    async fn test_rename_round_trip_restores_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();

        drv.upload("x.bin", UploadBody::from_bytes(&b"payload"[..]), &ctx).await.unwrap();
        drv.rename("x.bin", "y.bin", &ctx).await.unwrap();
        drv.rename("y.bin", "x.bin", &ctx).await.unwrap();

        let desc = drv.download("x.bin", &ctx).await.unwrap();
        assert_eq!(read_all(desc.open_full(&ctx.cancel).await.unwrap()).await, b"payload");
    }

    #[tokio::test]
    async fn test_listing_and_root_flag() {
        let dir = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();

        let root = drv.list_directory("", &ctx).await.unwrap();
        assert!(root.is_root);
        assert!(root.items.is_empty());

        drv.create_directory("sub", &ctx).await.unwrap();
        drv.upload("sub/f.txt", UploadBody::from_bytes(&b"x"[..]), &ctx).await.unwrap();

        let sub = drv.list_directory("sub", &ctx).await.unwrap();
        assert!(!sub.is_root);
        assert_eq!(sub.items.len(), 1);
        assert_eq!(sub.items[0].name, "f.txt");
        assert!(!sub.items[0].is_directory);
    }

    #[tokio::test]
    async fn test_symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();

        tokio::fs::write(outside.path().join("secret.txt"), b"secret").await.unwrap();
        tokio::fs::symlink(outside.path(), dir.path().join("leak")).await.unwrap();

        let err = drv.download("leak/secret.txt", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "DRIVER_SYMLINK_ESCAPE");

        let err = drv
            .upload("leak/new.txt", UploadBody::from_bytes(&b"x"[..]), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DRIVER_SYMLINK_ESCAPE");
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();
        let err = drv.stat("../etc/passwd", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_readonly_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let drv = LocalDriver::new(LocalConfig {
            root_path: dir.path().to_string_lossy().into_owned(),
            trash_path: None,
            dir_permission: None,
            file_permission: None,
            readonly: true,
            auto_create_root: false,
        })
        .await
        .unwrap();
        let ctx = OpContext::default();

        let err = drv
            .upload("f.txt", UploadBody::from_bytes(&b"x"[..]), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DRIVER_READONLY");
    }

    #[tokio::test]
    async fn test_trash_keeps_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let trash = dir.path().join(".trash");
        let drv = LocalDriver::new(LocalConfig {
            root_path: dir.path().to_string_lossy().into_owned(),
            trash_path: Some(trash.to_string_lossy().into_owned()),
            dir_permission: None,
            file_permission: None,
            readonly: false,
            auto_create_root: false,
        })
        .await
        .unwrap();
        let ctx = OpContext::default();

        drv.upload("doomed.txt", UploadBody::from_bytes(&b"x"[..]), &ctx).await.unwrap();
        let result = drv.batch_delete(&["doomed.txt".to_string()], &ctx).await.unwrap();
        assert_eq!(result.successes, 1);
        assert!(result.failures.is_empty());

        let mut trashed = tokio::fs::read_dir(&trash).await.unwrap();
        let entry = trashed.next_entry().await.unwrap().unwrap();
        assert!(entry.file_name().to_string_lossy().starts_with("doomed.txt."));
    }

    #[tokio::test]
    async fn test_copy_skip_existing() {
        let dir = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();

        drv.upload("a.txt", UploadBody::from_bytes(&b"one"[..]), &ctx).await.unwrap();
        drv.upload("b.txt", UploadBody::from_bytes(&b"two"[..]), &ctx).await.unwrap();

        let opts = CopyOptions { skip_existing: true, precheck: true };
        let result = drv.copy("a.txt", "b.txt", &opts, &ctx).await.unwrap();
        assert_eq!(result.status, CopyStatus::Skipped);

        let result = drv.copy("a.txt", "c.txt", &opts, &ctx).await.unwrap();
        assert_eq!(result.status, CopyStatus::Success);
        let desc = drv.download("c.txt", &ctx).await.unwrap();
        assert_eq!(read_all(desc.open_full(&ctx.cancel).await.unwrap()).await, b"one");
    }

    #[tokio::test]
    async fn test_batch_delete_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();

        drv.upload("keep/here.txt", UploadBody::from_bytes(&b"x"[..]), &ctx).await.unwrap();
        let result = drv
            .batch_delete(&["keep/here.txt".to_string(), "missing.txt".to_string()], &ctx)
            .await
            .unwrap();
        assert_eq!(result.successes, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path, "missing.txt");
    }

    #[tokio::test]
    async fn test_search_finds_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let drv = driver(&dir).await;
        let ctx = OpContext::default();

        drv.upload("docs/report-final.txt", UploadBody::from_bytes(&b"x"[..]), &ctx)
            .await
            .unwrap();
        drv.upload("docs/other.txt", UploadBody::from_bytes(&b"x"[..]), &ctx).await.unwrap();

        let hits = drv.search("REPORT", &ctx).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "report-final.txt");
        assert_eq!(hits[0].path, "/docs/report-final.txt");
    }
}

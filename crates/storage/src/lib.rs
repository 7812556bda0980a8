mod descriptor;
mod driver;
mod graph;
mod local;
mod multipart;
mod s3;
mod webdav;

pub use descriptor::{
    slice_reader, ByteReader, CancellableReader, RangedReader, StreamDescriptor, StreamSource,
};
pub use driver::{
    BatchDeleteResult, Capability, CopyOptions, CopyResult, CopyStatus, CreateDirResult,
    DeleteFailure, LinkKind, Listing, OpContext, PresignOptions, PresignedDownload,
    PresignedUpload, RenameResult, StorageDriver, UploadBody, UploadResult,
};
pub use graph::{GraphConfig, GraphDriver};
pub use local::{LocalConfig, LocalDriver};
pub use multipart::{
    CompletedPart, MultipartInit, MultipartInitResult, OngoingUpload, PartInfo, PartPlan,
};
pub use s3::{S3Config, S3Driver};
pub use webdav::{WebdavConfig, WebdavDriver};

use models::{DriverKind, Error, StorageConfig};
use std::sync::Arc;

/// Construct a driver instance from a storage config.
///
/// The config document must already be decrypted; drivers deserialize it
/// into their own config type and validate their environment.
pub async fn build_driver(config: &StorageConfig) -> Result<Arc<dyn StorageDriver>, Error> {
    fn parse<T: serde::de::DeserializeOwned>(config: &StorageConfig) -> Result<T, Error> {
        serde_json::from_value(config.config.clone())
            .map_err(|err| Error::Validation(format!("invalid {} config: {err}", config.kind)))
    }

    Ok(match config.kind {
        DriverKind::Local => Arc::new(LocalDriver::new(parse::<LocalConfig>(config)?).await?),
        DriverKind::S3 => Arc::new(S3Driver::new(parse::<S3Config>(config)?).await?),
        DriverKind::Webdav => Arc::new(WebdavDriver::new(parse::<WebdavConfig>(config)?)?),
        DriverKind::Graph => Arc::new(GraphDriver::new(parse::<GraphConfig>(config)?)?),
    })
}

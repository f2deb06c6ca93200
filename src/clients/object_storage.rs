//! The S3 repository accessed directly through `object_store`
//!
//! Used for the connectivity probe before a backup and for uploading backup
//! logs next to the backups themselves.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info};

use super::ObjectStorage;
use crate::model::S3Config;

/// Object written (and removed again) by the connectivity probe
const PROBE_OBJECT: &str = ".postgres-lifecycle-probe";

#[derive(Debug, thiserror::Error)]
pub enum ObjectStorageError {
    #[error("S3 configuration incomplete: missing {0}")]
    Incomplete(String),

    #[error("Object storage error: {0}")]
    Store(#[from] object_store::Error),
}

type Result<T> = std::result::Result<T, ObjectStorageError>;

/// S3 access built per call from the current configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct S3ObjectStorage;

impl S3ObjectStorage {
    pub fn new() -> Self {
        Self
    }

    fn build_store(s3: &S3Config) -> Result<Arc<dyn ObjectStore>> {
        let missing = s3.missing_parameters();
        if !missing.is_empty() {
            return Err(ObjectStorageError::Incomplete(missing.join(", ")));
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(s3.bucket.as_deref().unwrap_or_default())
            .with_region(s3.region_or_default())
            .with_access_key_id(s3.access_key.as_deref().unwrap_or_default())
            .with_secret_access_key(s3.secret_key.as_deref().unwrap_or_default());

        if let Some(endpoint) = &s3.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        builder = builder.with_virtual_hosted_style_request(!s3.uses_path_style());

        Ok(Arc::new(builder.build()?))
    }
}

/// Object key below the repository path
fn object_path(s3: &S3Config, key: &str) -> ObjectPath {
    let prefix = s3.normalized_path();
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        ObjectPath::from(key)
    } else {
        ObjectPath::from(format!("{}/{}", prefix, key.trim_start_matches('/')))
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn probe(&self, s3: &S3Config) -> Result<()> {
        let store = Self::build_store(s3)?;
        let path = object_path(s3, PROBE_OBJECT);
        store.put(&path, PutPayload::from_static(b"ok")).await?;
        store.delete(&path).await?;
        debug!(repository = %s3.repository(), "Repository reachable");
        Ok(())
    }

    async fn upload(&self, s3: &S3Config, key: &str, body: String) -> Result<()> {
        let store = Self::build_store(s3)?;
        let path = object_path(s3, key);
        store.put(&path, PutPayload::from(body)).await?;
        info!(path = %path, "Uploaded object to repository");
        Ok(())
    }
}

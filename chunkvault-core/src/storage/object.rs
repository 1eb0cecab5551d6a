//! Object storage backend: key `{base_path}/chunk{N}.csv` in a bucket.
//!
//! Object stores have no sentinel locking; concurrent writers to the same
//! key race and the last write wins.

use super::{chunk_file_name, ChunkBackend, StoreError};
use crate::config::{ConfigError, StorageType};
use async_trait::async_trait;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub struct ObjectBackend {
    bucket: String,
    prefix: String,
    store: RwLock<Option<Arc<dyn ObjectStore>>>,
}

impl fmt::Debug for ObjectBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBackend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ObjectBackend {
    /// Google Cloud Storage client built from environment credentials.
    pub fn from_bucket(bucket: &str, prefix: &str) -> Result<Self, ConfigError> {
        let gcs = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| ConfigError::ObjectStore(e.to_string()))?;
        Ok(Self::with_store(bucket, prefix, Arc::new(gcs)))
    }

    /// Wrap any `ObjectStore`, e.g. `object_store::memory::InMemory`.
    pub fn with_store(bucket: &str, prefix: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            store: RwLock::new(Some(store)),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(&self, index: u64) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(chunk_file_name(index))
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, chunk_file_name(index)))
        }
    }

    fn client(&self) -> Result<Arc<dyn ObjectStore>, StoreError> {
        let guard = self.store.read().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(Arc::clone).ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl ChunkBackend for ObjectBackend {
    fn kind(&self) -> StorageType {
        StorageType::Object
    }

    fn location(&self, index: u64) -> String {
        format!("{}/{}", self.bucket, self.key(index))
    }

    async fn exists(&self, index: u64) -> Result<bool, StoreError> {
        match self.client()?.head(&self.key(index)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, index: u64) -> Result<Option<String>, StoreError> {
        let key = self.key(index);
        let result = match self.client()?.get(&key).await {
            Ok(r) => r,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;
        let text = String::from_utf8(bytes.to_vec()).map_err(crate::data::CodecError::from)?;
        Ok(Some(text))
    }

    async fn write(&self, index: u64, contents: String) -> Result<(), StoreError> {
        let key = self.key(index);
        let payload = PutPayload::from(bytes::Bytes::from(contents));
        self.client()?.put(&key, payload).await?;
        debug!(key = %key, "chunk object written");
        Ok(())
    }

    async fn delete(&self, index: u64) -> Result<(), StoreError> {
        match self.client()?.delete(&self.key(index)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(&self, from: u64, to: u64) -> Result<(), StoreError> {
        self.client()?
            .rename(&self.key(from), &self.key(to))
            .await
            .map_err(Into::into)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.store.write().unwrap_or_else(|p| p.into_inner());
        if guard.take().is_some() {
            info!(bucket = %self.bucket, "object store client closed");
        }
        Ok(())
    }
}

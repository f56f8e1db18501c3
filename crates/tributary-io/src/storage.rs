//! Blob storage capability
//!
//! Sources and sinks see storage through [`BlobStorage`]. The production
//! implementation delegates to any `object_store` backend.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use tributary_core::spec::StorageSpec;
use tributary_core::{StreamError, StreamResult};

/// A listed blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobDescriptor {
    /// Full path of the blob inside the store
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub size: usize,
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadedBlob {
    pub path: String,
    pub size: usize,
    pub e_tag: Option<String>,
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// List every blob under a directory-like prefix
    async fn list_blobs(&self, prefix: &str) -> StreamResult<Vec<BlobDescriptor>>;

    /// Read a whole blob, `None` when it does not exist
    async fn get_blob_content(&self, path: &str, name: &str) -> StreamResult<Option<Bytes>>;

    async fn stream_blob_content(
        &self,
        path: &str,
        name: &str,
    ) -> StreamResult<BoxStream<'static, StreamResult<Bytes>>>;

    async fn save_bytes_as_blob(
        &self,
        bytes: Bytes,
        path: &str,
        name: &str,
    ) -> StreamResult<UploadedBlob>;

    /// Remove a blob; removing a missing blob succeeds
    async fn remove_blob(&self, path: &str, name: &str) -> StreamResult<()>;
}

/// Read and decode a JSON blob
pub async fn get_blob_json<T: DeserializeOwned>(
    storage: &dyn BlobStorage,
    path: &str,
    name: &str,
) -> StreamResult<Option<T>> {
    match storage.get_blob_content(path, name).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Join a folder and a blob name into a store path
pub fn blob_path(path: &str, name: &str) -> String {
    let path = path.trim_matches('/');
    let name = name.trim_start_matches('/');
    match (path.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => path.to_string(),
        (false, false) => format!("{path}/{name}"),
    }
}

/// Last path segment of a blob name
pub fn file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn map_store_error(e: object_store::Error) -> StreamError {
    match e {
        object_store::Error::NotFound { path, .. } => StreamError::NotFound(path),
        other => StreamError::io(other.to_string()),
    }
}

/// [`BlobStorage`] over an `object_store` backend
#[derive(Clone)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Process-local store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

#[async_trait]
impl BlobStorage for ObjectStoreStorage {
    async fn list_blobs(&self, prefix: &str) -> StreamResult<Vec<BlobDescriptor>> {
        let prefix = prefix.trim_matches('/');
        let prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        let metas: Vec<_> = self
            .store
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(map_store_error)?;
        debug!(count = metas.len(), "listed blobs");
        Ok(metas
            .into_iter()
            .map(|m| BlobDescriptor {
                name: m.location.to_string(),
                last_modified: m.last_modified,
                size: m.size,
            })
            .collect())
    }

    async fn get_blob_content(&self, path: &str, name: &str) -> StreamResult<Option<Bytes>> {
        let location = ObjectPath::from(blob_path(path, name));
        match self.store.get(&location).await {
            Ok(result) => Ok(Some(result.bytes().await.map_err(map_store_error)?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_store_error(e)),
        }
    }

    async fn stream_blob_content(
        &self,
        path: &str,
        name: &str,
    ) -> StreamResult<BoxStream<'static, StreamResult<Bytes>>> {
        let location = ObjectPath::from(blob_path(path, name));
        let result = self.store.get(&location).await.map_err(map_store_error)?;
        Ok(result.into_stream().map_err(map_store_error).boxed())
    }

    async fn save_bytes_as_blob(
        &self,
        bytes: Bytes,
        path: &str,
        name: &str,
    ) -> StreamResult<UploadedBlob> {
        let full = blob_path(path, name);
        let size = bytes.len();
        let result = self
            .store
            .put(&ObjectPath::from(full.as_str()), bytes)
            .await
            .map_err(map_store_error)?;
        debug!(path = %full, size, "blob written");
        Ok(UploadedBlob {
            path: full,
            size,
            e_tag: result.e_tag,
        })
    }

    async fn remove_blob(&self, path: &str, name: &str) -> StreamResult<()> {
        let location = ObjectPath::from(blob_path(path, name));
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error(e)),
        }
    }
}

/// Build the storage backend described by a configuration entry
pub fn build_storage(spec: &StorageSpec) -> StreamResult<Arc<dyn BlobStorage>> {
    let store: Arc<dyn ObjectStore> = match spec {
        StorageSpec::Local { root } => {
            std::fs::create_dir_all(root)?;
            info!(root = %root, "using local file system storage");
            Arc::new(LocalFileSystem::new_with_prefix(root).map_err(map_store_error)?)
        }
        StorageSpec::S3 {
            bucket,
            region,
            endpoint,
            access_key,
            secret_key,
        } => {
            info!(bucket = %bucket, region = %region, "using S3 storage");
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_region(region);
            if let Some(endpoint) = endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }
            if let (Some(key), Some(secret)) = (access_key, secret_key) {
                builder = builder
                    .with_access_key_id(key)
                    .with_secret_access_key(secret);
            }
            Arc::new(builder.build().map_err(map_store_error)?)
        }
        StorageSpec::Azure {
            account,
            container,
            access_key,
        } => {
            info!(account = %account, container = %container, "using Azure blob storage");
            let mut builder = MicrosoftAzureBuilder::from_env()
                .with_account(account)
                .with_container_name(container);
            if let Some(key) = access_key {
                builder = builder.with_access_key(key);
            }
            Arc::new(builder.build().map_err(map_store_error)?)
        }
        StorageSpec::Memory => Arc::new(InMemory::new()),
    };
    Ok(Arc::new(ObjectStoreStorage::new(store)))
}

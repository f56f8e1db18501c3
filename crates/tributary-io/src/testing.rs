//! Test doubles for storage and SQL capabilities

use crate::sql::{SqlClient, SqlResultSet};
use crate::storage::{BlobDescriptor, BlobStorage, ObjectStoreStorage, UploadedBlob};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tributary_core::StreamResult;

pub struct CountingStorage {
    pub inner: ObjectStoreStorage,
    list_calls: AtomicUsize,
}

impl CountingStorage {
    pub fn new() -> Self {
        Self {
            inner: ObjectStoreStorage::in_memory(),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub async fn put(&self, path: &str, name: &str, content: &str) {
        self.inner
            .save_bytes_as_blob(Bytes::from(content.to_string()), path, name)
            .await
            .unwrap();
    }
}

#[async_trait]
impl BlobStorage for CountingStorage {
    async fn list_blobs(&self, prefix: &str) -> StreamResult<Vec<BlobDescriptor>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_blobs(prefix).await
    }

    async fn get_blob_content(&self, path: &str, name: &str) -> StreamResult<Option<Bytes>> {
        self.inner.get_blob_content(path, name).await
    }

    async fn stream_blob_content(
        &self,
        path: &str,
        name: &str,
    ) -> StreamResult<BoxStream<'static, StreamResult<Bytes>>> {
        self.inner.stream_blob_content(path, name).await
    }

    async fn save_bytes_as_blob(
        &self,
        bytes: Bytes,
        path: &str,
        name: &str,
    ) -> StreamResult<UploadedBlob> {
        self.inner.save_bytes_as_blob(bytes, path, name).await
    }

    async fn remove_blob(&self, path: &str, name: &str) -> StreamResult<()> {
        self.inner.remove_blob(path, name).await
    }
}

type QueryHandler = Box<dyn FnMut(&str) -> StreamResult<SqlResultSet> + Send>;

/// SQL double answering queries through a closure and recording them
pub struct MockSqlClient {
    handler: QueryHandler,
    pub queries: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

impl MockSqlClient {
    pub fn new(handler: impl FnMut(&str) -> StreamResult<SqlResultSet> + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            queries: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SqlClient for MockSqlClient {
    async fn execute_reader(&mut self, query: &str) -> StreamResult<SqlResultSet> {
        self.queries.lock().unwrap().push(query.to_string());
        (self.handler)(query)
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

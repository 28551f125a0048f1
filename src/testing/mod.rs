// Shared fixtures for the unit tests

mod archive_fixture;

pub(crate) use archive_fixture::build_zip;

use crate::error::{AtlasError, Result};
use crate::store::{Document, DocumentStore, MemoryStore, Query, TableRef};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A `MemoryStore` that counts reads and can be told to fail the next reads of a table.
#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    finds: AtomicUsize,
    failing: Mutex<Option<(String, usize)>>,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        FaultyStore::default()
    }

    /// Number of `find` calls so far, including those behind `find_one` and `distinct`.
    pub(crate) fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_reads(&self, table: &str, times: usize) {
        *self.failing.lock().unwrap() = Some((table.to_string(), times));
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn find(&self, table: &TableRef, query: &Query) -> Result<Vec<Document>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = self.failing.lock().unwrap();
            if let Some((name, remaining)) = failing.as_mut() {
                if name == table.table() && *remaining > 0 {
                    *remaining -= 1;
                    return Err(AtlasError::Storage(format!("read of {} refused", table)));
                }
            }
        }
        self.inner.find(table, query).await
    }

    async fn delete_all(&self, table: &TableRef) -> Result<usize> {
        self.inner.delete_all(table).await
    }

    async fn insert_many(&self, table: &TableRef, docs: Vec<Document>) -> Result<()> {
        self.inner.insert_many(table, docs).await
    }

    async fn insert_if_absent(&self, table: &TableRef, query: &Query, doc: Document) -> Result<bool> {
        self.inner.insert_if_absent(table, query, doc).await
    }

    async fn update_one(
        &self,
        table: &TableRef,
        query: &Query,
        fields: Document,
        upsert: bool,
    ) -> Result<()> {
        self.inner.update_one(table, query, fields, upsert).await
    }
}

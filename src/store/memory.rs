use super::{Document, DocumentStore, Query, TableRef, apply_update, push_if_absent};
use crate::error::{AtlasError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<TableRef, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TableRef, Vec<Document>>>> {
        self.tables
            .read()
            .map_err(|e| AtlasError::Storage(format!("Failed to lock memory store: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TableRef, Vec<Document>>>> {
        self.tables
            .write()
            .map_err(|e| AtlasError::Storage(format!("Failed to lock memory store: {}", e)))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, table: &TableRef, query: &Query) -> Result<Vec<Document>> {
        let tables = self.read()?;
        Ok(tables
            .get(table)
            .map(|docs| query.apply(docs))
            .unwrap_or_default())
    }

    async fn delete_all(&self, table: &TableRef) -> Result<usize> {
        let mut tables = self.write()?;
        Ok(tables.remove(table).map(|docs| docs.len()).unwrap_or(0))
    }

    async fn insert_many(&self, table: &TableRef, docs: Vec<Document>) -> Result<()> {
        let mut tables = self.write()?;
        tables.entry(table.clone()).or_default().extend(docs);
        Ok(())
    }

    async fn insert_if_absent(&self, table: &TableRef, query: &Query, doc: Document) -> Result<bool> {
        let mut tables = self.write()?;
        Ok(push_if_absent(tables.entry(table.clone()).or_default(), query, doc))
    }

    async fn update_one(
        &self,
        table: &TableRef,
        query: &Query,
        fields: Document,
        upsert: bool,
    ) -> Result<()> {
        let mut tables = self.write()?;
        let docs = tables.entry(table.clone()).or_default();
        apply_update(docs, query, fields, upsert);
        Ok(())
    }
}

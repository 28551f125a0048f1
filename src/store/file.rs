use super::{Document, DocumentStore, Query, TableRef, apply_update, push_if_absent};
use crate::error::{AtlasError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// One JSON array file per table: `<root>/<dataset>/<table>.json`.
///
/// Every write goes through a temporary file followed by a rename, so a reader
/// sees either the previous or the new contents of a table, never a mix.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(table.dataset())
            .join(format!("{}.json", table.table()))
    }

    async fn load(&self, table: &TableRef) -> Result<Vec<Document>> {
        let path = self.table_path(table);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AtlasError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AtlasError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save(&self, table: &TableRef, docs: &[Document]) -> Result<()> {
        let path = self.table_path(table);
        let storage_err =
            |e: std::io::Error| AtlasError::Storage(format!("Failed to write {}: {}", path.display(), e));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(storage_err)?;
        }

        let json = serde_json::to_vec(docs)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(storage_err)?;
        fs::rename(&tmp, &path).await.map_err(storage_err)?;

        debug!(table = %table, documents = docs.len(), "table file written");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn find(&self, table: &TableRef, query: &Query) -> Result<Vec<Document>> {
        let docs = self.load(table).await?;
        Ok(query.apply(&docs))
    }

    async fn delete_all(&self, table: &TableRef) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let existing = self.load(table).await?.len();
        self.save(table, &[]).await?;
        Ok(existing)
    }

    async fn insert_many(&self, table: &TableRef, docs: Vec<Document>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut existing = self.load(table).await?;
        existing.extend(docs);
        self.save(table, &existing).await
    }

    async fn insert_if_absent(&self, table: &TableRef, query: &Query, doc: Document) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load(table).await?;
        if !push_if_absent(&mut docs, query, doc) {
            return Ok(false);
        }
        self.save(table, &docs).await?;
        Ok(true)
    }

    async fn update_one(
        &self,
        table: &TableRef,
        query: &Query,
        fields: Document,
        upsert: bool,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load(table).await?;
        apply_update(&mut docs, query, fields, upsert);
        self.save(table, &docs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn tables_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let shapes = TableRef::new("SC", "shapes").unwrap();

        {
            let store = FileStore::new(dir.path());
            store
                .insert_many(
                    &shapes,
                    vec![
                        doc(json!({"shape_id": "s1", "shape_pt_sequence": 2})),
                        doc(json!({"shape_id": "s1", "shape_pt_sequence": 1})),
                    ],
                )
                .await
                .unwrap();
        }

        let reopened = FileStore::new(dir.path());
        let points = reopened
            .find(&shapes, &Query::all().eq("shape_id", "s1").sort_by("shape_pt_sequence"))
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["shape_pt_sequence"], 1);
        assert!(dir.path().join("SC").join("shapes.json").exists());
        assert!(!dir.path().join("SC").join("shapes.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_table_reads_empty_and_delete_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let trips = TableRef::new("SC", "trips").unwrap();

        assert!(store.find(&trips, &Query::all()).await.unwrap().is_empty());
        store
            .insert_many(&trips, vec![doc(json!({"trip_id": "t1"}))])
            .await
            .unwrap();
        assert_eq!(store.delete_all(&trips).await.unwrap(), 1);
        assert!(store.find(&trips, &Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_table_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("SC")).unwrap();
        std::fs::write(dir.path().join("SC").join("stops.json"), b"{not json").unwrap();

        let store = FileStore::new(dir.path());
        let stops = TableRef::new("SC", "stops").unwrap();
        assert!(matches!(
            store.find(&stops, &Query::all()).await,
            Err(AtlasError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let checksums = TableRef::new("SC", "checksums").unwrap();

        let updates = (0..8).map(|i| {
            let store = &store;
            let checksums = &checksums;
            async move {
                let mut fields = Document::new();
                fields.insert(format!("table{}", i), json!(i.to_string()));
                store.update_one(checksums, &Query::all(), fields, true).await
            }
        });
        for result in futures::future::join_all(updates).await {
            result.unwrap();
        }

        let all = store.find(&checksums, &Query::all()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].len(), 8);
    }
}

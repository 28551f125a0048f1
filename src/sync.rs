// Replaces the raw GTFS tables of a dataset with the contents of a downloaded archive,
// skipping every table (or the whole archive) whose content hash is unchanged.
//
// Commit order: a table's data is replaced first and its checksum written second, and
// the archive checksum is written only once every table succeeded.

use crate::archive::{self, ArchiveEntry};
use crate::checksum::{ARCHIVE_KEY, CHECKSUM_TABLE, ChecksumStore, content_hash};
use crate::error::{AtlasError, Result};
use crate::geometry::GEOMETRY_TABLE;
use crate::normalize::normalize;
use crate::progress::ProgressSink;
use crate::store::{DatasetSession, Document, DocumentStore, Query, TableRef};
use bytes::Bytes;
use chrono::Utc;
use chrono_tz::Tz;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

pub const TABLE_META: &str = "table_meta";

/// Names owned by the pipeline, as tables or as checksum keys; an archive file with one of
/// these names is ignored.
const RESERVED_TABLES: &[&str] = &[CHECKSUM_TABLE, TABLE_META, GEOMETRY_TABLE, ARCHIVE_KEY];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    Unchanged,
    Replaced { rows: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSync {
    pub table: String,
    #[serde(flatten)]
    pub status: TableStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub archive_hash: String,
    pub archive_unchanged: bool,
    pub tables: Vec<TableSync>,
}

impl SyncReport {
    pub fn replaced_tables(&self) -> impl Iterator<Item = &TableSync> {
        self.tables
            .iter()
            .filter(|t| matches!(t.status, TableStatus::Replaced { .. }))
    }

    pub fn changed(&self) -> bool {
        self.replaced_tables().next().is_some()
    }
}

/// What the last successful replace of a table looked like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub table: String,
    pub header: Vec<String>,
    pub rows: usize,
    pub checksum: String,
    pub synced_at: String,
}

impl TableMeta {
    /// Reads go straight to the store, without holding the dataset.
    pub async fn load_all(store: &dyn DocumentStore, dataset: &str) -> Result<Vec<TableMeta>> {
        let docs = store
            .find(&TableRef::new(dataset, TABLE_META)?, &Query::all().sort_by("table"))
            .await?;
        docs.into_iter()
            .map(|doc| -> Result<TableMeta> {
                Ok(serde_json::from_value(serde_json::Value::Object(doc))?)
            })
            .collect()
    }

    pub async fn load(store: &dyn DocumentStore, dataset: &str, table: &str) -> Result<Option<TableMeta>> {
        let doc = store
            .find_one(&TableRef::new(dataset, TABLE_META)?, &Query::all().eq("table", table))
            .await?;
        doc.map(|doc| -> Result<TableMeta> {
            Ok(serde_json::from_value(serde_json::Value::Object(doc))?)
        })
        .transpose()
    }
}

pub struct TableSyncEngine {
    timezone: Tz,
}

impl TableSyncEngine {
    pub fn new(timezone: Tz) -> Self {
        TableSyncEngine { timezone }
    }

    pub async fn sync(
        &self,
        session: &DatasetSession,
        archive: Bytes,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport> {
        let checksums = ChecksumStore::new(session)?;
        let stored = checksums.get().await?.unwrap_or_default();

        let archive_hash = content_hash(&archive);
        if stored.get(ARCHIVE_KEY) == Some(&archive_hash) {
            sink.notify("GTFS archive unchanged, nothing to do");
            return Ok(SyncReport {
                archive_hash,
                archive_unchanged: true,
                tables: Vec::new(),
            });
        }

        let entries = archive::open(archive)?;
        let entries = Self::table_entries(entries, sink)?;

        let results = join_all(
            entries
                .iter()
                .map(|entry| self.sync_entry(session, &checksums, &stored, entry, sink)),
        )
        .await;

        let mut tables = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(table) => tables.push(table),
                Err(e) => {
                    error!(dataset = session.dataset(), "table sync failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        checksums.set(ARCHIVE_KEY, &archive_hash).await?;
        info!(
            dataset = session.dataset(),
            replaced = tables
                .iter()
                .filter(|t| t.status != TableStatus::Unchanged)
                .count(),
            total = tables.len(),
            "table sync complete"
        );

        Ok(SyncReport {
            archive_hash,
            archive_unchanged: false,
            tables,
        })
    }

    /// Drops reserved names and refuses archives that map two files onto one table.
    fn table_entries(entries: Vec<ArchiveEntry>, sink: &dyn ProgressSink) -> Result<Vec<ArchiveEntry>> {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(entries.len());

        for entry in entries {
            if RESERVED_TABLES.contains(&entry.table_name()) {
                warn!(entry = entry.name(), "archive file uses a reserved table name, ignoring");
                sink.notify(&format!("Ignoring {}: reserved table name", entry.name()));
                continue;
            }
            if !seen.insert(entry.table_name().to_string()) {
                return Err(AtlasError::Archive(format!(
                    "More than one file in the archive maps to table {}",
                    entry.table_name()
                )));
            }
            kept.push(entry);
        }

        Ok(kept)
    }

    async fn sync_entry(
        &self,
        session: &DatasetSession,
        checksums: &ChecksumStore<'_>,
        stored: &HashMap<String, String>,
        entry: &ArchiveEntry,
        sink: &dyn ProgressSink,
    ) -> Result<TableSync> {
        let name = entry.table_name();
        sink.notify(&format!("Starting processing of {}", name));

        let data = entry.read().await?;
        let hash = content_hash(&data);
        if stored.get(name) == Some(&hash) {
            sink.notify(&format!("{} unchanged, skipping", name));
            return Ok(TableSync {
                table: name.to_string(),
                status: TableStatus::Unchanged,
            });
        }

        let text = String::from_utf8(data).map_err(|e| {
            let valid = &e.as_bytes()[..e.utf8_error().valid_up_to()];
            AtlasError::Parse {
                table: name.to_string(),
                line: valid.iter().filter(|b| **b == b'\n').count() + 1,
                reason: "invalid UTF-8".to_string(),
            }
        })?;
        let raw = normalize(name, &text)?;
        let rows = raw.rows.len();

        let store = session.store();
        let table = session.table(name)?;

        sink.notify(&format!("Deleting old {}", name));
        store.delete_all(&table).await?;

        sink.notify(&format!("Processing {} rows in {}", rows, name));
        if !raw.rows.is_empty() {
            store.insert_many(&table, raw.rows).await?;
        }

        let meta = TableMeta {
            table: name.to_string(),
            header: raw.header,
            rows,
            checksum: hash.clone(),
            synced_at: Utc::now().with_timezone(&self.timezone).to_rfc3339(),
        };
        let fields: Document = match serde_json::to_value(&meta)? {
            serde_json::Value::Object(fields) => fields,
            _ => Document::new(),
        };
        store
            .update_one(
                &session.table(TABLE_META)?,
                &Query::all().eq("table", name),
                fields,
                true,
            )
            .await?;

        checksums.set(name, &hash).await?;
        sink.notify(&format!("Completed processing {}", name));

        Ok(TableSync {
            table: name.to_string(),
            status: TableStatus::Replaced { rows },
        })
    }
}

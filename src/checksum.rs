// Content hashes used to decide whether an archive or one of its tables needs reprocessing

use crate::error::Result;
use crate::store::{DatasetSession, Document, Query, TableRef};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write;

pub const CHECKSUM_TABLE: &str = "checksums";
/// Key holding the hash of the whole downloaded archive.
pub const ARCHIVE_KEY: &str = "archive";

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// The single checksum record of a dataset.
pub struct ChecksumStore<'a> {
    session: &'a DatasetSession,
    table: TableRef,
}

impl<'a> ChecksumStore<'a> {
    pub fn new(session: &'a DatasetSession) -> Result<Self> {
        Ok(ChecksumStore {
            table: session.table(CHECKSUM_TABLE)?,
            session,
        })
    }

    /// `None` until something has been committed for this dataset.
    pub async fn get(&self) -> Result<Option<HashMap<String, String>>> {
        let record = self
            .session
            .store()
            .find_one(&self.table, &Query::all())
            .await?;

        Ok(record.map(|doc| {
            doc.into_iter()
                .filter_map(|(key, value)| match value {
                    Value::String(hash) => Some((key, hash)),
                    _ => None,
                })
                .collect()
        }))
    }

    /// Upserts one key; calling it twice with the same pair is a no-op the second time.
    pub async fn set(&self, key: &str, hash: &str) -> Result<()> {
        let mut fields = Document::new();
        fields.insert(key.to_string(), Value::String(hash.to_string()));
        self.session
            .store()
            .update_one(&self.table, &Query::all(), fields, true)
            .await
    }
}

// Download of zipped GTFS feeds and lazy access to the files inside them

use crate::error::{AtlasError, Result};
use bytes::Bytes;
use std::io::{Cursor, Read};
use std::time::Duration;
use tracing::{debug, info};
use zip::ZipArchive;

const TABLE_EXTENSIONS: &[&str] = &["txt", "csv"];

pub struct ArchiveFetcher {
    client: reqwest::Client,
}

impl ArchiveFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AtlasError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(ArchiveFetcher { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AtlasError::Network(format!("Failed to download {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AtlasError::Network(format!(
                "Download of {} failed with status: {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AtlasError::Network(format!("Failed to read GTFS zip: {}", e)))?;

        info!(url, kb = bytes.len() / 1024, "downloaded GTFS archive");
        Ok(bytes)
    }
}

/// A table file inside an archive. Its bytes are only decompressed by [`ArchiveEntry::read`].
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    name: String,
    table: String,
    index: usize,
    archive: Bytes,
}

impl ArchiveEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name without directory or extension: `gtfs/stop_times.txt` is `stop_times`.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        let archive = self.archive.clone();
        let index = self.index;
        let name = self.name.clone();

        tokio::task::spawn_blocking(move || {
            let mut archive = ZipArchive::new(Cursor::new(archive))
                .map_err(|e| AtlasError::Archive(format!("Failed to open GTFS zip: {}", e)))?;
            let mut file = archive
                .by_index(index)
                .map_err(|e| AtlasError::Archive(format!("Failed to open {}: {}", name, e)))?;

            let mut contents = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut contents)
                .map_err(|e| AtlasError::Archive(format!("Failed to read {}: {}", name, e)))?;
            Ok(contents)
        })
        .await
        .map_err(|e| AtlasError::Archive(format!("Archive read task failed: {}", e)))?
    }
}

/// Lists the table files of a zip buffer without decompressing any of them.
pub fn open(buffer: Bytes) -> Result<Vec<ArchiveEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(buffer.clone()))
        .map_err(|e| AtlasError::Archive(format!("Failed to open GTFS zip: {}", e)))?;

    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let file = archive
            .by_index_raw(index)
            .map_err(|e| AtlasError::Archive(format!("Failed to read zip entry {}: {}", index, e)))?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        match table_name(&name) {
            Some(table) => entries.push(ArchiveEntry {
                table: table.to_string(),
                name,
                index,
                archive: buffer.clone(),
            }),
            None => debug!(entry = %name, "skipping non-table archive entry"),
        }
    }

    Ok(entries)
}

fn table_name(entry_name: &str) -> Option<&str> {
    let file_name = entry_name.rsplit('/').next()?;
    if file_name.starts_with('.') {
        return None;
    }
    let (stem, extension) = file_name.rsplit_once('.')?;
    let known = TABLE_EXTENSIONS
        .iter()
        .any(|ext| extension.eq_ignore_ascii_case(ext));
    (known && !stem.is_empty()).then_some(stem)
}

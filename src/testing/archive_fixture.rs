// In-memory GTFS zips for tests. Also compiled into `tests/` via `#[path]`.

use bytes::Bytes;
use std::io::{Cursor, Write};
use zip::write::FileOptions;

/// Builds a zip from `(entry name, contents)` pairs; names ending in `/` become directories.
pub fn build_zip<C: AsRef<[u8]>>(files: &[(&str, C)]) -> Bytes {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in files {
        if name.ends_with('/') {
            writer.add_directory(*name, FileOptions::default()).unwrap();
        } else {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(contents.as_ref()).unwrap();
        }
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

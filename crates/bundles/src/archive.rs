use std::io::{Cursor, Write};

use bytes::Bytes;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::SchedulerError;

/// Assemble a zip archive from `(entry_name, bytes)` pairs, in order.
///
/// Entry names are the files' logical keys. Compression is deflate; the
/// write runs on the blocking pool since `zip` is synchronous.
pub async fn build_zip_archive(
    entries: Vec<(String, Bytes)>,
) -> Result<Bytes, SchedulerError> {
    tokio::task::spawn_blocking(move || {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in entries {
            writer
                .start_file(name, options)
                .map_err(|e| SchedulerError::Archive(e.to_string()))?;
            writer
                .write_all(&bytes)
                .map_err(|e| SchedulerError::Archive(e.to_string()))?;
        }
        let cursor = writer
            .finish()
            .map_err(|e| SchedulerError::Archive(e.to_string()))?;
        Ok(Bytes::from(cursor.into_inner()))
    })
    .await
    .map_err(|e| SchedulerError::Archive(format!("archive task panicked: {e}")))?
}

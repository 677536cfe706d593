//! Streaming extraction of gzip-compressed tar bundles.
//!
//! Decompression and tar parsing are blocking, so they run on a
//! `spawn_blocking` thread that feeds entries over a bounded channel.
//! Each entry's content is read fully before hand-off: a tar entry
//! reader is only valid until the next entry is requested, and buffering
//! here lets the async side upload at its own pace.

use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;
use tokio::sync::mpsc;

/// One entry of the bundle archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path as recorded in the archive, not yet cleaned.
    pub path: String,
    /// Directory entries are yielded but carry no content.
    pub is_dir: bool,
    /// Size recorded in the tar header.
    pub size: u64,
    /// Full entry content; empty for directories.
    pub data: Bytes,
}

/// Stream the entries of a gzip-compressed tar.
///
/// Returns a receiver of entries in archive order. A gzip or tar-level
/// error is delivered as the final item and ends the stream; the caller
/// decides whether that fails the job. Dropping the receiver stops the
/// extraction thread at its next send.
pub fn stream_entries(
    file: std::fs::File,
    buffer: usize,
) -> mpsc::Receiver<std::io::Result<ArchiveEntry>> {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::task::spawn_blocking(move || {
        let gz = GzDecoder::new(file);
        let mut archive = tar::Archive::new(gz);

        let entries = match archive.entries() {
            Ok(entries) => entries,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        for entry in entries {
            let item = read_entry(entry);
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                return;
            }
        }
    });

    rx
}

fn read_entry<R: Read>(
    entry: std::io::Result<tar::Entry<'_, R>>,
) -> std::io::Result<ArchiveEntry> {
    let mut entry = entry?;

    let path = entry.path()?.to_string_lossy().into_owned();
    let is_dir = entry.header().entry_type().is_dir();
    let size = entry.header().size()?;

    let mut data = Vec::new();
    if !is_dir {
        data.reserve(size as usize);
        entry.read_to_end(&mut data)?;
    }

    Ok(ArchiveEntry {
        path,
        is_dir,
        size,
        data: Bytes::from(data),
    })
}

//! Verification, single record reads and tail recovery.
//!
//! Everything here scans or reads the file through its own handle, so none
//! of it needs the store's append handle.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::StorageOptions;
use crate::error::{KvError, Result};
use crate::record::{FileLocation, FrameReader, StorageRecord};

use super::fragment;
use super::offset_index::RecordStore;
use super::part::{PartSerializer, StoragePart};
use super::{FileStatistics, OffsetIndexDescriptor, RecordKey, RecoveryReport};

impl<P, S> RecordStore<P, S>
where
    P: StoragePart,
    S: PartSerializer<P>,
{
    /// Scan the whole file, checking every frame and counting live records.
    ///
    /// Non-flushed records are part of the file but not of the live set.
    pub fn verify_contents(&self) -> Result<FileStatistics> {
        // appends would race the scan; readers are not held up
        let _guard = self.write_guard();
        self.ensure_operative()?;
        let (path, locations, chain_size) = {
            let state = self.state.read();
            self.output.lock().flush()?;
            (state.path.clone(), Arc::clone(&state.locations), state.chain_size)
        };

        let live: HashMap<u64, u32> = locations
            .values()
            .map(|location| (location.starting_position, location.length))
            .collect();
        scan_file(&path, &live, chain_size)
    }
}

/// Sequentially read every record of `path`
fn scan_file(path: &Path, live: &HashMap<u64, u32>, index_size: u64) -> Result<FileStatistics> {
    let mut reader = FrameReader::open(path)?;
    let mut stats = FileStatistics {
        total_size: reader.file_len(),
        index_size,
        ..FileStatistics::default()
    };

    let mut position = 0u64;
    while position < reader.file_len() {
        let record = reader.read_raw_record_at(position)?;
        if let Some(last) = stats.last_generation {
            if record.generation < last {
                return Err(KvError::corrupted(
                    position,
                    format!(
                        "generation {} follows newer generation {}",
                        record.generation, last
                    ),
                ));
            }
        }

        let size = record.location.length as u64;
        stats.record_count += 1;
        if record.closes_generation {
            stats.fragment_count += 1;
        }
        if live.get(&position) == Some(&record.location.length) {
            stats.living_record_count += 1;
            stats.living_record_size += size;
        }
        stats.max_record_size = stats.max_record_size.max(size);
        stats.last_generation = Some(record.generation);
        position = record.location.end_position();
    }

    if stats.living_record_count != live.len() as u64 {
        return Err(KvError::InternalState(format!(
            "index references {} records, scan found {}",
            live.len(),
            stats.living_record_count
        )));
    }
    Ok(stats)
}

/// Read one record without an open store
pub fn read_single_record<P, S>(
    path: &Path,
    location: FileLocation,
    key: RecordKey,
    serializer: &S,
) -> Result<StorageRecord<P>>
where
    S: PartSerializer<P>,
{
    let mut reader = FrameReader::open(path)?;
    let record = reader.read_record(location)?;
    let payload = match &record.payload {
        Some(bytes) => Some(serializer.deserialize(key.record_type, bytes)?),
        None => None,
    };
    Ok(StorageRecord {
        generation: record.generation,
        closes_generation: record.closes_generation,
        payload,
        location: record.location,
    })
}

/// Cut a store file back to its last intact generation boundary.
///
/// Scans frames until the end of the file or the first damaged record,
/// truncates everything after the last generation-closing record and
/// returns the descriptor of that record's fragment chain (`None` when the
/// file holds no complete generation at all).
pub fn recover(
    path: &Path,
    options: &StorageOptions,
) -> Result<(RecoveryReport, Option<OffsetIndexDescriptor>)> {
    let mut reader = FrameReader::open(path)?;
    let file_len = reader.file_len();
    let mut report = RecoveryReport::default();
    let mut last_closing: Option<FileLocation> = None;

    let mut position = 0u64;
    while position < file_len {
        match reader.read_raw_record_at(position) {
            Ok(record) => {
                report.frames_scanned += record.frame_count as u64;
                if record.closes_generation {
                    report.last_generation = Some(record.generation);
                    last_closing = Some(record.location);
                }
                position = record.location.end_position();
            }
            Err(err) if err.is_corruption() => {
                warn!(position, error = %err, "Stopping recovery scan at damaged record");
                break;
            }
            Err(err) => return Err(err),
        }
    }

    let keep = last_closing.map_or(0, |location| location.end_position());
    if keep < file_len {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(keep)?;
        if options.sync_on_flush {
            file.sync_all()?;
        }
        report.truncated_bytes = file_len - keep;
        report.was_truncated = true;
    }

    let descriptor = match last_closing {
        Some(tail) => {
            let mut reader = FrameReader::open(path)?;
            let chain = fragment::load_chain(&mut reader, tail)?;
            fragment::replay(&chain, None, None)?.descriptor(keep)
        }
        None => None,
    };

    info!(
        path = %path.display(),
        frames = report.frames_scanned,
        truncated_bytes = report.truncated_bytes,
        last_generation = ?report.last_generation,
        "Recovered record store file"
    );
    Ok((report, descriptor))
}

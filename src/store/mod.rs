//! Record Store Module
//!
//! Durable append-only store of typed records ("offset index").
//!
//! ## Responsibilities
//! - Map `(record type, primary key)` to the location of the record's frames
//! - Keep non-flushed writes in an overlay until the next flush
//! - Persist the key map as a chain of index fragments, one per flush
//! - Compaction, snapshot copies, verification and tail recovery
//!
//! ## File Layout
//! ```text
//! ┌──────────────┬────────┬────────┬─────┬──────────────┬────────┬─────┐
//! │ Header frag. │ Record │ Record │ ... │ Index frag.  │ Record │ ... │
//! │ (gen 0)      │ (gen 1)│ (gen 1)│     │ (gen 1, ■)   │ (gen 2)│     │
//! └──────────────┴────────┴────────┴─────┴──────────────┴────────┴─────┘
//!   ■ = generation-closing frame
//! ```
//! Every fragment points back at its predecessor, so the descriptor of the
//! last flush is enough to rebuild the whole key map.

mod compaction;
mod fragment;
mod offset_index;
mod overlay;
mod part;
mod verify;

use serde::{Deserialize, Serialize};

use crate::record::FileLocation;

pub use offset_index::RecordStore;
pub use part::{BincodeSerializer, PartSerializer, RecordTypeRegistry, StoragePart};
pub use verify::{read_single_record, recover};

// =============================================================================
// Keys and Values
// =============================================================================

/// Identity of one logical record, ordered by type then primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub record_type: u8,
    pub primary_key: i64,
}

impl RecordKey {
    pub fn new(record_type: u8, primary_key: i64) -> Self {
        Self {
            record_type,
            primary_key,
        }
    }

    /// Key of a storage part, derived from its own identity
    pub fn of<P: StoragePart>(part: &P) -> Self {
        Self::new(part.record_type(), part.primary_key())
    }
}

/// A write that happened since the last flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedValue {
    pub key: RecordKey,
    /// Generation the write was made in
    pub generation: i64,
    /// Location of the written record, or of the removed one for removals
    pub location: FileLocation,
    pub removal: bool,
}

// =============================================================================
// Descriptor
// =============================================================================

/// Snapshot of a store's persisted state, produced by flush / compact / snapshot copy.
///
/// Hand it back to [`RecordStore::open`] to reopen the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetIndexDescriptor {
    /// Location of the newest index fragment
    pub location: FileLocation,
    /// Generation of the newest index fragment
    pub generation: i64,
    /// Live records reachable from the index
    pub record_count: u64,
    pub file_size: u64,
    pub active_record_share: f64,
}

impl OffsetIndexDescriptor {
    /// Encode for storage next to the data file
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// =============================================================================
// Statistics and Reports
// =============================================================================

/// Result of a full sequential scan of a store file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileStatistics {
    /// Logical records in the file, index fragments included
    pub record_count: u64,
    /// Index fragments (generation-closing records)
    pub fragment_count: u64,
    /// Records reachable from the durable index
    pub living_record_count: u64,
    /// Bytes of records reachable from the durable index
    pub living_record_size: u64,
    /// Bytes of the current index fragment chain
    pub index_size: u64,
    pub total_size: u64,
    pub max_record_size: u64,
    pub last_generation: Option<i64>,
}

impl FileStatistics {
    /// Share of the file still reachable: live records plus the current index chain
    pub fn active_record_share(&self) -> f64 {
        active_share(self.living_record_size + self.index_size, self.total_size)
    }
}

/// Outcome of [`recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Intact frames read before the scan stopped
    pub frames_scanned: u64,
    /// Generation of the last generation-closing frame
    pub last_generation: Option<i64>,
    /// Bytes removed from the end of the file
    pub truncated_bytes: u64,
    pub was_truncated: bool,
}

pub(crate) fn active_share(active: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        active as f64 / total as f64
    }
}

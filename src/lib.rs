//! # FrameKV
//!
//! Persistent storage core with:
//! - An append-only file of framed records (continuation frames, CRC32, compression)
//! - A durable key → location index persisted as a chain of index fragments
//! - Compaction, snapshot copies, verification and tail recovery
//! - A copy-on-write B+Tree with snapshot isolation
//! - Single-writer/multi-reader concurrency model
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────┐      ┌───────────────────────────────┐
//! │          RecordStore          │      │    Transactional<BPlusTree>   │
//! │  put / remove / get / flush   │      │    begin / commit / rollback  │
//! └───────┬───────────────┬───────┘      └───────────────┬───────────────┘
//!         │               │                              │
//!         ▼               ▼                              ▼
//!  ┌─────────────┐ ┌─────────────┐               ┌───────────────┐
//!  │   Overlay   │ │ Index frag. │               │  Arc<Node>    │
//!  │ (non-flush) │ │   chain     │               │ path copying  │
//!  └──────┬──────┘ └──────┬──────┘               └───────────────┘
//!         │               │
//!         ▼               ▼
//!  ┌─────────────────────────────┐
//!  │  Frame codec (record/)      │
//!  │  writer ◄──► file ◄──► reader│
//!  └─────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod record;
pub mod store;
pub mod btree;
pub mod transactional;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{KvError, Result};
pub use config::{StorageOptions, TreeOptions};
pub use record::{FileLocation, StorageRecord};
pub use store::{
    OffsetIndexDescriptor, PartSerializer, RecordKey, RecordStore, RecordTypeRegistry,
    StoragePart,
};
pub use btree::{BPlusTree, ConsistencyReport};
pub use transactional::{TransactionGuard, Transactional, Versioned};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of FrameKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

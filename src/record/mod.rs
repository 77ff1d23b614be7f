//! Framed Record Module
//!
//! Defines the on-disk layout of one logical record.
//!
//! ## Responsibilities
//! - Frame header / trailer layout and control bits
//! - Chaining payloads that exceed the write buffer into continuation frames
//! - Optional CRC32 trailer and optional payload compression
//! - Random-access, sequential and raw reads
//!
//! ## Frame Format
//! ```text
//! ┌────────────┬─────────────┬────────────────┬──────────────┬─────────────┐
//! │ Len i32 (4)│ Control (1) │ Generation (8) │ Payload (..) │ [CRC u64 (8)]│
//! └────────────┴─────────────┴────────────────┴──────────────┴─────────────┘
//!   Len     = bytes following the length field, trailer included
//!   Control = bit0 generation-closing, bit1 continuation,
//!             bit2 crc32-present, bit3 compressed, bits 4..7 reserved (zero)
//!   CRC     = CRC32 of generation + payload bytes as stored
//! ```
//!
//! All integers are little-endian.

mod reader;
mod writer;

use serde::{Deserialize, Serialize};

pub use reader::{FrameHeader, FrameReader, RawFrame, RawRecord};
pub use writer::{FrameOutput, FrameSink, RecordWriter, StreamSink};

// =============================================================================
// Shared Constants (used by writer and reader)
// =============================================================================

/// Size of the leading length field
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Bytes not covered by the CRC at the start of each frame: length + control
pub const CRC_NOT_COVERED_HEAD: usize = LENGTH_FIELD_SIZE + 1;

/// Header size: Length (4) + Control (1) + Generation (8) = 13 bytes
pub const HEADER_SIZE: usize = CRC_NOT_COVERED_HEAD + 8;

/// CRC32 trailer, widened to 8 bytes
pub const CRC_SIZE: usize = 8;

/// Worst-case per-frame overhead: header + trailer = 21 bytes
pub const OVERHEAD_SIZE: usize = HEADER_SIZE + CRC_SIZE;

// =============================================================================
// Control Byte
// =============================================================================

/// Control byte of a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlByte(u8);

impl ControlByte {
    /// Last frame written for its generation
    pub const GENERATION_CLOSING: u8 = 1 << 0;
    /// Another frame of the same record follows
    pub const CONTINUATION: u8 = 1 << 1;
    /// CRC32 trailer is present
    pub const CRC32: u8 = 1 << 2;
    /// Payload is snappy-compressed
    pub const COMPRESSED: u8 = 1 << 3;

    const RESERVED_MASK: u8 = 0xF0;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn with(self, flag: u8, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }

    pub fn is_set(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn closes_generation(self) -> bool {
        self.is_set(Self::GENERATION_CLOSING)
    }

    pub fn is_continuation(self) -> bool {
        self.is_set(Self::CONTINUATION)
    }

    pub fn has_crc(self) -> bool {
        self.is_set(Self::CRC32)
    }

    pub fn is_compressed(self) -> bool {
        self.is_set(Self::COMPRESSED)
    }

    /// Reserved bits must stay zero
    pub fn has_reserved_bits(self) -> bool {
        self.0 & Self::RESERVED_MASK != 0
    }
}

// =============================================================================
// File Location
// =============================================================================

/// Where one complete logical record lives in the file.
///
/// `length` spans every chained frame of the record, length fields included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileLocation {
    pub starting_position: u64,
    pub length: u32,
}

impl FileLocation {
    pub fn new(starting_position: u64, length: u32) -> Self {
        Self {
            starting_position,
            length,
        }
    }

    /// First byte after the record
    pub fn end_position(&self) -> u64 {
        self.starting_position + self.length as u64
    }
}

// =============================================================================
// Storage Record
// =============================================================================

/// One logical record as read back from the file
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRecord<T> {
    /// Generation the record was written in
    pub generation: i64,
    /// The last frame of the record carried the generation-closing flag
    pub closes_generation: bool,
    /// Deserialized payload, `None` for records skipped during sequential scans
    pub payload: Option<T>,
    /// Location spanning all frames of the record
    pub location: FileLocation,
}

impl<T> StorageRecord<T> {
    /// Apply a conversion to the payload, keeping the framing metadata
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StorageRecord<U> {
        StorageRecord {
            generation: self.generation,
            closes_generation: self.closes_generation,
            payload: self.payload.map(f),
            location: self.location,
        }
    }
}

/// CRC32 over the generation and the stored payload bytes
pub(crate) fn frame_crc(generation: i64, payload: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&generation.to_le_bytes());
    hasher.update(payload);
    hasher.finalize() as u64
}

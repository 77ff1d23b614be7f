//! Configuration for FrameKV
//!
//! Plain option values passed in at construction time, with sensible defaults.

use crate::error::{KvError, Result};
use crate::record::OVERHEAD_SIZE;

/// Options of a single record store instance
#[derive(Debug, Clone)]
pub struct StorageOptions {
    // -------------------------------------------------------------------------
    // Write Buffer Configuration
    // -------------------------------------------------------------------------
    /// Maximum size of one frame in bytes (header + payload + trailer).
    /// Payloads that do not fit are chained into continuation frames.
    pub output_buffer_size: usize,

    /// Bytes of completed frames kept in memory before they are handed to the OS
    pub flush_threshold: usize,

    // -------------------------------------------------------------------------
    // Frame Encoding Configuration
    // -------------------------------------------------------------------------
    /// Append a CRC32 trailer to every frame
    pub compute_crc32: bool,

    /// Compress frame payloads (snappy raw format) when it makes them smaller
    pub compress: bool,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Compact when the active record share drops below this value
    pub minimal_active_record_share: f64,

    /// Never compact files smaller than this (in bytes)
    pub file_size_compaction_threshold: u64,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// fsync the file at the end of every flush
    pub sync_on_flush: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            output_buffer_size: 2 * 1024 * 1024, // 2 MB
            flush_threshold: 64 * 1024,          // 64 KB
            compute_crc32: true,
            compress: false,
            minimal_active_record_share: 0.5,
            file_size_compaction_threshold: 100 * 1024 * 1024, // 100 MB
            sync_on_flush: true,
        }
    }
}

impl StorageOptions {
    /// Create a new options builder
    pub fn builder() -> StorageOptionsBuilder {
        StorageOptionsBuilder::default()
    }

    /// Largest payload chunk that fits into a single frame
    pub fn max_frame_payload(&self) -> usize {
        self.output_buffer_size - OVERHEAD_SIZE
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.output_buffer_size < OVERHEAD_SIZE + 64 {
            return Err(KvError::Config(format!(
                "output_buffer_size must be >= {} bytes, got {}",
                OVERHEAD_SIZE + 64,
                self.output_buffer_size
            )));
        }
        if self.output_buffer_size > i32::MAX as usize {
            return Err(KvError::Config(
                "output_buffer_size must fit into the 32-bit frame length".to_string(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(KvError::Config("flush_threshold must be > 0".to_string()));
        }
        if !(self.minimal_active_record_share > 0.0 && self.minimal_active_record_share <= 1.0) {
            return Err(KvError::Config(format!(
                "minimal_active_record_share must be in (0.0, 1.0], got {}",
                self.minimal_active_record_share
            )));
        }
        Ok(())
    }
}

/// Builder for StorageOptions
#[derive(Default)]
pub struct StorageOptionsBuilder {
    options: StorageOptions,
}

impl StorageOptionsBuilder {
    /// Set the maximum frame size
    pub fn output_buffer_size(mut self, size: usize) -> Self {
        self.options.output_buffer_size = size;
        self
    }

    /// Set the amount of buffered bytes that triggers a write to the OS
    pub fn flush_threshold(mut self, size: usize) -> Self {
        self.options.flush_threshold = size;
        self
    }

    /// Enable or disable CRC32 trailers
    pub fn compute_crc32(mut self, enabled: bool) -> Self {
        self.options.compute_crc32 = enabled;
        self
    }

    /// Enable or disable payload compression
    pub fn compress(mut self, enabled: bool) -> Self {
        self.options.compress = enabled;
        self
    }

    /// Set the active record share below which compaction kicks in
    pub fn minimal_active_record_share(mut self, share: f64) -> Self {
        self.options.minimal_active_record_share = share;
        self
    }

    /// Set the minimal file size eligible for compaction
    pub fn file_size_compaction_threshold(mut self, bytes: u64) -> Self {
        self.options.file_size_compaction_threshold = bytes;
        self
    }

    /// Enable or disable fsync at flush
    pub fn sync_on_flush(mut self, enabled: bool) -> Self {
        self.options.sync_on_flush = enabled;
        self
    }

    pub fn build(self) -> StorageOptions {
        self.options
    }
}

/// Node size bounds of a B+Tree
///
/// Leaf sizes count key/value pairs, internal node sizes count children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    /// Maximum number of entries in a leaf
    pub value_block_size: usize,
    /// Minimum number of entries in a non-root leaf
    pub min_value_block_size: usize,
    /// Maximum number of children of an internal node
    pub internal_node_size: usize,
    /// Minimum number of children of a non-root internal node
    pub min_internal_node_size: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self::with_block_size(64)
    }
}

impl TreeOptions {
    /// Options deriving every bound from a single block size
    pub fn with_block_size(block_size: usize) -> Self {
        let internal_node_size = block_size.max(3);
        Self {
            value_block_size: block_size,
            min_value_block_size: block_size / 2,
            internal_node_size,
            min_internal_node_size: internal_node_size.div_ceil(2),
        }
    }

    /// Create a new options builder starting from the defaults
    pub fn builder() -> TreeOptionsBuilder {
        TreeOptionsBuilder::default()
    }

    /// Validate that splits and merges always produce nodes within bounds
    pub fn validate(&self) -> Result<()> {
        if self.value_block_size < 2 {
            return Err(KvError::Config("value_block_size must be >= 2".to_string()));
        }
        if self.min_value_block_size < 1
            || 2 * self.min_value_block_size > self.value_block_size + 1
        {
            return Err(KvError::Config(format!(
                "min_value_block_size must be in [1, {}], got {}",
                (self.value_block_size + 1) / 2,
                self.min_value_block_size
            )));
        }
        if self.internal_node_size < 3 {
            return Err(KvError::Config("internal_node_size must be >= 3".to_string()));
        }
        if self.min_internal_node_size < 2
            || 2 * self.min_internal_node_size > self.internal_node_size + 1
        {
            return Err(KvError::Config(format!(
                "min_internal_node_size must be in [2, {}], got {}",
                (self.internal_node_size + 1) / 2,
                self.min_internal_node_size
            )));
        }
        Ok(())
    }
}

/// Builder for TreeOptions
#[derive(Default)]
pub struct TreeOptionsBuilder {
    options: TreeOptions,
}

impl TreeOptionsBuilder {
    /// Derive all bounds from one block size (overrides previous settings)
    pub fn block_size(mut self, size: usize) -> Self {
        self.options = TreeOptions::with_block_size(size);
        self
    }

    pub fn value_block_size(mut self, size: usize) -> Self {
        self.options.value_block_size = size;
        self
    }

    pub fn min_value_block_size(mut self, size: usize) -> Self {
        self.options.min_value_block_size = size;
        self
    }

    pub fn internal_node_size(mut self, size: usize) -> Self {
        self.options.internal_node_size = size;
        self
    }

    pub fn min_internal_node_size(mut self, size: usize) -> Self {
        self.options.min_internal_node_size = size;
        self
    }

    pub fn build(self) -> TreeOptions {
        self.options
    }
}

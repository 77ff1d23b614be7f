//! Offset Index
//!
//! The record store proper: an append-only file of framed records plus the
//! in-memory map from record key to file location.
//!
//! ## Concurrency Model: Single-Writer / Multiple-Reader
//!
//! - **Writes** (put/remove/flush/compact/close): serialized by `write_lock`
//! - **Reads** (get/contains/count/...): share `state` for reading; the
//!   durable key map is an `Arc` replaced as a whole at flush, so a reader
//!   sees either all of a flush or none of it
//!
//! Lock order: `write_lock` → `state` → `output` → `reader`.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::StorageOptions;
use crate::error::{KvError, Result};
use crate::record::{FileLocation, FrameOutput, FrameReader};

use super::fragment::{self, FragmentEntry, FragmentRef, IndexFragment, RebuiltIndex};
use super::overlay::NonFlushedValues;
use super::part::{BincodeSerializer, PartSerializer, RecordTypeRegistry, StoragePart};
use super::{active_share, OffsetIndexDescriptor, RecordKey, VersionedValue};

/// Everything readers need, swapped under one lock
pub(super) struct IndexState {
    pub path: PathBuf,
    /// Durable key map, replaced as a whole at flush
    pub locations: Arc<HashMap<RecordKey, FileLocation>>,
    pub overlay: NonFlushedValues,
    /// Fragment chain, oldest first
    pub fragments: Vec<FragmentRef>,
    /// Bytes of all records in `locations`
    pub live_size: u64,
    /// Bytes of all fragments in `fragments`
    pub chain_size: u64,
    pub last_flushed_generation: i64,
    pub descriptor: OffsetIndexDescriptor,
}

impl IndexState {
    fn from_rebuilt(path: PathBuf, rebuilt: RebuiltIndex, file_size: u64) -> Result<Self> {
        let descriptor = rebuilt
            .descriptor(file_size)
            .ok_or_else(|| KvError::InternalState("index has no fragments".to_string()))?;
        Ok(Self {
            path,
            locations: Arc::new(rebuilt.locations),
            overlay: NonFlushedValues::new(),
            fragments: rebuilt.fragments,
            live_size: rebuilt.live_size,
            chain_size: rebuilt.chain_size,
            last_flushed_generation: descriptor.generation,
            descriptor,
        })
    }

    /// Newest generation anything was written in
    fn latest_generation(&self) -> i64 {
        self.overlay
            .latest_generation()
            .map_or(self.last_flushed_generation, |g| g.max(self.last_flushed_generation))
    }

    /// Resolve a key as seen by `generation`, overlay first
    fn resolve(&self, key: &RecordKey, generation: i64) -> Option<FileLocation> {
        match self.overlay.visible_at(key, generation) {
            Some(value) => (!value.removal).then_some(value.location),
            None => self.locations.get(key).copied(),
        }
    }

    /// Keys visible at the newest generation, sorted
    fn visible_entries(&self) -> Vec<(RecordKey, FileLocation)> {
        let mut merged: HashMap<RecordKey, FileLocation> = (*self.locations).clone();
        for value in self.overlay.values() {
            if value.removal {
                merged.remove(&value.key);
            } else {
                merged.insert(value.key, value.location);
            }
        }
        let mut entries: Vec<_> = merged.into_iter().collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
    }
}

/// Durable record store
///
/// Records are appended as they are put; the overlay makes them visible to
/// readers right away, and `flush` folds them into the durable key map by
/// writing an index fragment.
pub struct RecordStore<P, S = BincodeSerializer> {
    options: StorageOptions,
    serializer: S,
    registry: RecordTypeRegistry,

    /// Serializes write operations
    write_lock: Mutex<()>,

    pub(super) state: RwLock<IndexState>,

    /// Append handle
    pub(super) output: Mutex<FrameOutput>,

    /// Positional read handle
    pub(super) reader: Mutex<FrameReader<BufReader<File>>>,

    operative: AtomicBool,
    _parts: PhantomData<fn() -> P>,
}

impl<P> RecordStore<P, BincodeSerializer>
where
    P: StoragePart,
    BincodeSerializer: PartSerializer<P>,
{
    /// Create a new store file (truncating any existing one)
    pub fn create(path: &Path, options: StorageOptions, registry: RecordTypeRegistry) -> Result<Self> {
        Self::create_with(path, options, registry, BincodeSerializer)
    }

    /// Open an existing store file at the state described by `descriptor`
    pub fn open(
        path: &Path,
        descriptor: &OffsetIndexDescriptor,
        options: StorageOptions,
        registry: RecordTypeRegistry,
    ) -> Result<Self> {
        Self::open_with(path, descriptor, options, registry, BincodeSerializer)
    }
}

impl<P, S> RecordStore<P, S>
where
    P: StoragePart,
    S: PartSerializer<P>,
{
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a new store file with a custom serializer.
    ///
    /// An empty header fragment is written at generation 0 so the file is
    /// self-describing from the start.
    pub fn create_with(
        path: &Path,
        options: StorageOptions,
        registry: RecordTypeRegistry,
        serializer: S,
    ) -> Result<Self> {
        options.validate()?;

        let mut output = FrameOutput::create(path, &options)?;
        let header = IndexFragment {
            previous: None,
            entries: Vec::new(),
        };
        let location = header.write(&mut output, 0)?;
        output.sync()?;

        let rebuilt = RebuiltIndex {
            fragments: vec![FragmentRef {
                generation: 0,
                location,
            }],
            chain_size: location.length as u64,
            ..RebuiltIndex::default()
        };
        let state = IndexState::from_rebuilt(path.to_path_buf(), rebuilt, output.position())?;
        let reader = FrameReader::open(path)?;

        info!(path = %path.display(), "Created record store");
        Ok(Self::assemble(options, registry, serializer, state, output, reader))
    }

    /// Open an existing store file with a custom serializer.
    ///
    /// Bytes after the descriptor's fragment are records that were never
    /// flushed; they are cut off.
    pub fn open_with(
        path: &Path,
        descriptor: &OffsetIndexDescriptor,
        options: StorageOptions,
        registry: RecordTypeRegistry,
        serializer: S,
    ) -> Result<Self> {
        options.validate()?;

        let mut reader = FrameReader::open(path)?;
        let chain = fragment::load_chain(&mut reader, descriptor.location)?;
        let rebuilt = fragment::replay(&chain, Some(&registry), None)?;

        let end = descriptor.location.end_position();
        let mut output = FrameOutput::open(path, &options)?;
        if output.position() > end {
            warn!(
                path = %path.display(),
                discarded_bytes = output.position() - end,
                "Discarding bytes written after the last index fragment"
            );
            output.rollback_to(end)?;
            reader.refresh_len()?;
        }

        let state = IndexState::from_rebuilt(path.to_path_buf(), rebuilt, output.position())?;
        info!(
            path = %path.display(),
            records = state.locations.len(),
            fragments = state.fragments.len(),
            generation = state.last_flushed_generation,
            "Opened record store"
        );
        Ok(Self::assemble(options, registry, serializer, state, output, reader))
    }

    fn assemble(
        options: StorageOptions,
        registry: RecordTypeRegistry,
        serializer: S,
        state: IndexState,
        output: FrameOutput,
        reader: FrameReader<BufReader<File>>,
    ) -> Self {
        Self {
            options,
            serializer,
            registry,
            write_lock: Mutex::new(()),
            state: RwLock::new(state),
            output: Mutex::new(output),
            reader: Mutex::new(reader),
            operative: AtomicBool::new(true),
            _parts: PhantomData,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append a part and make it visible through the overlay.
    ///
    /// A second put of the same key wins over the first.
    pub fn put(&self, generation: i64, part: &P) -> Result<FileLocation> {
        self.ensure_operative()?;
        let key = RecordKey::of(part);
        self.registry.ensure_known(key.record_type)?;

        let _guard = self.write_lock.lock();
        // close may have run while waiting for the lock
        self.ensure_operative()?;
        self.check_generation(generation)?;

        let location = self.output.lock().write_record(generation, false, |w| {
            self.serializer.serialize(part, w)
        })?;

        self.state.write().overlay.record_put(key, generation, location);
        debug!(
            record_type = key.record_type,
            primary_key = key.primary_key,
            generation,
            position = location.starting_position,
            length = location.length,
            "Put record"
        );
        Ok(location)
    }

    /// Record the removal of a key. Returns `false` when the key does not exist.
    pub fn remove(&self, generation: i64, primary_key: i64, record_type: u8) -> Result<bool> {
        self.ensure_operative()?;
        self.registry.ensure_known(record_type)?;
        let key = RecordKey::new(record_type, primary_key);

        let _guard = self.write_lock.lock();
        self.ensure_operative()?;
        self.check_generation(generation)?;

        let mut state = self.state.write();
        let durable = state.locations.get(&key).copied();
        let pending = state.overlay.get(&key).copied();

        let removed = match (pending, durable) {
            (Some(value), _) if value.removal => false,
            // a put nobody else can see yet simply disappears
            (Some(value), None)
                if value.generation == generation && state.overlay.history(&key).len() == 1 =>
            {
                state.overlay.discard(&key);
                true
            }
            (Some(value), _) => {
                state
                    .overlay
                    .record_removal(key, generation, durable.unwrap_or(value.location));
                true
            }
            (None, Some(location)) => {
                state.overlay.record_removal(key, generation, location);
                true
            }
            (None, None) => false,
        };
        if removed {
            debug!(record_type, primary_key, generation, "Removed record");
        }
        Ok(removed)
    }

    /// Fold all non-flushed writes into the durable index.
    ///
    /// Writes one index fragment closing `generation` and swaps the key map in
    /// one step. With nothing to fold, the current descriptor is returned.
    pub fn flush(&self, generation: i64) -> Result<OffsetIndexDescriptor> {
        let _guard = self.write_lock.lock();
        self.ensure_operative()?;
        self.check_generation(generation)?;

        let (fragment, pending) = {
            let state = self.state.read();
            if state.overlay.is_empty() {
                return Ok(state.descriptor.clone());
            }
            let pending = state.overlay.in_file_order();
            let fragment = IndexFragment {
                previous: Some(state.descriptor.location),
                entries: pending.iter().map(FragmentEntry::from).collect(),
            };
            (fragment, pending)
        };

        let (location, file_size) = {
            let mut output = self.output.lock();
            let start = output.position();
            let location = fragment.write(&mut output, generation)?;
            let synced = if self.options.sync_on_flush {
                output.sync()
            } else {
                output.flush()
            };
            if let Err(err) = synced {
                warn!(generation, error = %err, "Flush failed, rewinding index fragment");
                output.rollback_to(start)?;
                return Err(err);
            }
            (location, output.position())
        };

        let mut state = self.state.write();
        let mut locations = (*state.locations).clone();
        let mut live_size = state.live_size;
        fragment.apply(&mut locations, &mut live_size);

        state.locations = Arc::new(locations);
        state.live_size = live_size;
        state.chain_size += location.length as u64;
        state.fragments.push(FragmentRef {
            generation,
            location,
        });
        state.last_flushed_generation = generation;
        state.overlay.clear();
        state.descriptor = OffsetIndexDescriptor {
            location,
            generation,
            record_count: state.locations.len() as u64,
            file_size,
            active_record_share: active_share(state.live_size + state.chain_size, file_size),
        };

        info!(
            generation,
            folded = pending.len(),
            records = state.descriptor.record_count,
            fragment_position = location.starting_position,
            "Flushed record store"
        );
        Ok(state.descriptor.clone())
    }

    /// Close the store, discarding non-flushed writes.
    ///
    /// Every later call fails with `StoreClosed`.
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        if !self.operative.swap(false, Ordering::SeqCst) {
            return Err(KvError::StoreClosed);
        }

        let mut state = self.state.write();
        if !state.overlay.is_empty() {
            warn!(
                discarded = state.overlay.len(),
                "Closing record store with non-flushed values, discarding them"
            );
            state.overlay.clear();
        }

        let mut output = self.output.lock();
        output.rollback_to(state.descriptor.location.end_position())?;
        output.sync()?;
        info!(path = %state.path.display(), "Closed record store");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read a part as seen by `generation`
    pub fn get(&self, generation: i64, primary_key: i64, record_type: u8) -> Result<Option<P>> {
        match self.get_binary(generation, primary_key, record_type)? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(record_type, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Read the raw payload of a part as seen by `generation`
    pub fn get_binary(
        &self,
        generation: i64,
        primary_key: i64,
        record_type: u8,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_operative()?;
        self.registry.ensure_known(record_type)?;
        let key = RecordKey::new(record_type, primary_key);

        let state = self.state.read();
        let location = match state.resolve(&key, generation) {
            Some(location) => location,
            None => return Ok(None),
        };
        self.ensure_readable(location)?;
        let record = self.reader.lock().read_record(location)?;
        Ok(record.payload)
    }

    pub fn contains(&self, generation: i64, primary_key: i64, record_type: u8) -> Result<bool> {
        self.ensure_operative()?;
        self.registry.ensure_known(record_type)?;
        let key = RecordKey::new(record_type, primary_key);
        Ok(self.state.read().resolve(&key, generation).is_some())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of visible records, non-flushed writes included
    pub fn count(&self) -> Result<usize> {
        self.ensure_operative()?;
        Ok(self.state.read().visible_entries().len())
    }

    /// Number of visible records of one type
    pub fn count_of(&self, record_type: u8) -> Result<usize> {
        self.ensure_operative()?;
        Ok(self
            .state
            .read()
            .visible_entries()
            .iter()
            .filter(|(key, _)| key.record_type == record_type)
            .count())
    }

    /// Visible keys, sorted
    pub fn keys(&self) -> Result<Vec<RecordKey>> {
        Ok(self.entries()?.into_iter().map(|(key, _)| key).collect())
    }

    /// Visible keys with their locations, sorted by key
    pub fn entries(&self) -> Result<Vec<(RecordKey, FileLocation)>> {
        self.ensure_operative()?;
        Ok(self.state.read().visible_entries())
    }

    /// Writes made since the last flush, ordered by key then generation
    pub fn non_flushed_entries(&self) -> Result<Vec<VersionedValue>> {
        self.ensure_operative()?;
        Ok(self.state.read().overlay.all_values().copied().collect())
    }

    /// Descriptor of the last flush
    pub fn descriptor(&self) -> Result<OffsetIndexDescriptor> {
        self.ensure_operative()?;
        Ok(self.state.read().descriptor.clone())
    }

    /// File currently backing the store (changes after compaction)
    pub fn file_path(&self) -> Result<PathBuf> {
        self.ensure_operative()?;
        Ok(self.state.read().path.clone())
    }

    pub fn is_operative(&self) -> bool {
        self.operative.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn registry(&self) -> &RecordTypeRegistry {
        &self.registry
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    pub(super) fn ensure_operative(&self) -> Result<()> {
        if self.is_operative() {
            Ok(())
        } else {
            Err(KvError::StoreClosed)
        }
    }

    pub(super) fn write_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    fn check_generation(&self, generation: i64) -> Result<()> {
        let latest = self.state.read().latest_generation();
        if generation < latest {
            return Err(KvError::InvalidGeneration { generation, latest });
        }
        Ok(())
    }

    /// Make sure the bytes at `location` have been handed to the OS
    pub(super) fn ensure_readable(&self, location: FileLocation) -> Result<()> {
        let end = location.end_position();
        {
            let mut output = self.output.lock();
            if output.durable_position() < end {
                output.flush()?;
            }
        }
        let mut reader = self.reader.lock();
        if reader.file_len() < end {
            reader.refresh_len()?;
        }
        Ok(())
    }
}

//! Compaction and snapshot copies.
//!
//! Both rewrite the live records of a store, in file order and without
//! decoding them, followed by a single fragment holding the whole key map.

use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{KvError, Result};
use crate::record::{FileLocation, FrameOutput, FrameReader, FrameSink, StreamSink};

use super::fragment::{self, FragmentRef, IndexFragment};
use super::offset_index::RecordStore;
use super::part::{PartSerializer, StoragePart};
use super::{active_share, OffsetIndexDescriptor, RecordKey};

/// Result of copying live records into a fresh output
struct CopiedIndex {
    locations: HashMap<RecordKey, FileLocation>,
    live_size: u64,
    fragment: FileLocation,
    file_size: u64,
}

impl CopiedIndex {
    fn descriptor(&self, generation: i64) -> OffsetIndexDescriptor {
        OffsetIndexDescriptor {
            location: self.fragment,
            generation,
            record_count: self.locations.len() as u64,
            file_size: self.file_size,
            active_record_share: active_share(
                self.live_size + self.fragment.length as u64,
                self.file_size,
            ),
        }
    }
}

/// Copy `entries` raw, in file order, then close with a full fragment
fn copy_records<R, S>(
    reader: &mut FrameReader<R>,
    target: &mut FrameOutput<S>,
    mut entries: Vec<(RecordKey, FileLocation)>,
    generation: i64,
) -> Result<CopiedIndex>
where
    R: Read + Seek,
    S: FrameSink,
{
    entries.sort_by_key(|(_, location)| location.starting_position);

    let mut locations = HashMap::with_capacity(entries.len());
    let mut live_size = 0u64;
    for (key, location) in entries {
        let raw = reader.read_raw_record(location)?;
        let copied = target.append_raw(&raw.bytes)?;
        live_size += copied.length as u64;
        locations.insert(key, copied);
    }

    let fragment = IndexFragment::full(&locations).write(target, generation)?;
    target.sync()?;
    Ok(CopiedIndex {
        locations,
        live_size,
        fragment,
        file_size: target.position(),
    })
}

impl<P, S> RecordStore<P, S>
where
    P: StoragePart,
    S: PartSerializer<P>,
{
    /// Rewrite the live records into `target` and switch the store over to it.
    ///
    /// Requires all writes to be flushed. Fragment history collapses into a
    /// single fragment, so the active record share of the new file is 1.0.
    /// The old file is left in place.
    pub fn compact(&self, target: &Path) -> Result<OffsetIndexDescriptor> {
        let _guard = self.write_guard();
        self.ensure_operative()?;

        // readers keep going against the current file while records are copied
        let (source, locations, generation) = {
            let state = self.state.read();
            if !state.overlay.is_empty() {
                return Err(KvError::InternalState(format!(
                    "cannot compact with {} non-flushed values",
                    state.overlay.len()
                )));
            }
            if target == state.path.as_path() {
                return Err(KvError::Config(
                    "compaction target must differ from the store file".to_string(),
                ));
            }
            (
                state.path.clone(),
                Arc::clone(&state.locations),
                state.last_flushed_generation,
            )
        };

        let old_size = {
            let mut output = self.output.lock();
            output.flush()?;
            output.position()
        };

        let entries: Vec<_> = locations.iter().map(|(k, l)| (*k, *l)).collect();
        let mut target_output = FrameOutput::create(target, self.options())?;
        let mut source_reader = FrameReader::open(&source)?;
        let copied = copy_records(&mut source_reader, &mut target_output, entries, generation)?;
        let target_reader = FrameReader::open(target)?;
        let descriptor = copied.descriptor(generation);

        let mut state = self.state.write();
        *self.output.lock() = target_output;
        *self.reader.lock() = target_reader;

        state.path = target.to_path_buf();
        state.locations = Arc::new(copied.locations);
        state.live_size = copied.live_size;
        state.chain_size = copied.fragment.length as u64;
        state.fragments = vec![FragmentRef {
            generation,
            location: copied.fragment,
        }];
        state.descriptor = descriptor.clone();
        drop(state);

        info!(
            target = %target.display(),
            old_size,
            new_size = descriptor.file_size,
            records = descriptor.record_count,
            "Compacted record store"
        );
        Ok(descriptor)
    }

    /// Compact into `target` when the file is large enough and mostly dead.
    ///
    /// Returns `None` when no compaction was needed (or writes are pending).
    pub fn compact_if_needed(&self, target: &Path) -> Result<Option<OffsetIndexDescriptor>> {
        self.ensure_operative()?;
        let (share, file_size, pending) = {
            let state = self.state.read();
            let file_size = self.output.lock().position();
            (
                active_share(state.live_size + state.chain_size, file_size),
                file_size,
                state.overlay.len(),
            )
        };

        let options = self.options();
        if pending > 0
            || file_size < options.file_size_compaction_threshold
            || share >= options.minimal_active_record_share
        {
            debug!(share, file_size, pending, "Compaction not needed");
            return Ok(None);
        }
        self.compact(target).map(Some)
    }

    /// Write a self-contained copy of the store as of generation `as_of`
    /// (latest flush when `None`) into `writer`.
    ///
    /// Only records whose key passes `filter` are copied. Non-flushed writes
    /// are never part of a snapshot. The returned descriptor opens the copy.
    pub fn copy_snapshot_to<W, F>(
        &self,
        writer: W,
        filter: F,
        as_of: Option<i64>,
    ) -> Result<OffsetIndexDescriptor>
    where
        W: Write,
        F: Fn(&RecordKey) -> bool,
    {
        self.ensure_operative()?;
        let (path, current, tail, oldest, last_flushed) = {
            let state = self.state.read();
            self.output.lock().flush()?;
            (
                state.path.clone(),
                Arc::clone(&state.locations),
                state.descriptor.location,
                state.fragments.first().map_or(0, |f| f.generation),
                state.last_flushed_generation,
            )
        };
        let mut reader = FrameReader::open(&path)?;

        let (locations, generation) = match as_of {
            Some(requested) if requested < oldest => {
                return Err(KvError::SnapshotUnavailable { requested, oldest });
            }
            Some(requested) if requested < last_flushed => {
                let chain = fragment::load_chain(&mut reader, tail)?;
                let rebuilt = fragment::replay(&chain, Some(self.registry()), Some(requested))?;
                let generation = rebuilt.fragments.last().map_or(oldest, |f| f.generation);
                (rebuilt.locations, generation)
            }
            _ => ((*current).clone(), last_flushed),
        };

        let entries: Vec<_> = locations
            .into_iter()
            .filter(|(key, _)| filter(key))
            .collect();
        let mut output = FrameOutput::with_sink(StreamSink(writer), 0, self.options());
        let copied = copy_records(&mut reader, &mut output, entries, generation)?;

        info!(
            generation,
            records = copied.locations.len(),
            size = copied.file_size,
            "Copied snapshot"
        );
        Ok(copied.descriptor(generation))
    }
}

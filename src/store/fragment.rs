//! Index fragments: the persisted form of the key map.
//!
//! Each flush appends one fragment holding the entries folded by that flush
//! and the location of the previous fragment. Replaying the chain oldest
//! first reproduces the key map.

use std::collections::HashMap;
use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};
use crate::record::{FileLocation, FrameOutput, FrameReader, FrameSink};

use super::part::RecordTypeRegistry;
use super::{active_share, OffsetIndexDescriptor, RecordKey, VersionedValue};

/// One change to the key map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FragmentEntry {
    Put { key: RecordKey, location: FileLocation },
    Remove { key: RecordKey },
}

impl From<&VersionedValue> for FragmentEntry {
    fn from(value: &VersionedValue) -> Self {
        if value.removal {
            FragmentEntry::Remove { key: value.key }
        } else {
            FragmentEntry::Put {
                key: value.key,
                location: value.location,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexFragment {
    pub previous: Option<FileLocation>,
    pub entries: Vec<FragmentEntry>,
}

impl IndexFragment {
    /// Fragment replacing the whole chain: every live entry, no predecessor
    pub fn full(locations: &HashMap<RecordKey, FileLocation>) -> Self {
        let mut entries: Vec<(RecordKey, FileLocation)> =
            locations.iter().map(|(k, l)| (*k, *l)).collect();
        entries.sort_by_key(|(_, location)| location.starting_position);
        Self {
            previous: None,
            entries: entries
                .into_iter()
                .map(|(key, location)| FragmentEntry::Put { key, location })
                .collect(),
        }
    }

    /// Append the fragment as a generation-closing record
    pub fn write<S: FrameSink>(
        &self,
        output: &mut FrameOutput<S>,
        generation: i64,
    ) -> Result<FileLocation> {
        output.write_record(generation, true, |w| {
            bincode::serialize_into(w, self)?;
            Ok(())
        })
    }

    /// Read the fragment at `location`, returning its generation too
    pub fn read<R: Read + Seek>(
        reader: &mut FrameReader<R>,
        location: FileLocation,
    ) -> Result<(i64, Self)> {
        let record = reader.read_record(location)?;
        if !record.closes_generation {
            return Err(KvError::corrupted(
                location.starting_position,
                "expected an index fragment, found a data record",
            ));
        }
        let payload = record.payload.unwrap_or_default();
        let fragment = bincode::deserialize(&payload)?;
        Ok((record.generation, fragment))
    }

    /// Apply the entries to a key map, keeping `live_size` in step
    pub fn apply(&self, locations: &mut HashMap<RecordKey, FileLocation>, live_size: &mut u64) {
        for entry in &self.entries {
            match entry {
                FragmentEntry::Put { key, location } => {
                    if let Some(previous) = locations.insert(*key, *location) {
                        *live_size -= previous.length as u64;
                    }
                    *live_size += location.length as u64;
                }
                FragmentEntry::Remove { key } => {
                    if let Some(previous) = locations.remove(key) {
                        *live_size -= previous.length as u64;
                    }
                }
            }
        }
    }
}

/// Position of one fragment in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentRef {
    pub generation: i64,
    pub location: FileLocation,
}

/// Key map rebuilt from a fragment chain
#[derive(Debug, Default)]
pub(crate) struct RebuiltIndex {
    pub locations: HashMap<RecordKey, FileLocation>,
    /// Oldest first
    pub fragments: Vec<FragmentRef>,
    pub live_size: u64,
    pub chain_size: u64,
}

impl RebuiltIndex {
    /// Descriptor of the newest fragment, `None` for an empty chain
    pub fn descriptor(&self, file_size: u64) -> Option<OffsetIndexDescriptor> {
        self.fragments.last().map(|tail| OffsetIndexDescriptor {
            location: tail.location,
            generation: tail.generation,
            record_count: self.locations.len() as u64,
            file_size,
            active_record_share: active_share(self.live_size + self.chain_size, file_size),
        })
    }
}

/// Walk the chain back from `tail` and return it oldest first
pub(crate) fn load_chain<R: Read + Seek>(
    reader: &mut FrameReader<R>,
    tail: FileLocation,
) -> Result<Vec<(FragmentRef, IndexFragment)>> {
    let mut chain = Vec::new();
    let mut next = Some(tail);
    let mut last_generation = i64::MAX;

    while let Some(location) = next {
        let (generation, fragment) = IndexFragment::read(reader, location)?;
        if let Some(previous) = fragment.previous {
            if previous.end_position() > location.starting_position {
                return Err(KvError::corrupted(
                    location.starting_position,
                    format!(
                        "index fragment points forward to {}",
                        previous.starting_position
                    ),
                ));
            }
        }
        if generation > last_generation {
            return Err(KvError::corrupted(
                location.starting_position,
                format!(
                    "index fragment generation {} newer than its successor {}",
                    generation, last_generation
                ),
            ));
        }
        last_generation = generation;
        next = fragment.previous;
        chain.push((FragmentRef { generation, location }, fragment));
    }

    chain.reverse();
    Ok(chain)
}

/// Replay fragments (oldest first) into a key map.
///
/// Fragments with a generation above `as_of` are skipped. With a registry,
/// every record type in the chain must be registered.
pub(crate) fn replay<'a>(
    chain: impl IntoIterator<Item = &'a (FragmentRef, IndexFragment)>,
    registry: Option<&RecordTypeRegistry>,
    as_of: Option<i64>,
) -> Result<RebuiltIndex> {
    let mut rebuilt = RebuiltIndex::default();
    for (fragment_ref, fragment) in chain {
        if as_of.is_some_and(|limit| fragment_ref.generation > limit) {
            break;
        }
        if let Some(registry) = registry {
            for entry in &fragment.entries {
                let key = match entry {
                    FragmentEntry::Put { key, .. } | FragmentEntry::Remove { key } => key,
                };
                registry.ensure_known(key.record_type)?;
            }
        }
        fragment.apply(&mut rebuilt.locations, &mut rebuilt.live_size);
        rebuilt.chain_size += fragment_ref.location.length as u64;
        rebuilt.fragments.push(*fragment_ref);
    }
    Ok(rebuilt)
}

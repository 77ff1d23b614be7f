//! Non-flushed writes, visible to readers before they are folded into the index.
//!
//! Each key keeps one entry per generation it was written in, so a reader at
//! an older generation still finds the write it is entitled to see.

use std::collections::BTreeMap;

use crate::record::FileLocation;

use super::{RecordKey, VersionedValue};

/// Writes made since the last flush, last write per key and generation wins
#[derive(Debug, Default)]
pub(crate) struct NonFlushedValues {
    /// Per key, ascending by generation
    values: BTreeMap<RecordKey, Vec<VersionedValue>>,
    latest_generation: Option<i64>,
}

impl NonFlushedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_put(&mut self, key: RecordKey, generation: i64, location: FileLocation) {
        self.record(VersionedValue {
            key,
            generation,
            location,
            removal: false,
        });
    }

    /// Record removal of a record; `location` is the record being removed
    pub fn record_removal(&mut self, key: RecordKey, generation: i64, location: FileLocation) {
        self.record(VersionedValue {
            key,
            generation,
            location,
            removal: true,
        });
    }

    /// Forget every pending write of a key
    pub fn discard(&mut self, key: &RecordKey) -> Option<Vec<VersionedValue>> {
        self.values.remove(key)
    }

    /// Newest pending write of a key
    pub fn get(&self, key: &RecordKey) -> Option<&VersionedValue> {
        self.values.get(key).and_then(|history| history.last())
    }

    /// Newest pending write of a key made in `generation` or before
    pub fn visible_at(&self, key: &RecordKey, generation: i64) -> Option<&VersionedValue> {
        self.values
            .get(key)
            .and_then(|history| history.iter().rev().find(|v| v.generation <= generation))
    }

    /// Pending writes of a key, oldest first
    pub fn history(&self, key: &RecordKey) -> &[VersionedValue] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of keys with pending writes
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn latest_generation(&self) -> Option<i64> {
        self.latest_generation
    }

    /// Newest pending write per key, ordered by key
    pub fn values(&self) -> impl Iterator<Item = &VersionedValue> {
        self.values.values().filter_map(|history| history.last())
    }

    /// Every pending write, ordered by key then generation
    pub fn all_values(&self) -> impl Iterator<Item = &VersionedValue> {
        self.values.values().flatten()
    }

    /// Newest write per key in the order the records sit in the file, removals last
    pub fn in_file_order(&self) -> Vec<VersionedValue> {
        let mut ordered: Vec<VersionedValue> = self.values().copied().collect();
        ordered.sort_by_key(|v| (v.removal, v.location.starting_position));
        ordered
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.latest_generation = None;
    }

    fn record(&mut self, value: VersionedValue) {
        let generation = value.generation;
        let history = self.values.entry(value.key).or_default();
        match history.last_mut() {
            Some(last) if last.generation == generation => *last = value,
            _ => history.push(value),
        }
        self.latest_generation = Some(self.latest_generation.map_or(generation, |g| g.max(generation)));
    }
}

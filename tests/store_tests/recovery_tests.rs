//! Tests for tail recovery
//!
//! These tests verify:
//! - Records written after the last flush are cut off
//! - Torn fragments and garbage tails fall back to the previous generation
//! - Damage in the middle of the file discards everything after it
//! - Files without any complete generation are emptied
//! - A recovered file reopens and accepts new writes

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use framekv::record::{FrameOutput, HEADER_SIZE};
use framekv::store::recover;
use framekv::{
    OffsetIndexDescriptor, RecordStore, RecordTypeRegistry, StoragePart, StorageOptions,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sample {
    id: i64,
    reading: f64,
}

impl StoragePart for Sample {
    fn record_type(&self) -> u8 {
        1
    }

    fn primary_key(&self) -> i64 {
        self.id
    }
}

fn sample(id: i64, reading: f64) -> Sample {
    Sample { id, reading }
}

fn registry() -> RecordTypeRegistry {
    RecordTypeRegistry::new().register(1, "sample")
}

/// Every record reaches the file as soon as it is written
fn eager_options() -> StorageOptions {
    StorageOptions::builder().flush_threshold(1).build()
}

fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("samples.dat");
    (temp_dir, path)
}

fn create_store(path: &Path) -> RecordStore<Sample> {
    RecordStore::create(path, eager_options(), registry()).unwrap()
}

fn open_store(path: &Path, descriptor: &OffsetIndexDescriptor) -> RecordStore<Sample> {
    RecordStore::open(path, descriptor, eager_options(), registry()).unwrap()
}

fn append_bytes(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_clean_file_is_untouched() {
    let (_temp, path) = setup_temp_file();
    let store = create_store(&path);
    store.put(1, &sample(1, 0.5)).unwrap();
    let descriptor = store.flush(1).unwrap();
    store.close().unwrap();
    let size = file_len(&path);

    let (report, recovered) = recover(&path, &StorageOptions::default()).unwrap();

    assert!(!report.was_truncated);
    assert_eq!(report.truncated_bytes, 0);
    assert_eq!(report.frames_scanned, 3);
    assert_eq!(report.last_generation, Some(1));
    assert_eq!(recovered, Some(descriptor));
    assert_eq!(file_len(&path), size);
}

#[test]
fn test_non_flushed_records_are_cut_off() {
    let (_temp, path) = setup_temp_file();
    let store = create_store(&path);
    store.put(1, &sample(1, 1.0)).unwrap();
    let descriptor = store.flush(1).unwrap();
    store.put(2, &sample(2, 2.0)).unwrap();
    store.put(2, &sample(3, 3.0)).unwrap();
    drop(store);
    let size = file_len(&path);
    assert!(size > descriptor.file_size);

    let (report, recovered) = recover(&path, &StorageOptions::default()).unwrap();

    assert!(report.was_truncated);
    assert_eq!(report.truncated_bytes, size - descriptor.file_size);
    assert_eq!(file_len(&path), descriptor.file_size);
    assert_eq!(recovered, Some(descriptor));
}

#[test]
fn test_torn_fragment_falls_back_to_previous_generation() {
    let (_temp, path) = setup_temp_file();
    let store = create_store(&path);
    store.put(1, &sample(1, 1.0)).unwrap();
    let first = store.flush(1).unwrap();
    store.put(2, &sample(1, 9.0)).unwrap();
    let second = store.flush(2).unwrap();
    drop(store);

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(second.file_size - 3).unwrap();
    drop(file);

    let (report, recovered) = recover(&path, &StorageOptions::default()).unwrap();
    let recovered = recovered.unwrap();

    assert_eq!(report.last_generation, Some(1));
    assert_eq!(recovered, first);
    assert_eq!(file_len(&path), first.file_size);

    let store = open_store(&path, &recovered);
    assert_eq!(store.get(2, 1, 1).unwrap(), Some(sample(1, 1.0)));
}

#[test]
fn test_garbage_tail_is_removed() {
    let (_temp, path) = setup_temp_file();
    let store = create_store(&path);
    store.put(1, &sample(1, 1.0)).unwrap();
    let descriptor = store.flush(1).unwrap();
    store.close().unwrap();

    append_bytes(&path, &[0xAB; 37]);

    let (report, recovered) = recover(&path, &StorageOptions::default()).unwrap();

    assert_eq!(report.truncated_bytes, 37);
    assert_eq!(recovered, Some(descriptor.clone()));
    assert_eq!(file_len(&path), descriptor.file_size);
}

#[test]
fn test_damage_in_the_middle_discards_later_generations() {
    let (_temp, path) = setup_temp_file();
    let store = create_store(&path);
    store.put(1, &sample(1, 1.0)).unwrap();
    let first = store.flush(1).unwrap();
    let damaged = store.put(2, &sample(2, 2.0)).unwrap();
    store.put(3, &sample(3, 3.0)).unwrap();
    store.flush(3).unwrap();
    store.close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[damaged.starting_position as usize + HEADER_SIZE] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let (report, recovered) = recover(&path, &StorageOptions::default()).unwrap();

    assert_eq!(report.last_generation, Some(1));
    assert_eq!(recovered, Some(first.clone()));
    assert_eq!(file_len(&path), first.file_size);
}

#[test]
fn test_file_without_complete_generation_is_emptied() {
    let (_temp, path) = setup_temp_file();
    let mut output = FrameOutput::create(&path, &StorageOptions::default()).unwrap();
    output
        .write_record(1, false, |w| Ok(w.write_all(b"orphan")?))
        .unwrap();
    output.sync().unwrap();
    let size = file_len(&path);

    let (report, recovered) = recover(&path, &StorageOptions::default()).unwrap();

    assert!(recovered.is_none());
    assert_eq!(report.last_generation, None);
    assert_eq!(report.frames_scanned, 1);
    assert_eq!(report.truncated_bytes, size);
    assert_eq!(file_len(&path), 0);
}

#[test]
fn test_recovered_store_accepts_new_writes() {
    let (_temp, path) = setup_temp_file();
    let store = create_store(&path);
    for id in 0..5 {
        store.put(1, &sample(id, id as f64)).unwrap();
    }
    store.flush(1).unwrap();
    store.put(2, &sample(99, 0.0)).unwrap();
    drop(store);

    let (_, recovered) = recover(&path, &StorageOptions::default()).unwrap();
    let store = open_store(&path, &recovered.unwrap());
    store.put(2, &sample(5, 5.0)).unwrap();
    let descriptor = store.flush(2).unwrap();
    store.close().unwrap();

    let store = open_store(&path, &descriptor);
    assert_eq!(store.count().unwrap(), 6);
    assert_eq!(store.get(2, 99, 1).unwrap(), None);
    assert_eq!(store.get(2, 5, 1).unwrap(), Some(sample(5, 5.0)));
    let stats = store.verify_contents().unwrap();
    assert_eq!(stats.living_record_count, 6);
    assert_eq!(stats.fragment_count, 3);
}

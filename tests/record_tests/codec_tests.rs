//! Tests for the frame codec
//!
//! These tests verify:
//! - Single-frame and continuation-frame round trips
//! - CRC trailer on/off and compression on/off
//! - Location lengths spanning every chained frame
//! - Rollback of a failed record write, whether the payload or the sink fails

use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use framekv::record::{
    ControlByte, FileLocation, FrameOutput, FrameReader, FrameSink, OVERHEAD_SIZE,
};
use framekv::{KvError, StorageOptions};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("frames.dat");
    (temp_dir, path)
}

/// Options with a frame size that forces continuation for larger payloads
fn small_frames(payload_capacity: usize) -> StorageOptions {
    StorageOptions::builder()
        .output_buffer_size(OVERHEAD_SIZE + payload_capacity)
        .flush_threshold(1)
        .build()
}

fn write_payloads(
    path: &Path,
    options: &StorageOptions,
    payloads: &[Vec<u8>],
) -> Vec<FileLocation> {
    let mut output = FrameOutput::create(path, options).unwrap();
    let locations = payloads
        .iter()
        .enumerate()
        .map(|(i, payload)| {
            output
                .write_record(i as i64 + 1, false, |w| Ok(w.write_all(payload)?))
                .unwrap()
        })
        .collect();
    output.sync().unwrap();
    locations
}

/// In-memory sink whose writes fail while `failing` is set
struct FailingSink {
    bytes: Vec<u8>,
    failing: Arc<AtomicBool>,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FrameSink for FailingSink {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.bytes.truncate(len as usize);
        Ok(())
    }
}

fn read_payload(path: &Path, location: FileLocation) -> Vec<u8> {
    let mut reader = FrameReader::open(path).unwrap();
    reader.read_record(location).unwrap().payload.unwrap()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_single_frame_round_trip() {
    let (_temp, path) = setup_temp_file();
    let payload = b"a single frame payload".to_vec();

    let locations = write_payloads(&path, &StorageOptions::default(), &[payload.clone()]);

    assert_eq!(locations[0].starting_position, 0);
    assert_eq!(locations[0].length as usize, OVERHEAD_SIZE + payload.len());
    assert_eq!(read_payload(&path, locations[0]), payload);
}

#[test]
fn test_empty_payload_round_trip() {
    let (_temp, path) = setup_temp_file();

    let locations = write_payloads(&path, &StorageOptions::default(), &[Vec::new()]);

    assert_eq!(locations[0].length as usize, OVERHEAD_SIZE);
    assert!(read_payload(&path, locations[0]).is_empty());
}

#[test]
fn test_continuation_round_trip() {
    let (_temp, path) = setup_temp_file();
    let options = small_frames(64);
    let payload: Vec<u8> = (0..1_000u32).map(|i| (i % 251) as u8).collect();

    let locations = write_payloads(&path, &options, &[payload.clone(), b"next".to_vec()]);

    // ceil(1000 / 64) = 16 frames
    assert_eq!(locations[0].length as usize, 16 * OVERHEAD_SIZE + 1_000);
    assert_eq!(locations[1].starting_position, locations[0].end_position());
    assert_eq!(read_payload(&path, locations[0]), payload);
    assert_eq!(read_payload(&path, locations[1]), b"next");
}

#[test]
fn test_continuation_frames_share_generation() {
    let (_temp, path) = setup_temp_file();
    let options = small_frames(64);
    let mut output = FrameOutput::create(&path, &options).unwrap();
    let location = output
        .write_record(42, true, |w| Ok(w.write_all(&[1u8; 200])?))
        .unwrap();
    output.sync().unwrap();

    let mut reader = FrameReader::open(&path).unwrap();
    let mut position = location.starting_position;
    let mut frames = Vec::new();
    while position < location.end_position() {
        let header = reader.read_header(position).unwrap();
        frames.push(header);
        position = header.end_position();
    }

    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|h| h.generation == 42));
    assert!(frames[..3].iter().all(|h| h.control.is_continuation()));
    assert!(frames[..3].iter().all(|h| !h.control.closes_generation()));
    assert!(!frames[3].control.is_continuation());
    assert!(frames[3].control.closes_generation());
}

#[test]
fn test_round_trip_without_crc() {
    let (_temp, path) = setup_temp_file();
    let options = StorageOptions::builder().compute_crc32(false).build();

    let locations = write_payloads(&path, &options, &[b"no trailer".to_vec()]);

    assert_eq!(locations[0].length as usize, OVERHEAD_SIZE - 8 + 10);
    let mut reader = FrameReader::open(&path).unwrap();
    assert!(!reader.read_header(0).unwrap().control.has_crc());
    assert_eq!(read_payload(&path, locations[0]), b"no trailer");
}

#[test]
fn test_compressed_round_trip_with_continuation() {
    let (_temp, path) = setup_temp_file();
    let options = StorageOptions::builder()
        .output_buffer_size(OVERHEAD_SIZE + 512)
        .compress(true)
        .build();
    let payload = b"compressible ".repeat(200);

    let locations = write_payloads(&path, &options, &[payload.clone()]);

    assert!((locations[0].length as usize) < payload.len());
    let mut reader = FrameReader::open(&path).unwrap();
    let header = reader.read_header(0).unwrap();
    assert!(header.control.is_compressed());
    assert_eq!(read_payload(&path, locations[0]), payload);
}

#[test]
fn test_incompressible_payload_stored_plain() {
    let (_temp, path) = setup_temp_file();
    let options = StorageOptions::builder().compress(true).build();
    let payload: Vec<u8> = (0..64u32).map(|i| (i * 97 % 256) as u8).collect();

    write_payloads(&path, &options, &[payload.clone()]);

    let mut reader = FrameReader::open(&path).unwrap();
    let (header, decoded) = reader.read_frame(0).unwrap();
    assert!(!header.control.is_compressed());
    assert_eq!(decoded, payload);
}

// =============================================================================
// Raw Read Tests
// =============================================================================

#[test]
fn test_raw_record_is_verbatim() {
    let (_temp, path) = setup_temp_file();
    let options = StorageOptions::builder().compress(true).build();
    let locations = write_payloads(&path, &options, &[b"zzzz".repeat(100)]);

    let file_bytes = std::fs::read(&path).unwrap();
    let mut reader = FrameReader::open(&path).unwrap();
    let raw = reader.read_raw_record(locations[0]).unwrap();

    assert_eq!(raw.bytes, file_bytes[..locations[0].length as usize]);
    assert_eq!(raw.frame_count, 1);
    assert!(ControlByte::new(raw.bytes[4]).is_compressed());
}

#[test]
fn test_raw_copy_reads_back_identically() {
    let (_temp, path) = setup_temp_file();
    let options = small_frames(64);
    let payload = vec![5u8; 300];
    let locations = write_payloads(&path, &options, &[payload.clone()]);

    let mut reader = FrameReader::open(&path).unwrap();
    let raw = reader.read_raw_record(locations[0]).unwrap();

    let copy_path = path.with_extension("copy");
    let mut output = FrameOutput::create(&copy_path, &options).unwrap();
    let copied = output.append_raw(&raw.bytes).unwrap();
    output.sync().unwrap();

    assert_eq!(copied.length, locations[0].length);
    assert_eq!(read_payload(&copy_path, copied), payload);
}

// =============================================================================
// Failure Handling Tests
// =============================================================================

#[test]
fn test_failed_write_leaves_no_partial_frame() {
    let (_temp, path) = setup_temp_file();
    let options = small_frames(64);
    let mut output = FrameOutput::create(&path, &options).unwrap();
    let kept = output
        .write_record(1, false, |w| Ok(w.write_all(b"kept")?))
        .unwrap();

    let result = output.write_record(1, false, |w| {
        w.write_all(&[0u8; 500])?;
        Err(KvError::Serialization("payload writer failed".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(output.position(), kept.end_position());

    let next = output
        .write_record(2, false, |w| Ok(w.write_all(b"next")?))
        .unwrap();
    output.sync().unwrap();

    assert_eq!(next.starting_position, kept.end_position());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), next.end_position());
    assert_eq!(read_payload(&path, next), b"next");
}

#[test]
fn test_rollback_to_durable_offset_truncates_file() {
    let (_temp, path) = setup_temp_file();
    let options = small_frames(64);
    let mut output = FrameOutput::create(&path, &options).unwrap();
    let first = output
        .write_record(1, false, |w| Ok(w.write_all(b"one")?))
        .unwrap();
    output
        .write_record(1, false, |w| Ok(w.write_all(b"two")?))
        .unwrap();
    output.sync().unwrap();

    output.rollback_to(first.end_position()).unwrap();
    output.sync().unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), first.end_position());
}

#[test]
fn test_sink_failure_rewinds_output() {
    let failing = Arc::new(AtomicBool::new(false));
    let sink = FailingSink {
        bytes: Vec::new(),
        failing: Arc::clone(&failing),
    };
    let mut output = FrameOutput::with_sink(sink, 0, &small_frames(64));
    let kept = output
        .write_record(1, false, |w| Ok(w.write_all(b"kept")?))
        .unwrap();

    failing.store(true, Ordering::SeqCst);
    let result = output.write_record(2, true, |w| Ok(w.write_all(b"lost")?));
    assert!(matches!(result, Err(KvError::Io(_))));
    assert_eq!(output.position(), kept.end_position());

    failing.store(false, Ordering::SeqCst);
    let next = output
        .write_record(2, true, |w| Ok(w.write_all(b"next")?))
        .unwrap();
    output.flush().unwrap();
    assert_eq!(next.starting_position, kept.end_position());

    let bytes = output.into_sink().bytes;
    assert_eq!(bytes.len() as u64, next.end_position());
    let mut reader = FrameReader::new(Cursor::new(bytes)).unwrap();
    assert_eq!(reader.read_record(kept).unwrap().payload.unwrap(), b"kept");
    let record = reader.read_record(next).unwrap();
    assert_eq!(record.payload.unwrap(), b"next");
    assert!(record.closes_generation);
}

//! Frame Reader
//!
//! Reads framed records back: by location, sequentially, or raw.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{KvError, Result};

use super::{
    frame_crc, ControlByte, FileLocation, StorageRecord, CRC_SIZE, CRC_NOT_COVERED_HEAD,
    HEADER_SIZE, LENGTH_FIELD_SIZE,
};

/// Decoded header of a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Offset of the length field
    pub position: u64,
    /// Bytes following the length field
    pub length: u32,
    pub control: ControlByte,
    pub generation: i64,
}

impl FrameHeader {
    /// Whole frame size, length field included
    pub fn frame_size(&self) -> u64 {
        LENGTH_FIELD_SIZE as u64 + self.length as u64
    }

    pub fn end_position(&self) -> u64 {
        self.position + self.frame_size()
    }

    fn trailer_size(&self) -> usize {
        if self.control.has_crc() {
            CRC_SIZE
        } else {
            0
        }
    }

    /// Payload bytes as stored (possibly compressed)
    pub fn stored_payload_len(&self) -> usize {
        self.frame_size() as usize - HEADER_SIZE - self.trailer_size()
    }
}

/// One frame exactly as it sits in the file
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub bytes: Vec<u8>,
}

/// All frames of one logical record exactly as they sit in the file
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub generation: i64,
    pub closes_generation: bool,
    pub location: FileLocation,
    /// Number of chained frames
    pub frame_count: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// Verify and decode payloads
    Decode,
    /// Verify, keep the frames verbatim
    Raw,
    /// Headers only
    Skip,
}

struct WalkedRecord {
    generation: i64,
    closes_generation: bool,
    location: FileLocation,
    frame_count: usize,
    bytes: Vec<u8>,
}

/// Reader over a framed record file
pub struct FrameReader<R: Read + Seek> {
    inner: R,
    file_len: u64,
}

impl FrameReader<BufReader<File>> {
    /// Open a file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> FrameReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        Ok(Self { inner, file_len })
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Re-read the file length after the file has grown
    pub fn refresh_len(&mut self) -> Result<u64> {
        self.file_len = self.inner.seek(SeekFrom::End(0))?;
        Ok(self.file_len)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Read and validate the header of the frame starting at `position`
    pub fn read_header(&mut self, position: u64) -> Result<FrameHeader> {
        if position + HEADER_SIZE as u64 > self.file_len {
            return Err(KvError::PrematureEndOfFile {
                position,
                declared_length: HEADER_SIZE as u64,
                file_size: self.file_len,
            });
        }

        let mut buf = [0u8; HEADER_SIZE];
        self.inner.seek(SeekFrom::Start(position))?;
        self.read_exact_at(position, &mut buf)?;

        let declared = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let control = ControlByte::new(buf[LENGTH_FIELD_SIZE]);
        let mut generation_bytes = [0u8; 8];
        generation_bytes.copy_from_slice(&buf[CRC_NOT_COVERED_HEAD..HEADER_SIZE]);
        let generation = i64::from_le_bytes(generation_bytes);

        if control.has_reserved_bits() {
            return Err(KvError::corrupted(
                position,
                format!("reserved control bits set: 0x{:02x}", control.bits()),
            ));
        }

        let minimal = (HEADER_SIZE - LENGTH_FIELD_SIZE) as i64
            + if control.has_crc() { CRC_SIZE as i64 } else { 0 };
        if (declared as i64) < minimal {
            return Err(KvError::corrupted(
                position,
                format!("declared length {} below minimum {}", declared, minimal),
            ));
        }

        let header = FrameHeader {
            position,
            length: declared as u32,
            control,
            generation,
        };
        if header.end_position() > self.file_len {
            return Err(KvError::PrematureEndOfFile {
                position,
                declared_length: header.frame_size(),
                file_size: self.file_len,
            });
        }
        Ok(header)
    }

    /// Read one frame and return its decoded payload
    pub fn read_frame(&mut self, position: u64) -> Result<(FrameHeader, Vec<u8>)> {
        let raw = self.read_raw_frame(position)?;
        let payload = decode_frame(&raw.header, &raw.bytes)?;
        Ok((raw.header, payload))
    }

    /// Read one frame verbatim
    pub fn read_raw_frame(&mut self, position: u64) -> Result<RawFrame> {
        let header = self.read_header(position)?;
        let mut bytes = vec![0u8; header.frame_size() as usize];
        self.inner.seek(SeekFrom::Start(position))?;
        self.read_exact_at(position, &mut bytes)?;
        Ok(RawFrame { header, bytes })
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Read the record at a known location.
    ///
    /// Fails with a corruption error when the chained frames do not add up to
    /// exactly `location.length` bytes.
    pub fn read_record(&mut self, location: FileLocation) -> Result<StorageRecord<Vec<u8>>> {
        let walked = self.walk_record(location.starting_position, ReadMode::Decode)?;
        check_length(&walked, location)?;
        Ok(into_storage_record(walked))
    }

    /// Read whichever record starts at `position`
    pub fn read_record_at(&mut self, position: u64) -> Result<StorageRecord<Vec<u8>>> {
        let walked = self.walk_record(position, ReadMode::Decode)?;
        Ok(into_storage_record(walked))
    }

    /// Read the record starting at `position` during a front-to-back scan.
    ///
    /// `resolver` is asked with the record's start offset for a decoder; when
    /// it has none, the payload is skipped without being read and the record
    /// comes back with `payload: None`.
    pub fn read_sequential<T, D, F>(&mut self, position: u64, resolver: F) -> Result<StorageRecord<T>>
    where
        F: FnOnce(u64) -> Option<D>,
        D: FnOnce(&[u8]) -> Result<T>,
    {
        match resolver(position) {
            Some(decode) => {
                let walked = self.walk_record(position, ReadMode::Decode)?;
                let payload = decode(&walked.bytes)?;
                Ok(into_storage_record(walked).map(|_| payload))
            }
            None => {
                let walked = self.walk_record(position, ReadMode::Skip)?;
                Ok(StorageRecord {
                    generation: walked.generation,
                    closes_generation: walked.closes_generation,
                    payload: None,
                    location: walked.location,
                })
            }
        }
    }

    /// Read all frames of the record at `location` verbatim, still compressed
    pub fn read_raw_record(&mut self, location: FileLocation) -> Result<RawRecord> {
        let walked = self.walk_record(location.starting_position, ReadMode::Raw)?;
        check_length(&walked, location)?;
        Ok(into_raw_record(walked))
    }

    /// Read all frames of the record starting at `position` verbatim
    pub fn read_raw_record_at(&mut self, position: u64) -> Result<RawRecord> {
        let walked = self.walk_record(position, ReadMode::Raw)?;
        Ok(into_raw_record(walked))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Follow the continuation chain starting at `position`
    fn walk_record(&mut self, position: u64, mode: ReadMode) -> Result<WalkedRecord> {
        let mut cursor = position;
        let mut generation = None;
        let mut frame_count = 0usize;
        let mut bytes = Vec::new();

        loop {
            let header = match mode {
                ReadMode::Skip => self.read_header(cursor)?,
                ReadMode::Decode => {
                    let (header, payload) = self.read_frame(cursor)?;
                    bytes.extend_from_slice(&payload);
                    header
                }
                ReadMode::Raw => {
                    let raw = self.read_raw_frame(cursor)?;
                    decode_frame(&raw.header, &raw.bytes)?;
                    bytes.extend_from_slice(&raw.bytes);
                    raw.header
                }
            };

            match generation {
                None => generation = Some(header.generation),
                Some(expected) if expected != header.generation => {
                    return Err(KvError::corrupted(
                        cursor,
                        format!(
                            "continuation frame generation {} differs from {}",
                            header.generation, expected
                        ),
                    ));
                }
                Some(_) => {}
            }

            frame_count += 1;
            cursor = header.end_position();

            if !header.control.is_continuation() {
                let length = u32::try_from(cursor - position).map_err(|_| {
                    KvError::corrupted(position, "record spans more than 4 GiB")
                })?;
                return Ok(WalkedRecord {
                    generation: header.generation,
                    closes_generation: header.control.closes_generation(),
                    location: FileLocation::new(position, length),
                    frame_count,
                    bytes,
                });
            }
        }
    }

    fn read_exact_at(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(KvError::PrematureEndOfFile {
                    position,
                    declared_length: buf.len() as u64,
                    file_size: self.file_len,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Check the trailer and decompress the payload of a complete frame
fn decode_frame(header: &FrameHeader, frame: &[u8]) -> Result<Vec<u8>> {
    let stored_end = HEADER_SIZE + header.stored_payload_len();
    let stored = &frame[HEADER_SIZE..stored_end];

    if header.control.has_crc() {
        let mut trailer = [0u8; CRC_SIZE];
        trailer.copy_from_slice(&frame[stored_end..stored_end + CRC_SIZE]);
        let expected = u64::from_le_bytes(trailer);
        let actual = frame_crc(header.generation, stored);
        if expected != actual {
            return Err(KvError::ChecksumMismatch {
                position: header.position,
                expected,
                actual,
            });
        }
    }

    if header.control.is_compressed() {
        snap::raw::Decoder::new()
            .decompress_vec(stored)
            .map_err(|e| KvError::corrupted(header.position, format!("bad compressed payload: {}", e)))
    } else {
        Ok(stored.to_vec())
    }
}

fn check_length(walked: &WalkedRecord, location: FileLocation) -> Result<()> {
    if walked.location.length != location.length {
        return Err(KvError::corrupted(
            location.starting_position,
            format!(
                "record spans {}B, index expects {}B",
                walked.location.length, location.length
            ),
        ));
    }
    Ok(())
}

fn into_storage_record(walked: WalkedRecord) -> StorageRecord<Vec<u8>> {
    StorageRecord {
        generation: walked.generation,
        closes_generation: walked.closes_generation,
        payload: Some(walked.bytes),
        location: walked.location,
    }
}

fn into_raw_record(walked: WalkedRecord) -> RawRecord {
    RawRecord {
        generation: walked.generation,
        closes_generation: walked.closes_generation,
        location: walked.location,
        frame_count: walked.frame_count,
        bytes: walked.bytes,
    }
}

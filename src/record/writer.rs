//! Frame Writer
//!
//! Appends framed records to a sink, chaining continuation frames when a
//! payload exceeds the write buffer.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::BufMut;

use crate::config::StorageOptions;
use crate::error::{KvError, Result};

use super::{frame_crc, ControlByte, FileLocation, CRC_SIZE, HEADER_SIZE, LENGTH_FIELD_SIZE};

// =============================================================================
// Sinks
// =============================================================================

/// Destination of encoded frames
pub trait FrameSink: Write {
    /// Drop everything past `len` bytes
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;

    /// Make written bytes durable
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl FrameSink for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_data()
    }
}

impl FrameSink for Vec<u8> {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.truncate(len as usize);
        Ok(())
    }
}

/// Wraps an arbitrary stream that cannot be truncated (snapshot targets)
pub struct StreamSink<W: Write>(pub W);

impl<W: Write> Write for StreamSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> FrameSink for StreamSink<W> {
    fn truncate_to(&mut self, _len: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream sink cannot be rewound",
        ))
    }
}

// =============================================================================
// Frame Output
// =============================================================================

/// Append-only frame output with position tracking
///
/// Completed frames collect in `pending` and are handed to the sink once
/// `flush_threshold` bytes accumulate or on an explicit flush. A record is
/// never visible in `pending` half-written: frames are encoded completely
/// before they are appended.
pub struct FrameOutput<S: FrameSink = File> {
    sink: S,
    /// Bytes already handed to the sink
    durable: u64,
    /// Completed frames not yet handed to the sink
    pending: Vec<u8>,
    flush_threshold: usize,
    max_frame_payload: usize,
    compute_crc32: bool,
    compress: bool,
}

impl FrameOutput<File> {
    /// Create (or truncate) a file for writing
    pub fn create(path: &Path, options: &StorageOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_sink(file, 0, options))
    }

    /// Open an existing file, appending after its current end
    pub fn open(path: &Path, options: &StorageOptions) -> Result<Self> {
        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self::with_sink(file, len, options))
    }
}

impl<S: FrameSink> FrameOutput<S> {
    /// Wrap a sink that already holds `written` bytes
    pub fn with_sink(sink: S, written: u64, options: &StorageOptions) -> Self {
        Self {
            sink,
            durable: written,
            pending: Vec::with_capacity(options.flush_threshold.min(options.output_buffer_size)),
            flush_threshold: options.flush_threshold,
            max_frame_payload: options.max_frame_payload(),
            compute_crc32: options.compute_crc32,
            compress: options.compress,
        }
    }

    /// Logical end of the output (pending bytes included)
    pub fn position(&self) -> u64 {
        self.durable + self.pending.len() as u64
    }

    /// Bytes already handed to the sink
    pub fn durable_position(&self) -> u64 {
        self.durable
    }

    /// Largest payload chunk of a single frame
    pub fn max_frame_payload(&self) -> usize {
        self.max_frame_payload
    }

    /// Write one logical record, returning the location spanning all its frames.
    ///
    /// `payload_writer` streams the payload into a [`RecordWriter`]. On any
    /// failure the output is rewound to where the record started.
    pub fn write_record<F>(
        &mut self,
        generation: i64,
        closes_generation: bool,
        payload_writer: F,
    ) -> Result<FileLocation>
    where
        F: FnOnce(&mut RecordWriter<'_, S>) -> Result<()>,
    {
        let start = self.position();
        let result = {
            let mut writer = RecordWriter::new(self, generation, closes_generation);
            payload_writer(&mut writer).and_then(|_| writer.finish())
        };
        match result.and_then(|location| self.flush_if_necessary().map(|_| location)) {
            Ok(location) => Ok(location),
            Err(err) => {
                self.rollback_to(start)?;
                Err(err)
            }
        }
    }

    /// Append already encoded frame bytes verbatim
    pub fn append_raw(&mut self, frames: &[u8]) -> Result<FileLocation> {
        let length = u32::try_from(frames.len())
            .map_err(|_| KvError::InternalState("raw record exceeds 4 GiB".to_string()))?;
        let location = FileLocation::new(self.position(), length);
        self.pending.extend_from_slice(frames);
        self.flush_if_necessary()?;
        Ok(location)
    }

    /// Hand all pending bytes to the sink
    pub fn flush(&mut self) -> Result<()> {
        self.write_pending()?;
        self.sink.flush()?;
        Ok(())
    }

    /// Flush and make everything durable
    pub fn sync(&mut self) -> Result<()> {
        self.write_pending()?;
        self.sink.sync()?;
        Ok(())
    }

    /// Rewind the output to `offset`, dropping everything written after it
    pub fn rollback_to(&mut self, offset: u64) -> Result<()> {
        if offset >= self.durable {
            let keep = (offset - self.durable) as usize;
            self.pending.truncate(keep);
        } else {
            self.pending.clear();
            self.sink.truncate_to(offset)?;
            self.durable = offset;
        }
        Ok(())
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Encode a single frame and append it to the pending buffer
    fn append_frame(
        &mut self,
        control: ControlByte,
        generation: i64,
        payload: &[u8],
    ) -> Result<FileLocation> {
        let mut control = control.with(ControlByte::CRC32, self.compute_crc32);

        let compressed = if self.compress && !payload.is_empty() {
            let encoded = snap::raw::Encoder::new()
                .compress_vec(payload)
                .map_err(|e| KvError::Serialization(format!("compression failed: {}", e)))?;
            (encoded.len() < payload.len()).then_some(encoded)
        } else {
            None
        };
        let stored: &[u8] = match &compressed {
            Some(encoded) => {
                control = control.with(ControlByte::COMPRESSED, true);
                encoded
            }
            None => payload,
        };

        let trailer = if control.has_crc() { CRC_SIZE } else { 0 };
        let frame_size = HEADER_SIZE + stored.len() + trailer;
        let declared = (frame_size - LENGTH_FIELD_SIZE) as i32;

        let start = self.position();
        self.pending.reserve(frame_size);
        self.pending.put_i32_le(declared);
        self.pending.put_u8(control.bits());
        self.pending.put_i64_le(generation);
        self.pending.put_slice(stored);
        if control.has_crc() {
            self.pending.put_u64_le(frame_crc(generation, stored));
        }

        Ok(FileLocation::new(start, frame_size as u32))
    }

    fn flush_if_necessary(&mut self) -> Result<()> {
        if self.pending.len() >= self.flush_threshold {
            self.write_pending()?;
        }
        Ok(())
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.sink.write_all(&self.pending) {
            // never leave a torn frame as the apparent tail
            let _ = self.sink.truncate_to(self.durable);
            return Err(err.into());
        }
        self.durable += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

// =============================================================================
// Record Writer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    /// Nothing emitted yet
    Started,
    /// At least one continuation frame emitted
    Continuing,
    /// Final frame emitted
    Closed,
}

/// Streams one logical record into frames.
///
/// Bytes are collected into a chunk of at most `max_frame_payload` bytes.
/// When the chunk is full and more bytes arrive, the chunk is closed as a
/// continuation frame (generation-closing flag cleared) and a new frame with
/// the same generation is opened.
pub struct RecordWriter<'o, S: FrameSink> {
    output: &'o mut FrameOutput<S>,
    generation: i64,
    closes_generation: bool,
    chunk: Vec<u8>,
    start: u64,
    /// Bytes of all frames emitted so far
    length: u64,
    payload_bytes: u64,
    state: WriterState,
}

impl<'o, S: FrameSink> RecordWriter<'o, S> {
    fn new(output: &'o mut FrameOutput<S>, generation: i64, closes_generation: bool) -> Self {
        let start = output.position();
        Self {
            output,
            generation,
            closes_generation,
            chunk: Vec::new(),
            start,
            length: 0,
            payload_bytes: 0,
            state: WriterState::Started,
        }
    }

    /// Number of payload bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.payload_bytes
    }

    /// Emit the final frame and return the location of the whole record
    pub fn finish(&mut self) -> Result<FileLocation> {
        if self.state == WriterState::Closed {
            return Err(KvError::InternalState("record already finished".to_string()));
        }
        let control =
            ControlByte::default().with(ControlByte::GENERATION_CLOSING, self.closes_generation);
        let chunk = std::mem::take(&mut self.chunk);
        let frame = self.output.append_frame(control, self.generation, &chunk)?;
        self.length += frame.length as u64;
        self.state = WriterState::Closed;

        let length = u32::try_from(self.length)
            .map_err(|_| KvError::InternalState("record exceeds 4 GiB".to_string()))?;
        Ok(FileLocation::new(self.start, length))
    }

    fn emit_continuation(&mut self) -> Result<()> {
        let control = ControlByte::default().with(ControlByte::CONTINUATION, true);
        let chunk = std::mem::take(&mut self.chunk);
        let frame = self.output.append_frame(control, self.generation, &chunk)?;
        self.length += frame.length as u64;
        self.state = WriterState::Continuing;
        // reuse the allocation for the next chunk
        self.chunk = chunk;
        self.chunk.clear();
        Ok(())
    }
}

impl<S: FrameSink> Write for RecordWriter<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state == WriterState::Closed {
            return Err(io::Error::new(io::ErrorKind::Other, "record already finished"));
        }
        let capacity = self.output.max_frame_payload;
        let mut remaining = buf;
        while !remaining.is_empty() {
            if self.chunk.len() == capacity {
                self.emit_continuation()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            }
            let take = (capacity - self.chunk.len()).min(remaining.len());
            self.chunk.extend_from_slice(&remaining[..take]);
            self.payload_bytes += take as u64;
            remaining = &remaining[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

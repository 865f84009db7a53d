//! Append-only event store: a binary protobuf log.
//!
//! Storage format: length-prefixed protobuf frames.
//!   [4-byte LE length][protobuf bytes][4-byte LE length][protobuf bytes]...
//!
//! Rules:
//!   - Strict append only: no mutation, no deletion, no reordering
//!   - fsync after every write
//!   - Sequence strictly increasing from 1 (validated on append and load)

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use prost::Message;

use crate::error::{Result, RuntimeError};
use crate::proto_types::ProtoEventEnvelope;

/// Largest frame accepted on load.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Append-only event log backed by a binary file.
#[derive(Debug)]
pub struct EventStore {
    path: PathBuf,
    last_sequence: u64,
}

impl EventStore {
    /// Open or create an event log at the given path. Existing frames are
    /// read and validated to find the last sequence number.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let last_sequence = if path.exists() {
            let events = Self::read_all_from_file(path)?;
            events.last().map(|e| e.sequence).unwrap_or(0)
        } else {
            0
        };

        tracing::debug!(path = %path.display(), last_sequence, "event store opened");
        Ok(Self {
            path: path.to_path_buf(),
            last_sequence,
        })
    }

    /// Append a single event. Validates strict sequence ordering, writes a
    /// length-prefixed frame and fsyncs.
    pub fn append_event(&mut self, event: &ProtoEventEnvelope) -> Result<()> {
        let expected = self.last_sequence + 1;
        if event.sequence != expected {
            return Err(RuntimeError::Sequence {
                expected,
                got: event.sequence,
            });
        }

        let buf = event.encode_to_vec();
        if buf.is_empty() || buf.len() > MAX_FRAME_LEN {
            return Err(RuntimeError::CorruptLog(format!(
                "event {} encodes to {} bytes",
                event.sequence,
                buf.len()
            )));
        }
        let len = buf.len() as u32;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        {
            let mut writer = BufWriter::new(&mut file);
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&buf)?;
            writer.flush()?;
        }
        file.sync_all()?;

        self.last_sequence = event.sequence;
        Ok(())
    }

    /// Load all events from the log in sequence order.
    pub fn load_all_events(&self) -> Result<Vec<ProtoEventEnvelope>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Self::read_all_from_file(&self.path)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all frames from a file, validating frame integrity and the
    /// sequence numbering.
    fn read_all_from_file(path: &Path) -> Result<Vec<ProtoEventEnvelope>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut events: Vec<ProtoEventEnvelope> = Vec::new();
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len == 0 || len > MAX_FRAME_LEN {
                return Err(RuntimeError::CorruptLog(format!(
                    "invalid frame length {} after event {}",
                    len,
                    events.len()
                )));
            }

            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame).map_err(|e| {
                RuntimeError::CorruptLog(format!(
                    "truncated frame after event {}: {}",
                    events.len(),
                    e
                ))
            })?;

            let event = ProtoEventEnvelope::decode(frame.as_slice())?;
            let expected = events.len() as u64 + 1;
            if event.sequence != expected {
                return Err(RuntimeError::Sequence {
                    expected,
                    got: event.sequence,
                });
            }
            events.push(event);
        }

        Ok(events)
    }
}

//! Framed append-only journal.
//!
//! Frame layout:
//!
//! ```text
//! magic (4) | version (2) | body length (4) | body (n) | crc32 (4)
//! ```
//!
//! The CRC covers everything before it. On open the journal walks frames
//! from offset zero; the first frame that is short or fails its checksum
//! marks a torn tail, which is truncated away.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Magic bytes opening every frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"TSJL";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4).
pub const FRAME_HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalFrame {
    /// Offset of the frame header.
    pub offset: u64,
    /// Opaque body bytes.
    pub body: Vec<u8>,
}

/// Append-only journal over a [`StorageBackend`].
pub struct Journal {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl Journal {
    /// Opens a journal, truncating any torn tail left by a crash.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] when the very first frame has the
    /// wrong magic, i.e. the backend does not hold a journal at all.
    pub fn open(mut backend: Box<dyn StorageBackend>, sync_on_write: bool) -> StorageResult<Self> {
        let bytes = backend.read_all()?;
        let (frames, valid_len) = scan(&bytes);

        if frames.is_empty()
            && bytes.len() >= JOURNAL_MAGIC.len()
            && bytes[..JOURNAL_MAGIC.len()] != JOURNAL_MAGIC
        {
            return Err(StorageError::Corrupted {
                offset: 0,
                reason: "not a tillsync journal".into(),
            });
        }

        if (valid_len as usize) < bytes.len() {
            warn!(
                valid_len,
                dropped = bytes.len() as u64 - valid_len,
                "truncating torn journal tail"
            );
            backend.truncate(valid_len)?;
            backend.sync()?;
        }
        debug!(frames = frames.len(), "journal opened");

        Ok(Self {
            backend: Mutex::new(backend),
            sync_on_write,
        })
    }

    /// Appends one body and returns the frame offset.
    pub fn append(&self, body: &[u8]) -> StorageResult<u64> {
        let frame = encode_frame(body)?;
        let mut backend = self.backend.lock();
        let offset = backend.append(&frame)?;
        self.persist(backend.as_mut())?;
        Ok(offset)
    }

    /// Appends several bodies with a single backend write.
    ///
    /// Either every frame lands or the trailing ones are cut as a torn tail
    /// on the next open; frames are never reordered.
    pub fn append_all(&self, bodies: &[Vec<u8>]) -> StorageResult<u64> {
        let mut data = Vec::new();
        for body in bodies {
            data.extend_from_slice(&encode_frame(body)?);
        }
        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        self.persist(backend.as_mut())?;
        Ok(offset)
    }

    /// Returns every valid frame in write order.
    pub fn replay(&self) -> StorageResult<Vec<JournalFrame>> {
        let bytes = self.backend.lock().read_all()?;
        Ok(scan(&bytes).0)
    }

    /// Replaces the journal content with `bodies`.
    ///
    /// Used by compaction to swap a long history for a snapshot.
    pub fn rewrite(&self, bodies: &[Vec<u8>]) -> StorageResult<()> {
        let mut data = Vec::new();
        for body in bodies {
            data.extend_from_slice(&encode_frame(body)?);
        }
        let mut backend = self.backend.lock();
        backend.truncate(0)?;
        backend.append(&data)?;
        backend.sync()?;
        Ok(())
    }

    /// Returns the journal size in bytes.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.lock().size()
    }

    /// Forces all frames to stable storage.
    pub fn sync(&self) -> StorageResult<()> {
        self.backend.lock().sync()
    }

    fn persist(&self, backend: &mut dyn StorageBackend) -> StorageResult<()> {
        if self.sync_on_write {
            backend.sync()
        } else {
            backend.flush()
        }
    }
}

/// Decodes the valid frames of a raw journal image without touching it.
///
/// Used by read-only tooling that must not truncate a journal another
/// process is appending to.
#[must_use]
pub fn read_frames(bytes: &[u8]) -> Vec<JournalFrame> {
    scan(bytes).0
}

fn encode_frame(body: &[u8]) -> StorageResult<Vec<u8>> {
    let len = u32::try_from(body.len()).map_err(|_| StorageError::EntryTooLarge(body.len()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + CRC_SIZE);
    frame.extend_from_slice(&JOURNAL_MAGIC);
    frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(body);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Walks frames, returning the valid ones and the length they cover.
fn scan(bytes: &[u8]) -> (Vec<JournalFrame>, u64) {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while pos + FRAME_HEADER_SIZE <= bytes.len() {
        let header = &bytes[pos..pos + FRAME_HEADER_SIZE];
        if header[..4] != JOURNAL_MAGIC {
            break;
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != JOURNAL_VERSION {
            break;
        }
        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let body_end = pos + FRAME_HEADER_SIZE + len;
        let frame_end = body_end + CRC_SIZE;
        if frame_end > bytes.len() {
            break;
        }

        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        if crc32fast::hash(&bytes[pos..body_end]) != stored {
            break;
        }

        frames.push(JournalFrame {
            offset: pos as u64,
            body: bytes[pos + FRAME_HEADER_SIZE..body_end].to_vec(),
        });
        pos = frame_end;
    }

    (frames, pos as u64)
}

//! # tillsync storage
//!
//! Durable byte storage for the tillsync replication engine.
//!
//! Two layers live here:
//!
//! - [`StorageBackend`] implementations are **opaque byte stores**
//!   (read, append, flush, truncate). They know nothing about sync rows.
//! - [`Journal`] frames opaque entry bodies on top of a backend with a
//!   magic, version, length and CRC32, and recovers cleanly from a torn
//!   tail after a crash.
//!
//! The engine serializes its rows into journal bodies; this crate never
//! interprets them.
//!
//! ## Example
//!
//! ```rust
//! use tillsync_storage::{InMemoryBackend, Journal};
//!
//! let journal = Journal::open(Box::new(InMemoryBackend::new()), false).unwrap();
//! journal.append(b"queue-item-1").unwrap();
//! journal.append(b"queue-item-2").unwrap();
//!
//! let bodies: Vec<Vec<u8>> = journal.replay().unwrap().into_iter().map(|f| f.body).collect();
//! assert_eq!(bodies, vec![b"queue-item-1".to_vec(), b"queue-item-2".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{
    read_frames, Journal, JournalFrame, FRAME_HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_VERSION,
};
pub use memory::InMemoryBackend;

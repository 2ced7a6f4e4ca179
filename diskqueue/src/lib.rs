//! A durable FIFO of opaque byte records, backed by a directory of segment
//! files. Records are appended with [`DiskQueue::put`], handed out one at a
//! time through a [`QueueReader`] and committed with [`QueueReader::advance`].
//! Records that were handed out but never advanced past are redelivered the
//! next time the queue is opened, so a consumer that batches records can
//! treat a batch as all-or-nothing: advance after the whole batch is safe,
//! crash before it and the batch comes back.
//!
//! On disk a segment is a concatenation of `[u32 big-endian length][payload]`
//! frames. A small metadata file remembers the committed read cursor, the
//! write cursor and the number of unconfirmed records, guarded by a seahash
//! checksum. A corrupt or missing metadata file triggers a conservative scan
//! of the segment files which redelivers everything still present.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

mod meta;
mod queue;

pub use queue::{DiskQueue, QueueReader};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Io error {0}")]
    Io(#[from] io::Error),
    #[error("Queue is closed")]
    Closed,
    #[error("Invalid message size {size}, limits are [{min}, {max}]")]
    InvalidMsgSize { size: usize, min: u32, max: u32 },
}

/// Tunables for one queue instance. `name` prefixes every file the queue
/// creates inside `directory`.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub directory: PathBuf,
    /// Segment roll-over threshold. A put that would push the write offset
    /// past this cap goes into a fresh segment instead.
    pub max_bytes_per_segment: u64,
    pub min_msg_size: u32,
    pub max_msg_size: u32,
    /// Number of writes after which the segment is fsynced and the metadata
    /// persisted.
    pub sync_every: u64,
    /// Upper bound on how long a dirty write can sit without an fsync.
    pub sync_timeout: Duration,
    /// When false, fsync syscalls are skipped; metadata is still persisted
    /// on the same cadence.
    pub enable_fsync: bool,
}

impl QueueConfig {
    pub fn new<N: Into<String>, D: Into<PathBuf>>(name: N, directory: D) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            directory: directory.into(),
            max_bytes_per_segment: 128 * 1024 * 1024,
            min_msg_size: 1,
            max_msg_size: 10 * 1024 * 1024,
            sync_every: 500,
            sync_timeout: Duration::from_secs(2),
            enable_fsync: true,
        }
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, info, warn};

use crate::meta::Metadata;
use crate::{Error, QueueConfig};

/// Position just past a record that was handed out, plus the running count of
/// records handed out this session. Advancing to a cursor commits every
/// record delivered up to and including it.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    file_num: u64,
    pos: u64,
    seq: u64,
}

struct Inner {
    read_file_num: u64,
    read_pos: u64,
    write_file_num: u64,
    write_pos: u64,
    depth: u64,
    /// Records committed via advance this session.
    committed_seq: u64,
    write_file: Option<File>,
    dirty_writes: u64,
    dirty: bool,
}

struct Shared {
    config: QueueConfig,
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl Shared {
    fn segment_path(&self, num: u64) -> PathBuf {
        segment_path(&self.config, num)
    }

    fn meta_path(&self) -> PathBuf {
        meta_path(&self.config)
    }

    fn persist_meta(&self, inner: &Inner) -> io::Result<()> {
        let meta = Metadata {
            depth: inner.depth,
            read_file_num: inner.read_file_num,
            read_pos: inner.read_pos,
            write_file_num: inner.write_file_num,
            write_pos: inner.write_pos,
        };
        meta.store(&self.meta_path())
    }

    /// Flush the active segment (fsync when enabled) and persist metadata.
    fn sync(&self, inner: &mut Inner) -> io::Result<()> {
        if self.config.enable_fsync {
            if let Some(file) = &inner.write_file {
                file.sync_data()?;
            }
        }
        self.persist_meta(inner)?;
        inner.dirty_writes = 0;
        inner.dirty = false;
        Ok(())
    }
}

fn segment_path(config: &QueueConfig, num: u64) -> PathBuf {
    config.directory.join(format!("{}.diskqueue.{:010}.dat", config.name, num))
}

fn meta_path(config: &QueueConfig) -> PathBuf {
    config.directory.join(format!("{}.diskqueue.meta.dat", config.name))
}

/// Durable FIFO over a directory of segment files. See the crate docs for the
/// delivery and commit contract.
pub struct DiskQueue {
    shared: Arc<Shared>,
    reader: Mutex<Option<QueueReader>>,
    notify_tx: flume::Sender<()>,
    exit_tx: Mutex<Option<flume::Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DiskQueue {
    /// Open or create a queue in `config.directory`, recovering the cursor
    /// from the metadata file or, failing that, from the segments themselves.
    pub fn open(config: QueueConfig) -> Result<DiskQueue, Error> {
        fs::create_dir_all(&config.directory)?;

        let meta = match Metadata::load(&meta_path(&config))? {
            Some(m) => validate_meta(&config, m)?,
            None => scan_segments(&config)?,
        };

        info!(
            "Disk queue {} opened, depth = {}, read = ({}, {}), write = ({}, {})",
            config.name, meta.depth, meta.read_file_num, meta.read_pos, meta.write_file_num, meta.write_pos
        );

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                read_file_num: meta.read_file_num,
                read_pos: meta.read_pos,
                write_file_num: meta.write_file_num,
                write_pos: meta.write_pos,
                depth: meta.depth,
                committed_seq: 0,
                write_file: None,
                dirty_writes: 0,
                dirty: false,
            }),
            config,
            closed: AtomicBool::new(false),
        });

        let (notify_tx, notify_rx) = flume::bounded(1);
        let (exit_tx, exit_rx) = flume::bounded::<()>(0);
        // Rendezvous channel: at most one record is in flight between the
        // reader thread and the consumer.
        let (read_tx, read_rx) = flume::bounded(0);

        let reader = ReadLoop {
            shared: shared.clone(),
            read_tx,
            notify_rx,
            exit_rx: exit_rx.clone(),
            file: None,
            file_num: meta.read_file_num,
            pos: meta.read_pos,
            seq: 0,
        };
        let read_handle = thread::Builder::new()
            .name(format!("{}-diskqueue-reader", shared.config.name))
            .spawn(move || reader.run())?;

        let sync_shared = shared.clone();
        let sync_handle = thread::Builder::new()
            .name(format!("{}-diskqueue-sync", shared.config.name))
            .spawn(move || run_sync(sync_shared, exit_rx))?;

        let handle = QueueReader { shared: shared.clone(), rx: read_rx, last: None };

        Ok(DiskQueue {
            shared,
            reader: Mutex::new(Some(handle)),
            notify_tx,
            exit_tx: Mutex::new(Some(exit_tx)),
            threads: Mutex::new(vec![read_handle, sync_handle]),
        })
    }

    /// Append one record. Returns once the record is written to the active
    /// segment; fsync durability follows the configured cadence.
    pub fn put(&self, data: &[u8]) -> Result<(), Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let config = &self.shared.config;
        let size = data.len();
        if size < config.min_msg_size as usize || size > config.max_msg_size as usize {
            return Err(Error::InvalidMsgSize { size, min: config.min_msg_size, max: config.max_msg_size });
        }

        let frame_len = 4 + size as u64;
        let mut inner = self.shared.inner.lock().unwrap();

        // Roll to a fresh segment when this frame would push the offset past
        // the cap. Metadata is persisted immediately so a crash cannot leave
        // an unrecorded segment behind.
        if inner.write_pos > 0 && inner.write_pos + frame_len > config.max_bytes_per_segment {
            self.shared.sync(&mut inner)?;
            inner.write_file = None;
            inner.write_file_num += 1;
            inner.write_pos = 0;
            self.shared.persist_meta(&inner)?;
            debug!("Disk queue {} rolled to segment {}", config.name, inner.write_file_num);
        }

        if inner.write_file.is_none() {
            let path = self.shared.segment_path(inner.write_file_num);
            let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
            if inner.write_pos > 0 {
                file.seek(SeekFrom::Start(inner.write_pos))?;
            }
            inner.write_file = Some(file);
        }

        let mut frame = BytesMut::with_capacity(4 + size);
        frame.put_u32(size as u32);
        frame.put_slice(data);
        inner.write_file.as_mut().unwrap().write_all(&frame)?;

        inner.write_pos += frame_len;
        inner.depth += 1;
        inner.dirty_writes += 1;
        inner.dirty = true;

        if inner.dirty_writes >= config.sync_every {
            self.shared.sync(&mut inner)?;
        }
        drop(inner);

        // Wake the reader; a full notify buffer already means a wakeup is due.
        let _ = self.notify_tx.try_send(());
        Ok(())
    }

    /// Number of records written but not yet advanced past.
    pub fn depth(&self) -> u64 {
        self.shared.inner.lock().unwrap().depth
    }

    /// Hand out the single reader. Returns `None` on every call after the
    /// first: the delivery channel has exactly one consumer.
    pub fn reader(&self) -> Option<QueueReader> {
        self.reader.lock().unwrap().take()
    }

    /// Stop the background threads, flush pending writes and persist the
    /// cursor. Idempotent.
    pub fn close(&self) -> Result<(), Error> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the exit sender releases both background threads.
        self.exit_tx.lock().unwrap().take();
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        let mut inner = self.shared.inner.lock().unwrap();
        self.shared.sync(&mut inner)?;
        inner.write_file = None;
        info!("Disk queue {} closed, depth = {}", self.shared.config.name, inner.depth);
        Ok(())
    }
}

impl Drop for DiskQueue {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                error!("Failed to close disk queue on drop. Error = {:?}", e);
            }
        }
    }
}

/// Exclusive consumer handle. Receives records in queue order and commits
/// them in bulk with [`QueueReader::advance`].
pub struct QueueReader {
    shared: Arc<Shared>,
    rx: flume::Receiver<(Bytes, Cursor)>,
    last: Option<Cursor>,
}

impl QueueReader {
    /// Wait for the next record. Errors once the queue is closed and no
    /// record is being offered.
    pub async fn recv(&mut self) -> Result<Bytes, Error> {
        match self.rx.recv_async().await {
            Ok((payload, cursor)) => {
                self.last = Some(cursor);
                Ok(payload)
            }
            Err(_) => Err(Error::Closed),
        }
    }

    /// Blocking variant of [`QueueReader::recv`].
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok((payload, cursor)) => {
                self.last = Some(cursor);
                Ok(Some(payload))
            }
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    /// Commit the cursor past every record received so far, persist the
    /// metadata and delete fully-consumed segments. A no-op when nothing new
    /// was received since the last call.
    pub fn advance(&mut self) {
        let cursor = match self.last {
            Some(c) => c,
            None => return,
        };

        let mut inner = self.shared.inner.lock().unwrap();
        if cursor.seq <= inner.committed_seq {
            return;
        }

        let newly_committed = cursor.seq - inner.committed_seq;
        inner.committed_seq = cursor.seq;
        inner.depth = inner.depth.saturating_sub(newly_committed);

        let old_file_num = inner.read_file_num;
        inner.read_file_num = cursor.file_num;
        inner.read_pos = cursor.pos;

        // The read cursor catching the write cursor with leftover depth means
        // corrupt records were skipped somewhere behind us.
        if inner.read_file_num == inner.write_file_num
            && inner.read_pos == inner.write_pos
            && inner.depth != 0
        {
            warn!(
                "Disk queue {} reached its tail with depth {}, resetting",
                self.shared.config.name, inner.depth
            );
            inner.depth = 0;
        }

        if let Err(e) = self.shared.persist_meta(&inner) {
            error!("Failed to persist disk queue metadata. Error = {:?}", e);
        }
        let read_file_num = inner.read_file_num;
        drop(inner);

        for num in old_file_num..read_file_num {
            let path = self.shared.segment_path(num);
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed consumed segment {:?}", path),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => error!("Failed to remove consumed segment {:?}. Error = {:?}", path, e),
            }
        }
    }
}

/// The reader thread: follows the write cursor through the segments and
/// offers one record at a time to the consumer.
struct ReadLoop {
    shared: Arc<Shared>,
    read_tx: flume::Sender<(Bytes, Cursor)>,
    notify_rx: flume::Receiver<()>,
    exit_rx: flume::Receiver<()>,
    file: Option<BufReader<File>>,
    file_num: u64,
    pos: u64,
    seq: u64,
}

enum ReadEvent {
    Sent,
    Exit,
}

impl ReadLoop {
    fn run(mut self) {
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                break;
            }

            let (write_file_num, write_pos) = {
                let inner = self.shared.inner.lock().unwrap();
                (inner.write_file_num, inner.write_pos)
            };

            let has_data = self.file_num < write_file_num
                || (self.file_num == write_file_num && self.pos < write_pos);
            if !has_data {
                // Park until a put lands or the queue closes.
                let exit = flume::Selector::new()
                    .recv(&self.notify_rx, |_| false)
                    .recv(&self.exit_rx, |r| r.is_err())
                    .wait();
                if exit {
                    break;
                }
                continue;
            }

            match self.read_one(write_file_num) {
                Ok(Some((payload, cursor))) => {
                    let event = flume::Selector::new()
                        .send(&self.read_tx, (payload, cursor), |r| match r {
                            Ok(()) => ReadEvent::Sent,
                            Err(_) => ReadEvent::Exit,
                        })
                        .recv(&self.exit_rx, |_| ReadEvent::Exit)
                        .wait();
                    match event {
                        ReadEvent::Sent => {
                            self.file_num = cursor.file_num;
                            self.pos = cursor.pos;
                            self.seq = cursor.seq;
                        }
                        // The record stays uncommitted and is redelivered on
                        // the next open.
                        ReadEvent::Exit => break,
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Disk queue {} failed reading segment {} at {}. Error = {:?}",
                        self.shared.config.name, self.file_num, self.pos, e
                    );
                    self.skip_segment(write_file_num, write_pos);
                }
            }
        }
    }

    /// Read the frame at the current position. `Ok(None)` means the cursor
    /// moved to the next segment and there is nothing to hand out yet.
    fn read_one(&mut self, write_file_num: u64) -> io::Result<Option<(Bytes, Cursor)>> {
        if self.file.is_none() {
            let path = segment_path(&self.shared.config, self.file_num);
            let mut file = match File::open(&path) {
                Ok(f) => f,
                Err(ref e) if e.kind() == io::ErrorKind::NotFound && self.file_num < write_file_num => {
                    // Gap in the segment numbering; move along.
                    self.file_num += 1;
                    self.pos = 0;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            if self.pos > 0 {
                file.seek(SeekFrom::Start(self.pos))?;
            }
            self.file = Some(BufReader::new(file));
        }

        let reader = self.file.as_mut().unwrap();
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof && self.file_num < write_file_num => {
                // Clean end of a sealed segment.
                self.file = None;
                self.file_num += 1;
                self.pos = 0;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf);
        let config = &self.shared.config;
        if len < config.min_msg_size || len > config.max_msg_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} outside [{}, {}]", len, config.min_msg_size, config.max_msg_size),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;

        let cursor = Cursor {
            file_num: self.file_num,
            pos: self.pos + 4 + len as u64,
            seq: self.seq + 1,
        };
        Ok(Some((Bytes::from(payload), cursor)))
    }

    /// Corruption recovery: jump to the next segment boundary, or to the
    /// write cursor when the active segment itself has a bad tail.
    fn skip_segment(&mut self, write_file_num: u64, write_pos: u64) {
        self.file = None;
        if self.file_num < write_file_num {
            warn!(
                "Disk queue {} skipping rest of corrupt segment {}",
                self.shared.config.name, self.file_num
            );
            self.file_num += 1;
            self.pos = 0;
        } else {
            warn!(
                "Disk queue {} skipping corrupt tail of segment {} ({} -> {})",
                self.shared.config.name, self.file_num, self.pos, write_pos
            );
            self.pos = write_pos;
        }
    }
}

fn run_sync(shared: Arc<Shared>, exit_rx: flume::Receiver<()>) {
    let timeout = shared.config.sync_timeout;
    loop {
        match exit_rx.recv_timeout(timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            Err(flume::RecvTimeoutError::Timeout) => {
                let mut inner = shared.inner.lock().unwrap();
                if inner.dirty {
                    if let Err(e) = shared.sync(&mut inner) {
                        error!("Periodic disk queue sync failed. Error = {:?}", e);
                    }
                }
            }
        }
    }
}

/// Reconcile a loaded metadata record against the files actually on disk.
fn validate_meta(config: &QueueConfig, mut meta: Metadata) -> Result<Metadata, Error> {
    let write_path = segment_path(config, meta.write_file_num);
    match fs::metadata(&write_path) {
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
            if meta.write_pos > 0 {
                warn!("Write segment {:?} missing, rescanning directory", write_path);
                return scan_segments(config);
            }
        }
        Err(e) => return Err(e.into()),
        Ok(md) => {
            let size = md.len();
            if size < meta.write_pos {
                warn!(
                    "Write segment {:?} shorter than recorded offset ({} < {}), rescanning",
                    write_path, size, meta.write_pos
                );
                return scan_segments(config);
            }
            if size > meta.write_pos {
                // Records were written after the last metadata sync; extend
                // the cursor over every frame that survived.
                let (end, extra) = scan_segment(&write_path, config, meta.write_pos)?;
                if extra > 0 {
                    info!("Recovered {} records written after the last sync", extra);
                }
                meta.write_pos = end;
                meta.depth += extra;
            }
        }
    }

    // Skip the read cursor forward over missing or exhausted segments.
    while meta.read_file_num < meta.write_file_num {
        let read_path = segment_path(config, meta.read_file_num);
        let size = match fs::metadata(&read_path) {
            Ok(md) => md.len(),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if meta.read_pos < size {
            break;
        }
        meta.read_file_num += 1;
        meta.read_pos = 0;
    }
    if meta.read_file_num == meta.write_file_num && meta.read_pos > meta.write_pos {
        warn!("Read offset past write offset, clamping");
        meta.read_pos = meta.write_pos;
        meta.depth = 0;
    }

    Ok(meta)
}

/// Rebuild the cursor by scanning every segment present. Everything readable
/// is redelivered.
fn scan_segments(config: &QueueConfig) -> Result<Metadata, Error> {
    let prefix = format!("{}.diskqueue.", config.name);
    let mut nums: Vec<u64> = Vec::new();
    for entry in fs::read_dir(&config.directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let num = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".dat"))
            .and_then(|digits| digits.parse::<u64>().ok());
        if let Some(num) = num {
            nums.push(num);
        }
    }
    nums.sort_unstable();

    let mut meta = Metadata { depth: 0, read_file_num: 0, read_pos: 0, write_file_num: 0, write_pos: 0 };
    let last = match nums.last() {
        Some(&n) => n,
        None => return Ok(meta),
    };

    meta.read_file_num = nums[0];
    meta.write_file_num = last;
    for &num in &nums {
        let path = segment_path(config, num);
        let (end, count) = scan_segment(&path, config, 0)?;
        meta.depth += count;
        if num == last {
            meta.write_pos = end;
        }
    }

    warn!(
        "Disk queue {} recovered by scan: {} records across {} segments",
        config.name, meta.depth, nums.len()
    );
    Ok(meta)
}

/// Walk frames from `start`, returning the offset just past the last valid
/// frame and how many frames were seen.
fn scan_segment(path: &std::path::Path, config: &QueueConfig, start: u64) -> io::Result<(u64, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    if start > 0 {
        file.seek(SeekFrom::Start(start))?;
    }

    let mut pos = start;
    let mut count = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf);
        if len < config.min_msg_size || len > config.max_msg_size {
            warn!("Scan of {:?} stopped at invalid frame length {} (offset {})", path, len, pos);
            break;
        }
        let mut payload = vec![0u8; len as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("Scan of {:?} stopped at truncated frame (offset {})", path, pos);
                break;
            }
            Err(e) => return Err(e),
        }
        pos += 4 + len as u64;
        count += 1;
    }
    Ok((pos, count))
}

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use diskqueue::{DiskQueue, Error, QueueConfig};
use rand::{distributions::Alphanumeric, Rng};
use tempdir::TempDir;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn config(dir: &Path) -> QueueConfig {
    QueueConfig::new("test", dir)
}

fn record(len: usize) -> Vec<u8> {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).collect()
}

#[test]
fn put_read_advance() {
    let dir = TempDir::new("dq").unwrap();
    let queue = DiskQueue::open(config(dir.path())).unwrap();
    let mut reader = queue.reader().unwrap();

    let records: Vec<Vec<u8>> = (0..3).map(|_| record(32)).collect();
    for r in &records {
        queue.put(r).unwrap();
    }
    assert_eq!(3, queue.depth());

    for expected in &records {
        let got = reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        assert_eq!(&expected[..], &got[..]);
    }
    reader.advance();
    assert_eq!(0, queue.depth());
    queue.close().unwrap();
}

#[test]
fn advance_without_reads_is_noop() {
    let dir = TempDir::new("dq").unwrap();
    let queue = DiskQueue::open(config(dir.path())).unwrap();
    let mut reader = queue.reader().unwrap();

    reader.advance();
    queue.put(&record(16)).unwrap();
    reader.advance();
    assert_eq!(1, queue.depth());
    queue.close().unwrap();
}

#[test]
fn unadvanced_records_are_redelivered() {
    let dir = TempDir::new("dq").unwrap();
    let records: Vec<Vec<u8>> = (0..2).map(|_| record(64)).collect();

    {
        let queue = DiskQueue::open(config(dir.path())).unwrap();
        let mut reader = queue.reader().unwrap();
        for r in &records {
            queue.put(r).unwrap();
        }
        for _ in 0..2 {
            reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        }
        // No advance: both reads stay uncommitted.
        queue.close().unwrap();
    }

    let queue = DiskQueue::open(config(dir.path())).unwrap();
    let mut reader = queue.reader().unwrap();
    assert_eq!(2, queue.depth());
    for expected in &records {
        let got = reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        assert_eq!(&expected[..], &got[..]);
    }
    queue.close().unwrap();
}

#[test]
fn advanced_records_stay_consumed_across_restart() {
    let dir = TempDir::new("dq").unwrap();

    {
        let queue = DiskQueue::open(config(dir.path())).unwrap();
        let mut reader = queue.reader().unwrap();
        queue.put(&record(16)).unwrap();
        queue.put(&record(16)).unwrap();
        reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        reader.advance();
        queue.close().unwrap();
    }

    let queue = DiskQueue::open(config(dir.path())).unwrap();
    let mut reader = queue.reader().unwrap();
    assert_eq!(0, queue.depth());

    let fresh = record(24);
    queue.put(&fresh).unwrap();
    let got = reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(&fresh[..], &got[..]);
    assert!(reader.recv_timeout(Duration::from_millis(100)).unwrap().is_none());
    queue.close().unwrap();
}

#[test]
fn message_size_limits() {
    let dir = TempDir::new("dq").unwrap();
    let mut cfg = config(dir.path());
    cfg.max_msg_size = 64;
    let queue = DiskQueue::open(cfg).unwrap();

    queue.put(&record(64)).unwrap();
    match queue.put(&record(65)) {
        Err(Error::InvalidMsgSize { size, min, max }) => {
            assert_eq!(65, size);
            assert_eq!(1, min);
            assert_eq!(64, max);
        }
        other => panic!("expected InvalidMsgSize, got {:?}", other.map(|_| ())),
    }
    assert!(queue.put(b"").is_err());
    queue.close().unwrap();
}

#[test]
fn put_after_close_fails() {
    let dir = TempDir::new("dq").unwrap();
    let queue = DiskQueue::open(config(dir.path())).unwrap();
    queue.close().unwrap();
    match queue.put(&record(8)) {
        Err(Error::Closed) => {}
        other => panic!("expected Closed, got {:?}", other.map(|_| ())),
    }
    // Close is idempotent.
    queue.close().unwrap();
}

#[test]
fn segments_rotate_and_consumed_ones_are_deleted() {
    let dir = TempDir::new("dq").unwrap();
    let mut cfg = config(dir.path());
    cfg.max_bytes_per_segment = 64;
    let queue = DiskQueue::open(cfg).unwrap();
    let mut reader = queue.reader().unwrap();

    // 3 frames of 36 bytes each against a 64 byte cap: one record per segment
    // after the first.
    for _ in 0..3 {
        queue.put(&record(32)).unwrap();
    }
    assert!(segment_count(dir.path()) >= 2);

    for _ in 0..3 {
        reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    }
    reader.advance();
    assert_eq!(1, segment_count(dir.path()));
    queue.close().unwrap();

    let queue = DiskQueue::open(config(dir.path())).unwrap();
    let mut reader = queue.reader().unwrap();
    assert!(reader.recv_timeout(Duration::from_millis(100)).unwrap().is_none());
    queue.close().unwrap();
}

#[test]
fn corrupt_frame_skips_to_next_segment() {
    let dir = TempDir::new("dq").unwrap();
    let mut cfg = config(dir.path());
    cfg.max_bytes_per_segment = 64;

    let survivor = record(32);
    {
        let queue = DiskQueue::open(cfg.clone()).unwrap();
        queue.put(&record(32)).unwrap();
        queue.put(&survivor).unwrap();
        queue.close().unwrap();
    }
    assert_eq!(2, segment_count(dir.path()));

    // Stamp an absurd length over the first segment's frame header.
    let first = dir.path().join("test.diskqueue.0000000000.dat");
    let mut file = OpenOptions::new().write(true).open(&first).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&u32::to_be_bytes(0xffff_ffff)).unwrap();
    drop(file);

    let queue = DiskQueue::open(cfg).unwrap();
    let mut reader = queue.reader().unwrap();
    let got = reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(&survivor[..], &got[..]);
    queue.close().unwrap();
}

#[test]
fn corrupt_metadata_falls_back_to_scan() {
    let dir = TempDir::new("dq").unwrap();
    let records: Vec<Vec<u8>> = (0..3).map(|_| record(20)).collect();

    {
        let queue = DiskQueue::open(config(dir.path())).unwrap();
        let mut reader = queue.reader().unwrap();
        for r in &records {
            queue.put(r).unwrap();
        }
        reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        reader.advance();
        queue.close().unwrap();
    }

    let meta = dir.path().join("test.diskqueue.meta.dat");
    let mut raw = std::fs::read(&meta).unwrap();
    raw[10] ^= 0xff;
    std::fs::write(&meta, &raw).unwrap();

    // The scan cannot trust the commit cursor, so everything still on disk
    // comes back.
    let queue = DiskQueue::open(config(dir.path())).unwrap();
    let mut reader = queue.reader().unwrap();
    assert_eq!(3, queue.depth());
    for expected in &records {
        let got = reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        assert_eq!(&expected[..], &got[..]);
    }
    queue.close().unwrap();
}

#[test]
fn records_written_after_last_meta_sync_are_recovered() {
    let dir = TempDir::new("dq").unwrap();

    {
        let queue = DiskQueue::open(config(dir.path())).unwrap();
        queue.put(&record(16)).unwrap();
        queue.close().unwrap();
    }

    // Simulate a crash after a frame hit the segment but before the metadata
    // caught up: append a frame behind the recorded write offset.
    let tail = record(16);
    let segment = dir.path().join("test.diskqueue.0000000000.dat");
    let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
    file.write_all(&u32::to_be_bytes(tail.len() as u32)).unwrap();
    file.write_all(&tail).unwrap();
    drop(file);

    let queue = DiskQueue::open(config(dir.path())).unwrap();
    let mut reader = queue.reader().unwrap();
    assert_eq!(2, queue.depth());
    reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    let got = reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(&tail[..], &got[..]);
    queue.close().unwrap();
}

#[test]
fn concurrent_puts_preserve_every_record() {
    let dir = TempDir::new("dq").unwrap();
    let queue = Arc::new(DiskQueue::open(config(dir.path())).unwrap());
    let mut reader = queue.reader().unwrap();

    let mut handles = Vec::new();
    for t in 0..4u8 {
        let queue = queue.clone();
        handles.push(thread::spawn(move || {
            for i in 0..25u8 {
                queue.put(&[t, i]).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut got = Vec::new();
    for _ in 0..100 {
        got.push(reader.recv_timeout(RECV_TIMEOUT).unwrap().unwrap());
    }
    reader.advance();
    got.sort();
    got.dedup();
    assert_eq!(100, got.len());
    queue.close().unwrap();
}

#[test]
fn single_reader_handle() {
    let dir = TempDir::new("dq").unwrap();
    let queue = DiskQueue::open(config(dir.path())).unwrap();
    assert!(queue.reader().is_some());
    assert!(queue.reader().is_none());
    queue.close().unwrap();
}

fn segment_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy().into_owned();
            name.ends_with(".dat") && !name.contains("meta")
        })
        .count()
}

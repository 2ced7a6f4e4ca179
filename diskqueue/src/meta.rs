use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use log::warn;

/// Cursor state persisted between runs. The first 8 bytes on disk are a
/// seahash of the remaining payload; a mismatch means the file was torn
/// mid-write and the caller falls back to scanning the segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Metadata {
    pub depth: u64,
    pub read_file_num: u64,
    pub read_pos: u64,
    pub write_file_num: u64,
    pub write_pos: u64,
}

const PAYLOAD_LEN: usize = 5 * 8;
const FILE_LEN: usize = 8 + PAYLOAD_LEN;

impl Metadata {
    pub fn load(path: &Path) -> io::Result<Option<Metadata>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut buf = Vec::with_capacity(FILE_LEN);
        file.read_to_end(&mut buf)?;
        if buf.len() != FILE_LEN {
            warn!("Metadata file {:?} has length {}, expected {}", path, buf.len(), FILE_LEN);
            return Ok(None);
        }

        let mut cursor = &buf[..];
        let checksum = cursor.get_u64();
        if checksum != seahash::hash(&buf[8..]) {
            warn!("Metadata file {:?} failed checksum", path);
            return Ok(None);
        }

        Ok(Some(Metadata {
            depth: cursor.get_u64(),
            read_file_num: cursor.get_u64(),
            read_pos: cursor.get_u64(),
            write_file_num: cursor.get_u64(),
            write_pos: cursor.get_u64(),
        }))
    }

    /// Write to a temporary file and rename over the old one so a crash never
    /// leaves a half-written metadata file in place.
    pub fn store(&self, path: &Path) -> io::Result<()> {
        let mut payload = BytesMut::with_capacity(PAYLOAD_LEN);
        payload.put_u64(self.depth);
        payload.put_u64(self.read_file_num);
        payload.put_u64(self.read_pos);
        payload.put_u64(self.write_file_num);
        payload.put_u64(self.write_pos);

        let mut buf = BytesMut::with_capacity(FILE_LEN);
        buf.put_u64(seahash::hash(&payload));
        buf.extend_from_slice(&payload);

        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(&buf)?;
        drop(file);
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod test {
    use super::Metadata;
    use tempdir::TempDir;

    #[test]
    fn roundtrip() {
        let dir = TempDir::new("meta-test").unwrap();
        let path = dir.path().join("q.diskqueue.meta.dat");

        let meta = Metadata {
            depth: 42,
            read_file_num: 1,
            read_pos: 128,
            write_file_num: 3,
            write_pos: 4096,
        };
        meta.store(&path).unwrap();
        assert_eq!(Some(meta), Metadata::load(&path).unwrap());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = TempDir::new("meta-test").unwrap();
        let path = dir.path().join("q.diskqueue.meta.dat");
        assert_eq!(None, Metadata::load(&path).unwrap());
    }

    #[test]
    fn corrupt_checksum_is_none() {
        let dir = TempDir::new("meta-test").unwrap();
        let path = dir.path().join("q.diskqueue.meta.dat");

        let meta = Metadata {
            depth: 1,
            read_file_num: 0,
            read_pos: 0,
            write_file_num: 0,
            write_pos: 64,
        };
        meta.store(&path).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[12] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        assert_eq!(None, Metadata::load(&path).unwrap());
    }
}

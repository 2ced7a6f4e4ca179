use std::io::{self, Read, Write};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Local};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use uuid::Uuid;

/// Unique, time-ordered id attached to every outgoing message.
pub(crate) fn generate_log_id() -> String {
    Uuid::now_v7().to_string()
}

pub(crate) fn unix_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

pub(crate) fn now_millis() -> i64 {
    unix_millis(SystemTime::now())
}

pub(crate) fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[allow(dead_code)]
pub(crate) fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Local address the OS would route external traffic through. No packet is
/// sent; connecting a UDP socket only resolves the route.
pub(crate) fn first_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    if addr.ip().is_loopback() {
        return None;
    }
    Some(addr.ip().to_string())
}

pub(crate) fn os_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => String::from("unknown"),
    }
}

/// Path layout for persist-only log files:
/// `<base>/<year>/<month>/<day>/<YYYY-MM-DD>.<index>.log`.
pub(crate) fn log_file_info(
    now: DateTime<Local>,
    base: &Path,
    index: u32,
) -> (PathBuf, String, PathBuf) {
    let directory = log_directory(base, now);
    let name = format!("{}.{}.log", now.format("%Y-%m-%d"), index);
    let path = directory.join(&name);
    (directory, name, path)
}

pub(crate) fn log_directory(base: &Path, now: DateTime<Local>) -> PathBuf {
    base.join(now.year().to_string()).join(now.month().to_string()).join(now.day().to_string())
}

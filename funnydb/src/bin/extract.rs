//! Extracts records stored on disk by the async mode and prints them as
//! line-delimited JSON to stdout.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;

use chrono::DateTime;
use log::info;
use serde::Deserialize;
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;
use thiserror::Error;

const MAX_MSG_SIZE: u32 = 10 * 1024 * 1024;

#[derive(StructOpt, Debug)]
#[structopt(name = "extract", about = "Extract funnydb disk queue segments as line-delimited JSON")]
struct Opts {
    /// Segment file to read
    #[structopt(long, parse(from_os_str))]
    input: PathBuf,
    /// Skip messages before this timestamp (format: 2006-01-02T15:04:05+07:00)
    #[structopt(long)]
    skip_before: Option<String>,
    /// Skip messages after this timestamp (format: 2006-01-02T15:04:05+07:00)
    #[structopt(long)]
    skip_after: Option<String>,
}

#[derive(Error, Debug)]
enum ExtractError {
    #[error("Io error {0}")]
    Io(#[from] io::Error),
    #[error("invalid {flag}: {reason}")]
    InvalidFlag { flag: &'static str, reason: String },
    #[error("possible file corruption: {0}")]
    Corrupt(String),
}

#[derive(Deserialize)]
struct TimedRecord {
    data: TimedData,
}

#[derive(Deserialize)]
struct TimedData {
    #[serde(rename = "#time")]
    time: i64,
}

fn main() {
    let opts = Opts::from_args();
    let _ = TermLogger::init(
        LevelFilter::Info,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    info!("read file, input_file = {:?}", opts.input);
    if let Err(e) = run(&opts) {
        eprintln!("extract failed: {}", e);
        std::process::exit(1);
    }
}

fn run(opts: &Opts) -> Result<(), ExtractError> {
    let skip_before = parse_time_flag("skip-before", &opts.skip_before)?;
    let skip_after = parse_time_flag("skip-after", &opts.skip_after)?;

    let file = File::open(&opts.input)?;
    let stdout = io::stdout();
    let (read_count, skip_count) =
        extract(BufReader::new(file), stdout.lock(), skip_before, skip_after)?;

    info!("read {} msgs, skip {}", read_count, skip_count);
    Ok(())
}

fn parse_time_flag(flag: &'static str, value: &Option<String>) -> Result<Option<i64>, ExtractError> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.timestamp_millis()))
            .map_err(|e| ExtractError::InvalidFlag { flag, reason: e.to_string() }),
    }
}

/// Walk the length-prefixed frames, printing each record as one line.
/// Returns `(read, skipped)` counts.
fn extract<R: Read, W: Write>(
    mut reader: R,
    mut out: W,
    skip_before: Option<i64>,
    skip_after: Option<i64>,
) -> Result<(usize, usize), ExtractError> {
    let mut read_count = 0;
    let mut skip_count = 0;

    loop {
        let mut len_buf = [0u8; 4];
        match read_frame_header(&mut reader, &mut len_buf)? {
            Some(()) => {}
            None => break,
        }

        let len = u32::from_be_bytes(len_buf);
        if len == 0 || len > MAX_MSG_SIZE {
            return Err(ExtractError::Corrupt(
                "msg size is above 10MB or zero".into(),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|e| ExtractError::Corrupt(format!("failed to read msg: {}", e)))?;

        if payload[0] != b'{' || payload[payload.len() - 1] != b'}' {
            return Err(ExtractError::Corrupt(format!(
                "malformed msg: {}",
                String::from_utf8_lossy(&payload)
            )));
        }

        read_count += 1;

        if skip_before.is_some() || skip_after.is_some() {
            let record: TimedRecord = serde_json::from_slice(&payload)
                .map_err(|e| ExtractError::Corrupt(format!("malformed msg: {}", e)))?;
            let before = skip_before.map_or(false, |t| record.data.time < t);
            let after = skip_after.map_or(false, |t| record.data.time > t);
            if before || after {
                skip_count += 1;
                continue;
            }
        }

        out.write_all(&payload)?;
        out.write_all(b"\n")?;
    }

    Ok((read_count, skip_count))
}

/// `Ok(None)` on a clean end of file, an error on a torn header.
fn read_frame_header<R: Read>(reader: &mut R, len_buf: &mut [u8; 4]) -> Result<Option<()>, ExtractError> {
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ExtractError::Corrupt("truncated frame header".into()));
        }
        filled += n;
    }
    Ok(Some(()))
}

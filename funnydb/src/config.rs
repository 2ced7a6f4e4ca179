use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

pub const DEFAULT_MAX_BUFFER_RECORDS: usize = 250;
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_FILE_SIZE_MB: u64 = 128;
pub const DEFAULT_STATISTICAL_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_STATISTICAL_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Print records to the terminal.
    Debug,
    /// Buffer in memory and send straight to the ingest endpoint.
    Simple,
    /// Only write records to local log files.
    PersistOnly,
    /// Store records on a disk queue, send asynchronously.
    Async,
    /// Drop everything.
    Noop,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Debug => "debug",
            Mode::Simple => "simple",
            Mode::PersistOnly => "persist-only",
            Mode::Async => "async",
            Mode::Noop => "noop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,

    /// Collection service base URL. Required for `simple` and `async`.
    pub ingest_endpoint: String,
    pub access_key: String,
    pub access_secret: String,

    /// Storage directory. Required for `persist-only` and `async`.
    pub directory: PathBuf,

    /// A batch is sent once it holds this many records.
    pub max_buffer_records: usize,
    /// A non-empty batch is sent once this much time has passed since the
    /// last send.
    pub send_interval: Duration,
    pub send_timeout: Duration,
    /// Byte cap on one batch.
    pub batch_size: u64,
    /// Log file cap in MB for `persist-only`.
    pub file_size: u64,

    pub disable_report_stats: bool,
    /// Width of one statistics bucket.
    pub statistical_interval: Duration,
    /// How often completed statistics buckets are reported.
    pub statistical_report_interval: Duration,
    /// Overrides the OS hostname in statistics reports.
    pub hostname: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mode: Mode::Debug,
            ingest_endpoint: String::new(),
            access_key: String::new(),
            access_secret: String::new(),
            directory: PathBuf::new(),
            max_buffer_records: DEFAULT_MAX_BUFFER_RECORDS,
            send_interval: DEFAULT_SEND_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            file_size: DEFAULT_FILE_SIZE_MB,
            disable_report_stats: false,
            statistical_interval: DEFAULT_STATISTICAL_INTERVAL,
            statistical_report_interval: DEFAULT_STATISTICAL_REPORT_INTERVAL,
            hostname: None,
        }
    }
}

impl Config {
    pub(crate) fn validate(&mut self) -> Result<(), Error> {
        self.fill_defaults();
        match self.mode {
            Mode::Debug | Mode::Noop => Ok(()),
            Mode::Simple => self.check_ingest(),
            Mode::PersistOnly => self.check_directory(),
            Mode::Async => {
                self.check_ingest()?;
                self.check_directory()
            }
        }
    }

    fn check_ingest(&self) -> Result<(), Error> {
        if self.ingest_endpoint.is_empty() {
            return Err(Error::ConfigIngestEndpointIllegal);
        }
        if self.access_key.is_empty() {
            return Err(Error::ConfigAccessKeyIllegal);
        }
        if self.access_secret.is_empty() {
            return Err(Error::ConfigAccessSecretIllegal);
        }
        Ok(())
    }

    fn check_directory(&self) -> Result<(), Error> {
        if self.directory.as_os_str().is_empty() {
            return Err(Error::ConfigDirectoryIllegal);
        }
        Ok(())
    }

    // Zeroed fields fall back to the documented defaults, so a struct-update
    // construction with explicit zeroes behaves like an omitted field.
    fn fill_defaults(&mut self) {
        if self.max_buffer_records == 0 {
            self.max_buffer_records = DEFAULT_MAX_BUFFER_RECORDS;
        }
        if self.send_interval.is_zero() {
            self.send_interval = DEFAULT_SEND_INTERVAL;
        }
        if self.send_timeout.is_zero() {
            self.send_timeout = DEFAULT_SEND_TIMEOUT;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.file_size == 0 {
            self.file_size = DEFAULT_FILE_SIZE_MB;
        }
        if self.statistical_interval.is_zero() {
            self.statistical_interval = DEFAULT_STATISTICAL_INTERVAL;
        }
        if self.statistical_report_interval.is_zero() {
            self.statistical_report_interval = DEFAULT_STATISTICAL_REPORT_INTERVAL;
        }
    }
}

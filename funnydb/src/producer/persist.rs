use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use chrono::Local;
use log::{error, info};

use crate::message::Record;
use crate::producer::Status;
use crate::util;
use crate::{Config, Error};

/// Persist-only mode: every record becomes one JSON line in a log file under
/// a `<dir>/<year>/<month>/<day>/` tree. Files rotate when the configured
/// size cap would be exceeded or the date changes. Each add is acknowledged
/// by the writer thread, so callers observe write failures synchronously.
pub(crate) struct PersistProducer {
    status: Status,
    req_tx: Mutex<Option<flume::Sender<WriteRequest>>>,
    exited_rx: flume::Receiver<()>,
}

impl std::fmt::Debug for PersistProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistProducer").field("status", &self.status).finish_non_exhaustive()
    }
}

struct WriteRequest {
    data: Vec<u8>,
    done: flume::Sender<io::Result<()>>,
}

impl PersistProducer {
    pub fn new(config: &Config) -> Result<PersistProducer, Error> {
        let (req_tx, req_rx) = flume::bounded(0);
        let (exited_tx, exited_rx) = flume::bounded::<()>(0);

        let writer = Writer {
            directory: config.directory.clone(),
            max_file_size: config.file_size * 1024 * 1024,
        };
        thread::Builder::new()
            .name("funnydb-log-writer".into())
            .spawn(move || writer.run(req_rx, exited_tx))?;

        info!("ModePersistOnly starting, log path: {:?}", config.directory);
        Ok(PersistProducer {
            status: Status::running(),
            req_tx: Mutex::new(Some(req_tx)),
            exited_rx,
        })
    }

    pub async fn add(&self, record: Record) -> Result<(), Error> {
        if !self.status.is_running() {
            return Err(Error::ProducerClosed);
        }
        let data = serde_json::to_vec(&record)?;

        let req_tx = match &*self.req_tx.lock().unwrap() {
            Some(tx) => tx.clone(),
            None => return Err(Error::ProducerClosed),
        };
        let (done_tx, done_rx) = flume::bounded(1);
        req_tx
            .send_async(WriteRequest { data, done: done_tx })
            .await
            .map_err(|_| Error::ProducerClosed)?;
        match done_rx.recv_async().await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::ProducerClosed),
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        if !self.status.stop() {
            return Ok(());
        }
        // Dropping the sender lets the writer drain in-flight requests and
        // exit; the exited channel closing is the acknowledgement.
        self.req_tx.lock().unwrap().take();
        let _ = self.exited_rx.recv_async().await;
        Ok(())
    }
}

struct Writer {
    directory: PathBuf,
    max_file_size: u64,
}

impl Writer {
    fn run(self, req_rx: flume::Receiver<WriteRequest>, _exited_tx: flume::Sender<()>) {
        let (mut file, mut current_dir) = match self.create_log_file() {
            Ok(v) => v,
            Err(e) => {
                error!("Create log file error: {}", e);
                self.fail_remaining(&req_rx);
                return;
            }
        };

        let mut total_size: u64 = 0;
        while let Ok(req) = req_rx.recv() {
            let written_size = req.data.len() as u64 + 1;

            let expect_dir = util::log_directory(&self.directory, Local::now());
            if current_dir != expect_dir || total_size + written_size > self.max_file_size {
                match self.create_log_file() {
                    Ok((new_file, new_dir)) => {
                        file = new_file;
                        current_dir = new_dir;
                        total_size = 0;
                    }
                    Err(e) => {
                        error!("Rotate log file error: {}", e);
                        let _ = req.done.send(Err(e));
                        self.fail_remaining(&req_rx);
                        return;
                    }
                }
            }

            let result = file.write_all(&req.data).and_then(|_| file.write_all(b"\n"));
            let _ = req.done.send(result);
            total_size += written_size;
        }
    }

    /// Pick the first unused index for today and create the file atomically;
    /// a concurrent instance racing for the same name just moves to the next
    /// index.
    fn create_log_file(&self) -> io::Result<(File, PathBuf)> {
        let mut index = 0u32;
        loop {
            let now = Local::now();
            let (dir, _, path) = util::log_file_info(now, &self.directory, index);
            fs::create_dir_all(&dir)?;

            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    info!("Create log file: {:?}", path);
                    return Ok((file, dir));
                }
                Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    index += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail_remaining(&self, req_rx: &flume::Receiver<WriteRequest>) {
        while let Ok(req) = req_rx.recv() {
            let _ = req
                .done
                .send(Err(io::Error::new(io::ErrorKind::Other, "log writer stopped")));
        }
    }
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use diskqueue::{DiskQueue, QueueConfig, QueueReader};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::delivery::{Delivery, Outcome};
use crate::ingest::{self, IngestClient};
use crate::message::Record;
use crate::producer::Status;
use crate::stats::{self, Statistician, StatsOptions};
use crate::{Config, Error};

const QUEUE_NAME: &str = "funnydb";

/// Async mode: `add` persists the record on a disk queue and returns; a
/// single sender task drains the queue into size- and time-bounded batches,
/// delivers them with retry, and advances the queue cursor only after a batch
/// is accepted. Anything not advanced is redelivered on the next start.
pub(crate) struct AsyncProducer {
    status: Status,
    queue: DiskQueue,
    stats: Option<Arc<Statistician>>,
    close_tx: Mutex<Option<flume::Sender<()>>>,
    sender: Mutex<Option<JoinHandle<Option<Error>>>>,
}

impl std::fmt::Debug for AsyncProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProducer").field("status", &self.status).finish_non_exhaustive()
    }
}

impl AsyncProducer {
    pub fn new(config: &Config) -> Result<AsyncProducer, Error> {
        let client =
            IngestClient::new(&config.ingest_endpoint, &config.access_key, &config.access_secret)?;
        let queue = DiskQueue::open(QueueConfig::new(QUEUE_NAME, &config.directory))?;
        let reader = match queue.reader() {
            Some(reader) => reader,
            None => unreachable!("freshly opened queue always has its reader"),
        };

        let stats = if config.disable_report_stats {
            None
        } else {
            Statistician::create(
                &config.ingest_endpoint,
                StatsOptions {
                    mode: config.mode,
                    access_key_id: config.access_key.clone(),
                    hostname: config.hostname.clone(),
                    report_interval: config.statistical_report_interval,
                },
            )?
            .map(Arc::new)
        };

        let (close_tx, close_rx) = flume::bounded::<()>(0);
        let send_loop = SendLoop {
            reader,
            delivery: Delivery::new(client, config.send_timeout),
            stats: stats.clone(),
            max_records: config.max_buffer_records,
            batch_max_bytes: config.batch_size as usize,
            send_interval: config.send_interval,
            statistical_interval: config.statistical_interval,
            close_rx,
        };
        let sender = tokio::spawn(send_loop.run());

        info!("ModeAsync starting, log path: {:?}", config.directory);
        Ok(AsyncProducer {
            status: Status::running(),
            queue,
            stats,
            close_tx: Mutex::new(Some(close_tx)),
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Serialize and durably enqueue. The record is on disk when this
    /// returns; delivery happens in the background.
    pub fn add(&self, record: Record) -> Result<(), Error> {
        if !self.status.is_running() {
            return Err(Error::ProducerClosed);
        }
        let data = serde_json::to_vec(&record)?;
        self.queue.put(&data)?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), Error> {
        if !self.status.stop() {
            return Ok(());
        }
        self.close_tx.lock().unwrap().take();

        let sender = self.sender.lock().unwrap().take();
        let sender_error = match sender {
            Some(handle) => match handle.await {
                Ok(last_error) => last_error,
                Err(e) => {
                    error!("Sender task panicked. Error = {:?}", e);
                    None
                }
            },
            None => None,
        };

        if let Err(e) = self.queue.close() {
            error!("Close disk queue error : {}", e);
        }
        if let Some(stats) = &self.stats {
            stats.close().await;
        }

        match sender_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// In-memory pending batch. Records stay queued on disk until the whole
/// batch is delivered and advanced.
struct Batch {
    records: Vec<Bytes>,
    byte_size: usize,
    last_commit: Instant,
}

impl Batch {
    fn new() -> Batch {
        Batch { records: Vec::new(), byte_size: 0, last_commit: Instant::now() }
    }

    fn push(&mut self, record: Bytes) {
        self.byte_size += record.len();
        self.records.push(record);
    }

    fn reset(&mut self) {
        self.records.clear();
        self.byte_size = 0;
        self.last_commit = Instant::now();
    }
}

struct SendLoop {
    reader: QueueReader,
    delivery: Delivery,
    stats: Option<Arc<Statistician>>,
    max_records: usize,
    batch_max_bytes: usize,
    send_interval: Duration,
    statistical_interval: Duration,
    close_rx: flume::Receiver<()>,
}

impl SendLoop {
    /// Returns the last delivery error still standing when the loop exits,
    /// surfaced to the caller by `close`.
    async fn run(mut self) -> Option<Error> {
        let mut batch = Batch::new();
        let mut last_error: Option<Error> = None;
        let mut ticker = tokio::time::interval(self.send_interval);

        loop {
            tokio::select! {
                _ = self.close_rx.recv_async() => {
                    info!("Sender received close signal, exiting");
                    break;
                }
                _ = ticker.tick() => {
                    if !batch.records.is_empty() && batch.last_commit.elapsed() >= self.send_interval {
                        if !self.flush(&mut batch, &mut last_error).await {
                            break;
                        }
                    }
                }
                record = self.reader.recv() => {
                    let record = match record {
                        Ok(r) => r,
                        Err(_) => break,
                    };
                    if !batch.records.is_empty() && batch.byte_size + record.len() > self.batch_max_bytes {
                        if !self.flush(&mut batch, &mut last_error).await {
                            break;
                        }
                    }
                    batch.push(record);
                    if batch.records.len() >= self.max_records {
                        if !self.flush(&mut batch, &mut last_error).await {
                            break;
                        }
                    }
                }
            }
        }
        last_error
    }

    /// Deliver the pending batch. Returns false when the loop should stop
    /// (close was signalled mid-retry); the batch is then left unadvanced so
    /// the next run redelivers it.
    async fn flush(&mut self, batch: &mut Batch, last_error: &mut Option<Error>) -> bool {
        let (body, valid_records) = match ingest::encode_raw_batch(&batch.records) {
            Ok(v) => v,
            Err(e) => {
                error!("Marshal batch failed. Error = {:?}", e);
                *last_error = Some(Error::Serde(e));
                return true;
            }
        };

        if valid_records == 0 {
            // Nothing but poison records; step past them without a request.
            self.reader.advance();
            batch.reset();
            return true;
        }

        match self.delivery.deliver(&body, &self.close_rx).await {
            Outcome::Success => {
                debug!("Sent batch of {} records", valid_records);
                self.reader.advance();
                if let Some(stats) = &self.stats {
                    stats.count(stats::groups_from_raw(&batch.records, self.statistical_interval));
                }
                batch.reset();
                *last_error = None;
                true
            }
            Outcome::PermanentClientError(e) => {
                error!(
                    "Dropping batch of {} records after permanent client error. Error = {}",
                    batch.records.len(),
                    e
                );
                self.reader.advance();
                batch.reset();
                *last_error = Some(Error::Ingest(e));
                true
            }
            Outcome::GaveUp(e) => {
                warn!("Giving up batch of {} records until next start. Error = {}", batch.records.len(), e);
                *last_error = Some(Error::Ingest(e));
                false
            }
        }
    }
}

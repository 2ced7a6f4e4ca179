use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::{self, Instant};

use crate::ingest::{self, IngestClient};
use crate::message::Record;
use crate::producer::Status;
use crate::stats::{self, Statistician, StatsOptions};
use crate::{Config, Error};

/// Simple mode: records are buffered in memory and posted once the buffer
/// fills or the send interval elapses. A failed send keeps the buffer for
/// the next trigger; nothing is persisted.
pub(crate) struct SimpleProducer {
    status: Status,
    report_tx: flume::Sender<Record>,
    close_tx: Mutex<Option<flume::Sender<()>>>,
    exited_rx: flume::Receiver<()>,
}

impl std::fmt::Debug for SimpleProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleProducer").field("status", &self.status).finish_non_exhaustive()
    }
}

impl SimpleProducer {
    pub fn new(config: &Config) -> Result<SimpleProducer, Error> {
        let client =
            IngestClient::new(&config.ingest_endpoint, &config.access_key, &config.access_secret)?;
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

        let (report_tx, report_rx) = flume::bounded(0);
        let (close_tx, close_rx) = flume::bounded::<()>(0);
        let (exited_tx, exited_rx) = flume::bounded::<()>(0);

        let send_loop = SendLoop {
            client,
            stats,
            buffer: Vec::with_capacity(config.max_buffer_records),
            max_records: config.max_buffer_records,
            send_interval: config.send_interval,
            send_timeout: config.send_timeout,
            statistical_interval: config.statistical_interval,
        };
        tokio::spawn(send_loop.run(report_rx, close_rx, exited_tx));

        info!("ModeSimple starting");
        Ok(SimpleProducer {
            status: Status::running(),
            report_tx,
            close_tx: Mutex::new(Some(close_tx)),
            exited_rx,
        })
    }

    pub async fn add(&self, record: Record) -> Result<(), Error> {
        if !self.status.is_running() {
            return Err(Error::ProducerClosed);
        }
        self.report_tx.send_async(record).await.map_err(|_| Error::ProducerClosed)
    }

    pub async fn close(&self) -> Result<(), Error> {
        if !self.status.stop() {
            return Ok(());
        }
        self.close_tx.lock().unwrap().take();
        let _ = self.exited_rx.recv_async().await;
        Ok(())
    }
}

struct SendLoop {
    client: IngestClient,
    stats: Option<Arc<Statistician>>,
    buffer: Vec<Record>,
    max_records: usize,
    send_interval: Duration,
    send_timeout: Duration,
    statistical_interval: Duration,
}

impl SendLoop {
    async fn run(
        mut self,
        report_rx: flume::Receiver<Record>,
        close_rx: flume::Receiver<()>,
        _exited_tx: flume::Sender<()>,
    ) {
        let timer = time::sleep(self.send_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = close_rx.recv_async() => {
                    self.send_batch().await;
                    break;
                }
                _ = &mut timer => {
                    self.send_batch().await;
                    timer.as_mut().reset(Instant::now() + self.send_interval);
                }
                record = report_rx.recv_async() => match record {
                    Ok(record) => {
                        self.buffer.push(record);
                        if self.buffer.len() >= self.max_records {
                            self.send_batch().await;
                            timer.as_mut().reset(Instant::now() + self.send_interval);
                        }
                    }
                    Err(_) => {
                        self.send_batch().await;
                        break;
                    }
                },
            }
        }

        if let Some(stats) = &self.stats {
            stats.close().await;
        }
        info!("Sender loop exited");
    }

    async fn send_batch(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let body = match ingest::encode_record_batch(&self.buffer) {
            Ok(body) => body,
            Err(e) => {
                error!("Marshal batch failed, dropping {} records. Error = {:?}", self.buffer.len(), e);
                self.buffer.clear();
                return;
            }
        };

        match self.client.collect(&body, self.send_timeout).await {
            Ok(()) => {
                debug!("Sent batch of {} records", self.buffer.len());
                if let Some(stats) = &self.stats {
                    stats.count(stats::groups_from_records(&self.buffer, self.statistical_interval));
                }
                self.buffer.clear();
            }
            // Buffer is kept; the next trigger retries the whole batch.
            Err(e) => error!("Send data failed : {}", e),
        }
    }
}

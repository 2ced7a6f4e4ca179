use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::ingest::{self, IngestClient, IngestError};
use crate::message::{
    Record, EVENT_TYPE_VALUE, FIELD_EVENT, FIELD_IP, FIELD_LOG_ID, FIELD_SDK_TYPE,
    FIELD_SDK_VERSION, FIELD_TIME,
};
use crate::util;
use crate::{Mode, Props};

pub(crate) const STATS_EVENT_NAME: &str = "collector_report_status";

const STATS_FIELD_HOSTNAME: &str = "hostname";
const STATS_FIELD_INSTANCE_ID: &str = "instance_id";
const STATS_FIELD_MODE: &str = "mode";
const STATS_FIELD_ACCESS_KEY_ID: &str = "access_key_id";
const STATS_FIELD_INIT_TIME: &str = "init_time";
const STATS_FIELD_BEGIN_TIME: &str = "begin_time";
const STATS_FIELD_END_TIME: &str = "end_time";
const STATS_FIELD_STATS_EVENT: &str = "stats_event";
const STATS_FIELD_REPORT_TOTAL: &str = "report_total";

const STATS_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Reporting credentials are fixed per ingest endpoint. Unknown endpoints run
/// without a statistician.
const CONNECT_INFO: &[(&str, &str, &str)] = &[
    (
        "https://ingest.zh-cn.xmfunny.com",
        "FDI_hpwyjj0ewWTuMExV1K7D",
        "FDS_X1pUw4DapBNvPaTvHPANTqUJ8uOw",
    ),
    (
        "https://ingest.sg.xmfunny.com",
        "FDI_oO1rlJgiPdY7zXxJd09f",
        "FDS_f2BHPDUlPGeYeKbV4rWfxq8ief3O",
    ),
];

fn connect_info(endpoint: &str) -> Option<(&'static str, &'static str)> {
    CONNECT_INFO
        .iter()
        .find(|(e, _, _)| *e == endpoint)
        .map(|(_, key, secret)| (*key, *secret))
}

/// Begin time of the bucket containing `t`: `floor(t / width) * width`.
pub(crate) fn truncate_millis(t: i64, width: i64) -> i64 {
    t - t.rem_euclid(width)
}

/// One counting bucket: `[begin, end)` plus the event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StatsGroup {
    pub begin_ms: i64,
    pub end_ms: i64,
    pub event: String,
}

impl StatsGroup {
    pub fn new(event_time_ms: i64, interval: Duration, event: String) -> StatsGroup {
        let width = interval.as_millis() as i64;
        let begin_ms = truncate_millis(event_time_ms, width);
        StatsGroup { begin_ms, end_ms: begin_ms + width, event }
    }
}

/// Bucket every event-type record of a delivered batch. Mutations carry no
/// event name and are not counted.
pub(crate) fn groups_from_records(records: &[Record], interval: Duration) -> Vec<StatsGroup> {
    let mut groups = Vec::new();
    for record in records {
        if record.get("type").and_then(Value::as_str) != Some(EVENT_TYPE_VALUE) {
            continue;
        }
        let data = match record.get("data").and_then(Value::as_object) {
            Some(d) => d,
            None => continue,
        };
        let time = data.get(FIELD_TIME).and_then(Value::as_i64);
        let event = data.get(FIELD_EVENT).and_then(Value::as_str);
        if let (Some(time), Some(event)) = (time, event) {
            groups.push(StatsGroup::new(time, interval, event.to_owned()));
        }
    }
    groups
}

#[derive(Deserialize)]
struct PeekRecord {
    #[serde(rename = "type")]
    type_value: String,
    data: PeekData,
}

#[derive(Deserialize)]
struct PeekData {
    #[serde(rename = "#time")]
    time: Option<i64>,
    #[serde(rename = "#event")]
    event: Option<String>,
}

/// Same as [`groups_from_records`], for records already serialized on disk.
pub(crate) fn groups_from_raw(records: &[Bytes], interval: Duration) -> Vec<StatsGroup> {
    let mut groups = Vec::new();
    for record in records {
        let peek: PeekRecord = match serde_json::from_slice(record) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if peek.type_value != EVENT_TYPE_VALUE {
            continue;
        }
        if let (Some(time), Some(event)) = (peek.data.time, peek.data.event) {
            groups.push(StatsGroup::new(time, interval, event));
        }
    }
    groups
}

pub(crate) struct StatsOptions {
    pub mode: Mode,
    pub access_key_id: String,
    pub hostname: Option<String>,
    pub report_interval: Duration,
}

/// Counts delivered traffic per `(bucket, event)` and reports each completed
/// bucket as a `collector_report_status` event on fixed credentials. All
/// state lives in a single background task; `count` never blocks ingest.
pub(crate) struct Statistician {
    count_tx: flume::Sender<Vec<StatsGroup>>,
    close_tx: Mutex<Option<flume::Sender<()>>>,
    exited_rx: flume::Receiver<()>,
}

impl Statistician {
    /// `None` when the endpoint has no built-in reporting credentials; the
    /// producer runs without statistics in that case.
    pub fn create(endpoint: &str, options: StatsOptions) -> Result<Option<Statistician>, IngestError> {
        let (key, secret) = match connect_info(endpoint) {
            Some(info) => info,
            None => {
                info!("Statistician disabled, no report credentials for endpoint {}", endpoint);
                return Ok(None);
            }
        };
        let client = IngestClient::new(endpoint, key, secret)?;
        Ok(Some(Statistician::with_client(client, options)))
    }

    pub fn with_client(client: IngestClient, options: StatsOptions) -> Statistician {
        let (count_tx, count_rx) = flume::unbounded();
        let (close_tx, close_rx) = flume::bounded::<()>(0);
        let (exited_tx, exited_rx) = flume::bounded::<()>(0);

        let ip = match util::first_ipv4() {
            Some(ip) => ip,
            None => {
                warn!("No routable IPv4 address found, reporting loopback");
                String::from("127.0.0.1")
            }
        };
        let reporter = Reporter {
            client,
            instance_id: util::generate_log_id(),
            ip,
            hostname: options.hostname.unwrap_or_else(util::os_hostname),
            mode: options.mode,
            access_key_id: options.access_key_id,
            init_time_ms: util::now_millis(),
            records: HashMap::new(),
            min_record_end_time: 0,
        };
        tokio::spawn(reporter.run(count_rx, close_rx, exited_tx, options.report_interval));

        Statistician { count_tx, close_tx: Mutex::new(Some(close_tx)), exited_rx }
    }

    pub fn count(&self, groups: Vec<StatsGroup>) {
        if groups.is_empty() {
            return;
        }
        if self.count_tx.send(groups).is_err() {
            debug!("Statistician already stopped, dropping counts");
        }
    }

    pub async fn close(&self) {
        self.close_tx.lock().unwrap().take();
        let _ = self.exited_rx.recv_async().await;
    }
}

struct Reporter {
    client: IngestClient,
    instance_id: String,
    ip: String,
    hostname: String,
    mode: Mode,
    access_key_id: String,
    init_time_ms: i64,
    records: HashMap<StatsGroup, i64>,
    min_record_end_time: i64,
}

impl Reporter {
    async fn run(
        mut self,
        count_rx: flume::Receiver<Vec<StatsGroup>>,
        close_rx: flume::Receiver<()>,
        _exited_tx: flume::Sender<()>,
        report_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(report_interval);
        loop {
            tokio::select! {
                _ = close_rx.recv_async() => {
                    self.report(i64::MAX).await;
                    break;
                }
                groups = count_rx.recv_async() => match groups {
                    Ok(groups) => {
                        if let Some(reach) = self.absorb(groups) {
                            self.report(reach).await;
                        }
                    }
                    Err(_) => {
                        self.report(i64::MAX).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.report(util::now_millis()).await;
                }
            }
        }
    }

    /// Fold counts into the bucket map. Returns a reach time when an incoming
    /// begin time proves that some held bucket is complete.
    fn absorb(&mut self, groups: Vec<StatsGroup>) -> Option<i64> {
        let max_begin = groups.iter().map(|g| g.begin_ms).max()?;
        let prior_min = self.min_record_end_time;
        for group in groups {
            let end = group.end_ms;
            *self.records.entry(group).or_insert(0) += 1;
            if self.min_record_end_time == 0 || end < self.min_record_end_time {
                self.min_record_end_time = end;
            }
        }
        if prior_min != 0 && max_begin >= prior_min {
            Some(max_begin)
        } else {
            None
        }
    }

    /// Emit every bucket that ended at or before `reach_ms`. Buckets whose
    /// emit fails stay in the map for the next flush.
    async fn report(&mut self, reach_ms: i64) {
        if self.records.is_empty() {
            return;
        }

        let due: Vec<StatsGroup> =
            self.records.keys().filter(|g| g.end_ms <= reach_ms).cloned().collect();
        for group in due {
            let total = self.records[&group];
            match self.emit(&group, total).await {
                Ok(()) => {
                    self.records.remove(&group);
                }
                Err(e) => {
                    error!("Report stats failed, keeping bucket. Error = {}", e);
                }
            }
        }
        self.min_record_end_time = self.records.keys().map(|g| g.end_ms).min().unwrap_or(0);
    }

    async fn emit(&self, group: &StatsGroup, total: i64) -> Result<(), IngestError> {
        let mut data = Props::new();
        data.insert(FIELD_LOG_ID.into(), Value::from(util::generate_log_id()));
        data.insert(FIELD_SDK_TYPE.into(), Value::from(crate::message::SDK_TYPE));
        data.insert(FIELD_SDK_VERSION.into(), Value::from(crate::message::SDK_VERSION));
        data.insert(FIELD_TIME.into(), Value::from(util::now_millis()));
        data.insert(FIELD_EVENT.into(), Value::from(STATS_EVENT_NAME));
        data.insert(FIELD_IP.into(), Value::from(self.ip.as_str()));
        data.insert(STATS_FIELD_HOSTNAME.into(), Value::from(self.hostname.as_str()));
        data.insert(STATS_FIELD_INSTANCE_ID.into(), Value::from(self.instance_id.as_str()));
        data.insert(STATS_FIELD_MODE.into(), Value::from(self.mode.as_str()));
        data.insert(STATS_FIELD_ACCESS_KEY_ID.into(), Value::from(self.access_key_id.as_str()));
        data.insert(STATS_FIELD_INIT_TIME.into(), Value::from(self.init_time_ms));
        data.insert(STATS_FIELD_BEGIN_TIME.into(), Value::from(group.begin_ms));
        data.insert(STATS_FIELD_END_TIME.into(), Value::from(group.end_ms));
        data.insert(STATS_FIELD_STATS_EVENT.into(), Value::from(group.event.as_str()));
        data.insert(STATS_FIELD_REPORT_TOTAL.into(), Value::from(total));

        let mut record = Record::new();
        record.insert("type".into(), Value::from(EVENT_TYPE_VALUE));
        record.insert("data".into(), Value::Object(data));

        let body = ingest::encode_record_batch(&[record])?;
        self.client.collect(&body, STATS_SEND_TIMEOUT).await
    }
}

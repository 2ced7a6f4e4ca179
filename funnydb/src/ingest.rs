use std::io;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::message::Record;
use crate::util;

/// Failure of one collect attempt. Carries enough structure for the delivery
/// layer to classify it as retryable or permanent.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Send collect request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Ingest server responded {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Ingest server returned error envelope: {0}")]
    Envelope(String),
    #[error("Serde error {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Io error {0}")]
    Io(#[from] io::Error),
}

impl IngestError {
    /// Transport failures, server errors and the transient status codes are
    /// worth another attempt; remaining client errors mean the batch itself
    /// is unacceptable.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Transport(_) => true,
            IngestError::Envelope(_) => true,
            IngestError::Status { status, .. } => {
                matches!(status, 401 | 412 | 422) || *status >= 500
            }
            IngestError::Serde(_) | IngestError::Io(_) => false,
        }
    }
}

#[derive(Deserialize)]
struct CollectResponse {
    error: Option<serde_json::Value>,
}

/// HTTP client for the collection endpoint: posts gzip-compressed JSON
/// batches to `<endpoint>/v1/collect` with basic-auth credentials.
pub(crate) struct IngestClient {
    collect_url: String,
    access_key: String,
    access_secret: String,
    http: reqwest::Client,
}

impl IngestClient {
    pub fn new(endpoint: &str, access_key: &str, access_secret: &str) -> Result<IngestClient, IngestError> {
        let http = reqwest::Client::builder().build()?;
        Ok(IngestClient {
            collect_url: format!("{}/v1/collect", endpoint.trim_end_matches('/')),
            access_key: access_key.to_owned(),
            access_secret: access_secret.to_owned(),
            http,
        })
    }

    pub async fn collect(&self, body: &[u8], timeout: Duration) -> Result<(), IngestError> {
        let compressed = util::gzip(body)?;
        let response = self
            .http
            .post(&self.collect_url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .basic_auth(&self.access_key, Some(&self.access_secret))
            .body(compressed)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(IngestError::Status { status: status.as_u16(), message: text });
        }

        // 2xx with an error envelope still counts as a failed delivery.
        if let Ok(envelope) = serde_json::from_str::<CollectResponse>(&text) {
            match envelope.error {
                Some(serde_json::Value::Null) | None => {}
                Some(err) => return Err(IngestError::Envelope(err.to_string())),
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RecordBatch<'a> {
    messages: &'a [Record],
}

#[derive(Serialize)]
struct RawBatch<'a> {
    messages: &'a [&'a RawValue],
}

/// Wire body for records still held as maps (simple mode, stats).
pub(crate) fn encode_record_batch(records: &[Record]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&RecordBatch { messages: records })
}

/// Wire body for records already serialized on the disk queue. Undecodable
/// records are dropped here so one poison record cannot wedge the batch.
pub(crate) fn encode_raw_batch(records: &[bytes::Bytes]) -> Result<(Vec<u8>, usize), serde_json::Error> {
    let mut raw: Vec<&RawValue> = Vec::with_capacity(records.len());
    for record in records {
        match std::str::from_utf8(record).ok().and_then(|s| serde_json::from_str::<&RawValue>(s).ok()) {
            Some(value) => raw.push(value),
            None => warn!("Dropping malformed record of {} bytes from batch", record.len()),
        }
    }
    let body = serde_json::to_vec(&RawBatch { messages: &raw })?;
    Ok((body, raw.len()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::Value;

    #[test]
    fn status_classification() {
        for status in [500u16, 502, 503, 401, 412, 422] {
            let err = IngestError::Status { status, message: String::new() };
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
        for status in [400u16, 403, 404, 409, 429] {
            let err = IngestError::Status { status, message: String::new() };
            assert!(!err.is_retryable(), "{} should be permanent", status);
        }
        assert!(IngestError::Envelope("busy".into()).is_retryable());
    }

    #[test]
    fn raw_batch_splices_stored_records() {
        let records = vec![
            bytes::Bytes::from_static(br##"{"data":{"#event":"A"},"type":"Event"}"##),
            bytes::Bytes::from_static(br##"{"data":{"#event":"B"},"type":"Event"}"##),
        ];
        let (body, count) = encode_raw_batch(&records).unwrap();
        assert_eq!(2, count);

        let parsed: Value = serde_json::from_slice(&body).unwrap();
        let messages = parsed["messages"].as_array().unwrap();
        assert_eq!("A", messages[0]["data"]["#event"].as_str().unwrap());
        assert_eq!("B", messages[1]["data"]["#event"].as_str().unwrap());
    }

    #[test]
    fn raw_batch_drops_poison_records() {
        let records = vec![
            bytes::Bytes::from_static(b"\xff\xfe not json"),
            bytes::Bytes::from_static(br#"{"type":"Event","data":{}}"#),
        ];
        let (body, count) = encode_raw_batch(&records).unwrap();
        assert_eq!(1, count);

        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(1, parsed["messages"].as_array().unwrap().len());
    }
}

use std::io;

use thiserror::Error;

use crate::ingest::IngestError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("producer config IngestEndpoint can not be empty")]
    ConfigIngestEndpointIllegal,
    #[error("producer config AccessKey can not be empty")]
    ConfigAccessKeyIllegal,
    #[error("producer config AccessSecret can not be empty")]
    ConfigAccessSecretIllegal,
    #[error("producer config Directory can not be empty")]
    ConfigDirectoryIllegal,
    #[error("producer has been closed")]
    ProducerClosed,
    #[error("message check failed: {0}")]
    InvalidMessage(String),
    #[error("Serde error {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Disk queue error {0}")]
    Queue(#[from] diskqueue::Error),
    #[error("Io error {0}")]
    Io(#[from] io::Error),
    #[error("Ingest error {0}")]
    Ingest(#[from] IngestError),
}

//! FunnyDB analytics ingestion SDK.
//!
//! Application code records [`Event`]s and [`Mutation`]s through a [`Client`];
//! the client serializes them to deterministic JSON and hands them to the
//! producer selected by [`Config::mode`]:
//!
//! - `debug` prints records to stdout,
//! - `simple` batches records in memory and posts them to the ingest endpoint,
//! - `persist-only` appends records to rotating local log files,
//! - `async` writes records to a crash-safe disk queue and drains it from a
//!   background sender with retry, backoff and batch commit,
//! - `noop` drops everything.
//!
//! The async producer is the durable path: a record accepted by
//! [`Client::report`] survives process restarts until a batch containing it
//! has been delivered and the queue cursor advanced past it.
//!
//! Construction must happen inside a tokio runtime; the producers spawn
//! background tasks on it.

mod client;
mod config;
mod delivery;
mod error;
mod ingest;
mod message;
mod producer;
mod stats;
mod util;

pub use client::Client;
pub use config::{Config, Mode};
pub use error::Error;
pub use ingest::IngestError;
pub use message::{Event, Message, Mutation, Operate, Props};

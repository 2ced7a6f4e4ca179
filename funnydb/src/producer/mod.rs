use std::sync::atomic::{AtomicBool, Ordering};

use crate::message::Record;
use crate::Error;

mod async_queue;
mod console;
mod noop;
mod persist;
mod simple;

pub(crate) use async_queue::AsyncProducer;
pub(crate) use console::ConsoleProducer;
pub(crate) use noop::NoopProducer;
pub(crate) use persist::PersistProducer;
pub(crate) use simple::SimpleProducer;

/// The producer selected by the configured mode. Enum dispatch keeps the
/// async methods free of trait objects.
#[derive(Debug)]
pub(crate) enum Producer {
    Console(ConsoleProducer),
    Noop(NoopProducer),
    Simple(SimpleProducer),
    Persist(PersistProducer),
    Async(AsyncProducer),
}

impl Producer {
    pub async fn add(&self, record: Record) -> Result<(), Error> {
        match self {
            Producer::Console(p) => p.add(record),
            Producer::Noop(_) => Ok(()),
            Producer::Simple(p) => p.add(record).await,
            Producer::Persist(p) => p.add(record).await,
            Producer::Async(p) => p.add(record),
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        match self {
            Producer::Console(_) | Producer::Noop(_) => Ok(()),
            Producer::Simple(p) => p.close().await,
            Producer::Persist(p) => p.close().await,
            Producer::Async(p) => p.close().await,
        }
    }
}

/// running/stopped flag with a single-shot stop transition.
#[derive(Debug)]
pub(crate) struct Status(AtomicBool);

impl Status {
    pub fn running() -> Status {
        Status(AtomicBool::new(true))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// True only for the caller that performed the transition.
    pub fn stop(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

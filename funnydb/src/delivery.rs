use std::cmp;
use std::time::Duration;

use log::error;
use rand::Rng;

use crate::ingest::{IngestClient, IngestError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const BACKOFF_JITTER_MS: u64 = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Terminal result of delivering one batch.
pub(crate) enum Outcome {
    Success,
    /// The server told us the batch itself is unacceptable; retrying would
    /// head-of-line block the queue forever.
    PermanentClientError(IngestError),
    /// Close was signalled while retrying; the batch stays with the caller.
    GaveUp(IngestError),
}

/// One network attempt under `send_timeout` plus the retry policy around it.
/// Retryable failures back off exponentially until the close signal fires.
pub(crate) struct Delivery {
    client: IngestClient,
    send_timeout: Duration,
}

impl Delivery {
    pub fn new(client: IngestClient, send_timeout: Duration) -> Delivery {
        Delivery { client, send_timeout }
    }

    pub async fn deliver(&self, body: &[u8], close_rx: &flume::Receiver<()>) -> Outcome {
        let mut delay = first_delay();
        loop {
            match self.client.collect(body, self.send_timeout).await {
                Ok(()) => return Outcome::Success,
                Err(e) if !e.is_retryable() => return Outcome::PermanentClientError(e),
                Err(e) => {
                    error!("Send data failed, retrying in {:?}. Error = {}", delay, e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = close_rx.recv_async() => return Outcome::GaveUp(e),
                    }
                    delay = next_delay(delay);
                }
            }
        }
    }
}

fn first_delay() -> Duration {
    INITIAL_BACKOFF + Duration::from_millis(rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS))
}

fn next_delay(delay: Duration) -> Duration {
    cmp::min(delay * 2, MAX_BACKOFF)
}

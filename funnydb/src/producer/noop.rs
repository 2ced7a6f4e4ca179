use log::info;

/// Accepts everything, reports nothing.
#[derive(Debug)]
pub(crate) struct NoopProducer;

impl NoopProducer {
    pub fn new() -> NoopProducer {
        info!("ModeNoop starting");
        NoopProducer
    }
}

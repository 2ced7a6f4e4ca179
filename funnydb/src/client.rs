use crate::message::Message;
use crate::producer::{
    AsyncProducer, ConsoleProducer, NoopProducer, PersistProducer, Producer, SimpleProducer,
};
use crate::{Config, Error, Event, Mode, Mutation};

/// Entry point of the SDK. Owns the producer selected by [`Config::mode`].
///
/// Must be constructed inside a tokio runtime; the simple and async modes
/// spawn background tasks on it.
#[derive(Debug)]
pub struct Client {
    producer: Producer,
}

impl Client {
    pub fn new(config: Config) -> Result<Client, Error> {
        let mut config = config;
        config.validate()?;

        let producer = match config.mode {
            Mode::Debug => Producer::Console(ConsoleProducer::new()),
            Mode::Noop => Producer::Noop(NoopProducer::new()),
            Mode::Simple => Producer::Simple(SimpleProducer::new(&config)?),
            Mode::PersistOnly => Producer::Persist(PersistProducer::new(&config)?),
            Mode::Async => Producer::Async(AsyncProducer::new(&config)?),
        };
        Ok(Client { producer })
    }

    /// Validate and report one message. For the async mode this returns once
    /// the record is durably queued; delivery happens in the background.
    pub async fn report<M: Into<Message>>(&self, message: M) -> Result<(), Error> {
        let message = message.into();
        message.check()?;
        self.producer.add(message.into_record()).await
    }

    pub async fn report_event(&self, event: Event) -> Result<(), Error> {
        self.report(event).await
    }

    pub async fn report_user_mutation(&self, mutation: Mutation) -> Result<(), Error> {
        self.report(Message::UserMutation(mutation)).await
    }

    pub async fn report_device_mutation(&self, mutation: Mutation) -> Result<(), Error> {
        self.report(Message::DeviceMutation(mutation)).await
    }

    /// Stop the producer. Only the first call does the work; later calls are
    /// no-ops. The async producer surfaces the last delivery error it saw.
    pub async fn close(&self) -> Result<(), Error> {
        self.producer.close().await
    }
}

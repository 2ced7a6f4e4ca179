use log::{error, info};

use crate::message::Record;
use crate::Error;

/// Debug mode: one JSON record per line on stdout.
#[derive(Debug)]
pub(crate) struct ConsoleProducer;

impl ConsoleProducer {
    pub fn new() -> ConsoleProducer {
        info!("ModeDebug starting");
        ConsoleProducer
    }

    pub fn add(&self, record: Record) -> Result<(), Error> {
        match serde_json::to_string(&record) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Marshal record failed. Error = {:?}", e),
        }
        Ok(())
    }
}

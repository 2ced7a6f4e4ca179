//! Reports a few events and mutations through the durable async producer.
//!
//! Run with a collector available:
//! `cargo run --example basic -- http://127.0.0.1:8080`

use std::env;
use std::time::Duration;

use funnydb::{Client, Config, Event, Mode, Mutation, Operate, Props};
use serde_json::Value;
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = TermLogger::init(
        LevelFilter::Info,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    let endpoint = env::args().nth(1).unwrap_or_else(|| "http://127.0.0.1:8080".into());

    let client = Client::new(Config {
        mode: Mode::Async,
        ingest_endpoint: endpoint,
        access_key: "demo".into(),
        access_secret: "demo".into(),
        directory: "./funnydb-data".into(),
        ..Config::default()
    })?;

    let mut props = Props::new();
    props.insert("#account_id".into(), Value::from("account-fake955582"));
    props.insert("#channel".into(), Value::from("tapdb"));

    for _ in 0..5 {
        client.report_event(Event::new("UserLogin", props.clone())).await?;
    }

    client
        .report_user_mutation(Mutation::new(Operate::Set, "user-id-1", props.clone()))
        .await?;

    // Give the background sender a moment, then shut down cleanly.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.close().await?;
    Ok(())
}

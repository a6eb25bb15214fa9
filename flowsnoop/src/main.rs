use anyhow::Result;
use clap::Parser;
use tracing::info;

use flowsnoop::config::Cli;
use flowsnoop::controller::Controller;
use flowsnoop::{consumer, producer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowsnoop=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.resolve()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        producer = ?config.producer,
        consumer = ?config.consumer,
        every_secs = config.every_secs,
        "starting flowsnoop"
    );

    let producer = producer::build(&config);
    let consumer = consumer::build(&config);
    let controller = Controller::new(producer, consumer, config.every());

    controller.run().await
}

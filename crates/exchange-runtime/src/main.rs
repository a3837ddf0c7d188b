//! `exchange`: publish an event to, or consume events from, the message
//! distributor.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use exchange_client::{init_tracing, ExchangeConfig, PublishOptions, TelemetryConfig};
use exchange_runtime::{load_event, ExchangeRuntime};

/// Authenticated publish/consume client for the message distributor.
///
/// Settings come from `EXCHANGE_*` environment variables.
#[derive(Parser, Debug)]
#[command(name = "exchange")]
#[command(about = "Publish or consume events on the message distributor")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one event document and wait for the distributor to accept it
    Publish {
        /// Event document (Haendelsesbesked XML)
        file: PathBuf,

        /// Replace the document's BeskedId with a new UUID
        #[arg(long)]
        new_message_id: bool,
    },

    /// Consume events from the configured mailbox
    Consume {
        /// Number of messages to handle (default: consume.messages)
        #[arg(short, long)]
        messages: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let telemetry = TelemetryConfig::from_env();
    init_tracing(&telemetry).context("installing log subscriber")?;

    let config = ExchangeConfig::from_env().context("loading configuration")?;
    let runtime = ExchangeRuntime::from_config(config)?;

    match args.command {
        Command::Publish {
            file,
            new_message_id,
        } => {
            let event = load_event(&file).await?;
            let options = PublishOptions {
                fresh_message_id: new_message_id,
            };
            let receipt = runtime.publish(event, options).await?;
            info!(
                transaction_id = %receipt.transaction_id,
                message_id = %receipt.message_id,
                attempts = receipt.attempts,
                "Event accepted"
            );
        }
        Command::Consume { messages } => {
            let report = runtime.consume(messages).await?;
            info!(
                processed = report.processed,
                duplicates = report.duplicates,
                rejected = report.rejected,
                stop_reason = ?report.stop_reason,
                "Consume finished"
            );
        }
    }

    Ok(())
}

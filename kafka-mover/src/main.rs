use std::borrow::Cow;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_mover::config::Config;
use kafka_mover::consume::{run_consume, run_tail, ConsumeRequest, RecordStream};
use kafka_mover::copy::{run_copy, CopyRequest};
use kafka_mover::kafka::client::KafkaClient;
use kafka_mover::lag::{run_lag, run_topic_offsets};
use kafka_mover::migrator::{run_move_partition, MoveRequest};
use kafka_mover::types::Record;

/// Move Kafka records between topics and partitions, and report consumer lag.
///
/// Connection settings come from the environment (KAFKA_HOSTS, KAFKA_TLS,
/// KAFKA_SASL_*). Records and reports are written to stdout as JSON lines,
/// logs go to stderr.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print records of one or more topics
    Consume {
        #[arg(required = true)]
        topics: Vec<String>,

        /// Consumer group; a temporary group is used (and deleted) when omitted
        #[arg(long)]
        group: Option<String>,

        #[command(flatten)]
        position: Position,

        #[command(flatten)]
        selection: Selection,
    },

    /// Follow new records of a topic
    Tail {
        topic: String,

        #[arg(long)]
        key_filter: Option<String>,
    },

    /// Copy records from one topic to another
    Cp {
        source: String,
        destination: String,

        #[command(flatten)]
        position: Position,

        /// Copy every partition from this offset, up to the watermark at start
        #[arg(long)]
        begin_offset: Option<i64>,

        /// Stop each partition before this offset
        #[arg(long, requires = "begin_offset")]
        end_offset: Option<i64>,

        #[command(flatten)]
        selection: Selection,
    },

    #[command(subcommand)]
    Topics(TopicCommands),

    #[command(subcommand)]
    Groups(GroupCommands),
}

#[derive(Subcommand)]
enum TopicCommands {
    /// Move every record of a partition to another partition of the same topic
    MovePartition {
        topic: String,

        #[arg(long)]
        source_partition: i32,

        #[arg(long)]
        dest_partition: i32,

        /// Not supported, fails before touching the cluster
        #[arg(long)]
        delete_source: bool,
    },

    /// Show low and high watermarks of every partition
    Offsets { topic: String },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Show how far a consumer group is behind
    Lag {
        group: String,

        /// Restrict to these topics; defaults to every topic the group committed on
        #[arg(long = "topic")]
        topics: Vec<String>,
    },
}

#[derive(Args)]
struct Position {
    #[arg(long, conflicts_with = "from_latest")]
    from_beginning: bool,

    #[arg(long)]
    from_latest: bool,
}

#[derive(Args)]
struct Selection {
    /// Stop after this many records (after filtering)
    #[arg(long)]
    limit: Option<u64>,

    /// `prefix*`, `*suffix`, `*part*`, an exact key, or `<null>` for keyless records
    #[arg(long)]
    key_filter: Option<String>,
}

#[derive(Serialize)]
struct RecordView<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    key: Option<Cow<'a, str>>,
    value: Option<Cow<'a, str>>,
    headers: Vec<(&'a str, Option<Cow<'a, str>>)>,
    timestamp: Option<String>,
}

impl<'a> From<&'a Record> for RecordView<'a> {
    fn from(record: &'a Record) -> Self {
        Self {
            topic: &record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key.as_deref().map(String::from_utf8_lossy),
            value: record.value.as_deref().map(String::from_utf8_lossy),
            headers: record
                .headers
                .iter()
                .map(|h| (h.name.as_str(), h.value.as_deref().map(String::from_utf8_lossy)))
                .collect(),
            timestamp: record
                .timestamp
                .and_then(chrono::DateTime::from_timestamp_millis)
                .map(|ts| ts.to_rfc3339()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Print every record; a print failure stops the stream and waits for its cleanup.
async fn print_records(mut records: RecordStream, cancel: CancellationToken) -> Result<()> {
    while let Some(record) = records.next().await {
        let record = record.context("Failed to read records")?;
        if let Err(e) = print_json(&RecordView::from(&record)) {
            cancel.cancel();
            while records.next().await.is_some() {}
            return Err(e);
        }
    }
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, stopping"),
            _ = sigterm.recv() => info!("received SIGTERM, stopping"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    let cli = Cli::parse();

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    let client = KafkaClient::new(&config).context("Invalid Kafka client configuration")?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    match cli.command {
        Commands::Consume {
            topics,
            group,
            position,
            selection,
        } => {
            let request = ConsumeRequest {
                topics,
                group,
                from_beginning: position.from_beginning,
                from_latest: position.from_latest,
                limit: selection.limit,
                key_filter: selection.key_filter,
            };
            let records = run_consume(&client, &config, &request, cancel.clone()).await?;
            print_records(records, cancel).await?;
        }
        Commands::Tail { topic, key_filter } => {
            let records = run_tail(&client, &config, &topic, key_filter, cancel.clone()).await?;
            print_records(records, cancel).await?;
        }
        Commands::Cp {
            source,
            destination,
            position,
            begin_offset,
            end_offset,
            selection,
        } => {
            let request = CopyRequest {
                source_topic: source,
                dest_topic: destination,
                from_beginning: position.from_beginning,
                from_latest: position.from_latest,
                begin_offset,
                end_offset,
                limit: selection.limit,
                key_filter: selection.key_filter,
            };
            let report = run_copy(&client, &config, &request, cancel)
                .await
                .context("Copy failed")?;
            print_json(&report)?;
        }
        Commands::Topics(TopicCommands::MovePartition {
            topic,
            source_partition,
            dest_partition,
            delete_source,
        }) => {
            let request = MoveRequest {
                topic,
                source_partition,
                dest_partition,
                delete_source,
            };
            let report = run_move_partition(&client, &config, &request, cancel)
                .await
                .context("Partition move failed")?;
            if !report.is_complete() {
                warn!("Moved {} of {} records", report.moved, report.expected);
            }
            print_json(&report)?;
        }
        Commands::Topics(TopicCommands::Offsets { topic }) => {
            let offsets = run_topic_offsets(&client, &topic).await?;
            print_json(&offsets)?;
        }
        Commands::Groups(GroupCommands::Lag { group, topics }) => {
            let report = run_lag(&client, &group, &topics).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}

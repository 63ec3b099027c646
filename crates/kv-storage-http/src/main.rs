use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kv_storage_core::{StorageBucket, StorageService};
use kv_storage_http::{Config, HttpStorageWorker};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kv-storage")]
#[command(about = "Inspect and edit the key-value records of a principal")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the buckets of the manifest
    List {
        /// Only buckets carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// Print the value of a record
    Get { key: String },
    /// Create a record from a JSON value
    Create { value: String },
    /// Overwrite a record with a JSON value
    Save {
        key: String,
        value: String,
        /// Replace the record's tags before saving
        #[arg(long)]
        tags: Option<String>,
    },
    /// Delete a record
    Delete { key: String },
}

fn describe(bucket: &StorageBucket) -> serde_json::Value {
    json!({
        "key": bucket.key(),
        "tags": bucket.tags(),
        "version": bucket.manifest_version(),
    })
}

fn lookup(service: &StorageService, key: &str) -> anyhow::Result<StorageBucket> {
    service
        .get(key)
        .with_context(|| format!("No record with key {}", key))
}

fn parse_value(raw: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON value: {}", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("Using key-value API at {}", cli.config.base_url);
    info!("  User: {}", cli.config.user_id);

    let worker = Arc::new(HttpStorageWorker::from_config(cli.config)?);
    let service = StorageService::new(worker);
    service.refresh().wait().await?;

    let output = match cli.command {
        Command::List { tag } => {
            let buckets = match tag {
                Some(tag) => service.find_all(&tag),
                None => service.all(),
            };
            serde_json::Value::Array(buckets.iter().map(describe).collect())
        }
        Command::Get { key } => {
            let bucket = lookup(&service, &key)?;
            let value = bucket.value().wait().await?;
            json!({
                "key": bucket.key(),
                "version": bucket.observed_version(),
                "value": value,
            })
        }
        Command::Create { value } => {
            let bucket = service.create(parse_value(&value)?).wait().await?;
            describe(&bucket)
        }
        Command::Save { key, value, tags } => {
            let bucket = lookup(&service, &key)?;
            if let Some(tags) = tags {
                bucket.set_tags(tags);
            }
            let version = bucket.save(parse_value(&value)?).wait().await?;
            json!({ "key": bucket.key(), "version": version })
        }
        Command::Delete { key } => {
            lookup(&service, &key)?.delete().wait().await?;
            info!("Deleted {}", key);
            json!({ "key": key, "deleted": true })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

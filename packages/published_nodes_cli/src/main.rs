//! Operator tool for the published nodes file
//!
//! Reads, writes, seeds and watches the document through the same provider
//! the publisher uses, so atomic replace and change detection behave the same.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use published_nodes::{
    ProviderConfig, PublishedNodesBackend, PublishedNodesDocument, PublishedNodesProvider,
    PublishedNodesProviderFactory,
};

#[derive(Parser)]
#[command(name = "published-nodes", version, about = "Inspect and maintain a published nodes file")]
struct Cli {
    /// Path of the published nodes file
    #[arg(short, long, env = "PUBLISHED_NODES_FILE", global = true)]
    file: Option<PathBuf>,

    /// JSON provider configuration; takes precedence over --file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Treat a missing file as an empty node list and create it
    #[arg(long, global = true)]
    create_if_missing: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the document to stdout
    Read,
    /// Replace the document atomically
    Write {
        /// Read new content from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Exit with status 0 if the document exists, 1 otherwise
    Exists,
    /// Create the configured default document if none exists
    Seed,
    /// Print size, modification time and digest as JSON
    Info,
    /// Print one JSON line per change until interrupted
    Watch {
        /// Stop after this many events
        #[arg(long)]
        count: Option<u64>,
    },
}

#[derive(Serialize)]
struct InfoReport {
    path: String,
    exists: bool,
    len: u64,
    modified: Option<DateTime<Utc>>,
    digest: Option<String>,
}

#[derive(Serialize)]
struct ChangeReport {
    sequence: u64,
    observed_at: DateTime<Utc>,
    exists: bool,
    digest: Option<String>,
}

impl Cli {
    fn provider_config(&self) -> Result<ProviderConfig> {
        let config = match (&self.config, &self.file) {
            (Some(path), _) => ProviderConfig::from_json_file(path)?,
            (None, Some(file)) => ProviderConfig::for_file(file),
            (None, None) => ProviderConfig::from_env()?,
        };

        Ok(if self.create_if_missing {
            config.create_if_missing()
        } else {
            config
        })
    }
}

/// Digest of the current content, or `None` when there is nothing to read
async fn current_digest(provider: &PublishedNodesBackend) -> Result<Option<String>> {
    match provider.read().await {
        Ok(document) => Ok(Some(document.digest_hex())),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn run(cli: Cli, config: &ProviderConfig, provider: &PublishedNodesBackend) -> Result<bool> {
    match cli.command {
        Command::Read => {
            let document = provider.read().await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(document.as_bytes()).await?;
            stdout.flush().await?;
        }
        Command::Write { input } => {
            let content = match input {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buffer = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buffer).await?;
                    buffer
                }
            };
            provider.write(PublishedNodesDocument::from(content)).await?;
        }
        Command::Exists => return provider.exists().await.map_err(Into::into),
        Command::Seed => {
            if provider.seed_if_absent(config.default_document()).await? {
                log::info!("Created {}", provider.handle());
            } else {
                log::info!("{} already exists", provider.handle());
            }
        }
        Command::Info => {
            let info = provider.info().await?;
            let report = InfoReport {
                path: provider.handle().to_string(),
                exists: info.exists,
                len: info.len,
                modified: info.modified,
                digest: current_digest(provider).await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Watch { count } => {
            let mut subscription = provider.watch().await?;
            let mut seen = 0u64;

            loop {
                let item = tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    item = subscription.next() => item,
                };

                let event = match item {
                    Some(event) => event?,
                    None => break,
                };
                let report = ChangeReport {
                    sequence: event.sequence,
                    observed_at: event.observed_at,
                    exists: provider.exists().await?,
                    digest: current_digest(provider).await?,
                };
                println!("{}", serde_json::to_string(&report)?);

                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }

            subscription.cancel();
        }
    }

    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.provider_config()?;
    let provider = PublishedNodesProviderFactory::create(&config)
        .await
        .context("Failed to open published nodes provider")?;

    let outcome = run(cli, &config, &provider).await;
    provider.close().await?;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use feedsync_adapters::PgContentStore;
use feedsync_core::{FeedDraft, ImportInterval, MappingRuleInput, Visibility};
use feedsync_sync::{load_feed_seed, source_fields, SyncConfig, SyncEngine, DEFAULT_LOG_LIMIT};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "feedsync")]
#[command(about = "RSS feed sync engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the scheduler and the operator API until interrupted.
    Daemon,
    /// Serve the operator API without firing scheduled imports.
    Serve,
    /// Apply content store migrations.
    Migrate,
    /// Import one feed now.
    Run {
        feed_id: String,
        /// Run even when the feed is disabled and skip the feed cache.
        #[arg(long)]
        force: bool,
    },
    #[command(subcommand)]
    Feeds(FeedCommands),
    /// Show recent import history.
    Logs {
        #[arg(long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
        #[arg(long)]
        feed: Option<String>,
        /// Delete all history instead of listing it.
        #[arg(long)]
        clear: bool,
    },
    /// Fetch a feed and show its first items without importing.
    Preview { url: String },
    /// List source fields and the targets a collection accepts.
    Fields {
        #[arg(default_value = "post")]
        collection: String,
    },
}

#[derive(Debug, Subcommand)]
enum FeedCommands {
    Ls,
    Add {
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        collection: Option<String>,
        #[arg(long)]
        visibility: Option<Visibility>,
        #[arg(long)]
        interval: Option<ImportInterval>,
        #[arg(long)]
        max_items: Option<u32>,
        #[arg(long)]
        enabled: bool,
        /// `source:target_kind:target_key`, repeatable.
        #[arg(long = "map", value_parser = parse_mapping)]
        mappings: Vec<MappingRuleInput>,
    },
    Rm {
        feed_id: String,
    },
    Toggle {
        feed_id: String,
    },
    /// Save every feed listed in a YAML seed file.
    Import {
        path: PathBuf,
    },
}

fn parse_mapping(raw: &str) -> Result<MappingRuleInput, String> {
    let mut parts = raw.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(source), Some(kind), Some(key)) if !key.trim().is_empty() => {
            let input = MappingRuleInput {
                source: source.to_string(),
                target_kind: kind.to_string(),
                target_key: key.to_string(),
            };
            input
                .to_rule()
                .map(|_| input.clone())
                .ok_or_else(|| format!("unknown source or target kind in {raw:?}"))
        }
        _ => Err(format!("expected source:target_kind:target_key, got {raw:?}")),
    }
}

/// Tracing per `RUST_LOG` (default `info`); `FEEDSYNC_LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let builder = tracing_subscriber::registry().with(filter);

    match std::env::var("FEEDSYNC_LOG_FORMAT").as_deref() {
        Ok("json") => {
            let _ = builder.with(fmt_layer.json().flatten_event(true)).try_init();
        }
        _ => {
            let _ = builder.with(fmt_layer.compact()).try_init();
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Daemon);
    if let Commands::Migrate = command {
        let store = PgContentStore::connect(&config.database_url)
            .await
            .context("connecting to content store")?;
        store.migrate().await.context("running migrations")?;
        println!("migrations applied");
        return Ok(());
    }

    let (engine, mut jobs) = SyncEngine::connect(&config).await?;
    let engine = Arc::new(engine);

    match command {
        Commands::Daemon => {
            if config.scheduler_enabled {
                jobs.start().await.context("starting scheduler")?;
                let report = engine.scheduler.reconcile_all().await?;
                info!(installed = report.installed.len(), "scheduler started");
            } else {
                info!("scheduler disabled by FEEDSYNC_SCHEDULER_ENABLED");
            }
            tokio::select! {
                served = feedsync_web::serve(engine.clone(), config.web_port) => served?,
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }
            jobs.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            feedsync_web::serve(engine, config.web_port).await?;
        }
        Commands::Migrate => {}
        Commands::Run { feed_id, force } => {
            let result = engine.pipeline.run(&feed_id, force).await;
            print_json(&result)?;
            if !result.success {
                bail!("run failed: {}", result.message);
            }
        }
        Commands::Feeds(FeedCommands::Ls) => {
            for feed in engine.repo.list().await? {
                println!(
                    "{}\t{}\t{}\t{}\tlast_run={} ({})",
                    feed.id,
                    if feed.enabled { "enabled" } else { "disabled" },
                    feed.interval.key(),
                    feed.source_url,
                    feed.last_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into()),
                    feed.last_run_status,
                );
            }
        }
        Commands::Feeds(FeedCommands::Add {
            url,
            name,
            collection,
            visibility,
            interval,
            max_items,
            enabled,
            mappings,
        }) => {
            let saved = engine
                .create_feed(FeedDraft {
                    id: None,
                    name,
                    source_url: url,
                    target_collection: collection,
                    target_visibility: visibility,
                    owner: None,
                    interval,
                    max_items_per_run: max_items,
                    enabled,
                    field_mappings: mappings,
                })
                .await?;
            print_json(&saved)?;
        }
        Commands::Feeds(FeedCommands::Rm { feed_id }) => {
            if !engine.delete_feed(&feed_id).await? {
                bail!("feed {feed_id} not found");
            }
            println!("deleted {feed_id}");
        }
        Commands::Feeds(FeedCommands::Toggle { feed_id }) => {
            let feed = engine.toggle_feed(&feed_id).await?;
            println!("{} {}", feed.id, if feed.enabled { "enabled" } else { "disabled" });
        }
        Commands::Feeds(FeedCommands::Import { path }) => {
            let drafts = load_feed_seed(&path)?;
            let saved = engine.import_seed(drafts).await?;
            println!("imported {} feeds from {}", saved.len(), path.display());
        }
        Commands::Logs { limit, feed, clear } => {
            if clear {
                engine.logger.clear().await?;
                println!("history cleared");
            } else {
                print_json(&engine.logger.recent(limit, feed.as_deref()).await?)?;
            }
        }
        Commands::Preview { url } => {
            let preview = engine
                .pipeline
                .preview(&url)
                .await
                .map_err(|err| anyhow!("preview of {url} failed: {err}"))?;
            print_json(&preview)?;
        }
        Commands::Fields { collection } => {
            print_json(&source_fields())?;
            print_json(&engine.mapper.target_fields(&collection).await)?;
        }
    }

    Ok(())
}

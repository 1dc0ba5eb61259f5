use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genstream::config::{Feature, GenstreamConfig};
use genstream::{CommandTransport, SessionEvent, SessionStatus, StreamIngestionController};
use genstream_cache::{CacheStore, FileBackend, PersistedKeyValueAdapter};

#[derive(Parser)]
#[command(name = "genstream")]
#[command(about = "Cached streaming generations", long_about = None)]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a generation, replaying it from the cache when possible
    Generate {
        #[arg(short, long, value_enum)]
        feature: Feature,

        /// Request configuration as JSON
        #[arg(long, default_value = "{}")]
        request: String,

        /// Context as JSON, or @path to read it from a file
        #[arg(long, default_value = "{}")]
        context: String,

        /// Generator command, overriding the config file
        #[arg(long)]
        program: Option<String>,
    },

    /// List recorded generation failures
    Errors {
        #[arg(short, long, value_enum)]
        feature: Feature,
    },

    /// Drop persisted results of a feature
    Clear {
        #[arg(short, long, value_enum)]
        feature: Feature,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "genstream=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = GenstreamConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate {
            feature,
            request,
            context,
            program,
        } => {
            let request = parse_json(&request).context("Invalid --request")?;
            let context = parse_json(&context).context("Invalid --context")?;
            generate(&config, feature, &request, &context, program).await?;
        }

        Commands::Errors { feature } => {
            let adapter = open_adapter(&config, feature)?;
            let errors = adapter.errors(&feature.error_namespace(), &config.owner_id);
            if errors.is_empty() {
                println!("No recorded errors for {}", feature.namespace());
            }
            for record in errors {
                let when = chrono::DateTime::from_timestamp_millis(record.timestamp)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| record.timestamp.to_string());
                println!("{}  {}  {}", when, record.context_hash, record.message);
            }
        }

        Commands::Clear { feature } => {
            let adapter = open_adapter(&config, feature)?;
            let removed = adapter.clear_all(feature.namespace(), &config.owner_id);
            println!("Removed {} persisted entries for {}", removed, feature.namespace());
        }
    }

    Ok(())
}

async fn generate(
    config: &GenstreamConfig,
    feature: Feature,
    request: &Value,
    context: &Value,
    program: Option<String>,
) -> Result<()> {
    let controller_config = config.controller_config(feature);
    if let Err(e) = controller_config.validate() {
        bail!("Invalid configuration: {}", e);
    }

    let mut transport = CommandTransport::new(program.unwrap_or_else(|| config.generator.program.clone()))
        .with_args(config.generator.args.clone());
    if let Ok(dir) = std::env::current_dir() {
        transport = transport.with_working_dir(dir);
    }

    let cache = Arc::new(CacheStore::new(feature.cache_config()));
    let controller = Arc::new(
        StreamIngestionController::new(controller_config, cache)
            .with_transport(Arc::new(transport))
            .with_persisted(open_adapter(config, feature)?),
    );

    let mut events = controller.subscribe();
    let id = controller.start(request, context).await;

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = events.recv().await {
            if event.session_id() != id {
                continue;
            }
            if let SessionEvent::Chunk { text, .. } = &event {
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    let snapshot = controller.wait(id).await?;
    let _ = printer.await;
    println!();

    match snapshot.status {
        SessionStatus::Success => {
            let artifact = serde_json::to_string_pretty(&snapshot.artifact)?;
            println!("{}", artifact);
        }
        status => {
            eprintln!(
                "Session {} ended as {}: {}",
                id,
                status,
                snapshot.error.as_deref().unwrap_or("no details")
            );
        }
    }

    let stats = controller.cache_stats().await;
    println!(
        "Source: {:?}  Cache: {} entries (~{} bytes each), {} hits, {} misses",
        snapshot.source,
        stats.entries,
        stats.avg_entry_size(),
        stats.hits,
        stats.misses
    );

    Ok(())
}

fn open_adapter(config: &GenstreamConfig, feature: Feature) -> Result<PersistedKeyValueAdapter> {
    let backend = FileBackend::new(config.store_dir.clone())
        .with_context(|| format!("Failed to open store at {:?}", config.store_dir))?;
    Ok(PersistedKeyValueAdapter::new(
        Arc::new(backend),
        feature.cache_config().default_ttl,
    ))
}

fn parse_json(arg: &str) -> Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

//! `komo` — the Komorebi CLI.
//!
//! `komo serve` runs the full service: worker pool, MCP registry, HTTP
//! API with SSE. The other commands are one-shot conveniences against the
//! same database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use komorebi::app::App;
use komorebi::config::{load_config, Config};
use komorebi::llm::HttpLlmClient;
use komorebi::models::ChunkDraft;
use komorebi::similarity::find_related;
use komorebi::store::sqlite::SqliteStore;
use komorebi::store::Store;
use komorebi::{db, migrate, server};

#[derive(Parser)]
#[command(
    name = "komo",
    about = "Komorebi — capture at typing speed, compact in the background",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "komo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init,
    /// Run the service: workers, MCP servers, HTTP API
    Serve,
    /// Capture a single chunk
    Capture {
        /// Chunk content
        content: String,
        /// Project id to attach the chunk to
        #[arg(long)]
        project: Option<uuid::Uuid>,
        /// Tags, repeatable
        #[arg(long)]
        tag: Vec<String>,
    },
    /// Show chunks related to the given chunk id
    Related {
        id: uuid::Uuid,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Show pipeline counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized");
        }
        Command::Serve => {
            let app = Arc::new(start_app(config, true).await?);
            server::run_server(app).await?;
        }
        Command::Capture { content, project, tag } => {
            let app = start_app(config, false).await?;
            let chunk = app
                .capture
                .capture(ChunkDraft {
                    content,
                    project_id: project,
                    tags: tag,
                    ..Default::default()
                })
                .await?;
            println!("captured {} ({})", chunk.id, chunk.status);
            // Graceful shutdown lets the in-flight summary land when the
            // LLM answers quickly; otherwise the next serve picks it up.
            app.shutdown().await;
        }
        Command::Related { id, top_k } => {
            let store = open_store(&config).await?;
            let related = find_related(&store, id, top_k).await?;
            if related.is_empty() {
                println!("no related chunks");
            }
            for item in related {
                println!(
                    "{}  {:.3}  [{}]",
                    item.id,
                    item.similarity,
                    item.shared_terms.join(", ")
                );
            }
        }
        Command::Stats => {
            let store = open_store(&config).await?;
            let counts = store.count_by_status().await?;
            println!("Komorebi — Pipeline Stats");
            println!("=========================");
            let mut total = 0;
            for (status, count) in &counts {
                println!("  {:<10} {}", status.to_string(), count);
                total += count;
            }
            println!("  {:<10} {}", "total", total);
            if let Some(oldest) = store.oldest_inbox().await? {
                println!("  oldest inbox: {} ({})", oldest.id, oldest.created_at);
            }
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    Ok(SqliteStore::new(pool))
}

async fn start_app(config: Config, with_mcp: bool) -> Result<App> {
    let store = Arc::new(open_store(&config).await?);
    let llm = Arc::new(HttpLlmClient::new(&config.llm)?);
    Ok(App::start(config, store, llm, with_mcp).await?)
}

// Command line entry point: API server and one-shot ingestion commands

use clap::Parser;
use gtfs_atlas::config::Config;
use gtfs_atlas::error::{AtlasError, Result};
use gtfs_atlas::ingest::Ingestor;
use gtfs_atlas::progress::LogSink;
use gtfs_atlas::registry::{Feed, FeedRegistry};
use gtfs_atlas::server::run_server;
use gtfs_atlas::store::{DocumentStore, FileStore, MemoryStore, Sessions};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Serve the feeds API over HTTP
    Serve {
        #[arg(short, long)]
        bind: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Keep everything in memory instead of the data directory
        #[arg(long)]
        memory: bool,
    },
    /// Register a feed if needed and ingest its GTFS archive
    Sync {
        #[arg(long)]
        id: String,
        #[arg(long)]
        url: String,
        /// Display name, defaults to the id
        #[arg(long)]
        name: Option<String>,
    },
    /// Recompute route geometry from the stored tables
    Derive {
        #[arg(long)]
        id: String,
    },
    /// List registered feeds
    Feeds,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    match run(args.cmd, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn open_store(config: &Config, memory: bool) -> Arc<dyn DocumentStore> {
    if memory {
        info!("using in-memory store, nothing will be persisted");
        Arc::new(MemoryStore::new())
    } else {
        info!(dir = %config.data_dir.display(), "using file store");
        Arc::new(FileStore::new(config.data_dir.clone()))
    }
}

async fn run(cmd: Command, mut config: Config) -> Result<()> {
    match cmd {
        Command::Serve { bind, port, memory } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let store = open_store(&config, memory);
            run_server(config, store).await
        }
        Command::Sync { id, url, name } => {
            let store = open_store(&config, false);
            let registry = FeedRegistry::new(Arc::clone(&store))?;

            let feed = match registry.get(&id).await {
                Ok(feed) if feed.url == url => feed,
                Ok(_) => registry.update_url(&id, &url).await?,
                Err(AtlasError::FeedNotFound(_)) => {
                    registry
                        .insert(Feed {
                            name: name.unwrap_or_else(|| id.clone()),
                            id,
                            url,
                        })
                        .await?
                }
                Err(e) => return Err(e),
            };

            let ingestor = Ingestor::new(Arc::new(Sessions::new(store)), &config)?;
            let report = ingestor
                .ingest(&feed.id, &feed.url, &LogSink::new(&feed.id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Derive { id } => {
            let store = open_store(&config, false);
            let feed = FeedRegistry::new(Arc::clone(&store))?.get(&id).await?;

            let ingestor = Ingestor::new(Arc::new(Sessions::new(store)), &config)?;
            let routes = ingestor
                .derive_only(&feed.id, &LogSink::new(&feed.id))
                .await?;
            println!("{} routes derived for {}", routes, feed.id);
            Ok(())
        }
        Command::Feeds => {
            let store = open_store(&config, false);
            for feed in FeedRegistry::new(store)?.list().await? {
                println!("{}\t{}\t{}", feed.id, feed.name, feed.url);
            }
            Ok(())
        }
    }
}

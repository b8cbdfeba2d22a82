mod cache;
mod config;
mod net;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use net::{HttpNetwork, Request, Response};
use worker::{FetchOutcome, OfflineCacheManager, Strategy};

type Manager = OfflineCacheManager<SqliteStorage, HttpNetwork>;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline app-shell cache with versioned generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./shellcache.yaml or $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin that relative URLs resolve against
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Cache generation to use as the live one
  #[arg(long, global = true)]
  generation: Option<String>,

  /// Fetch strategy
  #[arg(long, global = true, value_enum)]
  strategy: Option<Strategy>,

  /// Cache database path
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell into the current generation
  Install,
  /// Delete every generation except the current one
  Activate,
  /// Install, then activate
  Update,
  /// Answer a request the way an intercepted page request would be answered
  Fetch {
    /// URL, absolute or relative to the origin
    url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List stored generations
  Caches,
}

/// Initialize tracing: stderr plus a daily log file under the data directory.
fn init_tracing() -> Result<WorkerGuard> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=shellcache=debug)
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellcache=info"));

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("shellcache")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "shellcache.log"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing()?;

  // Load configuration, then apply command line overrides
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(generation) = args.generation {
    config.cache.generation = generation;
  }
  if let Some(strategy) = args.strategy {
    config.cache.strategy = strategy;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }
  config.validate()?;

  let storage = SqliteStorage::open_at(&config.database_path()?)?;
  let manager = OfflineCacheManager::new(
    config.origin_url()?,
    config.cache.clone(),
    storage,
    HttpNetwork::new()?,
  );
  info!(
    generation = %config.cache.generation,
    strategy = %config.cache.strategy,
    origin = %config.origin,
    "Cache manager ready"
  );

  match args.command {
    Command::Install => {
      let count = manager.install().await?;
      println!("Installed {} entries into {}", count, config.cache.generation);
    }
    Command::Activate => print_deleted(&manager.activate().await?),
    Command::Update => {
      let count = manager.install().await?;
      println!("Installed {} entries into {}", count, manager.config().generation);
      print_deleted(&manager.activate().await?);
      info!(state = ?manager.state(), "Update complete");
    }
    Command::Fetch {
      url,
      method,
      output,
    } => {
      let request = Request::parse(&method, &url, &config.origin_url()?)?;
      let result = fetch(&manager, &request, output.as_deref()).await;
      // Background cache writes must land before the process exits
      manager.settle().await;
      result?;
    }
    Command::Caches => {
      for generation in manager.storage().generations()? {
        let marker = if generation.name == config.cache.generation {
          "*"
        } else {
          " "
        };
        println!(
          "{} {}  {} entries  created {}",
          marker,
          generation.name,
          generation.entries,
          generation.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
  }

  Ok(())
}

fn print_deleted(deleted: &[String]) {
  if deleted.is_empty() {
    println!("No old caches to delete");
  }
  for name in deleted {
    println!("Deleted {}", name);
  }
}

async fn fetch(manager: &Manager, request: &Request, output: Option<&Path>) -> Result<()> {
  match manager.handle_fetch(request).await? {
    FetchOutcome::Passthrough => {
      let response = manager.passthrough(request).await?;
      write_response(&response, "passthrough", output)
    }
    FetchOutcome::Responded(result) => {
      write_response(&result.data, &result.source.to_string(), output)
    }
    FetchOutcome::Unresolved { reason } => {
      Err(eyre!("No response for {} {}: {}", request.method, request.url, reason))
    }
  }
}

fn write_response(response: &Response, source: &str, output: Option<&Path>) -> Result<()> {
  eprintln!(
    "{} {} [{}] {} sha256={}",
    response.status,
    response.url,
    source,
    response.header("content-type").unwrap_or("-"),
    response.digest()
  );

  match output {
    Some(path) => std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout()
      .write_all(&response.body)
      .map_err(|e| eyre!("Failed to write response body: {}", e))?,
  }

  Ok(())
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use hubsync::github::handlers::default_registry;
use hubsync::jobs::{FetchPriority, Fetched};
use hubsync::{
  CacheStore, Config, Database, GitHubClient, JobRegistry, NoopStore, ReadRequest, SqliteJobTable,
  SqliteStore, SyncEngine,
};

#[derive(Parser, Debug)]
#[command(name = "hubsync")]
#[command(about = "Local-first sync and caching engine for GitHub data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hubsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User id owning the cache namespace and job queue
  #[arg(short, long, default_value = "local")]
  user: String,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a resource through the read path and print it as JSON
  Fetch {
    /// Registered job type (e.g. repo, issue, issue_comments, user_profile)
    job_type: String,
    /// Payload as JSON (e.g. '{"owner":"rust-lang","repo":"rust"}')
    payload: String,
    /// Bypass the cache and fetch upstream first
    #[arg(long)]
    refresh: bool,
  },
  /// Drain pending background jobs for the user
  Drain,
  /// Delete cached entries under a key prefix
  Invalidate {
    /// Cache key prefix (e.g. 'issue:rust-lang/rust/5')
    prefix: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let db = Arc::new(Database::open()?);
  let jobs = Arc::new(SqliteJobTable::new(Arc::clone(&db)));
  let client = Arc::new(GitHubClient::new(&config)?);
  let registry = Arc::new(default_registry(client));

  if config.cache.enabled {
    let store = Arc::new(SqliteStore::new(db));
    let engine = SyncEngine::new(store, jobs, Arc::clone(&registry), &config);
    run(args, engine, registry).await
  } else {
    let engine = SyncEngine::new(Arc::new(NoopStore), jobs, Arc::clone(&registry), &config);
    run(args, engine, registry).await
  }
}

async fn run<S: CacheStore + 'static>(
  args: Args,
  engine: SyncEngine<S, SqliteJobTable>,
  registry: Arc<JobRegistry>,
) -> Result<()> {
  match args.command {
    Command::Fetch {
      job_type,
      payload,
      refresh,
    } => {
      let payload: Value = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let spec = registry
        .get(&job_type)
        .ok_or_else(|| eyre!("Unknown job type: {}", job_type))?;
      let cache_key = spec.handler.cache_key(&payload)?;

      let mut request = ReadRequest::new(
        args.user.as_str(),
        job_type.as_str(),
        cache_key.as_str(),
        payload.clone(),
        Value::Null,
      );
      if refresh {
        request = request.forced();
      }

      let handler = Arc::clone(&spec.handler);
      let data = engine
        .read(request, move || async move {
          match handler.fetch(&payload, None, FetchPriority::Foreground).await? {
            Fetched::Fresh { data, .. } => Ok(data),
            Fetched::NotModified => Err(eyre!("Unexpected 304 on unconditional fetch")),
          }
        })
        .await?;

      println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Command::Drain => {
      let mut total = 0;
      loop {
        let processed = engine.drainer().drain_once(&args.user).await?;
        total += processed;
        if processed == 0 {
          break;
        }
      }
      println!("Processed {} jobs", total);
    }
    Command::Invalidate { prefix } => {
      let deleted = engine.invalidate_by_prefix(&args.user, &prefix)?;
      println!("Invalidated {} entries", deleted);
    }
  }

  Ok(())
}

/// Log to a file so CLI output stays clean; level via RUST_LOG.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("hubsync");
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::never(dir, "hubsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

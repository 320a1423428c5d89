use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swrcache::api::{HttpCaller, NetworkCaller, PortalClient};
use swrcache::cache::{CacheEntry, SqliteStorage};
use swrcache::config::Config;
use swrcache::sync::MARKER_PREFIX;
use swrcache::{CallError, Context, QueryOptions, TtlStore};

#[derive(Parser, Debug)]
#[command(name = "swrcache")]
#[command(about = "Inspect and drive the shared stale-while-revalidate cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swrcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Storage file to use instead of the configured one
  #[arg(short, long)]
  storage: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List cached keys and whether they are still fresh
  Keys {
    /// Only keys starting with this prefix
    prefix: Option<String>,
  },
  /// Print one cached value
  Get {
    key: String,
    /// Print the value even if it expired
    #[arg(long)]
    stale: bool,
  },
  /// Remove cached keys (all of them without a prefix)
  Clear { prefix: Option<String> },
  /// Tell other contexts that a class of data changed
  Publish { kind: String },
  /// Print signals published by other contexts until interrupted
  Watch {
    #[arg(required = true)]
    kinds: Vec<String>,
  },
  /// Run one query cache-then-network against the configured API
  Fetch {
    action: String,
    /// Parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,
    /// Serve an expired cache entry while refreshing
    #[arg(long)]
    allow_stale: bool,
  },
  /// Prefetch the dashboard, case and client lists
  Warm,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(storage) = args.storage {
    config.storage.path = Some(storage);
  }

  let _log_guard = swrcache::logging::init(&config.log)?;

  let storage = Arc::new(SqliteStorage::open_at(&config.storage_path()?)?);
  let ctx = Context::new(&config, storage, caller(&config)?, None);

  run(&ctx, args.command).await
}

/// Network caller for the configured API, or one that always fails offline.
fn caller(config: &Config) -> Result<Arc<dyn NetworkCaller>> {
  match &config.api.url {
    Some(url) => {
      let caller = HttpCaller::new(url, Duration::from_secs(config.api.timeout_secs))?
        .with_token(Config::api_token());
      Ok(Arc::new(caller))
    }
    None => Ok(Arc::new(|_action: String, _params: Value| async {
      Err::<Value, _>(CallError::Network("no api.url configured".to_string()))
    })),
  }
}

/// One `keys` output line: the key, then its freshness or `marker`.
fn describe_key(store: &TtlStore, key: &str) -> String {
  if key.starts_with(MARKER_PREFIX) {
    return format!("{}\tmarker", key);
  }

  let now = store.clock().now_ms();
  match store.entry::<Value>(key) {
    Some(CacheEntry { expires_at, .. }) if expires_at >= now => {
      format!("{}\tfresh\t{}s left", key, (expires_at - now) / 1000)
    }
    Some(_) => format!("{}\tstale", key),
    None => format!("{}\t-", key),
  }
}

async fn run(ctx: &Context, command: Command) -> Result<()> {
  let store = ctx.store();

  match command {
    Command::Keys { prefix } => {
      for key in store.keys() {
        if prefix.as_deref().is_some_and(|p| !key.starts_with(p)) {
          continue;
        }
        println!("{}", describe_key(store, &key));
      }
    }
    Command::Get { key, stale } => {
      let value = if stale {
        store.get_stale::<Value>(&key)
      } else {
        store.get::<Value>(&key)
      };
      let value = value.ok_or_else(|| eyre!("No cached value for {}", key))?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Clear { prefix } => {
      store.clear(prefix.as_deref());
    }
    Command::Publish { kind } => {
      let signal = ctx.sync().publish(&kind);
      println!("published {} at {}", signal.kind, signal.timestamp);
    }
    Command::Watch { kinds } => {
      for kind in &kinds {
        if let Some(last) = ctx.sync().last_update(kind) {
          println!("{}\tlast changed at {}", kind, last.timestamp);
        }
        ctx.sync().subscribe(kind, |signal| {
          println!("{}\tchanged at {}", signal.kind, signal.timestamp);
        });
      }
      ctx.start()?;
      tokio::signal::ctrl_c().await?;
      ctx.shutdown();
    }
    Command::Fetch {
      action,
      params,
      allow_stale,
    } => {
      let params: Value =
        serde_json::from_str(&params).map_err(|e| eyre!("Invalid --params JSON: {}", e))?;
      let mut opts = QueryOptions::new();
      opts.allow_stale = allow_stale;

      let result = ctx
        .layer()
        .query(&action, &params, &opts, |data, origin| {
          let text = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
          println!("[{}] {}", origin, text);
        })
        .await;

      match result {
        Ok(outcome) => tracing::debug!(?outcome, "fetch finished"),
        Err(e) if e.is_auth_expired() => {
          return Err(eyre!("Session expired, set a fresh SWRCACHE_API_TOKEN: {}", e))
        }
        Err(e) => return Err(e.into()),
      }
    }
    Command::Warm => {
      let refreshed = PortalClient::new(ctx.layer().clone()).warm_up().await;
      println!("{} queries refreshed", refreshed);
    }
  }

  Ok(())
}

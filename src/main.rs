use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use tabsync::clock::{Clock, SystemClock};
use tabsync::config::Config;
use tabsync::leader::BroadcastChannel;
use tabsync::logging;
use tabsync::offline::HttpReplayer;
use tabsync::store::{SqliteDurableStore, SqliteObjectCache, StorageArea};
use tabsync::tab::{Origin, OriginSettings, Tab};

#[derive(Parser, Debug)]
#[command(name = "tabsync")]
#[command(about = "Cross-tab leader election, conditional caching and offline replay")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tabsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run several tabs in one process and watch them elect a leader
  Simulate {
    #[arg(short, long, default_value_t = 3)]
    tabs: usize,
    #[arg(short, long, default_value_t = 20)]
    seconds: u64,
  },
  /// Show the current leader and offline queue
  Status,
  /// Inspect or drain the offline queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Inspect or clear stored validators
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List queued mutations, oldest first
  List,
  /// Queue a mutation
  Add {
    method: String,
    url: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
  },
  /// Replay queued mutations now
  Sync,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Show the validator stored for a resource
  Show { resource: String },
  /// Clear one resource, or everything when omitted
  Clear { resource: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init_tracing(&config.logging, &config.data_dir()?)?;

  match args.command {
    Command::Simulate { tabs, seconds } => simulate(&config, tabs, seconds).await,
    Command::Status => status(&config),
    Command::Queue { action } => queue(&config, action).await,
    Command::Cache { action } => cache(&config, action).await,
  }
}

async fn simulate(config: &Config, tab_count: usize, seconds: u64) -> Result<()> {
  if tab_count == 0 {
    return Err(eyre!("At least one tab is needed"));
  }

  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let origin = Origin::new(
    StorageArea::new(Arc::new(SqliteDurableStore::open_in_memory()?)),
    Arc::new(SqliteObjectCache::open_in_memory(Arc::clone(&clock))?),
    BroadcastChannel::new(&config.bridge.channel_name, config.bridge.capacity),
    clock,
    Arc::new(HttpReplayer::new(
      config.api.base_url.clone(),
      config.api_timeout(),
    )?),
    OriginSettings {
      timing: config.election_timing(),
      cache_ttl: config.cache_ttl(),
      suspend_when_offline: config.leader.suspend_when_offline,
    },
  );

  let tabs: Vec<Tab> = (0..tab_count).map(|_| origin.open_tab()).collect();
  let mut subscriptions = Vec::with_capacity(tabs.len());
  for tab in &tabs {
    let name = short_id(tab.id());
    subscriptions.push(tab.bridge().subscribe_bridge(move |payload: &Value| {
      println!("[{}] received {}", name, payload);
    }));

    let name = short_id(tab.id());
    let mut changes = tab.election().subscribe_leader_changes();
    tokio::spawn(async move {
      loop {
        match changes.recv().await {
          Ok(change) => println!(
            "[{}] leader is now {}",
            name,
            change.leader_id.as_deref().map(short_id).unwrap_or_else(|| "nobody".into())
          ),
          Err(RecvError::Lagged(_)) => continue,
          Err(RecvError::Closed) => break,
        }
      }
    });
  }

  let timing = config.election_timing();
  let started = Instant::now();
  let deadline = started + Duration::from_secs(seconds);
  let freeze_at = started + Duration::from_secs(seconds / 2);
  let mut frozen: HashSet<String> = HashSet::new();
  let mut ticker = tokio::time::interval(timing.heartbeat_interval);
  let mut seq = 0u64;

  while Instant::now() < deadline {
    ticker.tick().await;

    for tab in tabs.iter().filter(|tab| !frozen.contains(tab.id())) {
      if tab.claim_leadership().is_leader {
        seq += 1;
        tab.bridge().publish_event(json!({ "seq": seq, "from": short_id(tab.id()) }));
      }
    }

    if frozen.is_empty() && Instant::now() >= freeze_at && tabs.len() > 1 {
      if let Some(leader) = tabs.iter().find(|tab| tab.election().is_leader()) {
        println!("[{}] freezing leader", short_id(leader.id()));
        leader.freeze();
        frozen.insert(leader.id().to_string());
      }
    }
  }

  drop(subscriptions);
  Ok(())
}

fn status(config: &Config) -> Result<()> {
  let origin = Origin::open(config)?;
  let tab = origin.open_tab();
  let now = SystemClock.now_ms();

  match tab.current_leader() {
    Some(claim) => println!(
      "leader: {} (heartbeat {} ms ago)",
      claim.leader_id,
      claim.age_ms(now)
    ),
    None => println!("leader: none"),
  }
  println!("pending mutations: {}", tab.queue().get_pending_count());
  Ok(())
}

async fn queue(config: &Config, action: QueueAction) -> Result<()> {
  let origin = Origin::open(config)?;
  let tab = origin.open_tab();

  match action {
    QueueAction::List => {
      for op in tab.queue().pending() {
        println!(
          "{} {} {} (attempts: {}{})",
          op.id,
          op.method,
          op.url,
          op.attempts,
          op.last_error
            .map(|e| format!(", last error: {}", e))
            .unwrap_or_default()
        );
      }
    }
    QueueAction::Add { method, url, body } => {
      let body = body
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| eyre!("Invalid JSON body: {}", e))?;
      let op = tab
        .queue()
        .enqueue(&method, &url, body)
        .map_err(|e| eyre!("Failed to queue mutation: {}", e))?;
      println!("queued {}", op.id);
    }
    QueueAction::Sync => {
      let replayed = tab.sync_queue().await;
      println!("replayed {} mutation(s)", replayed.len());
      let status = tab.queue().get_sync_status();
      println!("pending mutations: {}", tab.queue().get_pending_count());
      if let Some(err) = status.last_error {
        println!("last error: {}", err);
      }
    }
  }
  Ok(())
}

async fn cache(config: &Config, action: CacheAction) -> Result<()> {
  let origin = Origin::open(config)?;
  let tab = origin.open_tab();

  match action {
    CacheAction::Show { resource } => {
      let validator = tab.cache().get_validator(&resource).await.unwrap_or_default();
      println!("etag: {}", validator.etag.as_deref().unwrap_or("-"));
      println!("last-modified: {}", validator.last_modified.as_deref().unwrap_or("-"));
      println!(
        "last sync: {}",
        tab.cache().get_last_sync(&resource).await.as_deref().unwrap_or("-")
      );
    }
    CacheAction::Clear { resource: Some(resource) } => tab.cache().clear_validator(&resource).await,
    CacheAction::Clear { resource: None } => tab.cache().clear_all().await,
  }
  Ok(())
}

fn short_id(id: &str) -> String {
  id.chars().take(8).collect()
}

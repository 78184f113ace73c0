//! Composition of the coordination core for one tab.
//!
//! An [`Origin`] owns everything tabs share (stores, broadcast channel,
//! clock, replay transport). Each [`Tab`] opened from it gets its own
//! identity, election state, bridge endpoint, validator cache and queue
//! handle over those shared media.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::conditional::{normalize_resource_key, ConditionalCache, DEFAULT_CACHE_TTL};
use crate::config::Config;
use crate::leader::{
  BroadcastChannel, ClaimOutcome, ElectionTiming, EventBridge, LeaderClaim, LeaderElection,
};
use crate::offline::{HttpReplayer, OfflineQueue, QueuedOperation, Replayer};
use crate::store::{ObjectCache, SqliteDurableStore, SqliteObjectCache, StorageArea};

/// Connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Tunables applied to every tab of an origin.
#[derive(Debug, Clone, Copy)]
pub struct OriginSettings {
  pub timing: ElectionTiming,
  pub cache_ttl: Duration,
  pub suspend_when_offline: bool,
}

impl Default for OriginSettings {
  fn default() -> Self {
    Self {
      timing: ElectionTiming::default(),
      cache_ttl: DEFAULT_CACHE_TTL,
      suspend_when_offline: true,
    }
  }
}

/// State shared by every tab of one running application.
#[derive(Clone)]
pub struct Origin {
  area: StorageArea,
  objects: Arc<dyn ObjectCache>,
  channel: BroadcastChannel,
  clock: Arc<dyn Clock>,
  replayer: Arc<dyn Replayer>,
  settings: OriginSettings,
}

impl Origin {
  pub fn new(
    area: StorageArea,
    objects: Arc<dyn ObjectCache>,
    channel: BroadcastChannel,
    clock: Arc<dyn Clock>,
    replayer: Arc<dyn Replayer>,
    settings: OriginSettings,
  ) -> Self {
    Self {
      area,
      objects,
      channel,
      clock,
      replayer,
      settings,
    }
  }

  /// Open the origin described by `config`, with stores in its data directory.
  pub fn open(config: &Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = SqliteDurableStore::open(&data_dir.join("store.db"))?;
    let objects = SqliteObjectCache::open(&data_dir.join("objects.db"), Arc::clone(&clock))?;
    let replayer = HttpReplayer::new(config.api.base_url.clone(), config.api_timeout())?;

    Ok(Self::new(
      StorageArea::new(Arc::new(store)),
      Arc::new(objects),
      BroadcastChannel::new(&config.bridge.channel_name, config.bridge.capacity),
      clock,
      Arc::new(replayer),
      OriginSettings {
        timing: config.election_timing(),
        cache_ttl: config.cache_ttl(),
        suspend_when_offline: config.leader.suspend_when_offline,
      },
    ))
  }

  /// Open a tab with a fresh random identity.
  pub fn open_tab(&self) -> Tab {
    self.open_tab_with_id(&uuid::Uuid::new_v4().to_string())
  }

  /// Open a tab with a known identity. Must run inside a tokio runtime.
  pub fn open_tab_with_id(&self, id: &str) -> Tab {
    let storage = self.area.for_tab(id);

    let bridge = EventBridge::new(self.channel.clone(), id);
    let election = LeaderElection::new(
      storage.clone(),
      Arc::clone(&self.clock),
      self.settings.timing,
    )
    .with_bridge(bridge.clone());
    let cache = Arc::new(
      ConditionalCache::new(Arc::clone(&self.objects), storage.clone(), Arc::clone(&self.clock))
        .with_ttl(self.settings.cache_ttl),
    );
    let queue = Arc::new(OfflineQueue::new(
      storage,
      Arc::clone(&self.replayer),
      Arc::clone(&self.clock),
    ));

    info!(tab = id, "opened tab");
    Tab {
      id: id.to_string(),
      election,
      bridge,
      cache,
      queue,
      suspend_when_offline: self.settings.suspend_when_offline,
    }
  }
}

/// One coordination context.
pub struct Tab {
  id: String,
  election: LeaderElection,
  bridge: EventBridge,
  cache: Arc<ConditionalCache>,
  queue: Arc<OfflineQueue>,
  suspend_when_offline: bool,
}

impl Tab {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn election(&self) -> &LeaderElection {
    &self.election
  }

  pub fn bridge(&self) -> &EventBridge {
    &self.bridge
  }

  pub fn cache(&self) -> &ConditionalCache {
    &self.cache
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn claim_leadership(&self) -> ClaimOutcome {
    self.election.claim_leadership()
  }

  pub fn current_leader(&self) -> Option<LeaderClaim> {
    self.election.current_leader()
  }

  /// Replay the offline queue, then drop the validators of every resource a
  /// replayed mutation touched, in replay order. Returns the replayed
  /// operations once their validators are gone.
  pub async fn sync_queue(&self) -> Vec<QueuedOperation> {
    let replayed = self.queue.sync_queue().await;
    for operation in &replayed {
      self
        .cache
        .clear_validator(&normalize_resource_key(&operation.url))
        .await;
    }
    replayed
  }

  /// React to the platform's connectivity signal.
  ///
  /// Going offline suspends new leader claims (when configured); coming
  /// back online lifts the suspension and replays the offline queue.
  pub async fn set_connectivity(&self, connectivity: Connectivity) {
    info!(tab = %self.id, ?connectivity, "connectivity changed");
    match connectivity {
      Connectivity::Offline => {
        if self.suspend_when_offline {
          self.election.set_suspended(true);
        }
      }
      Connectivity::Online => {
        self.election.set_suspended(false);
        self.sync_queue().await;
      }
    }
  }

  /// Stop heartbeating without releasing, as a frozen tab would.
  pub fn freeze(&self) {
    self.election.freeze();
  }
}

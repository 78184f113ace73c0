//! Leader election between tabs sharing one durable store.
//!
//! A tab becomes leader by writing its identity and a heartbeat timestamp to
//! the shared store, then refreshing the heartbeat on a fixed interval. Any
//! tab may take over once the heartbeat is older than the staleness
//! threshold. There is no lock: the last writer wins, and a leader that finds
//! a foreign identity in the store on its next tick silently stops
//! heartbeating. Tabs converge on one leader within one heartbeat interval.
//!
//! Winning and releasing a claim are also announced on the tab's
//! [`EventBridge`] as `{"type": "leader", "leaderId": ...}`.
//!
//! ```text
//! Unclaimed -> Leader (heartbeating) -> Released | Superseded -> Unclaimed
//! ```

mod bridge;

pub use bridge::{BridgeMessage, BroadcastChannel, EventBridge, Subscription};

use std::sync::atomic::{AtomicBool, Ordering};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{swallow, Lookup, TabStorage};

/// Store key holding the current leader's identity.
pub const LEADER_ID_KEY: &str = "tabsync:leader:id";
/// Store key holding the leader's last heartbeat (milliseconds, as a string).
pub const LEADER_HEARTBEAT_KEY: &str = "tabsync:leader:heartbeat";

/// `type` of the bridge message announcing a leadership change.
pub const LEADER_MESSAGE_TYPE: &str = "leader";

const LEADER_CHANGE_CAPACITY: usize = 64;

/// Bridge payload announcing `leader_id` (or that nobody leads).
pub fn leader_message(leader_id: Option<&str>) -> Value {
  json!({ "type": LEADER_MESSAGE_TYPE, "leaderId": leader_id })
}

/// The announced leader if `payload` is a leadership message.
pub fn parse_leader_message(payload: &Value) -> Option<Option<String>> {
  if payload.get("type")?.as_str()? != LEADER_MESSAGE_TYPE {
    return None;
  }
  match payload.get("leaderId")? {
    Value::String(id) => Some(Some(id.clone())),
    Value::Null => Some(None),
    _ => None,
  }
}

/// Heartbeat cadence and the age after which a claim is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
  pub heartbeat_interval: Duration,
  pub stale_threshold: Duration,
}

impl Default for ElectionTiming {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_millis(2000),
      stale_threshold: Duration::from_millis(5000),
    }
  }
}

/// The leader as recorded in the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderClaim {
  pub leader_id: String,
  pub last_heartbeat_at: i64,
}

impl LeaderClaim {
  /// Read the claim from the store. A missing or unreadable heartbeat makes
  /// the claim infinitely old.
  pub fn read(storage: &TabStorage) -> Option<Self> {
    let leader_id = storage.get(LEADER_ID_KEY).into_option("read leader id")?;
    let last_heartbeat_at = storage
      .get(LEADER_HEARTBEAT_KEY)
      .into_option("read leader heartbeat")
      .and_then(|raw| raw.parse::<i64>().ok())
      .unwrap_or(i64::MIN);

    Some(Self {
      leader_id,
      last_heartbeat_at,
    })
  }

  pub fn age_ms(&self, now_ms: i64) -> i64 {
    now_ms.saturating_sub(self.last_heartbeat_at)
  }

  pub fn is_stale(&self, now_ms: i64, threshold: Duration) -> bool {
    self.age_ms(now_ms) > duration_ms(threshold)
  }
}

/// Local notification that the recorded leader changed in another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChange {
  /// New leader, or `None` when the claim was cleared
  pub leader_id: Option<String>,
  pub observed_at: i64,
}

/// Result of a claim attempt.
#[derive(Debug)]
pub struct ClaimOutcome {
  pub is_leader: bool,
  /// Our own id when we lead, otherwise the current leader's
  pub id: String,
  pub release: ReleaseHandle,
}

/// Gives up leadership. A no-op for outcomes that did not win.
#[derive(Debug, Clone, Default)]
pub struct ReleaseHandle {
  heartbeat: Option<Arc<Heartbeat>>,
}

impl ReleaseHandle {
  /// Stop heartbeating and clear the claim if it is still ours. Idempotent.
  pub fn release(&self) {
    if let Some(heartbeat) = &self.heartbeat {
      heartbeat.release();
    }
  }
}

/// Per-tab election state.
pub struct LeaderElection {
  storage: TabStorage,
  clock: Arc<dyn Clock>,
  timing: ElectionTiming,
  suspended: AtomicBool,
  current: Arc<HeartbeatSlot>,
  bridge: Option<EventBridge>,
  changes: broadcast::Sender<LeaderChange>,
  watcher: JoinHandle<()>,
}

/// The heartbeat of the tab's current term, if any.
type HeartbeatSlot = Mutex<Option<Arc<Heartbeat>>>;

impl LeaderElection {
  /// Create the election for the tab owning `storage`.
  ///
  /// Spawns a watcher that turns foreign writes of the leader key into
  /// [`LeaderChange`] events, so this must run inside a tokio runtime.
  pub fn new(storage: TabStorage, clock: Arc<dyn Clock>, timing: ElectionTiming) -> Self {
    let (changes, _) = broadcast::channel(LEADER_CHANGE_CAPACITY);
    let watcher = spawn_change_watcher(&storage, Arc::clone(&clock), changes.clone());

    Self {
      storage,
      clock,
      timing,
      suspended: AtomicBool::new(false),
      current: Arc::new(Mutex::new(None)),
      bridge: None,
      changes,
      watcher,
    }
  }

  /// Announce won and released claims on `bridge`.
  pub fn with_bridge(mut self, bridge: EventBridge) -> Self {
    self.bridge = Some(bridge);
    self
  }

  pub fn id(&self) -> &str {
    self.storage.tab_id()
  }

  pub fn timing(&self) -> ElectionTiming {
    self.timing
  }

  /// Try to become leader.
  pub fn claim_leadership(&self) -> ClaimOutcome {
    let now = self.clock.now_ms();
    let existing = LeaderClaim::read(&self.storage);

    if let Some(claim) = &existing {
      if !claim.is_stale(now, self.timing.stale_threshold) {
        if claim.leader_id == self.id() {
          if let Some(heartbeat) = self.active_heartbeat() {
            return self.won(heartbeat);
          }
        } else {
          return self.lost(claim.leader_id.clone());
        }
      }
    }

    if self.suspended.load(Ordering::SeqCst) {
      debug!(tab = self.id(), "leader claims suspended while offline");
      let id = existing
        .map(|claim| claim.leader_id)
        .unwrap_or_else(|| self.id().to_string());
      return self.lost(id);
    }

    // Heartbeat first so a reader never sees our id next to a stale timestamp
    let written = self
      .storage
      .set(LEADER_HEARTBEAT_KEY, &now.to_string())
      .and_then(|_| self.storage.set(LEADER_ID_KEY, self.id()));
    if let Err(err) = written {
      warn!(tab = self.id(), error = %err, "could not record leader claim");
      return self.lost(self.id().to_string());
    }

    match &existing {
      Some(previous) if previous.leader_id != self.id() => {
        info!(tab = self.id(), previous = %previous.leader_id, "took over stale leadership")
      }
      _ => info!(tab = self.id(), "claimed leadership"),
    }

    let heartbeat = Heartbeat::start(
      self.storage.clone(),
      Arc::clone(&self.clock),
      self.timing.heartbeat_interval,
      Arc::downgrade(&self.current),
      self.bridge.clone(),
    );
    self.replace_heartbeat(Arc::clone(&heartbeat));
    if let Some(bridge) = &self.bridge {
      bridge.publish_event(leader_message(Some(self.id())));
    }
    self.won(heartbeat)
  }

  /// Whether this tab currently believes it is leader.
  pub fn is_leader(&self) -> bool {
    self.active_heartbeat().is_some()
  }

  /// The recorded leader, if its heartbeat is fresh.
  pub fn current_leader(&self) -> Option<LeaderClaim> {
    LeaderClaim::read(&self.storage)
      .filter(|claim| !claim.is_stale(self.clock.now_ms(), self.timing.stale_threshold))
  }

  /// Refuse new claims (used while the browser reports being offline).
  pub fn set_suspended(&self, suspended: bool) {
    self.suspended.store(suspended, Ordering::SeqCst);
  }

  /// Leadership changes made by other tabs.
  pub fn subscribe_leader_changes(&self) -> broadcast::Receiver<LeaderChange> {
    self.changes.subscribe()
  }

  /// Release leadership held by this tab, if any.
  pub fn release(&self) {
    let heartbeat = self.current.lock().ok().and_then(|current| current.clone());
    if let Some(heartbeat) = heartbeat {
      heartbeat.release();
    }
  }

  /// Stop heartbeating without clearing the claim, as a frozen or crashed
  /// tab would. Other tabs take over once the claim goes stale.
  pub fn freeze(&self) {
    if let Some(heartbeat) = self.take_heartbeat() {
      heartbeat.stop();
    }
  }

  /// Run one heartbeat tick now. Returns whether this tab is still leader.
  pub fn heartbeat_now(&self) -> bool {
    match self.active_heartbeat() {
      Some(heartbeat) => heartbeat.tick(),
      None => false,
    }
  }

  fn won(&self, heartbeat: Arc<Heartbeat>) -> ClaimOutcome {
    ClaimOutcome {
      is_leader: true,
      id: self.id().to_string(),
      release: ReleaseHandle {
        heartbeat: Some(heartbeat),
      },
    }
  }

  fn lost(&self, id: String) -> ClaimOutcome {
    ClaimOutcome {
      is_leader: false,
      id,
      release: ReleaseHandle::default(),
    }
  }

  fn active_heartbeat(&self) -> Option<Arc<Heartbeat>> {
    let current = self.current.lock().ok()?;
    current.as_ref().filter(|hb| hb.is_active()).cloned()
  }

  fn replace_heartbeat(&self, heartbeat: Arc<Heartbeat>) {
    if let Some(previous) = self.take_heartbeat() {
      previous.stop();
    }
    if let Ok(mut current) = self.current.lock() {
      *current = Some(heartbeat);
    }
  }

  fn take_heartbeat(&self) -> Option<Arc<Heartbeat>> {
    self.current.lock().ok()?.take()
  }
}

impl Drop for LeaderElection {
  fn drop(&mut self) {
    self.release();
    self.watcher.abort();
  }
}

fn spawn_change_watcher(
  storage: &TabStorage,
  clock: Arc<dyn Clock>,
  changes: broadcast::Sender<LeaderChange>,
) -> JoinHandle<()> {
  let mut events = storage.subscribe();
  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      if event.key != LEADER_ID_KEY {
        continue;
      }
      debug!(leader = ?event.new_value, writer = %event.origin, "leader changed");
      let _ = changes.send(LeaderChange {
        leader_id: event.new_value,
        observed_at: clock.now_ms(),
      });
    }
  })
}

/// Repeating heartbeat task for one period of leadership.
#[derive(Debug)]
struct Heartbeat {
  shared: Arc<HeartbeatState>,
  task: Mutex<Option<JoinHandle<()>>>,
}

struct HeartbeatState {
  storage: TabStorage,
  clock: Arc<dyn Clock>,
  active: AtomicBool,
  released: AtomicBool,
  /// Where the election keeps its current term
  slot: Weak<HeartbeatSlot>,
  bridge: Option<EventBridge>,
}

impl std::fmt::Debug for HeartbeatState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HeartbeatState")
      .field("tab", &self.storage.tab_id())
      .field("active", &self.active)
      .field("released", &self.released)
      .finish_non_exhaustive()
  }
}

impl HeartbeatState {
  /// Verify we are still the recorded leader, then refresh the heartbeat.
  fn tick(&self) -> bool {
    if !self.active.load(Ordering::SeqCst) {
      return false;
    }

    let tab = self.storage.tab_id();
    match self.storage.get(LEADER_ID_KEY) {
      Lookup::Hit(current) if current == tab => {
        let now = self.clock.now_ms();
        swallow(
          self.storage.set(LEADER_HEARTBEAT_KEY, &now.to_string()),
          "write leader heartbeat",
        );
        debug!(tab, now, "heartbeat");
        true
      }
      Lookup::Hit(other) => {
        info!(tab, superseded_by = %other, "leadership superseded, stopping heartbeat");
        self.active.store(false, Ordering::SeqCst);
        false
      }
      Lookup::Miss => {
        info!(tab, "leader claim cleared, stopping heartbeat");
        self.active.store(false, Ordering::SeqCst);
        false
      }
      Lookup::Failed(err) => {
        warn!(tab, error = %err, "cannot verify leadership, yielding");
        self.active.store(false, Ordering::SeqCst);
        false
      }
    }
  }
}

impl Heartbeat {
  fn start(
    storage: TabStorage,
    clock: Arc<dyn Clock>,
    interval: Duration,
    slot: Weak<HeartbeatSlot>,
    bridge: Option<EventBridge>,
  ) -> Arc<Self> {
    let shared = Arc::new(HeartbeatState {
      storage,
      clock,
      active: AtomicBool::new(true),
      released: AtomicBool::new(false),
      slot,
      bridge,
    });

    let state = Arc::clone(&shared);
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately; the claim was just written
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if !state.tick() {
          break;
        }
      }
    });

    Arc::new(Self {
      shared,
      task: Mutex::new(Some(task)),
    })
  }

  fn is_active(&self) -> bool {
    self.shared.active.load(Ordering::SeqCst)
  }

  fn tick(&self) -> bool {
    self.shared.tick()
  }

  /// Cancel the task. The `active` flag is cleared first so a tick racing
  /// with the abort cannot write another heartbeat.
  fn stop(&self) {
    self.shared.active.store(false, Ordering::SeqCst);
    if let Ok(mut task) = self.task.lock() {
      if let Some(task) = task.take() {
        task.abort();
      }
    }
  }

  /// Give up this term. The stored claim is cleared only while this is
  /// still the tab's current term and the store still names this tab; a
  /// handle from an earlier term never touches a later one.
  fn release(&self) {
    if self.shared.released.swap(true, Ordering::SeqCst) {
      return;
    }
    self.stop();

    let storage = &self.shared.storage;
    let tab = storage.tab_id();
    if !self.take_if_current() {
      debug!(tab, "release skipped, term already replaced");
      return;
    }

    match storage.get(LEADER_ID_KEY) {
      Lookup::Hit(current) if current == tab => {
        swallow(storage.delete(LEADER_ID_KEY), "clear leader id");
        swallow(storage.delete(LEADER_HEARTBEAT_KEY), "clear leader heartbeat");
        info!(tab, "released leadership");
        if let Some(bridge) = &self.shared.bridge {
          bridge.publish_event(leader_message(None));
        }
      }
      _ => debug!(tab, "release skipped, claim belongs to another tab"),
    }
  }

  /// Empty the election's slot if it still holds this heartbeat.
  fn take_if_current(&self) -> bool {
    let Some(slot) = self.shared.slot.upgrade() else {
      return false;
    };
    let Ok(mut current) = slot.lock() else {
      return false;
    };
    let is_current = current
      .as_deref()
      .is_some_and(|heartbeat| std::ptr::eq(heartbeat, self));
    if is_current {
      *current = None;
    }
    is_current
  }
}

fn duration_ms(duration: Duration) -> i64 {
  i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

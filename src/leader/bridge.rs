//! Best-effort fan-out of payloads between tabs.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A payload in transit, stamped with the tab that posted it.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeMessage {
  pub sender: String,
  pub payload: Value,
}

/// Named, unordered channel shared by all tabs of an origin.
///
/// Messages are never delivered back to the posting tab. Slow receivers
/// lose messages instead of blocking senders.
#[derive(Clone)]
pub struct BroadcastChannel {
  name: Arc<str>,
  tx: broadcast::Sender<BridgeMessage>,
}

impl BroadcastChannel {
  pub fn new(name: &str, capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self {
      name: Arc::from(name),
      tx,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// One tab's end of the [`BroadcastChannel`].
#[derive(Clone)]
pub struct EventBridge {
  channel: BroadcastChannel,
  tab_id: Arc<str>,
}

impl EventBridge {
  pub fn new(channel: BroadcastChannel, tab_id: &str) -> Self {
    Self {
      channel,
      tab_id: Arc::from(tab_id),
    }
  }

  /// Send `payload` to every other tab. Fire-and-forget.
  pub fn publish_event(&self, payload: Value) {
    let message = BridgeMessage {
      sender: self.tab_id.to_string(),
      payload,
    };
    if self.channel.tx.send(message).is_err() {
      debug!(channel = %self.channel.name, "no tabs listening, event dropped");
    }
  }

  /// Call `handler` for every message posted by another tab until the
  /// returned [`Subscription`] is unsubscribed or dropped.
  pub fn subscribe_bridge<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    let mut rx = self.channel.tx.subscribe();
    let tab_id = Arc::clone(&self.tab_id);
    let channel = Arc::clone(&self.channel.name);

    let task = tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(message) if *message.sender == *tab_id => {}
          Ok(message) => handler(&message.payload),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(%channel, skipped, "bridge subscriber fell behind, messages lost");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    Subscription { task: Some(task) }
  }
}

/// Registration of a bridge handler. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
  task: Option<JoinHandle<()>>,
}

impl Subscription {
  pub fn unsubscribe(mut self) {
    self.cancel();
  }

  fn cancel(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::time::Duration;
  use tokio::sync::mpsc;

  fn collector() -> (
    impl Fn(&Value) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Value>,
  ) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      move |payload: &Value| {
        let _ = tx.send(payload.clone());
      },
      rx,
    )
  }

  async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Option<Value> {
    tokio::time::timeout(Duration::from_millis(100), rx.recv())
      .await
      .ok()
      .flatten()
  }

  #[tokio::test]
  async fn test_publish_reaches_other_tabs_only() {
    let channel = BroadcastChannel::new("events", 16);
    let leader = EventBridge::new(channel.clone(), "leader");
    let follower = EventBridge::new(channel.clone(), "follower");

    let (on_leader, mut leader_rx) = collector();
    let (on_follower, mut follower_rx) = collector();
    let _a = leader.subscribe_bridge(on_leader);
    let _b = follower.subscribe_bridge(on_follower);

    leader.publish_event(json!({ "type": "disease.updated", "id": 7 }));

    assert_eq!(
      next(&mut follower_rx).await,
      Some(json!({ "type": "disease.updated", "id": 7 }))
    );
    assert_eq!(next(&mut leader_rx).await, None);
  }

  #[tokio::test]
  async fn test_subscribers_are_independent() {
    let channel = BroadcastChannel::new("events", 16);
    let sender = EventBridge::new(channel.clone(), "a");
    let receiver = EventBridge::new(channel, "b");

    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    let first_sub = receiver.subscribe_bridge(first);
    let _second_sub = receiver.subscribe_bridge(second);

    sender.publish_event(json!(1));
    assert_eq!(next(&mut first_rx).await, Some(json!(1)));
    assert_eq!(next(&mut second_rx).await, Some(json!(1)));

    first_sub.unsubscribe();
    sender.publish_event(json!(2));
    assert_eq!(next(&mut second_rx).await, Some(json!(2)));
    assert_eq!(next(&mut first_rx).await, None);
  }

  #[tokio::test]
  async fn test_publish_without_listeners_is_silent() {
    let bridge = EventBridge::new(BroadcastChannel::new("events", 4), "lonely");
    bridge.publish_event(json!("nobody home"));
  }
}

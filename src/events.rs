//! T2 — Event Bus: thin in-process publisher of engine lifecycle events for
//! the UI and notifier. Grounded on the reference daemon's
//! `ipc::event::EventBroadcaster` (a wrapped `tokio::sync::broadcast`
//! channel), adapted from JSON-RPC notification envelopes to the tagged
//! `EngineEvent` variants this spec names directly.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CommitCreated {
        repo_root: String,
        hash: String,
        shadow_branch: String,
    },
    CommitSkipped {
        repo_root: String,
        reason: String,
    },
    CommitFailed {
        repo_root: String,
        kind: String,
    },
    RepoDegraded {
        repo_root: String,
    },
    SecretSuspected {
        repo_root: String,
    },
}

const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget: no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::CommitCreated {
            repo_root: "/repo".to_string(),
            hash: "a".repeat(40),
            shadow_branch: "shadow/main".to_string(),
        });
        let received = rx.recv().await.unwrap();
        matches!(received, EngineEvent::CommitCreated { .. });
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::RepoDegraded {
            repo_root: "/repo".to_string(),
        });
    }
}

//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! Local observers (the CLI, tests, an embedding service) subscribe here to
//! see releases as they land, independently of the HTTP collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{DbId, ProposalSnapshot};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalEventKind {
    Published,
    /// Reverted to an earlier published version.
    Reverted,
    /// Reverted past the first release; the proposal is a draft again.
    Withdrawn,
}

impl ProposalEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "proposal.published",
            Self::Reverted => "proposal.reverted",
            Self::Withdrawn => "proposal.withdrawn",
        }
    }
}

/// A release-level change to one proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalEvent {
    pub kind: ProposalEventKind,
    pub proposal_id: DbId,
    pub actor_id: Option<DbId>,
    pub snapshot: ProposalSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl ProposalEvent {
    pub fn new(kind: ProposalEventKind, snapshot: ProposalSnapshot) -> Self {
        Self {
            kind,
            proposal_id: snapshot.proposal_id,
            actor_id: None,
            snapshot,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, user_id: DbId) -> Self {
        self.actor_id = Some(user_id);
        self
    }
}

/// Fan-out bus; every subscriber sees every event published after it
/// subscribed.
pub struct EventBus {
    sender: broadcast::Sender<ProposalEvent>,
}

impl EventBus {
    /// When the buffer is full the oldest events are dropped and slow
    /// receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped if nobody listens.
    pub fn publish(&self, event: ProposalEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProposalEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProposalStatus;

    fn snapshot() -> ProposalSnapshot {
        ProposalSnapshot {
            proposal_id: 4,
            title: "Parks".into(),
            content: "More trees".into(),
            version: "0.0.1".into(),
            status: ProposalStatus::Published,
            commit_id: "f".repeat(40),
            fingerprint: "00".into(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(ProposalEvent::new(ProposalEventKind::Published, snapshot()).with_actor(1));

        let got = a.recv().await.unwrap();
        assert_eq!(got.kind, ProposalEventKind::Published);
        assert_eq!(got.proposal_id, 4);
        assert_eq!(got.actor_id, Some(1));
        assert_eq!(b.recv().await.unwrap().kind, ProposalEventKind::Published);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(ProposalEvent::new(ProposalEventKind::Withdrawn, snapshot()));
        assert_eq!(ProposalEventKind::Withdrawn.as_str(), "proposal.withdrawn");
    }
}

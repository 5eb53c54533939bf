//! Raw change notifications delivered by the directory service subscription.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ids::{DirectoryId, PrincipalId};
use crate::types::PrincipalSnapshot;

/// A change notification as delivered by the directory service.
///
/// Delivery order is not guaranteed, and a single external action can produce
/// several notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawDirectoryEvent {
    /// A principal's grants changed.
    PrincipalUpdated {
        directory: DirectoryId,
        before: PrincipalSnapshot,
        after: PrincipalSnapshot,
    },
    /// A principal joined a directory.
    PrincipalJoined {
        directory: DirectoryId,
        principal: PrincipalSnapshot,
    },
    /// A principal left or was removed from a directory.
    PrincipalLeft {
        directory: DirectoryId,
        principal: PrincipalSnapshot,
    },
    /// An exclusion was placed on a principal.
    ExclusionAdded {
        directory: DirectoryId,
        principal: PrincipalId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// An exclusion was lifted.
    ExclusionRemoved {
        directory: DirectoryId,
        principal: PrincipalId,
    },
}

impl RawDirectoryEvent {
    /// Directory the notification originated from.
    #[must_use]
    pub fn directory(&self) -> DirectoryId {
        match self {
            Self::PrincipalUpdated { directory, .. }
            | Self::PrincipalJoined { directory, .. }
            | Self::PrincipalLeft { directory, .. }
            | Self::ExclusionAdded { directory, .. }
            | Self::ExclusionRemoved { directory, .. } => *directory,
        }
    }

    /// Principal the notification is about.
    #[must_use]
    pub fn principal(&self) -> PrincipalId {
        match self {
            Self::PrincipalUpdated { after, .. } => after.id,
            Self::PrincipalJoined { principal, .. } | Self::PrincipalLeft { principal, .. } => {
                principal.id
            }
            Self::ExclusionAdded { principal, .. } | Self::ExclusionRemoved { principal, .. } => {
                *principal
            }
        }
    }
}

/// Subscription feed of raw directory events.
#[async_trait]
pub trait EventFeed: Send {
    /// Wait for the next event, `None` once the feed is closed.
    async fn next_event(&mut self) -> Option<RawDirectoryEvent>;
}

#[async_trait]
impl EventFeed for mpsc::Receiver<RawDirectoryEvent> {
    async fn next_event(&mut self) -> Option<RawDirectoryEvent> {
        self.recv().await
    }
}

#[async_trait]
impl EventFeed for mpsc::UnboundedReceiver<RawDirectoryEvent> {
    async fn next_event(&mut self) -> Option<RawDirectoryEvent> {
        self.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::GrantId;

    #[test]
    fn test_accessors() {
        let event = RawDirectoryEvent::PrincipalUpdated {
            directory: DirectoryId::new(1),
            before: PrincipalSnapshot::new(PrincipalId::new(9), "bob"),
            after: PrincipalSnapshot::new(PrincipalId::new(9), "bob").with_grant(GrantId::new(3)),
        };
        assert_eq!(event.directory(), DirectoryId::new(1));
        assert_eq!(event.principal(), PrincipalId::new(9));
    }

    #[test]
    fn test_tagged_serialization() {
        let event = RawDirectoryEvent::ExclusionRemoved {
            directory: DirectoryId::new(1),
            principal: PrincipalId::new(2),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "exclusion_removed");
        assert_eq!(json["principal"], "2");
    }

    #[tokio::test]
    async fn test_channel_feed() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(RawDirectoryEvent::ExclusionRemoved {
            directory: DirectoryId::new(1),
            principal: PrincipalId::new(2),
        })
        .await
        .unwrap();
        drop(tx);

        assert!(rx.next_event().await.is_some());
        assert!(rx.next_event().await.is_none());
    }
}

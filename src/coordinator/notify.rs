//! In-process notification fan-out over a tokio broadcast channel.
//!
//! Suitable for embedding the coordinator next to its consumers. A publish
//! with no live subscriber is reported as an error so the pipeline logs it;
//! it never fails the request.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use super::traits::NotificationSink;
use crate::error::{TxnError, TxnResult};
use crate::types::NotificationEvent;

#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<NotificationEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotifier {
    async fn publish(&self, event: &NotificationEvent) -> TxnResult<()> {
        let receivers = self
            .sender
            .send(event.clone())
            .map_err(|_| TxnError::Internal("no notification subscribers".to_string()))?;
        trace!(receivers, kind = %event.kind, uuid = %event.uuid, "Published notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FqName, Operation, ResourceObject};

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        let obj = ResourceObject::new("virtual_network", FqName::parse("d:p:vn"));
        let event = NotificationEvent::for_object(Operation::Create, &obj);

        notifier.publish(&event).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_errors() {
        let notifier = BroadcastNotifier::new(8);
        let obj = ResourceObject::new("virtual_network", FqName::parse("d:p:vn"));
        let event = NotificationEvent::for_object(Operation::Delete, &obj);
        assert!(notifier.publish(&event).await.is_err());
    }
}

//! Event Bus - Central event distribution
//!
//! All domain events flow through one broadcast channel, decoupling
//! producers (pool, reconciler, OAuth orchestrator) from consumers
//! (the exposed server's notifier, telemetry, tests). Receivers that lag
//! drop events rather than blocking senders.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::DomainEvent;

/// Default channel capacity for the event bus
const DEFAULT_CAPACITY: usize = 256;

/// Central hub for domain event distribution.
///
/// Each subscriber receives its own copy of every event emitted after
/// subscription.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Get a cloneable sender for emitting events.
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Subscribe to receive all subsequent events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Used by subsystems to emit domain events. Cheaply cloneable.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventSender {
    /// Emit an event; returns the number of receivers that got it.
    /// Zero receivers is not an error.
    pub fn emit(&self, event: DomainEvent) -> usize {
        let type_name = event.type_name();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type = type_name, receivers = count, "[EventBus] Emitted event");
                count
            }
            Err(_) => {
                debug!(event_type = type_name, "[EventBus] No receivers for event");
                0
            }
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

/// Used by consumers to receive domain events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event. Returns `None` when the channel closes;
    /// lag is logged and skipped.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped_events = skipped, "[EventBus] Receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("[EventBus] Channel closed");
                    return None;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped_events = skipped, "[EventBus] Receiver lagged on try_recv");
                self.receiver.try_recv().ok()
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let mut receiver = bus.subscribe();

        sender.emit(DomainEvent::BackendReady {
            server: "github".to_string(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.type_name(), "backend_ready");
        assert_eq!(event.server(), Some("github"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        sender.emit(DomainEvent::ConfigReloaded { servers: 2 });

        assert_eq!(rx1.recv().await.unwrap().type_name(), "config_reloaded");
        assert_eq!(rx2.recv().await.unwrap().type_name(), "config_reloaded");
    }

    #[test]
    fn test_no_receivers() {
        let bus = EventBus::new();
        let sender = bus.sender();
        assert_eq!(sender.emit(DomainEvent::ConfigReloaded { servers: 0 }), 0);
        assert!(!sender.has_subscribers());
    }
}

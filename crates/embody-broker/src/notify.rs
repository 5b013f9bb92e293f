//! Outbound lifecycle notifications.
//!
//! Session changes the broker makes on its own initiative (revocation,
//! forced termination, body withdrawal) are sealed as `embodimentUpdate`
//! envelopes and broadcast to whoever delivers them to agents.

use std::sync::Arc;

use embody_core::{AgentId, Timestamp};
use embody_crypto::KeyPair;
use embody_protocol::{EmbodimentUpdate, Envelope, Message};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Default notification channel capacity.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// A sealed update addressed to one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Agent the update is for.
    pub recipient: AgentId,
    /// Signed `embodimentUpdate` envelope.
    pub envelope: Envelope,
}

/// Broadcasts notifications to every delivery task.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Arc<Notification>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

impl Notifier {
    /// Create a notifier with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every notification published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.sender.subscribe()
    }

    /// Seal and publish an update. Returns how many receivers got it.
    pub(crate) fn publish(
        &self,
        broker: &AgentId,
        key: &KeyPair,
        recipient: &AgentId,
        update: EmbodimentUpdate,
        now: Timestamp,
    ) -> usize {
        let mut envelope =
            match Envelope::new(&Message::EmbodimentUpdate(update), broker.clone(), now) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "Failed to build notification");
                    return 0;
                },
            };
        envelope.sign(key);

        let notification = Arc::new(Notification {
            recipient: recipient.clone(),
            envelope,
        });
        if let Ok(count) = self.sender.send(notification) {
            debug!(recipient = %recipient, receivers = count, "Notification published");
            count
        } else {
            trace!(recipient = %recipient, "No notification receivers");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embody_core::BodyId;
    use embody_protocol::UpdateEvent;

    #[test]
    fn test_publish_is_signed() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();
        let key = KeyPair::generate();
        let broker = AgentId::new("broker");

        let update = EmbodimentUpdate {
            session_token: None,
            request_id: None,
            event: UpdateEvent::BodyWithdrawn {
                body_id: BodyId::new("dev-box"),
            },
        };
        let sent = notifier.publish(&broker, &key, &AgentId::new("guest"), update.clone(), Timestamp::now());
        assert_eq!(sent, 1);

        let got = rx.try_recv().unwrap();
        assert_eq!(got.recipient, AgentId::new("guest"));
        got.envelope
            .verify_signature(&key.export_public_key())
            .unwrap();
        assert_eq!(
            got.envelope.message().unwrap(),
            Message::EmbodimentUpdate(update)
        );
    }

    #[test]
    fn test_publish_without_receivers() {
        let notifier = Notifier::new(4);
        let update = EmbodimentUpdate {
            session_token: None,
            request_id: None,
            event: UpdateEvent::Expired,
        };
        let key = KeyPair::generate();
        assert_eq!(
            notifier.publish(&AgentId::new("b"), &key, &AgentId::new("g"), update, Timestamp::now()),
            0
        );
    }
}

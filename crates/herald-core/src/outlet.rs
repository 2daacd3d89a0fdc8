//! Single-slot delivery channel for one subscriber.
//!
//! An [`Outlet`] is the registry-owned half of a channel. Producers get a
//! [`Handoff`] from it, the subscriber's receive loop gets an [`Inbox`].
//! Dropping the outlet closes the channel: every waiting producer and the
//! inbox observe termination.

use crate::message::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::trace;

/// Default maximum subscriber identity length.
pub const MAX_IDENTITY_LENGTH: usize = 256;

/// A subscriber identity.
pub type SubscriberId = String;

/// Validate a subscriber identity.
///
/// # Errors
///
/// Returns an error message if the identity is invalid.
pub fn validate_identity(id: &str, max_len: usize) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Subscriber identity cannot be empty");
    }
    if id.len() > max_len {
        return Err("Subscriber identity too long");
    }
    if id.chars().any(char::is_control) {
        return Err("Subscriber identity contains control characters");
    }
    Ok(())
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// A message in flight, paired with its producer's acknowledgement.
pub(crate) struct Envelope {
    message: Message,
    ack: oneshot::Sender<()>,
}

/// Why a hand-off did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandoffError {
    /// The channel was closed before the message was consumed.
    Closed,
    /// The subscriber did not consume the message in time.
    TimedOut,
}

/// Resolves once the owning outlet has been dropped.
async fn wait_closed(closed: &mut watch::Receiver<()>) {
    while closed.changed().await.is_ok() {}
}

/// Registry-side half of a delivery channel.
pub(crate) struct Outlet {
    id: SubscriberId,
    /// Distinguishes successive subscriptions under the same identity.
    generation: u64,
    sender: mpsc::Sender<Envelope>,
    receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    closed: watch::Sender<()>,
}

impl Outlet {
    pub(crate) fn new(id: impl Into<SubscriberId>) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        let (closed, _) = watch::channel(());
        Self {
            id: id.into(),
            generation: GENERATION.fetch_add(1, Ordering::Relaxed),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            closed,
        }
    }

    pub(crate) fn inbox(&self) -> Inbox {
        Inbox {
            id: self.id.clone(),
            generation: self.generation,
            receiver: Arc::clone(&self.receiver),
            closed: self.closed.subscribe(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn handoff(&self) -> Handoff {
        Handoff {
            sender: self.sender.clone(),
            closed: self.closed.subscribe(),
        }
    }

    /// Close the channel. Consumes the outlet so it can only happen once.
    pub(crate) fn close(self) {
        trace!(
            subscriber = %self.id,
            waiters = self.closed.receiver_count(),
            "Closing delivery channel"
        );
    }
}

/// Producer-side half of a single hand-off.
pub(crate) struct Handoff {
    sender: mpsc::Sender<Envelope>,
    closed: watch::Receiver<()>,
}

impl Handoff {
    /// Hand `message` to the subscriber and wait until it is consumed.
    ///
    /// With `timeout` set the wait is bounded. A message whose producer
    /// stopped waiting is discarded by the inbox and never observed.
    pub(crate) async fn send(
        mut self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<(), HandoffError> {
        let (ack, mut acked) = oneshot::channel();
        let envelope = Envelope { message, ack };

        let outcome = {
            let sender = &self.sender;
            let exchange = async {
                sender
                    .send(envelope)
                    .await
                    .map_err(|_| HandoffError::Closed)?;
                (&mut acked).await.map_err(|_| HandoffError::Closed)
            };
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                result = exchange => result,
                () = wait_closed(&mut self.closed) => Err(HandoffError::Closed),
                () = deadline => Err(HandoffError::TimedOut),
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                // The subscriber may have taken it just as we gave up.
                acked.close();
                if acked.try_recv().is_ok() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Read end of a subscriber's delivery channel.
///
/// Only the subscriber's own receive loop should hold an inbox; a second
/// handle for the same identity contends for the same messages.
pub struct Inbox {
    id: SubscriberId,
    generation: u64,
    receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    closed: watch::Receiver<()>,
}

impl Inbox {
    /// The subscriber identity this inbox belongs to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The subscription this inbox was issued for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the subscriber has been unsubscribed. Receiving a
    /// message releases the producer blocked on it.
    pub async fn recv(&mut self) -> Option<Message> {
        let mut receiver = self.receiver.lock().await;
        loop {
            tokio::select! {
                biased;
                () = wait_closed(&mut self.closed) => return None,
                envelope = receiver.recv() => {
                    let Envelope { message, ack } = envelope?;
                    if ack.send(()).is_ok() {
                        trace!(subscriber = %self.id, message = message.id, "Message consumed");
                        return Some(message);
                    }
                    trace!(subscriber = %self.id, message = message.id, "Discarding abandoned message");
                }
            }
        }
    }

    /// Whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.has_changed().is_err()
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("user-42", MAX_IDENTITY_LENGTH).is_ok());
        assert!(validate_identity("", MAX_IDENTITY_LENGTH).is_err());
        assert!(validate_identity("bad\nid", MAX_IDENTITY_LENGTH).is_err());

        let long_id = "a".repeat(MAX_IDENTITY_LENGTH + 1);
        assert!(validate_identity(&long_id, MAX_IDENTITY_LENGTH).is_err());
    }

    #[tokio::test]
    async fn test_handoff_completes_on_consume() {
        let outlet = Outlet::new("alice");
        let mut inbox = outlet.inbox();

        let producer = tokio::spawn(outlet.handoff().send(Message::from("hi"), None));

        let msg = inbox.recv().await.unwrap();
        assert_eq!(&msg.payload[..], b"hi");
        assert_eq!(producer.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_close_wakes_inbox() {
        let outlet = Outlet::new("alice");
        let mut inbox = outlet.inbox();
        assert!(!inbox.is_closed());

        outlet.close();

        assert!(inbox.is_closed());
        assert!(inbox.recv().await.is_none());
        // Stays closed.
        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_blocked_producer() {
        let outlet = Outlet::new("alice");
        let handoff = outlet.handoff();

        let producer = tokio::spawn(handoff.send(Message::from("lost"), None));
        tokio::time::sleep(Duration::from_millis(10)).await;
        outlet.close();

        assert_eq!(producer.await.unwrap(), Err(HandoffError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_message_is_discarded() {
        let outlet = Outlet::new("alice");
        let mut inbox = outlet.inbox();

        let result = outlet
            .handoff()
            .send(Message::from("late"), Some(Duration::from_millis(50)))
            .await;
        assert_eq!(result, Err(HandoffError::TimedOut));

        let producer = tokio::spawn(outlet.handoff().send(Message::from("fresh"), None));
        let msg = inbox.recv().await.unwrap();
        assert_eq!(&msg.payload[..], b"fresh");
        assert_eq!(producer.await.unwrap(), Ok(()));
    }
}

//! The notification hub.
//!
//! The hub keeps a registry of subscriber identities, each owning one
//! single-slot delivery channel, and hands messages from producers to the
//! matching subscriber.

use crate::message::Message;
use crate::outlet::{
    validate_identity, HandoffError, Inbox, Outlet, SubscriberId, MAX_IDENTITY_LENGTH,
};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The identity already has a live subscription.
    #[error("Subscriber {0} already registered")]
    AlreadySubscribed(String),

    /// The identity has no live subscription.
    #[error("Subscriber {0} not registered")]
    NotSubscribed(String),

    /// The subscriber did not consume the message in time.
    #[error("Delivery to subscriber {0} timed out")]
    DeliveryTimeout(String),

    /// Invalid subscriber identity.
    #[error("Invalid subscriber identity: {0}")]
    InvalidIdentity(&'static str),

    /// The registry is full.
    #[error("Maximum subscribers reached ({0})")]
    CapacityReached(usize),
}

impl HubError {
    /// Short, stable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::AlreadySubscribed(_) => "already_subscribed",
            HubError::NotSubscribed(_) => "not_subscribed",
            HubError::DeliveryTimeout(_) => "delivery_timeout",
            HubError::InvalidIdentity(_) => "invalid_identity",
            HubError::CapacityReached(_) => "capacity_reached",
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on a single delivery. `None` waits until the subscriber
    /// consumes the message or goes away.
    pub delivery_timeout: Option<Duration>,
    /// Maximum number of live subscribers.
    pub max_subscribers: usize,
    /// Maximum identity length in bytes.
    pub max_identity_length: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Some(Duration::from_secs(5)),
            max_subscribers: 10_000,
            max_identity_length: MAX_IDENTITY_LENGTH,
        }
    }
}

/// Routes each message to the single subscriber registered under its
/// target identity.
///
/// Registry operations are atomic per identity. No shard lock is held while
/// a delivery waits on its subscriber.
pub struct NotificationHub {
    /// Delivery channels indexed by subscriber identity.
    outlets: DashMap<SubscriberId, Outlet>,
    /// Number of live entries, reserved before insertion.
    live: AtomicUsize,
    config: HubConfig,
}

impl NotificationHub {
    /// Create a new hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating notification hub with config: {:?}", config);
        Self {
            outlets: DashMap::new(),
            live: AtomicUsize::new(0),
            config,
        }
    }

    /// Get the hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            subscriber_count: self.subscriber_count(),
            max_subscribers: self.config.max_subscribers,
        }
    }

    /// Register `id` and create its delivery channel.
    ///
    /// Returns the inbox the subscriber's receive loop should read from.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::AlreadySubscribed`] if `id` is live, or an error if
    /// the identity is invalid or the registry is full.
    pub fn subscribe(&self, id: &str) -> Result<Inbox, HubError> {
        validate_identity(id, self.config.max_identity_length)
            .map_err(HubError::InvalidIdentity)?;

        match self.outlets.entry(id.to_string()) {
            Entry::Occupied(_) => {
                debug!(subscriber = %id, "Subscribe rejected, already registered");
                Err(HubError::AlreadySubscribed(id.to_string()))
            }
            Entry::Vacant(vacant) => {
                let max = self.config.max_subscribers;
                if self
                    .live
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .is_err()
                {
                    warn!(subscriber = %id, max, "Subscribe rejected, hub is full");
                    return Err(HubError::CapacityReached(max));
                }

                let outlet = Outlet::new(id);
                let inbox = outlet.inbox();
                vacant.insert(outlet);

                debug!(subscriber = %id, "Subscribed");
                Ok(inbox)
            }
        }
    }

    /// Close and remove the delivery channel for `id`.
    ///
    /// Any receive loop and any producer still waiting on the channel
    /// observe termination.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotSubscribed`] if `id` is not live.
    pub fn unsubscribe(&self, id: &str) -> Result<(), HubError> {
        let (_, outlet) = self
            .outlets
            .remove(id)
            .ok_or_else(|| HubError::NotSubscribed(id.to_string()))?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        outlet.close();

        debug!(subscriber = %id, "Unsubscribed");
        Ok(())
    }

    /// Unsubscribe the subscription `inbox` was issued for.
    ///
    /// Unlike [`NotificationHub::unsubscribe`], this leaves a newer
    /// subscription under the same identity untouched.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotSubscribed`] if that subscription is no longer
    /// live.
    pub fn release(&self, inbox: &Inbox) -> Result<(), HubError> {
        let id = inbox.id();
        let (_, outlet) = self
            .outlets
            .remove_if(id, |_, outlet| outlet.generation() == inbox.generation())
            .ok_or_else(|| HubError::NotSubscribed(id.to_string()))?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        outlet.close();

        debug!(subscriber = %id, generation = inbox.generation(), "Released");
        Ok(())
    }

    /// Hand `message` to the subscriber registered under `id`.
    ///
    /// Completes once the subscriber's receive loop has taken the message.
    /// The wait is bounded by [`HubConfig::delivery_timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotSubscribed`] if `id` is not live or is
    /// unsubscribed while waiting, and [`HubError::DeliveryTimeout`] if the
    /// subscriber does not consume the message in time. A message that
    /// failed is never observed by the subscriber.
    pub async fn deliver(&self, id: &str, message: Message) -> Result<(), HubError> {
        let handoff = self
            .outlets
            .get(id)
            .map(|outlet| outlet.handoff())
            .ok_or_else(|| HubError::NotSubscribed(id.to_string()))?;

        trace!(subscriber = %id, message = message.id, bytes = message.payload_size(), "Delivering");

        match handoff.send(message, self.config.delivery_timeout).await {
            Ok(()) => {
                trace!(subscriber = %id, "Delivered");
                Ok(())
            }
            Err(HandoffError::Closed) => {
                debug!(subscriber = %id, "Subscriber went away during delivery");
                Err(HubError::NotSubscribed(id.to_string()))
            }
            Err(HandoffError::TimedOut) => {
                warn!(subscriber = %id, timeout = ?self.config.delivery_timeout, "Delivery timed out");
                Err(HubError::DeliveryTimeout(id.to_string()))
            }
        }
    }

    /// Deliver a raw payload to `id`.
    ///
    /// # Errors
    ///
    /// See [`NotificationHub::deliver`].
    pub async fn deliver_to(&self, id: &str, payload: impl Into<Bytes>) -> Result<(), HubError> {
        self.deliver(id, Message::new(payload)).await
    }

    /// Get the receive handle for `id`, or `None` if it is not live.
    #[must_use]
    pub fn receive_handle(&self, id: &str) -> Option<Inbox> {
        self.outlets.get(id).map(|outlet| outlet.inbox())
    }

    /// Check if `id` is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, id: &str) -> bool {
        self.outlets.contains_key(id)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Get all live subscriber identities.
    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<String> {
        self.outlets.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Number of live subscribers.
    pub subscriber_count: usize,
    /// Configured subscriber limit.
    pub max_subscribers: usize,
}

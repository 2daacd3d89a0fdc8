//! Shared helpers for Herald benchmarks.

use herald_core::{HubConfig, NotificationHub};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A hub whose deliveries never time out.
#[must_use]
pub fn unbounded_hub() -> Arc<NotificationHub> {
    Arc::new(NotificationHub::with_config(HubConfig {
        delivery_timeout: None,
        ..HubConfig::default()
    }))
}

/// Subscribe `id` and spawn a receive loop that drains its inbox until the
/// subscriber is removed. Returns the number of messages drained.
///
/// # Panics
///
/// Panics if `id` cannot be subscribed.
pub fn spawn_drain(hub: &NotificationHub, id: &str) -> JoinHandle<u64> {
    let mut inbox = hub.subscribe(id).expect("subscribe bench subscriber");
    tokio::spawn(async move {
        let mut drained = 0;
        while inbox.recv().await.is_some() {
            drained += 1;
        }
        drained
    })
}

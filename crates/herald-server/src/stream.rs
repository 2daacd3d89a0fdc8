//! Subscriber stream lifecycle.
//!
//! Each open stream runs one [`forward`] task that moves messages from the
//! subscriber's inbox to the outbound event queue, and unsubscribes when the
//! client disconnects or the server shuts down.

use crate::metrics::StreamMetricsGuard;
use axum::response::sse::Event;
use herald_core::{Inbox, Message, NotificationHub};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Default SSE event name.
pub const DEFAULT_EVENT: &str = "message";

/// Why a forwarding loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardExit {
    /// The outbound event queue was dropped (client disconnected).
    ClientGone,
    /// The server is shutting down.
    Shutdown,
    /// The subscriber's channel was closed by the hub.
    Closed,
}

/// Convert a hub message into an SSE event.
#[must_use]
pub fn to_event(message: &Message) -> Event {
    // SSE data lines cannot carry carriage returns.
    let data = message.payload_text().replace('\r', "");
    Event::default()
        .event(message.event.as_deref().unwrap_or(DEFAULT_EVENT))
        .id(message.id.to_string())
        .data(data)
}

/// Resolves once `shutdown` flips to `true` or its sender is gone.
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *shutdown.borrow_and_update();
        if stopping || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Forward messages for one subscriber until the stream ends, then
/// unsubscribe it.
///
/// A message is only taken from the inbox once the outbound queue has room
/// for it, so the producer is released when the event is queued for the
/// client.
pub async fn forward(
    hub: Arc<NotificationHub>,
    mut inbox: Inbox,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> ForwardExit {
    let _metrics_guard = StreamMetricsGuard::new();
    debug!(subscriber = %inbox.id(), "Stream opened");

    let exit = loop {
        let permit = tokio::select! {
            biased;
            () = shutdown_signalled(&mut shutdown) => break ForwardExit::Shutdown,
            permit = events.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break ForwardExit::ClientGone,
            },
        };

        tokio::select! {
            biased;
            () = events.closed() => break ForwardExit::ClientGone,
            () = shutdown_signalled(&mut shutdown) => break ForwardExit::Shutdown,
            message = inbox.recv() => match message {
                Some(message) => permit.send(to_event(&message)),
                None => break ForwardExit::Closed,
            },
        }
    };

    // A closed inbox no longer owns a registry entry; the identity may
    // already belong to a newer stream.
    if exit == ForwardExit::Closed {
        debug!(subscriber = %inbox.id(), reason = ?exit, "Stream closed");
    } else {
        match hub.release(&inbox) {
            Ok(()) => debug!(subscriber = %inbox.id(), reason = ?exit, "Stream closed"),
            Err(e) => debug!(
                subscriber = %inbox.id(),
                reason = ?exit,
                error = %e,
                "Stream closed without registry entry"
            ),
        }
    }
    crate::metrics::set_active_subscribers(hub.subscriber_count());

    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::HubError;

    type Opened = (
        mpsc::Receiver<Event>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<ForwardExit>,
    );

    fn open(hub: &Arc<NotificationHub>, id: &str) -> Opened {
        let inbox = hub.subscribe(id).unwrap();
        let (events_tx, events_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(forward(Arc::clone(hub), inbox, events_tx, shutdown_rx));
        (events_rx, shutdown_tx, task)
    }

    #[tokio::test]
    async fn test_forward_delivers_event() {
        let hub = Arc::new(NotificationHub::new());
        let (mut events, _shutdown, _task) = open(&hub, "alice");

        hub.deliver_to("alice", "hello").await.unwrap();
        assert!(events.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_forward_client_disconnect_unsubscribes() {
        let hub = Arc::new(NotificationHub::new());
        let (events, _shutdown, task) = open(&hub, "alice");

        drop(events);

        assert_eq!(task.await.unwrap(), ForwardExit::ClientGone);
        assert!(!hub.is_subscribed("alice"));
        assert_eq!(
            hub.deliver_to("alice", "anyone?").await.unwrap_err(),
            HubError::NotSubscribed("alice".into())
        );
    }

    #[tokio::test]
    async fn test_forward_shutdown_unsubscribes() {
        let hub = Arc::new(NotificationHub::new());
        let (_events, shutdown, task) = open(&hub, "alice");

        shutdown.send(true).unwrap();

        assert_eq!(task.await.unwrap(), ForwardExit::Shutdown);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_exits_when_channel_closed() {
        let hub = Arc::new(NotificationHub::new());
        let (_events, _shutdown, task) = open(&hub, "alice");

        hub.unsubscribe("alice").unwrap();

        assert_eq!(task.await.unwrap(), ForwardExit::Closed);
    }

    #[tokio::test]
    async fn test_closed_stream_leaves_new_subscription() {
        let hub = Arc::new(NotificationHub::new());
        let (_events, _shutdown, task) = open(&hub, "alice");
        tokio::task::yield_now().await;

        hub.unsubscribe("alice").unwrap();
        let _fresh = hub.subscribe("alice").unwrap();

        assert_eq!(task.await.unwrap(), ForwardExit::Closed);
        assert!(hub.is_subscribed("alice"));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_after_resubscribe_leaves_new_subscription() {
        let hub = Arc::new(NotificationHub::new());
        let stale = hub.subscribe("alice").unwrap();
        hub.unsubscribe("alice").unwrap();
        let _fresh = hub.subscribe("alice").unwrap();

        let (events_tx, events_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(events_rx);

        // The dropped client is seen first, so the stale inbox is released.
        let exit = forward(Arc::clone(&hub), stale, events_tx, shutdown_rx).await;
        assert_eq!(exit, ForwardExit::ClientGone);
        assert!(hub.is_subscribed("alice"));
    }

    #[test]
    fn test_event_strips_carriage_returns() {
        let message = Message::from("line one\r\nline two").with_event("note");
        // Event::data panics on '\r'; building the event must succeed.
        let _event = to_event(&message);
    }
}

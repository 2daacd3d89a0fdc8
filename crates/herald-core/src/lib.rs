//! # herald-core
//!
//! In-memory notification hub for the Herald push server.
//!
//! This crate provides the building blocks:
//!
//! - **NotificationHub** - Registry of subscriber identities and message hand-off
//! - **Inbox** - Read end of one subscriber's delivery channel
//! - **Message** - Opaque payload with optional event metadata
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  deliver  ┌──────────────────┐  recv  ┌────────────┐
//! │  Producer  │──────────▶│ NotificationHub  │───────▶│   Inbox    │
//! └────────────┘           │ id -> Outlet     │        └────────────┘
//!                          └──────────────────┘
//! ```
//!
//! Each identity owns a single-slot channel. A delivery completes only once
//! the subscriber has taken the message, so messages to one identity are
//! observed in the order they were delivered.

pub mod hub;
pub mod message;
pub mod outlet;

pub use hub::{HubConfig, HubError, HubStats, NotificationHub};
pub use message::{Message, MessageId};
pub use outlet::{validate_identity, Inbox, SubscriberId, MAX_IDENTITY_LENGTH};

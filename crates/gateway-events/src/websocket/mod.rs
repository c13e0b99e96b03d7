//! Real-time status fan-out over WebSocket.

mod broadcaster;
mod connection;
mod event_registry;
mod server;
mod subscription;

pub use broadcaster::Broadcaster;
pub use connection::{ConnectionHandle, STALE_CONNECTION_TIMEOUT};
pub use event_registry::{event_metadata, get_event_type, EventTypeInfo};
pub use server::{close_code, handle_upgrade, WsIdentity};
pub use subscription::{Subscription, SubscriptionFilters, SubscriptionManager};

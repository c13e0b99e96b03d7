//! The event fabric: resilient Redis pub/sub listening, cross-process
//! cache invalidation, and the WebSocket status broadcaster.

pub mod invalidation;
pub mod redis_listener;
pub mod websocket;

pub use invalidation::{run_user_blocked_listener, USER_BLOCKED_CHANNEL};
pub use redis_listener::{
    publish, resilient_listener, ListenerObserver, ListenerRegistry, ListenerSnapshot, ListenerStatus,
    NullListenerObserver,
};
pub use websocket::{Broadcaster, WsIdentity};

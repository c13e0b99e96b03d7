//! Listens on `prompt_guard_config_reload` and atomically swaps the
//! in-memory config every gateway process holds a copy of. Unlike
//! `user_blocked`, this channel carries the whole replacement value, not
//! an invalidation hint — there is nothing to look up, just a swap.

use std::sync::{Arc, RwLock};

use gateway_events::{resilient_listener, ListenerObserver, ListenerRegistry};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const PROMPT_GUARD_CONFIG_RELOAD_CHANNEL: &str = "prompt_guard_config_reload";

/// The gateway's current prompt-guard configuration, replaced wholesale on
/// every reload message and read by whatever request-path code consults it.
#[derive(Clone, Default)]
pub struct PromptGuardConfig {
    current: Arc<RwLock<Value>>,
}

impl PromptGuardConfig {
    #[must_use]
    pub fn get(&self) -> Value {
        self.current.read().expect("prompt guard config lock poisoned").clone()
    }

    fn replace(&self, new_value: Value) {
        *self.current.write().expect("prompt guard config lock poisoned") = new_value;
    }
}

pub async fn run_prompt_guard_reload_listener(
    client: redis::Client,
    config: PromptGuardConfig,
    registry: Arc<ListenerRegistry>,
    observer: Arc<dyn ListenerObserver>,
    shutdown: watch::Receiver<()>,
) {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        if shutdown.changed().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    resilient_listener(
        client,
        PROMPT_GUARD_CONFIG_RELOAD_CHANNEL,
        "prompt-guard-config-reload",
        registry,
        observer,
        move |payload| {
            let config = config.clone();
            async move {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(new_value) => {
                        debug!("replacing prompt guard config after reload event");
                        config.replace(new_value);
                    }
                    Err(e) => warn!(error = %e, "malformed prompt_guard_config_reload payload, ignoring"),
                }
            }
        },
        rx,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_the_whole_value() {
        let config = PromptGuardConfig::default();
        assert_eq!(config.get(), Value::Null);
        config.replace(serde_json::json!({ "blocked_terms": ["x"] }));
        assert_eq!(config.get(), serde_json::json!({ "blocked_terms": ["x"] }));
    }
}

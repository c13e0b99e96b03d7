//! Background reconciliation loop: health-checks active upstreams, retries
//! ones that previously failed, and renews connections that have aged out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::registry::{Registry, UpstreamConfig};

/// Cadence of the coordinator's reconciliation pass.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Supplies the coordinator with the upstream set an external source of
/// truth currently wants configured. Kept as a trait so the dispatcher's
/// config/database layer can be swapped in without the coordinator knowing
/// about it.
#[async_trait::async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn desired_upstreams(&self) -> Vec<UpstreamConfig>;
}

/// Drives [`Registry`] reconciliation on a fixed interval.
pub struct Coordinator {
    registry: Arc<Registry>,
    source: Arc<dyn DesiredStateSource>,
    recovery_queue: Mutex<VecDeque<UpstreamConfig>>,
    tick_interval: Duration,
}

impl Coordinator {
    #[must_use]
    pub fn new(registry: Arc<Registry>, source: Arc<dyn DesiredStateSource>) -> Self {
        Self { registry, source, recovery_queue: Mutex::new(VecDeque::new()), tick_interval: TICK_INTERVAL }
    }

    /// Run the reconciliation loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("coordinator shutting down");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass: scan for config changes, retry queued
    /// recoveries, renew any connection past its max age, then probe every
    /// loaded upstream for silent failures.
    pub async fn tick(&self) {
        self.scan_desired_state().await;
        self.attempt_recoveries().await;
        self.renew_stale_connections().await;
        self.run_health_checks().await;
    }

    async fn scan_desired_state(&self) {
        let desired = self.source.desired_upstreams().await;
        let diff = self.registry.diff(&desired).await;

        for config in diff.new {
            debug!(upstream = %config.name, "loading newly configured upstream");
            self.load_or_queue(config).await;
        }
        for config in diff.changed {
            debug!(upstream = %config.name, "reloading changed upstream");
            self.registry.unload(&config.name).await;
            self.load_or_queue(config).await;
        }
        for name in diff.removed {
            debug!(upstream = %name, "unloading removed upstream");
            self.registry.unload(&name).await;
        }
    }

    async fn load_or_queue(&self, config: UpstreamConfig) {
        if let Err(e) = self.registry.load(config.clone()).await {
            warn!(upstream = %config.name, error = %e, "load failed, queuing for recovery");
            self.recovery_queue.lock().await.push_back(config);
        }
    }

    async fn attempt_recoveries(&self) {
        let pending: Vec<UpstreamConfig> = self.recovery_queue.lock().await.drain(..).collect();
        for config in pending {
            match self.registry.load(config.clone()).await {
                Ok(()) => info!(upstream = %config.name, "recovered"),
                Err(e) => {
                    debug!(upstream = %config.name, error = %e, "still failing, re-queuing");
                    self.recovery_queue.lock().await.push_back(config);
                }
            }
        }
    }

    async fn renew_stale_connections(&self) {
        for name in self.registry.stale_connections().await {
            debug!(upstream = %name, "connection aged out, renewing");
            if let Err(e) = self.registry.reconnect(&name).await {
                warn!(upstream = %name, error = %e, "renewal failed");
            }
        }
    }

    /// Lightweight `ping` against every loaded upstream to catch a session
    /// that has died silently between catalog refreshes. A failing upstream
    /// is unloaded and its config re-queued for recovery, same as a load
    /// failure — the next `attempt_recoveries` pass will retry it unless its
    /// breaker is now open.
    async fn run_health_checks(&self) {
        for name in self.registry.loaded_upstreams().await {
            if let Err(e) = self.registry.health_check(&name).await {
                warn!(upstream = %name, error = %e, "health check failed, unloading for recovery");
                if let Some(config) = self.registry.config(&name).await {
                    self.registry.unload(&name).await;
                    self.recovery_queue.lock().await.push_back(config);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use gateway_core::TransportKind;

    struct FixedSource(Vec<UpstreamConfig>);

    #[async_trait::async_trait]
    impl DesiredStateSource for FixedSource {
        async fn desired_upstreams(&self) -> Vec<UpstreamConfig> {
            self.0.clone()
        }
    }

    fn config(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            base_url: format!("https://{name}.invalid/"),
            transport: TransportKind::HttpStreamable,
            auth_token: None,
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_lands_in_recovery_queue_not_panics() {
        let registry = Arc::new(Registry::with_null_observer(Arc::new(CircuitBreaker::with_defaults())));
        let source = Arc::new(FixedSource(vec![config("unreachable")]));
        let coordinator = Coordinator::new(registry.clone(), source);

        coordinator.tick().await;

        assert!(registry.status("unreachable").await.is_none());
        let queue_len = coordinator.recovery_queue.lock().await.len();
        assert_eq!(queue_len, 1);
    }

    #[tokio::test]
    async fn health_check_pass_is_a_no_op_with_nothing_loaded() {
        let registry = Arc::new(Registry::with_null_observer(Arc::new(CircuitBreaker::with_defaults())));
        let source = Arc::new(FixedSource(vec![]));
        let coordinator = Coordinator::new(registry, source);

        coordinator.run_health_checks().await;

        assert!(coordinator.recovery_queue.lock().await.is_empty());
    }
}

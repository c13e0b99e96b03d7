//! MCP Gateway - Entry Point
//!
//! This binary starts the gateway's HTTP/WebSocket dispatcher alongside
//! its background reconciliation and invalidation tasks.

mod config;
mod desired_state;
mod observers;
mod prompt_guard_config;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_dispatcher::{GatewayState, HttpAuthService, HttpUserBlockStore, TokenCache};
use gateway_events::{Broadcaster, ListenerRegistry};
use gateway_orchestrator::{CircuitBreaker, Coordinator, Registry, SessionCache, ToolCache};

use config::Config;
use desired_state::HttpDesiredStateSource;
use observers::{BroadcastingBreakerObserver, BroadcastingListenerObserver, BroadcastingRegistryObserver};
use prompt_guard_config::{run_prompt_guard_reload_listener, PromptGuardConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gateway_server=info,warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "gateway exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> std::io::Result<()> {
    let http_client = reqwest::Client::new();
    let redis_client = match redis::Client::open(config.redis_url.clone()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "invalid redis url");
            std::process::exit(1);
        }
    };

    let broadcaster = Arc::new(Broadcaster::new(false));
    let breaker = Arc::new(CircuitBreaker::new(
        Default::default(),
        Arc::new(BroadcastingBreakerObserver::new(broadcaster.clone())),
    ));
    let registry = Arc::new(Registry::new(breaker, Arc::new(BroadcastingRegistryObserver::new(broadcaster.clone()))));
    let session_cache = Arc::new(SessionCache::with_default_ttl());
    let tool_cache = Arc::new(ToolCache::with_defaults());
    let token_cache = Arc::new(TokenCache::new(config.token_cache_ttl));
    let auth = Arc::new(HttpAuthService::new(http_client.clone(), config.auth_validate_url.clone()));
    let user_blocks = Arc::new(HttpUserBlockStore::new(http_client.clone(), config.user_block_base_url.clone()));
    let ws_allowed_roles = config.ws_allowed_roles.iter().cloned().collect();

    let state = GatewayState::new(
        registry.clone(),
        session_cache.clone(),
        tool_cache,
        token_cache,
        auth,
        user_blocks,
        broadcaster.clone(),
        ws_allowed_roles,
    );

    let desired_state = Arc::new(HttpDesiredStateSource::new(http_client, config.admin_store_url.clone()));
    let coordinator = Arc::new(Coordinator::new(registry, desired_state));
    let listener_registry = Arc::new(ListenerRegistry::new());
    let listener_observer = Arc::new(BroadcastingListenerObserver::new(broadcaster.clone()));
    let prompt_guard_config = PromptGuardConfig::default();

    let (coordinator_shutdown_tx, coordinator_shutdown_rx) = mpsc::channel(1);
    let (sweeper_shutdown_tx, sweeper_shutdown_rx) = mpsc::channel(1);
    let (bus_shutdown_tx, bus_shutdown_rx) = watch::channel(());
    let (dispatcher_shutdown_tx, dispatcher_shutdown_rx) = watch::channel(());

    let coordinator_handle = tokio::spawn(async move { coordinator.run(coordinator_shutdown_rx).await });
    let sweeper_handle = tokio::spawn(broadcaster.clone().run_sweeper(sweeper_shutdown_rx));
    let bus_handle = tokio::spawn(gateway_events::run_user_blocked_listener(
        redis_client.clone(),
        session_cache,
        broadcaster,
        listener_registry.clone(),
        listener_observer.clone(),
        bus_shutdown_rx.clone(),
    ));
    let prompt_guard_handle = tokio::spawn(run_prompt_guard_reload_listener(
        redis_client,
        prompt_guard_config,
        listener_registry,
        listener_observer,
        bus_shutdown_rx,
    ));

    let dispatcher_handle = tokio::spawn(gateway_dispatcher::run(config.bind_address, state, dispatcher_shutdown_rx));

    info!(addr = %config.bind_address, "gateway started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = coordinator_shutdown_tx.send(()).await;
    let _ = sweeper_shutdown_tx.send(()).await;
    let _ = bus_shutdown_tx.send(());
    let _ = dispatcher_shutdown_tx.send(());

    let _ = coordinator_handle.await;
    let _ = sweeper_handle.await;
    let _ = bus_handle.await;
    let _ = prompt_guard_handle.await;
    let _ = dispatcher_handle.await;

    Ok(())
}

//! Polls the external upstream-definition store the coordinator uses as
//! its source of truth. Inactive upstreams are simply omitted — the
//! registry only ever hears about upstreams it should have a session for.

use std::sync::RwLock;

use async_trait::async_trait;
use gateway_orchestrator::{DesiredStateSource, UpstreamConfig};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct UpstreamRecord {
    name: String,
    base_url: String,
    transport: gateway_core::TransportKind,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default = "default_active")]
    admin_status_active: bool,
}

fn default_active() -> bool {
    true
}

pub struct HttpDesiredStateSource {
    client: reqwest::Client,
    store_url: String,
    /// Last successfully fetched list, served back on a transient outage so
    /// a poll failure never reads as "every upstream was just removed".
    last_known_good: RwLock<Vec<UpstreamConfig>>,
}

impl HttpDesiredStateSource {
    #[must_use]
    pub fn new(client: reqwest::Client, store_url: impl Into<String>) -> Self {
        Self { client, store_url: store_url.into(), last_known_good: RwLock::new(Vec::new()) }
    }
}

#[async_trait]
impl DesiredStateSource for HttpDesiredStateSource {
    async fn desired_upstreams(&self) -> Vec<UpstreamConfig> {
        let records = match self.client.get(&self.store_url).send().await {
            Ok(response) => match response.json::<Vec<UpstreamRecord>>().await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "admin store returned unparseable upstream list, keeping last known good");
                    return self.last_known_good.read().expect("lock poisoned").clone();
                }
            },
            Err(e) => {
                warn!(error = %e, "admin store unreachable, keeping last known good upstream list");
                return self.last_known_good.read().expect("lock poisoned").clone();
            }
        };

        let desired: Vec<UpstreamConfig> = records
            .into_iter()
            .filter(|r| r.admin_status_active)
            .map(|r| UpstreamConfig { name: r.name, base_url: r.base_url, transport: r.transport, auth_token: r.auth_token })
            .collect();

        *self.last_known_good.write().expect("lock poisoned") = desired.clone();
        desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_store_falls_back_to_last_known_good() {
        let source = HttpDesiredStateSource::new(reqwest::Client::new(), "http://127.0.0.1:1/upstreams");
        *source.last_known_good.write().unwrap() = vec![UpstreamConfig {
            name: "weather".to_string(),
            base_url: "http://weather.internal".to_string(),
            transport: gateway_core::TransportKind::HttpStreamable,
            auth_token: None,
        }];

        let desired = source.desired_upstreams().await;
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].name, "weather");
    }
}

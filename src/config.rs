use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::selector::SelectorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Namespace assumed for function references without a `.namespace`
    /// suffix.
    pub default_namespace: String,
    /// Port replicas serve invocations and health probes on.
    pub watchdog_port: u16,
    pub probe_timeout_ms: u64,
    pub queue_capacity: usize,
    pub queue_max_wait_ms: u64,
    /// Caller-side reply deadline; must exceed `queue_max_wait_ms`.
    pub queue_outer_deadline_ms: u64,
    pub queue_max_retries: u32,
    pub immediate_try_limit: u32,
    pub retry_backoff_ms: u64,
    /// How long a replica may sit busy before reconciliation presumes the
    /// mark-idle callback was lost and resets it.
    pub stuck_busy_ttl_secs: u64,
    /// Query key the request-correlation token is emitted under.
    pub correlation_header: String,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            request_timeout_ms: 2000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            default_namespace: "default".to_string(),
            watchdog_port: 8080,
            probe_timeout_ms: 500,
            queue_capacity: 10,
            queue_max_wait_ms: 100,
            queue_outer_deadline_ms: 150,
            queue_max_retries: 10,
            immediate_try_limit: 3,
            retry_backoff_ms: 10,
            stuck_busy_ttl_secs: 15 * 60,
            correlation_header: "X-Correlation-Id".to_string(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            anyhow::bail!("invalid listen address: {}", self.listen_addr);
        }
        if self.probe_timeout_ms == 0 {
            anyhow::bail!("probe_timeout_ms must be positive");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be positive");
        }
        if self.immediate_try_limit == 0 {
            anyhow::bail!("immediate_try_limit must be positive");
        }
        if self.queue_outer_deadline_ms <= self.queue_max_wait_ms {
            anyhow::bail!(
                "queue_outer_deadline_ms ({}) must exceed queue_max_wait_ms ({})",
                self.queue_outer_deadline_ms,
                self.queue_max_wait_ms
            );
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stuck_busy_ttl(&self) -> Duration {
        Duration::from_secs(self.stuck_busy_ttl_secs)
    }

    pub fn orchestrator_request_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.request_timeout_ms)
    }

    pub fn selector(&self) -> SelectorConfig {
        SelectorConfig {
            immediate_try_limit: self.immediate_try_limit,
            queue_capacity: self.queue_capacity,
            queue_max_wait: Duration::from_millis(self.queue_max_wait_ms),
            queue_outer_deadline: Duration::from_millis(self.queue_outer_deadline_ms),
            queue_max_retries: self.queue_max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

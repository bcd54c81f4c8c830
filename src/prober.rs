use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use tracing::debug;

/// Health endpoint served by the replica watchdog. Not every function
/// implements `/_/ready`, so probe the health path.
const HEALTH_PATH: &str = "/_/health";

/// Short-timeout liveness probe against a replica's watchdog port. One shot
/// per call; retry policy belongs to the selector.
pub struct LivenessProber {
    client: reqwest::Client,
    watchdog_port: u16,
}

impl LivenessProber {
    pub fn new(watchdog_port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("error building probe http client")?;
        Ok(Self {
            client,
            watchdog_port,
        })
    }

    /// `true` iff the replica answers HTTP 200 within the probe timeout.
    pub async fn is_alive(&self, ip: &str) -> bool {
        if ip.is_empty() {
            return false;
        }

        let url = format!("http://{}:{}{}", ip, self.watchdog_port, HEALTH_PATH);
        match self.client.get(&url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                debug!(ip, "liveness probe failed: {}", err);
                false
            }
        }
    }
}

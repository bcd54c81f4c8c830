use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use axum::http::StatusCode;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, info};

use crate::{
    data_model::{EndpointAddress, FunctionRef, ReplicaRecord},
    metrics::RouterMetrics,
    orchestrator::{Orchestrator, MAX_INFLIGHT_ENV},
    prober::LivenessProber,
    reconciler::EndpointReconciler,
    state_store::ReplicaStatusStore,
};

mod queue;
pub use queue::QueuedRequest;

/// Errors surfaced by [`IdleFirstSelector::select`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no endpoint addresses supplied")]
    NoCandidates,
    /// Immediate attempt exhausted; internal, callers see the queue verdict.
    #[error("no idle replicas available")]
    NoIdleReplicas,
    #[error("request queue full")]
    QueueFull,
    #[error("request queue full after {attempts} retries")]
    QueueFullOnRetry { attempts: u32 },
    #[error("no idle replica within {waited_ms} ms")]
    Timeout { waited_ms: u64 },
    #[error("retries exhausted after {attempts} attempts, no idle replicas")]
    RetriesExhausted { attempts: u32 },
    #[error("selected index {index} out of range")]
    InvalidIndex { index: usize },
}

impl SelectError {
    /// Status the HTTP layer maps this error onto: 503 when the condition
    /// is load and may clear, 502/500 otherwise.
    pub fn http_status(&self) -> StatusCode {
        match self {
            SelectError::NoIdleReplicas
            | SelectError::QueueFull
            | SelectError::QueueFullOnRetry { .. }
            | SelectError::Timeout { .. }
            | SelectError::RetriesExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SelectError::NoCandidates => StatusCode::BAD_GATEWAY,
            SelectError::InvalidIndex { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Iteration cap for the immediate attempt.
    pub immediate_try_limit: u32,
    /// Capacity of each per-function request queue.
    pub queue_capacity: usize,
    /// Deadline a queued request is retried within.
    pub queue_max_wait: Duration,
    /// Caller-side wait on the reply channel, a safety belt beyond
    /// `queue_max_wait`.
    pub queue_outer_deadline: Duration,
    /// Retry cap per queued request.
    pub queue_max_retries: u32,
    /// Pause between retries of a queued request.
    pub retry_backoff: Duration,
}

/// Picks one replica for an inbound invocation: reconcile the status cache,
/// try an idle replica up to the immediate limit, and fall back to a
/// bounded per-function retry queue when nothing is free.
///
/// The ceiling cache, the queue table and their consumers all live on this
/// value; construct once at startup and share through an `Arc`.
pub struct IdleFirstSelector {
    store: Arc<ReplicaStatusStore>,
    reconciler: Arc<EndpointReconciler>,
    prober: Arc<LivenessProber>,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Arc<RouterMetrics>,
    config: SelectorConfig,
    /// Per-function ceiling cache. The cell deduplicates concurrent
    /// lookups and caches a found ceiling indefinitely; a failed lookup
    /// leaves it empty so the next call retries.
    ceilings: DashMap<FunctionRef, Arc<OnceCell<u32>>>,
    queues: DashMap<FunctionRef, mpsc::Sender<QueuedRequest>>,
    shutdown_rx: watch::Receiver<()>,
}

impl IdleFirstSelector {
    pub fn new(
        store: Arc<ReplicaStatusStore>,
        reconciler: Arc<EndpointReconciler>,
        prober: Arc<LivenessProber>,
        orchestrator: Arc<dyn Orchestrator>,
        metrics: Arc<RouterMetrics>,
        config: SelectorConfig,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            store,
            reconciler,
            prober,
            orchestrator,
            metrics,
            config,
            ceilings: DashMap::new(),
            queues: DashMap::new(),
            shutdown_rx,
        }
    }

    /// Select a replica for `function` among `addresses` and claim one
    /// in-flight slot on it. Returns the index of the chosen replica in
    /// `addresses`; the caller must release the slot when the downstream
    /// call completes.
    pub async fn select(
        self: &Arc<Self>,
        request_id: &str,
        function: &FunctionRef,
        addresses: &[EndpointAddress],
    ) -> Result<usize, SelectError> {
        if addresses.is_empty() {
            return Err(SelectError::NoCandidates);
        }

        let ceiling = self.function_ceiling(function).await;
        self.reconciler
            .prune_by_addresses(request_id, function, Some(addresses), ceiling)
            .await;

        match self
            .try_select_idle(request_id, function, addresses, ceiling)
            .await
        {
            Ok(index) => Ok(index),
            Err(_) => {
                debug!(
                    request_id,
                    function = %function,
                    "no idle replica on immediate attempt, queueing"
                );
                self.queue_and_wait(request_id, function, addresses).await
            }
        }
    }

    /// One pass of the immediate attempt: pick uniformly at random among
    /// idle candidates, probe, claim. A lost claim race refreshes the
    /// candidate list; a failed probe removes the candidate. Every
    /// iteration counts against the limit.
    pub(crate) async fn try_select_idle(
        &self,
        request_id: &str,
        function: &FunctionRef,
        addresses: &[EndpointAddress],
        ceiling: Option<u32>,
    ) -> Result<usize, SelectError> {
        let mut candidates =
            idle_candidates(&self.store.get_by_function(function).await, addresses, ceiling);

        let mut tries = 0;
        while tries < self.config.immediate_try_limit && !candidates.is_empty() {
            let selected = match candidates.choose(&mut rand::thread_rng()).cloned() {
                Some(selected) => selected,
                None => break,
            };

            if self.prober.is_alive(&selected.ip).await {
                if let Some(index) = addresses.iter().position(|a| a.ip == selected.ip) {
                    if self.store.try_claim(&selected.name, &selected.ip) {
                        info!(
                            request_id,
                            function = %function,
                            replica = %selected.key(),
                            index,
                            "selected idle replica"
                        );
                        return Ok(index);
                    }
                    // Another claimant won the replica; resync and rebuild
                    // the candidate list.
                    self.reconciler
                        .prune_by_addresses(request_id, function, Some(addresses), ceiling)
                        .await;
                    candidates = idle_candidates(
                        &self.store.get_by_function(function).await,
                        addresses,
                        ceiling,
                    );
                    tries += 1;
                    continue;
                }
            }

            candidates.retain(|r| r.ip != selected.ip);
            tries += 1;
        }

        Err(SelectError::NoIdleReplicas)
    }

    /// The per-replica in-flight ceiling configured on the function's
    /// deployment, or `None` when the function is unbounded (or the lookup
    /// failed and will be retried on the next call).
    pub(crate) async fn function_ceiling(&self, function: &FunctionRef) -> Option<u32> {
        let cell = self.ceilings.entry(function.clone()).or_default().clone();

        let result = cell
            .get_or_try_init(|| async {
                let env = self.orchestrator.deployment_env(function).await?;
                let raw = env.get(MAX_INFLIGHT_ENV).ok_or_else(|| {
                    anyhow!("{} not set in deployment environment", MAX_INFLIGHT_ENV)
                })?;
                let ceiling: u32 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid {} value {:?}", MAX_INFLIGHT_ENV, raw))?;
                if ceiling == 0 {
                    anyhow::bail!("{} must be positive, got 0", MAX_INFLIGHT_ENV);
                }
                Ok::<u32, anyhow::Error>(ceiling)
            })
            .await;

        match result {
            Ok(ceiling) => Some(*ceiling),
            Err(err) => {
                debug!(
                    function = %function,
                    "no in-flight ceiling, treating as unbounded: {:#}",
                    err
                );
                None
            }
        }
    }
}

/// Replicas eligible for selection: idle, below the function ceiling, and
/// present in the caller's address list.
fn idle_candidates(
    records: &[ReplicaRecord],
    addresses: &[EndpointAddress],
    ceiling: Option<u32>,
) -> Vec<ReplicaRecord> {
    let address_ips: HashSet<&str> = addresses.iter().map(|a| a.ip.as_str()).collect();
    let limit = ceiling.unwrap_or(u32::MAX);
    records
        .iter()
        .filter(|r| {
            r.state.is_idle()
                && r.active_connections < limit
                && address_ips.contains(r.ip.as_str())
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use crate::data_model::ReplicaState;

    use super::*;

    fn record(name: &str, ip: &str, state: ReplicaState, connections: u32) -> ReplicaRecord {
        ReplicaRecord {
            name: name.to_string(),
            ip: ip.to_string(),
            uid: None,
            function: "echo".to_string(),
            namespace: "default".to_string(),
            state,
            active_connections: connections,
            max_inflight: Some(5),
            updated_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_idle_candidates_filter() {
        let records = vec![
            record("p1", "10.0.0.1", ReplicaState::Idle, 0),
            record("p2", "10.0.0.2", ReplicaState::Busy, 5),
            record("p3", "10.0.0.3", ReplicaState::Idle, 4),
            // Idle but absent from the caller's address list.
            record("p4", "10.0.0.4", ReplicaState::Idle, 0),
        ];
        let addresses = vec![
            EndpointAddress::new("10.0.0.1"),
            EndpointAddress::new("10.0.0.2"),
            EndpointAddress::new("10.0.0.3"),
        ];

        let names: Vec<_> = idle_candidates(&records, &addresses, Some(5))
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["p1".to_string(), "p3".to_string()]);

        // A tighter ceiling excludes the replica sitting at 4 connections.
        let names: Vec<_> = idle_candidates(&records, &addresses, Some(4))
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["p1".to_string()]);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            SelectError::Timeout { waited_ms: 150 }.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SelectError::QueueFull.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SelectError::RetriesExhausted { attempts: 10 }.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SelectError::NoCandidates.http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            SelectError::InvalidIndex { index: 7 }.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

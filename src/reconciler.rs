use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    data_model::{EndpointAddress, FunctionRef, ReplicaRecord, ReplicaState, StatusCommand},
    metrics::RouterMetrics,
    orchestrator::Orchestrator,
    state_store::ReplicaStatusStore,
};

/// Synchronizes the status store with the orchestrator's endpoint snapshot
/// for one function: stale records go, new endpoints come in idle, replicas
/// whose identity token changed are reset, and busy states older than the
/// TTL are recovered.
pub struct EndpointReconciler {
    store: Arc<ReplicaStatusStore>,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Arc<RouterMetrics>,
    stuck_busy_ttl: Duration,
}

impl EndpointReconciler {
    pub fn new(
        store: Arc<ReplicaStatusStore>,
        orchestrator: Arc<dyn Orchestrator>,
        metrics: Arc<RouterMetrics>,
        stuck_busy_ttl: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            metrics,
            stuck_busy_ttl,
        }
    }

    /// Reconcile the store against `addresses`, fetching the snapshot from
    /// the orchestrator when the caller supplies none. Idempotent; safe to
    /// run concurrently across functions. Orchestrator failures leave the
    /// store untouched.
    pub async fn prune_by_addresses(
        &self,
        request_id: &str,
        function: &FunctionRef,
        addresses: Option<&[EndpointAddress]>,
        max_inflight: Option<u32>,
    ) {
        let lock = self.store.function_lock(function);
        let _guard = lock.lock().await;

        let snapshot = match addresses {
            Some(addresses) if !addresses.is_empty() => addresses.to_vec(),
            _ => match self.orchestrator.endpoints(function).await {
                Ok(addresses) => addresses,
                Err(err) => {
                    warn!(
                        request_id,
                        function = %function,
                        "failed to refresh endpoints, keeping cached records: {:#}",
                        err
                    );
                    return;
                }
            },
        };

        let address_set: HashMap<&str, &EndpointAddress> =
            snapshot.iter().map(|a| (a.ip.as_str(), a)).collect();

        // 1. Remove records whose IP left the endpoint set.
        for record in self.store.records_for_function(function) {
            if !address_set.contains_key(record.ip.as_str()) {
                debug!(
                    request_id,
                    function = %function,
                    replica = %record.key(),
                    "removing stale replica"
                );
                self.store.remove(&record.key());
            }
        }

        // 2. Check survivors for identity changes, insert new endpoints idle.
        let by_ip: HashMap<String, ReplicaRecord> = self
            .store
            .records_for_function(function)
            .into_iter()
            .map(|r| (r.ip.clone(), r))
            .collect();

        for (ip, address) in address_set {
            match by_ip.get(ip) {
                Some(record) => {
                    self.check_existing(request_id, function, record, address)
                        .await
                }
                None => self.insert_idle(request_id, function, address, max_inflight).await,
            }
        }
    }

    async fn check_existing(
        &self,
        request_id: &str,
        function: &FunctionRef,
        record: &ReplicaRecord,
        address: &EndpointAddress,
    ) {
        match self.desired_uid(&function.namespace, address).await {
            Ok(Some(current_uid)) => {
                if record.uid.as_deref() != Some(current_uid.as_str()) {
                    // The IP was reused by a re-created replica; its
                    // in-flight counter belongs to the dead one.
                    info!(
                        request_id,
                        function = %function,
                        replica = %record.key(),
                        cached_uid = record.uid.as_deref().unwrap_or(""),
                        current_uid = %current_uid,
                        "replica identity changed, resetting"
                    );
                    self.store.set(
                        &record.name,
                        StatusCommand::Reset,
                        &record.ip,
                        function,
                        record.max_inflight,
                    );
                    self.store
                        .set_uid(&record.name, &record.ip, Some(&current_uid));
                } else if record.state == ReplicaState::Busy && self.busy_too_long(record) {
                    // Recover from a lost mark-idle callback.
                    info!(
                        request_id,
                        function = %function,
                        replica = %record.key(),
                        "replica busy beyond ttl, resetting"
                    );
                    self.metrics.stuck_busy_resets.inc();
                    self.store.set(
                        &record.name,
                        StatusCommand::Reset,
                        &record.ip,
                        function,
                        record.max_inflight,
                    );
                }
            }
            Ok(None) => {
                debug!(
                    request_id,
                    function = %function,
                    replica = %record.key(),
                    "no target reference for endpoint, keeping cached uid"
                );
            }
            Err(err) => {
                warn!(
                    request_id,
                    function = %function,
                    replica = %record.key(),
                    "failed to read current replica uid: {:#}",
                    err
                );
            }
        }
    }

    async fn insert_idle(
        &self,
        request_id: &str,
        function: &FunctionRef,
        address: &EndpointAddress,
        max_inflight: Option<u32>,
    ) {
        let name = address.replica_name().to_string();
        let uid = match self.desired_uid(&function.namespace, address).await {
            Ok(uid) => uid,
            Err(err) => {
                warn!(
                    request_id,
                    function = %function,
                    replica = %name,
                    "failed to read uid for new replica: {:#}",
                    err
                );
                None
            }
        };

        debug!(
            request_id,
            function = %function,
            replica = %name,
            ip = %address.ip,
            "inserting new replica as idle"
        );
        // Creates the record idle at zero connections.
        self.store
            .set(&name, StatusCommand::Release, &address.ip, function, max_inflight);
        self.store.set_uid(&name, &address.ip, uid.as_deref());
    }

    /// The identity token the orchestrator currently reports for an
    /// address: embedded in the snapshot when present, otherwise fetched
    /// through the replica API. Anonymous endpoints have none.
    async fn desired_uid(
        &self,
        namespace: &str,
        address: &EndpointAddress,
    ) -> Result<Option<String>> {
        let target = match &address.target_ref {
            Some(target) if !target.name.is_empty() => target,
            _ => return Ok(None),
        };
        if let Some(uid) = &target.uid {
            return Ok(Some(uid.clone()));
        }
        self.orchestrator.replica_uid(namespace, &target.name).await
    }

    fn busy_too_long(&self, record: &ReplicaRecord) -> bool {
        SystemTime::now()
            .duration_since(record.updated_at)
            .unwrap_or_default()
            > self.stuck_busy_ttl
    }
}

#[cfg(test)]
mod tests {
    use prometheus::Registry;

    use super::*;
    use crate::testing::MockOrchestrator;

    const TTL: Duration = Duration::from_secs(900);

    fn fixture(ttl: Duration) -> (Arc<ReplicaStatusStore>, Arc<MockOrchestrator>, EndpointReconciler) {
        let store = Arc::new(ReplicaStatusStore::new());
        let orchestrator = Arc::new(MockOrchestrator::default());
        let metrics = Arc::new(RouterMetrics::new(&Registry::new()).unwrap());
        let reconciler =
            EndpointReconciler::new(store.clone(), orchestrator.clone(), metrics, ttl);
        (store, orchestrator, reconciler)
    }

    fn echo() -> FunctionRef {
        FunctionRef::new("echo", "default")
    }

    #[tokio::test]
    async fn test_new_endpoints_inserted_idle() {
        let (store, _, reconciler) = fixture(TTL);
        let snapshot = vec![
            EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-1")),
            EndpointAddress::new("10.0.0.2"),
        ];

        reconciler
            .prune_by_addresses("req-1", &echo(), Some(&snapshot), Some(5))
            .await;

        let named = store.get("echo-1", "10.0.0.1").unwrap();
        assert_eq!(named.state, ReplicaState::Idle);
        assert_eq!(named.active_connections, 0);
        assert_eq!(named.uid.as_deref(), Some("uid-1"));
        assert_eq!(named.max_inflight, Some(5));

        // An anonymous endpoint is keyed by its IP.
        let anonymous = store.get("10.0.0.2", "10.0.0.2").unwrap();
        assert_eq!(anonymous.state, ReplicaState::Idle);
        assert!(anonymous.uid.is_none());
    }

    #[tokio::test]
    async fn test_stale_records_pruned_to_exact_set() {
        let (store, _, reconciler) = fixture(TTL);
        let first = vec![
            EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-1")),
            EndpointAddress::with_target("10.0.0.2", "echo-2", Some("uid-2")),
        ];
        reconciler
            .prune_by_addresses("req-1", &echo(), Some(&first), None)
            .await;

        let second = vec![EndpointAddress::with_target("10.0.0.2", "echo-2", Some("uid-2"))];
        reconciler
            .prune_by_addresses("req-2", &echo(), Some(&second), None)
            .await;

        let mut ips: Vec<_> = store
            .records_for_function(&echo())
            .into_iter()
            .map(|r| r.ip)
            .collect();
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.2".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_is_idempotent() {
        let (store, _, reconciler) = fixture(TTL);
        let snapshot = vec![
            EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-1")),
            EndpointAddress::with_target("10.0.0.2", "echo-2", Some("uid-2")),
        ];

        reconciler
            .prune_by_addresses("req-1", &echo(), Some(&snapshot), Some(5))
            .await;
        let mut before = store.records_for_function(&echo());
        before.sort_by(|a, b| a.ip.cmp(&b.ip));

        reconciler
            .prune_by_addresses("req-2", &echo(), Some(&snapshot), Some(5))
            .await;
        let mut after = store.records_for_function(&echo());
        after.sort_by(|a, b| a.ip.cmp(&b.ip));

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.key(), a.key());
            assert_eq!(b.uid, a.uid);
            assert_eq!(b.state, a.state);
            assert_eq!(b.active_connections, a.active_connections);
            assert_eq!(b.max_inflight, a.max_inflight);
        }
    }

    #[tokio::test]
    async fn test_uid_change_resets_counters() {
        let (store, _, reconciler) = fixture(TTL);
        let function = echo();
        let before = vec![EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-a"))];
        reconciler
            .prune_by_addresses("req-1", &function, Some(&before), Some(5))
            .await;
        for _ in 0..3 {
            store.set("echo-1", StatusCommand::ClaimBusy, "10.0.0.1", &function, Some(5));
        }
        assert_eq!(store.get("echo-1", "10.0.0.1").unwrap().active_connections, 3);

        // Same IP, re-created replica.
        let after = vec![EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-b"))];
        reconciler
            .prune_by_addresses("req-2", &function, Some(&after), Some(5))
            .await;

        let record = store.get("echo-1", "10.0.0.1").unwrap();
        assert_eq!(record.active_connections, 0);
        assert_eq!(record.state, ReplicaState::Idle);
        assert_eq!(record.uid.as_deref(), Some("uid-b"));
    }

    #[tokio::test]
    async fn test_uid_fetched_from_replica_api_when_missing() {
        let (store, orchestrator, reconciler) = fixture(TTL);
        orchestrator.put_uid("default", "echo-1", "uid-api");

        let snapshot = vec![EndpointAddress::with_target("10.0.0.1", "echo-1", None)];
        reconciler
            .prune_by_addresses("req-1", &echo(), Some(&snapshot), None)
            .await;

        let record = store.get("echo-1", "10.0.0.1").unwrap();
        assert_eq!(record.uid.as_deref(), Some("uid-api"));
    }

    #[tokio::test]
    async fn test_stuck_busy_reset_after_ttl() {
        let (store, _, reconciler) = fixture(Duration::from_millis(1));
        let function = echo();
        let snapshot = vec![EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-1"))];
        reconciler
            .prune_by_addresses("req-1", &function, Some(&snapshot), Some(1))
            .await;
        store.set("echo-1", StatusCommand::ClaimBusy, "10.0.0.1", &function, Some(1));
        assert_eq!(store.get("echo-1", "10.0.0.1").unwrap().state, ReplicaState::Busy);

        tokio::time::sleep(Duration::from_millis(10)).await;
        reconciler
            .prune_by_addresses("req-2", &function, Some(&snapshot), Some(1))
            .await;

        let record = store.get("echo-1", "10.0.0.1").unwrap();
        assert_eq!(record.state, ReplicaState::Idle);
        assert_eq!(record.active_connections, 0);
    }

    #[tokio::test]
    async fn test_missing_snapshot_fetched_from_orchestrator() {
        let (store, orchestrator, reconciler) = fixture(TTL);
        orchestrator.put_endpoints(
            &echo(),
            vec![EndpointAddress::with_target("10.0.0.7", "echo-7", Some("uid-7"))],
        );

        reconciler
            .prune_by_addresses("req-1", &echo(), None, None)
            .await;

        assert!(store.get("echo-7", "10.0.0.7").is_some());
    }

    #[tokio::test]
    async fn test_endpoint_fetch_failure_keeps_records() {
        let (store, orchestrator, reconciler) = fixture(TTL);
        let snapshot = vec![EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-1"))];
        reconciler
            .prune_by_addresses("req-1", &echo(), Some(&snapshot), None)
            .await;

        orchestrator.fail_endpoints(true);
        reconciler.prune_by_addresses("req-2", &echo(), None, None).await;

        // The cached record survives a failed refresh.
        assert!(store.get("echo-1", "10.0.0.1").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_prunes_converge() {
        let (store, _, reconciler) = fixture(TTL);
        let reconciler = Arc::new(reconciler);
        let snapshot = vec![
            EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-1")),
            EndpointAddress::with_target("10.0.0.2", "echo-2", Some("uid-2")),
        ];

        let mut handles = Vec::new();
        for i in 0..8 {
            let reconciler = reconciler.clone();
            let snapshot = snapshot.clone();
            handles.push(tokio::spawn(async move {
                reconciler
                    .prune_by_addresses(&format!("req-{i}"), &echo(), Some(&snapshot), Some(5))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut ips: Vec<_> = store
            .records_for_function(&echo())
            .into_iter()
            .map(|r| r.ip)
            .collect();
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    }

    #[tokio::test]
    async fn test_caller_snapshot_trusted_over_orchestrator() {
        let (store, orchestrator, reconciler) = fixture(TTL);
        orchestrator.put_endpoints(
            &echo(),
            vec![EndpointAddress::with_target("10.0.0.9", "echo-9", Some("uid-9"))],
        );

        let snapshot = vec![EndpointAddress::with_target("10.0.0.1", "echo-1", Some("uid-1"))];
        reconciler
            .prune_by_addresses("req-1", &echo(), Some(&snapshot), None)
            .await;

        assert!(store.get("echo-1", "10.0.0.1").is_some());
        assert!(store.get("echo-9", "10.0.0.9").is_none());
    }
}

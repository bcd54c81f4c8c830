use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};

use dashmap::DashMap;
use tracing::debug;

use crate::data_model::{
    FunctionRef,
    ReplicaKey,
    ReplicaRecord,
    ReplicaState,
    StatusCommand,
};

/// Thread-safe cache of replica records, keyed by `(name, ip)`.
///
/// Counter mutations for a single replica are serialized by a per-record
/// mutex looked up (or lazily inserted) in `record_locks`. Reconciliation
/// serializes per function through `function_locks`; nesting is strictly
/// function-lock then record-lock, never the reverse. Reads through `get`
/// and `get_all` take no lock beyond the map shard.
pub struct ReplicaStatusStore {
    records: DashMap<ReplicaKey, ReplicaRecord>,
    record_locks: DashMap<ReplicaKey, Arc<Mutex<()>>>,
    function_locks: DashMap<FunctionRef, Arc<tokio::sync::Mutex<()>>>,
}

impl Default for ReplicaStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaStatusStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            record_locks: DashMap::new(),
            function_locks: DashMap::new(),
        }
    }

    fn record_lock(&self, key: &ReplicaKey) -> Arc<Mutex<()>> {
        self.record_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The reconciliation lock for a function. Held across the whole
    /// reconcile pass so concurrent reconciles of the same function do not
    /// interleave; reconciles of different functions proceed in parallel.
    pub fn function_lock(&self, function: &FunctionRef) -> Arc<tokio::sync::Mutex<()>> {
        self.function_locks
            .entry(function.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn get(&self, name: &str, ip: &str) -> Option<ReplicaRecord> {
        self.records
            .get(&ReplicaKey::new(name, ip))
            .map(|r| r.clone())
    }

    pub fn get_all(&self) -> Vec<ReplicaRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    /// All records for a function, serialized against reconciliation of
    /// that function.
    pub async fn get_by_function(&self, function: &FunctionRef) -> Vec<ReplicaRecord> {
        let lock = self.function_lock(function);
        let _guard = lock.lock().await;
        self.records_for_function(function)
    }

    /// Unsynchronized scan; callers that need consistency with an ongoing
    /// reconcile use `get_by_function`.
    pub fn records_for_function(&self, function: &FunctionRef) -> Vec<ReplicaRecord> {
        self.records
            .iter()
            .filter(|r| r.belongs_to(function))
            .map(|r| r.clone())
            .collect()
    }

    /// Apply a status command to a record, creating it when absent.
    ///
    /// A missing record is created with zero in-flight connections
    /// regardless of the command, so reconciliation can insert fresh
    /// replicas with `Release`. An existing record keeps its ceiling unless
    /// it had none.
    pub fn set(
        &self,
        name: &str,
        command: StatusCommand,
        ip: &str,
        function: &FunctionRef,
        max_inflight: Option<u32>,
    ) {
        let key = ReplicaKey::new(name, ip);
        let lock = self.record_lock(&key);
        let _guard = lock.lock().unwrap();

        let (active_connections, max_inflight, uid) = match self.records.get(&key) {
            Some(current) => {
                let limit = current.max_inflight.or(max_inflight);
                let connections = match command {
                    StatusCommand::ClaimBusy => current.active_connections + 1,
                    StatusCommand::Release => current.active_connections.saturating_sub(1),
                    StatusCommand::Reset => 0,
                };
                (connections, limit, current.uid.clone())
            }
            None => (0, max_inflight, None),
        };

        let state = ReplicaState::for_connections(active_connections, max_inflight);
        debug!(
            replica = %key,
            function = %function,
            state = %state,
            active_connections,
            "replica status updated"
        );
        self.records.insert(
            key,
            ReplicaRecord {
                name: name.to_string(),
                ip: ip.to_string(),
                uid,
                function: function.name.clone(),
                namespace: function.namespace.clone(),
                state,
                active_connections,
                max_inflight,
                updated_at: SystemTime::now(),
            },
        );
    }

    /// Atomically claim one in-flight slot on a replica.
    ///
    /// Under the record mutex: refuse when the replica is busy or the
    /// counter has reached its ceiling, otherwise increment the counter and
    /// re-derive the state. Returns `false` for unknown replicas.
    pub fn try_claim(&self, name: &str, ip: &str) -> bool {
        let key = ReplicaKey::new(name, ip);
        let lock = self.record_lock(&key);
        let _guard = lock.lock().unwrap();

        let mut entry = match self.records.get_mut(&key) {
            Some(entry) => entry,
            None => {
                debug!(replica = %key, "claim refused, replica not in cache");
                return false;
            }
        };

        let at_ceiling = entry
            .max_inflight
            .map(|limit| entry.active_connections >= limit)
            .unwrap_or(false);
        if entry.state == ReplicaState::Busy || at_ceiling {
            return false;
        }

        entry.active_connections += 1;
        entry.state = ReplicaState::for_connections(entry.active_connections, entry.max_inflight);
        entry.updated_at = SystemTime::now();
        true
    }

    /// Record the orchestrator-assigned identity token for a replica.
    pub fn set_uid(&self, name: &str, ip: &str, uid: Option<&str>) {
        let key = ReplicaKey::new(name, ip);
        let lock = self.record_lock(&key);
        let _guard = lock.lock().unwrap();

        match self.records.get_mut(&key) {
            Some(mut entry) => entry.uid = uid.map(str::to_string),
            None => debug!(replica = %key, "cannot set uid, replica not in cache"),
        }
    }

    pub fn remove(&self, key: &ReplicaKey) {
        self.records.remove(key);
    }
}

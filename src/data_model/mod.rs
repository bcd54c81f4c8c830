use std::{
    fmt::{self, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

pub fn epoch_time_in_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// A function scoped to a tenant namespace. Keys the per-function lock
/// table, the ceiling cache and the request queue table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    pub name: String,
    pub namespace: String,
}

impl FunctionRef {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// Composite identity of a replica. A replica whose IP changes under the
/// same name is a different replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReplicaKey {
    pub name: String,
    pub ip: String,
}

impl ReplicaKey {
    pub fn new(name: &str, ip: &str) -> Self {
        Self {
            name: name.to_string(),
            ip: ip.to_string(),
        }
    }
}

impl Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.ip)
    }
}

/// Observable state of a replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Idle,
    Busy,
}

impl ReplicaState {
    /// Busy iff the ceiling is set and the counter has reached it.
    pub fn for_connections(active_connections: u32, max_inflight: Option<u32>) -> Self {
        match max_inflight {
            Some(limit) if active_connections >= limit => ReplicaState::Busy,
            _ => ReplicaState::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ReplicaState::Idle)
    }
}

impl Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaState::Idle => write!(f, "idle"),
            ReplicaState::Busy => write!(f, "busy"),
        }
    }
}

/// Commands accepted by the status store. Commands mutate the in-flight
/// counter; state is always derived, never stored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCommand {
    /// Increment the in-flight counter.
    ClaimBusy,
    /// Decrement the in-flight counter, clamped at zero.
    Release,
    /// Zero the in-flight counter.
    Reset,
}

/// One live replica of a function, as tracked by the status store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub name: String,
    pub ip: String,
    /// Orchestrator-assigned identity token. Changes when the replica is
    /// destroyed and re-created, even if the IP is reused.
    pub uid: Option<String>,
    pub function: String,
    pub namespace: String,
    pub state: ReplicaState,
    pub active_connections: u32,
    pub max_inflight: Option<u32>,
    /// Last state change, used for stuck-busy detection.
    pub updated_at: SystemTime,
}

impl ReplicaRecord {
    pub fn key(&self) -> ReplicaKey {
        ReplicaKey::new(&self.name, &self.ip)
    }

    pub fn function_ref(&self) -> FunctionRef {
        FunctionRef::new(&self.function, &self.namespace)
    }

    pub fn belongs_to(&self, function: &FunctionRef) -> bool {
        self.function == function.name && self.namespace == function.namespace
    }
}

/// Reference to the replica backing an endpoint address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetRef {
    pub name: String,
    pub uid: Option<String>,
}

/// One entry of the orchestrator's endpoint snapshot for a function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointAddress {
    pub ip: String,
    pub target_ref: Option<TargetRef>,
}

impl EndpointAddress {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            target_ref: None,
        }
    }

    pub fn with_target(ip: &str, name: &str, uid: Option<&str>) -> Self {
        Self {
            ip: ip.to_string(),
            target_ref: Some(TargetRef {
                name: name.to_string(),
                uid: uid.map(str::to_string),
            }),
        }
    }

    /// The replica name for this address, falling back to the IP when the
    /// endpoint carries no target reference.
    pub fn replica_name(&self) -> &str {
        self.target_ref
            .as_ref()
            .map(|t| t.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.ip)
    }
}

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
    data_model::{EndpointAddress, FunctionRef, ReplicaRecord, StatusCommand},
    orchestrator::Orchestrator,
    selector::{IdleFirstSelector, SelectError},
    state_store::ReplicaStatusStore,
};

/// Namespace reserved for the cluster control plane; user functions never
/// live there.
const CONTROL_PLANE_NAMESPACE: &str = "kube-system";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("namespace {0:?} not allowed")]
    NamespaceDenied(String),
    #[error("no addresses available for {0}")]
    NoAddresses(String),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error("error listing endpoints for {function}: {source:#}")]
    Endpoints {
        function: String,
        source: anyhow::Error,
    },
    #[error("error building target url: {0}")]
    Url(#[from] url::ParseError),
}

/// The replica an invocation was routed to, with the URL the downstream
/// proxy should call.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub url: Url,
    pub replica_name: String,
    pub replica_ip: String,
    pub function: FunctionRef,
}

/// Resolves function references to invocation URLs through the selector,
/// and fronts the store for the host API's status operations.
pub struct FunctionLookup {
    store: Arc<ReplicaStatusStore>,
    selector: Arc<IdleFirstSelector>,
    orchestrator: Arc<dyn Orchestrator>,
    default_namespace: String,
    watchdog_port: u16,
    correlation_header: String,
}

impl FunctionLookup {
    pub fn new(
        store: Arc<ReplicaStatusStore>,
        selector: Arc<IdleFirstSelector>,
        orchestrator: Arc<dyn Orchestrator>,
        default_namespace: &str,
        watchdog_port: u16,
        correlation_header: &str,
    ) -> Self {
        Self {
            store,
            selector,
            orchestrator,
            default_namespace: default_namespace.to_string(),
            watchdog_port,
            correlation_header: correlation_header.to_string(),
        }
    }

    /// Resolve `name` (optionally suffixed `.namespace`) to the invocation
    /// URL of a claimed replica. The caller owes a
    /// [`FunctionLookup::mark_replica_idle`] once the downstream call
    /// completes, success or failure.
    pub async fn resolve(
        &self,
        name: &str,
        request_id: Option<&str>,
    ) -> Result<ResolvedTarget, ResolveError> {
        let request_id = request_id
            .map(str::to_string)
            .unwrap_or_else(|| nanoid::nanoid!());
        let function = self.split_function_ref(name);
        if function.namespace == CONTROL_PLANE_NAMESPACE {
            return Err(ResolveError::NamespaceDenied(function.namespace));
        }

        let addresses = self
            .orchestrator
            .endpoints(&function)
            .await
            .map_err(|source| ResolveError::Endpoints {
                function: function.to_string(),
                source,
            })?;
        if addresses.is_empty() {
            return Err(ResolveError::NoAddresses(function.to_string()));
        }

        let index = self
            .selector
            .select(&request_id, &function, &addresses)
            .await?;
        let address = addresses
            .get(index)
            .ok_or(SelectError::InvalidIndex { index })?;

        let url = self.target_url(address, &function, &request_id)?;
        info!(
            request_id = %request_id,
            function = %function,
            replica = address.replica_name(),
            "resolved function to replica"
        );
        Ok(ResolvedTarget {
            url,
            replica_name: address.replica_name().to_string(),
            replica_ip: address.ip.clone(),
            function,
        })
    }

    /// Release one in-flight slot on a replica. Unknown replicas are a
    /// no-op, matching completion callbacks that race a reconcile.
    pub fn mark_replica_idle(&self, name: &str, ip: &str) {
        if let Some(record) = self.store.get(name, ip) {
            info!(replica = name, ip, "marking replica idle");
            self.store.set(
                name,
                StatusCommand::Release,
                ip,
                &record.function_ref(),
                record.max_inflight,
            );
        }
    }

    pub async fn replica_statuses(&self, function: &FunctionRef) -> Vec<ReplicaRecord> {
        self.store.get_by_function(function).await
    }

    fn split_function_ref(&self, name: &str) -> FunctionRef {
        split_function_ref(name, &self.default_namespace)
    }

    /// Invocation URL carrying the replica coordinates and the correlation
    /// token, echoed back by the completion callback.
    fn target_url(
        &self,
        address: &EndpointAddress,
        function: &FunctionRef,
        request_id: &str,
    ) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("http://{}:{}/", address.ip, self.watchdog_port))?;
        url.query_pairs_mut()
            .append_pair("podName", address.replica_name())
            .append_pair("podIP", &address.ip)
            .append_pair("podNamespace", &function.namespace)
            .append_pair(&self.correlation_header, request_id);
        Ok(url)
    }
}

/// `fn-name` or `fn-name.namespace`; everything after the last dot is the
/// namespace.
fn split_function_ref(name: &str, default_namespace: &str) -> FunctionRef {
    match name.rsplit_once('.') {
        Some((function, namespace)) if !namespace.is_empty() => {
            FunctionRef::new(function, namespace)
        }
        _ => FunctionRef::new(name, default_namespace),
    }
}

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::ServerConfig,
    data_model::{EndpointAddress, FunctionRef, StatusCommand},
    orchestrator::{Orchestrator, MAX_INFLIGHT_ENV},
    service::Service,
};

/// Programmable in-memory orchestrator for tests.
#[derive(Default)]
pub struct MockOrchestrator {
    endpoints: Mutex<HashMap<FunctionRef, Vec<EndpointAddress>>>,
    env: Mutex<HashMap<FunctionRef, HashMap<String, String>>>,
    uids: Mutex<HashMap<(String, String), String>>,
    fail_endpoints: AtomicBool,
    deployment_calls: AtomicUsize,
}

impl MockOrchestrator {
    pub fn put_endpoints(&self, function: &FunctionRef, addresses: Vec<EndpointAddress>) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(function.clone(), addresses);
    }

    pub fn put_max_inflight(&self, function: &FunctionRef, max_inflight: u32) {
        self.env.lock().unwrap().insert(
            function.clone(),
            HashMap::from([(MAX_INFLIGHT_ENV.to_string(), max_inflight.to_string())]),
        );
    }

    pub fn put_uid(&self, namespace: &str, name: &str, uid: &str) {
        self.uids
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), uid.to_string());
    }

    pub fn fail_endpoints(&self, fail: bool) {
        self.fail_endpoints.store(fail, Ordering::SeqCst);
    }

    pub fn deployment_calls(&self) -> usize {
        self.deployment_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn endpoints(&self, function: &FunctionRef) -> Result<Vec<EndpointAddress>> {
        if self.fail_endpoints.load(Ordering::SeqCst) {
            anyhow::bail!("endpoints api unavailable");
        }
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .get(function)
            .cloned()
            .unwrap_or_default())
    }

    async fn deployment_env(&self, function: &FunctionRef) -> Result<HashMap<String, String>> {
        self.deployment_calls.fetch_add(1, Ordering::SeqCst);
        self.env
            .lock()
            .unwrap()
            .get(function)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("deployment {} not found", function))
    }

    async fn replica_uid(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .uids
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

pub struct TestService {
    pub service: Service,
    pub orchestrator: Arc<MockOrchestrator>,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config(8080)).await
    }

    pub async fn with_config(config: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let orchestrator = Arc::new(MockOrchestrator::default());
        let service = Service::with_orchestrator(config, orchestrator.clone())?;
        Ok(Self {
            service,
            orchestrator,
        })
    }

    /// Insert an idle replica of `echo.default` directly into the store.
    pub fn seed_replica(&self, name: &str, ip: &str, max_inflight: Option<u32>) {
        self.service
            .store
            .set(name, StatusCommand::Release, ip, &echo_fn(), max_inflight);
    }

    pub fn claim(&self, name: &str, ip: &str) -> bool {
        self.service.store.try_claim(name, ip)
    }

    /// Saturate a replica by claiming `count` slots.
    pub fn fill_replica(&self, name: &str, ip: &str, count: u32, max_inflight: Option<u32>) {
        for _ in 0..count {
            self.service
                .store
                .set(name, StatusCommand::ClaimBusy, ip, &echo_fn(), max_inflight);
        }
    }
}

pub fn echo_fn() -> FunctionRef {
    FunctionRef::new("echo", "default")
}

pub fn test_config(watchdog_port: u16) -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        watchdog_port,
        ..Default::default()
    }
}

/// Pick a port no listener is bound to.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve `200 OK` on `/_/health` at a fixed address, standing in for a
/// replica watchdog. Binding different loopback IPs on the same port lets
/// tests run several "replicas" side by side.
pub async fn spawn_watchdog(ip: &str, port: u16) {
    let app = Router::new().route("/_/health", get(|| async { "OK" }));
    let addr: SocketAddr = format!("{}:{}", ip, port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

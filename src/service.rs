use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use prometheus::Registry;
use tokio::{
    signal,
    sync::watch,
};
use tracing::info;

use crate::{
    config::ServerConfig,
    lookup::FunctionLookup,
    metrics::RouterMetrics,
    orchestrator::{HttpOrchestrator, Orchestrator},
    prober::LivenessProber,
    reconciler::EndpointReconciler,
    routes::{create_routes, RouteState},
    selector::IdleFirstSelector,
    state_store::ReplicaStatusStore,
};

#[derive(Clone)]
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub store: Arc<ReplicaStatusStore>,
    pub reconciler: Arc<EndpointReconciler>,
    pub selector: Arc<IdleFirstSelector>,
    pub lookup: Arc<FunctionLookup>,
    pub registry: Arc<Registry>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let orchestrator = Arc::new(
            HttpOrchestrator::new(
                &config.orchestrator.base_url,
                config.orchestrator_request_timeout(),
            )
            .context("error building orchestrator client")?,
        );
        Self::with_orchestrator(config, orchestrator)
    }

    /// Wire the service around an injected orchestrator client. Tests hand
    /// in a programmable mock here.
    pub fn with_orchestrator(
        config: ServerConfig,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(RouterMetrics::new(&registry)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let store = Arc::new(ReplicaStatusStore::new());
        let reconciler = Arc::new(EndpointReconciler::new(
            store.clone(),
            orchestrator.clone(),
            metrics.clone(),
            config.stuck_busy_ttl(),
        ));
        let prober = Arc::new(
            LivenessProber::new(config.watchdog_port, config.probe_timeout())
                .context("error building liveness prober")?,
        );
        let selector = Arc::new(IdleFirstSelector::new(
            store.clone(),
            reconciler.clone(),
            prober,
            orchestrator.clone(),
            metrics,
            config.selector(),
            shutdown_rx.clone(),
        ));
        let lookup = Arc::new(FunctionLookup::new(
            store.clone(),
            selector.clone(),
            orchestrator,
            &config.default_namespace,
            config.watchdog_port,
            &config.correlation_header,
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            store,
            reconciler,
            selector,
            lookup,
            registry,
        })
    }

    pub async fn start(&self) -> Result<()> {
        let route_state = RouteState {
            lookup: self.lookup.clone(),
            registry: self.registry.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("router api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

/// Closes the per-function queue consumers and drains the server on
/// Ctrl-C or SIGTERM.
async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}

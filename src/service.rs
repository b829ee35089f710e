use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use tokio::signal;
use tracing::{error, info};

use crate::{
    acl::{AllowAll, Authorizer, TokenAcl},
    config::ServerConfig,
    fleet::{
        log_relay::{LogRelay, Sha256KeyDerivation},
        Fleet,
    },
    metrics::{init_provider, FleetMetrics},
    middleware::InstanceRequestSpan,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub fleet: Arc<Fleet>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let metrics = Arc::new(FleetMetrics::new());
        let log_relay = LogRelay::new(Arc::new(Sha256KeyDerivation), metrics.clone());
        let fleet = Arc::new(
            Fleet::from_config(&config, log_relay, metrics)
                .context("error initializing clusters")?,
        );
        let authorizer: Arc<dyn Authorizer> = match &config.acl {
            Some(acl) => Arc::new(TokenAcl::new(acl)),
            None => Arc::new(AllowAll),
        };
        for cluster in fleet.clusters() {
            info!(
                cluster = %cluster.name,
                nodes = cluster.nodes.all().len(),
                "cluster loaded"
            );
        }

        Ok(Self {
            config,
            fleet,
            authorizer,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            fleet: self.fleet.clone(),
            authorizer: self.authorizer.clone(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let instance_id = self.config.instance_id();
        init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval,
            &instance_id,
            env!("CARGO_PKG_VERSION"),
        )?;

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(
            self.route_state(),
            InstanceRequestSpan::new(&self.config.env, &instance_id),
        );
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}

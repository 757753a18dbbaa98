//! Application assembly: config snapshot, pipeline, router, and serving
//! with config hot-reload and graceful shutdown.

use crate::cli::RunArgs;
use arc_swap::ArcSwap;
use ccproxy_core::config::{Config, ConfigWatcher};
use ccproxy_provider::pipeline::Pipeline;
use std::sync::Arc;
use std::time::Instant;

pub struct Application {
    config: Arc<ArcSwap<Config>>,
    app_router: axum::Router,
    config_path: String,
}

impl Application {
    pub fn build(args: &RunArgs) -> anyhow::Result<Self> {
        let mut config = Config::load(&args.config).unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from '{}': {e}, using defaults",
                args.config
            );
            Config::default()
        });

        if let Some(ref host) = args.host {
            config.host = host.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }

        tracing::info!(
            providers = config.providers.len(),
            routes = config.routes.len(),
            "configuration loaded"
        );

        let config = Arc::new(ArcSwap::from_pointee(config));
        let pipeline = Arc::new(Pipeline::new(config.clone())?);

        let state = ccproxy_server::AppState {
            config: config.clone(),
            pipeline,
            start_time: Instant::now(),
        };
        let app_router = ccproxy_server::build_router(state);

        Ok(Self {
            config,
            app_router,
            config_path: args.config.clone(),
        })
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let Self {
            config,
            app_router,
            config_path,
        } = self;

        let _watcher = ConfigWatcher::start(config_path, config.clone(), |new_cfg| {
            tracing::info!(
                providers = new_cfg.providers.len(),
                routes = new_cfg.routes.len(),
                "config reloaded"
            );
        })?;

        let cfg = config.load();
        let addr = format!("{}:{}", cfg.host, cfg.port);
        drop(cfg);

        tracing::info!("starting HTTP server on {addr}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        axum::serve(listener, app_router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

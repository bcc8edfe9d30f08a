//! Control surface lifecycle.
//!
//! Follows the deferred startup pattern: `new()` assembles state, `start()`
//! binds the TCP listener, and `serve()` accepts requests until its
//! shutdown future resolves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{health_handler, liveness_handler, readiness_handler, shutdown_handler, AppState};
use super::middleware::with_control_layers;
use crate::shutdown::ShutdownController;

/// HTTP server for the control surface.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
    instance_id: Arc<str>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, shutdown: Arc<ShutdownController>, instance_id: &str) -> Self {
        Self {
            config,
            listener: None,
            shutdown,
            instance_id: Arc::from(instance_id),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `POST /shutdown` -- explicit graceful shutdown trigger
    pub fn build_router(&self) -> Router {
        let state = AppState {
            shutdown: Arc::clone(&self.shutdown),
            instance_id: Arc::clone(&self.instance_id),
            start_time: Instant::now(),
        };

        let routes = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/shutdown", post(shutdown_handler));
        with_control_layers(routes, self.config.request_timeout).with_state(state)
    }

    /// Binds the TCP listener and returns the bound address, which carries
    /// the OS-assigned port when port 0 is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "control surface bound");
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Serves requests until `shutdown` resolves, then finishes open
    /// requests and returns.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server
    /// hits a fatal I/O error.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("control surface stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::shutdown::HealthState;

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(local_config(), Arc::new(ShutdownController::new()), "a");
        assert!(module.listener.is_none());
        let _router = module.build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(local_config(), Arc::new(ShutdownController::new()), "a");
        let addr = module.start().await.unwrap();
        assert!(addr.port() > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(local_config(), Arc::new(ShutdownController::new()), "a");
        let result = module.serve(std::future::pending::<()>()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_endpoint_drains_the_process() {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let mut module = NetworkModule::new(local_config(), Arc::clone(&shutdown), "ctrl-a");
        let addr = module.start().await.unwrap();

        let mut rx = shutdown.shutdown_receiver();
        let server = tokio::spawn(module.serve(async move {
            crate::shutdown::wait_for_shutdown(&mut rx).await;
        }));

        let client = reqwest::Client::new();
        let health: serde_json::Value = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["state"], "ready");
        assert_eq!(health["instance_id"], "ctrl-a");

        let response = client
            .post(format!("http://{addr}/shutdown"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(shutdown.health_state(), HealthState::Draining);
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

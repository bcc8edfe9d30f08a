//! Process lifecycle for one or more controllers.
//!
//! [`ControllerRuntime`] owns the process-wide [`ShutdownController`], the
//! worker pools of every registered controller, and the HTTP control
//! surface. `run()` returns only after every dispatcher has exited (or the
//! drain timeout expired) and the control surface has stopped, so a
//! supervisor can defer process exit on it.

use std::net::SocketAddr;
use std::sync::Arc;

use reconcile_core::Resource;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::RuntimeConfig;
use crate::controller::Controller;
use crate::error::SetupError;
use crate::network::NetworkModule;
use crate::pool::WorkerPool;
use crate::shutdown::{spawn_signal_listener, wait_for_shutdown, ShutdownController};
use crate::telemetry;

/// Owns every controller running in this process.
pub struct ControllerRuntime {
    config: RuntimeConfig,
    shutdown: Arc<ShutdownController>,
    pools: Vec<WorkerPool>,
    http: Option<JoinHandle<anyhow::Result<()>>>,
}

impl ControllerRuntime {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(ShutdownController::new()),
            pools: Vec::new(),
            http: None,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Total dispatchers across every registered controller.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pools.iter().map(WorkerPool::len).sum()
    }

    /// Sets up a controller and starts its workers. Locks it takes are held
    /// under this runtime's instance id.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the controller's lock bucket or durable
    /// consumer is unavailable. Callers should treat this as fatal.
    pub async fn add<T: Resource>(
        &mut self,
        controller: Controller<T>,
        broker: &dyn Broker,
    ) -> Result<(), SetupError> {
        let controller = controller.with_holder(self.config.instance_id.clone());
        let pool = controller.start(broker, Arc::clone(&self.shutdown)).await?;
        self.pools.push(pool);
        Ok(())
    }

    /// Binds and serves the control surface if it is configured and not
    /// already running. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_http(&mut self) -> anyhow::Result<Option<SocketAddr>> {
        if self.http.is_some() {
            return Ok(None);
        }
        let Some(config) = self.config.http.clone() else {
            return Ok(None);
        };

        let mut module = NetworkModule::new(config, Arc::clone(&self.shutdown), &self.config.instance_id);
        let addr = module.start().await?;
        let mut rx = self.shutdown.shutdown_receiver();
        self.http = Some(tokio::spawn(module.serve(async move {
            wait_for_shutdown(&mut rx).await;
        })));
        Ok(Some(addr))
    }

    /// Runs until shutdown is triggered by a signal, `POST /shutdown`, or
    /// [`ShutdownController::trigger_shutdown`], then drains.
    ///
    /// Returns `true` if every dispatcher finished within the drain timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics exporter or control surface cannot
    /// be started.
    pub async fn run(mut self) -> anyhow::Result<bool> {
        if let Some(addr) = self.config.metrics_addr {
            telemetry::install_metrics_exporter(addr)?;
        }
        self.start_http().await?;

        let signals = spawn_signal_listener(Arc::clone(&self.shutdown));
        let mut rx = self.shutdown.shutdown_receiver();

        self.shutdown.set_ready();
        info!(
            instance_id = %self.config.instance_id,
            controllers = self.pools.len(),
            workers = self.worker_count(),
            "controller runtime ready"
        );

        wait_for_shutdown(&mut rx).await;
        info!(timeout_secs = self.config.drain_timeout.as_secs(), "draining");

        let drained = self.shutdown.wait_for_drain(self.config.drain_timeout).await;
        if drained {
            for pool in self.pools.drain(..) {
                pool.join().await;
            }
        } else {
            warn!(
                workers = self.shutdown.active_workers(),
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with dispatchers still running"
            );
        }

        if let Some(http) = self.http.take() {
            match http.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "control surface failed"),
                Err(err) => error!(error = %err, "control surface task failed"),
            }
        }
        signals.abort();

        info!(drained, "controller runtime stopped");
        Ok(drained)
    }
}

impl std::fmt::Debug for ControllerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRuntime")
            .field("instance_id", &self.config.instance_id)
            .field("pools", &self.pools)
            .field("health", &self.shutdown.health_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::shutdown::HealthState;

    #[tokio::test]
    async fn run_without_controllers_stops_on_trigger() {
        let runtime = ControllerRuntime::new(RuntimeConfig {
            instance_id: "ctrl-a".to_string(),
            http: None,
            ..RuntimeConfig::default()
        });
        assert_eq!(runtime.instance_id(), "ctrl-a");
        let shutdown = runtime.shutdown_controller();

        let handle = tokio::spawn(runtime.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(shutdown.health_state(), HealthState::Ready);

        shutdown.trigger_shutdown();
        let drained = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(drained);
        assert_eq!(shutdown.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn start_http_is_skipped_when_disabled() {
        let mut runtime = ControllerRuntime::new(RuntimeConfig {
            http: None,
            ..RuntimeConfig::default()
        });
        assert!(runtime.start_http().await.unwrap().is_none());
    }
}

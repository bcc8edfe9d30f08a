//! Handler definitions for the control surface.
//!
//! `AppState` is the shared state carried through axum extractors.

pub mod control;
pub mod health;

pub use control::shutdown_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use crate::shutdown::ShutdownController;

/// Shared application state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide shutdown controller.
    pub shutdown: Arc<ShutdownController>,
    /// Lock holder identity of this process.
    pub instance_id: Arc<str>,
    /// Process start time, used for uptime calculation.
    pub start_time: Instant,
}

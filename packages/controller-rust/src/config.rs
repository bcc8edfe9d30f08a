//! Controller and runtime configuration.
//!
//! Plain structs with documented defaults, plus [`RuntimeArgs`] for binaries
//! that take their settings from the command line or `RECONCILE_*`
//! environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use reconcile_core::{subject_for_kind, RequeuePolicy, WireFormat};

use crate::broker::DEFAULT_ACK_WAIT;
use crate::network::NetworkConfig;

/// Default lock TTL. A reconciliation that outlives it loses exclusivity.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(20 * 60);

/// TTL lock bucket settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Name of the bucket holding this controller domain's locks.
    pub bucket: String,
    /// Time after which an unreleased lock expires.
    pub ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            bucket: "reconcile-locks".to_string(),
            ttl: DEFAULT_LOCK_TTL,
        }
    }
}

/// Per-object-type controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Stream the durable consumer is bound to.
    pub stream: String,
    /// Durable consumer name. `None` derives `<kind>-controller`.
    pub consumer: Option<String>,
    /// Subject prefix; the filter subject is `<prefix>.<kind>`.
    pub subject_prefix: String,
    /// Number of concurrent dispatchers sharing the subscription.
    pub workers: usize,
    /// Upper bound on a single pull.
    pub poll_interval: Duration,
    /// Delay before an undecodable payload is redelivered.
    pub poison_redelivery_delay: Duration,
    /// Shortest ack wait the durable consumer may have. Must be at least the
    /// lock TTL, otherwise a long reconciliation is redelivered to another
    /// worker while it still runs.
    pub ack_wait: Duration,
    pub lock: LockConfig,
    pub requeue: RequeuePolicy,
    pub wire_format: WireFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stream: "RECONCILE".to_string(),
            consumer: None,
            subject_prefix: "reconcile".to_string(),
            workers: 1,
            poll_interval: Duration::from_secs(5),
            poison_redelivery_delay: Duration::from_secs(1),
            ack_wait: DEFAULT_ACK_WAIT,
            lock: LockConfig::default(),
            requeue: RequeuePolicy::default(),
            wire_format: WireFormat::Json,
        }
    }
}

impl ControllerConfig {
    /// Durable consumer name for `kind`.
    #[must_use]
    pub fn consumer_name(&self, kind: &str) -> String {
        self.consumer
            .clone()
            .unwrap_or_else(|| format!("{}-controller", kind.to_ascii_lowercase()))
    }

    /// Filter subject for `kind`.
    #[must_use]
    pub fn filter_subject(&self, kind: &str) -> String {
        subject_for_kind(&self.subject_prefix, kind)
    }
}

/// API service client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Process-wide settings shared by every controller in the process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Identity written into lock records held by this process.
    pub instance_id: String,
    /// How long shutdown waits for dispatchers to finish.
    pub drain_timeout: Duration,
    /// HTTP control surface. `None` disables it.
    pub http: Option<NetworkConfig>,
    /// Prometheus exporter listen address. `None` disables it.
    pub metrics_addr: Option<SocketAddr>,
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            drain_timeout: Duration::from_secs(30),
            http: Some(NetworkConfig::default()),
            metrics_addr: None,
            log: LogConfig::default(),
        }
    }
}

/// Command-line and environment settings for a controller process.
#[derive(Debug, Clone, Parser)]
#[command(about = "Reconcile controller runtime")]
pub struct RuntimeArgs {
    /// Lock holder identity; random when unset.
    #[arg(long, env = "RECONCILE_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Stream the durable consumers are bound to.
    #[arg(long, env = "RECONCILE_STREAM", default_value = "RECONCILE")]
    pub stream: String,

    /// Subject prefix for notification subjects.
    #[arg(long, env = "RECONCILE_SUBJECT_PREFIX", default_value = "reconcile")]
    pub subject_prefix: String,

    /// Dispatchers per object type.
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Pull poll interval in seconds.
    #[arg(long, env = "RECONCILE_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Lock bucket name.
    #[arg(long, env = "RECONCILE_LOCK_BUCKET", default_value = "reconcile-locks")]
    pub lock_bucket: String,

    /// Lock TTL in seconds.
    #[arg(long, env = "RECONCILE_LOCK_TTL_SECS", default_value_t = 1200)]
    pub lock_ttl_secs: u64,

    /// Shortest consumer ack wait in seconds; must cover the lock TTL.
    #[arg(long, env = "RECONCILE_ACK_WAIT_SECS", default_value_t = 1200)]
    pub ack_wait_secs: u64,

    /// Encode notifications as MsgPack instead of JSON.
    #[arg(long, env = "RECONCILE_MSGPACK")]
    pub msgpack: bool,

    /// API service base URL.
    #[arg(long, env = "RECONCILE_API_URL", default_value = "http://127.0.0.1:8080")]
    pub api_url: String,

    /// API request timeout in seconds.
    #[arg(long, env = "RECONCILE_API_TIMEOUT_SECS", default_value_t = 10)]
    pub api_timeout_secs: u64,

    /// Control surface bind host.
    #[arg(long, env = "RECONCILE_HTTP_HOST", default_value = "0.0.0.0")]
    pub http_host: String,

    /// Control surface port; 0 picks a free port.
    #[arg(long, env = "RECONCILE_HTTP_PORT", default_value_t = 8081)]
    pub http_port: u16,

    /// Disable the HTTP control surface.
    #[arg(long, env = "RECONCILE_NO_HTTP")]
    pub no_http: bool,

    /// Prometheus exporter address, e.g. 0.0.0.0:9000.
    #[arg(long, env = "RECONCILE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Shutdown drain timeout in seconds.
    #[arg(long, env = "RECONCILE_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Default log filter.
    #[arg(long, env = "RECONCILE_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs.
    #[arg(long, env = "RECONCILE_LOG_JSON")]
    pub log_json: bool,
}

impl RuntimeArgs {
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        let defaults = RuntimeConfig::default();
        RuntimeConfig {
            instance_id: self.instance_id.clone().unwrap_or(defaults.instance_id),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            http: (!self.no_http).then(|| NetworkConfig {
                host: self.http_host.clone(),
                port: self.http_port,
                ..NetworkConfig::default()
            }),
            metrics_addr: self.metrics_addr,
            log: LogConfig {
                level: self.log_level.clone(),
                json: self.log_json,
            },
        }
    }

    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            stream: self.stream.clone(),
            subject_prefix: self.subject_prefix.clone(),
            workers: self.workers,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ack_wait: Duration::from_secs(self.ack_wait_secs),
            lock: LockConfig {
                bucket: self.lock_bucket.clone(),
                ttl: Duration::from_secs(self.lock_ttl_secs),
            },
            wire_format: if self.msgpack {
                WireFormat::MsgPack
            } else {
                WireFormat::Json
            },
            ..ControllerConfig::default()
        }
    }

    #[must_use]
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_url.clone(),
            request_timeout: Duration::from_secs(self.api_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.lock.ttl, Duration::from_secs(1200));
        assert!(config.ack_wait >= config.lock.ttl);
        assert_eq!(config.wire_format, WireFormat::Json);
    }

    #[test]
    fn consumer_and_subject_derive_from_kind() {
        let config = ControllerConfig::default();
        assert_eq!(config.consumer_name("Network"), "network-controller");
        assert_eq!(config.filter_subject("Network"), "reconcile.network");

        let named = ControllerConfig {
            consumer: Some("custom".to_string()),
            ..ControllerConfig::default()
        };
        assert_eq!(named.consumer_name("Network"), "custom");
    }

    #[test]
    fn runtime_defaults_have_unique_instance_ids() {
        let a = RuntimeConfig::default();
        let b = RuntimeConfig::default();
        assert_ne!(a.instance_id, b.instance_id);
        assert_eq!(a.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = RuntimeArgs::try_parse_from(["controller"]).unwrap();
        let controller = args.controller_config();
        assert_eq!(controller.workers, 1);
        assert_eq!(controller.lock.ttl, DEFAULT_LOCK_TTL);
        assert_eq!(controller.ack_wait, DEFAULT_ACK_WAIT);

        let runtime = args.runtime_config();
        assert_eq!(runtime.http.map(|h| h.port), Some(8081));
        assert!(runtime.metrics_addr.is_none());
    }

    #[test]
    fn args_override_settings() {
        let args = RuntimeArgs::try_parse_from([
            "controller",
            "--instance-id",
            "ctrl-a",
            "--workers",
            "4",
            "--lock-ttl-secs",
            "60",
            "--msgpack",
            "--no-http",
            "--api-url",
            "http://api:9000",
        ])
        .unwrap();

        let runtime = args.runtime_config();
        assert_eq!(runtime.instance_id, "ctrl-a");
        assert!(runtime.http.is_none());

        let controller = args.controller_config();
        assert_eq!(controller.workers, 4);
        assert_eq!(controller.lock.ttl, Duration::from_secs(60));
        assert_eq!(controller.wire_format, WireFormat::MsgPack);

        assert_eq!(args.api_config().base_url, "http://api:9000");
    }
}

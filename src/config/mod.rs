//! Server configuration.
//!
//! All fields have defaults, so an empty JSON object is a valid configuration.
//! Durations are expressed in (fractional) seconds with a `_secs` suffix and
//! exposed as [`Duration`]s through accessor methods.
//!
//! ```
//! use muxserve::config::Config;
//!
//! let config = Config::from_json(r#"{"keep_alive_timeout_secs": 2.5}"#).unwrap();
//! assert_eq!(config.keep_alive_timeout().as_millis(), 2500);
//! assert_eq!(config.max_app_queue_size, 10);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest legal HTTP/2 `SETTINGS_MAX_FRAME_SIZE`.
pub const H2_MIN_FRAME_SIZE: u32 = 16_384;

/// Largest legal HTTP/2 `SETTINGS_MAX_FRAME_SIZE`.
pub const H2_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Errors produced while loading or validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Engine configuration consumed by listeners, connections and streams.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Addresses to listen on (e.g. `"127.0.0.1:8000"`).
    pub bind: Vec<String>,

    /// Capacity of the inbound message queue of each application invocation.
    pub max_app_queue_size: usize,

    /// Bound on the lifespan startup handshake.
    pub startup_timeout_secs: f64,

    /// Bound on the lifespan shutdown handshake.
    pub shutdown_timeout_secs: f64,

    /// How long live connections may keep running once shutdown begins.
    pub graceful_timeout_secs: f64,

    /// Per-read timeout. `None` waits forever.
    pub read_timeout_secs: Option<f64>,

    /// Idle time after which a keep-alive connection is closed.
    pub keep_alive_timeout_secs: f64,

    /// Requests served on one connection before it is closed.
    pub keep_alive_max_requests: u64,

    /// Requests a worker serves before it shuts itself down.
    pub max_requests: Option<u64>,

    /// Upper bound of the random amount added to `max_requests`.
    pub max_requests_jitter: u64,

    /// Largest HTTP/1.1 request head buffered before answering 431.
    pub h11_max_incomplete_size: usize,

    /// Advertised `SETTINGS_MAX_CONCURRENT_STREAMS`.
    pub h2_max_concurrent_streams: u32,

    /// Advertised `SETTINGS_MAX_HEADER_LIST_SIZE`.
    pub h2_max_header_list_size: u32,

    /// Advertised `SETTINGS_MAX_FRAME_SIZE`.
    pub h2_max_inbound_frame_size: u32,

    /// Largest reassembled WebSocket message accepted from a peer.
    pub websocket_max_message_size: usize,

    /// Interval between server pings. `None` disables the heartbeat.
    pub websocket_ping_interval_secs: Option<f64>,

    /// Add a `date` header to every response.
    pub include_date_header: bool,

    /// Add a `server` header to every response.
    pub include_server_header: bool,

    /// Extra `alt-svc` header values added to every response.
    pub alt_svc_headers: Vec<String>,

    /// Accepted `host` values. Empty accepts any host.
    pub server_names: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: vec!["127.0.0.1:8000".to_owned()],
            max_app_queue_size: 10,
            startup_timeout_secs: 60.0,
            shutdown_timeout_secs: 60.0,
            graceful_timeout_secs: 3.0,
            read_timeout_secs: None,
            keep_alive_timeout_secs: 5.0,
            keep_alive_max_requests: 1000,
            max_requests: None,
            max_requests_jitter: 0,
            h11_max_incomplete_size: 16 * 1024,
            h2_max_concurrent_streams: 100,
            h2_max_header_list_size: 65_536,
            h2_max_inbound_frame_size: H2_MIN_FRAME_SIZE,
            websocket_max_message_size: 16 * 1024 * 1024,
            websocket_ping_interval_secs: None,
            include_date_header: true,
            include_server_header: true,
            alt_svc_headers: Vec::new(),
            server_names: Vec::new(),
        }
    }
}

impl Config {
    /// Parses and validates a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed input and
    /// [`ConfigError::Invalid`] when a value is out of range.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_app_queue_size == 0 {
            return Err(invalid("max_app_queue_size", "must be at least 1"));
        }
        if !(H2_MIN_FRAME_SIZE..=H2_MAX_FRAME_SIZE).contains(&self.h2_max_inbound_frame_size) {
            return Err(invalid(
                "h2_max_inbound_frame_size",
                format!("must be between {H2_MIN_FRAME_SIZE} and {H2_MAX_FRAME_SIZE}"),
            ));
        }
        if self.keep_alive_max_requests == 0 {
            return Err(invalid("keep_alive_max_requests", "must be at least 1"));
        }

        let durations = [
            ("startup_timeout_secs", Some(self.startup_timeout_secs)),
            ("shutdown_timeout_secs", Some(self.shutdown_timeout_secs)),
            ("graceful_timeout_secs", Some(self.graceful_timeout_secs)),
            ("keep_alive_timeout_secs", Some(self.keep_alive_timeout_secs)),
            ("read_timeout_secs", self.read_timeout_secs),
            ("websocket_ping_interval_secs", self.websocket_ping_interval_secs),
        ];
        for (field, value) in durations {
            if let Some(secs) = value {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(invalid(field, "must be a non-negative number of seconds"));
                }
            }
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout_secs)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.graceful_timeout_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.keep_alive_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn websocket_ping_interval(&self) -> Option<Duration> {
        self.websocket_ping_interval_secs.map(Duration::from_secs_f64)
    }

    /// Returns the request budget for one worker with jitter applied.
    ///
    /// `max_requests + rand(0..=max_requests_jitter)`, or `None` when unlimited.
    pub fn effective_max_requests(&self) -> Option<u64> {
        self.max_requests.map(|max| {
            let jitter = if self.max_requests_jitter == 0 {
                0
            } else {
                fastrand::u64(0..=self.max_requests_jitter)
            };
            max.saturating_add(jitter)
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

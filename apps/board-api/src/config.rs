use std::time::Duration;

/// Board API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Allow any origin for CORS (development default).
    pub cors_allow_any: bool,
    /// Tunables for the collaboration hub.
    pub hub: HubConfig,
}

/// Timing and capacity knobs for the collaboration hub.
///
/// Every field can be overridden through a `HUB_*` environment variable; the
/// defaults below are what tests use.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-connection outbound queue capacity (messages).
    pub outbound_capacity: usize,
    /// Capacity of the coordinator's command queue.
    pub command_capacity: usize,
    /// How often the coordinator sweeps for stale connections.
    pub cleanup_interval: Duration,
    /// Connections silent for longer than this are removed by the sweep.
    pub stale_after: Duration,
    /// A connection is reported "online" if it produced traffic this recently.
    pub liveness_window: Duration,
    /// Durable presence records newer than this show up as "recently here".
    pub presence_window: Duration,
    /// Interval between keepalive pings sent by the writer.
    pub ping_interval: Duration,
    /// The reader gives up after this long without any inbound traffic.
    pub idle_timeout: Duration,
    /// Deadline for a single outbound write.
    pub write_timeout: Duration,
    /// Largest inbound frame accepted by the transport.
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            command_capacity: 1024,
            cleanup_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(30),
            liveness_window: Duration::from_secs(30),
            presence_window: Duration::from_secs(5 * 60),
            ping_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 64 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unparsable values fall back to the default.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT").unwrap_or(4100),
            cors_allow_any: parsed_var("CORS_ALLOW_ANY").unwrap_or(true),
            hub: HubConfig::from_env(),
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let hub = Self {
            outbound_capacity: parsed_var("HUB_OUTBOUND_CAPACITY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.outbound_capacity),
            command_capacity: parsed_var("HUB_COMMAND_CAPACITY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.command_capacity),
            cleanup_interval: secs_var("HUB_CLEANUP_INTERVAL_SECS")
                .unwrap_or(defaults.cleanup_interval),
            stale_after: secs_var("HUB_STALE_AFTER_SECS").unwrap_or(defaults.stale_after),
            liveness_window: secs_var("HUB_LIVENESS_SECS").unwrap_or(defaults.liveness_window),
            presence_window: secs_var("HUB_PRESENCE_WINDOW_SECS")
                .unwrap_or(defaults.presence_window),
            ping_interval: secs_var("HUB_PING_INTERVAL_SECS").unwrap_or(defaults.ping_interval),
            idle_timeout: secs_var("HUB_IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            write_timeout: secs_var("HUB_WRITE_TIMEOUT_SECS").unwrap_or(defaults.write_timeout),
            max_message_bytes: parsed_var("HUB_MAX_MESSAGE_BYTES")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_message_bytes),
        };
        hub.coherent()
    }

    /// Pongs are the only traffic from an idle client, so pings must arrive
    /// before either the stale sweep or the reader's idle deadline fires.
    /// An overridden ping interval that breaks this is pulled back to half the
    /// tighter limit.
    pub fn coherent(mut self) -> Self {
        let limit = self.stale_after.min(self.idle_timeout);
        if self.ping_interval >= limit {
            let ping_interval = limit / 2;
            tracing::warn!(
                configured = ?self.ping_interval,
                adjusted = ?ping_interval,
                stale_after = ?self.stale_after,
                idle_timeout = ?self.idle_timeout,
                "ping interval too long to keep idle clients alive"
            );
            self.ping_interval = ping_interval;
        }
        self
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

/// Zero-second intervals would make `tokio::time::interval` panic, so they are ignored.
fn secs_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub sources: SourcesConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub cdp: CdpSourceConfig,
    #[serde(default)]
    pub direct: DirectSourceConfig,
}

/// Browser DevTools capture attached to an already running browser
#[derive(Debug, Clone, Deserialize)]
pub struct CdpSourceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// DevTools HTTP endpoint (e.g., "http://127.0.0.1:9222")
    #[serde(default = "default_debug_url")]
    pub debug_url: String,
    /// Substring that identifies the page tab to attach to
    #[serde(default = "default_target_host")]
    pub target_url_contains: String,
    /// Substring that identifies the game socket among the tab's WebSockets
    #[serde(default = "default_socket_filter")]
    pub socket_url_contains: String,
}

impl Default for CdpSourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debug_url: default_debug_url(),
            target_url_contains: default_target_host(),
            socket_url_contains: default_socket_filter(),
        }
    }
}

fn default_debug_url() -> String {
    "http://127.0.0.1:9222".to_string()
}

fn default_target_host() -> String {
    "rugs.fun".to_string()
}

fn default_socket_filter() -> String {
    "socket.io".to_string()
}

/// Direct Socket.IO connection to the public endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DirectSourceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Socket.IO endpoint, EIO query parameters are appended when missing
    #[serde(default = "default_direct_url")]
    pub url: String,
    /// Auth payload sent with the namespace connect packet
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
}

impl Default for DirectSourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_direct_url(),
            auth: None,
        }
    }
}

fn default_direct_url() -> String {
    "wss://backend.rugs.fun/socket.io/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound on a single connect attempt
    pub connect_timeout_ms: u64,
    /// Add up to ±25% random jitter to each delay
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            connect_timeout_ms: 10_000,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Output directory root for partitioned files and manifests
    pub root_dir: PathBuf,
    /// Flush when this many envelopes are buffered
    #[serde(default = "default_max_buffer")]
    pub max_buffer_events: usize,
    /// Flush at least this often
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    /// Retries per flush before the writer is reported fatal
    #[serde(default = "default_write_retries")]
    pub max_write_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Ceiling on the delay between flush retries
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Resume an existing session instead of starting a fresh one
    #[serde(default)]
    pub session_id: Option<uuid::Uuid>,
}

fn default_max_buffer() -> usize {
    500
}

fn default_flush_interval() -> u64 {
    1_000
}

fn default_write_retries() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_retry_max_delay() -> u64 {
    10_000
}

impl StoreConfig {
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_buffer_events: default_max_buffer(),
            flush_interval_ms: default_flush_interval(),
            max_write_retries: default_write_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            session_id: None,
        }
    }
}

/// Health monitor and source manager tuning
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Samples kept for the rolling latency baseline
    pub latency_window: usize,
    /// Samples required before spikes are classified
    pub latency_min_samples: usize,
    pub latency_warn_sigma: f64,
    pub latency_critical_sigma: f64,
    /// Minimum spread used for the baseline, avoids flagging jitter on a flat feed
    pub latency_min_stddev_ms: f64,
    /// Minimum time between repeated alerts of the same severity
    pub alert_cooldown_secs: u64,
    /// Sliding window for the inbound rate budget
    pub rate_window_ms: u64,
    /// Events allowed per source within one window
    pub rate_max_events: usize,
    /// How often the source manager re-ranks sources
    pub evaluate_interval_ms: u64,
    /// A source with no events for this long counts as stale
    pub stale_after_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            latency_window: 200,
            latency_min_samples: 20,
            latency_warn_sigma: 3.0,
            latency_critical_sigma: 6.0,
            latency_min_stddev_ms: 25.0,
            alert_cooldown_secs: 30,
            rate_window_ms: 1_000,
            rate_max_events: 200,
            evaluate_interval_ms: 2_000,
            stale_after_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HealthConfig {
    /// Status HTTP server port, disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("store.root_dir", "data/events")?
            .set_default("sources.direct.enabled", true)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("RUGFEED_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (RUGFEED__STORE__ROOT_DIR, etc.)
            .add_source(
                Environment::with_prefix("RUGFEED")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.sources.cdp.enabled && !self.sources.direct.enabled {
            errors.push("at least one capture source must be enabled".to_string());
        }

        if self.sources.direct.enabled {
            if let Err(e) = url::Url::parse(&self.sources.direct.url) {
                errors.push(format!("sources.direct.url is invalid: {e}"));
            }
            if let Some(auth) = &self.sources.direct.auth {
                if !auth.is_object() {
                    errors.push("sources.direct.auth must be a JSON object".to_string());
                }
            }
        }

        if self.sources.cdp.enabled && url::Url::parse(&self.sources.cdp.debug_url).is_err() {
            errors.push("sources.cdp.debug_url is invalid".to_string());
        }

        if self.reconnect.initial_delay_ms == 0 {
            errors.push("reconnect.initial_delay_ms must be positive".to_string());
        }

        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            errors.push("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }

        if self.reconnect.multiplier < 1.0 {
            errors.push("reconnect.multiplier must be >= 1.0".to_string());
        }

        if self.store.max_buffer_events == 0 {
            errors.push("store.max_buffer_events must be positive".to_string());
        }
        if self.store.retry_max_delay_ms < self.store.retry_base_delay_ms {
            errors.push("store.retry_max_delay_ms must be >= retry_base_delay_ms".to_string());
        }

        if self.monitor.latency_critical_sigma <= self.monitor.latency_warn_sigma {
            errors.push("monitor.latency_critical_sigma must exceed latency_warn_sigma".to_string());
        }

        if self.monitor.rate_max_events == 0 {
            errors.push("monitor.rate_max_events must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::notify::delivery::DeliverySettings;

/// Beacon real-time server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "beacon-server", version, about = "Real-time presence and notification server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "BEACON_PORT", default_value = "4100")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BEACON_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./beacon.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "BEACON_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "BEACON_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Connection liveness settings (loaded from [presence] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub presence: PresenceConfig,

    /// Notification storage settings (loaded from [notifications] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub notifications: NotificationsConfig,

    /// Push delivery settings (loaded from [push] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub push: PushConfig,

    /// Embedded delivery manager defaults (loaded from [delivery] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Seconds without any inbound frame before a connection is swept (default: 60)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Seconds between sweeps for idle connections (default: 15)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds between server pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds before an unrefreshed typing indicator expires (default: 10)
    #[serde(default = "default_typing_timeout")]
    pub typing_timeout_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            ping_interval_secs: default_ping_interval(),
            typing_timeout_secs: default_typing_timeout(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_ping_interval() -> u64 {
    30
}

fn default_typing_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Days a read notification is kept before automatic purge (default: 30)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Interval in seconds between retention cleanup runs (default: 3600 = 1 hour)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Unread notifications replayed on connect/subscribe (default: 20)
    #[serde(default = "default_catch_up_limit")]
    pub catch_up_limit: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval(),
            catch_up_limit: default_catch_up_limit(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_catch_up_limit() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Whether push fan-out runs at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failed deliveries before a subscription is deactivated (default: 3)
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Per-request timeout against push services in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long the push service may hold an undelivered message, in seconds (default: 86400)
    #[serde(default = "default_ttl")]
    pub ttl_secs: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: default_max_failures(),
            request_timeout_secs: default_request_timeout(),
            ttl_secs: default_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_failures() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    10
}

fn default_ttl() -> u32 {
    86400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Local rendering switches used by embedded delivery managers
    #[serde(default)]
    pub settings: DeliverySettings,

    /// First reconnect delay in milliseconds; doubles per attempt (default: 1000)
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Reconnect attempts before giving up (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            settings: DeliverySettings::default(),
            reconnect_base_ms: default_reconnect_base(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_reconnect_base() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            bind_address: "0.0.0.0".to_string(),
            config: "./beacon.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            presence: PresenceConfig::default(),
            notifications: NotificationsConfig::default(),
            push: PushConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (BEACON_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();
        Self::figment(&config_path, cli).extract()
    }

    /// Sections are skipped when serializing, so the CLI layer only
    /// overrides top-level flags and never resets a TOML section.
    fn figment(config_path: &str, cli: Config) -> Figment {
        // `__` splits nested keys: BEACON_PUSH__MAX_FAILURES -> push.max_failures
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("BEACON_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Beacon Server Configuration
# Place this file at ./beacon.toml or specify with --config <path>
# All settings can be overridden via environment variables (BEACON_PORT,
# BEACON_PUSH__MAX_FAILURES, etc.) or CLI flags (--port, etc.)

# Server port (default: 4100)
# port = 4100

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# ---- Connections & Presence ----
# [presence]
# heartbeat_timeout_secs = 60   # Idle connections are closed after this
# sweep_interval_secs = 15      # How often idle connections are swept
# ping_interval_secs = 30       # Server ping cadence; 10s pong timeout
# typing_timeout_secs = 10      # Typing indicators expire after this

# ---- Notifications ----
# [notifications]
# retention_days = 30           # Read notifications older than this are purged
# cleanup_interval_secs = 3600  # Retention sweep cadence
# catch_up_limit = 20           # Unread notifications replayed on connect

# ---- Push ----
# [push]
# enabled = true
# max_failures = 3              # Consecutive failures before deactivation
# request_timeout_secs = 10
# ttl_secs = 86400

# ---- Embedded delivery defaults ----
# [delivery]
# reconnect_base_ms = 1000      # Doubles on each attempt
# max_attempts = 5
# [delivery.settings]
# show_toast = true
# play_sound = true
# show_desktop = true
# auto_hide = true
# hide_delay_ms = 5000
# max_notifications = 5
"#
    .to_string()
}

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_tungstenite::tungstenite::http::Uri;

/// CLI interface for the posecast daemon.
#[derive(Parser)]
#[command(name = "posecast", about = "Pose telemetry daemon")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path of the persisted connection settings store.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Local API listen address override.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon.
    Start,
    /// Show daemon status.
    Status,
    /// Inspect or change the persisted relay connection settings.
    Config {
        /// Config subcommand to run.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Connection settings subcommands.
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective settings as JSON.
    Show,
    /// Set one field. The value is parsed as JSON, falling back to a string.
    Set {
        /// Field name, e.g. `proxyUrl` or `features.poseData`.
        key: String,
        /// New value.
        value: String,
    },
    /// Restore and persist the defaults.
    Reset,
    /// Validate the stored settings.
    Validate,
}

/// An ICE server handed to the signaling broker for NAT traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `stun:` or `turn:` URL.
    pub urls: String,
    /// TURN username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// The public STUN server and open TURN relay used by default.
#[must_use]
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer {
            urls: "stun:stun.l.google.com:19302".to_string(),
            username: None,
            credential: None,
        },
        IceServer {
            urls: "turn:openrelay.metered.ca:80".to_string(),
            username: Some("openrelayproject".to_string()),
            credential: Some("openrelayproject".to_string()),
        },
    ]
}

/// Daemon settings loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Connection settings store path. Empty selects the platform default.
    pub store: String,
    /// Local API listen address (`tcp://`).
    pub listen: String,
    /// Whether the daemon runs in a secure hosting context. Controls the
    /// scheme given to bare endpoint addresses and upgrades `ws://` to
    /// `wss://`.
    pub secure_context: bool,
    /// Relay auto-discovery settings.
    pub discovery: DiscoveryConfig,
    /// Peer signaling broker settings.
    pub signaling: SignalingConfig,
    /// Local capture and synthetic generator settings.
    pub capture: CaptureConfig,
    /// WebSocket keepalive ping settings.
    pub keepalive: KeepaliveConfig,
}

/// Relay auto-discovery, used when no endpoint is configured.
#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Local ports probed in order.
    pub ports: Vec<u16>,
    /// Per-probe timeout, in milliseconds.
    pub probe_timeout_ms: u64,
}

/// Signaling broker used for peer acquisition.
#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Whether to attempt peer acquisition at all.
    pub enabled: bool,
    /// Broker WebSocket URL.
    pub url: String,
    /// Broker API key.
    pub key: String,
    /// Time allowed for the broker to confirm the session, in milliseconds.
    pub open_timeout_ms: u64,
    /// Broker heartbeat interval, in milliseconds.
    pub heartbeat_ms: u64,
    /// ICE servers advertised for NAT traversal.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

/// Capture and fallback generator timing.
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Whether to try the local camera while no peer is linked.
    pub local: bool,
    /// Minimum spacing between estimator invocations, in milliseconds.
    pub detection_interval_ms: u64,
    /// Synthetic generator tick, in milliseconds.
    pub synthetic_interval_ms: u64,
}

/// WebSocket keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings, in seconds.
    pub interval_s: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: vec![8080, 8081, 9000],
            probe_timeout_ms: 2000,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "wss://0.peerjs.com:443/peerjs".to_string(),
            key: "peerjs".to_string(),
            open_timeout_ms: 10_000,
            heartbeat_ms: 5000,
            ice_servers: default_ice_servers(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            local: true,
            detection_interval_ms: 100,
            synthetic_interval_ms: 100,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: String::new(),
            listen: "tcp://127.0.0.1:7710".to_string(),
            secure_context: false,
            discovery: DiscoveryConfig::default(),
            signaling: SignalingConfig::default(),
            capture: CaptureConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl AppConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen.is_empty() {
            return Err("listen address must not be empty".to_string());
        }
        if !self.listen.starts_with("tcp://") {
            return Err(format!(
                "listen address must start with tcp://, got: {}",
                self.listen
            ));
        }

        if self.discovery.probe_timeout_ms == 0 {
            return Err("discovery.probe_timeout_ms must be greater than 0".to_string());
        }

        if self.signaling.enabled {
            if !is_socket_url(&self.signaling.url) {
                return Err(format!(
                    "signaling.url must start with ws:// or wss://, got: {}",
                    self.signaling.url
                ));
            }
            if self.signaling.open_timeout_ms == 0 {
                return Err("signaling.open_timeout_ms must be greater than 0".to_string());
            }
            if self.signaling.heartbeat_ms == 0 {
                return Err("signaling.heartbeat_ms must be greater than 0".to_string());
            }
        }

        if self.capture.detection_interval_ms == 0 {
            return Err("capture.detection_interval_ms must be greater than 0".to_string());
        }
        if self.capture.synthetic_interval_ms == 0 {
            return Err("capture.synthetic_interval_ms must be greater than 0".to_string());
        }

        if self.keepalive.interval_s == 0 {
            return Err("keepalive.interval_s must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Platform config dir first, then `~/.config/posecast/`.
#[must_use]
pub fn resolve_data_path(filename: &str) -> PathBuf {
    let native = dirs::config_dir().map(|d| d.join("posecast").join(filename));
    let xdg = dirs::home_dir().map(|d| d.join(".config").join("posecast").join(filename));

    if let Some(p) = native.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    if let Some(p) = xdg.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    native.unwrap_or_else(|| PathBuf::from(filename))
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();
    let ports: Vec<i64> = defaults.discovery.ports.iter().map(|p| i64::from(*p)).collect();
    let mut builder = config::Config::builder()
        .set_default("store", defaults.store.as_str())?
        .set_default("listen", defaults.listen.as_str())?
        .set_default("secure_context", defaults.secure_context)?
        .set_default("discovery.ports", ports)?
        .set_default(
            "discovery.probe_timeout_ms",
            defaults.discovery.probe_timeout_ms as i64,
        )?
        .set_default("signaling.enabled", defaults.signaling.enabled)?
        .set_default("signaling.url", defaults.signaling.url.as_str())?
        .set_default("signaling.key", defaults.signaling.key.as_str())?
        .set_default(
            "signaling.open_timeout_ms",
            defaults.signaling.open_timeout_ms as i64,
        )?
        .set_default(
            "signaling.heartbeat_ms",
            defaults.signaling.heartbeat_ms as i64,
        )?
        .set_default("capture.local", defaults.capture.local)?
        .set_default(
            "capture.detection_interval_ms",
            defaults.capture.detection_interval_ms as i64,
        )?
        .set_default(
            "capture.synthetic_interval_ms",
            defaults.capture.synthetic_interval_ms as i64,
        )?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        let native_path = dirs::config_dir().map(|d| d.join("posecast").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| {
            d.join(".config")
                .join("posecast")
                .join("config.toml")
        });

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("POSECAST")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("discovery.ports")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    let config: AppConfig = settings.try_deserialize()?;

    Ok(config)
}

// ── Relay connection settings ───────────────────────────────────────

/// Per-message-type telemetry switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    /// Send `biometric_data`.
    pub biometric_data: bool,
    /// Send `pose_data`.
    pub pose_data: bool,
    /// Send `rep_detection`.
    pub rep_detection: bool,
    /// Reserved for video frame upload.
    pub video_frames: bool,
    /// Reserved for payload compression.
    pub compression: bool,
    /// Reserved for payload encryption.
    pub encryption: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            biometric_data: true,
            pose_data: true,
            rep_detection: true,
            video_frames: false,
            compression: true,
            encryption: false,
        }
    }
}

/// Persisted relay connection settings.
///
/// Only [`ConfigStore::update`](crate::store::ConfigStore::update) mutates the
/// persisted copy, and only after [`ConnectionConfig::validate`] passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// When false, `connect()` leaves the link idle.
    pub enabled: bool,
    /// Direct relay address (`ws://` / `wss://`, or bare `host:port`).
    pub endpoint_url: String,
    /// Proxy or tunnel address; wins over `endpoint_url` when set.
    pub proxy_url: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Retries before the link gives up. Signed so that a bad stored value
    /// survives loading and is reported by validation.
    pub max_reconnect_attempts: i64,
    /// Minimum spacing of re-sent pose samples.
    pub sample_interval_ms: u64,
    /// Telemetry switches.
    pub features: FeatureFlags,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint_url: String::new(),
            proxy_url: String::new(),
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 10,
            sample_interval_ms: 100,
            features: FeatureFlags::default(),
        }
    }
}

/// Result of [`ConnectionConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    /// True when `errors` is empty.
    pub valid: bool,
    /// Human-readable problems, in field order.
    pub errors: Vec<String>,
}

/// Lower bound for `reconnect_interval_ms`.
pub const MIN_RECONNECT_INTERVAL_MS: u64 = 1000;
/// Lower bound for `sample_interval_ms`.
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 50;

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    url.parse::<Uri>().is_ok_and(|uri| {
        uri.host().is_some_and(|h| !h.is_empty())
            && uri
                .scheme_str()
                .is_some_and(|s| schemes.iter().any(|ok| s.eq_ignore_ascii_case(ok)))
    })
}

pub(crate) fn is_socket_url(url: &str) -> bool {
    has_scheme(url, &["ws", "wss"])
}

impl ConnectionConfig {
    /// Check every field and collect all problems.
    #[must_use]
    pub fn validate(&self) -> Validation {
        let mut errors = Vec::new();

        if !self.endpoint_url.is_empty() && !is_socket_url(&self.endpoint_url) {
            errors.push("Invalid WebSocket URL format".to_string());
        }
        if !self.proxy_url.is_empty()
            && !is_socket_url(&self.proxy_url)
            && !has_scheme(&self.proxy_url, &["https"])
        {
            errors.push("Invalid Proxy URL format (use https:// or wss://)".to_string());
        }
        if self.reconnect_interval_ms < MIN_RECONNECT_INTERVAL_MS {
            errors.push("Reconnect interval must be at least 1000ms".to_string());
        }
        if self.max_reconnect_attempts < 0 {
            errors.push("Max reconnect attempts must be non-negative".to_string());
        }
        if self.sample_interval_ms < MIN_SAMPLE_INTERVAL_MS {
            errors.push("Data transmission interval must be at least 50ms".to_string());
        }

        Validation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Proxy address when set, otherwise the direct address (possibly empty).
    #[must_use]
    pub fn effective_endpoint(&self) -> &str {
        if self.proxy_url.is_empty() {
            &self.endpoint_url
        } else {
            &self.proxy_url
        }
    }

    /// Retry budget as an unsigned count; negative values count as zero.
    #[must_use]
    pub fn retry_limit(&self) -> u32 {
        u32::try_from(self.max_reconnect_attempts.max(0)).unwrap_or(u32::MAX)
    }
}

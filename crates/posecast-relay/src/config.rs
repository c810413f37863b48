use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "posecast-relay")]
#[command(about = "posecast telemetry relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "POSECAST_RELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "POSECAST_RELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "1000", env = "POSECAST_RELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "1048576", env = "POSECAST_RELAY_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Interval between `performance_metrics` pushes in milliseconds.
    #[arg(long, default_value = "1000", env = "POSECAST_RELAY_METRICS_INTERVAL_MS")]
    pub metrics_interval_ms: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "POSECAST_RELAY_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "POSECAST_RELAY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Seconds to wait for open connections on shutdown.
    #[arg(long, default_value = "10", env = "POSECAST_RELAY_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Do not read operator commands from stdin.
    #[arg(long, env = "POSECAST_RELAY_NO_CONSOLE")]
    pub no_console: bool,
    /// Verbose output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_payload: usize,
    /// Interval between `performance_metrics` pushes.
    pub metrics_interval: Duration,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// How long shutdown waits for open connections.
    pub drain_timeout: Duration,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first out-of-range value.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        // Pose frames carry 17 keypoints; anything under 4 KiB cannot hold one.
        if self.max_payload < 4096 {
            return Err("max_payload must be at least 4096 bytes".to_string());
        }
        if self.max_payload > 16 * 1024 * 1024 {
            return Err("max_payload exceeds reasonable limit (16 MiB)".to_string());
        }

        if self.metrics_interval < Duration::from_millis(100) {
            return Err("metrics_interval_ms must be at least 100".to_string());
        }
        if self.metrics_interval > Duration::from_secs(3600) {
            return Err("metrics_interval_ms exceeds reasonable limit (1 hour)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout cannot be shorter than ping_interval".to_string());
        }

        if self.drain_timeout > Duration::from_secs(300) {
            return Err("drain_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_conns: 1000,
            max_payload: 1_048_576,
            metrics_interval: Duration::from_secs(1),
            ping_interval: 30,
            idle_timeout: 120,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_payload: args.max_payload,
            metrics_interval: Duration::from_millis(args.metrics_interval_ms),
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            drain_timeout: Duration::from_secs(args.drain_timeout),
        }
    }
}

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::cli::Cli;
use crate::registry::RegistryConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub metrics_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var("MESH_ROAD_BIND")
                .ok()
                .and_then(|b| b.parse().ok())
                .unwrap_or(defaults.bind),
            port: env::var("MESH_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            heartbeat_interval_seconds: env::var("MESH_ROAD_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.heartbeat_interval_seconds),
            heartbeat_timeout_seconds: env::var("MESH_ROAD_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.heartbeat_timeout_seconds),
            metrics_enabled: env::var("MESH_ROAD_METRICS")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.metrics_enabled),
        }
    }

    /// Command-line flags win over the environment.
    pub fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(bind) = cli.bind {
            self.bind = bind;
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(timeout) = cli.heartbeat_timeout {
            self.heartbeat_timeout_seconds = timeout;
        }
        if cli.metrics {
            self.metrics_enabled = true;
        }
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_seconds),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            heartbeat_interval_seconds: 60,
            heartbeat_timeout_seconds: 600, // 10 minutes
            metrics_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test_timeout::timeout]
    fn cli_overrides_defaults() {
        let cli = Cli::parse_from([
            "mesh-road",
            "--port",
            "9000",
            "--bind",
            "127.0.0.1",
            "--heartbeat-timeout",
            "0",
            "--metrics",
        ]);
        let config = Config::default().with_cli(&cli);
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:9000");
        assert!(config.metrics_enabled);
        assert!(config.registry().heartbeat_timeout.is_zero());
    }

    #[test_timeout::timeout]
    fn defaults_sweep_every_minute() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.registry().heartbeat_interval, Duration::from_secs(60));
    }
}

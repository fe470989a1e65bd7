use std::env;
use std::time::Duration;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Settings for one mesh node.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Relay websocket endpoint
    pub relay_url: String,
    /// STUN/TURN urls handed to every transport; empty for localhost-only meshes
    pub ice_servers: Vec<String>,
    /// Sessions stuck before `Answered` this long are failed; `None` waits forever
    pub negotiation_timeout: Option<Duration>,
    /// How often stalled sessions are swept and missing links re-attempted
    pub maintenance_interval: Duration,
    /// Relay keep-alive period
    pub heartbeat_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3000/ws".to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            negotiation_timeout: Some(Duration::from_secs(30)),
            maintenance_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl PeerConfig {
    /// Defaults overridden by `MESH_RELAY_URL`, `MESH_ICE_SERVERS`,
    /// `MESH_LOCALHOST_ONLY` and `MESH_NEGOTIATION_TIMEOUT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("MESH_RELAY_URL") {
            config.relay_url = url;
        }
        if let Ok(servers) = env::var("MESH_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&servers);
        }
        if env::var("MESH_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        }
        if let Some(timeout) = env::var("MESH_NEGOTIATION_TIMEOUT")
            .ok()
            .and_then(|value| parse_timeout(&value))
        {
            config.negotiation_timeout = timeout;
        }
        config
    }

    /// No STUN/TURN: host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

fn parse_ice_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// Seconds; `0` disables the timeout. Unparseable values are ignored.
fn parse_timeout(value: &str) -> Option<Option<Duration>> {
    match value.trim().parse::<u64>().ok()? {
        0 => Some(None),
        secs => Some(Some(Duration::from_secs(secs))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ice_server_lists_are_comma_separated() {
        assert_eq!(
            parse_ice_servers("stun:a:3478, turn:b:3478 ,,"),
            vec!["stun:a:3478".to_string(), "turn:b:3478".to_string()]
        );
        assert!(parse_ice_servers("").is_empty());
    }

    #[test_timeout::timeout]
    fn zero_timeout_disables_the_sweep() {
        assert_eq!(parse_timeout("0"), Some(None));
        assert_eq!(parse_timeout("12"), Some(Some(Duration::from_secs(12))));
        assert_eq!(parse_timeout("soon"), None);
    }

    #[test_timeout::timeout]
    fn localhost_has_no_ice_servers() {
        let config = PeerConfig::localhost().with_negotiation_timeout(None);
        assert!(config.ice_servers.is_empty());
        assert!(config.negotiation_timeout.is_none());
        assert_eq!(PeerConfig::default().ice_servers.len(), 1);
    }
}

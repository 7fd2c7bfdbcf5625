use std::time::Duration;

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Preferred TCP service port. Falls back to an ephemeral port when the
    /// bind fails.
    pub local_port: u16,
    /// Timeout for a single stream write during the handshake.
    pub send_timeout: Duration,
    /// Timeout for a single stream read. Long, because tunnel channels can
    /// sit idle between application-level keepalives.
    pub recv_timeout: Duration,
    /// Timeout for an outgoing TCP connect.
    pub connect_timeout: Duration,
    /// How long a handshake loser waits for the winning admission before
    /// giving up.
    pub handshake_grace: Duration,
    /// How long to wait for some connected peer to agree to relay a tunnel.
    pub proxy_wait_timeout: Duration,
    /// Delay before the first connectivity probe.
    pub probe_initial_delay: Duration,
    /// Normal connectivity probe cadence.
    pub probe_interval: Duration,
    /// Probe cadence while UPnP is in an error state.
    pub probe_retry_interval: Duration,
    /// SSDP gateway discovery timeout.
    pub upnp_discover_timeout: Duration,
    /// Description attached to UPnP port mappings.
    pub upnp_description: String,
    /// Echo service URLs, tried in order until one answers.
    pub echo_services: Vec<String>,
    /// URL used to test general web accessibility.
    pub web_check_url: String,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            send_timeout: Duration::from_secs(30),
            recv_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            handshake_grace: Duration::from_millis(500),
            proxy_wait_timeout: Duration::from_secs(20),
            probe_initial_delay: Duration::from_secs(1),
            probe_interval: Duration::from_secs(60),
            probe_retry_interval: Duration::from_secs(10),
            upnp_discover_timeout: Duration::from_secs(30),
            upnp_description: "Bit Chat".to_string(),
            echo_services: vec![
                "https://bitchat.im/connectivity/check.aspx".to_string(),
                "https://chat.technitium.com/connectivity/check.aspx".to_string(),
            ],
            web_check_url: "https://ifconfig.me".to_string(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

//! Configuration management for roomdrop

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Room policy
    #[serde(default)]
    pub room: RoomConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRtcConfig,

    /// Transfer engine tuning
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Password-hash store file; empty keeps hashes in memory only
    #[serde(default)]
    pub password_store: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            password_store: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Peer cap per room; a full room refuses further joins
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self { max_peers: default_max_peers() }
    }
}

/// ICE server configuration for WebRTC NAT traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// STUN/TURN server URLs (e.g., "stun:stun.l.google.com:19302")
    pub urls: Vec<String>,

    /// Username for TURN authentication (optional)
    #[serde(default)]
    pub username: Option<String>,

    /// Credential for TURN authentication (optional)
    #[serde(default)]
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// ICE servers for NAT traversal
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Seconds of negotiation before the link is reported slow
    #[serde(default = "default_slow_secs")]
    pub slow_after_secs: u64,

    /// Seconds of negotiation before falling back to relay
    #[serde(default = "default_relay_secs")]
    pub relay_after_secs: u64,

    /// Seconds of ICE disconnection tolerated before relay fallback
    #[serde(default = "default_disconnect_grace_secs")]
    pub disconnect_grace_secs: u64,

    /// Start negotiation eagerly when a peer joins
    #[serde(default = "default_true")]
    pub prewarm: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            slow_after_secs: default_slow_secs(),
            relay_after_secs: default_relay_secs(),
            disconnect_grace_secs: default_disconnect_grace_secs(),
            prewarm: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size on the data channel in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Outbound buffer high-water mark; emission pauses above this
    #[serde(default = "default_high_water")]
    pub buffer_high_water: usize,

    /// Outbound buffer low-water mark; emission resumes below this
    #[serde(default = "default_low_water")]
    pub buffer_low_water: usize,

    /// Seconds to wait for a file-response before failing with timeout
    #[serde(default = "default_accept_timeout_secs")]
    pub accept_timeout_secs: u64,

    /// Seconds without streaming progress before failing the transfer
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// Largest relay-data payload the server forwards, in bytes
    #[serde(default = "default_relay_max_payload")]
    pub relay_max_payload: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            buffer_high_water: default_high_water(),
            buffer_low_water: default_low_water(),
            accept_timeout_secs: default_accept_timeout_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            relay_max_payload: default_relay_max_payload(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            room: RoomConfig::default(),
            webrtc: WebRtcConfig::default(),
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.room.max_peers < 2 {
            return Err("Room peer cap must allow at least two peers".into());
        }

        if self.transfer.chunk_size == 0 {
            return Err("Transfer chunk size must be non-zero".into());
        }

        if self.transfer.buffer_low_water >= self.transfer.buffer_high_water {
            return Err("Buffer low-water mark must be below the high-water mark".into());
        }

        if self.transfer.chunk_size > self.transfer.relay_max_payload {
            return Err("Chunk size cannot exceed the relay payload cap".into());
        }

        if self.webrtc.slow_after_secs >= self.webrtc.relay_after_secs {
            return Err("Slow threshold must be below the relay threshold".into());
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entry has no URLs".into());
            }
        }

        Ok(())
    }
}

fn default_max_peers() -> usize {
    16
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::default()]
}

fn default_slow_secs() -> u64 {
    4
}

fn default_relay_secs() -> u64 {
    8
}

fn default_disconnect_grace_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_high_water() -> usize {
    1024 * 1024
}

fn default_low_water() -> usize {
    256 * 1024
}

fn default_accept_timeout_secs() -> u64 {
    60
}

fn default_stall_timeout_secs() -> u64 {
    15
}

fn default_relay_max_payload() -> usize {
    64 * 1024
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_watermarks() {
        let mut cfg = Config::default();
        cfg.transfer.buffer_low_water = cfg.transfer.buffer_high_water;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_chunks() {
        let mut cfg = Config::default();
        cfg.transfer.chunk_size = cfg.transfer.relay_max_payload + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_webrtc_thresholds() {
        let mut cfg = Config::default();
        cfg.webrtc.slow_after_secs = cfg.webrtc.relay_after_secs;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [transfer]
            chunk_size = 32768
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.transfer.chunk_size, 32768);
        assert_eq!(cfg.room.max_peers, 16);
    }
}

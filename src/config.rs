//! Configuration for the media bridge
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

/// Main configuration for the media bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP signaling server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// WebRTC transport configuration
    #[serde(default)]
    pub webrtc: WebRtcConfig,

    /// Local RTP transport configuration (producer -> pump)
    #[serde(default)]
    pub rtp: RtpConfig,

    /// Media source process configuration
    #[serde(default)]
    pub source: SourceConfig,
}

/// HTTP signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the signaling endpoint to
    #[serde(default = "default_host")]
    pub host: String,

    /// Signaling endpoint port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN server URLs
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// Lower bound of the ICE ephemeral UDP port range
    ///
    /// This range is used by the WebRTC transport itself and is separate
    /// from the producer RTP range in [`RtpConfig`].
    #[serde(default = "default_ice_port_min")]
    pub ice_port_min: u16,

    /// Upper bound of the ICE ephemeral UDP port range
    #[serde(default = "default_ice_port_max")]
    pub ice_port_max: u16,

    /// Bounded wait for ICE gathering before the offer is answered, in seconds
    #[serde(default = "default_gather_timeout")]
    pub gather_timeout_seconds: u64,

    /// Outbound video codec capability, registered once at startup
    #[serde(default)]
    pub codec: CodecConfig,
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_ice_port_min() -> u16 {
    10000
}

fn default_ice_port_max() -> u16 {
    20000
}

fn default_gather_timeout() -> u64 {
    10
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            ice_port_min: default_ice_port_min(),
            ice_port_max: default_ice_port_max(),
            gather_timeout_seconds: default_gather_timeout(),
            codec: CodecConfig::default(),
        }
    }
}

/// Outbound video codec capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// RTP codec MIME type
    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// RTP clock rate in Hz
    #[serde(default = "default_clock_rate")]
    pub clock_rate: u32,

    /// RTP payload type
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,

    /// SDP fmtp line for the codec
    #[serde(default = "default_fmtp_line")]
    pub fmtp_line: String,
}

fn default_mime_type() -> String {
    "video/H264".to_string()
}

fn default_clock_rate() -> u32 {
    90000
}

fn default_payload_type() -> u8 {
    96
}

fn default_fmtp_line() -> String {
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string()
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            mime_type: default_mime_type(),
            clock_rate: default_clock_rate(),
            payload_type: default_payload_type(),
            fmtp_line: default_fmtp_line(),
        }
    }
}

/// Local RTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    /// Host the per-session receive socket binds to and the producer emits to
    #[serde(default = "default_rtp_host")]
    pub host: String,

    /// First port the allocator probes
    #[serde(default = "default_rtp_base_port")]
    pub base_port: u16,

    /// Port at which the allocator cursor wraps back to `base_port`
    #[serde(default = "default_rtp_max_port")]
    pub max_port: u16,

    /// Maximum bind probes per reservation before reporting exhaustion
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,
}

fn default_rtp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rtp_base_port() -> u16 {
    5004
}

fn default_rtp_max_port() -> u16 {
    65000
}

fn default_max_probes() -> u32 {
    128
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            host: default_rtp_host(),
            base_port: default_rtp_base_port(),
            max_port: default_rtp_max_port(),
            max_probes: default_max_probes(),
        }
    }
}

/// Media source process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Producer command to invoke
    #[serde(default = "default_source_command")]
    pub command: String,

    /// Input media file, looped indefinitely
    #[serde(default = "default_source_input")]
    pub input: String,

    /// Video encoder passed to the producer
    #[serde(default = "default_source_encoder")]
    pub encoder: String,
}

fn default_source_command() -> String {
    "ffmpeg".to_string()
}

fn default_source_input() -> String {
    "test.mp4".to_string()
}

fn default_source_encoder() -> String {
    "libx264".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            command: default_source_command(),
            input: default_source_input(),
            encoder: default_source_encoder(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config =
            toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        // Server
        if let Ok(host) = std::env::var("BRIDGE_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("BRIDGE_HTTP_PORT") {
            if let Ok(p) = port.parse() {
                config.server.http_port = p;
            }
        }

        // RTP
        if let Ok(port) = std::env::var("BRIDGE_RTP_BASE_PORT") {
            if let Ok(p) = port.parse() {
                config.rtp.base_port = p;
            }
        }
        if let Ok(port) = std::env::var("BRIDGE_RTP_MAX_PORT") {
            if let Ok(p) = port.parse() {
                config.rtp.max_port = p;
            }
        }

        // Source
        if let Ok(command) = std::env::var("BRIDGE_SOURCE_COMMAND") {
            config.source.command = command;
        }
        if let Ok(input) = std::env::var("BRIDGE_SOURCE_INPUT") {
            config.source.input = input;
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - the ICE or RTP port ranges are inverted
    /// - `payload_type` is outside the dynamic range 96-127
    /// - `max_probes` is zero
    pub fn validate(&self) -> Result<()> {
        if self.webrtc.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.webrtc.ice_port_min >= self.webrtc.ice_port_max {
            return Err(Error::InvalidConfig(format!(
                "ICE port range is inverted: {}-{}",
                self.webrtc.ice_port_min, self.webrtc.ice_port_max
            )));
        }

        if self.rtp.base_port >= self.rtp.max_port {
            return Err(Error::InvalidConfig(format!(
                "RTP port range is inverted: {}-{}",
                self.rtp.base_port, self.rtp.max_port
            )));
        }

        if !(96..=127).contains(&self.webrtc.codec.payload_type) {
            return Err(Error::InvalidConfig(format!(
                "payload_type must be in the dynamic range 96-127, got {}",
                self.webrtc.codec.payload_type
            )));
        }

        if self.rtp.max_probes == 0 {
            return Err(Error::InvalidConfig(
                "max_probes must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

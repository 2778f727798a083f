//! Error types for the media bridge

/// Result type alias using the bridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating and running bridge sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SDP negotiation error (malformed or missing offer/answer)
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Media track creation/attachment error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// No bindable RTP port found within the probe budget
    #[error("No bindable port in {base}-{max} after {attempts} probes")]
    PortsExhausted { base: u16, max: u16, attempts: u32 },

    /// Media source process error (spawn failure, kill failure)
    #[error("Media source error: {0}")]
    SourceError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Check if this error was caused by bad client input
    ///
    /// Client errors map to a 400 response on the signaling endpoint;
    /// everything else is reported as an internal error.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::SdpError(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

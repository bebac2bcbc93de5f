use std::io;

/// Error type covering the lifetime of a proxied connection plus startup
/// configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("client address is not allowed")]
    AdmissionDenied,

    #[error("protocol framing error: {0}")]
    Framing(String),

    #[error("unsupported protocol feature: {0}")]
    Unsupported(String),

    #[error("failed to reach upstream '{destination}': {source}")]
    UpstreamDial {
        destination: String,
        source: io::Error,
    },

    #[error("peer i/o error: {0}")]
    PeerIo(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

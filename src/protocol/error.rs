use std::io;

use thiserror::Error;

/// Errors raised by the TLS layer
#[derive(Debug, Error)]
pub enum TlsError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// Certificate parsing error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Private key parsing error
    #[error("private key error: {0}")]
    PrivateKey(String),

    /// Pre-shared key material missing or malformed
    #[error("PSK error: {0}")]
    Psk(String),

    /// Peer or local TLS engine rejected the handshake
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// TLS engine refused further input before it was drained
    #[error("TLS buffer exhausted")]
    BufferExhausted,

    /// Requested mode has no usable context
    #[error("TLS mode \"{0}\" is not configured")]
    NotConfigured(&'static str),

    /// Peer connected with a mode that is not accepted
    #[error("connection of type \"{0}\" is not allowed")]
    NotAllowed(&'static str),

    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while exchanging framed messages
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out: {operation}")]
    Timeout { operation: &'static str },

    #[error("invalid message header")]
    InvalidMagic,

    #[error("unsupported header flags 0x{0:02x}")]
    UnsupportedFlags(u8),

    #[error("message size {size} exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: u64, max: u64 },

    #[error("cannot compress or decompress message: {0}")]
    Compression(io::Error),

    #[error("uncompressed message size {actual} does not match expected size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl TransportError {
    /// Errors caused by the peer violating the framing
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidMagic
                | TransportError::UnsupportedFlags(_)
                | TransportError::MessageTooLarge { .. }
                | TransportError::Compression(_)
                | TransportError::SizeMismatch { .. }
        )
    }
}

//! Error types for key exchange and decryption.

use thiserror::Error;

/// Errors that can occur while negotiating keys or decrypting samples.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing encryption metadata, a key that never arrived in
    /// time, or a request the bound session cannot serve.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Protocol misuse, e.g. generating a second request on one session.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Operation attempted on a released session or instance.
    #[error("session closed - re-resolve against the attached CDM instance")]
    Closed,

    /// License response rejected by the backend.
    #[error("license rejected: {0}")]
    License(String),

    /// Cipher capability failure.
    #[error("cipher failure: {0}")]
    Cipher(String),

    /// Invalid DRM system identifier.
    #[error("invalid drm system id: {0}")]
    InvalidSystemId(#[from] uuid::Error),

    /// Invalid JSON in a ClearKey message.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid base64 in a ClearKey message.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Invalid hex string.
    #[error("invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Result type for key exchange and decryption operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the licensing module.

use thiserror::Error;

/// Licensing-specific errors.
///
/// These never escape [`LicenseClient::authorize`](crate::LicenseClient::authorize);
/// the orchestrator folds them into an [`AuthorizationDecision`](crate::AuthorizationDecision).
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Invalid license key format.
    #[error("invalid license key format: {0}")]
    InvalidKeyFormat(String),

    /// Token signature verification failed.
    #[error("license token signature invalid")]
    InvalidSignature,

    /// The host exposes no stable identifier to derive a fingerprint from.
    #[error("device identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// Cached credential bytes could not be parsed.
    #[error("license cache corrupt: {0}")]
    Corrupt(String),

    /// Token bound to another device, or cache fields disagree.
    #[error("license cache tampered: {0}")]
    Tampered(String),

    /// License has expired.
    #[error("license expired on {0}")]
    Expired(String),

    /// Network error while contacting the license server.
    #[error("network error: {0}")]
    Network(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;

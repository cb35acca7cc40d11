//! Device-bound offline license verification for popwatch.
//!
//! This crate handles:
//! - Hardware fingerprinting for device binding
//! - Verification of server-signed license tokens (Ed25519, or legacy
//!   HMAC-SHA256)
//! - Atomic, tamper-evident local caching of the token
//! - Activation, renewal and revocation against the license server
//!
//! # Design Principles
//!
//! - **Offline-first**: a valid cached token authorizes without network
//! - **Fail closed**: anything that cannot be verified is denied
//! - **Device binding**: a cache file copied to another machine is inert
//! - **Verify only**: the client never holds a signing key
//!
//! # Token Format
//!
//! Tokens are JSON `{licenseId, deviceFingerprint, issuedAt, expiresAt,
//! signature}`. The signature covers a length-prefixed canonical encoding of
//! the other four fields; see [`LicenseToken::signable_bytes`].

mod client;
mod clock;
mod config;
mod decision;
mod device;
mod error;
mod key;
mod server;
mod signature;
mod store;
mod token;

pub use client::LicenseClient;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{LicenseConfig, MAX_BACKOFF};
pub use decision::AuthorizationDecision;
pub use device::{DeviceFingerprint, DeviceIdentity, DeviceInfo, FixedIdentity, HostIdentity};
pub use error::{LicenseError, LicenseResult};
pub use key::{LicenseKey, MAX_KEY_LEN};
pub use server::{
    ActivateRequest, ErrorResponse, LicenseServer, OfflineServer, RevalidateRequest, ServerError,
    ServerErrorCode,
};
pub use signature::{
    sign, verify, Ed25519Signer, Ed25519Verifier, HmacSigner, HmacVerifier, Mac, TokenSigner,
    TokenVerifier, VerificationKey, MAC_LEN,
};
pub use store::{
    default_cache_dir, CachedCredential, FileTokenStore, MemoryTokenStore, TokenStore,
    CACHE_FILE_NAME, CACHE_VERSION,
};
pub use token::{LicenseToken, TokenState};

#[cfg(feature = "online")]
pub use server::HttpLicenseServer;

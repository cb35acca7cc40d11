//! Signature engine for license tokens.
//!
//! The client only ever verifies. Production deployments hold the server's
//! Ed25519 public key; the HMAC-SHA256 shared-secret scheme is kept for
//! legacy servers. Signers live here too so server implementations and test
//! doubles produce tokens through the same code path the client checks.

use crate::error::{LicenseError, LicenseResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 tag.
pub const MAC_LEN: usize = 32;

/// An HMAC-SHA256 authentication tag.
pub type Mac = [u8; MAC_LEN];

fn keyed(secret: &[u8]) -> LicenseResult<HmacSha256> {
    HmacSha256::new_from_slice(secret)
        .map_err(|e| LicenseError::Config(format!("invalid hmac secret: {e}")))
}

/// Computes the HMAC-SHA256 tag of `payload` under `secret`.
///
/// # Errors
///
/// Returns [`LicenseError::Config`] if the secret is rejected by the MAC.
pub fn sign(payload: &[u8], secret: &[u8]) -> LicenseResult<Mac> {
    let mut mac = keyed(secret)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().into())
}

/// Verifies an HMAC-SHA256 tag in constant time.
#[must_use]
pub fn verify(payload: &[u8], mac: &[u8], secret: &[u8]) -> bool {
    let Ok(mut expected) = keyed(secret) else {
        return false;
    };
    expected.update(payload);
    expected.verify_slice(mac).is_ok()
}

/// Checks token signatures on the client.
pub trait TokenVerifier: Send + Sync {
    /// Returns true if `signature` authenticates `payload`.
    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool;

    /// Short scheme name, for logs.
    fn scheme(&self) -> &'static str;
}

/// Produces token signatures. Only the license server holds one in
/// production.
pub trait TokenSigner: Send + Sync {
    /// Signs `payload`.
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

/// Ed25519 verifier holding only the server's public key.
#[derive(Clone)]
pub struct Ed25519Verifier(VerifyingKey);

impl Ed25519Verifier {
    /// Creates a verifier from a raw 32-byte public key.
    pub fn from_bytes(bytes: &[u8; 32]) -> LicenseResult<Self> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| LicenseError::Config("invalid ed25519 public key".to_string()))
    }

    /// Creates a verifier from either a raw 32-byte key or a DER-encoded
    /// SubjectPublicKeyInfo.
    pub fn from_slice(bytes: &[u8]) -> LicenseResult<Self> {
        match <&[u8; 32]>::try_from(bytes) {
            Ok(raw) => Self::from_bytes(raw),
            Err(_) => VerifyingKey::from_public_key_der(bytes)
                .map(Self)
                .map_err(|e| LicenseError::Config(format!("invalid ed25519 public key: {e}"))),
        }
    }

    /// Returns the raw 32-byte public key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl TokenVerifier for Ed25519Verifier {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.0.verify_strict(payload, &signature).is_ok()
    }

    fn scheme(&self) -> &'static str {
        "ed25519"
    }
}

impl fmt::Debug for Ed25519Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Verifier({})", BASE64.encode(self.0.as_bytes()))
    }
}

/// Ed25519 signer (server side).
pub struct Ed25519Signer(SigningKey);

impl Ed25519Signer {
    /// Creates a signer from a raw 32-byte secret.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    /// Returns the verifier matching this signer.
    #[must_use]
    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier(self.0.verifying_key())
    }
}

impl TokenSigner for Ed25519Signer {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.0.sign(payload).to_bytes().to_vec()
    }
}

/// Shared-secret HMAC-SHA256 verifier.
#[derive(Clone)]
pub struct HmacVerifier {
    secret: Vec<u8>,
}

impl HmacVerifier {
    /// Creates a verifier from the shared secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> LicenseResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(LicenseError::Config("hmac secret is empty".to_string()));
        }
        Ok(Self { secret })
    }
}

impl TokenVerifier for HmacVerifier {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        verify(payload, signature, &self.secret)
    }

    fn scheme(&self) -> &'static str {
        "hmac-sha256"
    }
}

impl fmt::Debug for HmacVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HmacVerifier(<redacted>)")
    }
}

/// Shared-secret HMAC-SHA256 signer (server side).
pub struct HmacSigner {
    mac: HmacSha256,
}

impl HmacSigner {
    /// Creates a signer from the shared secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> LicenseResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(LicenseError::Config("hmac secret is empty".to_string()));
        }
        Ok(Self {
            mac: keyed(&secret)?,
        })
    }
}

impl TokenSigner for HmacSigner {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

impl fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HmacSigner(<redacted>)")
    }
}

/// Verification key as written in configuration, base64-encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
pub enum VerificationKey {
    /// Server's Ed25519 public key (raw 32 bytes or DER SPKI).
    Ed25519 {
        /// Base64-encoded key.
        public_key: String,
    },
    /// Legacy shared secret.
    HmacSha256 {
        /// Base64-encoded secret.
        secret: String,
    },
}

impl VerificationKey {
    /// Builds the verifier this key describes.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] for bad base64 or an unusable key.
    pub fn to_verifier(&self) -> LicenseResult<Box<dyn TokenVerifier>> {
        match self {
            Self::Ed25519 { public_key } => {
                let bytes = decode_key(public_key)?;
                Ok(Box::new(Ed25519Verifier::from_slice(&bytes)?))
            }
            Self::HmacSha256 { secret } => {
                let bytes = decode_key(secret)?;
                Ok(Box::new(HmacVerifier::new(bytes)?))
            }
        }
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ed25519 { public_key } => f
                .debug_struct("Ed25519")
                .field("public_key", public_key)
                .finish(),
            Self::HmacSha256 { .. } => f
                .debug_struct("HmacSha256")
                .field("secret", &"<redacted>")
                .finish(),
        }
    }
}

fn decode_key(encoded: &str) -> LicenseResult<Vec<u8>> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| LicenseError::Config(format!("invalid key base64: {e}")))
}

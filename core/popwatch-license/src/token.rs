//! Signed license tokens.
//!
//! A token asserts "license L is valid for device D until time T". The
//! signature covers every other field, so changing any of them makes
//! verification fail.

use crate::device::DeviceFingerprint;
use crate::error::{LicenseError, LicenseResult};
use crate::signature::{TokenSigner, TokenVerifier};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain separation tag prefixed to the signable bytes.
const TOKEN_DOMAIN: &[u8] = b"popwatch.license-token.v1\0";

/// Where a token stands relative to the current time and host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Signature and binding hold, not yet expired.
    Active,
    /// Past `expires_at`.
    Expired,
    /// Signature does not verify.
    Tampered,
    /// Signature verifies but the token is bound to another machine.
    OtherDevice,
}

/// An immutable signed license token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseToken {
    license_id: String,
    device_fingerprint: DeviceFingerprint,
    /// Seconds since epoch.
    issued_at: i64,
    /// Seconds since epoch.
    expires_at: i64,
    /// base64url (no pad) signature over [`LicenseToken::signable_bytes`].
    signature: String,
}

impl LicenseToken {
    /// Issues a token signed by `signer`.
    #[must_use]
    pub fn issue(
        license_id: impl Into<String>,
        device_fingerprint: DeviceFingerprint,
        issued_at: i64,
        expires_at: i64,
        signer: &dyn TokenSigner,
    ) -> Self {
        let license_id = license_id.into();
        let payload = signable_bytes(&license_id, &device_fingerprint, issued_at, expires_at);
        let signature = URL_SAFE_NO_PAD.encode(signer.sign(&payload));
        Self {
            license_id,
            device_fingerprint,
            issued_at,
            expires_at,
            signature,
        }
    }

    /// Reassembles a token from its parts without checking anything.
    #[must_use]
    pub fn from_parts(
        license_id: impl Into<String>,
        device_fingerprint: DeviceFingerprint,
        issued_at: i64,
        expires_at: i64,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            license_id: license_id.into(),
            device_fingerprint,
            issued_at,
            expires_at,
            signature: signature.into(),
        }
    }

    /// Returns the license ID.
    #[must_use]
    pub fn license_id(&self) -> &str {
        &self.license_id
    }

    /// Returns the fingerprint this token is bound to.
    #[must_use]
    pub fn device_fingerprint(&self) -> &DeviceFingerprint {
        &self.device_fingerprint
    }

    /// Returns the issued-at timestamp (seconds since epoch).
    #[must_use]
    pub fn issued_at_secs(&self) -> i64 {
        self.issued_at
    }

    /// Returns the expiration timestamp (seconds since epoch).
    #[must_use]
    pub fn expires_at_secs(&self) -> i64 {
        self.expires_at
    }

    /// Returns the expiration time, if representable.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    /// Returns the encoded signature.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Returns the exact bytes the signature covers.
    #[must_use]
    pub fn signable_bytes(&self) -> Vec<u8> {
        signable_bytes(
            &self.license_id,
            &self.device_fingerprint,
            self.issued_at,
            self.expires_at,
        )
    }

    /// Returns true if the signature authenticates every other field.
    ///
    /// A token whose expiry precedes its issue time never verifies.
    #[must_use]
    pub fn verify_signature(&self, verifier: &dyn TokenVerifier) -> bool {
        if self.expires_at < self.issued_at {
            return false;
        }
        let Ok(signature) = URL_SAFE_NO_PAD.decode(&self.signature) else {
            return false;
        };
        verifier.verify(&self.signable_bytes(), &signature)
    }

    /// Returns true if `now` (seconds since epoch) is past expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Classifies this token for the given host and time.
    ///
    /// Signature first, then device binding, then expiry.
    #[must_use]
    pub fn state(
        &self,
        verifier: &dyn TokenVerifier,
        current: &DeviceFingerprint,
        now: i64,
    ) -> TokenState {
        if !self.verify_signature(verifier) {
            TokenState::Tampered
        } else if &self.device_fingerprint != current {
            TokenState::OtherDevice
        } else if self.is_expired_at(now) {
            TokenState::Expired
        } else {
            TokenState::Active
        }
    }

    /// Checks the token and returns it as an error-typed outcome.
    ///
    /// # Errors
    ///
    /// [`LicenseError::InvalidSignature`] for a bad signature,
    /// [`LicenseError::Tampered`] for a foreign binding,
    /// [`LicenseError::Expired`] past expiry.
    pub fn verify(
        &self,
        verifier: &dyn TokenVerifier,
        current: &DeviceFingerprint,
        now: i64,
    ) -> LicenseResult<()> {
        match self.state(verifier, current, now) {
            TokenState::Active => Ok(()),
            TokenState::Tampered => Err(LicenseError::InvalidSignature),
            TokenState::OtherDevice => Err(LicenseError::Tampered(
                "token bound to a different device".to_string(),
            )),
            TokenState::Expired => Err(LicenseError::Expired(
                self.expires_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| self.expires_at.to_string()),
            )),
        }
    }
}

/// Canonical format: domain || len(license_id) || license_id
/// || len(fingerprint) || fingerprint || issued_at || expires_at.
fn signable_bytes(
    license_id: &str,
    device: &DeviceFingerprint,
    issued_at: i64,
    expires_at: i64,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(TOKEN_DOMAIN.len() + license_id.len() + 80);
    bytes.extend_from_slice(TOKEN_DOMAIN);
    push_field(&mut bytes, license_id.as_bytes());
    push_field(&mut bytes, device.as_bytes());
    bytes.extend_from_slice(&issued_at.to_be_bytes());
    bytes.extend_from_slice(&expires_at.to_be_bytes());
    bytes
}

fn push_field(bytes: &mut Vec<u8>, field: &[u8]) {
    let len = u32::try_from(field.len()).unwrap_or(u32::MAX);
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(field);
}

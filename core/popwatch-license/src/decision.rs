//! The outcome of one authorization gate run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether this run may start, and if not, why.
///
/// Produced fresh on every startup and never persisted. Anything other than
/// [`AuthorizationDecision::Authorized`] must block the monitoring loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorizationDecision {
    /// Authorized until the given time (seconds since epoch).
    Authorized {
        /// Expiry of the authorization, including any offline grace.
        until: i64,
    },
    /// The license expired and the server would not renew it.
    DeniedExpired,
    /// The server reported the license revoked.
    DeniedRevoked,
    /// The cached credential failed signature or integrity checks.
    DeniedTampered,
    /// The cached token is bound to another machine.
    DeniedMismatchedDevice,
    /// The server was needed but could not be reached.
    DeniedNoNetwork,
    /// The server rejected the license key.
    DeniedInvalidKey,
    /// No stable machine identity could be derived.
    DeniedIdentityUnavailable,
    /// Nothing cached and no license key supplied.
    NotActivated,
}

impl AuthorizationDecision {
    /// Returns true only for `Authorized`.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized { .. })
    }

    /// Authorization expiry, seconds since epoch.
    #[must_use]
    pub fn authorized_until(&self) -> Option<i64> {
        match self {
            Self::Authorized { until } => Some(*until),
            _ => None,
        }
    }

    /// Stable machine-readable name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authorized { .. } => "authorized",
            Self::DeniedExpired => "denied_expired",
            Self::DeniedRevoked => "denied_revoked",
            Self::DeniedTampered => "denied_tampered",
            Self::DeniedMismatchedDevice => "denied_mismatched_device",
            Self::DeniedNoNetwork => "denied_no_network",
            Self::DeniedInvalidKey => "denied_invalid_key",
            Self::DeniedIdentityUnavailable => "denied_identity_unavailable",
            Self::NotActivated => "not_activated",
        }
    }

    /// True when the operator should be asked for a license key.
    ///
    /// Every denial qualifies except `DeniedIdentityUnavailable`: without a
    /// fingerprint no key can be bound to this machine. `DeniedNoNetwork`
    /// is included so the operator can restore connectivity and retry
    /// without relaunching.
    #[must_use]
    pub fn needs_license_key(&self) -> bool {
        !matches!(
            self,
            Self::Authorized { .. } | Self::DeniedIdentityUnavailable
        )
    }

    /// Operator-facing explanation. Reveals nothing about verification
    /// internals.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Authorized { until } => match DateTime::<Utc>::from_timestamp(*until, 0) {
                Some(t) => format!("access granted until {}", t.format("%Y-%m-%d %H:%M UTC")),
                None => "access granted".to_string(),
            },
            Self::DeniedExpired => "your license has expired".to_string(),
            Self::DeniedRevoked => "your license has been revoked".to_string(),
            Self::DeniedTampered => "the local license data is invalid".to_string(),
            Self::DeniedMismatchedDevice => {
                "this license is registered to a different machine".to_string()
            }
            Self::DeniedNoNetwork => {
                "the license server could not be reached; check your connection".to_string()
            }
            Self::DeniedInvalidKey => "the license key was not accepted".to_string(),
            Self::DeniedIdentityUnavailable => {
                "this machine could not be identified".to_string()
            }
            Self::NotActivated => "no license has been activated on this machine".to_string(),
        }
    }
}

impl fmt::Display for AuthorizationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

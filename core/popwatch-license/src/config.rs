//! Client configuration.

use crate::error::{LicenseError, LicenseResult};
use crate::signature::VerificationKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// License client configuration.
///
/// Durations are plain integers so the TOML stays readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// License server base URL (e.g. `https://license.example.com`).
    pub server_url: String,
    /// Key used to check token signatures.
    pub verification_key: Option<VerificationKey>,
    /// Directory holding the cached credential. `None` picks the platform
    /// data directory.
    pub cache_dir: Option<PathBuf>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Attempts per server call, including the first.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds; doubles per retry.
    pub retry_backoff_ms: u64,
    /// Total time the gate may spend on the network, in seconds.
    pub network_budget_secs: u64,
    /// How long past expiry a token is still honored while the server is
    /// unreachable, in seconds. Zero fails closed.
    pub offline_grace_secs: u64,
    /// Check in with the server once the cached token is older than this
    /// many seconds, even before it expires. `None` stays offline until
    /// expiry.
    pub revalidate_after_secs: Option<u64>,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            verification_key: None,
            cache_dir: None,
            request_timeout_secs: 10,
            max_attempts: 3,
            retry_backoff_ms: 500,
            network_budget_secs: 30,
            offline_grace_secs: 0,
            revalidate_after_secs: None,
        }
    }
}

impl LicenseConfig {
    /// Loads configuration from a TOML file. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the file cannot be read or parsed.
    pub fn from_toml_file(path: &Path) -> LicenseResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LicenseError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(text: &str) -> LicenseResult<Self> {
        toml::from_str(text).map_err(|e| LicenseError::Config(format!("invalid config: {e}")))
    }

    /// Rejects settings that would make the gate hang or never verify.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.verification_key.is_none() {
            return Err(LicenseError::Config("verification_key is required".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(LicenseError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(LicenseError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.network_budget_secs == 0 {
            return Err(LicenseError::Config(
                "network_budget_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Total network budget for one gate run.
    #[must_use]
    pub fn network_budget(&self) -> Duration {
        Duration::from_secs(self.network_budget_secs)
    }

    /// Backoff before retry number `retry` (1-based), capped at [`MAX_BACKOFF`].
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }

    /// Offline grace in seconds, as a signed offset.
    #[must_use]
    pub fn offline_grace(&self) -> i64 {
        i64::try_from(self.offline_grace_secs).unwrap_or(i64::MAX)
    }

    /// Revalidation age threshold in seconds.
    #[must_use]
    pub fn revalidate_after(&self) -> Option<i64> {
        self.revalidate_after_secs
            .map(|s| i64::try_from(s).unwrap_or(i64::MAX))
    }
}

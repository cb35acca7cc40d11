//! Operator-entered license keys.
//!
//! A key is an opaque identifier submitted to the license server. It is not
//! secret-derived and carries no signature of its own; the server decides
//! whether it is valid. Keys are masked in `Debug` and `Display` so they
//! never land in logs in full.

use crate::error::{LicenseError, LicenseResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest key accepted from the operator.
pub const MAX_KEY_LEN: usize = 256;

/// A syntactically valid license key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LicenseKey(String);

impl LicenseKey {
    /// Parses a key entered by the operator.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidKeyFormat`] if the key is empty, too
    /// long, or contains whitespace or control characters after trimming.
    pub fn parse(key: &str) -> LicenseResult<Self> {
        let key = key.trim();

        if key.is_empty() {
            return Err(LicenseError::InvalidKeyFormat("key is empty".to_string()));
        }
        if key.chars().count() > MAX_KEY_LEN {
            return Err(LicenseError::InvalidKeyFormat(format!(
                "key longer than {MAX_KEY_LEN} characters"
            )));
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(LicenseError::InvalidKeyFormat(
                "key contains whitespace or control characters".to_string(),
            ));
        }

        Ok(Self(key.to_string()))
    }

    /// Returns the raw key string, for submission to the server only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the key with all but the last four characters masked.
    #[must_use]
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let visible = chars.len().min(4);
        let tail: String = chars[chars.len() - visible..].iter().collect();
        format!("{}{tail}", "*".repeat(chars.len() - visible))
    }
}

impl TryFrom<String> for LicenseKey {
    type Error = LicenseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LicenseKey> for String {
    fn from(key: LicenseKey) -> Self {
        key.0
    }
}

impl fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for LicenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LicenseKey({})", self.masked())
    }
}

//! Device fingerprinting for license binding.
//!
//! Derives a stable hardware fingerprint that identifies this machine. A
//! license token is bound to one fingerprint, so a cache file copied to
//! another machine never authorizes there.

use crate::error::{LicenseError, LicenseResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use tracing::debug;

/// Information about the current device.
///
/// Diagnostic only. None of these fields take part in the fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Operating system name.
    pub os_name: String,
    /// Operating system version.
    pub os_version: String,
    /// Hostname.
    pub hostname: String,
    /// CPU architecture.
    pub arch: String,
}

impl DeviceInfo {
    /// Collects information about the current device.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            os_version: get_os_version(),
            hostname: get_hostname().unwrap_or_else(|| "unknown".to_string()),
            arch: env::consts::ARCH.to_string(),
        }
    }
}

/// A stable fingerprint that identifies a machine.
///
/// URL-safe base64 of a SHA-256 digest over the raw host identifiers.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    /// Derives a fingerprint from raw identifier strings.
    ///
    /// Identifiers are sorted before hashing so collection order never
    /// changes the result.
    #[must_use]
    pub fn from_identifiers<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts: Vec<String> = identifiers
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        parts.sort();
        parts.dedup();

        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    /// Wraps an already-derived fingerprint string (e.g. one read back
    /// from a server response).
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the fingerprint ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }

    /// Returns the fingerprint as bytes, as fed into token signatures.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceFingerprint({})", self.0)
    }
}

/// Source of the current machine's fingerprint.
pub trait DeviceIdentity: Send + Sync {
    /// Returns this machine's fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::IdentityUnavailable`] when no stable hardware
    /// identifier can be read. Implementations must never fall back to a
    /// random value.
    fn fingerprint(&self) -> LicenseResult<DeviceFingerprint>;
}

/// Fingerprints the real host from platform hardware identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostIdentity;

impl HostIdentity {
    /// Creates the production identity provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DeviceIdentity for HostIdentity {
    fn fingerprint(&self) -> LicenseResult<DeviceFingerprint> {
        let hardware = collect_hardware_ids();
        if hardware.is_empty() {
            return Err(LicenseError::IdentityUnavailable(
                "no machine id, platform uuid or network address found".to_string(),
            ));
        }
        debug!(sources = hardware.len(), "collected hardware identifiers");

        let mut ids = hardware;
        ids.push(format!("os:{}", env::consts::OS));
        if let Some(host) = get_hostname() {
            ids.push(format!("host:{host}"));
        }
        Ok(DeviceFingerprint::from_identifiers(ids))
    }
}

/// Deterministic identity for tests and tooling.
#[derive(Debug, Clone)]
pub struct FixedIdentity {
    fingerprint: Option<DeviceFingerprint>,
}

impl FixedIdentity {
    /// Builds an identity from arbitrary identifier strings.
    #[must_use]
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fingerprint: Some(DeviceFingerprint::from_identifiers(identifiers)),
        }
    }

    /// An identity that always reports `IdentityUnavailable`.
    #[must_use]
    pub fn unavailable() -> Self {
        Self { fingerprint: None }
    }
}

impl DeviceIdentity for FixedIdentity {
    fn fingerprint(&self) -> LicenseResult<DeviceFingerprint> {
        self.fingerprint
            .clone()
            .ok_or_else(|| LicenseError::IdentityUnavailable("fixed identity unset".to_string()))
    }
}

/// Collects hardware identifiers for fingerprinting.
///
/// Each entry is prefixed with its source so two different sources can
/// never collide on the same raw value.
fn collect_hardware_ids() -> Vec<String> {
    let mut ids = Vec::new();

    if let Some(machine_id) = get_machine_id() {
        ids.push(format!("machine:{machine_id}"));
    }
    if let Some(uuid) = get_platform_uuid() {
        ids.push(format!("uuid:{uuid}"));
    }
    for mac in get_mac_addresses() {
        ids.push(format!("mac:{mac}"));
    }

    ids
}

/// Gets the machine hostname.
fn get_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

/// Gets the OS version string.
fn get_os_version() -> String {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "ver"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("VERSION_ID="))
                    .map(|l| {
                        l.trim_start_matches("VERSION_ID=")
                            .trim_matches('"')
                            .to_string()
                    })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        "unknown".to_string()
    }
}

/// Gets the OS-assigned machine ID.
fn get_machine_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("reg")
            .args([
                "query",
                r"HKLM\SOFTWARE\Microsoft\Cryptography",
                "/v",
                "MachineGuid",
            ])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("MachineGuid"))
                    .and_then(|l| l.split_whitespace().last())
                    .map(String::from)
            })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        None
    }
}

/// Gets the firmware/platform UUID.
fn get_platform_uuid() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("IOPlatformUUID"))
                    .and_then(|l| l.split('"').nth(3))
                    .map(String::from)
            })
    }

    #[cfg(target_os = "linux")]
    {
        // Only readable by root on most distributions.
        std::fs::read_to_string("/sys/class/dmi/id/product_uuid")
            .ok()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Gets the MAC addresses of physical network interfaces.
fn get_mac_addresses() -> Vec<String> {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return Vec::new();
        };
        let mut macs: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name() != "lo")
            // Virtual interfaces (docker, veth, bridges) come and go.
            .filter(|e| e.path().join("device").exists())
            .filter_map(|e| std::fs::read_to_string(e.path().join("address")).ok())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty() && s != "00:00:00:00:00:00")
            .collect();
        macs.sort();
        macs
    }

    #[cfg(not(target_os = "linux"))]
    {
        Vec::new()
    }
}

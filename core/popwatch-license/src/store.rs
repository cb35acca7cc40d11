//! Local persistence of the signed token.
//!
//! The cache file is plain, inspectable JSON. Integrity comes from the token
//! signature, not from hiding the file. Writes are atomic (temp file in the
//! same directory, fsync, rename) so a crash or a racing second process never
//! leaves a half-written file behind.

use crate::device::DeviceFingerprint;
use crate::error::{LicenseError, LicenseResult};
use crate::token::LicenseToken;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Current on-disk format version.
pub const CACHE_VERSION: u32 = 1;

/// Version written by [`CachedCredential::revoked`]. Never loads.
const REVOKED_VERSION: u32 = 0;

/// File name of the cached credential inside the cache directory.
pub const CACHE_FILE_NAME: &str = "license.cache";

/// The persisted pairing of this device's fingerprint and its token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    version: u32,
    device: DeviceFingerprint,
    token: LicenseToken,
}

impl CachedCredential {
    /// Pairs a token with the fingerprint it was activated on.
    #[must_use]
    pub fn new(device: DeviceFingerprint, token: LicenseToken) -> Self {
        Self {
            version: CACHE_VERSION,
            device,
            token,
        }
    }

    /// A tombstone that [`CachedCredential::from_bytes`] always rejects as
    /// corrupt. Written in place of the cache when it cannot be deleted.
    #[must_use]
    pub fn revoked() -> Self {
        let nobody = DeviceFingerprint::from_raw(String::new());
        Self {
            version: REVOKED_VERSION,
            token: LicenseToken::from_parts("", nobody.clone(), 0, 0, ""),
            device: nobody,
        }
    }

    /// Returns the persisted device fingerprint.
    #[must_use]
    pub fn device(&self) -> &DeviceFingerprint {
        &self.device
    }

    /// Returns the cached token.
    #[must_use]
    pub fn token(&self) -> &LicenseToken {
        &self.token
    }

    /// Returns the format version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Serializes to the on-disk encoding.
    pub fn to_bytes(&self) -> LicenseResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses the on-disk encoding.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Corrupt`] for malformed bytes or an unknown
    /// format version.
    pub fn from_bytes(bytes: &[u8]) -> LicenseResult<Self> {
        let credential: Self = serde_json::from_slice(bytes)
            .map_err(|e| LicenseError::Corrupt(format!("unreadable credential: {e}")))?;
        if credential.version == REVOKED_VERSION {
            return Err(LicenseError::Corrupt("credential was revoked".to_string()));
        }
        if credential.version != CACHE_VERSION {
            return Err(LicenseError::Corrupt(format!(
                "unsupported credential version {}",
                credential.version
            )));
        }
        Ok(credential)
    }
}

/// Durable storage for the cached credential.
pub trait TokenStore: Send + Sync {
    /// Reads the cached credential.
    ///
    /// Returns `Ok(None)` if nothing was ever saved.
    ///
    /// # Errors
    ///
    /// [`LicenseError::Corrupt`] if stored bytes exist but cannot be parsed,
    /// so callers can tell "never activated" apart from "damaged".
    fn load(&self) -> LicenseResult<Option<CachedCredential>>;

    /// Replaces the cached credential, all or nothing.
    fn save(&self, credential: &CachedCredential) -> LicenseResult<()>;

    /// Removes the cached credential. Clearing an empty store is a no-op.
    fn clear(&self) -> LicenseResult<()>;
}

/// File-backed store in an explicit directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    /// Creates a store rooted at `dir`. The directory is created lazily on
    /// first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates a store in the platform's local data directory.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Storage`] if the platform has no such
    /// directory.
    pub fn in_default_location() -> LicenseResult<Self> {
        default_cache_dir().map(Self::new)
    }

    /// Returns the cache file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE_NAME)
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// `<local data dir>/popwatch`.
pub fn default_cache_dir() -> LicenseResult<PathBuf> {
    dirs::data_local_dir()
        .map(|d| d.join("popwatch"))
        .ok_or_else(|| LicenseError::Storage("no local data directory on this platform".to_string()))
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> LicenseResult<Option<CachedCredential>> {
        let path = self.path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cached credential");
                return Ok(None);
            }
            Err(e) => {
                return Err(LicenseError::Storage(format!(
                    "reading {}: {e}",
                    path.display()
                )));
            }
        };

        match CachedCredential::from_bytes(&bytes) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!(path = %path.display(), "cached credential is corrupt");
                Err(e)
            }
        }
    }

    fn save(&self, credential: &CachedCredential) -> LicenseResult<()> {
        let bytes = credential.to_bytes()?;
        fs::create_dir_all(&self.dir).map_err(|e| {
            LicenseError::Storage(format!("creating {}: {e}", self.dir.display()))
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| {
            LicenseError::Storage(format!("creating temp file in {}: {e}", self.dir.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600)).map_err(|e| {
                LicenseError::Storage(format!("setting permissions on temp file: {e}"))
            })?;
        }

        temp.write_all(&bytes)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| LicenseError::Storage(format!("writing temp file: {e}")))?;

        let path = self.path();
        temp.persist(&path).map_err(|e| {
            LicenseError::Storage(format!("renaming into {}: {}", path.display(), e.error))
        })?;
        sync_dir(&self.dir);

        debug!(path = %path.display(), "saved credential");
        Ok(())
    }

    fn clear(&self) -> LicenseResult<()> {
        let path = self.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.dir);
                debug!(path = %path.display(), "cleared credential");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LicenseError::Storage(format!(
                "removing {}: {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), "directory sync failed: {e}");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// In-memory store. Holds encoded bytes so tests can damage them.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored bytes verbatim.
    pub fn put_raw(&self, bytes: impl Into<Vec<u8>>) {
        *self.lock() = Some(bytes.into());
    }

    /// Returns the stored bytes verbatim.
    #[must_use]
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        // A poisoned lock still holds whole byte buffers.
        self.bytes.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> LicenseResult<Option<CachedCredential>> {
        self.lock()
            .as_deref()
            .map(CachedCredential::from_bytes)
            .transpose()
    }

    fn save(&self, credential: &CachedCredential) -> LicenseResult<()> {
        let bytes = credential.to_bytes()?;
        *self.lock() = Some(bytes);
        Ok(())
    }

    fn clear(&self) -> LicenseResult<()> {
        *self.lock() = None;
        Ok(())
    }
}

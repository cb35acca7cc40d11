//! The license client: answers "is this run authorized?".
//!
//! One call to [`LicenseClient::authorize`] per process start. The cached
//! token is trusted offline while its signature, device binding and expiry
//! hold. The server is contacted only to activate, to renew an expired
//! token, or for the optional periodic revocation check.

use crate::clock::{Clock, SystemClock};
use crate::config::{LicenseConfig, MAX_BACKOFF};
use crate::decision::AuthorizationDecision;
use crate::device::{DeviceFingerprint, DeviceIdentity, HostIdentity};
use crate::error::{LicenseError, LicenseResult};
use crate::key::LicenseKey;
use crate::server::{LicenseServer, OfflineServer, ServerError};
use crate::signature::TokenVerifier;
use crate::store::{CachedCredential, FileTokenStore, TokenStore};
use crate::token::{LicenseToken, TokenState};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Orchestrates activation and revalidation.
pub struct LicenseClient {
    config: LicenseConfig,
    verifier: Box<dyn TokenVerifier>,
    identity: Arc<dyn DeviceIdentity>,
    store: Arc<dyn TokenStore>,
    server: Arc<dyn LicenseServer>,
    clock: Arc<dyn Clock>,
    license_key: Option<LicenseKey>,
}

impl LicenseClient {
    /// Creates a client from explicit collaborators.
    #[must_use]
    pub fn new(
        config: LicenseConfig,
        verifier: Box<dyn TokenVerifier>,
        identity: Arc<dyn DeviceIdentity>,
        store: Arc<dyn TokenStore>,
        server: Arc<dyn LicenseServer>,
    ) -> Self {
        Self {
            config,
            verifier,
            identity,
            store,
            server,
            clock: Arc::new(SystemClock),
            license_key: None,
        }
    }

    /// Wires the production collaborators described by `config`: the host
    /// fingerprint, a file store and the HTTPS server client.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] for invalid settings, or
    /// [`LicenseError::Storage`] if no cache directory can be chosen.
    pub fn from_config(config: LicenseConfig) -> LicenseResult<Self> {
        config.validate()?;
        let verifier = config
            .verification_key
            .as_ref()
            .ok_or_else(|| LicenseError::Config("verification_key is required".to_string()))?
            .to_verifier()?;
        let store = match &config.cache_dir {
            Some(dir) => FileTokenStore::new(dir),
            None => FileTokenStore::in_default_location()?,
        };
        let server = build_server(&config)?;

        Ok(Self::new(
            config,
            verifier,
            Arc::new(HostIdentity::new()),
            Arc::new(store),
            server,
        ))
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Supplies a license key used when nothing usable is cached.
    #[must_use]
    pub fn with_license_key(mut self, key: LicenseKey) -> Self {
        self.license_key = Some(key);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LicenseConfig {
        &self.config
    }

    /// Runs the authorization gate. Never fails: every outcome is a
    /// decision.
    pub async fn authorize(&self) -> AuthorizationDecision {
        let decision = self.run_authorize().await;
        info!(decision = decision.kind(), "license gate decided");
        decision
    }

    /// Activates with an operator-entered key.
    ///
    /// This is the only way out of `DeniedTampered` or `DeniedRevoked`. A
    /// successful activation replaces whatever was cached.
    pub async fn activate(&self, key: &LicenseKey) -> AuthorizationDecision {
        let decision = match self.identity.fingerprint() {
            Ok(device) => self.activate_for(&device, key).await,
            Err(e) => {
                warn!("device fingerprint unavailable: {e}");
                AuthorizationDecision::DeniedIdentityUnavailable
            }
        };
        info!(decision = decision.kind(), key = %key, "license activation decided");
        decision
    }

    /// Deletes the cached credential.
    pub fn clear(&self) -> LicenseResult<()> {
        self.store.clear()
    }

    async fn run_authorize(&self) -> AuthorizationDecision {
        let device = match self.identity.fingerprint() {
            Ok(device) => device,
            Err(e) => {
                warn!("device fingerprint unavailable: {e}");
                return AuthorizationDecision::DeniedIdentityUnavailable;
            }
        };

        match self.store.load() {
            Ok(Some(cached)) => self.check_cached(&device, &cached).await,
            Ok(None) => match &self.license_key {
                Some(key) => {
                    info!("no cached license, activating");
                    self.activate_for(&device, key).await
                }
                None => AuthorizationDecision::NotActivated,
            },
            Err(e) => {
                warn!("cached license unusable: {e}");
                match &self.license_key {
                    Some(key) => self.activate_for(&device, key).await,
                    None => AuthorizationDecision::DeniedTampered,
                }
            }
        }
    }

    async fn check_cached(
        &self,
        device: &DeviceFingerprint,
        cached: &CachedCredential,
    ) -> AuthorizationDecision {
        let token = cached.token();

        if cached.device() != token.device_fingerprint() {
            warn!("cached device id disagrees with token binding");
            return AuthorizationDecision::DeniedTampered;
        }

        let now = self.clock.now();
        match token.state(self.verifier.as_ref(), device, now) {
            TokenState::Active => {}
            TokenState::Tampered => {
                warn!(scheme = self.verifier.scheme(), "cached token signature invalid");
                return AuthorizationDecision::DeniedTampered;
            }
            TokenState::OtherDevice => {
                warn!(license_id = token.license_id(), "cached token bound to another device");
                return AuthorizationDecision::DeniedMismatchedDevice;
            }
            TokenState::Expired => {
                info!(license_id = token.license_id(), "cached token expired, revalidating");
                return self.renew_expired(device, token, now).await;
            }
        }

        if let Some(max_age) = self.config.revalidate_after() {
            if now.saturating_sub(token.issued_at_secs()) > max_age {
                debug!(license_id = token.license_id(), "cached token due for revalidation");
                return self.refresh(device, token, now).await;
            }
        }

        AuthorizationDecision::Authorized {
            until: token.expires_at_secs(),
        }
    }

    async fn renew_expired(
        &self,
        device: &DeviceFingerprint,
        token: &LicenseToken,
        now: i64,
    ) -> AuthorizationDecision {
        let license_id = token.license_id();
        let server = self.server.as_ref();
        let result = self
            .call_server("revalidate", move || server.revalidate(license_id, device))
            .await;

        match result {
            Ok(renewed) => self.accept(device, renewed, Some(license_id)),
            Err(ServerError::Revoked) => self.revoked(),
            Err(ServerError::Invalid) => {
                self.discard_cache();
                AuthorizationDecision::DeniedExpired
            }
            Err(e) => {
                let grace = self.config.offline_grace();
                let until = token.expires_at_secs().saturating_add(grace);
                if grace > 0 && now <= until {
                    warn!(until, "license server unreachable, within offline grace: {e}");
                    AuthorizationDecision::Authorized { until }
                } else {
                    warn!("license server unreachable: {e}");
                    AuthorizationDecision::DeniedNoNetwork
                }
            }
        }
    }

    async fn refresh(
        &self,
        device: &DeviceFingerprint,
        token: &LicenseToken,
        now: i64,
    ) -> AuthorizationDecision {
        let license_id = token.license_id();
        let server = self.server.as_ref();
        let cached = AuthorizationDecision::Authorized {
            until: token.expires_at_secs(),
        };
        let result = self
            .call_server("revalidate", move || server.revalidate(license_id, device))
            .await;

        match result {
            Ok(renewed) => match self.accept(device, renewed, Some(license_id)) {
                decision @ AuthorizationDecision::Authorized { .. } => decision,
                rejected => {
                    warn!(
                        rejected = rejected.kind(),
                        "renewed token rejected, keeping cached token"
                    );
                    cached
                }
            },
            Err(ServerError::Revoked) => self.revoked(),
            Err(ServerError::Invalid) => {
                self.discard_cache();
                AuthorizationDecision::DeniedExpired
            }
            Err(e) => {
                debug!(now, "periodic revalidation skipped: {e}");
                cached
            }
        }
    }

    async fn activate_for(
        &self,
        device: &DeviceFingerprint,
        key: &LicenseKey,
    ) -> AuthorizationDecision {
        let server = self.server.as_ref();
        let result = self
            .call_server("activate", move || server.activate(key, device))
            .await;

        match result {
            Ok(token) => self.accept(device, token, None),
            Err(ServerError::Invalid) => AuthorizationDecision::DeniedInvalidKey,
            Err(ServerError::Revoked) => self.revoked(),
            Err(e) => {
                warn!("activation failed: {e}");
                AuthorizationDecision::DeniedNoNetwork
            }
        }
    }

    /// Verifies a token fresh from the server and persists it.
    fn accept(
        &self,
        device: &DeviceFingerprint,
        token: LicenseToken,
        expected_license_id: Option<&str>,
    ) -> AuthorizationDecision {
        if let Some(expected) = expected_license_id {
            if token.license_id() != expected {
                warn!(expected, got = token.license_id(), "server renewed a different license");
                return AuthorizationDecision::DeniedTampered;
            }
        }
        match token.state(self.verifier.as_ref(), device, self.clock.now()) {
            TokenState::Active => {}
            TokenState::Tampered => {
                warn!("server token signature invalid");
                return AuthorizationDecision::DeniedTampered;
            }
            TokenState::OtherDevice => {
                warn!("server token bound to another device");
                return AuthorizationDecision::DeniedTampered;
            }
            TokenState::Expired => {
                warn!(license_id = token.license_id(), "server issued an expired token");
                return AuthorizationDecision::DeniedExpired;
            }
        }

        let until = token.expires_at_secs();
        let license_id = token.license_id().to_string();
        if let Err(e) = self.store.save(&CachedCredential::new(device.clone(), token)) {
            warn!("failed to cache license token: {e}");
        }
        info!(%license_id, until, "license token accepted");
        AuthorizationDecision::Authorized { until }
    }

    fn revoked(&self) -> AuthorizationDecision {
        warn!("license revoked by server");
        self.discard_cache();
        AuthorizationDecision::DeniedRevoked
    }

    /// Removes the cached credential. If it cannot be removed, overwrites it
    /// with a tombstone so no later run authorizes from it.
    fn discard_cache(&self) {
        let Err(e) = self.store.clear() else {
            return;
        };
        warn!("failed to clear license cache, overwriting it: {e}");
        if let Err(e) = self.store.save(&CachedCredential::revoked()) {
            error!("license cache could neither be cleared nor overwritten: {e}");
        }
    }

    /// Calls the server with bounded retries, all inside the network budget.
    async fn call_server<F, Fut>(
        &self,
        op: &'static str,
        mut call: F,
    ) -> Result<LicenseToken, ServerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<LicenseToken, ServerError>>,
    {
        let attempts = async {
            let mut attempt = 1;
            loop {
                match call().await {
                    Ok(token) => return Ok(token),
                    Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                        let delay = self
                            .config
                            .backoff_for(attempt)
                            .max(e.retry_after().unwrap_or_default())
                            .min(MAX_BACKOFF);
                        warn!(op, attempt, ?delay, "license server call failed, retrying: {e}");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(self.config.network_budget(), attempts).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::Unreachable(format!(
                "{op}: network budget of {}s exhausted",
                self.config.network_budget_secs
            ))),
        }
    }
}

#[cfg(feature = "online")]
fn build_server(config: &LicenseConfig) -> LicenseResult<Arc<dyn LicenseServer>> {
    if config.server_url.trim().is_empty() {
        warn!("no license server configured, running offline");
        return Ok(Arc::new(OfflineServer));
    }
    let server =
        crate::server::HttpLicenseServer::new(&config.server_url, config.request_timeout())?;
    Ok(Arc::new(server))
}

#[cfg(not(feature = "online"))]
fn build_server(_config: &LicenseConfig) -> LicenseResult<Arc<dyn LicenseServer>> {
    Ok(Arc::new(OfflineServer))
}

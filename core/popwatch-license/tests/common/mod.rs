//! Shared test helpers for license tests.

#![allow(dead_code)]

use async_trait::async_trait;
use popwatch_license::{
    CachedCredential, DeviceFingerprint, Ed25519Signer, FixedClock, FixedIdentity, LicenseClient,
    LicenseConfig, LicenseKey, LicenseServer, LicenseToken, MemoryTokenStore, ServerError,
    TokenSigner,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 2026-01-01T00:00:00Z.
pub const T0: i64 = 1_767_225_600;

/// Thirty days.
pub const VALIDITY: i64 = 30 * 24 * 60 * 60;

pub const LICENSE_ID: &str = "lic-0001";

/// Returns a deterministic Ed25519 signer from a fixed seed.
pub fn test_signer() -> Ed25519Signer {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    Ed25519Signer::from_bytes(&seed)
}

/// A signer nobody trusts.
pub fn rogue_signer() -> Ed25519Signer {
    Ed25519Signer::from_bytes(&[0xAB; 32])
}

pub fn this_machine() -> FixedIdentity {
    FixedIdentity::new(["machine:aaaa-1111", "mac:02:00:00:00:00:01"])
}

pub fn other_machine() -> FixedIdentity {
    FixedIdentity::new(["machine:bbbb-2222", "mac:02:00:00:00:00:02"])
}

pub fn fingerprint_of(identity: &FixedIdentity) -> DeviceFingerprint {
    use popwatch_license::DeviceIdentity;
    identity.fingerprint().unwrap()
}

pub fn key(raw: &str) -> LicenseKey {
    LicenseKey::parse(raw).unwrap()
}

/// Issues a token for `device` valid from `issued_at` for [`VALIDITY`].
pub fn token_for(device: &DeviceFingerprint, issued_at: i64) -> LicenseToken {
    LicenseToken::issue(
        LICENSE_ID,
        device.clone(),
        issued_at,
        issued_at + VALIDITY,
        &test_signer(),
    )
}

pub fn credential_for(device: &DeviceFingerprint, issued_at: i64) -> CachedCredential {
    CachedCredential::new(device.clone(), token_for(device, issued_at))
}

/// Config with fast retries and no grace.
pub fn test_config() -> LicenseConfig {
    LicenseConfig {
        server_url: "https://license.invalid".to_string(),
        request_timeout_secs: 5,
        max_attempts: 3,
        retry_backoff_ms: 100,
        network_budget_secs: 30,
        ..LicenseConfig::default()
    }
}

/// What the fake server does on each call.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Issue a fresh token bound to the requesting device.
    Issue,
    /// Fail every call with this error.
    Fail(ServerError),
    /// Fail this many calls as unreachable, then issue.
    FlakyThenIssue(usize),
    /// Never answer.
    Hang,
    /// Issue a token bound to some other device.
    WrongDevice,
    /// Issue a token signed by an untrusted key.
    RogueSignature,
    /// Issue a token that is already expired.
    AlreadyExpired,
    /// Issue a token for a different license ID.
    OtherLicense,
}

/// Scripted license server that signs with [`test_signer`].
pub struct FakeServer {
    clock: Arc<FixedClock>,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    seen_keys: Mutex<Vec<String>>,
}

impl FakeServer {
    pub fn new(clock: Arc<FixedClock>, behavior: Behavior) -> Self {
        Self {
            clock,
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            seen_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_keys(&self) -> Vec<String> {
        self.seen_keys.lock().unwrap().clone()
    }

    async fn respond(
        &self,
        license_id: &str,
        device: &DeviceFingerprint,
    ) -> Result<LicenseToken, ServerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        let now = popwatch_license::Clock::now(self.clock.as_ref());

        match behavior {
            Behavior::Issue => Ok(issue(
                &test_signer(),
                now,
                license_id,
                device.clone(),
                now + VALIDITY,
            )),
            Behavior::Fail(e) => Err(e),
            Behavior::FlakyThenIssue(failures) if call < failures => {
                Err(ServerError::Unreachable("connection refused".to_string()))
            }
            Behavior::FlakyThenIssue(_) => {
                Ok(issue(&test_signer(), now, license_id, device.clone(), now + VALIDITY))
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(ServerError::Unreachable("hung".to_string()))
            }
            Behavior::WrongDevice => Ok(issue(
                &test_signer(),
                now,
                license_id,
                fingerprint_of(&other_machine()),
                now + VALIDITY,
            )),
            Behavior::RogueSignature => {
                Ok(issue(&rogue_signer(), now, license_id, device.clone(), now + VALIDITY))
            }
            Behavior::AlreadyExpired => Ok(issue(
                &test_signer(),
                now - 20,
                license_id,
                device.clone(),
                now - 10,
            )),
            Behavior::OtherLicense => {
                Ok(issue(&test_signer(), now, "lic-9999", device.clone(), now + VALIDITY))
            }
        }
    }
}

#[async_trait]
impl LicenseServer for FakeServer {
    async fn activate(
        &self,
        key: &LicenseKey,
        device: &DeviceFingerprint,
    ) -> Result<LicenseToken, ServerError> {
        self.seen_keys.lock().unwrap().push(key.expose().to_string());
        self.respond(LICENSE_ID, device).await
    }

    async fn revalidate(
        &self,
        license_id: &str,
        device: &DeviceFingerprint,
    ) -> Result<LicenseToken, ServerError> {
        self.respond(license_id, device).await
    }
}

fn issue(
    signer: &dyn TokenSigner,
    now: i64,
    license_id: &str,
    device: DeviceFingerprint,
    expires_at: i64,
) -> LicenseToken {
    LicenseToken::issue(license_id, device, now, expires_at, signer)
}

/// A client wired to in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryTokenStore>,
    pub server: Arc<FakeServer>,
    pub clock: Arc<FixedClock>,
    pub config: LicenseConfig,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_config(behavior, test_config())
    }

    pub fn with_config(behavior: Behavior, config: LicenseConfig) -> Self {
        let clock = Arc::new(FixedClock::new(T0));
        Self {
            store: Arc::new(MemoryTokenStore::new()),
            server: Arc::new(FakeServer::new(clock.clone(), behavior)),
            clock,
            config,
        }
    }

    /// A client running on `identity`.
    pub fn client_on(&self, identity: FixedIdentity) -> LicenseClient {
        LicenseClient::new(
            self.config.clone(),
            Box::new(test_signer().verifier()),
            Arc::new(identity),
            self.store.clone(),
            self.server.clone(),
        )
        .with_clock(self.clock.clone())
    }

    /// A client on [`this_machine`].
    pub fn client(&self) -> LicenseClient {
        self.client_on(this_machine())
    }

    /// Seeds the store with a valid credential for [`this_machine`].
    pub fn seed(&self, issued_at: i64) -> CachedCredential {
        use popwatch_license::TokenStore;
        let credential = credential_for(&fingerprint_of(&this_machine()), issued_at);
        self.store.save(&credential).unwrap();
        credential
    }

    /// Rewrites one JSON field of the stored credential.
    pub fn tamper(&self, pointer: &str, value: serde_json::Value) {
        let raw = self.store.raw().expect("store is empty");
        let mut json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        *json.pointer_mut(pointer).expect("no such field") = value;
        self.store.put_raw(serde_json::to_vec(&json).unwrap());
    }
}

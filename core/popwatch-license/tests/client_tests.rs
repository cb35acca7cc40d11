mod common;

use common::{
    credential_for, fingerprint_of, key, other_machine, test_config, test_signer, this_machine,
    Behavior, FakeServer, Harness, LICENSE_ID, T0, VALIDITY,
};
use popwatch_license::{
    AuthorizationDecision, CachedCredential, FileTokenStore, FixedClock, FixedIdentity,
    LicenseClient, LicenseConfig, LicenseError, LicenseResult, MemoryTokenStore, OfflineServer,
    ServerError, TokenStore, CACHE_FILE_NAME,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

// ── Fresh activation ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fresh_machine_with_key_activates_and_caches() {
    let h = Harness::new(Behavior::Issue);
    let client = h.client().with_license_key(key("POP-1234-ABCD"));

    let decision = client.authorize().await;

    assert_eq!(decision, AuthorizationDecision::Authorized { until: T0 + VALIDITY });
    let cached = h.store.load().unwrap().expect("credential cached");
    assert_eq!(cached.token().issued_at_secs(), T0);
    assert_eq!(cached.device(), &fingerprint_of(&this_machine()));
    assert_eq!(h.server.seen_keys(), vec!["POP-1234-ABCD".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn fresh_machine_without_key_is_not_activated() {
    let h = Harness::new(Behavior::Issue);
    let decision = h.client().authorize().await;

    assert_eq!(decision, AuthorizationDecision::NotActivated);
    assert_eq!(h.server.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_key_is_denied_and_nothing_cached() {
    let h = Harness::new(Behavior::Fail(ServerError::Invalid));
    let decision = h.client().activate(&key("WRONG")).await;

    assert_eq!(decision, AuthorizationDecision::DeniedInvalidKey);
    assert!(h.store.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn activation_offline_is_no_network() {
    let h = Harness::new(Behavior::Fail(ServerError::Unreachable("down".into())));
    let decision = h.client().activate(&key("POP-1")).await;

    assert_eq!(decision, AuthorizationDecision::DeniedNoNetwork);
    assert_eq!(h.server.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn activation_retries_transient_failures() {
    let h = Harness::new(Behavior::FlakyThenIssue(2));
    let decision = h.client().activate(&key("POP-1")).await;

    assert!(decision.is_authorized());
    assert_eq!(h.server.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn invalid_response_is_not_retried() {
    let h = Harness::new(Behavior::Fail(ServerError::Invalid));
    let _ = h.client().activate(&key("POP-1")).await;
    assert_eq!(h.server.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_exhausts_retry_budget() {
    let h = Harness::new(Behavior::Fail(ServerError::RateLimited {
        retry_after: Some(std::time::Duration::from_secs(3600)),
    }));
    let decision = h.client().activate(&key("POP-1")).await;

    assert_eq!(decision, AuthorizationDecision::DeniedNoNetwork);
    assert_eq!(h.server.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn hanging_server_hits_network_budget() {
    let h = Harness::new(Behavior::Hang);
    let decision = h.client().activate(&key("POP-1")).await;
    assert_eq!(decision, AuthorizationDecision::DeniedNoNetwork);
}

#[tokio::test(start_paused = true)]
async fn server_token_for_other_device_is_rejected() {
    let h = Harness::new(Behavior::WrongDevice);
    let decision = h.client().activate(&key("POP-1")).await;

    assert_eq!(decision, AuthorizationDecision::DeniedTampered);
    assert!(h.store.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn server_token_with_untrusted_signature_is_rejected() {
    let h = Harness::new(Behavior::RogueSignature);
    let decision = h.client().activate(&key("POP-1")).await;

    assert_eq!(decision, AuthorizationDecision::DeniedTampered);
    assert!(h.store.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn server_token_already_expired_is_rejected() {
    let h = Harness::new(Behavior::AlreadyExpired);
    let decision = h.client().activate(&key("POP-1")).await;
    assert_eq!(decision, AuthorizationDecision::DeniedExpired);
}

#[tokio::test(start_paused = true)]
async fn identity_unavailable_is_denied() {
    let h = Harness::new(Behavior::Issue);
    let client = h
        .client_on(FixedIdentity::unavailable())
        .with_license_key(key("POP-1"));

    assert_eq!(
        client.authorize().await,
        AuthorizationDecision::DeniedIdentityUnavailable
    );
    assert_eq!(h.server.calls(), 0);
}

// ── Offline use of the cache ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn valid_cache_authorizes_offline() {
    let h = Harness::new(Behavior::Fail(ServerError::Unreachable("down".into())));
    h.seed(T0);
    h.clock.advance(VALIDITY / 2);

    let decision = h.client().authorize().await;

    assert_eq!(decision, AuthorizationDecision::Authorized { until: T0 + VALIDITY });
    assert_eq!(h.server.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cache_valid_exactly_at_expiry() {
    let h = Harness::new(Behavior::Fail(ServerError::Unreachable("down".into())));
    h.seed(T0);
    h.clock.set(T0 + VALIDITY);

    assert!(h.client().authorize().await.is_authorized());
    assert_eq!(h.server.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn copied_cache_on_other_machine_is_mismatched_device() {
    let h = Harness::new(Behavior::Fail(ServerError::Unreachable("down".into())));
    h.seed(T0);

    let decision = h.client_on(other_machine()).authorize().await;

    assert_eq!(decision, AuthorizationDecision::DeniedMismatchedDevice);
    assert_eq!(h.server.calls(), 0);
}

// ── Tampering ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn edited_expiry_is_tampered() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    h.tamper("/token/expiresAt", json!(T0 + 100 * VALIDITY));

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedTampered);
}

#[tokio::test(start_paused = true)]
async fn edited_license_id_is_tampered() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    h.tamper("/token/licenseId", json!("lic-9999"));

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedTampered);
}

#[tokio::test(start_paused = true)]
async fn rebinding_token_to_another_device_is_tampered() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    let other = fingerprint_of(&other_machine());
    h.tamper("/token/deviceFingerprint", json!(other.id()));
    h.tamper("/device", json!(other.id()));

    let decision = h.client_on(other_machine()).authorize().await;
    assert_eq!(decision, AuthorizationDecision::DeniedTampered);
}

#[tokio::test(start_paused = true)]
async fn edited_device_file_is_tampered() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    h.tamper("/device", json!(fingerprint_of(&other_machine()).id()));

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedTampered);
}

#[tokio::test(start_paused = true)]
async fn tampered_cache_never_reactivates_silently() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    h.tamper("/token/expiresAt", json!(T0 + 100 * VALIDITY));

    let client = h.client().with_license_key(key("POP-1"));
    assert_eq!(client.authorize().await, AuthorizationDecision::DeniedTampered);
    assert_eq!(h.server.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn explicit_activation_recovers_from_tampering() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    h.tamper("/token/expiresAt", json!(T0 + 100 * VALIDITY));
    let client = h.client();

    assert_eq!(client.authorize().await, AuthorizationDecision::DeniedTampered);
    assert!(client.activate(&key("POP-1")).await.is_authorized());
    assert!(client.authorize().await.is_authorized());
}

#[tokio::test(start_paused = true)]
async fn corrupt_cache_without_key_is_tampered() {
    let h = Harness::new(Behavior::Issue);
    h.store.put_raw(b"{ not json".to_vec());

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedTampered);
    assert_eq!(h.server.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn corrupt_cache_with_key_reactivates() {
    let h = Harness::new(Behavior::Issue);
    h.store.put_raw(b"\x00\x01garbage".to_vec());

    let decision = h.client().with_license_key(key("POP-1")).authorize().await;

    assert!(decision.is_authorized());
    assert!(h.store.load().unwrap().is_some());
}

// ── Expiry and renewal ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn expired_cache_offline_is_no_network() {
    let h = Harness::new(Behavior::Fail(ServerError::Unreachable("down".into())));
    h.seed(T0);
    h.clock.set(T0 + VALIDITY + 1);

    let decision = h.client().authorize().await;

    assert_eq!(decision, AuthorizationDecision::DeniedNoNetwork);
    assert_eq!(h.server.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn expired_cache_online_is_renewed() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    let renewal_time = T0 + VALIDITY + 60;
    h.clock.set(renewal_time);

    let decision = h.client().authorize().await;

    assert_eq!(
        decision,
        AuthorizationDecision::Authorized { until: renewal_time + VALIDITY }
    );
    let cached = h.store.load().unwrap().unwrap();
    assert_eq!(cached.token().issued_at_secs(), renewal_time);
    assert_eq!(cached.token().license_id(), LICENSE_ID);
}

#[tokio::test(start_paused = true)]
async fn expired_cache_rejected_by_server_is_expired() {
    let h = Harness::new(Behavior::Fail(ServerError::Invalid));
    h.seed(T0);
    h.clock.set(T0 + VALIDITY + 1);

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedExpired);
}

#[tokio::test(start_paused = true)]
async fn renewal_for_different_license_is_rejected() {
    let h = Harness::new(Behavior::OtherLicense);
    h.seed(T0);
    h.clock.set(T0 + VALIDITY + 1);

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedTampered);
}

#[tokio::test(start_paused = true)]
async fn offline_grace_covers_short_outage() {
    let config = LicenseConfig {
        offline_grace_secs: 3600,
        ..test_config()
    };
    let h = Harness::with_config(
        Behavior::Fail(ServerError::Unreachable("down".into())),
        config,
    );
    h.seed(T0);
    h.clock.set(T0 + VALIDITY + 600);

    let decision = h.client().authorize().await;
    assert_eq!(
        decision,
        AuthorizationDecision::Authorized { until: T0 + VALIDITY + 3600 }
    );
}

#[tokio::test(start_paused = true)]
async fn offline_grace_is_bounded() {
    let config = LicenseConfig {
        offline_grace_secs: 3600,
        ..test_config()
    };
    let h = Harness::with_config(
        Behavior::Fail(ServerError::Unreachable("down".into())),
        config,
    );
    h.seed(T0);
    h.clock.set(T0 + VALIDITY + 3601);

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedNoNetwork);
}

// ── Revocation ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn revoked_on_revalidation_clears_cache() {
    let h = Harness::new(Behavior::Fail(ServerError::Revoked));
    h.seed(T0);
    h.clock.set(T0 + VALIDITY + 1);

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedRevoked);
    assert!(h.store.load().unwrap().is_none());

    // Next launch, offline: nothing left to authorize from.
    h.server
        .set_behavior(Behavior::Fail(ServerError::Unreachable("down".into())));
    let next = h.client().authorize().await;
    assert!(!next.is_authorized());
    assert_eq!(next, AuthorizationDecision::NotActivated);
}

#[tokio::test(start_paused = true)]
async fn revoked_on_activation_is_revoked() {
    let h = Harness::new(Behavior::Fail(ServerError::Revoked));
    let decision = h.client().activate(&key("POP-1")).await;
    assert_eq!(decision, AuthorizationDecision::DeniedRevoked);
}

#[tokio::test(start_paused = true)]
async fn periodic_check_detects_revocation_before_expiry() {
    let config = LicenseConfig {
        revalidate_after_secs: Some(3600),
        ..test_config()
    };
    let h = Harness::with_config(Behavior::Fail(ServerError::Revoked), config);
    h.seed(T0);
    h.clock.set(T0 + 7200);

    assert_eq!(h.client().authorize().await, AuthorizationDecision::DeniedRevoked);
    assert!(h.store.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn periodic_check_offline_keeps_cached_authorization() {
    let config = LicenseConfig {
        revalidate_after_secs: Some(3600),
        ..test_config()
    };
    let h = Harness::with_config(
        Behavior::Fail(ServerError::Unreachable("down".into())),
        config,
    );
    h.seed(T0);
    h.clock.set(T0 + 7200);

    assert_eq!(
        h.client().authorize().await,
        AuthorizationDecision::Authorized { until: T0 + VALIDITY }
    );
}

#[tokio::test(start_paused = true)]
async fn periodic_check_renews_token() {
    let config = LicenseConfig {
        revalidate_after_secs: Some(3600),
        ..test_config()
    };
    let h = Harness::with_config(Behavior::Issue, config);
    h.seed(T0);
    h.clock.set(T0 + 7200);

    assert_eq!(
        h.client().authorize().await,
        AuthorizationDecision::Authorized { until: T0 + 7200 + VALIDITY }
    );
    assert_eq!(h.store.load().unwrap().unwrap().token().issued_at_secs(), T0 + 7200);
}

#[tokio::test(start_paused = true)]
async fn periodic_check_not_due_stays_offline() {
    let config = LicenseConfig {
        revalidate_after_secs: Some(3600),
        ..test_config()
    };
    let h = Harness::with_config(Behavior::Fail(ServerError::Revoked), config);
    h.seed(T0);
    h.clock.set(T0 + 60);

    assert!(h.client().authorize().await.is_authorized());
    assert_eq!(h.server.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn clear_removes_cached_credential() {
    let h = Harness::new(Behavior::Issue);
    h.seed(T0);
    let client = h.client();

    client.clear().unwrap();
    assert_eq!(client.authorize().await, AuthorizationDecision::NotActivated);
}

// ── Durable stores ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fresh_activation_writes_cache_file() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileTokenStore::new(dir.path()));
    let clock = Arc::new(FixedClock::new(T0));
    let server = Arc::new(FakeServer::new(clock.clone(), Behavior::Issue));
    let client = LicenseClient::new(
        test_config(),
        Box::new(test_signer().verifier()),
        Arc::new(this_machine()),
        store.clone(),
        server,
    )
    .with_clock(clock)
    .with_license_key(key("POP-1234-ABCD"));

    assert_eq!(
        client.authorize().await,
        AuthorizationDecision::Authorized { until: T0 + VALIDITY }
    );
    assert!(dir.path().join(CACHE_FILE_NAME).is_file());
    let cached = store.load().unwrap().expect("credential cached");
    assert_eq!(cached.device(), &fingerprint_of(&this_machine()));
}

/// A store that can be written but never emptied.
struct UndeletableStore(MemoryTokenStore);

impl TokenStore for UndeletableStore {
    fn load(&self) -> LicenseResult<Option<CachedCredential>> {
        self.0.load()
    }

    fn save(&self, credential: &CachedCredential) -> LicenseResult<()> {
        self.0.save(credential)
    }

    fn clear(&self) -> LicenseResult<()> {
        Err(LicenseError::Storage("read-only cache".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn revocation_poisons_cache_that_cannot_be_deleted() {
    let store = Arc::new(UndeletableStore(MemoryTokenStore::new()));
    store
        .save(&credential_for(&fingerprint_of(&this_machine()), T0))
        .unwrap();
    let clock = Arc::new(FixedClock::new(T0 + 3600));
    let config = LicenseConfig {
        revalidate_after_secs: Some(60),
        ..test_config()
    };
    let server = Arc::new(FakeServer::new(
        clock.clone(),
        Behavior::Fail(ServerError::Revoked),
    ));
    let online = LicenseClient::new(
        config.clone(),
        Box::new(test_signer().verifier()),
        Arc::new(this_machine()),
        store.clone(),
        server,
    )
    .with_clock(clock.clone());

    assert_eq!(online.authorize().await, AuthorizationDecision::DeniedRevoked);
    assert!(matches!(store.load(), Err(LicenseError::Corrupt(_))));

    let offline = LicenseClient::new(
        config,
        Box::new(test_signer().verifier()),
        Arc::new(this_machine()),
        store,
        Arc::new(OfflineServer),
    )
    .with_clock(clock);
    assert_eq!(offline.authorize().await, AuthorizationDecision::DeniedTampered);
}

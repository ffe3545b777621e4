//! End-to-end API-key tests: issue → validate → revoke round trips,
//! batched usage arithmetic, security analysis, and the offline fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use authkit::apikey::{
    ApiKeyOperations, ApiKeyRepository, ApiKeyStorage, CreateKeyRequest,
    InMemoryApiKeyRepository, RevocationRequest, ThreatLevel, UsageTracker,
};
use authkit::cache::{self, CacheService, InMemoryCache};
use authkit::claims::AuthenticationResult;
use authkit::config::{ApiKeyConfig, ClientConfig, Config, MonitorConfig, ResilienceConfig};
use authkit::oidc::{OidcClient, ResilientOidcClient};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Stack {
    repository: Arc<InMemoryApiKeyRepository>,
    tracker: Arc<UsageTracker>,
    operations: ApiKeyOperations,
}

fn stack() -> Stack {
    let repository = Arc::new(InMemoryApiKeyRepository::new());
    let shared: Arc<dyn CacheService> = Arc::new(InMemoryCache::default());
    let storage = Arc::new(ApiKeyStorage::new(
        repository.clone(),
        shared.clone(),
        ApiKeyConfig::default(),
    ));
    let tracker = Arc::new(UsageTracker::new(repository.clone(), MonitorConfig::default()));
    let operations = ApiKeyOperations::new(
        storage,
        shared,
        tracker.clone(),
        ApiKeyConfig::default(),
    );
    Stack {
        repository,
        tracker,
        operations,
    }
}

/// Issue → validate → revoke → validate-again, the full key lifecycle.
#[tokio::test]
async fn key_lifecycle_round_trip() {
    let stack = stack();
    let issued = stack
        .operations
        .create_key(CreateKeyRequest {
            name: "reporting job".to_string(),
            user_id: "owner-1".to_string(),
            prefix: Some("svc".to_string()),
            scopes: vec!["service".to_string()],
            permissions: vec!["reports:read".to_string()],
            ..CreateKeyRequest::default()
        })
        .await
        .unwrap();
    assert!(issued.key.starts_with("svc_"));

    let result = stack.operations.validate(&issued.key).await.unwrap();
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.user.unwrap().id, "owner-1");

    stack
        .operations
        .revoke(RevocationRequest {
            key_id: issued.record.id,
            revoked_by: "alice".to_string(),
            reason: Some("offboarding".to_string()),
            metadata: None,
        })
        .await
        .unwrap();

    let result = stack.operations.validate(&issued.key).await.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().starts_with("Credential revoked"));

    // the revocation reason landed in the row metadata
    let row = stack
        .repository
        .find_by_id(issued.record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.metadata.unwrap()["revocation_reason"], "offboarding");
    assert_eq!(row.revoked_by.as_deref(), Some("alice"));
}

/// 7 + 3 interleaved usage tracks flush into exactly two increments.
#[tokio::test]
async fn interleaved_usage_flushes_exact_counts() {
    let stack = stack();
    let k42 = stack
        .operations
        .create_key(CreateKeyRequest {
            name: "K42".to_string(),
            user_id: "u1".to_string(),
            ..CreateKeyRequest::default()
        })
        .await
        .unwrap();
    let k43 = stack
        .operations
        .create_key(CreateKeyRequest {
            name: "K43".to_string(),
            user_id: "u1".to_string(),
            ..CreateKeyRequest::default()
        })
        .await
        .unwrap();

    for i in 0..10 {
        if i % 3 == 0 && i / 3 < 3 {
            stack.tracker.track_usage(k43.record.id);
        } else {
            stack.tracker.track_usage(k42.record.id);
        }
    }
    assert_eq!(stack.tracker.pending_count(), 2);
    stack.tracker.flush().await;

    let row42 = stack.repository.find_by_id(k42.record.id).await.unwrap().unwrap();
    let row43 = stack.repository.find_by_id(k43.record.id).await.unwrap().unwrap();
    assert_eq!(row42.usage_count, 7);
    assert_eq!(row43.usage_count, 3);
}

/// Validation itself enqueues a usage update that flushes to the counter.
#[tokio::test]
async fn validation_feeds_the_usage_counter() {
    let stack = stack();
    let issued = stack
        .operations
        .create_key(CreateKeyRequest {
            name: "ci".to_string(),
            user_id: "u1".to_string(),
            ..CreateKeyRequest::default()
        })
        .await
        .unwrap();

    for _ in 0..5 {
        // cached and uncached validations both count as one use
        stack.operations.validate(&issued.key).await.unwrap();
    }
    stack.tracker.flush().await;

    let row = stack
        .repository
        .find_by_id(issued.record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.usage_count, 5);
    assert!(row.last_used_at.is_some());
}

/// An old, heavily used key grades critical with a revocation
/// recommendation.
#[tokio::test]
async fn aged_hot_key_grades_critical() {
    let stack = stack();
    let issued = stack
        .operations
        .create_key(CreateKeyRequest {
            name: "legacy".to_string(),
            user_id: "u1".to_string(),
            ..CreateKeyRequest::default()
        })
        .await
        .unwrap();

    let mut row = stack
        .repository
        .find_by_id(issued.record.id)
        .await
        .unwrap()
        .unwrap();
    row.created_at = Utc::now() - chrono::Duration::days(400);
    row.usage_count = 5000;
    stack.repository.update(row).await.unwrap();

    let analysis = stack
        .operations
        .analyze_security(issued.record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(analysis.threat_level, ThreatLevel::Critical);
    assert!(analysis.risk_score >= 4);
    assert!(
        analysis
            .recommendations
            .iter()
            .any(|r| r.contains("revoke this key immediately"))
    );
    assert!(analysis.recommendations.iter().any(|r| r.contains("rotate")));
}

/// Expired keys fail validation with the expiry kind.
#[tokio::test]
async fn expired_key_fails_with_expired() {
    let stack = stack();
    let issued = stack
        .operations
        .create_key(CreateKeyRequest {
            name: "short-lived".to_string(),
            user_id: "u1".to_string(),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(1)),
            ..CreateKeyRequest::default()
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let result = stack.operations.validate(&issued.key).await.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().starts_with("Credential expired"));
}

fn shaped_jwt() -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","kid":"k1"}"#);
    let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"user-1","exp":9999999999}"#);
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

fn resilient_stack(server_url: &str, resilience: ResilienceConfig) -> (Arc<InMemoryCache>, ResilientOidcClient) {
    let mut clients = HashMap::new();
    clients.insert(
        "frontend".to_string(),
        ClientConfig {
            client_id: "web".to_string(),
            ..ClientConfig::default()
        },
    );
    let config = Arc::new(Config {
        server_url: server_url.to_string(),
        realm: "r".to_string(),
        clients,
        ..Config::default()
    });
    let shared = Arc::new(InMemoryCache::default());
    let inner = Arc::new(OidcClient::with_cache(config, "frontend", shared.clone()).unwrap());
    (shared, ResilientOidcClient::new(inner, resilience))
}

/// After one successful validation, the wrapper keeps serving the result
/// while the identity provider is unreachable.
#[tokio::test]
async fn offline_fallback_serves_cached_validation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": format!("{}/realms/r", server.uri()),
            "authorization_endpoint": format!("{}/a", server.uri()),
            "token_endpoint": format!("{}/t", server.uri()),
            "jwks_uri": format!("{}/certs", server.uri()),
        })))
        .mount(&server)
        .await;

    let (shared, wrapper) = resilient_stack(&server.uri(), ResilienceConfig::default());
    wrapper.inner().initialize().await.unwrap();

    // seed a prior successful validation through the inner result cache
    let token = shaped_jwt();
    let sealed_key = cache::namespaced_key("token", &token);
    let success = AuthenticationResult::ok(
        authkit::UserInfo {
            id: "u1".to_string(),
            ..authkit::UserInfo::default()
        },
        None,
    );
    cache::set_sealed(shared.as_ref(), &sealed_key, &success, Duration::from_secs(300)).await;

    let first = wrapper.validate_token(&token).await.unwrap();
    assert!(first.success);

    // IdP goes away and the inner cache entry expires with it
    shared.invalidate(&sealed_key).await;
    drop(server);

    let offline = wrapper.validate_token(&token).await.unwrap();
    assert!(offline.success, "cached validation must survive the outage");
    assert!(offline.from_cache);
    assert!(wrapper.is_offline());
}

/// Unknown tokens during an outage: anonymous result when enabled,
/// propagated failure otherwise.
#[tokio::test]
async fn offline_unknown_token_depends_on_anonymous_mode() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": format!("{}/realms/r", server.uri()),
            "authorization_endpoint": format!("{}/a", server.uri()),
            "token_endpoint": format!("{}/t", server.uri()),
            "jwks_uri": format!("{}/certs", server.uri()),
        })))
        .mount(&server)
        .await;

    let (_, anonymous_wrapper) = resilient_stack(
        &server.uri(),
        ResilienceConfig {
            anonymous_mode: true,
            ..ResilienceConfig::default()
        },
    );
    anonymous_wrapper.inner().initialize().await.unwrap();

    let (_, strict_wrapper) = resilient_stack(&server.uri(), ResilienceConfig::default());
    strict_wrapper.inner().initialize().await.unwrap();

    drop(server);

    let token = shaped_jwt();
    let result = anonymous_wrapper.validate_token(&token).await.unwrap();
    assert!(result.success);
    let user = result.user.unwrap();
    assert_eq!(user.id, "anonymous");
    assert_eq!(user.permissions, vec!["read:public"]);

    assert!(strict_wrapper.validate_token(&token).await.is_err());
}

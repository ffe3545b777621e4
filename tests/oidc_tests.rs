//! End-to-end OIDC client tests against a mocked identity provider.
//!
//! Covers discovery (including the issuer-mismatch warning path), the
//! token-endpoint grants, introspection semantics, URL construction, and
//! the validation result cache.

use std::collections::HashMap;
use std::sync::Arc;

use authkit::cache::{self, InMemoryCache};
use authkit::claims::AuthenticationResult;
use authkit::config::{ClientConfig, Config};
use authkit::oidc::{ClientState, OidcClient};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn discovery_body(base: &str) -> serde_json::Value {
    json!({
        "issuer": format!("{base}/realms/r"),
        "authorization_endpoint": format!("{base}/realms/r/protocol/openid-connect/auth"),
        "token_endpoint": format!("{base}/realms/r/protocol/openid-connect/token"),
        "jwks_uri": format!("{base}/realms/r/protocol/openid-connect/certs"),
        "userinfo_endpoint": format!("{base}/realms/r/protocol/openid-connect/userinfo"),
        "introspection_endpoint": format!("{base}/realms/r/protocol/openid-connect/token/introspect"),
        "end_session_endpoint": format!("{base}/realms/r/protocol/openid-connect/logout"),
    })
}

async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
        .mount(server)
        .await;
}

fn config_for(server: &MockServer, secret: Option<&str>) -> Arc<Config> {
    let mut clients = HashMap::new();
    clients.insert(
        "service".to_string(),
        ClientConfig {
            client_id: "svc".to_string(),
            client_secret: secret.map(String::from),
            redirect_uri: Some("https://app.test/auth/callback".to_string()),
            scopes: vec!["openid".to_string(), "profile".to_string()],
        },
    );
    Arc::new(Config {
        server_url: server.uri(),
        realm: "r".to_string(),
        clients,
        ..Config::default()
    })
}

/// Initialization succeeds, is idempotent, and moves the state machine.
#[tokio::test]
async fn initialize_loads_discovery_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
        .expect(1)
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, Some("s3cr3t")), "service").unwrap();
    assert_eq!(client.state(), ClientState::Pending);

    client.initialize().await.unwrap();
    assert_eq!(client.state(), ClientState::Initialized);

    // second call is a no-op; the mock's expect(1) verifies it on drop
    client.initialize().await.unwrap();
}

/// A discovery document missing required fields is a configuration error.
#[tokio::test]
async fn initialize_rejects_incomplete_discovery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": format!("{}/realms/r", server.uri()),
            "authorization_endpoint": "x",
            "token_endpoint": "y"
        })))
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, None), "service").unwrap();
    let err = client.initialize().await.unwrap_err();
    assert!(matches!(err, authkit::Error::Misconfigured(_)), "got {err}");
    assert_eq!(client.state(), ClientState::Failed);

    // failed is terminal
    assert!(client.initialize().await.is_err());
}

/// An issuer that differs from the configured realm URL warns but does not
/// fail initialization.
#[tokio::test]
async fn issuer_mismatch_is_not_fatal() {
    let server = MockServer::start().await;
    let mut body = discovery_body(&server.uri());
    body["issuer"] = json!("https://other.example/realms/r");
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, None), "service").unwrap();
    client.initialize().await.unwrap();
    assert_eq!(client.state(), ClientState::Initialized);
}

/// Client-credentials grant posts the secret and parses the response.
#[tokio::test]
async fn client_credentials_grant_round_trips() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_secret=s3cr3t"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "admin-token",
            "token_type": "Bearer",
            "expires_in": 300,
            "scope": "manage-users view-users"
        })))
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, Some("s3cr3t")), "service").unwrap();
    let response = client.authenticate_client_credentials(None).await.unwrap();
    assert_eq!(response.access_token, "admin-token");
    assert_eq!(response.scopes(), vec!["manage-users", "view-users"]);
}

/// A public client cannot use the client-credentials grant.
#[tokio::test]
async fn client_credentials_requires_secret() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let client = OidcClient::new(config_for(&server, None), "service").unwrap();
    let result = client.authenticate_client_credentials(None).await;
    assert!(matches!(result, Err(authkit::Error::Misconfigured(_))));
}

/// Authorization-code exchange carries the PKCE verifier.
#[tokio::test]
async fn code_exchange_sends_pkce_verifier() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code_verifier=the-verifier"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "t", "expires_in": 60
        })))
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, Some("s3cr3t")), "service").unwrap();
    let response = client
        .exchange_authorization_code("the-code", Some("the-verifier"))
        .await
        .unwrap();
    assert_eq!(response.access_token, "t");
}

/// The password grant returns tokens plus a generated session id.
#[tokio::test]
async fn password_grant_generates_session_id() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token"))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("username=alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "t", "refresh_token": "rt", "expires_in": 60
        })))
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, Some("s3cr3t")), "service").unwrap();
    let login = client
        .authenticate_with_password("alice", "hunter2", None)
        .await
        .unwrap();
    assert_eq!(login.tokens.refresh_token.as_deref(), Some("rt"));
    assert!(!login.session_id.is_empty());
}

/// An upstream 401 surfaces as an upstream error, not a panic or a parse
/// failure.
#[tokio::test]
async fn token_endpoint_error_is_surfaced() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_client"
        })))
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, Some("wrong")), "service").unwrap();
    let result = client.refresh_token("rt").await;
    assert!(matches!(result, Err(authkit::Error::Upstream(_))));
}

/// Introspection treats `active: false` as a failed result.
#[tokio::test]
async fn introspection_inactive_token_fails() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token/introspect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": false})))
        .expect(1)
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, Some("s3cr3t")), "service").unwrap();
    let result = client.introspect_token("dead-token").await.unwrap();
    assert!(!result.success);

    // the negative result is cached; the expect(1) verifies no second call
    let cached = client.introspect_token("dead-token").await.unwrap();
    assert!(!cached.success);
    assert!(cached.from_cache);
}

/// Introspection builds a user from an active response.
#[tokio::test]
async fn introspection_active_token_builds_user() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token/introspect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "active": true,
            "sub": "u1",
            "username": "alice",
            "scope": "openid files:read",
            "realm_access": {"roles": ["user"]}
        })))
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, Some("s3cr3t")), "service").unwrap();
    let result = client.introspect_token("live-token").await.unwrap();
    assert!(result.success);
    let user = result.user.unwrap();
    assert_eq!(user.id, "u1");
    assert_eq!(user.roles, vec!["realm:user"]);
    assert!(user.permissions.contains(&"files:read".to_string()));
}

/// Userinfo responses are cached.
#[tokio::test]
async fn userinfo_is_cached() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("GET"))
        .and(path("/realms/r/protocol/openid-connect/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "u1", "preferred_username": "alice", "email": "a@b.c"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OidcClient::new(config_for(&server, None), "service").unwrap();
    let first = client.get_user_info("access-token").await.unwrap();
    let second = client.get_user_info("access-token").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.username, "alice");
}

/// Authorization URL carries response type, PKCE, and merged scopes.
#[tokio::test]
async fn authorization_url_is_well_formed() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let client = OidcClient::new(config_for(&server, None), "service").unwrap();
    let url = client
        .get_authorization_url("st4te", "n0nce", Some("challenge123"), None)
        .await
        .unwrap();

    assert!(url.contains("response_type=code"));
    assert!(url.contains("client_id=svc"));
    assert!(url.contains("state=st4te"));
    assert!(url.contains("nonce=n0nce"));
    assert!(url.contains("code_challenge=challenge123"));
    assert!(url.contains("code_challenge_method=S256"));
    assert!(url.contains("scope=openid+profile"));
}

/// Logout URL targets the end-session endpoint.
#[tokio::test]
async fn logout_url_uses_end_session_endpoint() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let client = OidcClient::new(config_for(&server, None), "service").unwrap();
    let url = client
        .get_logout_url(Some("the-id-token"), Some("https://app.test/"))
        .await
        .unwrap();
    assert!(url.contains("/protocol/openid-connect/logout"));
    assert!(url.contains("id_token_hint=the-id-token"));
    assert!(url.contains("post_logout_redirect_uri="));
}

/// A shaped token with a pre-sealed cache entry is served from cache with
/// the hit observable on the client's counter.
#[tokio::test]
async fn validation_cache_hit_skips_signature_work() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let shared: Arc<InMemoryCache> = Arc::new(InMemoryCache::default());
    let client =
        OidcClient::with_cache(config_for(&server, None), "service", shared.clone()).unwrap();
    client.initialize().await.unwrap();

    let token = "aaaa.bbbb.cccc";
    let sealed_key = cache::namespaced_key("token", token);
    let result = AuthenticationResult::ok(
        authkit::UserInfo {
            id: "u1".to_string(),
            ..authkit::UserInfo::default()
        },
        None,
    );
    cache::set_sealed(
        shared.as_ref(),
        &sealed_key,
        &result,
        std::time::Duration::from_secs(60),
    )
    .await;

    let validated = client.validate_token(token).await.unwrap();
    assert!(validated.success);
    assert!(validated.from_cache);
    assert_eq!(client.cache_hit_count(), 1);
}

/// A tampered cache entry is a miss, never a forged success.
#[tokio::test]
async fn tampered_validation_cache_entry_is_ignored() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    // empty JWKS: the fallthrough validation will fail on unknown kid
    Mock::given(method("GET"))
        .and(path("/realms/r/protocol/openid-connect/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
        .mount(&server)
        .await;

    let shared: Arc<InMemoryCache> = Arc::new(InMemoryCache::default());
    let client =
        OidcClient::with_cache(config_for(&server, None), "service", shared.clone()).unwrap();
    client.initialize().await.unwrap();

    // a forged "success" without a valid envelope checksum
    let token = "aaaa.bbbb.cccc";
    use authkit::cache::CacheService as _;
    shared
        .set(
            &cache::namespaced_key("token", token),
            json!({"data": {"success": true}, "timestamp": 1, "checksum": "forged"}),
            std::time::Duration::from_secs(60),
        )
        .await;

    let validated = client.validate_token(token).await.unwrap();
    assert!(!validated.success, "forged cache entry must not authenticate");
}

/// Dispose clears state so the client can be re-initialized.
#[tokio::test]
async fn dispose_resets_lifecycle() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let client = OidcClient::new(config_for(&server, None), "service").unwrap();
    client.initialize().await.unwrap();
    client.dispose();
    assert_eq!(client.state(), ClientState::Pending);
    assert_eq!(client.validation_count(), 0);

    client.initialize().await.unwrap();
    assert_eq!(client.state(), ClientState::Initialized);
}

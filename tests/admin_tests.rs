//! Admin surface tests: token provider caching, typed admin REST calls,
//! and user-service orchestration against a mocked identity provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use authkit::admin::{AdminApiClient, AdminTokenProvider, KeycloakUser, NewUser, UserService};
use authkit::config::{AdminConfig, ClientConfig, Config};
use authkit::oidc::OidcClient;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn discovery_body(base: &str) -> serde_json::Value {
    json!({
        "issuer": format!("{base}/realms/r"),
        "authorization_endpoint": format!("{base}/realms/r/protocol/openid-connect/auth"),
        "token_endpoint": format!("{base}/realms/r/protocol/openid-connect/token"),
        "jwks_uri": format!("{base}/realms/r/protocol/openid-connect/certs"),
    })
}

async fn mount_idp(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "admin-token",
            "expires_in": 300
        })))
        .mount(server)
        .await;
}

fn admin_stack(server: &MockServer) -> (Arc<AdminTokenProvider>, Arc<AdminApiClient>) {
    let mut clients = HashMap::new();
    clients.insert(
        "admin".to_string(),
        ClientConfig {
            client_id: "admin-cli".to_string(),
            client_secret: Some("s3cr3t".to_string()),
            ..ClientConfig::default()
        },
    );
    let config = Arc::new(Config {
        server_url: server.uri(),
        realm: "r".to_string(),
        clients,
        ..Config::default()
    });
    let oidc = Arc::new(OidcClient::new(config, "admin").unwrap());
    let tokens = Arc::new(AdminTokenProvider::new(oidc.clone(), AdminConfig::default()));
    let admin = Arc::new(
        AdminApiClient::new(oidc, tokens.clone(), "r", Duration::from_secs(10)).unwrap(),
    );
    (tokens, admin)
}

/// Two admin calls share one token grant (the provider caches it).
#[tokio::test]
async fn admin_token_is_cached_across_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "admin-token",
            "expires_in": 300
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/r/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let (_tokens, admin) = admin_stack(&server);
    admin.search_users("alice", 10).await.unwrap();
    admin.search_users("bob", 10).await.unwrap();
}

/// Concurrent token requests share a single in-flight refresh.
#[tokio::test]
async fn admin_token_refresh_is_single_flight() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realms/r/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/realms/r/protocol/openid-connect/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "admin-token", "expires_in": 300}))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (tokens, _admin) = admin_stack(&server);
    let (a, b, c) = tokio::join!(
        tokens.valid_token(),
        tokens.valid_token(),
        tokens.valid_token()
    );
    assert_eq!(a.unwrap(), "admin-token");
    assert_eq!(b.unwrap(), "admin-token");
    assert_eq!(c.unwrap(), "admin-token");
}

/// Creating a user parses the id out of the Location header.
#[tokio::test]
async fn create_user_parses_location_header() {
    let server = MockServer::start().await;
    mount_idp(&server).await;
    Mock::given(method("POST"))
        .and(path("/admin/realms/r/users"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", "/admin/realms/r/users/new-user-id"),
        )
        .mount(&server)
        .await;

    let (_, admin) = admin_stack(&server);
    let user = KeycloakUser {
        username: "alice".to_string(),
        enabled: true,
        ..KeycloakUser::default()
    };
    let id = admin.create_user(&user).await.unwrap();
    assert_eq!(id, "new-user-id");
}

/// A missing user maps to None, and deleting a missing user succeeds.
#[tokio::test]
async fn missing_users_follow_admin_semantics() {
    let server = MockServer::start().await;
    mount_idp(&server).await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/r/users/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/admin/realms/r/users/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (_, admin) = admin_stack(&server);
    assert!(admin.get_user_by_id("ghost").await.unwrap().is_none());
    admin.delete_user("ghost").await.unwrap();
}

/// The user service orchestrates create + password + role assignment and
/// returns the normalized user.
#[tokio::test]
async fn user_service_creates_and_decorates_user() {
    let server = MockServer::start().await;
    mount_idp(&server).await;
    Mock::given(method("POST"))
        .and(path("/admin/realms/r/users"))
        .respond_with(
            ResponseTemplate::new(201).insert_header("Location", "/admin/realms/r/users/u-77"),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/admin/realms/r/users/u-77/reset-password"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/r/roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "role-1", "name": "operator"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/admin/realms/r/users/u-77/role-mappings/realm"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/r/users/u-77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "u-77",
            "username": "alice",
            "email": "alice@example.com",
            "firstName": "Alice",
            "lastName": "Anders",
            "enabled": true,
            "emailVerified": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/r/users/u-77/role-mappings/realm"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "role-1", "name": "operator"}
        ])))
        .mount(&server)
        .await;

    let (_, admin) = admin_stack(&server);
    let service = UserService::new(admin);
    let user = service
        .create_user(&NewUser {
            username: "alice".to_string(),
            email: Some("alice@example.com".to_string()),
            name: Some("Alice Anders".to_string()),
            password: Some("initial-pw".to_string()),
            temporary_password: true,
            realm_roles: vec!["operator".to_string()],
        })
        .await
        .unwrap();

    assert_eq!(user.id, "u-77");
    assert_eq!(user.username, "alice");
    assert_eq!(user.name, "Alice Anders");
    assert_eq!(user.roles, vec!["realm:operator"]);
}

/// Client-role assignment resolves the client's internal id first.
#[tokio::test]
async fn client_role_assignment_resolves_internal_id() {
    let server = MockServer::start().await;
    mount_idp(&server).await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/r/clients"))
        .and(query_param("clientId", "svc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "internal-9", "clientId": "svc"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/r/clients/internal-9/roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "cr-1", "name": "reader", "clientRole": true}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/admin/realms/r/users/u-1/role-mappings/clients/internal-9"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (_, admin) = admin_stack(&server);
    let service = UserService::new(admin);
    service
        .assign_client_roles("u-1", "svc", &["reader".to_string()])
        .await
        .unwrap();
}

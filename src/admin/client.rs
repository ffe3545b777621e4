//! Admin API client — typed calls against the Keycloak admin REST surface.
//!
//! Every call acquires a bearer token from the [`AdminTokenProvider`]. The
//! base URL is `<issuer minus realm suffix>/admin/realms/<realm>`, computed
//! lazily once the discovery document is available and cached thereafter.

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::token::AdminTokenProvider;
use crate::oidc::OidcClient;
use crate::oidc::discovery::classify_reqwest;
use crate::{Error, Result};

/// Keycloak user representation (admin REST wire format).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakUser {
    /// User id (absent on create)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Username
    pub username: String,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// First name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Last name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Account enabled flag
    #[serde(default)]
    pub enabled: bool,
    /// Email verified flag
    #[serde(default)]
    pub email_verified: bool,
    /// Free-form attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
}

/// Keycloak role representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRepresentation {
    /// Role id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Role name
    pub name: String,
    /// Whether this is a client role
    #[serde(default)]
    pub client_role: bool,
}

/// Keycloak client representation (the subset needed for role lookups).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRepresentation {
    /// Internal UUID of the client
    pub id: String,
    /// OAuth2 client id
    pub client_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialRepresentation<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a str,
    temporary: bool,
}

/// Typed wrapper over the IdP admin REST surface.
pub struct AdminApiClient {
    oidc: Arc<OidcClient>,
    tokens: Arc<AdminTokenProvider>,
    http: reqwest::Client,
    realm: String,
    base_url: RwLock<Option<String>>,
}

impl AdminApiClient {
    /// Create an admin client over `oidc` and its token provider.
    pub fn new(
        oidc: Arc<OidcClient>,
        tokens: Arc<AdminTokenProvider>,
        realm: &str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Misconfigured(format!("http client build failed: {e}")))?;
        Ok(Self {
            oidc,
            tokens,
            http,
            realm: realm.to_string(),
            base_url: RwLock::new(None),
        })
    }

    /// Admin base URL, derived from the discovered issuer on first use.
    async fn base_url(&self) -> Result<String> {
        if let Some(url) = self.base_url.read().clone() {
            return Ok(url);
        }

        let document = self.oidc.discovery_document().await?;
        let realm_suffix = format!("/realms/{}", self.realm);
        let server = document
            .issuer
            .trim_end_matches('/')
            .strip_suffix(&realm_suffix)
            .unwrap_or_else(|| document.issuer.trim_end_matches('/'))
            .to_string();
        let url = format!("{server}/admin/realms/{}", self.realm);
        *self.base_url.write() = Some(url.clone());
        Ok(url)
    }

    async fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let base = self.base_url().await?;
        let token = self.tokens.valid_token().await?;
        Ok(self
            .http
            .request(method, format!("{base}{path}"))
            .bearer_auth(token))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            // Token may have been revoked server-side; force a refresh next call.
            self.tokens.invalidate();
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Upstream(format!(
            "admin API returned HTTP {status}: {}",
            body.chars().take(200).collect::<String>()
        )))
    }

    /// Search users by username/email substring.
    pub async fn search_users(&self, query: &str, max: u32) -> Result<Vec<KeycloakUser>> {
        let builder = self
            .request(Method::GET, "/users")
            .await?
            .query(&[("search", query), ("max", &max.to_string())]);
        self.send(builder).await?.json().await.map_err(Error::from)
    }

    /// Fetch a user by id. 404 maps to `None`.
    pub async fn get_user_by_id(&self, user_id: &str) -> Result<Option<KeycloakUser>> {
        let builder = self.request(Method::GET, &format!("/users/{user_id}")).await?;
        let response = builder.send().await.map_err(classify_reqwest)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "admin API returned HTTP {}",
                response.status()
            )));
        }
        response.json().await.map(Some).map_err(Error::from)
    }

    /// Create a user; returns the new user's id parsed from the `Location`
    /// response header (last path segment).
    pub async fn create_user(&self, user: &KeycloakUser) -> Result<String> {
        let builder = self.request(Method::POST, "/users").await?.json(user);
        let response = self.send(builder).await?;
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::Upstream("user create response carries no Location header".to_string())
            })?;
        location
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .map(String::from)
            .ok_or_else(|| Error::Upstream(format!("unparseable Location header: {location}")))
    }

    /// Update a user in place.
    pub async fn update_user(&self, user_id: &str, user: &KeycloakUser) -> Result<()> {
        let builder = self
            .request(Method::PUT, &format!("/users/{user_id}"))
            .await?
            .json(user);
        self.send(builder).await.map(|_| ())
    }

    /// Delete a user. A 404 is treated as success with a warning.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, &format!("/users/{user_id}")).await?;
        let response = builder.send().await.map_err(classify_reqwest)?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!(user_id = %user_id, "delete of nonexistent user treated as success");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "admin API returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Set a user's password.
    pub async fn reset_password(&self, user_id: &str, password: &str, temporary: bool) -> Result<()> {
        let credential = CredentialRepresentation {
            kind: "password",
            value: password,
            temporary,
        };
        let builder = self
            .request(Method::PUT, &format!("/users/{user_id}/reset-password"))
            .await?
            .json(&credential);
        self.send(builder).await.map(|_| ())
    }

    /// All realm roles.
    pub async fn get_realm_roles(&self) -> Result<Vec<RoleRepresentation>> {
        let builder = self.request(Method::GET, "/roles").await?;
        self.send(builder).await?.json().await.map_err(Error::from)
    }

    /// Realm roles mapped to a user.
    pub async fn get_user_realm_roles(&self, user_id: &str) -> Result<Vec<RoleRepresentation>> {
        let builder = self
            .request(Method::GET, &format!("/users/{user_id}/role-mappings/realm"))
            .await?;
        self.send(builder).await?.json().await.map_err(Error::from)
    }

    /// Assign realm roles to a user.
    pub async fn assign_realm_roles(
        &self,
        user_id: &str,
        roles: &[RoleRepresentation],
    ) -> Result<()> {
        let builder = self
            .request(Method::POST, &format!("/users/{user_id}/role-mappings/realm"))
            .await?
            .json(roles);
        self.send(builder).await.map(|_| ())
    }

    /// Remove realm roles from a user.
    pub async fn remove_realm_roles(
        &self,
        user_id: &str,
        roles: &[RoleRepresentation],
    ) -> Result<()> {
        let builder = self
            .request(Method::DELETE, &format!("/users/{user_id}/role-mappings/realm"))
            .await?
            .json(roles);
        self.send(builder).await.map(|_| ())
    }

    /// Resolve an OAuth2 `client_id` to the client's internal UUID.
    pub async fn get_client_internal_id(&self, client_id: &str) -> Result<Option<String>> {
        let builder = self
            .request(Method::GET, "/clients")
            .await?
            .query(&[("clientId", client_id)]);
        let clients: Vec<ClientRepresentation> =
            self.send(builder).await?.json().await.map_err(Error::from)?;
        Ok(clients
            .into_iter()
            .find(|c| c.client_id == client_id)
            .map(|c| c.id))
    }

    /// All roles defined on a client (by internal UUID).
    pub async fn get_client_roles(&self, internal_id: &str) -> Result<Vec<RoleRepresentation>> {
        let builder = self
            .request(Method::GET, &format!("/clients/{internal_id}/roles"))
            .await?;
        self.send(builder).await?.json().await.map_err(Error::from)
    }

    /// Client roles mapped to a user.
    pub async fn get_user_client_roles(
        &self,
        user_id: &str,
        internal_id: &str,
    ) -> Result<Vec<RoleRepresentation>> {
        let builder = self
            .request(
                Method::GET,
                &format!("/users/{user_id}/role-mappings/clients/{internal_id}"),
            )
            .await?;
        self.send(builder).await?.json().await.map_err(Error::from)
    }

    /// Assign client roles to a user.
    pub async fn assign_client_roles(
        &self,
        user_id: &str,
        internal_id: &str,
        roles: &[RoleRepresentation],
    ) -> Result<()> {
        let builder = self
            .request(
                Method::POST,
                &format!("/users/{user_id}/role-mappings/clients/{internal_id}"),
            )
            .await?
            .json(roles);
        self.send(builder).await.map(|_| ())
    }

    /// Remove client roles from a user.
    pub async fn remove_client_roles(
        &self,
        user_id: &str,
        internal_id: &str,
        roles: &[RoleRepresentation],
    ) -> Result<()> {
        let builder = self
            .request(
                Method::DELETE,
                &format!("/users/{user_id}/role-mappings/clients/{internal_id}"),
            )
            .await?
            .json(roles);
        self.send(builder).await.map(|_| ())
    }

    /// Realm this client administers.
    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }
}

//! OIDC client — grant flows, local JWT validation, introspection.
//!
//! # Validation flow
//!
//! 1. Shape check: length bounds and three base64url segments.
//! 2. Result-cache lookup by token hash (integrity-sealed entries).
//! 3. Signature verification against the realm JWKS with audience,
//!    optional issuer, and clock-skew checks.
//! 4. Replay check on `(jti, iat)`.
//! 5. Claims → normalized [`UserInfo`]; result cached until token expiry.
//!
//! # Lifecycle
//!
//! `Pending → Initialized` on the first successful discovery fetch,
//! `Pending → Failed` on the first failed one. `Failed` is terminal — the
//! owner must construct a fresh client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, Validation};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use telemetry_metrics::counter;
use tracing::{debug, info, warn};
use url::Url;

use super::discovery::{DiscoveryCache, DiscoveryDocument, classify_reqwest};
use super::jwks::JwksResolver;
use super::replay::ReplayCache;
use crate::cache::{CacheService, InMemoryCache, get_sealed, namespaced_key, set_sealed};
use crate::claims::{AuthenticationResult, UserInfo, user_info_from_claims, user_info_from_introspection};
use crate::config::{ClientConfig, Config};
use crate::error::sanitize_message;
use crate::{Error, Result};

/// Response from any token-endpoint grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Access-token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,

    /// Refresh-token lifetime in seconds
    #[serde(default)]
    pub refresh_expires_in: Option<u64>,

    /// Refresh token (optional)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// OIDC ID token (optional)
    #[serde(default)]
    pub id_token: Option<String>,

    /// Space-delimited granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Absolute expiry derived from `expires_in` at call time.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64))
    }

    /// Granted scopes as a list.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect()
    }
}

/// Tokens plus the generated session identifier from a password grant.
#[derive(Debug, Clone)]
pub struct PasswordLogin {
    /// Token response from the IdP
    pub tokens: TokenResponse,
    /// Random session identifier generated for the caller
    pub session_id: String,
}

/// Client lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Discovery not yet attempted
    Pending,
    /// Discovery loaded, client operational
    Initialized,
    /// First discovery fetch failed; terminal
    Failed,
}

/// OIDC / OAuth2 client for one configured audience.
pub struct OidcClient {
    config: Arc<Config>,
    client: ClientConfig,
    audience: String,
    http: reqwest::Client,
    discovery: DiscoveryCache,
    jwks: RwLock<Option<Arc<JwksResolver>>>,
    replay: ReplayCache,
    result_cache: Arc<dyn CacheService>,
    state: RwLock<ClientState>,
    validations: AtomicU64,
    cache_hits: AtomicU64,
}

impl OidcClient {
    /// Create a client for `audience`, using a private in-memory result cache.
    pub fn new(config: Arc<Config>, audience: &str) -> Result<Self> {
        let cache = Arc::new(InMemoryCache::new(
            config.validation.max_cache_entries,
            config.validation.cleanup_threshold,
        ));
        Self::with_cache(config, audience, cache)
    }

    /// Create a client for `audience` with an injected result cache.
    pub fn with_cache(
        config: Arc<Config>,
        audience: &str,
        result_cache: Arc<dyn CacheService>,
    ) -> Result<Self> {
        let client = config
            .clients
            .get(audience)
            .cloned()
            .ok_or_else(|| Error::Misconfigured(format!("no client configured for '{audience}'")))?;

        let http = reqwest::Client::builder()
            .timeout(config.http.timeout())
            .build()
            .map_err(|e| Error::Misconfigured(format!("http client build failed: {e}")))?;

        let discovery = DiscoveryCache::new(Duration::from_secs(config.discovery.ttl_secs));

        Ok(Self {
            config,
            client,
            audience: audience.to_string(),
            http,
            discovery,
            jwks: RwLock::new(None),
            replay: ReplayCache::new(),
            result_cache,
            state: RwLock::new(ClientState::Pending),
            validations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    /// Audience this client serves.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// OAuth2 client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Fetch and cache the discovery document; construct the JWKS resolver.
    ///
    /// Idempotent after the first success. A failed first fetch moves the
    /// client to [`ClientState::Failed`], which is terminal.
    pub async fn initialize(&self) -> Result<()> {
        match self.state() {
            ClientState::Initialized => return Ok(()),
            ClientState::Failed => {
                return Err(Error::Misconfigured(
                    "client previously failed initialization; construct a new instance".to_string(),
                ));
            }
            ClientState::Pending => {}
        }

        let document = match self
            .discovery
            .get_or_fetch(&self.http, &self.config.server_url, &self.config.realm)
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                *self.state.write() = ClientState::Failed;
                return Err(e);
            }
        };

        let resolver = Arc::new(JwksResolver::new(
            self.http.clone(),
            document.jwks_uri.clone(),
            Duration::from_secs(self.config.discovery.jwks_cooldown_secs),
        ));
        *self.jwks.write() = Some(resolver);
        *self.state.write() = ClientState::Initialized;
        info!(audience = %self.audience, issuer = %document.issuer, "OIDC client initialized");
        Ok(())
    }

    async fn document(&self) -> Result<Arc<DiscoveryDocument>> {
        self.initialize().await?;
        self.discovery
            .get_or_fetch(&self.http, &self.config.server_url, &self.config.realm)
            .await
    }

    /// The cached discovery document, initializing the client if needed.
    pub async fn discovery_document(&self) -> Result<Arc<DiscoveryDocument>> {
        self.document().await
    }

    fn jwks_resolver(&self) -> Result<Arc<JwksResolver>> {
        self.jwks
            .read()
            .clone()
            .ok_or_else(|| Error::Misconfigured("client not initialized".to_string()))
    }

    fn secret(&self) -> Result<&str> {
        self.client
            .client_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::Misconfigured(format!(
                    "client '{}' has no secret; confidential grant unavailable",
                    self.audience
                ))
            })
    }

    async fn post_token_form(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "token endpoint returned HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("token response is not valid JSON: {e}")))
    }

    /// Client-credentials grant.
    pub async fn authenticate_client_credentials(
        &self,
        scopes: Option<&[String]>,
    ) -> Result<TokenResponse> {
        let document = self.document().await?;
        let secret = self.secret()?;

        let scope = scopes.map_or_else(|| self.client.scopes.join(" "), |s| s.join(" "));

        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client.client_id.as_str()),
            ("client_secret", secret),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }

        self.post_token_form(&document.token_endpoint, &params).await
    }

    /// Authorization-code exchange, with optional PKCE verifier.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse> {
        let document = self.document().await?;
        let redirect_uri = self.client.redirect_uri.as_deref().ok_or_else(|| {
            Error::Misconfigured(format!("client '{}' has no redirect URI", self.audience))
        })?;

        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("client_id", self.client.client_id.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(secret) = self.client.client_secret.as_deref().filter(|s| !s.is_empty()) {
            params.push(("client_secret", secret));
        }
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }

        self.post_token_form(&document.token_endpoint, &params).await
    }

    /// Refresh-token grant.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let document = self.document().await?;

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.client.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = self.client.client_secret.as_deref().filter(|s| !s.is_empty()) {
            params.push(("client_secret", secret));
        }

        self.post_token_form(&document.token_endpoint, &params).await
    }

    /// Resource-owner password grant. Also generates a random session id
    /// for the caller's session bookkeeping.
    pub async fn authenticate_with_password(
        &self,
        username: &str,
        password: &str,
        client_id: Option<&str>,
    ) -> Result<PasswordLogin> {
        let document = self.document().await?;
        let effective_client = client_id.unwrap_or(self.client.client_id.as_str());

        let mut params = vec![
            ("grant_type", "password"),
            ("client_id", effective_client),
            ("username", username),
            ("password", password),
        ];
        if let Some(secret) = self.client.client_secret.as_deref().filter(|s| !s.is_empty()) {
            params.push(("client_secret", secret));
        }
        let scope = self.client.scopes.join(" ");
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }

        let tokens = self.post_token_form(&document.token_endpoint, &params).await?;

        let mut session_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut session_bytes);
        Ok(PasswordLogin {
            tokens,
            session_id: URL_SAFE_NO_PAD.encode(session_bytes),
        })
    }

    /// Validate a JWT locally against the realm JWKS.
    ///
    /// Credential problems (malformed, expired, replayed, bad signature)
    /// come back as a failed [`AuthenticationResult`]; infrastructure
    /// problems (IdP unreachable, JWKS fetch failure) come back as `Err`.
    pub async fn validate_token(&self, token: &str) -> Result<AuthenticationResult> {
        self.validations.fetch_add(1, Ordering::Relaxed);

        if let Err(reason) = check_token_shape(token, self.config.validation.max_token_length) {
            return Ok(AuthenticationResult::failed(reason));
        }

        let cache_key = namespaced_key("token", token);
        if let Some(cached) = get_sealed::<AuthenticationResult>(self.result_cache.as_ref(), &cache_key).await
        {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            counter!("keycloak.token.validation_cache_hit").increment(1);
            return Ok(cached.cached());
        }

        let header = match jsonwebtoken::decode_header(token) {
            Ok(h) => h,
            Err(e) => {
                return Ok(AuthenticationResult::failed(format!(
                    "Malformed input: invalid JWT header ({e})"
                )));
            }
        };
        let Some(kid) = header.kid else {
            return Ok(AuthenticationResult::failed(
                "Malformed input: JWT header carries no kid",
            ));
        };

        let decoding_key = match self.jwks_resolver() {
            Ok(resolver) => match resolver.decoding_key(&kid).await {
                Ok(key) => key,
                Err(Error::Malformed(m)) => {
                    return Ok(AuthenticationResult::failed(format!("Malformed input: {m}")));
                }
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        };

        let validation = self.build_validation(header.alg);
        let claims = match jsonwebtoken::decode::<Value>(token, &decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(e) => return Ok(Self::failed_from_jwt_error(&e)),
        };

        // Replay check on (jti, iat), skipped silently when disabled.
        if self.config.validation.replay_cache {
            let jti = claims.get("jti").and_then(Value::as_str);
            let iat = claims.get("iat").and_then(Value::as_u64);
            let exp = claims.get("exp").and_then(Value::as_u64).unwrap_or(0);
            if let (Some(jti), Some(iat)) = (jti, iat) {
                if self.replay.check_and_insert(jti, iat, exp) {
                    return Ok(AuthenticationResult::failed("Token replay detected"));
                }
            }
        }

        let user = user_info_from_claims(&claims);
        let expires_at = claims
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single());

        let mut result = AuthenticationResult::ok(user, expires_at);
        result.token = Some(token.to_string());
        result.scopes = claims
            .get("scope")
            .and_then(Value::as_str)
            .map(|s| s.split_whitespace().map(String::from).collect());

        // Cache aligned to token expiry; nothing to cache for an
        // already-expiring token.
        if let Some(expires_at) = expires_at {
            let remaining = (expires_at - Utc::now()).num_seconds();
            if remaining > 0 {
                set_sealed(
                    self.result_cache.as_ref(),
                    &cache_key,
                    &result,
                    Duration::from_secs(remaining as u64),
                )
                .await;
            }
        }

        Ok(result)
    }

    fn build_validation(&self, alg: Algorithm) -> Validation {
        let alg = match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::ES256
            | Algorithm::ES384 => alg,
            other => {
                warn!(alg = ?other, "unsupported JWT algorithm, defaulting to RS256");
                Algorithm::RS256
            }
        };

        let mut validation = Validation::new(alg);
        validation.leeway = self.config.validation.clock_skew_secs;
        validation.set_audience(&[self.client.client_id.as_str()]);
        if self.config.validation.validate_issuer {
            validation.set_issuer(&[self.config.expected_issuer()]);
        }
        validation
    }

    fn failed_from_jwt_error(e: &jsonwebtoken::errors::Error) -> AuthenticationResult {
        use jsonwebtoken::errors::ErrorKind;
        let message = match e.kind() {
            ErrorKind::ExpiredSignature => "Credential expired: token past exp".to_string(),
            ErrorKind::ImmatureSignature => "Token validation failed: token not yet valid".to_string(),
            ErrorKind::InvalidAudience => "Token validation failed: audience mismatch".to_string(),
            ErrorKind::InvalidIssuer => "Malformed input: issuer mismatch".to_string(),
            _ => sanitize_message(&format!("Token validation failed: {e}")),
        };
        AuthenticationResult::failed(message)
    }

    /// Remote validation against the introspection endpoint.
    ///
    /// `active: false` is a failure, cached for a short window so a burst of
    /// requests with a dead token costs one upstream call.
    pub async fn introspect_token(&self, token: &str) -> Result<AuthenticationResult> {
        let document = self.document().await?;
        let endpoint = document.introspection_endpoint.as_deref().ok_or_else(|| {
            Error::Misconfigured("discovery document exposes no introspection endpoint".to_string())
        })?;
        let secret = self.secret()?;

        let cache_key = namespaced_key("introspect", token);
        if let Some(cached) = get_sealed::<AuthenticationResult>(self.result_cache.as_ref(), &cache_key).await
        {
            return Ok(cached.cached());
        }

        let response = self
            .http
            .post(endpoint)
            .form(&[
                ("token", token),
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", secret),
            ])
            .send()
            .await
            .map_err(classify_reqwest)?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "introspection returned HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("introspection response is not valid JSON: {e}")))?;

        if !body.get("active").and_then(Value::as_bool).unwrap_or(false) {
            let result = AuthenticationResult::failed("Credential inactive: token not active");
            set_sealed(
                self.result_cache.as_ref(),
                &cache_key,
                &result,
                Duration::from_secs(self.config.validation.introspection_negative_cache_secs),
            )
            .await;
            return Ok(result);
        }

        let user = user_info_from_introspection(&body);
        let expires_at = body
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single());
        let mut result = AuthenticationResult::ok(user, expires_at);
        result.token = Some(token.to_string());
        Ok(result)
    }

    /// Fetch the userinfo document for an access token (cached 5 min).
    pub async fn get_user_info(&self, access_token: &str) -> Result<UserInfo> {
        let document = self.document().await?;
        let endpoint = document.userinfo_endpoint.as_deref().ok_or_else(|| {
            Error::Misconfigured("discovery document exposes no userinfo endpoint".to_string())
        })?;

        let cache_key = namespaced_key("userinfo", access_token);
        if let Some(cached) = get_sealed::<UserInfo>(self.result_cache.as_ref(), &cache_key).await {
            return Ok(cached);
        }

        let response = self
            .http
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(classify_reqwest)?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "userinfo returned HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("userinfo response is not valid JSON: {e}")))?;
        let user = user_info_from_claims(&body);

        set_sealed(
            self.result_cache.as_ref(),
            &cache_key,
            &user,
            Duration::from_secs(self.config.validation.userinfo_cache_secs),
        )
        .await;
        Ok(user)
    }

    /// Build the authorization-code URL (pure, given a loaded discovery doc).
    pub async fn get_authorization_url(
        &self,
        state: &str,
        nonce: &str,
        code_challenge: Option<&str>,
        extra_scopes: Option<&[String]>,
    ) -> Result<String> {
        let document = self.document().await?;
        let redirect_uri = self.client.redirect_uri.as_deref().ok_or_else(|| {
            Error::Misconfigured(format!("client '{}' has no redirect URI", self.audience))
        })?;

        let mut url = Url::parse(&document.authorization_endpoint)
            .map_err(|e| Error::Misconfigured(format!("invalid authorization endpoint: {e}")))?;

        let mut scopes: Vec<String> = self.client.scopes.clone();
        if let Some(extra) = extra_scopes {
            scopes.extend_from_slice(extra);
        }
        scopes.dedup();

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.client.client_id);
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("state", state);
            params.append_pair("nonce", nonce);
            if !scopes.is_empty() {
                params.append_pair("scope", &scopes.join(" "));
            }
            if let Some(challenge) = code_challenge {
                params.append_pair("code_challenge", challenge);
                params.append_pair("code_challenge_method", "S256");
            }
        }

        Ok(url.to_string())
    }

    /// Build the RP-initiated logout URL (pure, given a loaded discovery doc).
    pub async fn get_logout_url(
        &self,
        id_token_hint: Option<&str>,
        post_logout_redirect_uri: Option<&str>,
    ) -> Result<String> {
        let document = self.document().await?;
        let mut url = Url::parse(&document.logout_endpoint())
            .map_err(|e| Error::Misconfigured(format!("invalid end-session endpoint: {e}")))?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.client.client_id);
            if let Some(hint) = id_token_hint {
                params.append_pair("id_token_hint", hint);
            }
            if let Some(redirect) = post_logout_redirect_uri {
                params.append_pair("post_logout_redirect_uri", redirect);
            }
        }

        Ok(url.to_string())
    }

    /// Invalidate a refresh token at the IdP.
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        let document = self.document().await?;

        let mut params = vec![
            ("client_id", self.client.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = self.client.client_secret.as_deref().filter(|s| !s.is_empty()) {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(document.logout_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(classify_reqwest)?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "logout returned HTTP {}",
                response.status()
            )));
        }
        debug!(audience = %self.audience, "refresh token revoked at IdP");
        Ok(())
    }

    /// Liveness: succeeds iff a discovery document is loaded (initializing
    /// if needed).
    pub async fn health_check(&self) -> Result<()> {
        self.document().await.map(|_| ())
    }

    /// Uncached liveness probe against the discovery endpoint.
    ///
    /// Unlike [`health_check`](Self::health_check), this always goes to the
    /// wire, so it reports the IdP's actual reachability.
    pub async fn probe_idp(&self) -> Result<()> {
        super::discovery::fetch(&self.http, &self.config.server_url, &self.config.realm)
            .await
            .map(|_| ())
    }

    /// Clear discovery, JWKS, replay markers, and counters.
    ///
    /// The client returns to `Pending` and may be re-initialized.
    pub fn dispose(&self) {
        self.discovery.clear();
        if let Some(resolver) = self.jwks.write().take() {
            resolver.clear();
        }
        self.replay.clear();
        self.validations.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        *self.state.write() = ClientState::Pending;
    }

    /// Total validations since construction (or last dispose).
    #[must_use]
    pub fn validation_count(&self) -> u64 {
        self.validations.load(Ordering::Relaxed)
    }

    /// Validations served from the result cache.
    #[must_use]
    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

/// Structural check: length bounds and three base64url segments.
fn check_token_shape(token: &str, max_length: usize) -> std::result::Result<(), String> {
    if token.len() <= 1 || token.len() > max_length {
        return Err(format!(
            "Malformed input: token length {} outside bounds",
            token.len()
        ));
    }
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3
        || segments.iter().any(|s| {
            s.is_empty()
                || !s
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
    {
        return Err("Malformed input: token is not three base64url segments".to_string());
    }
    Ok(())
}

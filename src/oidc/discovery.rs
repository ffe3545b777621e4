//! OIDC discovery — well-known document fetch, validation, and caching.
//!
//! Implements OIDC Discovery 1.0 against Keycloak-style realm URLs:
//! `<serverUrl>/realms/<realm>/.well-known/openid-configuration`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use telemetry_metrics::counter;
use tracing::{debug, warn};

use crate::{Error, Result};

/// OIDC discovery document (the subset this library consumes).
///
/// Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer URL; expected to equal `<serverUrl>/realms/<realm>`
    #[serde(default)]
    pub issuer: String,

    /// Authorization endpoint URL
    #[serde(default)]
    pub authorization_endpoint: String,

    /// Token endpoint URL
    #[serde(default)]
    pub token_endpoint: String,

    /// JWKS URI for signature keys
    #[serde(default)]
    pub jwks_uri: String,

    /// Userinfo endpoint (optional)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Token introspection endpoint (optional)
    #[serde(default)]
    pub introspection_endpoint: Option<String>,

    /// RP-initiated logout endpoint (optional)
    #[serde(default)]
    pub end_session_endpoint: Option<String>,

    /// Supported ID-token signing algorithms
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

/// Deserialize scopes that may be either a string or array.
/// Some IdP builds incorrectly return `"openid profile"` instead of a list.
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

impl DiscoveryDocument {
    /// Check that every endpoint this library depends on is present.
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("issuer", &self.issuer),
            ("authorization_endpoint", &self.authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("jwks_uri", &self.jwks_uri),
        ] {
            if value.is_empty() {
                return Err(Error::Misconfigured(format!(
                    "discovery document missing required field '{field}'"
                )));
            }
        }
        Ok(())
    }

    /// Logout endpoint, falling back to `<token_endpoint>/logout` when the
    /// document carries no `end_session_endpoint` (Keycloak exposes both).
    #[must_use]
    pub fn logout_endpoint(&self) -> String {
        self.end_session_endpoint.clone().unwrap_or_else(|| {
            format!(
                "{}/logout",
                self.token_endpoint
                    .trim_end_matches("/token")
                    .trim_end_matches('/')
            )
        })
    }
}

/// Fetch and validate the discovery document for `(server_url, realm)`.
///
/// An issuer that does not match `<serverUrl>/realms/<realm>` is logged and
/// counted (`discovery.issuer_mismatch`) but not fatal; local validation
/// with issuer checking enabled will reject such tokens later.
pub async fn fetch(client: &Client, server_url: &str, realm: &str) -> Result<DiscoveryDocument> {
    let url = format!(
        "{}/realms/{realm}/.well-known/openid-configuration",
        server_url.trim_end_matches('/')
    );
    debug!(url = %url, "fetching OIDC discovery document");

    let response = client.get(&url).send().await.map_err(classify_reqwest)?;
    if !response.status().is_success() {
        return Err(Error::Upstream(format!(
            "discovery fetch failed: HTTP {} from {url}",
            response.status()
        )));
    }

    let document: DiscoveryDocument = response
        .json()
        .await
        .map_err(|e| Error::Upstream(format!("discovery document is not valid JSON: {e}")))?;
    document.validate()?;

    let expected_issuer = format!("{}/realms/{realm}", server_url.trim_end_matches('/'));
    if document.issuer.trim_end_matches('/') != expected_issuer {
        counter!("discovery.issuer_mismatch").increment(1);
        warn!(
            expected = %expected_issuer,
            actual = %document.issuer,
            "discovery issuer does not match configured realm URL"
        );
    }

    Ok(document)
}

/// Map reqwest failures onto the error taxonomy (timeouts are their own kind).
pub(crate) fn classify_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout(format!("request deadline exceeded: {e}"))
    } else {
        Error::Upstream(format!("request failed: {e}"))
    }
}

/// TTL cache for the discovery document, single-flight on refresh.
pub struct DiscoveryCache {
    document: RwLock<Option<(Arc<DiscoveryDocument>, Instant)>>,
    fetch_lock: tokio::sync::Mutex<()>,
    ttl: Duration,
}

impl DiscoveryCache {
    /// Create with the given TTL (default 1 hour at the config layer).
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            document: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
            ttl,
        }
    }

    /// Cached document, if fresh.
    #[must_use]
    pub fn current(&self) -> Option<Arc<DiscoveryDocument>> {
        let guard = self.document.read();
        guard
            .as_ref()
            .filter(|(_, fetched_at)| fetched_at.elapsed() < self.ttl)
            .map(|(doc, _)| Arc::clone(doc))
    }

    /// Return the cached document or fetch it.
    ///
    /// Concurrent callers during a refresh share one in-flight fetch: the
    /// first caller holds the fetch lock, everyone else waits and then reads
    /// the freshly stored document.
    pub async fn get_or_fetch(
        &self,
        client: &Client,
        server_url: &str,
        realm: &str,
    ) -> Result<Arc<DiscoveryDocument>> {
        if let Some(doc) = self.current() {
            return Ok(doc);
        }

        let _guard = self.fetch_lock.lock().await;
        // A concurrent caller may have refreshed while we waited.
        if let Some(doc) = self.current() {
            return Ok(doc);
        }

        let document = Arc::new(fetch(client, server_url, realm).await?);
        *self.document.write() = Some((Arc::clone(&document), Instant::now()));
        Ok(document)
    }

    /// Drop the cached document.
    pub fn clear(&self) {
        *self.document.write() = None;
    }
}

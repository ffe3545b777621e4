//! JWKS resolution — lazy fetch with a refresh cooldown.
//!
//! The key set is fetched on first use and refreshed at most once per
//! cooldown window when an unknown `kid` appears. The cooldown prevents a
//! thundering herd of JWKS fetches when the IdP rotates keys (or an
//! attacker sprays tokens with bogus key IDs).

use std::time::{Duration, Instant};

use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::RwLock;
use reqwest::Client;
use tracing::debug;

use super::discovery::classify_reqwest;
use crate::{Error, Result};

/// Lazily initialized JWKS resolver for one `jwks_uri`.
pub struct JwksResolver {
    http: Client,
    jwks_uri: String,
    keys: RwLock<Option<JwkSet>>,
    last_fetch: RwLock<Option<Instant>>,
    cooldown: Duration,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl JwksResolver {
    /// Create a resolver for `jwks_uri` with the given refresh cooldown.
    #[must_use]
    pub fn new(http: Client, jwks_uri: String, cooldown: Duration) -> Self {
        Self {
            http,
            jwks_uri,
            keys: RwLock::new(None),
            last_fetch: RwLock::new(None),
            cooldown,
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Resolve the decoding key for `kid`.
    ///
    /// Fetches the key set on first use; on an unknown `kid`, refreshes at
    /// most once per cooldown window before failing.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        if self.keys.read().is_none() {
            self.refresh().await?;
        }

        if let Some(key) = self.find_key(kid) {
            return Ok(key);
        }

        if self.cooldown_elapsed() {
            debug!(kid = %kid, "kid not in cached JWKS, refreshing");
            self.refresh().await?;
            if let Some(key) = self.find_key(kid) {
                return Ok(key);
            }
        }

        Err(Error::Malformed(format!("unknown signing key id '{kid}'")))
    }

    fn find_key(&self, kid: &str) -> Option<DecodingKey> {
        let guard = self.keys.read();
        let jwks = guard.as_ref()?;
        for jwk in &jwks.keys {
            if jwk.common.key_id.as_deref() != Some(kid) {
                continue;
            }
            return match &jwk.algorithm {
                AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
                AlgorithmParameters::EllipticCurve(ec) => {
                    DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
                }
                AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
            };
        }
        None
    }

    fn cooldown_elapsed(&self) -> bool {
        self.last_fetch
            .read()
            .is_none_or(|at| at.elapsed() >= self.cooldown)
    }

    async fn refresh(&self) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;
        // A concurrent caller may have refreshed while we waited.
        if self.keys.read().is_some() && !self.cooldown_elapsed() {
            return Ok(());
        }

        debug!(jwks_uri = %self.jwks_uri, "fetching JWKS");
        let response = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(classify_reqwest)?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "JWKS fetch failed: HTTP {}",
                response.status()
            )));
        }
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("JWKS is not valid JSON: {e}")))?;

        *self.keys.write() = Some(jwks);
        *self.last_fetch.write() = Some(Instant::now());
        Ok(())
    }

    /// Drop the cached key set.
    pub fn clear(&self) {
        *self.keys.write() = None;
        *self.last_fetch.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with_keys(jwks_json: serde_json::Value) -> JwksResolver {
        let resolver = JwksResolver::new(
            Client::new(),
            "https://iam.test/certs".to_string(),
            Duration::from_secs(30),
        );
        let jwks: JwkSet = serde_json::from_value(jwks_json).unwrap();
        *resolver.keys.write() = Some(jwks);
        *resolver.last_fetch.write() = Some(Instant::now());
        resolver
    }

    #[test]
    fn find_key_matches_rsa_kid() {
        // Minimal RSA JWK (public components are base64url values)
        let resolver = resolver_with_keys(serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": "k1",
                "use": "sig",
                "alg": "RS256",
                "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
                "e": "AQAB"
            }]
        }));
        assert!(resolver.find_key("k1").is_some());
        assert!(resolver.find_key("k2").is_none());
    }

    #[test]
    fn octet_keys_are_rejected() {
        // Symmetric keys must never verify asymmetric-signature tokens
        let resolver = resolver_with_keys(serde_json::json!({
            "keys": [{
                "kty": "oct",
                "kid": "sym",
                "k": "c2VjcmV0"
            }]
        }));
        assert!(resolver.find_key("sym").is_none());
    }

    #[test]
    fn cooldown_gates_refresh() {
        let resolver = resolver_with_keys(serde_json::json!({"keys": []}));
        // fresh fetch recorded just now: cooldown not elapsed
        assert!(!resolver.cooldown_elapsed());
        *resolver.last_fetch.write() = Some(Instant::now() - Duration::from_secs(31));
        assert!(resolver.cooldown_elapsed());
    }

    #[test]
    fn clear_drops_keys_and_timestamps() {
        let resolver = resolver_with_keys(serde_json::json!({"keys": []}));
        resolver.clear();
        assert!(resolver.keys.read().is_none());
        assert!(resolver.cooldown_elapsed());
    }
}

//! Multi-client factory — one OIDC client per configured audience.
//!
//! All clients share the server URL and realm but carry their own client
//! id, secret, redirect URI, and scopes. Initialization runs in parallel
//! and tolerates partial failure: a client whose discovery fetch fails is
//! omitted and recorded, the rest stay usable.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::Config;
use crate::oidc::OidcClient;
use crate::{Error, Result};

/// Owns one initialized [`OidcClient`] per audience.
pub struct ClientFactory {
    clients: HashMap<String, Arc<OidcClient>>,
    failed: Vec<String>,
}

impl ClientFactory {
    /// Build and initialize clients for every configured audience.
    ///
    /// Fails only on invalid configuration; per-client initialization
    /// failures are tolerated and recorded.
    pub async fn initialize(config: Arc<Config>) -> Result<Self> {
        config.validate()?;

        let mut constructed = Vec::new();
        for audience in config.clients.keys() {
            match OidcClient::new(Arc::clone(&config), audience) {
                Ok(client) => constructed.push((audience.clone(), Arc::new(client))),
                Err(e) => {
                    return Err(Error::Misconfigured(format!(
                        "client '{audience}' construction failed: {e}"
                    )));
                }
            }
        }

        let initializations = constructed.iter().map(|(audience, client)| {
            let client = Arc::clone(client);
            let audience = audience.clone();
            async move { (audience, client.initialize().await) }
        });

        let mut clients = HashMap::new();
        let mut failed = Vec::new();
        for ((audience, outcome), (_, client)) in
            join_all(initializations).await.into_iter().zip(constructed)
        {
            match outcome {
                Ok(()) => {
                    clients.insert(audience, client);
                }
                Err(e) => {
                    warn!(audience = %audience, error = %e, "client failed to initialize, omitting");
                    failed.push(audience);
                }
            }
        }

        info!(
            initialized = clients.len(),
            failed = failed.len(),
            "client factory ready"
        );
        Ok(Self { clients, failed })
    }

    /// The client for an audience, if it initialized.
    #[must_use]
    pub fn client(&self, audience: &str) -> Option<Arc<OidcClient>> {
        self.clients.get(audience).cloned()
    }

    /// Audiences that initialized successfully.
    #[must_use]
    pub fn audiences(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }

    /// Audiences whose initialization failed.
    #[must_use]
    pub fn failed_audiences(&self) -> &[String] {
        &self.failed
    }

    /// Dispose every client and release their caches.
    pub fn shutdown(&self) {
        for (audience, client) in &self.clients {
            client.dispose();
            info!(audience = %audience, "client disposed");
        }
    }
}

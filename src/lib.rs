//! authkit — authentication and authorization for backend services.
//!
//! Integrates a Keycloak-compatible OpenID Connect / OAuth2 identity
//! provider with a first-party API-key credential system.
//!
//! # Features
//!
//! - **OIDC client core**: discovery caching, JWKS signature verification
//!   with replay protection, introspection, all OAuth2 grant flows
//! - **Admin surface**: cached admin token (single-flight refresh), typed
//!   admin REST client, user lifecycle orchestration
//! - **API keys**: entropy-qualified generation, constant-time validation,
//!   integrity-sealed caching, batched usage tracking, revocation
//! - **Resilience**: offline fallback serving cached validations when the
//!   identity provider is unreachable
//! - **Health**: aggregated component health with entropy self-tests
//!
//! Both validation paths (JWT and API key) yield the same normalized
//! [`AuthenticationResult`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod apikey;
pub mod cache;
pub mod claims;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod entropy;
pub mod error;
pub mod factory;
pub mod oidc;
pub mod roles;

pub use claims::{AuthenticationResult, UserInfo};
pub use config::Config;
pub use dispatch::{AuthDispatcher, CredentialKind};
pub use error::{Error, Result};
pub use factory::ClientFactory;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}

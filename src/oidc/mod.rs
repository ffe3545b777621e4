//! OIDC client core — discovery, JWKS verification, grant flows, replay
//! protection, and the offline-fallback wrapper.

pub mod client;
pub mod discovery;
pub mod jwks;
pub mod replay;
pub mod resilience;

pub use client::{ClientState, OidcClient, PasswordLogin, TokenResponse};
pub use discovery::{DiscoveryCache, DiscoveryDocument};
pub use jwks::JwksResolver;
pub use replay::ReplayCache;
pub use resilience::ResilientOidcClient;

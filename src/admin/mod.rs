//! Admin surface — token provider, typed admin REST client, user service.
//!
//! Wiring is acyclic: the token provider holds an OIDC client, the admin
//! API client holds the token provider, the user service holds the admin
//! API client. Nothing points back up.

pub mod client;
pub mod token;
pub mod users;

pub use client::{AdminApiClient, ClientRepresentation, KeycloakUser, RoleRepresentation};
pub use token::AdminTokenProvider;
pub use users::{NewUser, UserService, keycloak_user_to_user_info, user_info_to_keycloak_user};

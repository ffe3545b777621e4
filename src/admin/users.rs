//! User service — orchestrates user CRUD and role assignment through the
//! admin API client.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::client::{AdminApiClient, KeycloakUser, RoleRepresentation};
use crate::claims::{UserInfo, normalize};
use crate::{Error, Result};

/// Parameters for creating a user.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    /// Username (required)
    pub username: String,
    /// Email address
    pub email: Option<String>,
    /// Display name (`"First Last"`)
    pub name: Option<String>,
    /// Initial password
    pub password: Option<String>,
    /// Whether the initial password must be changed on first login
    pub temporary_password: bool,
    /// Realm roles to assign by name
    pub realm_roles: Vec<String>,
}

/// User lifecycle orchestration over the admin REST surface.
pub struct UserService {
    admin: Arc<AdminApiClient>,
}

impl UserService {
    /// Create a service over an admin API client.
    #[must_use]
    pub fn new(admin: Arc<AdminApiClient>) -> Self {
        Self { admin }
    }

    /// Create a user, set the initial password, and assign realm roles.
    pub async fn create_user(&self, new_user: &NewUser) -> Result<UserInfo> {
        if new_user.username.is_empty() {
            return Err(Error::Malformed("username must not be empty".to_string()));
        }

        let (first_name, last_name) = split_name(new_user.name.as_deref());
        let representation = KeycloakUser {
            id: None,
            username: new_user.username.clone(),
            email: new_user.email.clone(),
            first_name,
            last_name,
            enabled: true,
            email_verified: false,
            attributes: None,
        };

        let user_id = self.admin.create_user(&representation).await?;
        info!(user_id = %user_id, username = %new_user.username, "user created");

        if let Some(password) = new_user.password.as_deref() {
            self.admin
                .reset_password(&user_id, password, new_user.temporary_password)
                .await?;
        }

        if !new_user.realm_roles.is_empty() {
            self.assign_realm_roles(&user_id, &new_user.realm_roles).await?;
        }

        self.get_user(&user_id).await?.ok_or_else(|| {
            Error::Upstream(format!("user {user_id} vanished immediately after creation"))
        })
    }

    /// Fetch a user with their normalized realm roles. `None` when absent.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserInfo>> {
        let Some(representation) = self.admin.get_user_by_id(user_id).await? else {
            return Ok(None);
        };
        let mut user = keycloak_user_to_user_info(&representation);

        let roles = self.admin.get_user_realm_roles(user_id).await?;
        user.roles = normalize(roles.into_iter().map(|r| format!("realm:{}", r.name)).collect());
        Ok(Some(user))
    }

    /// Search users by username/email substring.
    pub async fn search_users(&self, query: &str, max: u32) -> Result<Vec<UserInfo>> {
        let users = self.admin.search_users(query, max).await?;
        Ok(users.iter().map(keycloak_user_to_user_info).collect())
    }

    /// Update a user from a [`UserInfo`] (preserved fields only).
    pub async fn update_user(&self, user_id: &str, user: &UserInfo) -> Result<()> {
        let representation = user_info_to_keycloak_user(user);
        self.admin.update_user(user_id, &representation).await
    }

    /// Delete a user.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.admin.delete_user(user_id).await
    }

    /// Set a user's password.
    pub async fn set_password(&self, user_id: &str, password: &str, temporary: bool) -> Result<()> {
        self.admin.reset_password(user_id, password, temporary).await
    }

    /// Assign realm roles by name. Unknown names are skipped with a warning.
    pub async fn assign_realm_roles(&self, user_id: &str, role_names: &[String]) -> Result<()> {
        let roles = self.resolve_realm_roles(role_names).await?;
        if roles.is_empty() {
            return Ok(());
        }
        self.admin.assign_realm_roles(user_id, &roles).await
    }

    /// Remove realm roles by name.
    pub async fn remove_realm_roles(&self, user_id: &str, role_names: &[String]) -> Result<()> {
        let roles = self.resolve_realm_roles(role_names).await?;
        if roles.is_empty() {
            return Ok(());
        }
        self.admin.remove_realm_roles(user_id, &roles).await
    }

    /// Assign client roles by name, resolving the client's internal id.
    pub async fn assign_client_roles(
        &self,
        user_id: &str,
        client_id: &str,
        role_names: &[String],
    ) -> Result<()> {
        let internal_id = self
            .admin
            .get_client_internal_id(client_id)
            .await?
            .ok_or_else(|| Error::Upstream(format!("client '{client_id}' not found in realm")))?;

        let available = self.admin.get_client_roles(&internal_id).await?;
        let roles = filter_roles(available, role_names);
        if roles.is_empty() {
            return Ok(());
        }
        self.admin.assign_client_roles(user_id, &internal_id, &roles).await
    }

    /// Remove client roles by name.
    pub async fn remove_client_roles(
        &self,
        user_id: &str,
        client_id: &str,
        role_names: &[String],
    ) -> Result<()> {
        let internal_id = self
            .admin
            .get_client_internal_id(client_id)
            .await?
            .ok_or_else(|| Error::Upstream(format!("client '{client_id}' not found in realm")))?;

        let available = self.admin.get_client_roles(&internal_id).await?;
        let roles = filter_roles(available, role_names);
        if roles.is_empty() {
            return Ok(());
        }
        self.admin.remove_client_roles(user_id, &internal_id, &roles).await
    }

    async fn resolve_realm_roles(&self, role_names: &[String]) -> Result<Vec<RoleRepresentation>> {
        let available = self.admin.get_realm_roles().await?;
        Ok(filter_roles(available, role_names))
    }
}

fn filter_roles(available: Vec<RoleRepresentation>, wanted: &[String]) -> Vec<RoleRepresentation> {
    let mut resolved = Vec::new();
    for name in wanted {
        match available.iter().find(|r| &r.name == name) {
            Some(role) => resolved.push(role.clone()),
            None => warn!(role = %name, "role not defined, skipping assignment"),
        }
    }
    resolved
}

/// Translate a Keycloak user representation to a normalized [`UserInfo`].
///
/// `enabled`, `emailVerified`, and `attributes` ride along in metadata so
/// the reverse translation preserves them.
#[must_use]
pub fn keycloak_user_to_user_info(user: &KeycloakUser) -> UserInfo {
    let name = match (user.first_name.as_deref(), user.last_name.as_deref()) {
        (Some(first), Some(last)) => format!("{first} {last}"),
        (Some(first), None) => first.to_string(),
        (None, Some(last)) => last.to_string(),
        (None, None) => String::new(),
    };

    UserInfo {
        id: user.id.clone().unwrap_or_default(),
        username: user.username.clone(),
        email: user.email.clone().unwrap_or_default(),
        name,
        roles: Vec::new(),
        permissions: Vec::new(),
        metadata: Some(json!({
            "enabled": user.enabled,
            "emailVerified": user.email_verified,
            "attributes": user.attributes,
        })),
    }
}

/// Translate a [`UserInfo`] back to the Keycloak wire representation.
#[must_use]
pub fn user_info_to_keycloak_user(user: &UserInfo) -> KeycloakUser {
    let (first_name, last_name) = split_name(if user.name.is_empty() {
        None
    } else {
        Some(user.name.as_str())
    });

    let metadata = user.metadata.as_ref();
    let flag = |key: &str, default: bool| {
        metadata
            .and_then(|m| m.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(default)
    };

    KeycloakUser {
        id: (!user.id.is_empty()).then(|| user.id.clone()),
        username: user.username.clone(),
        email: (!user.email.is_empty()).then(|| user.email.clone()),
        first_name,
        last_name,
        enabled: flag("enabled", true),
        email_verified: flag("emailVerified", false),
        attributes: metadata
            .and_then(|m| m.get("attributes"))
            .filter(|v| !v.is_null())
            .cloned(),
    }
}

fn split_name(name: Option<&str>) -> (Option<String>, Option<String>) {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(full) => match full.split_once(' ') {
            Some((first, last)) => (Some(first.to_string()), Some(last.trim().to_string())),
            None => (Some(full.to_string()), None),
        },
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_user() -> KeycloakUser {
        KeycloakUser {
            id: Some("u1".to_string()),
            username: "alice".to_string(),
            email: Some("alice@example.com".to_string()),
            first_name: Some("Alice".to_string()),
            last_name: Some("Anders".to_string()),
            enabled: true,
            email_verified: true,
            attributes: Some(json!({"department": ["engineering"]})),
        }
    }

    #[test]
    fn translation_round_trips_preserved_fields() {
        let original = sample_user();
        let round_tripped = user_info_to_keycloak_user(&keycloak_user_to_user_info(&original));
        assert_eq!(round_tripped, original);
    }

    #[test]
    fn name_is_joined_and_split_consistently() {
        let user = keycloak_user_to_user_info(&sample_user());
        assert_eq!(user.name, "Alice Anders");
        let back = user_info_to_keycloak_user(&user);
        assert_eq!(back.first_name.as_deref(), Some("Alice"));
        assert_eq!(back.last_name.as_deref(), Some("Anders"));
    }

    #[test]
    fn single_word_name_becomes_first_name_only() {
        let user = UserInfo {
            username: "bob".to_string(),
            name: "Bob".to_string(),
            ..UserInfo::default()
        };
        let kc = user_info_to_keycloak_user(&user);
        assert_eq!(kc.first_name.as_deref(), Some("Bob"));
        assert_eq!(kc.last_name, None);
    }

    #[test]
    fn missing_metadata_defaults_to_enabled() {
        let user = UserInfo {
            username: "carol".to_string(),
            ..UserInfo::default()
        };
        let kc = user_info_to_keycloak_user(&user);
        assert!(kc.enabled);
        assert!(!kc.email_verified);
        assert!(kc.attributes.is_none());
    }

    #[test]
    fn filter_roles_skips_unknown_names() {
        let available = vec![
            RoleRepresentation {
                id: Some("1".to_string()),
                name: "admin".to_string(),
                client_role: false,
            },
            RoleRepresentation {
                id: Some("2".to_string()),
                name: "user".to_string(),
                client_role: false,
            },
        ];
        let resolved = filter_roles(available, &["admin".to_string(), "ghost".to_string()]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "admin");
    }
}

//! Claims extraction — pure functions over IdP claim maps.
//!
//! Maps Keycloak-style JWT claims onto a normalized [`UserInfo`]:
//!
//! - realm roles (`realm_access.roles`) become `realm:<name>`
//! - client roles (`resource_access.<client>.roles`) become `<client>:<name>`
//! - permissions are the union of UMA permission entries, colon-bearing
//!   scope tokens, and permissions derived from admin-flavored roles
//!
//! Output arrays are always deduplicated, sorted, and free of empty strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized user identity extracted from a verified credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    /// Subject (opaque IdP user id, or API-key owner id)
    pub id: String,
    /// Preferred username
    #[serde(default)]
    pub username: String,
    /// Email address
    #[serde(default)]
    pub email: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Normalized roles (`realm:<r>` / `<client>:<r>`), sorted and deduped
    #[serde(default)]
    pub roles: Vec<String>,
    /// Normalized permissions, sorted and deduped
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Free-form metadata carried alongside the identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Result of any credential validation path.
///
/// Invariant: `success` implies `user` is present; failure implies `error`
/// is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationResult {
    /// Whether the credential was accepted
    pub success: bool,
    /// Identity of the credential holder (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    /// The validated bearer credential (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// When the credential stops being valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Failure description (present on failure, sanitized)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether this result was served from a cache
    #[serde(default)]
    pub from_cache: bool,
}

impl AuthenticationResult {
    /// Successful result for `user`.
    #[must_use]
    pub fn ok(user: UserInfo, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            user: Some(user),
            token: None,
            scopes: None,
            expires_at,
            error: None,
            from_cache: false,
        }
    }

    /// Failed result carrying a sanitized error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            token: None,
            scopes: None,
            expires_at: None,
            error: Some(error.into()),
            from_cache: false,
        }
    }

    /// Same result flagged as cache-served.
    #[must_use]
    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }
}

/// Extract normalized roles from a claim map.
#[must_use]
pub fn extract_roles(claims: &Value) -> Vec<String> {
    let mut roles = Vec::new();

    if let Some(realm_roles) = claims
        .get("realm_access")
        .and_then(|v| v.get("roles"))
        .and_then(Value::as_array)
    {
        for role in realm_roles.iter().filter_map(Value::as_str) {
            roles.push(format!("realm:{role}"));
        }
    }

    if let Some(resources) = claims.get("resource_access").and_then(Value::as_object) {
        for (client, access) in resources {
            let Some(client_roles) = access.get("roles").and_then(Value::as_array) else {
                continue;
            };
            for role in client_roles.iter().filter_map(Value::as_str) {
                roles.push(format!("{client}:{role}"));
            }
        }
    }

    normalize(roles)
}

/// Extract normalized permissions from a claim map and already-extracted roles.
#[must_use]
pub fn extract_permissions(claims: &Value, roles: &[String]) -> Vec<String> {
    let mut permissions = Vec::new();

    // UMA-style authorization.permissions entries: either plain strings or
    // {rsname, scopes[]} objects.
    if let Some(entries) = claims
        .get("authorization")
        .and_then(|v| v.get("permissions"))
        .and_then(Value::as_array)
    {
        for entry in entries {
            match entry {
                Value::String(s) => permissions.push(s.clone()),
                Value::Object(obj) => {
                    let Some(rsname) = obj.get("rsname").and_then(Value::as_str) else {
                        continue;
                    };
                    match obj.get("scopes").and_then(Value::as_array) {
                        Some(scopes) if !scopes.is_empty() => {
                            for scope in scopes.iter().filter_map(Value::as_str) {
                                permissions.push(format!("{rsname}:{scope}"));
                            }
                        }
                        _ => permissions.push(rsname.to_string()),
                    }
                }
                _ => {}
            }
        }
    }

    // Scope tokens that look like permissions (contain a colon).
    if let Some(scope) = claims.get("scope").and_then(Value::as_str) {
        for token in scope.split_whitespace().filter(|t| t.contains(':')) {
            permissions.push(token.to_string());
        }
    }

    permissions.extend(derive_role_permissions(roles));
    normalize(permissions)
}

/// Permissions implied by admin-flavored roles: a role whose name contains
/// `admin` grants access/read/write/delete on its prefix.
fn derive_role_permissions(roles: &[String]) -> Vec<String> {
    let mut derived = Vec::new();
    for role in roles {
        let Some((prefix, name)) = role.split_once(':') else {
            continue;
        };
        if name.to_lowercase().contains("admin") {
            for op in ["access", "read", "write", "delete"] {
                derived.push(format!("{prefix}:{op}"));
            }
        }
    }
    derived
}

/// Build a [`UserInfo`] from verified JWT claims.
#[must_use]
pub fn user_info_from_claims(claims: &Value) -> UserInfo {
    let roles = extract_roles(claims);
    let permissions = extract_permissions(claims, &roles);

    UserInfo {
        id: str_claim(claims, "sub"),
        username: first_str_claim(claims, &["preferred_username", "username"]),
        email: str_claim(claims, "email"),
        name: str_claim(claims, "name"),
        roles,
        permissions,
        metadata: None,
    }
}

/// Build a [`UserInfo`] from a token-introspection response.
///
/// Introspection responses use the same claim names as JWTs but come from
/// the IdP directly, so no signature work happened on this path.
#[must_use]
pub fn user_info_from_introspection(response: &Value) -> UserInfo {
    user_info_from_claims(response)
}

/// Deduplicate, sort, and drop empty strings.
#[must_use]
pub fn normalize(mut values: Vec<String>) -> Vec<String> {
    values.retain(|v| !v.is_empty());
    values.sort();
    values.dedup();
    values
}

fn str_claim(claims: &Value, key: &str) -> String {
    claims
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn first_str_claim(claims: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| claims.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

//! Authorization predicates over an extracted [`UserInfo`].
//!
//! Roles are the normalized `realm:<name>` / `<client>:<name>` strings
//! produced by the claims extractor; permissions use the `resource:action`
//! form and support a `resource:*` wildcard.

use crate::claims::UserInfo;

/// Whether `user` holds `role` (exact normalized form).
#[must_use]
pub fn has_role(user: &UserInfo, role: &str) -> bool {
    user.roles.iter().any(|r| r == role)
}

/// Whether `user` holds at least one of `roles`.
#[must_use]
pub fn has_any_role(user: &UserInfo, roles: &[&str]) -> bool {
    roles.iter().any(|r| has_role(user, r))
}

/// Whether `user` holds every role in `roles`.
#[must_use]
pub fn has_all_roles(user: &UserInfo, roles: &[&str]) -> bool {
    roles.iter().all(|r| has_role(user, r))
}

/// Whether `user` holds a role on a specific client.
#[must_use]
pub fn has_client_role(user: &UserInfo, client: &str, role: &str) -> bool {
    has_role(user, &format!("{client}:{role}"))
}

/// Whether `user` holds the realm admin role.
#[must_use]
pub fn is_realm_admin(user: &UserInfo) -> bool {
    has_role(user, "realm:admin")
}

/// Whether `user` holds `permission`.
///
/// A stored `*` grants everything; a stored `resource:*` grants every
/// action on that resource.
#[must_use]
pub fn has_permission(user: &UserInfo, permission: &str) -> bool {
    if user.permissions.iter().any(|p| p == "*" || p == permission) {
        return true;
    }

    if let Some((resource, _action)) = permission.split_once(':') {
        let wildcard = format!("{resource}:*");
        return user.permissions.iter().any(|p| p == &wildcard);
    }

    false
}

/// Whether `user` holds at least one of `permissions`.
#[must_use]
pub fn has_any_permission(user: &UserInfo, permissions: &[&str]) -> bool {
    permissions.iter().any(|p| has_permission(user, p))
}

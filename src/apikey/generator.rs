//! API-key generation — secure key strings and identifier derivation.
//!
//! Keys look like `<prefix>_<43-char URL-safe base64>` (256 bits of
//! entropy). The prefix makes keys greppable and detectable by secret
//! scanners. Primary entropy is qualified by the checks in
//! [`crate::entropy`]; a hard failure drops to the hashed fallback, and a
//! broken fallback yields an `emergency_` key plus a loud metric.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::entropy;

/// Characters of the key hashed into the identifier.
const IDENTIFIER_SOURCE_LEN: usize = 16;

/// Hex characters kept from the identifier digest.
const IDENTIFIER_LEN: usize = 32;

/// Characters shown in the preview.
const PREVIEW_LEN: usize = 8;

/// A freshly generated API key with its derived lookups.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// The full key string (shown to the caller exactly once)
    pub key: String,
    /// Deterministic lookup identifier ([`key_identifier`])
    pub key_identifier: String,
    /// Redacted display form ([`key_preview`])
    pub key_preview: String,
    /// Whether a degraded entropy path produced this key
    pub degraded: bool,
}

/// Generate a key with the given prefix (falling back to `default_prefix`).
#[must_use]
pub fn generate(prefix: Option<&str>, default_prefix: &str) -> GeneratedKey {
    let prefix = prefix
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(default_prefix);

    let (material, degraded) = match entropy::secure_bytes(32) {
        Ok(bytes) => (URL_SAFE_NO_PAD.encode(bytes), false),
        Err(e) => {
            warn!(error = %e, "primary entropy rejected, generating degraded key");
            let fallback = entropy::fallback_material();
            if fallback.len() == 43 && !fallback.chars().all(|c| c == fallback.chars().next().unwrap_or('\0')) {
                (fallback, true)
            } else {
                (entropy::emergency_material(), true)
            }
        }
    };

    let key = format!("{prefix}_{material}");
    GeneratedKey {
        key_identifier: key_identifier(&key),
        key_preview: key_preview(&key),
        key,
        degraded,
    }
}

/// Deterministic lookup identifier: hex SHA-256 of the key's first 16
/// characters, truncated to 32 characters.
///
/// Depends only on the key's prefix region, so the storage index can find
/// candidate rows in O(1) without ever storing key material.
#[must_use]
pub fn key_identifier(key: &str) -> String {
    let source: String = key.chars().take(IDENTIFIER_SOURCE_LEN).collect();
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..IDENTIFIER_LEN].to_string()
}

/// Redacted display form: first 8 characters plus an ellipsis.
#[must_use]
pub fn key_preview(key: &str) -> String {
    let head: String = key.chars().take(PREVIEW_LEN).collect();
    format!("{head}…")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn generated_key_carries_prefix_and_material() {
        let generated = generate(Some("svc"), "ak");
        assert!(generated.key.starts_with("svc_"));
        assert_eq!(generated.key.len(), "svc_".len() + 43);
        assert!(!generated.degraded);
    }

    #[test]
    fn empty_prefix_falls_back_to_default() {
        let generated = generate(None, "ak");
        assert!(generated.key.starts_with("ak_"));
        let generated = generate(Some("  "), "ak");
        assert!(generated.key.starts_with("ak_"));
    }

    #[test]
    fn keys_are_unique() {
        let a = generate(None, "ak");
        let b = generate(None, "ak");
        assert_ne!(a.key, b.key);
        assert_ne!(a.key_identifier, b.key_identifier);
    }

    #[test]
    fn identifier_is_stable_and_32_chars() {
        let key = "svc_abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";
        let a = key_identifier(key);
        let b = key_identifier(key);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn identifier_depends_only_on_first_16_chars() {
        let a = key_identifier("svc_abcdefghijkl-TAIL-ONE");
        let b = key_identifier("svc_abcdefghijkl-TAIL-TWO");
        assert_eq!(a, b);

        let c = key_identifier("svc_Xbcdefghijkl-TAIL-ONE");
        assert_ne!(a, c);
    }

    #[test]
    fn preview_is_redacted() {
        let generated = generate(Some("svc"), "ak");
        assert_eq!(generated.key_preview.chars().count(), PREVIEW_LEN + 1);
        assert!(generated.key_preview.ends_with('…'));
        assert!(generated.key.starts_with(generated.key_preview.trim_end_matches('…')));
    }

    #[test]
    fn key_charset_is_base64url_safe() {
        let generated = generate(None, "ak");
        let material = generated.key.split_once('_').unwrap().1;
        assert!(material.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
    }
}

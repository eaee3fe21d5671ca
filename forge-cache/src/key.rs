//! Deterministic cache keys

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A content-addressed cache key: hex-encoded SHA-256 over the inputs that
/// determine the cached value, with a layer prefix so the three layers can
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    fn derive(layer: &str, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(layer.as_bytes());
        for part in parts {
            // Length-prefix each part so ("ab","c") != ("a","bc").
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(format!("{layer}:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Segment-level key: identical content for the same model resolves to the
/// same sanitized result.
pub fn segment_key(content: &str, model: &str) -> CacheKey {
    CacheKey::derive("seg", &[content, model])
}

/// Prefix-level key over the ordered ids (or contents) of a static head.
pub fn prefix_key(parts: &[String], model: &str, policy_version: &str) -> CacheKey {
    let mut inputs: Vec<&str> = parts.iter().map(String::as_str).collect();
    inputs.push(model);
    inputs.push(policy_version);
    CacheKey::derive("pre", &inputs)
}

/// Package-level key over the serialized build inputs. Changing only the
/// model invalidates; use the model-agnostic variant to opt out.
pub fn package_key(inputs_json: &str, model: &str, policy_version: &str) -> CacheKey {
    CacheKey::derive("pkg", &[inputs_json, model, policy_version])
}

/// Package key that deliberately ignores the model id.
pub fn package_key_model_agnostic(inputs_json: &str, policy_version: &str) -> CacheKey {
    CacheKey::derive("pkg", &[inputs_json, policy_version])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_inputs_same_key() {
        assert_eq!(segment_key("abc", "gpt-4o"), segment_key("abc", "gpt-4o"));
    }

    #[test]
    fn test_model_changes_key() {
        assert_ne!(segment_key("abc", "gpt-4o"), segment_key("abc", "claude-3"));
    }

    #[test]
    fn test_layers_never_collide() {
        let a = segment_key("x", "m");
        let b = package_key("x", "m", "");
        assert_ne!(a, b);
    }

    #[test]
    fn test_part_boundaries_matter() {
        assert_ne!(segment_key("ab", "c"), segment_key("a", "bc"));
    }

    #[test]
    fn test_prefix_key_order_sensitive() {
        let forward = prefix_key(&["a".into(), "b".into()], "m", "v1");
        let reverse = prefix_key(&["b".into(), "a".into()], "m", "v1");
        assert_ne!(forward, reverse);
    }

    #[test]
    fn test_policy_version_invalidates_package() {
        assert_ne!(
            package_key("{}", "m", "v1"),
            package_key("{}", "m", "v2")
        );
    }

    #[test]
    fn test_model_agnostic_key_ignores_model() {
        let a = package_key("{}", "gpt-4o", "v1");
        let b = package_key("{}", "claude-3", "v1");
        assert_ne!(a, b);
        assert_eq!(
            package_key_model_agnostic("{}", "v1"),
            package_key_model_agnostic("{}", "v1")
        );
    }
}

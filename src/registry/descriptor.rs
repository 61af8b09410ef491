//! Descriptor: the identity of one logical component instance.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::CanonicalConfig;

/// `(type_name, canonical config)`.
///
/// Two requests map to the same descriptor iff the type names match and the
/// configs are canonically equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    type_name: Arc<str>,
    config: CanonicalConfig,
}

impl Descriptor {
    pub fn new(type_name: impl Into<Arc<str>>, config: CanonicalConfig) -> Self {
        Self { type_name: type_name.into(), config }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn config(&self) -> &CanonicalConfig {
        &self.config
    }

    /// Full hex SHA-256 over the type name and canonical config.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.type_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.config.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Short stable key for logs and status output.
    pub fn key(&self) -> String {
        let mut digest = self.digest();
        digest.truncate(16);
        digest
    }

    /// The config handed to listeners: the canonical config with its
    /// `@type` annotation restored.
    pub fn to_config(&self) -> CanonicalConfig {
        let mut value = self.config.value().clone();
        match &mut value {
            Value::Object(members) => {
                members.insert("@type".into(), Value::String(self.type_name.to_string()));
            }
            other => {
                *other = serde_json::json!({ "@type": self.type_name.as_ref(), "value": other.clone() });
            }
        }
        CanonicalConfig::canonicalize(&value)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({} {})", self.type_name, self.config)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.key())
    }
}

impl Serialize for Descriptor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Descriptor", 3)?;
        s.serialize_field("type", self.type_name.as_ref())?;
        s.serialize_field("key", &self.key())?;
        s.serialize_field("config", &self.config)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_type_and_config_are_equal() {
        let a = Descriptor::new("gps", CanonicalConfig::canonicalize(&json!({"a": 1, "b": 2.0})));
        let b = Descriptor::new("gps", CanonicalConfig::canonicalize(&json!({"b": 2, "a": 1})));
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 16);
    }

    #[test]
    fn type_name_participates_in_identity() {
        let cfg = CanonicalConfig::empty();
        let a = Descriptor::new("gps", cfg.clone());
        let b = Descriptor::new("wifi", cfg);
        assert_ne!(a, b);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn to_config_restores_type_annotation() {
        let d = Descriptor::new("gps", CanonicalConfig::canonicalize(&json!({"rate": 5})));
        assert_eq!(d.to_config().as_str(), r#"{"@type":"gps","rate":5}"#);
    }
}

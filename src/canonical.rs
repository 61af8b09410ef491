//! Canonical configuration values: structural identity for JSON-like config.
//!
//! Configs reach the daemon from several sources (persisted store, packaged
//! defaults, remote updates) with different key order and number spelling.
//! [`CanonicalConfig`] rewrites a value into one normal form so that two
//! structurally identical configs always serialize to the same string:
//!
//! - object members are sorted ascending by key,
//! - integral numbers are written as integers (`1.0`, `1e0` and `1` agree,
//!   `-0.0` becomes `0`), other numbers use the shortest round-trip decimal,
//! - array order is preserved.
//!
//! Equality and hashing are defined over the canonical string, which is
//! computed once at construction.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::error::CoreError;

/// Prefix that marks annotation keys (`@type`, `@schedule`) in submitted configs.
pub const ANNOTATION_PREFIX: char = '@';

/// Immutable, normalized JSON-like value.
///
/// Cheap to clone; the tree and its serialized form are shared.
#[derive(Clone)]
pub struct CanonicalConfig {
    value: Arc<Value>,
    text: Arc<str>,
}

impl CanonicalConfig {
    /// Normalize `value` into canonical form.
    pub fn canonicalize(value: &Value) -> Self {
        let value = normalize(value);
        // serde_json cannot fail on a `Value` whose numbers are all finite,
        // which `normalize` guarantees.
        let text = serde_json::to_string(&value).unwrap_or_default();
        Self {
            value: Arc::new(value),
            text: Arc::from(text),
        }
    }

    /// Parse JSON text and canonicalize it.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CoreError::config(format!("malformed JSON: {e}")))?;
        Ok(Self::canonicalize(&value))
    }

    /// An empty object.
    pub fn empty() -> Self {
        Self::canonicalize(&Value::Object(Map::new()))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The canonical serialized form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Look up a top-level member of an object config.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }
}

impl PartialEq for CanonicalConfig {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for CanonicalConfig {}

impl Hash for CanonicalConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl fmt::Debug for CanonicalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanonicalConfig({})", self.text)
    }
}

impl fmt::Display for CanonicalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<Value> for CanonicalConfig {
    fn from(value: Value) -> Self {
        Self::canonicalize(&value)
    }
}

impl Serialize for CanonicalConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CanonicalConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::canonicalize(&value))
    }
}

// ── Normalization ────────────────────────────────────────────────────────────

fn normalize(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => value.clone(),
        Value::Number(n) => Value::Number(normalize_number(n)),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(members) => {
            let mut keys: Vec<&String> = members.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), normalize(&members[key]));
            }
            Value::Object(out)
        }
    }
}

/// 2^63 as f64: the first integral float outside `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
/// 2^64 as f64: the first integral float outside `u64`.
const U64_BOUND: f64 = 18_446_744_073_709_551_616.0;

fn normalize_number(n: &Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n.clone();
    }
    let Some(f) = n.as_f64() else {
        return n.clone();
    };
    if f.is_finite() && f.fract() == 0.0 {
        if (-I64_BOUND..I64_BOUND).contains(&f) {
            return Number::from(f as i64);
        }
        if (0.0..U64_BOUND).contains(&f) {
            return Number::from(f as u64);
        }
    }
    Number::from_f64(f).unwrap_or_else(|| n.clone())
}

// ── Overlay ──────────────────────────────────────────────────────────────────

/// Deep-merge `overrides` on top of `defaults`.
///
/// Objects merge member by member; any other value in `overrides` replaces
/// the default wholesale. A `null` override is kept (it is an explicit value).
pub fn overlay(defaults: &Value, overrides: &Value) -> Value {
    match (defaults, overrides) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, ov) in over {
                let value = match base.get(key) {
                    Some(bv) => overlay(bv, ov),
                    None => ov.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (_, over) => over.clone(),
    }
}

/// Remove top-level annotation members (`@type`, `@schedule`, …).
///
/// Annotations steer how a request is handled but are not part of the
/// component's identity.
pub fn without_annotations(value: &Value) -> Value {
    match value {
        Value::Object(members) => Value::Object(
            members
                .iter()
                .filter(|(k, _)| !k.starts_with(ANNOTATION_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn key_order_does_not_matter() {
        let a = CanonicalConfig::parse(r#"{"b": 1, "a": {"y": true, "x": null}}"#).unwrap();
        let b = CanonicalConfig::parse(r#"{"a": {"x": null, "y": true}, "b": 1}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"a":{"x":null,"y":true},"b":1}"#);
    }

    #[test]
    fn numeric_spelling_does_not_matter() {
        let a = CanonicalConfig::parse(r#"{"rate": 1.0, "gain": 0.50, "n": 1e2}"#).unwrap();
        let b = CanonicalConfig::parse(r#"{"n": 100, "gain": 5e-1, "rate": 1}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"gain":0.5,"n":100,"rate":1}"#);
    }

    #[test]
    fn negative_zero_is_zero() {
        let a = CanonicalConfig::canonicalize(&json!(-0.0));
        assert_eq!(a.as_str(), "0");
    }

    #[test]
    fn array_order_is_preserved() {
        let a = CanonicalConfig::canonicalize(&json!([3, 1, 2]));
        let b = CanonicalConfig::canonicalize(&json!([1, 2, 3]));
        assert_ne!(a, b);
    }

    #[test]
    fn equal_configs_hash_equal() {
        let mut set = HashSet::new();
        set.insert(CanonicalConfig::canonicalize(&json!({"a": 1, "b": [1.0, {"z": 0, "c": 2}]})));
        set.insert(CanonicalConfig::canonicalize(&json!({"b": [1, {"c": 2.0, "z": 0}], "a": 1.0})));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn round_trip_through_text_is_stable() {
        let inputs = [
            json!(null),
            json!({"k": [1.25, -3, {"deep": {"b": "s", "a": false}}], "e": {}}),
            json!([[], {}, "", 0.1, 18446744073709551615u64, -9223372036854775808i64]),
            json!({"big": 1e300, "tiny": 1e-300}),
        ];
        for x in inputs {
            let c = CanonicalConfig::canonicalize(&x);
            let again = CanonicalConfig::parse(&serde_json::to_string(&c).unwrap()).unwrap();
            assert_eq!(again, c, "round trip changed {x}");
            assert_eq!(again.as_str(), c.as_str());
        }
    }

    #[test]
    fn deserialize_canonicalizes() {
        let c: CanonicalConfig = serde_json::from_str(r#"{"z": 2.0, "a": 1}"#).unwrap();
        assert_eq!(c.as_str(), r#"{"a":1,"z":2}"#);
    }

    #[test]
    fn malformed_json_is_config_invalid() {
        let err = CanonicalConfig::parse("{not json").unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
    }

    #[test]
    fn overlay_override_wins_and_defaults_fill_gaps() {
        let defaults = json!({"rate": 10, "filter": {"low": 1, "high": 5}, "mode": "fast"});
        let overrides = json!({"rate": 20, "filter": {"high": 9}});
        let merged = overlay(&defaults, &overrides);
        assert_eq!(
            merged,
            json!({"rate": 20, "filter": {"low": 1, "high": 9}, "mode": "fast"})
        );
    }

    #[test]
    fn overlay_before_canonicalize_makes_omitted_defaults_equal() {
        let defaults = json!({"rate": 10, "mode": "fast"});
        let explicit = overlay(&defaults, &json!({"rate": 10.0, "mode": "fast"}));
        let omitted = overlay(&defaults, &json!({}));
        assert_eq!(
            CanonicalConfig::canonicalize(&explicit),
            CanonicalConfig::canonicalize(&omitted)
        );
    }

    #[test]
    fn annotations_are_stripped_at_top_level_only() {
        let v = json!({"@type": "gps", "@schedule": {"interval": 5}, "inner": {"@type": "wifi"}});
        assert_eq!(without_annotations(&v), json!({"inner": {"@type": "wifi"}}));
    }
}

//! Property value model.
//!
//! Property values are a small sum type rather than raw JSON so that the
//! decoder, the GraphSON writer and the traversal builder all agree on
//! number semantics: JSON numbers decode preferentially to `i64`, then to
//! `f64`.

use std::collections::BTreeMap;

use serde_json::Value as Json;

/// A decoded property value: scalar, list or map.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropValue>),
    Map(BTreeMap<String, PropValue>),
}

impl PropValue {
    /// True for `Null`, used to drop null edge properties at write time.
    pub fn is_null(&self) -> bool {
        matches!(self, PropValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Navigate into a nested map value.
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        match self {
            PropValue::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Plain JSON rendering, used for traversal bindings.
    pub fn to_json(&self) -> Json {
        match self {
            PropValue::Null => Json::Null,
            PropValue::Bool(b) => Json::Bool(*b),
            PropValue::Int(n) => Json::from(*n),
            PropValue::Float(f) => {
                serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null)
            }
            PropValue::String(s) => Json::String(s.clone()),
            PropValue::List(items) => Json::Array(items.iter().map(PropValue::to_json).collect()),
            PropValue::Map(m) => {
                Json::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

impl From<&Json> for PropValue {
    fn from(value: &Json) -> Self {
        match value {
            Json::Null => PropValue::Null,
            Json::Bool(b) => PropValue::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    PropValue::Float(f)
                } else {
                    PropValue::String(n.to_string())
                }
            }
            Json::String(s) => PropValue::String(s.clone()),
            Json::Array(items) => PropValue::List(items.iter().map(PropValue::from).collect()),
            Json::Object(m) => {
                PropValue::Map(m.iter().map(|(k, v)| (k.clone(), PropValue::from(v))).collect())
            }
        }
    }
}

impl From<Json> for PropValue {
    fn from(value: Json) -> Self {
        PropValue::from(&value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::String(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::String(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl<T: Into<PropValue>> From<Vec<T>> for PropValue {
    fn from(value: Vec<T>) -> Self {
        PropValue::List(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_prefer_int64() {
        assert_eq!(PropValue::from(json!(12)), PropValue::Int(12));
        assert_eq!(PropValue::from(json!(-3)), PropValue::Int(-3));
        assert_eq!(PropValue::from(json!(3.5)), PropValue::Float(3.5));
        // Larger than i64 falls back to float.
        assert_eq!(
            PropValue::from(json!(18446744073709551615u64)),
            PropValue::Float(18446744073709551615.0)
        );
    }

    #[test]
    fn nested_structures_recurse() {
        let v = PropValue::from(json!({"a": [1, "x"], "b": {"c": true}}));
        assert_eq!(v.get("a"), Some(&PropValue::List(vec![PropValue::Int(1), "x".into()])));
        assert_eq!(v.get("b").and_then(|b| b.get("c")), Some(&PropValue::Bool(true)));
    }

    #[test]
    fn to_json_round_trips() {
        let j = json!({"x": [1, 2.5, "s", false, null]});
        assert_eq!(PropValue::from(&j).to_json(), j);
    }
}

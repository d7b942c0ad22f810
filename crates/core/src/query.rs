use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute mapping describing what a consumer wants from a collection:
/// filters, sort order and pagination parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Map<String, Value>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copy of this query without the named fields.
    pub fn without<S: AsRef<str>>(&self, fields: &[S]) -> Query {
        let mut out = self.clone();
        for field in fields {
            out.0.remove(field.as_ref());
        }
        out
    }

    /// Overlay `other` on top of this query; fields in `other` win.
    pub fn merge(&mut self, other: &Query) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Deep structural equality once the `ignore` fields are removed from both sides.
    pub fn is_equivalent<S: AsRef<str>>(&self, other: &Query, ignore: &[S]) -> bool {
        self.without(ignore) == other.without(ignore)
    }

    /// Flatten into URL query pairs. Nulls are skipped, arrays become
    /// comma-separated lists and nested objects are sent as JSON.
    pub fn to_params(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .filter_map(|(key, value)| param_value(value).map(|v| (key.clone(), v)))
            .collect()
    }
}

fn param_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(param_value)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

impl From<Map<String, Value>> for Query {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

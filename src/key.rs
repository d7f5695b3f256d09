use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An ordered, JSON-serializable sequence identifying a query.
///
/// The key serves double duty: its canonical hash is the cache identity, and
/// its elements are hierarchical-match material for invalidation filters
/// (`["todos"]` matches `["todos", 1]`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(pub Vec<Value>);

impl QueryKey {
    /// Build a key from any serializable parts.
    ///
    /// ```
    /// use async_query::QueryKey;
    ///
    /// let key = QueryKey::new(("todos", 1));
    /// assert_eq!(key.0.len(), 2);
    /// ```
    pub fn new(parts: impl IntoQueryKey) -> Self {
        parts.into_query_key()
    }

    /// Whether `self` is a prefix of `other`, element for element.
    /// Every key is a prefix of itself.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// Canonical hash for this key. See [`hash_query_key`].
    pub fn hash(&self) -> QueryHash {
        hash_query_key(self)
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash().0)
    }
}

/// Canonical string identity of a [`QueryKey`].
///
/// Two keys whose content is equal up to object-key ordering hash to the same
/// string, so the hash is the cache identity rather than value identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(pub String);

impl std::fmt::Display for QueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default key hasher: recursively sorts object keys, then serializes the key
/// to compact JSON. A pure function of key content.
pub fn hash_query_key(key: &QueryKey) -> QueryHash {
    let canonical: Vec<Value> = key.0.iter().map(canonicalize).collect();
    let hash = serde_json::to_string(&Value::Array(canonical))
        .expect("query key is always serializable");
    QueryHash(hash)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Conversion into a [`QueryKey`].
///
/// Implemented for tuples of serializable parts and for plain vectors of
/// values, so call sites can write `QueryKey::new(("todos", 1))`.
pub trait IntoQueryKey {
    /// Perform the conversion.
    fn into_query_key(self) -> QueryKey;
}

impl IntoQueryKey for QueryKey {
    fn into_query_key(self) -> QueryKey {
        self
    }
}

impl IntoQueryKey for Vec<Value> {
    fn into_query_key(self) -> QueryKey {
        QueryKey(self)
    }
}

fn part<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).expect("query key part is always serializable")
}

impl<A: Serialize> IntoQueryKey for (A,) {
    fn into_query_key(self) -> QueryKey {
        QueryKey(vec![part(self.0)])
    }
}

impl<A: Serialize, B: Serialize> IntoQueryKey for (A, B) {
    fn into_query_key(self) -> QueryKey {
        QueryKey(vec![part(self.0), part(self.1)])
    }
}

impl<A: Serialize, B: Serialize, C: Serialize> IntoQueryKey for (A, B, C) {
    fn into_query_key(self) -> QueryKey {
        QueryKey(vec![part(self.0), part(self.1), part(self.2)])
    }
}

impl IntoQueryKey for &str {
    fn into_query_key(self) -> QueryKey {
        QueryKey(vec![part(self)])
    }
}

impl IntoQueryKey for String {
    fn into_query_key(self) -> QueryKey {
        QueryKey(vec![part(self)])
    }
}

//! Document model for entity descriptions.
//!
//! An entity description is persisted as one or more documents. A document is
//! a flat map from string keys to JSON values. Keys starting with `_` belong
//! to the document database (`_id`, `_rev`, `_deleted`), keys starting with
//! `@` carry registry metadata (`@id`, `@owner`, `@context`), and every other
//! key is a data property holding a single literal or an ordered sequence of
//! literals.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Document key holding the entity name.
pub const ID_KEY: &str = "@id";
/// Document key holding the host URN of the authoring node.
pub const OWNER_KEY: &str = "@owner";
/// Document key holding the per-property type map.
pub const CONTEXT_KEY: &str = "@context";
/// Key of the type tag inside a `@context` entry.
pub const TYPE_KEY: &str = "@type";

/// Database-internal document id key.
pub const DOC_ID_KEY: &str = "_id";
/// Database-internal revision key.
pub const DOC_REV_KEY: &str = "_rev";
/// Database-internal deletion marker.
pub const DOC_DELETED_KEY: &str = "_deleted";

/// Type tag for hex-encoded binary literals.
pub const HEX_BINARY_TAG: &str = "xsd:hexBinary";

/// Errors from document-level property edits.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    /// The key is reserved for the database or the registry and cannot carry
    /// property data.
    #[error("key `{0}` is reserved and cannot be used as a property")]
    ReservedKey(String),
}

/// Returns true for keys the model never treats as property data.
pub fn is_reserved(key: &str) -> bool {
    matches!(key.as_bytes().first(), Some(b'_') | Some(b'@'))
}

/// A typed literal value as seen by callers of the registry.
///
/// Strings, numbers and booleans pass through the document encoding
/// untouched. Binary payloads are stored hex-encoded and tagged
/// [`HEX_BINARY_TAG`] in the document's `@context`.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A string or URI value.
    Str(String),
    /// An integer value.
    Int(i64),
    /// A floating point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
    /// A binary payload.
    Bytes(Vec<u8>),
}

impl Literal {
    /// Encode into the stored representation and an optional type tag.
    pub fn encode(&self) -> (Value, Option<&'static str>) {
        match self {
            Literal::Str(s) => (Value::String(s.clone()), None),
            Literal::Int(i) => (json!(i), None),
            Literal::Float(f) => (json!(f), None),
            Literal::Bool(b) => (Value::Bool(*b), None),
            Literal::Bytes(b) => (Value::String(hex::encode(b)), Some(HEX_BINARY_TAG)),
        }
    }

    /// Decode a stored value under an optional type tag.
    ///
    /// Unknown tags pass the stored value through unchanged.
    pub fn decode(value: &Value, tag: Option<&str>) -> Literal {
        if tag == Some(HEX_BINARY_TAG) {
            if let Some(s) = value.as_str() {
                if let Ok(bytes) = hex::decode(s) {
                    return Literal::Bytes(bytes);
                }
            }
        }
        match value {
            Value::String(s) => Literal::Str(s.clone()),
            Value::Bool(b) => Literal::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Literal::Int(i)
                } else {
                    Literal::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            other => Literal::Str(other.to_string()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "{s}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Bytes(b) => write!(f, "{}", hex::encode(b)),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Str(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::Str(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<Vec<u8>> for Literal {
    fn from(value: Vec<u8>) -> Self {
        Literal::Bytes(value)
    }
}

/// A single persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document describing `entity`, without an owner yet.
    pub fn for_entity(entity: &str) -> Self {
        let mut map = Map::new();
        map.insert(ID_KEY.to_string(), Value::String(entity.to_string()));
        Document(map)
    }

    /// The entity name carried in `@id`, if any.
    pub fn entity(&self) -> Option<&str> {
        self.0.get(ID_KEY).and_then(Value::as_str)
    }

    /// The database document id, if assigned.
    pub fn doc_id(&self) -> Option<&str> {
        self.0.get(DOC_ID_KEY).and_then(Value::as_str)
    }

    /// Assign the database document id.
    pub fn set_doc_id(&mut self, id: impl Into<String>) {
        self.0.insert(DOC_ID_KEY.to_string(), Value::String(id.into()));
    }

    /// The revision token, if the document has been stored.
    pub fn rev(&self) -> Option<&str> {
        self.0.get(DOC_REV_KEY).and_then(Value::as_str)
    }

    /// Replace the revision token.
    pub fn set_rev(&mut self, rev: impl Into<String>) {
        self.0.insert(DOC_REV_KEY.to_string(), Value::String(rev.into()));
    }

    /// Drop the revision token, e.g. before saving into a different database.
    pub fn clear_rev(&mut self) {
        self.0.remove(DOC_REV_KEY);
    }

    /// The host URN of the authoring node, if stamped.
    pub fn owner(&self) -> Option<&str> {
        self.0.get(OWNER_KEY).and_then(Value::as_str)
    }

    /// Stamp the authoring node. Callers must not rewrite an existing owner.
    pub fn set_owner(&mut self, urn: impl Into<String>) {
        self.0.insert(OWNER_KEY.to_string(), Value::String(urn.into()));
    }

    /// Whether this document is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.0
            .get(DOC_DELETED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Build a tombstone for this document.
    ///
    /// The tombstone keeps `_id`, `_rev`, `@id` and `@owner` so that filtered
    /// replications still see enough of the document to propagate the
    /// deletion.
    pub fn tombstone(&self) -> Document {
        let mut map = Map::new();
        for key in [DOC_ID_KEY, DOC_REV_KEY, ID_KEY, OWNER_KEY] {
            if let Some(v) = self.0.get(key) {
                map.insert(key.to_string(), v.clone());
            }
        }
        map.insert(DOC_DELETED_KEY.to_string(), Value::Bool(true));
        Document(map)
    }

    /// Raw access to a key, reserved or not.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a raw key/value pair. Property edits should go through
    /// [`Document::add_property`] instead.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Iterate over the data properties, skipping reserved keys.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0
            .iter()
            .filter(|(k, _)| !is_reserved(k))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// The stored values of a property, sequences unrolled.
    pub fn values_of(&self, prop: &str) -> Vec<&Value> {
        if is_reserved(prop) {
            return Vec::new();
        }
        match self.0.get(prop) {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(single) => vec![single],
        }
    }

    /// The type tag recorded for a property in `@context`, if any.
    pub fn context_tag(&self, prop: &str) -> Option<&str> {
        self.0
            .get(CONTEXT_KEY)?
            .get(prop)?
            .get(TYPE_KEY)?
            .as_str()
    }

    /// Add a value to a property.
    ///
    /// An absent property stores the value as a scalar; a scalar is promoted
    /// to a two-element sequence; a sequence is appended to. Duplicates are
    /// permitted at the document level.
    pub fn add_property(&mut self, prop: &str, value: &Literal) -> Result<(), ModelError> {
        if is_reserved(prop) {
            return Err(ModelError::ReservedKey(prop.to_string()));
        }
        let (encoded, tag) = value.encode();
        if let Some(tag) = tag {
            self.set_context_tag(prop, tag);
        }
        match self.0.get_mut(prop) {
            None => {
                self.0.insert(prop.to_string(), encoded);
            }
            Some(Value::Array(items)) => items.push(encoded),
            Some(existing) => {
                let old = existing.take();
                *existing = Value::Array(vec![old, encoded]);
            }
        }
        Ok(())
    }

    /// Delete a property, or a single value of it.
    ///
    /// Without `value` the whole key is removed. With `value`, matching
    /// elements are removed; a sequence collapsing to one element is
    /// flattened back to a scalar, and an emptied sequence removes the key.
    /// Deleting an absent value is a no-op.
    pub fn delete_property(
        &mut self,
        prop: &str,
        value: Option<&Literal>,
    ) -> Result<(), ModelError> {
        if is_reserved(prop) {
            return Err(ModelError::ReservedKey(prop.to_string()));
        }
        let Some(value) = value else {
            self.0.remove(prop);
            self.clear_context_tag(prop);
            return Ok(());
        };
        let (encoded, _) = value.encode();
        let remove_key = match self.0.get_mut(prop) {
            None => false,
            Some(Value::Array(items)) => {
                items.retain(|v| *v != encoded);
                match items.len() {
                    0 => true,
                    1 => {
                        let single = items.remove(0);
                        self.0.insert(prop.to_string(), single);
                        false
                    }
                    _ => false,
                }
            }
            Some(existing) => *existing == encoded,
        };
        if remove_key {
            self.0.remove(prop);
            self.clear_context_tag(prop);
        }
        Ok(())
    }

    /// Project the data properties into `(property, literal)` pairs, decoding
    /// each value per the document's `@context`.
    pub fn tuples(&self) -> Vec<(String, Literal)> {
        let mut out = Vec::new();
        for (prop, _) in self.properties() {
            let tag = self.context_tag(prop);
            for value in self.values_of(prop) {
                out.push((prop.to_string(), Literal::decode(value, tag)));
            }
        }
        out
    }

    fn set_context_tag(&mut self, prop: &str, tag: &str) {
        let context = self
            .0
            .entry(CONTEXT_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = context {
            map.insert(prop.to_string(), json!({ TYPE_KEY: tag }));
        }
    }

    fn clear_context_tag(&mut self, prop: &str) {
        let mut emptied = false;
        if let Some(Value::Object(map)) = self.0.get_mut(CONTEXT_KEY) {
            map.remove(prop);
            emptied = map.is_empty();
        }
        if emptied {
            self.0.remove(CONTEXT_KEY);
        }
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Document(map)
    }
}

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Mutex;

/// An ISO-8601 UTC timestamp whose lexicographic order coincides with its
/// temporal order. This is the unit of last-writer-wins comparison: a field
/// write is accepted iff its timestamp sorts above the stored one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub String);

lazy_static::lazy_static! {
    static ref LAST_NOW: Mutex<Option<DateTime<Utc>>> = Mutex::new(None);
}

impl Timestamp {
    /// The current instant, strictly increasing within this process. Equal
    /// wall-clock readings are nudged forward by a nanosecond so consecutive
    /// calls never collide.
    pub fn now() -> Self {
        let mut last = LAST_NOW.lock().unwrap();
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::nanoseconds(1);
            }
        }
        *last = Some(now);
        Self::from_datetime(now)
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        // Nanosecond precision keeps the width fixed, which keeps the
        // lexicographic comparison aligned with the temporal one.
        Timestamp(at.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Timestamp {
    fn from(raw: &str) -> Self {
        Timestamp(raw.to_owned())
    }
}

/// Per-field metadata stored alongside the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMeta {
    pub timestamp: Timestamp,
}

impl FieldMeta {
    pub fn at(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }
}

/// The value half of a materialized field: a scalar, one included record, or
/// an ordered list of included records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaterializedNode {
    Record(MaterializedValue),
    Records(Vec<MaterializedValue>),
    Scalar(JsonValue),
}

impl MaterializedNode {
    pub fn as_scalar(&self) -> Option<&JsonValue> {
        match self {
            MaterializedNode::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn infer_plain(&self) -> JsonValue {
        match self {
            MaterializedNode::Scalar(value) => value.clone(),
            MaterializedNode::Record(record) => record.infer_plain(),
            MaterializedNode::Records(records) => {
                JsonValue::Array(records.iter().map(|r| r.infer_plain()).collect())
            }
        }
    }
}

/// One field of a materialized value: `{ "value": V, "_meta": { "timestamp": T } }`
/// on the wire. The bare id field carries no meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedField {
    pub value: MaterializedNode,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FieldMeta>,
}

impl MaterializedField {
    pub fn scalar(value: JsonValue, meta: Option<FieldMeta>) -> Self {
        Self {
            value: MaterializedNode::Scalar(value),
            meta,
        }
    }

    pub fn timestamp(&self) -> Option<&Timestamp> {
        self.meta.as_ref().map(|m| &m.timestamp)
    }
}

/// Canonical value/meta tree for a row, including nested relations. This is
/// both the wire form and the in-memory form of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterializedValue {
    pub fields: IndexMap<String, MaterializedField>,
}

impl MaterializedValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&MaterializedField> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: &str, value: MaterializedField) {
        self.fields.insert(field.to_owned(), value);
    }

    pub fn set_scalar(&mut self, field: &str, value: JsonValue, meta: Option<FieldMeta>) {
        self.set(field, MaterializedField::scalar(value, meta));
    }

    /// The id field, when present as a scalar string.
    pub fn id(&self) -> Option<&str> {
        self.fields
            .get("id")
            .and_then(|f| f.value.as_scalar())
            .and_then(|v| v.as_str())
    }

    pub fn timestamp_of(&self, field: &str) -> Option<&Timestamp> {
        self.fields.get(field).and_then(|f| f.timestamp())
    }

    /// Projects the tree down to its plain JSON form, dropping all meta.
    pub fn infer_plain(&self) -> JsonValue {
        let mut out = serde_json::Map::new();
        for (name, field) in &self.fields {
            out.insert(name.clone(), field.value.infer_plain());
        }
        JsonValue::Object(out)
    }

    /// Builds a materialized value from a plain JSON object, stamping every
    /// non-id field with `timestamp`. Used by speculative client writes where
    /// a single instant covers the whole payload.
    pub fn from_plain(plain: &JsonValue, timestamp: &Timestamp) -> Self {
        let mut out = MaterializedValue::new();
        if let JsonValue::Object(fields) = plain {
            for (name, value) in fields {
                let meta = if name == "id" {
                    None
                } else {
                    Some(FieldMeta::at(timestamp.clone()))
                };
                out.set_scalar(name, value.clone(), meta);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MaterializedField)> {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_now_is_strictly_increasing() {
        let mut prev = Timestamp::now();
        for _ in 0..1000 {
            let next = Timestamp::now();
            assert!(next > prev, "{next} should sort after {prev}");
            prev = next;
        }
    }

    #[test]
    fn test_wire_shape() {
        let mut value = MaterializedValue::new();
        value.set_scalar("id", json!("u1"), None);
        value.set_scalar("name", json!("Jane"), Some(FieldMeta::at("2".into())));

        let wire = serde_json::to_value(&value).unwrap();
        assert_eq!(
            wire,
            json!({
                "id": {"value": "u1"},
                "name": {"value": "Jane", "_meta": {"timestamp": "2"}},
            })
        );

        let back: MaterializedValue = serde_json::from_value(wire).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_infer_plain_recurses_into_relations() {
        let mut author = MaterializedValue::new();
        author.set_scalar("id", json!("u1"), None);
        author.set_scalar("name", json!("John"), Some(FieldMeta::at("1".into())));

        let mut post = MaterializedValue::new();
        post.set_scalar("id", json!("p1"), None);
        post.set(
            "author",
            MaterializedField {
                value: MaterializedNode::Record(author),
                meta: None,
            },
        );

        assert_eq!(
            post.infer_plain(),
            json!({"id": "p1", "author": {"id": "u1", "name": "John"}})
        );
    }

    #[test]
    fn test_from_plain_skips_meta_on_id() {
        let t = Timestamp::from("3");
        let value = MaterializedValue::from_plain(&json!({"id": "x", "rank": 7}), &t);
        assert!(value.get("id").unwrap().meta.is_none());
        assert_eq!(value.timestamp_of("rank"), Some(&t));
    }
}

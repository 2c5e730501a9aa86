use crate::predicate::Predicate;
use crate::schema::{EntityName, Schema};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A tree paralleling the schema's relations: a leaf (`true` on the wire)
/// includes the relation with no further descent, an interior node descends.
/// Includes shape the projection only; they never affect which rows match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Include {
    pub relations: BTreeMap<String, IncludeChild>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncludeChild {
    Leaf(bool),
    Nested(Include),
}

impl IncludeChild {
    /// The descent below this child; a leaf descends no further.
    pub fn nested(&self) -> Include {
        match self {
            IncludeChild::Leaf(_) => Include::default(),
            IncludeChild::Nested(include) => include.clone(),
        }
    }
}

impl Include {
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn contains(&self, relation: &str) -> bool {
        self.relations.contains_key(relation)
    }

    pub fn leaf(relation: &str) -> Self {
        let mut include = Include::default();
        include
            .relations
            .insert(relation.to_owned(), IncludeChild::Leaf(true));
        include
    }

    /// Returns the nested include under `relation`, inserting a node if the
    /// relation was absent or a bare leaf.
    pub fn child_mut(&mut self, relation: &str) -> &mut Include {
        let child = self
            .relations
            .entry(relation.to_owned())
            .or_insert_with(|| IncludeChild::Nested(Include::default()));
        if let IncludeChild::Leaf(_) = child {
            *child = IncludeChild::Nested(Include::default());
        }
        match child {
            IncludeChild::Nested(include) => include,
            IncludeChild::Leaf(_) => unreachable!(),
        }
    }

    /// Union of two include trees.
    pub fn merge(&mut self, other: &Include) {
        for (name, child) in &other.relations {
            let nested = child.nested();
            if nested.is_empty() {
                self.relations
                    .entry(name.clone())
                    .or_insert(IncludeChild::Leaf(true));
            } else {
                self.child_mut(name).merge(&nested);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, Include)> + '_ {
        self.relations.iter().map(|(name, child)| (name, child.nested()))
    }
}

/// A sort key: `field` plus direction, applied only at the outermost query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

/// A query as it arrives on the wire. The `where` clause stays raw JSON here;
/// parsing it needs the schema to tell fields from relations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuery {
    pub resource: EntityName,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Include::is_empty")]
    pub include: Include,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<crate::value::Timestamp>,
}

impl RawQuery {
    pub fn resource(resource: &str) -> Self {
        RawQuery {
            resource: EntityName::from(resource),
            ..Default::default()
        }
    }

    pub fn with_where(mut self, where_: JsonValue) -> Self {
        self.where_ = Some(where_);
        self
    }

    pub fn with_include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort(mut self, field: &str, ascending: bool) -> Self {
        self.sort = Some(Sort {
            field: field.to_owned(),
            ascending,
        });
        self
    }

    /// A `find by id` query: `where = {id}`, `limit = 1`.
    pub fn by_id(resource: &EntityName, id: &str, include: Include) -> Self {
        RawQuery {
            resource: resource.clone(),
            where_: Some(json!({ "id": id })),
            include,
            limit: Some(1),
            sort: None,
            last_synced_at: None,
        }
    }

    pub fn parse_where(&self, schema: &Schema) -> Result<Option<Predicate>> {
        match &self.where_ {
            Some(raw) => Ok(Some(Predicate::parse(schema, &self.resource, raw)?)),
            None => Ok(None),
        }
    }

    /// The canonical JSON this query hashes over: explicit operators, sorted
    /// keys, `lastSyncedAt` excluded (a delta watermark does not change which
    /// query this is).
    pub fn canonical_json(&self, schema: &Schema) -> Result<JsonValue> {
        let mut canonical = serde_json::Map::new();
        canonical.insert("resource".to_owned(), json!(self.resource));
        if let Some(predicate) = self.parse_where(schema)? {
            canonical.insert("where".to_owned(), predicate.to_canonical_json());
        }
        if !self.include.is_empty() {
            canonical.insert("include".to_owned(), serde_json::to_value(&self.include)?);
        }
        if let Some(limit) = self.limit {
            canonical.insert("limit".to_owned(), json!(limit));
        }
        if let Some(sort) = &self.sort {
            canonical.insert("sort".to_owned(), serde_json::to_value(sort)?);
        }
        Ok(JsonValue::Object(canonical))
    }

    pub fn hash(&self, schema: &Schema) -> Result<QueryHash> {
        let canonical = self.canonical_json(schema)?;
        Ok(QueryHash::of(&canonical))
    }
}

/// Stable identity of a query: SHA-256 of its canonical JSON, hex-encoded.
/// Equivalent queries collapse onto the same hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(pub String);

impl QueryHash {
    pub fn of(canonical: &JsonValue) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        QueryHash(hex_string(&hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("formatting failed");
    }
    out
}

/// Validates include keys against declared relations. Unknown relations are
/// an error rather than a silent no-op.
pub fn validate_include(schema: &Schema, resource: &EntityName, include: &Include) -> Result<()> {
    for (name, nested) in include.iter() {
        match schema.relation(resource, name) {
            Some(relation) => validate_include(schema, relation.target(), &nested)?,
            None => bail!("entity `{resource}` has no relation `{name}`"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Entity, EntityField, FieldType, Relation};
    use serde_json::json;

    fn schema() -> Schema {
        let mut schema = Schema::new(vec![
            Entity::new(
                "users",
                vec![
                    EntityField::new("id", FieldType::Id),
                    EntityField::new("name", FieldType::String),
                ],
            ),
            Entity::new(
                "posts",
                vec![
                    EntityField::new("id", FieldType::Id),
                    EntityField::new("title", FieldType::String),
                    EntityField::new("authorId", FieldType::Ref("users".into())).nullable(),
                ],
            ),
        ])
        .unwrap();
        schema
            .add_relation("posts", Relation::one("author", "users", "authorId"))
            .unwrap();
        schema
    }

    #[test]
    fn test_include_parses_wire_shape() {
        let include: Include = serde_json::from_value(json!({"author": true})).unwrap();
        assert!(include.contains("author"));
        let nested: Include =
            serde_json::from_value(json!({"author": {"posts": true}})).unwrap();
        let author = nested.relations.get("author").unwrap().nested();
        assert!(author.contains("posts"));
    }

    #[test]
    fn test_hash_is_stable_across_spellings() {
        let s = schema();
        let a = RawQuery::resource("posts").with_where(json!({"title": "T"}));
        let b = RawQuery::resource("posts").with_where(json!({"title": {"$eq": "T"}}));
        assert_eq!(a.hash(&s).unwrap(), b.hash(&s).unwrap());
    }

    #[test]
    fn test_hash_distinguishes_limit_and_sort() {
        let s = schema();
        let base = RawQuery::resource("posts");
        let limited = RawQuery::resource("posts").with_limit(10);
        let sorted = RawQuery::resource("posts").with_sort("title", true);
        assert_ne!(base.hash(&s).unwrap(), limited.hash(&s).unwrap());
        assert_ne!(base.hash(&s).unwrap(), sorted.hash(&s).unwrap());
        assert_ne!(limited.hash(&s).unwrap(), sorted.hash(&s).unwrap());
    }

    #[test]
    fn test_hash_ignores_sync_watermark() {
        let s = schema();
        let a = RawQuery::resource("posts");
        let mut b = RawQuery::resource("posts");
        b.last_synced_at = Some("2024-01-01T00:00:00Z".into());
        assert_eq!(a.hash(&s).unwrap(), b.hash(&s).unwrap());
    }

    #[test]
    fn test_validate_include_rejects_unknown_relation() {
        let s = schema();
        let include = Include::leaf("writer");
        assert!(validate_include(&s, &"posts".into(), &include).is_err());
    }

    #[test]
    fn test_merge_unions_trees() {
        let mut a = Include::leaf("author");
        let b: Include = serde_json::from_value(json!({"author": {"posts": true}})).unwrap();
        a.merge(&b);
        assert!(a.relations.get("author").unwrap().nested().contains("posts"));
    }
}

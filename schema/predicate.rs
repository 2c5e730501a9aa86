use crate::query::Include;
use crate::schema::{EntityName, Relation, Schema};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::cmp::Ordering;
use std::sync::Arc;

/// A predicate over one entity, parsed from the wire `where` grammar.
///
/// Leaves compare a field against a literal; relational nodes descend into a
/// named relation of the entity (existentially across a `many` relation).
/// Sibling keys in the wire grammar combine as AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Cmp(Comparison),
    Rel {
        relation: String,
        inner: Box<Predicate>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub field: String,
    pub op: CmpOp,
    pub value: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CmpOp {
    Eq,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn wire_name(&self) -> &'static str {
        match self {
            CmpOp::Eq => "$eq",
            CmpOp::In => "$in",
            CmpOp::Gt => "$gt",
            CmpOp::Gte => "$gte",
            CmpOp::Lt => "$lt",
            CmpOp::Lte => "$lte",
        }
    }
}

impl Predicate {
    pub fn eq(field: &str, value: JsonValue) -> Self {
        Predicate::Cmp(Comparison {
            field: field.to_owned(),
            op: CmpOp::Eq,
            value,
        })
    }

    pub fn rel(relation: &str, inner: Predicate) -> Self {
        Predicate::Rel {
            relation: relation.to_owned(),
            inner: Box::new(inner),
        }
    }

    /// Parses the wire `where` grammar against a resource of `schema`. Keys
    /// naming a declared relation descend into the relation's target entity;
    /// any other key must name a field.
    pub fn parse(schema: &Schema, resource: &EntityName, raw: &JsonValue) -> Result<Predicate> {
        let object = raw
            .as_object()
            .with_context(|| format!("`where` for `{resource}` must be an object"))?;
        let mut terms = Vec::with_capacity(object.len());
        for (key, value) in object {
            let term = match key.as_str() {
                "$and" => {
                    let items = value
                        .as_array()
                        .context("`$and` takes an array of predicates")?;
                    Predicate::And(
                        items
                            .iter()
                            .map(|item| Predicate::parse(schema, resource, item))
                            .collect::<Result<_>>()?,
                    )
                }
                "$or" => {
                    let items = value
                        .as_array()
                        .context("`$or` takes an array of predicates")?;
                    Predicate::Or(
                        items
                            .iter()
                            .map(|item| Predicate::parse(schema, resource, item))
                            .collect::<Result<_>>()?,
                    )
                }
                key if key.starts_with('$') => bail!("unknown operator `{key}` in `where`"),
                key => {
                    if let Some(relation) = schema.relation(resource, key) {
                        let relation = relation.clone();
                        Predicate::Rel {
                            relation: key.to_owned(),
                            inner: Box::new(Predicate::parse(schema, relation.target(), value)?),
                        }
                    } else {
                        let entity = schema.entity(resource)?;
                        if !entity.has_field(key) {
                            bail!("entity `{resource}` has no field or relation `{key}`");
                        }
                        parse_condition(key, value)?
                    }
                }
            };
            terms.push(term);
        }
        Ok(flatten_and(terms))
    }

    /// True iff the predicate touches no relations and can be evaluated
    /// against a shallow row.
    pub fn is_shallow(&self) -> bool {
        match self {
            Predicate::And(terms) | Predicate::Or(terms) => terms.iter().all(|t| t.is_shallow()),
            Predicate::Not(inner) => inner.is_shallow(),
            Predicate::Cmp(_) => true,
            Predicate::Rel { .. } => false,
        }
    }

    /// True iff the predicate descends (at its top level) into the named
    /// relation. The incremental engine uses this to find standing queries
    /// affected by a change to a related row.
    pub fn references_relation(&self, relation: &str) -> bool {
        match self {
            Predicate::And(terms) | Predicate::Or(terms) => {
                terms.iter().any(|t| t.references_relation(relation))
            }
            Predicate::Not(inner) => inner.references_relation(relation),
            Predicate::Cmp(_) => false,
            Predicate::Rel { relation: name, .. } => name == relation,
        }
    }

    /// The include tree needed to fetch every relation this predicate
    /// descends into.
    pub fn required_include(&self) -> Include {
        let mut include = Include::default();
        self.collect_include(&mut include);
        include
    }

    fn collect_include(&self, into: &mut Include) {
        match self {
            Predicate::And(terms) | Predicate::Or(terms) => {
                for term in terms {
                    term.collect_include(into);
                }
            }
            Predicate::Not(inner) => inner.collect_include(into),
            Predicate::Cmp(_) => {}
            Predicate::Rel { relation, inner } => {
                let child = into.child_mut(relation);
                inner.collect_include(child);
            }
        }
    }

    /// Evaluates the predicate against the plain (meta-free) JSON form of a
    /// record. Related rows are expected under their relation names, the way
    /// an include-shaped fetch materializes them.
    pub fn matches(&self, schema: &Schema, resource: &EntityName, value: &JsonValue) -> bool {
        match self {
            Predicate::And(terms) => terms.iter().all(|t| t.matches(schema, resource, value)),
            // Short-circuits left to right.
            Predicate::Or(terms) => terms.iter().any(|t| t.matches(schema, resource, value)),
            Predicate::Not(inner) => !inner.matches(schema, resource, value),
            Predicate::Cmp(cmp) => {
                let field = value.get(&cmp.field).unwrap_or(&JsonValue::Null);
                cmp.matches(field)
            }
            Predicate::Rel { relation, inner } => {
                let declared: Option<Arc<Relation>> =
                    schema.relation(resource, relation).cloned();
                let declared = match declared {
                    Some(declared) => declared,
                    None => return false,
                };
                match value.get(relation) {
                    // Descent across `many` is existential.
                    Some(JsonValue::Array(rows)) => rows
                        .iter()
                        .any(|row| inner.matches(schema, declared.target(), row)),
                    Some(row @ JsonValue::Object(_)) => {
                        inner.matches(schema, declared.target(), row)
                    }
                    // A null foreign key (or an absent include) matches nothing.
                    _ => false,
                }
            }
        }
    }

    /// Canonical JSON of the wire grammar: operators always explicit,
    /// single-element compounds collapsed, compound members sorted so that
    /// equivalent predicates serialize identically.
    pub fn to_canonical_json(&self) -> JsonValue {
        match self {
            Predicate::And(terms) => compound_json("$and", terms),
            Predicate::Or(terms) => compound_json("$or", terms),
            Predicate::Not(inner) => {
                // `$not` exists only as a leaf operator: rewrap the inner
                // leaf's shape under the same field.
                match inner.to_canonical_json() {
                    JsonValue::Object(fields) if fields.len() == 1 => {
                        let (field, shape) = fields.into_iter().next().unwrap();
                        json!({ field: { "$not": shape } })
                    }
                    other => json!({ "$not": other }),
                }
            }
            Predicate::Cmp(cmp) => {
                json!({ cmp.field.clone(): { cmp.op.wire_name(): cmp.value.clone() } })
            }
            Predicate::Rel { relation, inner } => {
                json!({ relation.clone(): inner.to_canonical_json() })
            }
        }
    }

    /// AND-merges two optional predicates; used to fold a read-authorization
    /// predicate into a request's `where`.
    pub fn and_merge(a: Option<Predicate>, b: Option<Predicate>) -> Option<Predicate> {
        match (a, b) {
            (Some(a), Some(b)) => Some(flatten_and(vec![a, b])),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

fn flatten_and(mut terms: Vec<Predicate>) -> Predicate {
    if terms.len() == 1 {
        return terms.pop().unwrap();
    }
    let mut flat = Vec::with_capacity(terms.len());
    for term in terms {
        match term {
            Predicate::And(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    Predicate::And(flat)
}

fn compound_json(op: &str, terms: &[Predicate]) -> JsonValue {
    if terms.len() == 1 {
        return terms[0].to_canonical_json();
    }
    let mut members: Vec<JsonValue> = terms.iter().map(|t| t.to_canonical_json()).collect();
    members.sort_by_cached_key(|m| m.to_string());
    json!({ op: members })
}

fn parse_condition(field: &str, raw: &JsonValue) -> Result<Predicate> {
    let is_operator_object = raw
        .as_object()
        .map(|obj| obj.keys().any(|k| k.starts_with('$')))
        .unwrap_or(false);
    if !is_operator_object {
        // Shorthand `{field: V}` means `$eq`.
        return Ok(Predicate::eq(field, raw.clone()));
    }

    let object = raw.as_object().unwrap();
    let mut terms = Vec::with_capacity(object.len());
    for (op, operand) in object {
        let term = match op.as_str() {
            "$eq" => Predicate::eq(field, operand.clone()),
            "$not" => Predicate::Not(Box::new(parse_condition(field, operand)?)),
            "$in" => {
                let items = operand
                    .as_array()
                    .with_context(|| format!("`$in` on `{field}` takes an array"))?;
                Predicate::Cmp(Comparison {
                    field: field.to_owned(),
                    op: CmpOp::In,
                    value: JsonValue::Array(items.clone()),
                })
            }
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let op = match op.as_str() {
                    "$gt" => CmpOp::Gt,
                    "$gte" => CmpOp::Gte,
                    "$lt" => CmpOp::Lt,
                    _ => CmpOp::Lte,
                };
                Predicate::Cmp(Comparison {
                    field: field.to_owned(),
                    op,
                    value: operand.clone(),
                })
            }
            other => bail!("unknown operator `{other}` on field `{field}`"),
        };
        terms.push(term);
    }
    Ok(flatten_and(terms))
}

impl Comparison {
    /// Evaluates this comparison against a field value, with SQL-shaped null
    /// semantics: `$eq null` behaves like `IS NULL`, null never satisfies an
    /// ordering operator, and `$in` never matches a null field.
    pub fn matches(&self, field: &JsonValue) -> bool {
        match self.op {
            CmpOp::Eq => json_eq(field, &self.value),
            CmpOp::In => match (&self.value, field) {
                (_, JsonValue::Null) => false,
                (JsonValue::Array(items), field) => items.iter().any(|item| json_eq(field, item)),
                _ => false,
            },
            CmpOp::Gt => json_order(field, &self.value) == Some(Ordering::Greater),
            CmpOp::Gte => matches!(
                json_order(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CmpOp::Lt => json_order(field, &self.value) == Some(Ordering::Less),
            CmpOp::Lte => matches!(
                json_order(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (a, b) => a == b,
    }
}

fn json_order(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
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
                    EntityField::new("age", FieldType::Number).nullable(),
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
            .add_relation("users", Relation::many("posts", "posts", "authorId"))
            .unwrap();
        schema
    }

    fn parse(resource: &str, raw: JsonValue) -> Predicate {
        Predicate::parse(&schema(), &resource.into(), &raw).unwrap()
    }

    #[test]
    fn test_shorthand_means_eq() {
        let p = parse("users", json!({"name": "John"}));
        assert_eq!(p, Predicate::eq("name", json!("John")));
        assert!(p.is_shallow());
    }

    #[test]
    fn test_siblings_combine_as_and() {
        let p = parse("users", json!({"name": "John", "age": {"$gte": 21}}));
        match p {
            Predicate::And(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_relation_key_descends() {
        let p = parse("posts", json!({"author": {"name": "John"}}));
        assert!(!p.is_shallow());
        let include = p.required_include();
        assert!(include.contains("author"));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = Predicate::parse(&schema(), &"users".into(), &json!({"nope": 1}));
        assert!(err.is_err());
    }

    #[test]
    fn test_eval_null_semantics() {
        let s = schema();
        let users = EntityName::from("users");
        let is_null = parse("users", json!({"age": null}));
        assert!(is_null.matches(&s, &users, &json!({"id": "u1", "age": null})));
        assert!(is_null.matches(&s, &users, &json!({"id": "u1"})));
        assert!(!is_null.matches(&s, &users, &json!({"id": "u1", "age": 3})));

        let gt = parse("users", json!({"age": {"$gt": 5}}));
        assert!(!gt.matches(&s, &users, &json!({"id": "u1", "age": null})));
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let s = schema();
        let p = parse("users", json!({"name": {"$in": []}}));
        assert!(!p.matches(&s, &"users".into(), &json!({"name": "John"})));
    }

    #[test]
    fn test_not_negates_inner_shape() {
        let s = schema();
        let p = parse("users", json!({"name": {"$not": {"$in": ["a", "b"]}}}));
        assert!(p.matches(&s, &"users".into(), &json!({"name": "c"})));
        assert!(!p.matches(&s, &"users".into(), &json!({"name": "a"})));
    }

    #[test]
    fn test_many_descent_is_existential() {
        let s = schema();
        let p = parse("users", json!({"posts": {"title": "T"}}));
        let with = json!({"id": "u1", "posts": [{"title": "x"}, {"title": "T"}]});
        let without = json!({"id": "u1", "posts": [{"title": "x"}]});
        let none = json!({"id": "u1", "posts": []});
        assert!(p.matches(&s, &"users".into(), &with));
        assert!(!p.matches(&s, &"users".into(), &without));
        assert!(!p.matches(&s, &"users".into(), &none));
    }

    #[test]
    fn test_one_descent_with_null_fk_is_false() {
        let s = schema();
        let p = parse("posts", json!({"author": {"name": "John"}}));
        assert!(!p.matches(&s, &"posts".into(), &json!({"id": "p1", "author": null})));
    }

    #[test]
    fn test_canonical_json_collapses_shorthand() {
        let a = parse("users", json!({"name": "John"}));
        let b = parse("users", json!({"name": {"$eq": "John"}}));
        assert_eq!(a.to_canonical_json(), b.to_canonical_json());
    }

    #[test]
    fn test_canonical_json_sorts_compound_members() {
        let a = parse("users", json!({"$or": [{"name": "x"}, {"age": 1}]}));
        let b = parse("users", json!({"$or": [{"age": 1}, {"name": "x"}]}));
        assert_eq!(a.to_canonical_json(), b.to_canonical_json());
    }
}

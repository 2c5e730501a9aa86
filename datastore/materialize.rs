use crate::layout::{ColumnRepr, EntityTable, Layout};
use crate::select::SelectPlan;
use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value as JsonValue};
use sqlx::any::AnyRow;
use sqlx::{Row, ValueRef};
use statelink_schema::{
    FieldMeta, Include, MaterializedField, MaterializedNode, MaterializedValue, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Rebuilds materialized values from the rows of a [`SelectPlan`], following
/// the plan's column order contract.
pub fn decode_rows(
    layout: &Layout,
    plan: &SelectPlan,
    rows: &[AnyRow],
) -> Result<Vec<MaterializedValue>> {
    rows.iter().map(|row| decode_row(layout, plan, row)).collect()
}

pub fn decode_row(layout: &Layout, plan: &SelectPlan, row: &AnyRow) -> Result<MaterializedValue> {
    let table = &plan.table;
    let meta_idx = 1 + table.field_cols.len();
    let meta_text: Option<String> = row.try_get(meta_idx)?;
    let meta = parse_meta(meta_text.as_deref())?;

    let mut value = MaterializedValue::new();
    let id: String = row.try_get(0)?;
    value.set_scalar("id", json!(id), None);

    for (i, col) in table.field_cols.values().enumerate() {
        let scalar = decode_scalar(row, 1 + i, &col.repr)
            .with_context(|| format!("failed to decode column `{}`", col.field_name))?;
        let field_meta = meta.get(&col.field_name).cloned().map(FieldMeta::at);
        value.set_scalar(&col.field_name, scalar, field_meta);
    }

    let mut idx = meta_idx + 1;
    for (relation_name, nested) in plan.include.iter() {
        let relation = layout
            .schema
            .relation(&table.entity_name, relation_name)
            .with_context(|| {
                format!(
                    "entity `{}` has no relation `{relation_name}`",
                    table.entity_name
                )
            })?
            .clone();
        let target = layout.entity_table(relation.target())?;
        let text: Option<String> = row.try_get(idx)?;
        let node = match text {
            None if relation.is_many() => MaterializedNode::Records(Vec::new()),
            None => MaterializedNode::Scalar(JsonValue::Null),
            Some(text) => {
                let parsed: JsonValue = serde_json::from_str(&text)
                    .with_context(|| format!("include `{relation_name}` is not valid JSON"))?;
                json_to_node(layout, &target, &nested, parsed)?
            }
        };
        value.set(relation_name, MaterializedField { value: node, meta: None });
        idx += 1;
    }
    Ok(value)
}

fn column_is_null(row: &AnyRow, idx: usize) -> bool {
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

fn decode_scalar(row: &AnyRow, idx: usize, repr: &ColumnRepr) -> Result<JsonValue> {
    if column_is_null(row, idx) {
        return Ok(JsonValue::Null);
    }
    let value = match repr {
        ColumnRepr::StringAsText
        | ColumnRepr::DateAsText
        | ColumnRepr::EnumAsText(_)
        | ColumnRepr::RefAsText(_) => {
            let val: String = row.try_get(idx)?;
            json!(val)
        }
        ColumnRepr::NumberAsDouble => {
            // https://github.com/launchbadge/sqlx/issues/1596
            // sqlx gets confused if the float doesn't have decimal points.
            let val: f64 = row.get_unchecked(idx);
            json!(val)
        }
        ColumnRepr::BooleanAsInt => {
            let val: i32 = row.get_unchecked(idx);
            json!(val != 0)
        }
        ColumnRepr::JsonAsText => {
            let val: String = row.try_get(idx)?;
            serde_json::from_str(&val).context("json column does not hold valid JSON")?
        }
    };
    Ok(value)
}

fn parse_meta(text: Option<&str>) -> Result<HashMap<String, Timestamp>> {
    let mut out = HashMap::new();
    let text = match text {
        Some(text) => text,
        None => return Ok(out),
    };
    let parsed: JsonValue =
        serde_json::from_str(text).context("`_meta` column is not valid JSON")?;
    let object = match parsed {
        JsonValue::Object(object) => object,
        JsonValue::Null => return Ok(out),
        other => bail!("`_meta` column is not a JSON object: {other}"),
    };
    for (field, timestamp) in object {
        match timestamp {
            JsonValue::String(ts) => {
                out.insert(field, Timestamp(ts));
            }
            // A never-written field has a null shadow entry.
            JsonValue::Null => {}
            other => bail!("`_meta` timestamp for `{field}` is not a string: {other}"),
        }
    }
    Ok(out)
}

/// Converts the JSON produced by an include subquery into a materialized
/// node, normalizing per-column representations (0/1 integers back to
/// booleans, embedded JSON text back to documents).
fn json_to_node(
    layout: &Layout,
    table: &Arc<EntityTable>,
    include: &Include,
    json: JsonValue,
) -> Result<MaterializedNode> {
    match json {
        JsonValue::Null => Ok(MaterializedNode::Scalar(JsonValue::Null)),
        JsonValue::Array(items) => {
            let records = items
                .into_iter()
                .map(|item| match item {
                    JsonValue::Object(fields) => json_to_record(layout, table, include, fields),
                    other => bail!("expected a JSON object in include array, got {other}"),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(MaterializedNode::Records(records))
        }
        JsonValue::Object(fields) => Ok(MaterializedNode::Record(json_to_record(
            layout, table, include, fields,
        )?)),
        other => bail!("expected a JSON object or array for include, got {other}"),
    }
}

fn json_to_record(
    layout: &Layout,
    table: &Arc<EntityTable>,
    include: &Include,
    mut fields: Map<String, JsonValue>,
) -> Result<MaterializedValue> {
    let meta = match fields.remove("_meta") {
        Some(JsonValue::Object(meta)) => {
            let mut out = HashMap::new();
            for (field, timestamp) in meta {
                if let JsonValue::String(ts) = timestamp {
                    out.insert(field, Timestamp(ts));
                }
            }
            out
        }
        _ => HashMap::new(),
    };

    let mut value = MaterializedValue::new();
    value.set_scalar(
        "id",
        fields.remove("id").unwrap_or(JsonValue::Null),
        None,
    );
    for col in table.field_cols.values() {
        let raw = fields.remove(&col.field_name).unwrap_or(JsonValue::Null);
        let normalized = normalize_json_scalar(&col.repr, raw)?;
        let field_meta = meta.get(&col.field_name).cloned().map(FieldMeta::at);
        value.set_scalar(&col.field_name, normalized, field_meta);
    }

    for (relation_name, nested) in include.iter() {
        let relation = layout
            .schema
            .relation(&table.entity_name, relation_name)
            .with_context(|| {
                format!(
                    "entity `{}` has no relation `{relation_name}`",
                    table.entity_name
                )
            })?
            .clone();
        let target = layout.entity_table(relation.target())?;
        let raw = fields.remove(relation_name).unwrap_or(JsonValue::Null);
        let node = match raw {
            JsonValue::Null if relation.is_many() => MaterializedNode::Records(Vec::new()),
            raw => json_to_node(layout, &target, &nested, raw)?,
        };
        value.set(relation_name, MaterializedField { value: node, meta: None });
    }
    Ok(value)
}

fn normalize_json_scalar(repr: &ColumnRepr, raw: JsonValue) -> Result<JsonValue> {
    if raw.is_null() {
        return Ok(raw);
    }
    let normalized = match repr {
        ColumnRepr::BooleanAsInt => match raw {
            JsonValue::Number(n) => json!(n.as_i64().unwrap_or(0) != 0),
            JsonValue::Bool(b) => json!(b),
            other => bail!("boolean column holds {other}"),
        },
        ColumnRepr::JsonAsText => match raw {
            // Dialects without a JSON subtype hand the document back as text.
            JsonValue::String(text) => serde_json::from_str(&text)
                .context("json column does not hold valid JSON")?,
            other => other,
        },
        _ => raw,
    };
    Ok(normalized)
}

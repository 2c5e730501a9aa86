use crate::conn::Kind;
use crate::layout::{ColumnRepr, EntityTable, Layout, Name};
use crate::materialize;
use crate::mutation::{MutationOp, RecordMutation};
use crate::select;
use crate::sql_writer::SqlWriter;
use crate::transaction::StoreTxn;
use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;
use sqlx::any::{Any, AnyArguments};
use sqlx::query::Query;
use sqlx::Row;
use statelink_schema::{EntityName, MaterializedValue, RawQuery, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;

/// The result of an insert/update: the post-write materialized row and the
/// per-field accept/reject verdict of the LWW merge.
#[derive(Debug)]
pub struct WriteOutcome {
    pub value: MaterializedValue,
    pub accepted: Vec<String>,
}

struct AcceptedField<'a> {
    col: Name,
    repr: ColumnRepr,
    value: &'a JsonValue,
    timestamp: &'a Timestamp,
}

/// Writes one row with per-field last-writer-wins semantics and buffers the
/// resulting mutation envelope on the transaction.
///
/// A field written at `t_new` is kept iff the meta shadow has no timestamp
/// for it or a lexicographically smaller one. Rejected fields are dropped
/// silently; the outcome's `accepted` list is how callers tell them apart.
/// When every field is rejected nothing is written and no mutation buffers.
pub async fn write_row(
    layout: &Layout,
    kind: Kind,
    txn: &mut StoreTxn,
    op: MutationOp,
    resource: &EntityName,
    id: &str,
    payload: &MaterializedValue,
    mutation_id: Option<String>,
) -> Result<WriteOutcome> {
    let table = layout.entity_table(resource)?;

    let existing_meta = read_meta_row(kind, txn, &table, id).await?;
    let mut accepted: Vec<AcceptedField<'_>> = Vec::new();
    for (field_name, field) in payload.iter() {
        if field_name == "id" {
            continue;
        }
        let col = table
            .field_cols
            .get(field_name)
            .with_context(|| format!("entity `{resource}` has no field named `{field_name}`"))?;
        let timestamp = match field.timestamp() {
            Some(timestamp) => timestamp,
            // A payload field without meta carries no LWW position; skip it.
            None => continue,
        };
        let stored = existing_meta
            .as_ref()
            .and_then(|row| row.get(field_name))
            .cloned()
            .flatten();
        let wins = match stored {
            None => true,
            Some(stored) => timestamp.as_str() > stored.as_str(),
        };
        if !wins {
            continue;
        }
        let scalar = match field.value.as_scalar() {
            Some(scalar) => scalar,
            None => bail!("field `{field_name}` of a write payload must be a scalar"),
        };
        accepted.push(AcceptedField {
            col: col.col_name.clone(),
            repr: col.repr.clone(),
            value: scalar,
            timestamp,
        });
    }

    if accepted.is_empty() && matches!(op, MutationOp::Update) {
        let value = fetch_row(layout, kind, txn, resource, id)
            .await?
            .unwrap_or_default();
        return Ok(WriteOutcome {
            value,
            accepted: Vec::new(),
        });
    }

    match op {
        MutationOp::Insert => {
            insert_values(kind, txn, &table, id, &accepted).await?;
            insert_meta(kind, txn, &table, id, &accepted).await?;
        }
        MutationOp::Update => {
            update_values(kind, txn, &table, id, &accepted).await?;
            if existing_meta.is_some() {
                update_meta(kind, txn, &table, id, &accepted).await?;
            } else {
                insert_meta(kind, txn, &table, id, &accepted).await?;
            }
        }
    }

    let value = fetch_row(layout, kind, txn, resource, id)
        .await?
        .context("row vanished during write")?;

    // The envelope payload carries only fields whose meta timestamp is
    // present, i.e. the accepted set, plus the bare id.
    let mut envelope = MaterializedValue::new();
    envelope.set_scalar("id", JsonValue::String(id.to_owned()), None);
    for (field_name, field) in payload.iter() {
        if accepted.iter().any(|a| {
            table
                .field_cols
                .get(field_name)
                .map(|c| c.col_name == a.col)
                .unwrap_or(false)
        }) {
            envelope.set(field_name, field.clone());
        }
    }

    let accepted_names: Vec<String> = envelope
        .iter()
        .map(|(name, _)| name.clone())
        .filter(|name| name != "id")
        .collect();

    txn.push_mutation(RecordMutation {
        id: mutation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        resource: resource.clone(),
        resource_id: id.to_owned(),
        op,
        payload: envelope,
        snapshot: value.infer_plain(),
    });

    Ok(WriteOutcome {
        value,
        accepted: accepted_names,
    })
}

/// Reads the meta shadow row inside the transaction; `None` when the row has
/// never been written.
async fn read_meta_row(
    kind: Kind,
    txn: &mut StoreTxn,
    table: &Arc<EntityTable>,
    id: &str,
) -> Result<Option<HashMap<String, Option<Timestamp>>>> {
    let mut w = SqlWriter::new(kind);
    w.write_str("SELECT ");
    if table.field_cols.is_empty() {
        w.write_name(&table.id_col);
    } else {
        for (i, col) in table.field_cols.values().enumerate() {
            if i > 0 {
                w.write_str(", ");
            }
            w.write_name(&col.col_name);
        }
    }
    w.write_str(" FROM ");
    w.write_name(&table.meta_table_name);
    w.write_str(" WHERE ");
    w.write_name(&table.id_col);
    w.write_str(" = ");
    w.write_param(0);
    let sql = w.build();

    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut txn.txn)
        .await?;
    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };
    let mut out = HashMap::new();
    for (i, col) in table.field_cols.values().enumerate() {
        let stored: Option<String> = row.try_get(i)?;
        out.insert(col.field_name.clone(), stored.map(Timestamp));
    }
    Ok(Some(out))
}

async fn insert_values(
    kind: Kind,
    txn: &mut StoreTxn,
    table: &Arc<EntityTable>,
    id: &str,
    accepted: &[AcceptedField<'_>],
) -> Result<()> {
    let mut w = SqlWriter::new(kind);
    w.write_str("INSERT INTO ");
    w.write_name(&table.table_name);
    w.write_str(" (");
    w.write_name(&table.id_col);
    for field in accepted {
        w.write_str(", ");
        w.write_name(&field.col);
    }
    w.write_str(") VALUES (");
    w.write_param(0);
    for (i, _) in accepted.iter().enumerate() {
        w.write_str(", ");
        w.write_param(i + 1);
    }
    w.write_str(")");
    let sql = w.build();

    let mut query = sqlx::query(&sql).bind(id);
    for field in accepted {
        query = bind_value(query, &field.repr, field.value)?;
    }
    query.execute(&mut txn.txn).await?;
    Ok(())
}

async fn update_values(
    kind: Kind,
    txn: &mut StoreTxn,
    table: &Arc<EntityTable>,
    id: &str,
    accepted: &[AcceptedField<'_>],
) -> Result<()> {
    let mut w = SqlWriter::new(kind);
    w.write_str("UPDATE ");
    w.write_name(&table.table_name);
    w.write_str(" SET ");
    for (i, field) in accepted.iter().enumerate() {
        if i > 0 {
            w.write_str(", ");
        }
        w.write_name(&field.col);
        w.write_str(" = ");
        w.write_param(i);
    }
    w.write_str(" WHERE ");
    w.write_name(&table.id_col);
    w.write_str(" = ");
    w.write_param(accepted.len());
    let sql = w.build();

    let mut query = sqlx::query(&sql);
    for field in accepted {
        query = bind_value(query, &field.repr, field.value)?;
    }
    query.bind(id).execute(&mut txn.txn).await?;
    Ok(())
}

async fn insert_meta(
    kind: Kind,
    txn: &mut StoreTxn,
    table: &Arc<EntityTable>,
    id: &str,
    accepted: &[AcceptedField<'_>],
) -> Result<()> {
    let mut w = SqlWriter::new(kind);
    w.write_str("INSERT INTO ");
    w.write_name(&table.meta_table_name);
    w.write_str(" (");
    w.write_name(&table.id_col);
    for field in accepted {
        w.write_str(", ");
        w.write_name(&field.col);
    }
    w.write_str(") VALUES (");
    w.write_param(0);
    for (i, _) in accepted.iter().enumerate() {
        w.write_str(", ");
        w.write_param(i + 1);
    }
    w.write_str(")");
    let sql = w.build();

    let mut query = sqlx::query(&sql).bind(id);
    for field in accepted {
        query = query.bind(field.timestamp.as_str());
    }
    query.execute(&mut txn.txn).await?;
    Ok(())
}

async fn update_meta(
    kind: Kind,
    txn: &mut StoreTxn,
    table: &Arc<EntityTable>,
    id: &str,
    accepted: &[AcceptedField<'_>],
) -> Result<()> {
    if accepted.is_empty() {
        return Ok(());
    }
    let mut w = SqlWriter::new(kind);
    w.write_str("UPDATE ");
    w.write_name(&table.meta_table_name);
    w.write_str(" SET ");
    for (i, field) in accepted.iter().enumerate() {
        if i > 0 {
            w.write_str(", ");
        }
        w.write_name(&field.col);
        w.write_str(" = ");
        w.write_param(i);
    }
    w.write_str(" WHERE ");
    w.write_name(&table.id_col);
    w.write_str(" = ");
    w.write_param(accepted.len());
    let sql = w.build();

    let mut query = sqlx::query(&sql);
    for field in accepted {
        query = query.bind(field.timestamp.as_str());
    }
    query.bind(id).execute(&mut txn.txn).await?;
    Ok(())
}

/// Shallow re-read of the row inside the transaction.
async fn fetch_row(
    layout: &Layout,
    kind: Kind,
    txn: &mut StoreTxn,
    resource: &EntityName,
    id: &str,
) -> Result<Option<MaterializedValue>> {
    let raw = RawQuery::by_id(resource, id, Default::default());
    let predicate = raw.parse_where(&layout.schema)?;
    let plan = select::build_select(layout, kind, &raw, predicate.as_ref())?;
    let mut query = sqlx::query(&plan.sql);
    for param in &plan.params {
        query = bind_param(query, param);
    }
    let row = query.fetch_optional(&mut txn.txn).await?;
    match row {
        Some(row) => Ok(Some(materialize::decode_row(layout, &plan, &row)?)),
        None => Ok(None),
    }
}

pub(crate) fn bind_param<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    param: &'q select::SqlParam,
) -> Query<'q, Any, AnyArguments<'q>> {
    match param {
        select::SqlParam::String(s) => query.bind(s.as_str()),
        select::SqlParam::F64(f) => query.bind(*f),
        select::SqlParam::I64(i) => query.bind(*i),
    }
}

fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    repr: &ColumnRepr,
    value: &'q JsonValue,
) -> Result<Query<'q, Any, AnyArguments<'q>>> {
    let query = match (repr, value) {
        (_, JsonValue::Null) => match repr {
            ColumnRepr::NumberAsDouble => query.bind(Option::<f64>::None),
            ColumnRepr::BooleanAsInt => query.bind(Option::<i64>::None),
            _ => query.bind(Option::<String>::None),
        },
        (ColumnRepr::BooleanAsInt, JsonValue::Bool(b)) => query.bind(*b as i64),
        (ColumnRepr::NumberAsDouble, JsonValue::Number(n)) => {
            query.bind(n.as_f64().context("number is not representable as f64")?)
        }
        (ColumnRepr::JsonAsText, value) => query.bind(value.to_string()),
        (
            ColumnRepr::StringAsText
            | ColumnRepr::DateAsText
            | ColumnRepr::EnumAsText(_)
            | ColumnRepr::RefAsText(_),
            JsonValue::String(s),
        ) => query.bind(s.as_str()),
        (repr, value) => bail!("value {value} does not fit column representation {repr:?}"),
    };
    Ok(query)
}

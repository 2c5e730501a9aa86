use crate::conn::Kind;
use crate::layout::{ColumnRepr, EntityTable, Layout, Name};
use crate::sql_writer::SqlWriter;
use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;
use statelink_schema::{CmpOp, Comparison, Include, Predicate, RawQuery, Relation};
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled SELECT: the SQL text, its positional parameters, and the
/// metadata the row decoder needs to rebuild materialized values.
///
/// Column order contract (shared with [`crate::materialize`]): the id column,
/// then every value column in layout order, then `_meta`, then one JSON
/// column per included relation in include-tree order.
#[derive(Debug)]
pub struct SelectPlan {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub table: Arc<EntityTable>,
    pub include: Include,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    String(String),
    F64(f64),
    I64(i64),
}

struct BuildCtx<'a> {
    layout: &'a Layout,
    kind: Kind,
    alias_counter: usize,
    params: Vec<SqlParam>,
}

impl<'a> BuildCtx<'a> {
    fn fresh_alias(&mut self, prefix: &str) -> Name {
        let alias = Name(format!("{}{}", prefix, self.alias_counter));
        self.alias_counter += 1;
        alias
    }

    fn add_param(&mut self, param: SqlParam) -> usize {
        self.params.push(param);
        self.params.len() - 1
    }

    fn writer(&self) -> SqlWriter {
        SqlWriter::new(self.kind)
    }

    /// `"alias"."column"`, quoted for the dialect.
    fn column_ref(&self, alias: &Name, column: &Name) -> String {
        let mut w = self.writer();
        w.write_name(alias);
        w.write_str(".");
        w.write_name(column);
        w.build()
    }
}

/// Compiles a raw query (with its already-parsed predicate) into one SELECT.
/// Sort and limit apply only at this, the outermost, level.
pub fn build_select(
    layout: &Layout,
    kind: Kind,
    query: &RawQuery,
    predicate: Option<&Predicate>,
) -> Result<SelectPlan> {
    let table = layout.entity_table(&query.resource)?;
    let mut ctx = BuildCtx {
        layout,
        kind,
        alias_counter: 0,
        params: Vec::new(),
    };

    let base = ctx.fresh_alias("t");
    let meta = ctx.fresh_alias("m");

    // SELECT list: id, value columns, _meta, include subqueries. No
    // parameters may appear here: MySQL binds are positional and every
    // parameter must come from the WHERE clause built below.
    let mut select = ctx.writer();
    select.write_str("SELECT ");
    select.write_str(&ctx.column_ref(&base, &table.id_col));
    for col in table.field_cols.values() {
        select.write_str(", ");
        select.write_str(&ctx.column_ref(&base, &col.col_name));
    }

    select.write_str(", ");
    let meta_object = meta_json_object(&ctx, &table, &meta)?;
    select.write_cast_text(&meta_object);
    select.write_str(" AS ");
    select.write_name(&Name("_meta".into()));

    for (relation_name, nested) in query.include.iter() {
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
        let subquery = include_subquery(&mut ctx, &table, &base, &relation, &nested)?;
        select.write_str(", ");
        select.write_cast_text(&subquery);
        select.write_str(" AS ");
        select.write_name(&Name(relation_name.clone()));
    }

    // FROM plus the meta shadow join.
    let mut from = ctx.writer();
    from.write_str(" FROM ");
    from.write_name(&table.table_name);
    from.write_str(" AS ");
    from.write_name(&base);
    from.write_str(" LEFT JOIN ");
    from.write_name(&table.meta_table_name);
    from.write_str(" AS ");
    from.write_name(&meta);
    write!(from, " ON {} = {}", ctx.column_ref(&meta, &table.id_col), ctx.column_ref(&base, &table.id_col));

    // WHERE: the predicate plus the lastSyncedAt watermark. One-relation
    // descents contribute LEFT JOINs, many-relation descents stay inside
    // EXISTS subselects.
    let mut joins: Vec<String> = Vec::new();
    let mut join_aliases: HashMap<String, Name> = HashMap::new();
    let mut conditions: Vec<String> = Vec::new();
    if let Some(predicate) = predicate {
        let condition = compile_predicate(
            &mut ctx,
            &base,
            &table,
            &mut joins,
            &mut join_aliases,
            predicate,
        )?;
        conditions.push(condition);
    }
    if let Some(watermark) = &query.last_synced_at {
        conditions.push(watermark_condition(&mut ctx, &table, &meta, watermark.as_str())?);
    }

    let mut sql = select.build();
    sql.push_str(&from.build());
    for join in &joins {
        sql.push(' ');
        sql.push_str(join);
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if let Some(sort) = &query.sort {
        let col = resolve_column(&table, &sort.field)?;
        let mut order = ctx.writer();
        order.write_str(" ORDER BY ");
        order.write_str(&ctx.column_ref(&base, &col));
        order.write_str(if sort.ascending { " ASC" } else { " DESC" });
        sql.push_str(&order.build());
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    Ok(SelectPlan {
        sql,
        params: ctx.params,
        table,
        include: query.include.clone(),
    })
}

/// The meta shadow of one row as a JSON object: `{"field": timestamp|null}`.
fn meta_json_object(ctx: &BuildCtx, table: &EntityTable, meta_alias: &Name) -> Result<String> {
    let pairs: Vec<(&str, String)> = table
        .field_cols
        .values()
        .map(|col| {
            (
                col.field_name.as_str(),
                ctx.column_ref(meta_alias, &col.col_name),
            )
        })
        .collect();
    let mut w = ctx.writer();
    w.write_json_object(&pairs)?;
    Ok(w.build())
}

/// A correlated subquery materializing one included relation: a JSON object
/// for `one`, a JSON array for `many`, recursively applying nested includes.
fn include_subquery(
    ctx: &mut BuildCtx,
    outer_table: &EntityTable,
    outer_alias: &Name,
    relation: &Relation,
    nested: &Include,
) -> Result<String> {
    let target = ctx.layout.entity_table(relation.target())?;
    let row = ctx.fresh_alias("t");
    let row_meta = ctx.fresh_alias("m");

    let record = record_json_object(ctx, &target, &row, &row_meta, nested)?;

    let mut w = ctx.writer();
    w.write_str("(SELECT ");
    match relation.shape() {
        RelationShape::One { local_column } => {
            w.write_str(&record);
            w.write_str(" FROM ");
            w.write_name(&target.table_name);
            w.write_str(" AS ");
            w.write_name(&row);
            write_meta_join(ctx, &mut w, &target, &row, &row_meta);
            let local = resolve_column(outer_table, local_column)?;
            write!(
                w,
                " WHERE {} = {}",
                ctx.column_ref(&row, &target.id_col),
                ctx.column_ref(outer_alias, &local),
            );
        }
        RelationShape::Many { foreign_column } => {
            w.write_json_array_agg(&record);
            w.write_str(" FROM ");
            w.write_name(&target.table_name);
            w.write_str(" AS ");
            w.write_name(&row);
            write_meta_join(ctx, &mut w, &target, &row, &row_meta);
            let foreign = resolve_column(&target, foreign_column)?;
            write!(
                w,
                " WHERE {} = {}",
                ctx.column_ref(&row, &foreign),
                ctx.column_ref(outer_alias, &outer_table.id_col),
            );
        }
    }
    w.write_str(")");
    Ok(w.build())
}

/// One row of `table` as a JSON object: id, value columns, `_meta`, plus any
/// nested includes as further correlated subqueries.
fn record_json_object(
    ctx: &mut BuildCtx,
    table: &Arc<EntityTable>,
    alias: &Name,
    meta_alias: &Name,
    include: &Include,
) -> Result<String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    pairs.push(("id".to_owned(), ctx.column_ref(alias, &table.id_col)));
    for col in table.field_cols.values() {
        let column = ctx.column_ref(alias, &col.col_name);
        let expr = match col.repr {
            // Stored as text but semantically a document: re-parse so it
            // lands in the object as JSON, not as an escaped string.
            ColumnRepr::JsonAsText => json_parse_expr(ctx.kind, &column),
            _ => column,
        };
        pairs.push((col.field_name.clone(), expr));
    }
    pairs.push(("_meta".to_owned(), meta_json_object(ctx, table, meta_alias)?));

    for (relation_name, nested) in include.iter() {
        let relation = ctx
            .layout
            .schema
            .relation(&table.entity_name, relation_name)
            .with_context(|| {
                format!(
                    "entity `{}` has no relation `{relation_name}`",
                    table.entity_name
                )
            })?
            .clone();
        let subquery = include_subquery(ctx, table, alias, &relation, &nested)?;
        // Scalar subqueries lose the JSON subtype on SQLite; re-parse.
        pairs.push((relation_name.clone(), json_parse_expr(ctx.kind, &subquery)));
    }

    let borrowed: Vec<(&str, String)> = pairs
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    let mut w = ctx.writer();
    w.write_json_object(&borrowed)?;
    Ok(w.build())
}

fn write_meta_join(
    ctx: &BuildCtx,
    w: &mut SqlWriter,
    table: &EntityTable,
    alias: &Name,
    meta_alias: &Name,
) {
    w.write_str(" LEFT JOIN ");
    w.write_name(&table.meta_table_name);
    w.write_str(" AS ");
    w.write_name(meta_alias);
    write!(
        w,
        " ON {} = {}",
        ctx.column_ref(meta_alias, &table.id_col),
        ctx.column_ref(alias, &table.id_col),
    );
}

fn json_parse_expr(kind: Kind, expr: &str) -> String {
    match kind {
        Kind::Postgres => format!("({expr})::json"),
        Kind::Sqlite => format!("json({expr})"),
        Kind::MySql => format!("CAST({expr} AS JSON)"),
    }
}

/// Rows with any field written after the watermark. Drives `lastSyncedAt`
/// delta reads.
fn watermark_condition(
    ctx: &mut BuildCtx,
    table: &EntityTable,
    meta_alias: &Name,
    watermark: &str,
) -> Result<String> {
    if table.field_cols.is_empty() {
        return Ok("1 = 0".to_owned());
    }
    let mut w = ctx.writer();
    w.write_str("(");
    for (i, col) in table.field_cols.values().enumerate() {
        if i > 0 {
            w.write_str(" OR ");
        }
        w.write_str(&ctx.column_ref(meta_alias, &col.col_name));
        w.write_str(" > ");
        let idx = ctx.add_param(SqlParam::String(watermark.to_owned()));
        w.write_param(idx);
    }
    w.write_str(")");
    Ok(w.build())
}

enum RelationShape<'a> {
    One { local_column: &'a str },
    Many { foreign_column: &'a str },
}

trait RelationExt {
    fn shape(&self) -> RelationShape<'_>;
}

impl RelationExt for Relation {
    fn shape(&self) -> RelationShape<'_> {
        match self.local_column() {
            Some(local_column) => RelationShape::One { local_column },
            None => RelationShape::Many {
                foreign_column: self.foreign_column().expect("relation is one or many"),
            },
        }
    }
}

fn resolve_column(table: &EntityTable, field: &str) -> Result<Name> {
    if field == "id" {
        return Ok(table.id_col.clone());
    }
    table
        .field_cols
        .get(field)
        .map(|col| col.col_name.clone())
        .with_context(|| {
            format!(
                "entity `{}` has no field named `{field}`",
                table.entity_name
            )
        })
}

/// Compiles a predicate into a condition over `alias`. `one` descents add
/// LEFT JOINs to `joins` (shared across the whole enclosing SELECT and reused
/// per relation); `many` descents emit EXISTS subselects with their own join
/// scope.
fn compile_predicate(
    ctx: &mut BuildCtx,
    alias: &Name,
    table: &Arc<EntityTable>,
    joins: &mut Vec<String>,
    join_aliases: &mut HashMap<String, Name>,
    predicate: &Predicate,
) -> Result<String> {
    let condition = match predicate {
        Predicate::And(terms) => {
            let parts = terms
                .iter()
                .map(|t| compile_predicate(ctx, alias, table, joins, join_aliases, t))
                .collect::<Result<Vec<_>>>()?;
            format!("({})", parts.join(" AND "))
        }
        Predicate::Or(terms) => {
            let parts = terms
                .iter()
                .map(|t| compile_predicate(ctx, alias, table, joins, join_aliases, t))
                .collect::<Result<Vec<_>>>()?;
            format!("({})", parts.join(" OR "))
        }
        Predicate::Not(inner) => {
            let inner = compile_predicate(ctx, alias, table, joins, join_aliases, inner)?;
            format!("NOT ({inner})")
        }
        Predicate::Cmp(cmp) => compile_comparison(ctx, alias, table, cmp)?,
        Predicate::Rel { relation, inner } => {
            let declared = ctx
                .layout
                .schema
                .relation(&table.entity_name, relation)
                .with_context(|| {
                    format!(
                        "entity `{}` has no relation `{relation}`",
                        table.entity_name
                    )
                })?
                .clone();
            let target = ctx.layout.entity_table(declared.target())?;
            match declared.shape() {
                RelationShape::One { local_column } => {
                    let join_key = format!("{}.{relation}", alias.as_str());
                    let join_alias = match join_aliases.get(&join_key) {
                        Some(existing) => existing.clone(),
                        None => {
                            let fresh = ctx.fresh_alias("j");
                            let local = resolve_column(table, local_column)?;
                            let mut w = ctx.writer();
                            w.write_str("LEFT JOIN ");
                            w.write_name(&target.table_name);
                            w.write_str(" AS ");
                            w.write_name(&fresh);
                            write!(
                                w,
                                " ON {} = {}",
                                ctx.column_ref(&fresh, &target.id_col),
                                ctx.column_ref(alias, &local),
                            );
                            joins.push(w.build());
                            join_aliases.insert(join_key, fresh.clone());
                            fresh
                        }
                    };
                    // A null foreign key leaves the join row all-NULL, so
                    // the inner comparisons come out false, matching the
                    // null-descent rule.
                    compile_predicate(ctx, &join_alias, &target, joins, join_aliases, inner)?
                }
                RelationShape::Many { foreign_column } => {
                    let exists_alias = ctx.fresh_alias("e");
                    let foreign = resolve_column(&target, foreign_column)?;
                    let mut child_joins = Vec::new();
                    let mut child_aliases = HashMap::new();
                    let inner_condition = compile_predicate(
                        ctx,
                        &exists_alias,
                        &target,
                        &mut child_joins,
                        &mut child_aliases,
                        inner,
                    )?;
                    let mut w = ctx.writer();
                    w.write_str("EXISTS (SELECT 1 FROM ");
                    w.write_name(&target.table_name);
                    w.write_str(" AS ");
                    w.write_name(&exists_alias);
                    for join in &child_joins {
                        w.write_str(" ");
                        w.write_str(join);
                    }
                    write!(
                        w,
                        " WHERE {} = {} AND ({inner_condition}))",
                        ctx.column_ref(&exists_alias, &foreign),
                        ctx.column_ref(alias, &table.id_col),
                    );
                    w.build()
                }
            }
        }
    };
    Ok(condition)
}

fn compile_comparison(
    ctx: &mut BuildCtx,
    alias: &Name,
    table: &Arc<EntityTable>,
    cmp: &Comparison,
) -> Result<String> {
    let col = resolve_column(table, &cmp.field)?;
    let repr = table
        .field_cols
        .get(&cmp.field)
        .map(|c| c.repr.clone())
        .unwrap_or(ColumnRepr::StringAsText);
    let column = ctx.column_ref(alias, &col);

    let mut w = ctx.writer();
    match cmp.op {
        CmpOp::Eq => {
            if cmp.value.is_null() {
                write!(w, "{column} IS NULL");
            } else {
                let idx = ctx.add_param(param_for(&repr, &cmp.value)?);
                write!(w, "{column} = ");
                w.write_param(idx);
            }
        }
        CmpOp::In => {
            let items = match &cmp.value {
                JsonValue::Array(items) => items,
                _ => bail!("`$in` on `{}` takes an array", cmp.field),
            };
            if items.is_empty() {
                // An empty list matches nothing.
                w.write_str("1 = 0");
            } else {
                write!(w, "{column} IN (");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        w.write_str(", ");
                    }
                    if item.is_null() {
                        // SQL IN never matches NULL members anyway.
                        w.write_str("NULL");
                    } else {
                        let idx = ctx.add_param(param_for(&repr, item)?);
                        w.write_param(idx);
                    }
                }
                w.write_str(")");
            }
        }
        CmpOp::Gt | CmpOp::Gte | CmpOp::Lt | CmpOp::Lte => {
            if cmp.value.is_null() {
                w.write_str("1 = 0");
            } else {
                let op = match cmp.op {
                    CmpOp::Gt => ">",
                    CmpOp::Gte => ">=",
                    CmpOp::Lt => "<",
                    _ => "<=",
                };
                let idx = ctx.add_param(param_for(&repr, &cmp.value)?);
                write!(w, "{column} {op} ");
                w.write_param(idx);
            }
        }
    }
    Ok(w.build())
}

/// Converts a predicate literal into a bind parameter matching the column's
/// storage representation.
pub fn param_for(repr: &ColumnRepr, value: &JsonValue) -> Result<SqlParam> {
    let param = match (repr, value) {
        (ColumnRepr::BooleanAsInt, JsonValue::Bool(b)) => SqlParam::I64(*b as i64),
        (ColumnRepr::NumberAsDouble, JsonValue::Number(n)) => {
            SqlParam::F64(n.as_f64().context("number is not representable as f64")?)
        }
        (ColumnRepr::JsonAsText, value) => SqlParam::String(value.to_string()),
        (
            ColumnRepr::StringAsText
            | ColumnRepr::DateAsText
            | ColumnRepr::EnumAsText(_)
            | ColumnRepr::RefAsText(_),
            JsonValue::String(s),
        ) => SqlParam::String(s.clone()),
        (repr, value) => bail!("literal {value} does not fit column representation {repr:?}"),
    };
    Ok(param)
}

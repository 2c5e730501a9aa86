// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::conn::{DbConnection, Kind};
use crate::layout::{ColumnRepr, EntityTable, Layout, Name};
use anyhow::{Context, Result};
use sea_query::{Alias, ColumnDef, ForeignKey, Index, Table};
use sqlx::any::AnyPool;
use sqlx::{Executor, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Idempotent schema initialization.
///
/// For each entity: create the value and meta tables if missing, add missing
/// columns, create Postgres enum types up-front, create declared indexes and
/// foreign keys. Foreign keys whose target table has not been visited yet are
/// deferred and replayed after all tables exist. Duplicate-object errors from
/// concurrent init are swallowed; column-type mismatches are warned about but
/// never auto-migrated.
pub async fn init(conn: &DbConnection, layout: &Layout) -> Result<()> {
    let kind = conn.kind();
    let pool = &conn.pool;

    if kind == Kind::Postgres {
        create_enum_types(pool, layout).await?;
    }

    let mut visited: HashSet<Name> = HashSet::new();
    let mut deferred: Vec<(Name, String)> = Vec::new();

    for table in layout.entity_tables.values() {
        create_value_table(conn, layout, table).await?;
        create_meta_table(conn, table).await?;
        visited.insert(table.table_name.clone());

        for ddl in foreign_key_ddl(conn, layout, table)? {
            let (target, sql) = ddl;
            if visited.contains(&target) {
                execute_tolerant(pool, &sql, "foreign key").await?;
            } else {
                deferred.push((target, sql));
            }
        }

        create_indexes(conn, table).await?;
        check_column_types(pool, kind, table).await?;
    }

    // Replay constraints whose target table did not exist yet on first pass.
    for (_, sql) in deferred {
        execute_tolerant(pool, &sql, "foreign key").await?;
    }

    Ok(())
}

async fn create_enum_types(pool: &AnyPool, layout: &Layout) -> Result<()> {
    use sea_query::extension::postgres::Type;
    use sea_query::PostgresQueryBuilder;

    for enum_ in layout.schema.enums.values() {
        let stmt = Type::create()
            .as_enum(Alias::new(&enum_.name))
            .values(enum_.variants.iter().map(|variant| Alias::new(variant)))
            .to_owned();
        let sql = stmt.to_string(PostgresQueryBuilder);
        execute_tolerant(pool, &sql, "enum type").await?;
    }
    Ok(())
}

fn value_column_def(kind: Kind, name: &str, repr: &ColumnRepr, nullable: bool, unique: bool) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(name));
    match repr {
        ColumnRepr::StringAsText
        | ColumnRepr::DateAsText
        | ColumnRepr::RefAsText(_) => {
            def.text();
        }
        ColumnRepr::NumberAsDouble => {
            def.double();
        }
        ColumnRepr::BooleanAsInt => {
            def.integer();
        }
        ColumnRepr::JsonAsText => {
            def.text();
        }
        ColumnRepr::EnumAsText(enum_name) => {
            // Native enum type on Postgres, varchar elsewhere.
            if kind == Kind::Postgres {
                def.custom(Alias::new(enum_name));
            } else {
                def.string();
            }
        }
    }
    if !nullable {
        def.not_null();
    }
    if unique {
        def.unique_key();
    }
    def
}

async fn create_value_table(
    conn: &DbConnection,
    _layout: &Layout,
    table: &Arc<EntityTable>,
) -> Result<()> {
    let kind = conn.kind();
    let mut create = Table::create()
        .table(Alias::new(table.table_name.as_str()))
        .if_not_exists()
        .to_owned();
    create.col(ColumnDef::new(Alias::new(table.id_col.as_str())).text().primary_key());
    for col in table.field_cols.values() {
        create.col(&mut value_column_def(
            kind,
            col.col_name.as_str(),
            &col.repr,
            col.nullable,
            col.unique,
        ));
    }
    let sql = create.build_any(conn.schema_builder());
    conn.pool
        .execute(&*sql)
        .await
        .with_context(|| format!("failed to create table `{}`", table.table_name.as_str()))?;

    add_missing_columns(conn, table).await?;
    Ok(())
}

async fn create_meta_table(conn: &DbConnection, table: &Arc<EntityTable>) -> Result<()> {
    let mut create = Table::create()
        .table(Alias::new(table.meta_table_name.as_str()))
        .if_not_exists()
        .to_owned();
    create.col(ColumnDef::new(Alias::new(table.id_col.as_str())).text().primary_key());
    for col in table.field_cols.values() {
        // One varchar timestamp per declared field.
        create.col(ColumnDef::new(Alias::new(col.col_name.as_str())).string());
    }
    let sql = create.build_any(conn.schema_builder());
    conn.pool.execute(&*sql).await.with_context(|| {
        format!(
            "failed to create meta table `{}`",
            table.meta_table_name.as_str()
        )
    })?;

    for col in table.field_cols.values() {
        let alter = Table::alter()
            .table(Alias::new(table.meta_table_name.as_str()))
            .add_column(ColumnDef::new(Alias::new(col.col_name.as_str())).string())
            .to_owned();
        let sql = build_alter(conn, alter);
        execute_tolerant(&conn.pool, &sql, "meta column").await?;
    }
    Ok(())
}

/// Columns declared after the table was first created are added one ALTER at
/// a time; an ALTER that races another init (or hits an existing column)
/// reports a duplicate, which is swallowed.
async fn add_missing_columns(conn: &DbConnection, table: &Arc<EntityTable>) -> Result<()> {
    let kind = conn.kind();
    for col in table.field_cols.values() {
        let alter = Table::alter()
            .table(Alias::new(table.table_name.as_str()))
            .add_column(&mut value_column_def(
                kind,
                col.col_name.as_str(),
                &col.repr,
                // ALTER ADD COLUMN on a populated table must accept NULLs.
                true,
                false,
            ))
            .to_owned();
        let sql = build_alter(conn, alter);
        execute_tolerant(&conn.pool, &sql, "column").await?;
    }
    Ok(())
}

// SQLite doesn't support multiple add-column statements and sea-query won't
// generate some safe ALTERs for it, so we build them with the Postgres
// builder (the quoting matches). Our ALTERs are limited to ADD COLUMN, which
// SQLite executes fine.
fn build_alter(conn: &DbConnection, alter: sea_query::TableAlterStatement) -> String {
    use sea_query::PostgresQueryBuilder;
    match conn.kind() {
        Kind::Sqlite => alter.to_string(PostgresQueryBuilder),
        _ => alter.build_any(conn.schema_builder()),
    }
}

async fn create_indexes(conn: &DbConnection, table: &Arc<EntityTable>) -> Result<()> {
    for index in &table.table_indexes {
        let mut create = Index::create()
            .name(index.index_name.as_str())
            .table(Alias::new(table.table_name.as_str()))
            .col(Alias::new(index.field_col.as_str()))
            .to_owned();
        if index.is_unique {
            create.unique();
        }
        let sql = create.build_any(conn.schema_builder());
        execute_tolerant(&conn.pool, &sql, "index").await?;
    }
    Ok(())
}

/// DDL for this table's reference constraints plus the meta table's id
/// back-reference, paired with the target table each depends on. SQLite
/// cannot add constraints to existing tables, so it gets none.
fn foreign_key_ddl(
    conn: &DbConnection,
    layout: &Layout,
    table: &Arc<EntityTable>,
) -> Result<Vec<(Name, String)>> {
    if conn.kind() == Kind::Sqlite {
        log::debug!(
            "skipping foreign keys for `{}`: sqlite cannot alter constraints",
            table.table_name.as_str()
        );
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for fk in &table.foreign_keys {
        let target = layout.entity_table(&fk.target)?;
        let stmt = ForeignKey::create()
            .name(fk.constraint_name.as_str())
            .from(
                Alias::new(table.table_name.as_str()),
                Alias::new(fk.column.as_str()),
            )
            .to(
                Alias::new(target.table_name.as_str()),
                Alias::new(target.id_col.as_str()),
            )
            .to_owned();
        out.push((
            target.table_name.clone(),
            stmt.build_any(conn.schema_builder()),
        ));
    }
    // R_meta.id is both primary key and foreign key to R.id.
    let stmt = ForeignKey::create()
        .name(&format!("fk_{}_id", table.meta_table_name.as_str()))
        .from(
            Alias::new(table.meta_table_name.as_str()),
            Alias::new(table.id_col.as_str()),
        )
        .to(
            Alias::new(table.table_name.as_str()),
            Alias::new(table.id_col.as_str()),
        )
        .to_owned();
    out.push((
        table.table_name.clone(),
        stmt.build_any(conn.schema_builder()),
    ));
    Ok(out)
}

/// Runs DDL, swallowing the duplicate-object errors produced by concurrent
/// initialization.
async fn execute_tolerant(pool: &AnyPool, sql: &str, what: &str) -> Result<()> {
    match pool.execute(sql).await {
        Ok(_) => Ok(()),
        Err(err) if is_duplicate_error(&err) => {
            log::debug!("ignoring duplicate {what}: {err}");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("failed to execute DDL: {sql}")),
    }
}

fn is_duplicate_error(err: &sqlx::Error) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("already exists") || message.contains("duplicate")
}

/// Compares the physical column types against the layout and warns on
/// mismatches. Nothing is migrated automatically.
async fn check_column_types(pool: &AnyPool, kind: Kind, table: &Arc<EntityTable>) -> Result<()> {
    let existing = match existing_column_types(pool, kind, table.table_name.as_str()).await {
        Ok(existing) => existing,
        Err(err) => {
            log::debug!("could not introspect `{}`: {err}", table.table_name.as_str());
            return Ok(());
        }
    };
    for col in table.field_cols.values() {
        let actual = match existing.get(&col.col_name.0.to_lowercase()) {
            Some(actual) => actual.to_lowercase(),
            None => continue,
        };
        if !expected_type_keywords(kind, &col.repr)
            .iter()
            .any(|keyword| actual.contains(keyword))
        {
            log::warn!(
                "column `{}`.`{}` has type `{actual}`, which does not match its declared representation {:?}",
                table.table_name.as_str(),
                col.col_name.as_str(),
                col.repr,
            );
        }
    }
    Ok(())
}

async fn existing_column_types(
    pool: &AnyPool,
    kind: Kind,
    table_name: &str,
) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    match kind {
        Kind::Sqlite => {
            let sql = format!("PRAGMA table_info(\"{table_name}\")");
            let rows = pool.fetch_all(&*sql).await?;
            for row in rows {
                let name: String = row.try_get("name")?;
                let type_: String = row.try_get("type")?;
                out.insert(name.to_lowercase(), type_);
            }
        }
        Kind::Postgres | Kind::MySql => {
            let sql = match kind {
                Kind::Postgres => {
                    "SELECT column_name, data_type FROM information_schema.columns \
                     WHERE table_name = $1"
                }
                _ => {
                    "SELECT column_name, data_type FROM information_schema.columns \
                     WHERE table_name = ?"
                }
            };
            let rows = sqlx::query(sql).bind(table_name).fetch_all(pool).await?;
            for row in rows {
                let name: String = row.try_get(0)?;
                let type_: String = row.try_get(1)?;
                out.insert(name.to_lowercase(), type_);
            }
        }
    }
    Ok(out)
}

fn expected_type_keywords(kind: Kind, repr: &ColumnRepr) -> Vec<&'static str> {
    match repr {
        ColumnRepr::StringAsText
        | ColumnRepr::DateAsText
        | ColumnRepr::JsonAsText
        | ColumnRepr::RefAsText(_) => vec!["text", "char", "clob"],
        ColumnRepr::NumberAsDouble => vec!["double", "real", "float"],
        ColumnRepr::BooleanAsInt => vec!["int"],
        ColumnRepr::EnumAsText(_) => match kind {
            Kind::Postgres => vec!["user-defined", "enum"],
            _ => vec!["char", "text", "enum"],
        },
    }
}

// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use anyhow::{Context, Result};
use sea_query::{
    MysqlQueryBuilder, PostgresQueryBuilder, QueryBuilder, SchemaBuilder, SqliteQueryBuilder,
};
use sqlx::any::{AnyKind, AnyPool, AnyPoolOptions};
use sqlx::Executor;

/// The SQL dialect behind the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Postgres,
    MySql,
    Sqlite,
}

impl From<AnyKind> for Kind {
    fn from(kind: AnyKind) -> Self {
        match kind {
            AnyKind::Postgres => Kind::Postgres,
            AnyKind::MySql => Kind::MySql,
            AnyKind::Sqlite => Kind::Sqlite,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConnection {
    pub pool: AnyPool,
}

impl DbConnection {
    pub async fn connect(uri: &str, max_connections: usize) -> Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections as u32)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if matches!(conn.kind(), AnyKind::Sqlite) {
                        conn.execute("PRAGMA journal_mode=WAL;").await?;
                    }
                    Ok(())
                })
            })
            .connect(uri)
            .await
            .with_context(|| format!("failed to connect to {}", uri))?;
        Ok(Self { pool })
    }

    pub fn kind(&self) -> Kind {
        self.pool.any_kind().into()
    }

    // TODO: replace `query_builder()` and `schema_builder()` with a single method that returns
    // `&dyn sea_query::GenericBuilder`, once trait upcasting coercion is stabilized:
    // https://github.com/rust-lang/rust/issues/65991

    pub fn query_builder(&self) -> &'static dyn QueryBuilder {
        Self::query_builder_for(self.kind())
    }

    pub fn schema_builder(&self) -> &'static dyn SchemaBuilder {
        Self::schema_builder_for(self.kind())
    }

    pub fn query_builder_for(kind: Kind) -> &'static dyn QueryBuilder {
        match kind {
            Kind::Postgres => &PostgresQueryBuilder,
            Kind::MySql => &MysqlQueryBuilder,
            Kind::Sqlite => &SqliteQueryBuilder,
        }
    }

    pub fn schema_builder_for(kind: Kind) -> &'static dyn SchemaBuilder {
        match kind {
            Kind::Postgres => &PostgresQueryBuilder,
            Kind::MySql => &MysqlQueryBuilder,
            Kind::Sqlite => &SqliteQueryBuilder,
        }
    }
}

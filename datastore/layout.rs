// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use statelink_schema::{EntityName, FieldType, Schema};
use std::collections::HashMap;
use std::sync::Arc;

/// Concrete representation of a [Schema] in the database: one value table and
/// one meta shadow table per entity.
#[derive(Debug, Clone)]
pub struct Layout {
    pub entity_tables: HashMap<EntityName, Arc<EntityTable>>,
    pub schema: Arc<Schema>,
}

/// The pair of SQL tables that store instances of a given entity. The meta
/// table is keyed by the same id and holds one varchar timestamp column per
/// declared field.
#[derive(Debug)]
pub struct EntityTable {
    pub entity_name: EntityName,
    pub table_name: Name,
    pub meta_table_name: Name,
    pub id_col: Name,
    pub field_cols: IndexMap<String, FieldColumn>,
    pub table_indexes: Vec<TableIndex>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// An SQL index on a value table.
#[derive(Debug)]
pub struct TableIndex {
    pub index_name: Name,
    pub field_col: Name,
    pub is_unique: bool,
}

/// A foreign key from a reference column to the target entity's id.
#[derive(Debug)]
pub struct ForeignKey {
    pub constraint_name: Name,
    pub column: Name,
    pub target: EntityName,
}

#[derive(Debug, Clone)]
pub struct FieldColumn {
    pub field_name: String,
    pub col_name: Name,
    pub nullable: bool,
    pub unique: bool,
    pub repr: ColumnRepr,
}

/// Representation of a field value in its SQL column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRepr {
    /// A string stored as SQL text.
    StringAsText,
    /// A number stored as an SQL double.
    NumberAsDouble,
    /// A boolean stored as an SQL integer.
    BooleanAsInt,
    /// An ISO date string stored as SQL text.
    DateAsText,
    /// Any JSON document encoded as SQL text.
    JsonAsText,
    /// An enum variant; native enum type on Postgres, varchar elsewhere.
    EnumAsText(String),
    /// A foreign id stored as SQL text.
    RefAsText(EntityName),
}

impl ColumnRepr {
    pub fn of(type_: &FieldType) -> ColumnRepr {
        match type_ {
            FieldType::Id | FieldType::String => ColumnRepr::StringAsText,
            FieldType::Number => ColumnRepr::NumberAsDouble,
            FieldType::Boolean => ColumnRepr::BooleanAsInt,
            FieldType::Date => ColumnRepr::DateAsText,
            FieldType::Json => ColumnRepr::JsonAsText,
            FieldType::Enum(name) => ColumnRepr::EnumAsText(name.clone()),
            FieldType::Ref(target) => ColumnRepr::RefAsText(target.clone()),
        }
    }
}

/// An SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name(pub String);

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Returns the longest possible prefix of `s` that is at most `max_len`
/// bytes long and ends at a character boundary so that we don't break
/// multi-byte characters.
fn max_prefix(s: &str, max_len: usize) -> &str {
    if max_len >= s.len() {
        return s;
    }
    let mut idx = max_len;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}

/// Truncates a database identifier (column/table name) to 63 bytes to make it
/// Postgres-compatible.
pub fn truncate_identifier(s: &str) -> &str {
    max_prefix(s, 63)
}

pub fn name(s: &str) -> Name {
    Name(truncate_identifier(s).to_owned())
}

impl Layout {
    /// Maps every entity of `schema` onto its value table plus meta shadow.
    pub fn of(schema: Arc<Schema>) -> Layout {
        let mut entity_tables = HashMap::new();
        for entity in schema.entities.values() {
            let mut field_cols = IndexMap::new();
            let mut table_indexes = Vec::new();
            let mut foreign_keys = Vec::new();
            for field in entity.fields.values() {
                if matches!(field.type_, FieldType::Id) {
                    continue;
                }
                let col_name = name(&field.name);
                if field.indexed {
                    table_indexes.push(TableIndex {
                        index_name: name(&format!("idx_{}_{}", entity.name, field.name)),
                        field_col: col_name.clone(),
                        is_unique: field.unique,
                    });
                }
                if let FieldType::Ref(target) = &field.type_ {
                    foreign_keys.push(ForeignKey {
                        constraint_name: name(&format!("fk_{}_{}", entity.name, field.name)),
                        column: col_name.clone(),
                        target: target.clone(),
                    });
                }
                field_cols.insert(
                    field.name.clone(),
                    FieldColumn {
                        field_name: field.name.clone(),
                        col_name,
                        nullable: field.nullable,
                        unique: field.unique,
                        repr: ColumnRepr::of(&field.type_),
                    },
                );
            }
            entity_tables.insert(
                entity.name.clone(),
                Arc::new(EntityTable {
                    entity_name: entity.name.clone(),
                    table_name: name(entity.name.as_str()),
                    meta_table_name: name(&format!("{}_meta", entity.name)),
                    id_col: name("id"),
                    field_cols,
                    table_indexes,
                    foreign_keys,
                }),
            );
        }
        Layout {
            entity_tables,
            schema,
        }
    }

    pub fn entity_table(&self, entity: &EntityName) -> anyhow::Result<Arc<EntityTable>> {
        self.entity_tables
            .get(entity)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("could not find entity `{entity}` in layout"))
    }
}

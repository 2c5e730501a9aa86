use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Database schema as declared by the application.
///
/// This describes the abstract entities and their relations, not how they are
/// laid out in the database.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// All entities declared by the application.
    #[serde(with = "schema_entities")]
    pub entities: HashMap<EntityName, Arc<Entity>>,
    /// Relations, declared separately from the entities that own them. A
    /// relation's name is independent of any column.
    #[serde(with = "schema_relations")]
    #[serde(default)]
    pub relations: HashMap<EntityName, IndexMap<String, Arc<Relation>>>,
    /// Named enum types referenced by [`FieldType::Enum`].
    #[serde(with = "schema_enums")]
    #[serde(default)]
    pub enums: HashMap<String, Arc<EnumType>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityName(pub String);

impl EntityName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// A named collection of typed fields. Exactly one field is the primary key
/// (a globally unique string with [`FieldType::Id`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: EntityName,
    #[serde(with = "entity_fields")]
    pub fields: IndexMap<String, Arc<EntityField>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
}

impl EntityField {
    pub fn new(name: &str, type_: FieldType) -> Self {
        Self {
            name: name.to_owned(),
            type_,
            nullable: false,
            indexed: false,
            unique: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    /// The primary key: a globally unique string.
    Id,
    String,
    /// Double precision float.
    Number,
    Boolean,
    /// ISO-8601 UTC string.
    Date,
    /// Arbitrary JSON document.
    Json,
    /// A named enum type declared in [`Schema::enums`].
    Enum(String),
    /// A foreign key column holding an id of the target entity.
    Ref(EntityName),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumType {
    pub name: String,
    pub variants: Vec<String>,
}

/// A named relation between two entities, polymorphic over the two variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub name: String,
    #[serde(flatten)]
    pub kind: RelationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RelationKind {
    /// The owning side: `local_column` on this entity references `target.id`.
    One {
        target: EntityName,
        local_column: String,
    },
    /// The inverse side: rows of `target` whose `foreign_column` equals this
    /// row's `id`.
    Many {
        target: EntityName,
        foreign_column: String,
    },
}

impl Relation {
    pub fn one(name: &str, target: &str, local_column: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: RelationKind::One {
                target: EntityName::from(target),
                local_column: local_column.to_owned(),
            },
        }
    }

    pub fn many(name: &str, target: &str, foreign_column: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: RelationKind::Many {
                target: EntityName::from(target),
                foreign_column: foreign_column.to_owned(),
            },
        }
    }

    pub fn target(&self) -> &EntityName {
        match &self.kind {
            RelationKind::One { target, .. } => target,
            RelationKind::Many { target, .. } => target,
        }
    }

    /// The column on the owning entity that stores the foreign key, if this
    /// is a `one` relation.
    pub fn local_column(&self) -> Option<&str> {
        match &self.kind {
            RelationKind::One { local_column, .. } => Some(local_column),
            RelationKind::Many { .. } => None,
        }
    }

    /// The column on the target entity that points back at the owner, if this
    /// is a `many` relation.
    pub fn foreign_column(&self) -> Option<&str> {
        match &self.kind {
            RelationKind::Many { foreign_column, .. } => Some(foreign_column),
            RelationKind::One { .. } => None,
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self.kind, RelationKind::Many { .. })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("entity `{0}` already exists")]
    EntityAlreadyExists(String),
    #[error("no such entity: `{0}`")]
    NoSuchEntity(String),
    #[error("entity `{0}` has no `id` field")]
    MissingId(String),
    #[error("entity `{0}` declares more than one id field")]
    DuplicateId(String),
    #[error("entity `{entity}`: no such field `{field}`")]
    NoSuchField { entity: String, field: String },
    #[error("entity `{entity}`: relation `{relation}` targets unknown entity `{target}`")]
    BadRelationTarget {
        entity: String,
        relation: String,
        target: String,
    },
    #[error("entity `{entity}`: relation `{relation}` names column `{column}` which is not a reference or id column")]
    BadRelationColumn {
        entity: String,
        relation: String,
        column: String,
    },
    #[error("field `{field}` of entity `{entity}` references unknown enum `{name}`")]
    NoSuchEnum {
        entity: String,
        field: String,
        name: String,
    },
}

impl Entity {
    pub fn new(name: &str, fields: Vec<EntityField>) -> Self {
        let fields = fields
            .into_iter()
            .map(|f| (f.name.clone(), Arc::new(f)))
            .collect();
        Self {
            name: EntityName::from(name),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Arc<EntityField>> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// All fields other than the id.
    pub fn value_fields(&self) -> impl Iterator<Item = &Arc<EntityField>> {
        self.fields
            .values()
            .filter(|f| !matches!(f.type_, FieldType::Id))
    }

    pub fn id_field(&self) -> Option<&Arc<EntityField>> {
        self.fields
            .values()
            .find(|f| matches!(f.type_, FieldType::Id))
    }
}

impl Schema {
    pub fn new(entities: Vec<Entity>) -> Result<Self, SchemaError> {
        let mut schema = Schema::default();
        for entity in entities {
            schema.add_entity(entity)?;
        }
        Ok(schema)
    }

    pub fn add_entity(&mut self, entity: Entity) -> Result<(), SchemaError> {
        if self.entities.contains_key(&entity.name) {
            return Err(SchemaError::EntityAlreadyExists(entity.name.0.clone()));
        }
        let ids = entity
            .fields
            .values()
            .filter(|f| matches!(f.type_, FieldType::Id))
            .count();
        match ids {
            0 => return Err(SchemaError::MissingId(entity.name.0.clone())),
            1 => {}
            _ => return Err(SchemaError::DuplicateId(entity.name.0.clone())),
        }
        self.entities
            .insert(entity.name.clone(), Arc::new(entity));
        Ok(())
    }

    pub fn add_enum(&mut self, enum_: EnumType) {
        self.enums.insert(enum_.name.clone(), Arc::new(enum_));
    }

    pub fn add_relation(&mut self, owner: &str, relation: Relation) -> Result<(), SchemaError> {
        let owner = EntityName::from(owner);
        let owner_entity = self
            .entities
            .get(&owner)
            .ok_or_else(|| SchemaError::NoSuchEntity(owner.0.clone()))?
            .clone();
        if !self.entities.contains_key(relation.target()) {
            return Err(SchemaError::BadRelationTarget {
                entity: owner.0.clone(),
                relation: relation.name.clone(),
                target: relation.target().0.clone(),
            });
        }

        // The FK column must exist on whichever side stores it and must be a
        // reference or id column.
        let (column_entity, column) = match &relation.kind {
            RelationKind::One { local_column, .. } => (&owner_entity, local_column),
            RelationKind::Many { foreign_column, .. } => (
                self.entities.get(relation.target()).unwrap(),
                foreign_column,
            ),
        };
        match column_entity.field(column) {
            Some(field) => {
                if !matches!(field.type_, FieldType::Ref(_) | FieldType::Id) {
                    return Err(SchemaError::BadRelationColumn {
                        entity: owner.0.clone(),
                        relation: relation.name.clone(),
                        column: column.clone(),
                    });
                }
            }
            None => {
                return Err(SchemaError::NoSuchField {
                    entity: column_entity.name.0.clone(),
                    field: column.clone(),
                })
            }
        }

        self.relations
            .entry(owner)
            .or_insert_with(IndexMap::new)
            .insert(relation.name.clone(), Arc::new(relation));
        Ok(())
    }

    pub fn entity(&self, name: &EntityName) -> Result<&Arc<Entity>, SchemaError> {
        self.entities
            .get(name)
            .ok_or_else(|| SchemaError::NoSuchEntity(name.0.clone()))
    }

    pub fn relations_of(&self, entity: &EntityName) -> impl Iterator<Item = &Arc<Relation>> {
        self.relations
            .get(entity)
            .into_iter()
            .flat_map(|rels| rels.values())
    }

    pub fn relation(&self, entity: &EntityName, name: &str) -> Option<&Arc<Relation>> {
        self.relations.get(entity).and_then(|rels| rels.get(name))
    }

    /// Looks up the enum type behind a field, if the field is enum-typed.
    pub fn enum_of(&self, field: &EntityField) -> Option<&Arc<EnumType>> {
        match &field.type_ {
            FieldType::Enum(name) => self.enums.get(name),
            _ => None,
        }
    }
}

serde_map_as_vec!(mod schema_entities, HashMap<EntityName, Arc<Entity>>, name);
serde_map_as_vec!(mod entity_fields, IndexMap<String, Arc<EntityField>>, name);
serde_map_as_tuples!(mod schema_relations, HashMap<EntityName, IndexMap<String, Arc<Relation>>>);
serde_map_as_vec!(mod schema_enums, HashMap<String, Arc<EnumType>>, name);

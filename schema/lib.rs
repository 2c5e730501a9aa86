#[macro_use]
mod serde_with;

pub mod predicate;
pub mod query;
pub mod schema;
pub mod value;

pub use crate::predicate::{CmpOp, Comparison, Predicate};
pub use crate::query::{Include, IncludeChild, QueryHash, RawQuery, Sort};
pub use crate::schema::{Entity, EntityField, EntityName, EnumType, FieldType, Relation, Schema};
pub use crate::value::{FieldMeta, MaterializedField, MaterializedNode, MaterializedValue, Timestamp};

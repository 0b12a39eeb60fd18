//! Rillfilter: JSON filter expressions compiled to Postgres queries over a
//! relation graph.

mod apply;
pub mod builder;
pub mod eager;
mod error;
pub mod filter;
pub mod metrics;
mod path;
pub mod query;
pub mod relation;
pub mod schema;
pub mod testing;

pub use builder::{BuiltQuery, FilterConfig, FilterParams, FilterQueryBuilder, build_filter};
pub use eager::EagerSpec;
pub use error::{Error, Result, WithContext};
pub use filter::{FilterExpression, OperatorRegistry};
pub use path::PropertyPath;
pub use relation::RelationExpression;
pub use schema::{EntitySchema, Relation, RelationKind, SchemaRegistry, Through};

pub mod prelude {
    pub use crate::{
        EntitySchema, FilterParams, FilterQueryBuilder, Relation, Result, SchemaRegistry,
    };
}

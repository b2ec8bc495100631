//! Ontograph runtime.
//!
//! Binds registered typed models to a storage backend and provides:
//!
//! - [`Ontology`] / [`OntologyBuilder`]: the type registry, schema
//!   validation and the migration engine
//! - [`Session`]: intents, atomic commits, commit-with-event and the
//!   event handler loop
//! - [`QueryBuilder`]: typed reads with temporal windows, aggregations,
//!   group-by and relation traversals

pub mod migration;
pub mod ontology;
pub mod query;
pub mod session;

pub use migration::{MigrationPreview, MigrationResult, Upgrader, UpgraderMap};
pub use ontology::{Ontology, OntologyBuilder};
pub use query::{
    EntityNode, EntityQuery, GroupedQuery, QueryBuilder, RelationHop, RelationMatch,
    RelationQuery, TraversalPath, TraversalQuery,
};
pub use session::{EventHandler, HandlerContext, Intent, Session};

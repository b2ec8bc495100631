//! Ontograph core: typed model, schema descriptors, filters and events.
//!
//! This crate holds everything the storage backends and the runtime share:
//!
//! - `schema` / `type_spec`: content-addressed schema descriptors
//! - `model`: the `EntityModel` / `RelationModel` traits
//! - `filter`: the structured predicate tree
//! - `event` / `cron`: the durable event model and schedule grammar
//! - `config` / `error`: the explicit runtime configuration and the error
//!   vocabulary shared across the workspace

pub mod canonical;
pub mod config;
pub mod cron;
pub mod error;
pub mod event;
pub mod filter;
pub mod model;
pub mod schema;
pub mod type_spec;

pub use canonical::{canonical_json, canonicalize, ContentHash};
pub use config::OntologyConfig;
pub use cron::CronSpec;
pub use error::{OntoError, Result};
pub use event::{
    ClaimRecord, ClaimedEvent, DeadLetterRecord, DeadLetterSummary, EventDeadLetter,
    EventInspection, EventPayload, EventRecord, EventStatus, EventSummary, NamespaceInfo,
    Schedule, SessionRecord, DEFAULT_EVENT_PRIORITY,
};
pub use filter::{
    field, left_field, right_field, CompareOp, FieldPath, FieldRef, Filter, PathRoot,
};
pub use model::{
    from_field_map, normalize_instance_key, to_field_map, EntityModel, Hydrated, Meta,
    RelationModel,
};
pub use schema::{
    diff_schemas, is_legacy_type_spec_upgrade, ActivationRecord, EntitySchema, FieldSpec,
    RelationSchema, SchemaVersionRecord, TypeKind, TypeName, TypeSchemaDiff,
};
pub use type_spec::{synthesize_type_spec_from_legacy, ScalarType, TypeSpec};

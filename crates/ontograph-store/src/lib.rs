//! Ontograph storage backends.
//!
//! Two semantically equivalent backends behind one repository contract:
//!
//! - [`SqliteStore`]: a single embedded database file; commit-with-event
//!   is fully atomic here.
//! - [`ObjectStore`]: per-commit immutable Parquet segments, a CAS'd head
//!   object and a leased lock object over any [`ObjectClient`].
//!
//! Sessions bind to `Arc<dyn OntoBackend>` and never branch on the
//! variant.

pub mod object;
pub mod repository;
pub mod sql;
pub mod sqlite;
pub mod target;

use std::sync::Arc;

use ontograph_core::{OntologyConfig, Result};

pub use object::{MemoryObjectClient, ObjectClient, ObjectStore, PutCondition};
pub use repository::{
    AggFunc, AggSpec, BackendKind, ChangeOp, CommitChange, CommitRecord, DiagnosticReason,
    EndpointTypes, EntityRow, EventStore, Having, OntoBackend, QueryDiagnostics, QuerySpec,
    ReadWindow, RelationRow, Repository, SessionListing, StorageInfo, TraversalSide,
};
pub use sqlite::SqliteStore;
pub use target::StorageTarget;

/// Open a backend from a connection string.
///
/// `sqlite:///<path>` (or a bare path, `:memory:` permitted) opens the
/// embedded backend. `s3://<bucket>/<prefix>` requires an object client;
/// use [`open_object_store`] to supply one.
pub fn open_store(datastore_uri: &str, config: OntologyConfig) -> Result<Arc<dyn OntoBackend>> {
    match StorageTarget::parse(datastore_uri)? {
        StorageTarget::Sqlite { path, .. } => {
            Ok(Arc::new(SqliteStore::open(&path, config)?) as Arc<dyn OntoBackend>)
        }
        StorageTarget::Object { .. } => Err(ontograph_core::OntoError::backend(
            "open_store",
            "object targets need an object client; use open_object_store",
        )),
    }
}

/// Open the object backend for an `s3://` target with the given client.
pub fn open_object_store(
    datastore_uri: &str,
    client: Arc<dyn ObjectClient>,
    config: OntologyConfig,
) -> Result<Arc<dyn OntoBackend>> {
    match StorageTarget::parse(datastore_uri)? {
        StorageTarget::Object { bucket, prefix, .. } => {
            Ok(Arc::new(ObjectStore::new(client, &bucket, &prefix, config)) as Arc<dyn OntoBackend>)
        }
        StorageTarget::Sqlite { .. } => Err(ontograph_core::OntoError::backend(
            "open_object_store",
            "not an object-store target",
        )),
    }
}

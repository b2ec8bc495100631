//! Object-store backend: client contract, repository and event queue.

mod client;
mod events;
mod segment;
mod store;

pub use client::{MemoryObjectClient, ObjectClient, ObjectError, ObjectResult, PutCondition};
pub use store::ObjectStore;

//! Object client contract.
//!
//! The concrete cloud client (HTTP, signing, retries) is an external
//! collaborator; the backend only needs conditional get/put/delete/list
//! with ETags. An in-memory implementation backs the tests and local use.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Failures surfaced by an object client.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    /// A conditional write (`If-Match` / `If-None-Match`) lost the race.
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("object backend error: {0}")]
    Backend(String),
}

pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// Write precondition for [`ObjectClient::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional overwrite.
    None,
    /// Create only if the key does not exist.
    IfNoneMatch,
    /// Replace only if the stored ETag matches.
    IfMatch(String),
}

/// Minimal object-store surface: ETagged reads, conditional writes,
/// prefix listing.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Fetch an object and its ETag; `None` when absent.
    async fn get(&self, key: &str) -> ObjectResult<Option<(Vec<u8>, String)>>;

    /// Write an object, honoring the precondition; returns the new ETag.
    async fn put(&self, key: &str, bytes: Vec<u8>, condition: PutCondition)
        -> ObjectResult<String>;

    /// Delete an object. No-op when absent.
    async fn delete(&self, key: &str) -> ObjectResult<()>;

    /// All keys under a prefix, lexicographically sorted.
    async fn list(&self, prefix: &str) -> ObjectResult<Vec<String>>;
}

/// In-memory object client for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ObjectResult<std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, String)>>> {
        self.objects
            .lock()
            .map_err(|_| ObjectError::Backend("object map mutex poisoned".to_string()))
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn get(&self, key: &str) -> ObjectResult<Option<(Vec<u8>, String)>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        condition: PutCondition,
    ) -> ObjectResult<String> {
        let mut objects = self.lock()?;
        match (&condition, objects.get(key)) {
            (PutCondition::IfNoneMatch, Some(_)) => return Err(ObjectError::PreconditionFailed),
            (PutCondition::IfMatch(expected), Some((_, etag))) if expected != etag => {
                return Err(ObjectError::PreconditionFailed)
            }
            (PutCondition::IfMatch(_), None) => return Err(ObjectError::PreconditionFailed),
            _ => {}
        }
        let etag = Uuid::new_v4().to_string();
        objects.insert(key.to_string(), (bytes, etag.clone()));
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> ObjectResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> ObjectResult<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let client = MemoryObjectClient::new();
        let etag = client.put("a/b.json", b"hi".to_vec(), PutCondition::None).await.unwrap();
        let (bytes, got_etag) = client.get("a/b.json").await.unwrap().unwrap();
        assert_eq!(bytes, b"hi");
        assert_eq!(got_etag, etag);
    }

    #[tokio::test]
    async fn if_none_match_create_only() {
        let client = MemoryObjectClient::new();
        client.put("k", b"1".to_vec(), PutCondition::IfNoneMatch).await.unwrap();
        let err = client.put("k", b"2".to_vec(), PutCondition::IfNoneMatch).await.unwrap_err();
        assert!(matches!(err, ObjectError::PreconditionFailed));
    }

    #[tokio::test]
    async fn if_match_requires_current_etag() {
        let client = MemoryObjectClient::new();
        let etag = client.put("k", b"1".to_vec(), PutCondition::None).await.unwrap();
        client.put("k", b"2".to_vec(), PutCondition::IfMatch(etag)).await.unwrap();
        let err = client
            .put("k", b"3".to_vec(), PutCondition::IfMatch("stale".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectError::PreconditionFailed));
    }

    #[tokio::test]
    async fn list_by_prefix_sorted() {
        let client = MemoryObjectClient::new();
        for key in ["x/2", "x/1", "y/1"] {
            client.put(key, b"v".to_vec(), PutCondition::None).await.unwrap();
        }
        assert_eq!(client.list("x/").await.unwrap(), vec!["x/1", "x/2"]);
    }
}

//! Storage target resolution.
//!
//! Accepts `sqlite:///<path>` (or a bare filesystem path, `:memory:`
//! included) for the embedded backend, and `s3://<bucket>/<prefix>` for the
//! object-store backend.

use ontograph_core::{OntoError, Result};

/// Which backend a connection string resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Sqlite { path: String, uri: String },
    Object { bucket: String, prefix: String, uri: String },
}

impl StorageTarget {
    pub fn parse(datastore_uri: &str) -> Result<Self> {
        if let Some(rest) = datastore_uri.strip_prefix("sqlite://") {
            // sqlite:///relative, sqlite:////abs/path, sqlite:///:memory:
            let mut path = rest.to_string();
            if let Some(stripped) = path.strip_prefix('/') {
                path = stripped.to_string();
            }
            if path == ":memory:" || path == "/:memory:" {
                path = ":memory:".to_string();
            }
            if path.is_empty() {
                return Err(OntoError::backend(
                    "parse_storage_uri",
                    format!("invalid sqlite URI: {datastore_uri}"),
                ));
            }
            return Ok(StorageTarget::Sqlite { path, uri: datastore_uri.to_string() });
        }

        if let Some(rest) = datastore_uri.strip_prefix("s3://") {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(OntoError::backend(
                    "parse_storage_uri",
                    format!("invalid s3 URI: {datastore_uri}"),
                ));
            }
            return Ok(StorageTarget::Object {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                uri: datastore_uri.to_string(),
            });
        }

        if let Some((scheme, _)) = datastore_uri.split_once("://") {
            return Err(OntoError::backend(
                "parse_storage_uri",
                format!("unsupported storage URI scheme '{scheme}' for '{datastore_uri}'"),
            ));
        }

        // Bare path denotes embedded SQL.
        Ok(StorageTarget::Sqlite {
            path: datastore_uri.to_string(),
            uri: format!("sqlite:///{datastore_uri}"),
        })
    }

    pub fn uri(&self) -> &str {
        match self {
            StorageTarget::Sqlite { uri, .. } | StorageTarget::Object { uri, .. } => uri,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_is_sqlite() {
        let t = StorageTarget::parse("onto.db").unwrap();
        assert_eq!(
            t,
            StorageTarget::Sqlite { path: "onto.db".into(), uri: "sqlite:///onto.db".into() }
        );
    }

    #[test]
    fn sqlite_uri_forms() {
        match StorageTarget::parse("sqlite:///data/onto.db").unwrap() {
            StorageTarget::Sqlite { path, .. } => assert_eq!(path, "data/onto.db"),
            other => panic!("unexpected target: {other:?}"),
        }
        match StorageTarget::parse("sqlite:///:memory:").unwrap() {
            StorageTarget::Sqlite { path, .. } => assert_eq!(path, ":memory:"),
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn s3_uri_forms() {
        match StorageTarget::parse("s3://bucket/some/prefix/").unwrap() {
            StorageTarget::Object { bucket, prefix, .. } => {
                assert_eq!(bucket, "bucket");
                assert_eq!(prefix, "some/prefix");
            }
            other => panic!("unexpected target: {other:?}"),
        }
        match StorageTarget::parse("s3://bucket").unwrap() {
            StorageTarget::Object { prefix, .. } => assert_eq!(prefix, ""),
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(StorageTarget::parse("postgres://x/y").is_err());
        assert!(StorageTarget::parse("s3://").is_err());
    }
}

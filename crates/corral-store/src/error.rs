use thiserror::Error;

/// Errors surfaced by [`crate::ObjectStore`] backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No document under the given bucket/key.
    #[error("no object {key:?} in bucket {bucket:?}")]
    NotFound { bucket: String, key: String },

    /// An etag-conditional write found a different etag than expected.
    /// Callers are expected to re-read and retry.
    #[error("etag conflict on {bucket}/{key}")]
    EtagConflict { bucket: String, key: String },

    /// The backend itself failed (connection loss, I/O, corrupt row).
    #[error("store backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    }

    pub fn etag_conflict(bucket: &str, key: &str) -> Self {
        Self::EtagConflict {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    }

    /// True for conflicts that a re-read-and-retry loop can resolve.
    pub fn is_etag_conflict(&self) -> bool {
        matches!(self, Self::EtagConflict { .. })
    }
}

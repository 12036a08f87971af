//! Transactional object store used by the waitlist scheduler.
//!
//! The store is a bucketed key/value space holding JSON documents. Writes
//! carry optimistic-concurrency etags, reads can filter on indexed fields of
//! the stored document, and small sets of writes can be applied atomically.
//!
//! Two backends implement [`ObjectStore`]: [`memory::MemoryStore`] for tests
//! and standalone deployments, and [`postgres::PgStore`] for durable
//! cross-process state.

pub mod config;
pub mod error;
pub mod filter;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

pub use config::StoreConfig;
pub use error::StoreError;
pub use filter::Filter;

/// Opaque version tag for optimistic concurrency. A fresh etag is assigned
/// on every successful write.
pub type Etag = String;

/// A document read back from the store, together with its current etag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub key: String,
    pub value: Value,
    pub etag: Etag,
}

/// One operation in an atomic [`ObjectStore::batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        bucket: String,
        key: String,
        value: Value,
        /// When set, the write only succeeds if the stored etag matches.
        expected: Option<Etag>,
    },
    Delete {
        bucket: String,
        key: String,
    },
}

/// Sort direction for a [`SortKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// One component of a multi-key sort over document fields.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub field: String,
    pub order: Order,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: Order::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: Order::Desc,
        }
    }
}

/// Options for [`ObjectStore::find`].
///
/// `limit` is a request, not a promise: results are additionally capped at
/// the backend's per-query page cap, so callers that need more must page
/// with `offset`.
#[derive(Debug, Clone, Default)]
pub struct FindOpts {
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl FindOpts {
    pub fn sorted(sort: Vec<SortKey>) -> Self {
        Self {
            sort,
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Bucketed JSON document store with optimistic concurrency.
///
/// # Object Safety
///
/// The trait is object-safe so backends can be selected at runtime and
/// shared as `Arc<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a document. With `expected = Some(etag)` the write only lands
    /// if the stored etag still matches (fails with
    /// [`StoreError::EtagConflict`] otherwise); with `None` it is an
    /// unconditional upsert. Returns the new etag.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        expected: Option<&str>,
    ) -> Result<Etag, StoreError>;

    /// Read a document, or [`StoreError::NotFound`].
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError>;

    /// Delete a document. Deleting a missing key is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Query a bucket by a filter over document fields, with sort, limit
    /// and offset. Never returns more than [`ObjectStore::page_cap`] rows.
    async fn find(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOpts,
    ) -> Result<Vec<StoredObject>, StoreError>;

    /// Apply a small set of puts/deletes atomically. Etag expectations are
    /// verified before any write lands; a conflict aborts the whole batch.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Upper bound on rows returned by a single [`ObjectStore::find`].
    fn page_cap(&self) -> usize;
}

// Compile-time assertion: ObjectStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ObjectStore) {}
};

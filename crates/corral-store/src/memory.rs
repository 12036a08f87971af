//! In-memory [`ObjectStore`] backend.
//!
//! Holds every bucket in a `RwLock`-guarded map. Used by the test suite and
//! by standalone single-process deployments; semantics (etags, page cap,
//! atomic batches) match the durable backend.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::filter::{Filter, compare_values};
use crate::{BatchOp, Etag, FindOpts, ObjectStore, Order, SortKey, StoreError, StoredObject};

const DEFAULT_PAGE_CAP: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    etag: Etag,
}

/// In-process store backend.
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Entry>>>,
    page_cap: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_cap(DEFAULT_PAGE_CAP)
    }

    /// Build a store with a non-default per-query page cap. Tests use small
    /// caps to exercise paging without thousands of rows.
    pub fn with_page_cap(page_cap: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            page_cap,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_etag() -> Etag {
    Uuid::new_v4().simple().to_string()
}

fn sort_objects(objects: &mut [StoredObject], sort: &[SortKey]) {
    objects.sort_by(|a, b| {
        for key in sort {
            let va = a.value.get(&key.field);
            let vb = b.value.get(&key.field);
            let ord = match (va, vb) {
                (Some(va), Some(vb)) => {
                    compare_values(va, vb).unwrap_or(Ordering::Equal)
                }
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ord = match key.order {
                Order::Asc => ord,
                Order::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        expected: Option<&str>,
    ) -> Result<Etag, StoreError> {
        let mut buckets = self.buckets.write().expect("store lock poisoned");
        let bucket_map = buckets.entry(bucket.to_owned()).or_default();

        if let Some(expected) = expected {
            match bucket_map.get(key) {
                Some(entry) if entry.etag == expected => {}
                _ => return Err(StoreError::etag_conflict(bucket, key)),
            }
        }

        let etag = new_etag();
        bucket_map.insert(
            key.to_owned(),
            Entry {
                value,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let buckets = self.buckets.read().expect("store lock poisoned");
        buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|entry| StoredObject {
                key: key.to_owned(),
                value: entry.value.clone(),
                etag: entry.etag.clone(),
            })
            .ok_or_else(|| StoreError::not_found(bucket, key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write().expect("store lock poisoned");
        if let Some(bucket_map) = buckets.get_mut(bucket) {
            bucket_map.remove(key);
        }
        Ok(())
    }

    async fn find(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOpts,
    ) -> Result<Vec<StoredObject>, StoreError> {
        let buckets = self.buckets.read().expect("store lock poisoned");
        let mut matched: Vec<StoredObject> = buckets
            .get(bucket)
            .map(|bucket_map| {
                bucket_map
                    .iter()
                    .filter(|(_, entry)| filter.matches(&entry.value))
                    .map(|(key, entry)| StoredObject {
                        key: key.clone(),
                        value: entry.value.clone(),
                        etag: entry.etag.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        drop(buckets);

        sort_objects(&mut matched, &opts.sort);

        let limit = opts.limit.unwrap_or(self.page_cap).min(self.page_cap);
        Ok(matched
            .into_iter()
            .skip(opts.offset)
            .take(limit)
            .collect())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write().expect("store lock poisoned");

        // Verify every etag expectation before any write lands.
        for op in &ops {
            if let BatchOp::Put {
                bucket,
                key,
                expected: Some(expected),
                ..
            } = op
            {
                match buckets.get(bucket).and_then(|b| b.get(key)) {
                    Some(entry) if &entry.etag == expected => {}
                    _ => return Err(StoreError::etag_conflict(bucket, key)),
                }
            }
        }

        for op in ops {
            match op {
                BatchOp::Put {
                    bucket, key, value, ..
                } => {
                    buckets.entry(bucket).or_default().insert(
                        key,
                        Entry {
                            value,
                            etag: new_etag(),
                        },
                    );
                }
                BatchOp::Delete { bucket, key } => {
                    if let Some(bucket_map) = buckets.get_mut(&bucket) {
                        bucket_map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn page_cap(&self) -> usize {
        self.page_cap
    }
}

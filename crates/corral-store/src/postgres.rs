//! PostgreSQL [`ObjectStore`] backend.
//!
//! All buckets live in one `store_objects` table with a JSONB document
//! column; filters render to parameterized SQL over `value->>'field'`
//! expressions, which the schema indexes. Etag checks use conditional
//! UPDATEs so optimistic concurrency holds across processes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::filter::Filter;
use crate::{BatchOp, Etag, FindOpts, ObjectStore, Order, StoreError, StoredObject};

/// The object table schema, shipped in-crate. Every statement is
/// `IF NOT EXISTS`, so applying it on each connect is idempotent and no
/// migration ledger is needed for a single-table store.
const SCHEMA_SQL: &str = include_str!("../schema/objects.sql");

/// SQLSTATE raised when connecting to a database that does not exist.
const UNDEFINED_DATABASE: &str = "3D000";

/// SQLSTATE raised when `CREATE DATABASE` loses a race to another process.
const DUPLICATE_DATABASE: &str = "42P04";

/// Durable store backend.
pub struct PgStore {
    pool: PgPool,
    page_cap: usize,
}

impl PgStore {
    pub fn new(pool: PgPool, page_cap: usize) -> Self {
        Self { pool, page_cap }
    }

    /// Connect to the store database and make it ready for traffic.
    ///
    /// The database is only created when the first connection attempt
    /// reports it missing; the schema is then applied idempotently. Safe
    /// to call from several processes at once -- a lost creation race is
    /// treated as success.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = match open_pool(&config.database_url).await {
            Ok(pool) => pool,
            Err(err) if has_sqlstate(&err, UNDEFINED_DATABASE) => {
                create_store_database(config).await?;
                open_pool(&config.database_url).await.with_context(|| {
                    format!(
                        "failed to connect to freshly created store at {}",
                        config.database_url
                    )
                })?
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)).with_context(|| {
                    format!("failed to connect to store at {}", config.database_url)
                });
            }
        };

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to apply store schema")?;
        info!("store schema ready");

        Ok(Self::new(pool, config.page_cap))
    }
}

async fn open_pool(url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
}

fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(code),
        _ => false,
    }
}

/// Issue `CREATE DATABASE` for the store through the maintenance database.
///
/// The name cannot be parameterised, so it is embedded as a quoted
/// identifier -- any database name the URL can carry is accepted.
async fn create_store_database(config: &StoreConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("store URL has no database name")?;

    let maint = open_pool(&config.maintenance_url()).await.with_context(|| {
        format!(
            "failed to reach the maintenance database at {}",
            config.maintenance_url()
        )
    })?;

    let stmt = format!("CREATE DATABASE \"{}\"", name.replace('"', "\"\""));
    let result = maint.execute(stmt.as_str()).await;
    maint.close().await;

    match result {
        Ok(_) => {
            info!(database = name, "created store database");
            Ok(())
        }
        // Another process created it between our connect and this point.
        Err(err) if has_sqlstate(&err, DUPLICATE_DATABASE) => Ok(()),
        Err(err) => Err(anyhow::Error::new(err))
            .with_context(|| format!("failed to create store database {name:?}")),
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn new_etag() -> Etag {
    Uuid::new_v4().simple().to_string()
}

/// Render a comparison leaf. The SQL shape depends on the scalar type of
/// the comparison value; non-scalar values never match.
fn push_cmp(qb: &mut QueryBuilder<'_, Postgres>, field: &str, op: &str, value: &Value) {
    match value {
        Value::String(s) => {
            qb.push("(value->>");
            qb.push_bind(field.to_owned());
            qb.push(") ");
            qb.push(op);
            qb.push(" ");
            qb.push_bind(s.clone());
        }
        Value::Number(n) => {
            qb.push("((value->>");
            qb.push_bind(field.to_owned());
            qb.push(")::float8) ");
            qb.push(op);
            qb.push(" ");
            qb.push_bind(n.as_f64().unwrap_or(f64::NAN));
        }
        Value::Bool(b) => {
            qb.push("((value->>");
            qb.push_bind(field.to_owned());
            qb.push(")::boolean) ");
            qb.push(op);
            qb.push(" ");
            qb.push_bind(*b);
        }
        _ => {
            qb.push("FALSE");
        }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Eq(field, value) => push_cmp(qb, field, "=", value),
        Filter::Ne(field, value) => push_cmp(qb, field, "<>", value),
        Filter::Le(field, value) => push_cmp(qb, field, "<=", value),
        Filter::Ge(field, value) => push_cmp(qb, field, ">=", value),
        Filter::And(filters) => {
            if filters.is_empty() {
                qb.push("TRUE");
                return;
            }
            qb.push("(");
            for (i, f) in filters.iter().enumerate() {
                if i > 0 {
                    qb.push(" AND ");
                }
                push_filter(qb, f);
            }
            qb.push(")");
        }
        Filter::Or(filters) => {
            if filters.is_empty() {
                qb.push("FALSE");
                return;
            }
            qb.push("(");
            for (i, f) in filters.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                push_filter(qb, f);
            }
            qb.push(")");
        }
    }
}

#[async_trait]
impl ObjectStore for PgStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        expected: Option<&str>,
    ) -> Result<Etag, StoreError> {
        let etag = new_etag();
        match expected {
            None => {
                sqlx::query(
                    "INSERT INTO store_objects (bucket, key, value, etag) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (bucket, key) DO UPDATE \
                     SET value = EXCLUDED.value, etag = EXCLUDED.etag, updated_at = NOW()",
                )
                .bind(bucket)
                .bind(key)
                .bind(&value)
                .bind(&etag)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE store_objects \
                     SET value = $3, etag = $4, updated_at = NOW() \
                     WHERE bucket = $1 AND key = $2 AND etag = $5",
                )
                .bind(bucket)
                .bind(key)
                .bind(&value)
                .bind(&etag)
                .bind(expected)
                .execute(&self.pool)
                .await
                .map_err(backend)?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::etag_conflict(bucket, key));
                }
            }
        }
        Ok(etag)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let row = sqlx::query(
            "SELECT value, etag FROM store_objects WHERE bucket = $1 AND key = $2",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::not_found(bucket, key))?;

        Ok(StoredObject {
            key: key.to_owned(),
            value: row.try_get("value").map_err(backend)?,
            etag: row.try_get("etag").map_err(backend)?,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM store_objects WHERE bucket = $1 AND key = $2")
            .bind(bucket)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn find(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOpts,
    ) -> Result<Vec<StoredObject>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT key, value, etag FROM store_objects WHERE bucket = ",
        );
        qb.push_bind(bucket.to_owned());
        qb.push(" AND ");
        push_filter(&mut qb, filter);

        for (i, sort) in opts.sort.iter().enumerate() {
            qb.push(if i == 0 { " ORDER BY " } else { ", " });
            qb.push("value->>");
            qb.push_bind(sort.field.clone());
            qb.push(match sort.order {
                Order::Asc => " ASC",
                Order::Desc => " DESC",
            });
        }

        let limit = opts.limit.unwrap_or(self.page_cap).min(self.page_cap);
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(opts.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredObject {
                    key: row.try_get("key").map_err(backend)?,
                    value: row.try_get("value").map_err(backend)?,
                    etag: row.try_get("etag").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        for op in ops {
            match op {
                BatchOp::Put {
                    bucket,
                    key,
                    value,
                    expected: None,
                } => {
                    sqlx::query(
                        "INSERT INTO store_objects (bucket, key, value, etag) \
                         VALUES ($1, $2, $3, $4) \
                         ON CONFLICT (bucket, key) DO UPDATE \
                         SET value = EXCLUDED.value, etag = EXCLUDED.etag, updated_at = NOW()",
                    )
                    .bind(&bucket)
                    .bind(&key)
                    .bind(&value)
                    .bind(new_etag())
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?;
                }
                BatchOp::Put {
                    bucket,
                    key,
                    value,
                    expected: Some(expected),
                } => {
                    let result = sqlx::query(
                        "UPDATE store_objects \
                         SET value = $3, etag = $4, updated_at = NOW() \
                         WHERE bucket = $1 AND key = $2 AND etag = $5",
                    )
                    .bind(&bucket)
                    .bind(&key)
                    .bind(&value)
                    .bind(new_etag())
                    .bind(&expected)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?;

                    if result.rows_affected() == 0 {
                        // Dropping the transaction rolls back everything
                        // already applied in this batch.
                        return Err(StoreError::etag_conflict(&bucket, &key));
                    }
                }
                BatchOp::Delete { bucket, key } => {
                    sqlx::query("DELETE FROM store_objects WHERE bucket = $1 AND key = $2")
                        .bind(&bucket)
                        .bind(&key)
                        .execute(&mut *tx)
                        .await
                        .map_err(backend)?;
                }
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    fn page_cap(&self) -> usize {
        self.page_cap
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    //! These tests need a reachable PostgreSQL instance (set
    //! `CORRAL_DATABASE_URL`), so they are ignored by default:
    //!
    //! ```text
    //! cargo test -p corral-store -- --ignored
    //! ```

    use super::*;
    use serde_json::json;

    async fn test_store() -> PgStore {
        let config = StoreConfig::from_env();
        PgStore::connect(&config)
            .await
            .expect("failed to connect to test database")
    }

    fn unique_bucket() -> String {
        format!("test_{}", Uuid::new_v4().simple())
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn put_get_delete_roundtrip() {
        let store = test_store().await;
        let bucket = unique_bucket();

        let etag = store
            .put(&bucket, "a", json!({"server_id": "s1"}), None)
            .await
            .unwrap();
        let obj = store.get(&bucket, "a").await.unwrap();
        assert_eq!(obj.etag, etag);
        assert_eq!(obj.value["server_id"], "s1");

        store.delete(&bucket, "a").await.unwrap();
        assert!(matches!(
            store.get(&bucket, "a").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn conditional_put_conflicts_on_stale_etag() {
        let store = test_store().await;
        let bucket = unique_bucket();

        let etag = store.put(&bucket, "a", json!({"n": 1}), None).await.unwrap();
        store
            .put(&bucket, "a", json!({"n": 2}), Some(&etag))
            .await
            .unwrap();

        let err = store
            .put(&bucket, "a", json!({"n": 3}), Some(&etag))
            .await
            .unwrap_err();
        assert!(err.is_etag_conflict());

        for key in ["a"] {
            store.delete(&bucket, key).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn find_filters_and_sorts() {
        let store = test_store().await;
        let bucket = unique_bucket();

        for (key, server, created) in [
            ("t1", "s1", "2026-01-01T00:00:00.000Z"),
            ("t2", "s1", "2026-01-01T00:00:01.000Z"),
            ("t3", "s2", "2026-01-01T00:00:02.000Z"),
        ] {
            store
                .put(
                    &bucket,
                    key,
                    json!({"server_id": server, "created_at": created, "status": "queued"}),
                    None,
                )
                .await
                .unwrap();
        }

        let got = store
            .find(
                &bucket,
                &Filter::eq("server_id", "s1"),
                &FindOpts::sorted(vec![crate::SortKey::desc("created_at")]),
            )
            .await
            .unwrap();
        let keys: Vec<&str> = got.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["t2", "t1"]);

        for key in ["t1", "t2", "t3"] {
            store.delete(&bucket, key).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn batch_rolls_back_on_conflict() {
        let store = test_store().await;
        let bucket = unique_bucket();

        store.put(&bucket, "a", json!({"n": 1}), None).await.unwrap();

        let err = store
            .batch(vec![
                BatchOp::Put {
                    bucket: bucket.clone(),
                    key: "b".into(),
                    value: json!({"n": 1}),
                    expected: None,
                },
                BatchOp::Put {
                    bucket: bucket.clone(),
                    key: "a".into(),
                    value: json!({"n": 2}),
                    expected: Some("stale".into()),
                },
            ])
            .await
            .unwrap_err();
        assert!(err.is_etag_conflict());

        // The unconditional put in the same batch must not have landed.
        assert!(matches!(
            store.get(&bucket, "b").await,
            Err(StoreError::NotFound { .. })
        ));

        store.delete(&bucket, "a").await.unwrap();
    }
}

//! Postgres-backed lease store.
//!
//! All timestamps that take part in eligibility or lease comparisons come
//! from the database clock (`NOW()`), so workers on different hosts agree on
//! what "ready" and "expired" mean.
//!
//! ## Claiming
//!
//! A claim is a single statement:
//!
//! ```sql
//! WITH next_item AS (SELECT id ... ORDER BY ready_at, created_at, id
//!                    FOR UPDATE SKIP LOCKED LIMIT 1)
//! UPDATE work_items ... FROM next_item WHERE id = next_item.id RETURNING ...
//! ```
//!
//! Concurrent claimers skip rows another transaction has locked instead of
//! blocking on them, and Postgres re-checks the eligibility predicate on the
//! locked row, so a row is handed to at most one claimer.
//!
//! ## Releasing
//!
//! Success and failure updates are conditional on the full lease
//! (`state = 'claimed'`, `claimed_by`, `claimed_at`, `failure_count`). Zero
//! rows affected means the lease was broken; the caller gets `false`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | LeaseStoreError |
//! |------------|-----------------|
//! | Database (check violation `23514`) | `InvalidInput` |
//! | Database (other) | `Unavailable` |
//! | PoolClosed / Io / Tls / PoolTimedOut | `Unavailable` |
//! | ColumnDecode / Decode | `Decode` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn, Span};

use parley_core::{EligibilityFilter, WorkItem, WorkItemId, WorkKind, WorkState, WorkerId};

use super::{
    truncate_error, ClaimedItem, FailureTransition, FailureUpdate, Lease, LeaseStore,
    LeaseStoreError, NewWorkItem, WorkStats,
};

/// Schema for the `work_items` table.
pub const MIGRATION: &str = include_str!("../../migrations/0001_work_items.sql");

const RETURNING_COLUMNS: &str = r#"
    id, kind, job_type, state, claimed_by, claimed_at, ready_at, next_retry_at,
    failure_count, last_error, payload, result, created_at, updated_at, completed_at
"#;

/// Postgres-backed lease store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: Arc<PgPool>,
}

impl PostgresLeaseStore {
    /// A row this worker just claimed but cannot decode will not decode on a
    /// later attempt either: fail it terminally now instead of holding the
    /// lease until the sweep.
    #[instrument(skip(self, worker, error), fields(work_item_id = %id), err)]
    async fn fail_undecodable(
        &self,
        id: uuid::Uuid,
        worker: &WorkerId,
        error: &LeaseStoreError,
    ) -> Result<(), LeaseStoreError> {
        warn!(error = %error, "claimed work item cannot be decoded; failing it terminally");
        sqlx::query(
            r#"
            UPDATE work_items
            SET state = 'failed_terminal',
                claimed_by = NULL,
                claimed_at = NULL,
                next_retry_at = NULL,
                failure_count = failure_count + 1,
                last_error = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND state = 'claimed'
              AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker.as_str())
        .bind(truncate_error(&error.to_string()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_undecodable", e))?;
        Ok(())
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), LeaseStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Enqueue inside a caller-owned transaction, so the item becomes visible
    /// only if the surrounding business write commits.
    #[instrument(skip(self, tx, item), fields(kind = %item.kind), err)]
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        item: NewWorkItem,
    ) -> Result<WorkItemId, LeaseStoreError> {
        let id = WorkItemId::new();
        insert_query(id, &item)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue_in_tx", e))?;
        Ok(id)
    }
}

fn insert_query(
    id: WorkItemId,
    item: &NewWorkItem,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO work_items (id, kind, job_type, payload, ready_at)
        VALUES ($1, $2, $3, $4, COALESCE($5, NOW()))
        "#,
    )
    .bind(*id.as_uuid())
    .bind(item.kind.tag())
    .bind(item.kind.job_type().map(|t| t.as_str()))
    .bind(&item.payload)
    .bind(item.ready_at)
}

fn to_interval(d: Duration) -> Result<PgInterval, LeaseStoreError> {
    PgInterval::try_from(d)
        .map_err(|e| LeaseStoreError::InvalidInput(format!("interval out of range: {e}")))
}

fn to_count(count: u32) -> Result<i32, LeaseStoreError> {
    i32::try_from(count)
        .map_err(|_| LeaseStoreError::InvalidInput(format!("failure count {count} out of range")))
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<WorkItem, LeaseStoreError> {
    WorkItemRow::from_row(row)
        .map_err(|e| LeaseStoreError::Decode(format!("failed to read work item row: {e}")))?
        .try_into()
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<WorkItem>, LeaseStoreError> {
    rows.iter().map(decode_row).collect()
}

#[async_trait::async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self, item), fields(kind = %item.kind), err)]
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, LeaseStoreError> {
        let id = WorkItemId::new();
        insert_query(id, &item)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(id)
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, LeaseStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RETURNING_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_state(
        &self,
        state: Option<WorkState>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RETURNING_COLUMNS}
            FROM work_items
            WHERE ($1::text IS NULL OR state = $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(state.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<WorkStats, LeaseStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM work_items GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = WorkStats::default();
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| LeaseStoreError::Decode(format!("failed to read state: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| LeaseStoreError::Decode(format!("failed to read count: {e}")))?;
            let state: WorkState = state
                .parse()
                .map_err(|e| LeaseStoreError::Decode(format!("{e}")))?;
            stats.record(state, n.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(
        skip(self, filter),
        fields(worker_id = %worker, work_item_id = tracing::field::Empty),
        err
    )]
    async fn try_claim(
        &self,
        filter: &EligibilityFilter,
        worker: &WorkerId,
    ) -> Result<Option<ClaimedItem>, LeaseStoreError> {
        loop {
            let row = sqlx::query(&format!(
                r#"
                WITH next_item AS (
                    SELECT id
                    FROM work_items
                    WHERE ((state = 'pending' AND ready_at <= NOW())
                           OR (state = 'failed_retryable' AND next_retry_at <= NOW()))
                      AND ($1::text IS NULL OR kind = $1)
                      AND (cardinality($2::text[]) = 0 OR job_type = ANY($2))
                      AND ($3::text IS NULL OR payload -> $3 IS NOT NULL AND payload -> $3 <> 'null'::jsonb)
                    ORDER BY ready_at ASC, created_at ASC, id ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                UPDATE work_items
                SET state = 'claimed',
                    claimed_by = $4,
                    claimed_at = NOW(),
                    next_retry_at = NULL,
                    updated_at = NOW()
                FROM next_item
                WHERE work_items.id = next_item.id
                RETURNING {RETURNING_COLUMNS}
                "#
            ))
            .bind(filter.kind_tag())
            .bind(filter.job_type_tags())
            .bind(filter.require_payload_key.as_deref())
            .bind(worker.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("try_claim", e))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("try_claim", e))?;
            match decode_row(&row) {
                Ok(item) => {
                    Span::current().record("work_item_id", tracing::field::display(item.id));
                    return ClaimedItem::from_claimed(item).map(Some);
                }
                // Move on to the next eligible row.
                Err(e) => self.fail_undecodable(id, worker, &e).await?,
            }
        }
    }

    #[instrument(skip(self, lease, result), fields(work_item_id = %lease.item_id), err)]
    async fn mark_succeeded(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
    ) -> Result<bool, LeaseStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE work_items
            SET state = 'succeeded',
                claimed_by = NULL,
                claimed_at = NULL,
                next_retry_at = NULL,
                result = $5,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND state = 'claimed'
              AND claimed_by = $2
              AND claimed_at = $3
              AND failure_count = $4
            "#,
        )
        .bind(*lease.item_id.as_uuid())
        .bind(lease.worker_id.as_str())
        .bind(lease.claimed_at)
        .bind(to_count(lease.failure_count)?)
        .bind(result)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_succeeded", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(
        skip(self, lease, update),
        fields(work_item_id = %lease.item_id, failure_count = update.failure_count),
        err
    )]
    async fn mark_failed(
        &self,
        lease: &Lease,
        update: &FailureUpdate,
    ) -> Result<bool, LeaseStoreError> {
        let (state, retry_after) = match update.transition {
            FailureTransition::Retry { after } => {
                (WorkState::FailedRetryable, Some(to_interval(after)?))
            }
            FailureTransition::Terminal => (WorkState::FailedTerminal, None),
        };

        let done = sqlx::query(
            r#"
            UPDATE work_items
            SET state = $5,
                failure_count = $6,
                last_error = $7,
                next_retry_at = NOW() + $8::interval,
                completed_at = CASE WHEN $5 = 'failed_terminal' THEN NOW() ELSE NULL END,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND state = 'claimed'
              AND claimed_by = $2
              AND claimed_at = $3
              AND failure_count = $4
            "#,
        )
        .bind(*lease.item_id.as_uuid())
        .bind(lease.worker_id.as_str())
        .bind(lease.claimed_at)
        .bind(to_count(lease.failure_count)?)
        .bind(state.as_str())
        .bind(to_count(update.failure_count)?)
        .bind(truncate_error(&update.last_error))
        .bind(retry_after)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(reclaimed = tracing::field::Empty), err)]
    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_failures: u32,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH expired AS (
                SELECT id
                FROM work_items
                WHERE state = 'claimed'
                  AND claimed_at < NOW() - $1::interval
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items
            SET failure_count = work_items.failure_count + 1,
                state = CASE
                    WHEN work_items.failure_count + 1 >= $2 THEN 'failed_terminal'
                    ELSE 'pending'
                END,
                completed_at = CASE
                    WHEN work_items.failure_count + 1 >= $2 THEN NOW()
                    ELSE NULL
                END,
                last_error = 'lease expired: claimed by ' || work_items.claimed_by
                             || ' at ' || to_char(work_items.claimed_at AT TIME ZONE 'UTC',
                                                  'YYYY-MM-DD"T"HH24:MI:SS.US"Z"'),
                claimed_by = NULL,
                claimed_at = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            FROM expired
            WHERE work_items.id = expired.id
            RETURNING {RETURNING_COLUMNS}
            "#
        ))
        .bind(to_interval(lease_timeout)?)
        .bind(to_count(max_failures)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let mut items = decode_rows(rows)?;
        items.sort_by_key(|i| (i.ready_at, i.created_at, i.id));
        Span::current().record("reclaimed", items.len());
        Ok(items)
    }

    #[instrument(skip(self), fields(work_item_id = %id), err)]
    async fn reset_terminal(&self, id: WorkItemId) -> Result<bool, LeaseStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE work_items
            SET state = 'pending',
                failure_count = 0,
                last_error = NULL,
                next_retry_at = NULL,
                completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'failed_terminal'
            "#,
        )
        .bind(*id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_terminal", e))?;

        if done.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(LeaseStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), err)]
    async fn purge_succeeded(&self, older_than: Duration) -> Result<u64, LeaseStoreError> {
        let done = sqlx::query(
            r#"
            DELETE FROM work_items
            WHERE state = 'succeeded'
              AND completed_at < NOW() - $1::interval
            "#,
        )
        .bind(to_interval(older_than)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_succeeded", e))?;

        debug!(purged = done.rows_affected(), "purged succeeded work items");
        Ok(done.rows_affected())
    }
}

/// Map SQLx errors to LeaseStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LeaseStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => LeaseStoreError::InvalidInput(msg),
                _ => LeaseStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            LeaseStoreError::Decode(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            LeaseStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => LeaseStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct WorkItemRow {
    id: uuid::Uuid,
    kind: String,
    job_type: Option<String>,
    state: String,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    ready_at: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
    failure_count: i32,
    last_error: Option<String>,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WorkItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(WorkItemRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            job_type: row.try_get("job_type")?,
            state: row.try_get("state")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            ready_at: row.try_get("ready_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            failure_count: row.try_get("failure_count")?,
            last_error: row.try_get("last_error")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = LeaseStoreError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let decode = |e: parley_core::DomainError| {
            LeaseStoreError::Decode(format!("work item {}: {}", row.id, e))
        };
        let kind = WorkKind::from_parts(&row.kind, row.job_type.as_deref()).map_err(decode)?;
        let state: WorkState = row.state.parse().map_err(decode)?;
        let claimed_by = row
            .claimed_by
            .as_deref()
            .map(str::parse::<WorkerId>)
            .transpose()
            .map_err(decode)?;
        let failure_count = u32::try_from(row.failure_count).map_err(|_| {
            LeaseStoreError::Decode(format!(
                "work item {}: negative failure_count {}",
                row.id, row.failure_count
            ))
        })?;

        Ok(WorkItem {
            id: WorkItemId::from_uuid(row.id),
            kind,
            state,
            claimed_by,
            claimed_at: row.claimed_at,
            ready_at: row.ready_at,
            next_retry_at: row.next_retry_at,
            failure_count,
            last_error: row.last_error,
            payload: row.payload,
            result: row.result,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Per-test store in a throwaway schema.
///
/// Tests using it are `#[ignore]`d; run them with
/// `DATABASE_URL=postgres://... cargo test -- --ignored`.
#[cfg(test)]
pub(crate) async fn test_store() -> PostgresLeaseStore {
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use std::str::FromStr;

    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests");
    let admin = PgPool::connect(&url).await.expect("connect to DATABASE_URL");
    let schema = format!("parley_test_{}", uuid::Uuid::new_v4().simple());
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .expect("create test schema");

    let options = PgConnectOptions::from_str(&url)
        .expect("parse DATABASE_URL")
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await
        .expect("connect test pool");
    let store = PostgresLeaseStore::new(pool);
    store.migrate().await.expect("apply migration");
    store
}

//! PostgreSQL-backed [`RequestQueue`], for durable or multi-process crawls.
//!
//! Structurally this is `fusillade::manager::postgres::PostgresRequestManager`
//! with the state machine swapped: one `requests` table instead of Storage's
//! `claimed`/`processing`/`completed`, `SELECT ... FOR UPDATE SKIP LOCKED` for
//! atomic claiming, and the same self-healing "unclaim stale leases before
//! claiming new work" step folded into `fetch_next`.
//!
//! Uses runtime-checked `sqlx::query` rather than the `query!` compile-time
//! macro: the macro needs a live database at build time to verify against,
//! which this exercise has no way to provide. See DESIGN.md.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use super::{AddRequestsResult, ProcessedRequest, QueueMetadata, RequestQueue};
use crate::error::{CrawlerError, Result};
use crate::request::{
    AnyRequest, EnqueueStrategy, Handled, InProgress, Pending, ProcessingState, Request, RequestData, RequestId,
    SessionId,
};
use crate::request::LeaseConfig;

pub struct PostgresRequestQueue {
    pool: PgPool,
    lease: LeaseConfig,
}

impl PostgresRequestQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: LeaseConfig::default(),
        }
    }

    pub fn with_lease_config(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Run the schema migration bundled under `migrations/`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CrawlerError::Storage(anyhow::anyhow!(e)))
    }

    /// Release leases that outlived their `lease_expires_at` back to pending,
    /// the same self-healing step `PostgresRequestManager::unclaim_stale_requests`
    /// performs before every claim.
    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE requests
            SET state = 'pending', lease_expires_at = NULL
            WHERE state = 'in_progress' AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlerError::Storage(anyhow::anyhow!(e)))?;
        Ok(result.rows_affected())
    }

    fn row_to_data(row: &sqlx::postgres::PgRow) -> Result<RequestData> {
        let headers_json: Value = row.try_get("headers").map_err(db_err)?;
        let headers = serde_json::from_value(headers_json).map_err(|e| CrawlerError::SchemaViolation(e.to_string()))?;
        let enqueue_strategy = match row.try_get::<String, _>("enqueue_strategy").map_err(db_err)?.as_str() {
            "same_origin" => EnqueueStrategy::SameOrigin,
            "same_hostname" => EnqueueStrategy::SameHostname,
            "same_domain" => EnqueueStrategy::SameDomain,
            _ => EnqueueStrategy::All,
        };
        let processing_state = match row.try_get::<String, _>("processing_state").map_err(db_err)?.as_str() {
            "request_handler" => ProcessingState::RequestHandler,
            "error_handler" => ProcessingState::ErrorHandler,
            "done" => ProcessingState::Done,
            "error" => ProcessingState::Error,
            "skipped" => ProcessingState::Skipped,
            _ => ProcessingState::Unprocessed,
        };

        Ok(RequestData {
            id: RequestId(row.try_get::<Uuid, _>("id").map_err(db_err)?),
            unique_key: row.try_get("unique_key").map_err(db_err)?,
            url: row.try_get("url").map_err(db_err)?,
            method: row.try_get("method").map_err(db_err)?,
            headers,
            payload: row.try_get("payload").map_err(db_err)?,
            user_data: row.try_get::<Value, _>("user_data").map_err(db_err)?,
            label: row.try_get("label").map_err(db_err)?,
            session_id: row
                .try_get::<Option<Uuid>, _>("session_id")
                .map_err(db_err)?
                .map(SessionId),
            enqueue_strategy,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(db_err)? as u32,
            session_rotation_count: row.try_get::<i32, _>("session_rotation_count").map_err(db_err)? as u32,
            no_retry: row.try_get("no_retry").map_err(db_err)?,
            max_retries: row.try_get::<Option<i32>, _>("max_retries").map_err(db_err)?.map(|v| v as u32),
            crawl_depth: row.try_get::<i32, _>("crawl_depth").map_err(db_err)? as u32,
            processing_state,
            handled_at: row.try_get("handled_at").map_err(db_err)?,
            loaded_url: row.try_get("loaded_url").map_err(db_err)?,
        })
    }
}

fn db_err(e: sqlx::Error) -> CrawlerError {
    CrawlerError::from(e)
}

fn enqueue_strategy_name(s: EnqueueStrategy) -> &'static str {
    match s {
        EnqueueStrategy::All => "all",
        EnqueueStrategy::SameOrigin => "same_origin",
        EnqueueStrategy::SameHostname => "same_hostname",
        EnqueueStrategy::SameDomain => "same_domain",
    }
}

fn processing_state_name(s: ProcessingState) -> &'static str {
    match s {
        ProcessingState::Unprocessed => "unprocessed",
        ProcessingState::RequestHandler => "request_handler",
        ProcessingState::ErrorHandler => "error_handler",
        ProcessingState::Done => "done",
        ProcessingState::Error => "error",
        ProcessingState::Skipped => "skipped",
    }
}

#[async_trait]
impl RequestQueue for PostgresRequestQueue {
    async fn add_batch(&self, requests: Vec<RequestData>, forefront: bool) -> Result<AddRequestsResult> {
        let mut result = AddRequestsResult::default();

        // For a forefront batch, reserve the whole run of sequence numbers
        // up front and hand them out in the caller's order, so the first
        // request in `requests` is still the first one `fetch_next` returns.
        // Calling `nextval` once per item (oldest code) hands the
        // most-negative - i.e. highest-priority - value to the *last* item
        // instead of the first, reversing the batch's internal order.
        let mut forefront_sequences: Vec<i64> = if forefront && !requests.is_empty() {
            let raw: Vec<(i64, i64)> = sqlx::query_as(
                "SELECT i, nextval('requests_sequence_seq') FROM generate_series(1, $1) AS i ORDER BY i",
            )
            .bind(requests.len() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            raw.into_iter().rev().map(|(_, v)| -v).collect()
        } else {
            Vec::new()
        };

        for data in requests {
            let sequence: i64 = if forefront {
                forefront_sequences.remove(0)
            } else {
                sqlx::query_scalar("SELECT nextval('requests_sequence_seq')")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?
            };

            let existing: Option<(Uuid, String)> = sqlx::query_as("SELECT id, state FROM requests WHERE unique_key = $1")
                .bind(&data.unique_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

            if let Some((id, state)) = existing {
                result.processed.push(ProcessedRequest {
                    id: RequestId(id),
                    unique_key: data.unique_key,
                    was_already_present: true,
                    was_already_handled: state == "handled",
                });
                continue;
            }

            let headers_json = serde_json::to_value(&data.headers).map_err(|e| CrawlerError::SchemaViolation(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO requests (
                    id, unique_key, url, method, headers, payload, user_data, label, session_id,
                    enqueue_strategy, retry_count, session_rotation_count, no_retry, max_retries,
                    crawl_depth, processing_state, handled_at, loaded_url, state, sequence
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, 'pending', $19
                )
                "#,
            )
            .bind(data.id.0)
            .bind(&data.unique_key)
            .bind(&data.url)
            .bind(&data.method)
            .bind(headers_json)
            .bind(&data.payload)
            .bind(&data.user_data)
            .bind(&data.label)
            .bind(data.session_id.map(|s| s.0))
            .bind(enqueue_strategy_name(data.enqueue_strategy))
            .bind(data.retry_count as i32)
            .bind(data.session_rotation_count as i32)
            .bind(data.no_retry)
            .bind(data.max_retries.map(|v| v as i32))
            .bind(data.crawl_depth as i32)
            .bind(processing_state_name(data.processing_state))
            .bind(data.handled_at)
            .bind(&data.loaded_url)
            .bind(sequence)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            result.processed.push(ProcessedRequest {
                id: data.id,
                unique_key: data.unique_key,
                was_already_present: false,
                was_already_handled: false,
            });
        }

        Ok(result)
    }

    async fn fetch_next(&self) -> Result<Option<Request<InProgress>>> {
        self.reclaim_expired_leases().await?;

        let now = Utc::now();
        let lease_expires_at = now
            + chrono::Duration::from_std(self.lease.lease_duration).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let row = sqlx::query(
            r#"
            UPDATE requests
            SET state = 'in_progress', lease_expires_at = $1
            WHERE id = (
                SELECT id FROM requests
                WHERE state = 'pending'
                ORDER BY sequence ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(lease_expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let sequence: i64 = row.try_get("sequence").map_err(db_err)?;
        let data = Self::row_to_data(&row)?;

        Ok(Some(Request {
            data,
            state: InProgress {
                sequence,
                leased_at: now,
                lease_expires_at,
            },
        }))
    }

    async fn mark_handled(&self, id: RequestId) -> Result<Option<Request<Handled>>> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE requests
            SET state = 'handled', handled_at = $2, lease_expires_at = NULL
            WHERE id = $1 AND state = 'in_progress'
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data = Self::row_to_data(&row)?;
        Ok(Some(Request {
            data,
            state: Handled { handled_at: now },
        }))
    }

    async fn reclaim(&self, request: RequestData, forefront: bool) -> Result<Option<Request<Pending>>> {
        let sequence: i64 = if forefront {
            sqlx::query_scalar("SELECT -nextval('requests_sequence_seq')")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
        } else {
            sqlx::query_scalar("SELECT nextval('requests_sequence_seq')")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
        };

        let row = sqlx::query(
            r#"
            UPDATE requests
            SET state = 'pending', sequence = $2, lease_expires_at = NULL,
                retry_count = $3, session_rotation_count = $4, no_retry = $5,
                session_id = $6, processing_state = $7
            WHERE id = $1 AND state = 'in_progress'
            RETURNING *
            "#,
        )
        .bind(request.id.0)
        .bind(sequence)
        .bind(request.retry_count as i32)
        .bind(request.session_rotation_count as i32)
        .bind(request.no_retry)
        .bind(request.session_id.map(|s| s.0))
        .bind(processing_state_name(request.processing_state))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data = Self::row_to_data(&row)?;
        Ok(Some(Request {
            data,
            state: Pending {
                sequence,
                not_before: None,
            },
        }))
    }

    async fn get(&self, unique_key: &str) -> Result<Option<AnyRequest>> {
        let row = sqlx::query("SELECT * FROM requests WHERE unique_key = $1")
            .bind(unique_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state").map_err(db_err)?;
        let sequence: i64 = row.try_get("sequence").map_err(db_err)?;
        let data = Self::row_to_data(&row)?;

        Ok(Some(match state.as_str() {
            "in_progress" => {
                let leased_at = Utc::now();
                let lease_expires_at: chrono::DateTime<Utc> = row
                    .try_get::<Option<chrono::DateTime<Utc>>, _>("lease_expires_at")
                    .map_err(db_err)?
                    .unwrap_or(leased_at);
                AnyRequest::InProgress(Request {
                    data,
                    state: InProgress {
                        sequence,
                        leased_at,
                        lease_expires_at,
                    },
                })
            }
            "handled" => {
                let handled_at = data.handled_at.unwrap_or_else(Utc::now);
                AnyRequest::Handled(Request {
                    data,
                    state: Handled { handled_at },
                })
            }
            _ => AnyRequest::Pending(Request {
                data,
                state: Pending {
                    sequence,
                    not_before: None,
                },
            }),
        }))
    }

    async fn is_empty(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM requests WHERE state IN ('pending', 'in_progress')")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count == 0)
    }

    async fn metadata(&self) -> Result<QueueMetadata> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) AS total,
                count(*) FILTER (WHERE state = 'handled') AS handled,
                count(*) FILTER (WHERE state = 'pending') AS pending,
                count(*) FILTER (WHERE state = 'in_progress') AS in_progress
            FROM requests
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(QueueMetadata {
            total_request_count: row.try_get::<i64, _>("total").map_err(db_err)? as u64,
            handled_request_count: row.try_get::<i64, _>("handled").map_err(db_err)? as u64,
            pending_request_count: row.try_get::<i64, _>("pending").map_err(db_err)? as u64,
            in_progress_request_count: row.try_get::<i64, _>("in_progress").map_err(db_err)? as u64,
        })
    }

    async fn purge(&self) -> Result<()> {
        sqlx::query("TRUNCATE requests").execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }
}

//! The Request Queue (RQ): a durable, ordered, deduplicated work set
//! supporting forefront injection, in-progress locking, reclamation and
//! handled-marking across concurrent workers. See spec §4.1.
//!
//! This module defines the `RequestQueue` trait — the generalized
//! equivalent of `fusillade::manager::Storage` — plus the always-available
//! [`in_memory::InMemoryRequestQueue`] implementation. A durable
//! PostgreSQL-backed implementation is available under the `postgres`
//! feature (see [`postgres`]).

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::{AnyRequest, Handled, InProgress, Pending, Request, RequestData, RequestId};

/// Outcome of inserting one request via [`RequestQueue::add_batch`].
#[derive(Debug, Clone)]
pub struct ProcessedRequest {
    pub id: RequestId,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// Result of a batch insert, split into accepted and rejected items.
/// Rejections only occur for malformed input, never for duplicates — a
/// duplicate is still "processed", just flagged via `was_already_present`.
#[derive(Debug, Clone, Default)]
pub struct AddRequestsResult {
    pub processed: Vec<ProcessedRequest>,
    pub unprocessed: Vec<RequestData>,
}

/// Point-in-time counters describing queue occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueMetadata {
    pub total_request_count: u64,
    pub handled_request_count: u64,
    pub pending_request_count: u64,
    pub in_progress_request_count: u64,
}

/// The Request Queue contract from spec §4.1.
///
/// Implementations must make `add_batch`, `fetch_next`, `mark_handled` and
/// `reclaim` linearizable with respect to each other (spec §5 "Shared-resource
/// policy": the RQ is the only shared mutable object across worker tasks).
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Insert a batch of requests, deduplicating by `unique_key`.
    /// `forefront=true` places all new items before any existing pending
    /// item, preserving intra-batch order; `forefront=false` appends.
    async fn add_batch(&self, requests: Vec<RequestData>, forefront: bool) -> Result<AddRequestsResult>;

    /// Atomically select and lease the pending request with the smallest
    /// ordering key. Returns `None` if nothing is currently fetchable.
    async fn fetch_next(&self) -> Result<Option<Request<InProgress>>>;

    /// Transition in-progress -> handled. Idempotent: `None` if `id` isn't
    /// currently leased.
    async fn mark_handled(&self, id: RequestId) -> Result<Option<Request<Handled>>>;

    /// Transition in-progress -> pending, persisting `request`'s mutable
    /// processing state (`retry_count`, `session_rotation_count`, etc. —
    /// whatever the caller updated before deciding to retry) as the new
    /// record. `forefront=true` makes it the next candidate for
    /// `fetch_next`; otherwise it goes to the tail. Returns `None` if
    /// `request.id` isn't currently leased.
    async fn reclaim(&self, request: RequestData, forefront: bool) -> Result<Option<Request<Pending>>>;

    /// Look up a request by its dedup key, regardless of partition.
    async fn get(&self, unique_key: &str) -> Result<Option<AnyRequest>>;

    /// Whether the queue currently has no pending or in-progress requests.
    /// May be a stale false-negative in multi-client backends (spec §4.1).
    async fn is_empty(&self) -> Result<bool>;

    /// Whether the queue itself considers the crawl done: the RQ-level half
    /// of the predicate spec §4.1/§6.3/§4.6.2/§8 name as `is_finished()`.
    /// Defaults to [`RequestQueue::is_empty`]; a backend with a notion of
    /// "still being fed externally" may want to override it.
    async fn is_finished(&self) -> Result<bool> {
        self.is_empty().await
    }

    /// Snapshot of queue occupancy.
    async fn metadata(&self) -> Result<QueueMetadata>;

    /// Drop all requests and reset counters, for `purge_on_start` (spec §4.6
    /// step 2 and the "Supplemented features" note in SPEC_FULL.md).
    async fn purge(&self) -> Result<()>;
}

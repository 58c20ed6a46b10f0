//! Per-instance convenience wrappers around [`crate::queue::RequestQueue`]
//! operations, in the style of `fusillade::request::transitions` — the
//! queue trait owns the atomic state transition, these just let call sites
//! read as `request.mark_handled(&queue).await?` instead of
//! `queue.mark_handled(request.id()).await?`.

use std::time::Duration;

use super::{Handled, InProgress, Pending, Request};
use crate::error::Result;
use crate::queue::RequestQueue;

/// Configuration for how long a `fetch_next` lease lasts before it expires
/// and the request becomes eligible for `fetch_next` again (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub lease_duration: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl Request<InProgress> {
    /// Transition in-progress -> handled. Idempotent: returns `None` if this
    /// request is no longer leased (e.g. the lease already expired and
    /// someone else re-fetched it).
    pub async fn mark_handled<Q: RequestQueue + ?Sized>(
        self,
        queue: &Q,
    ) -> Result<Option<Request<Handled>>> {
        queue.mark_handled(self.id()).await
    }

    /// Transition in-progress -> pending, returning the request to
    /// circulation. `forefront=true` makes it the next candidate. Any
    /// mutation the caller made to `self.data` (e.g. bumping `retry_count`
    /// or `session_rotation_count` before deciding to retry) is persisted
    /// as part of the transition.
    pub async fn reclaim<Q: RequestQueue + ?Sized>(
        self,
        forefront: bool,
        queue: &Q,
    ) -> Result<Option<Request<Pending>>> {
        queue.reclaim(self.data, forefront).await
    }
}

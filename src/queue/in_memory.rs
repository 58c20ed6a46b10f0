//! In-memory request queue.
//!
//! Always available (no feature gate), suitable for single-process runs and
//! tests. Grounded in `batcher::storage::in_memory::InMemoryStorage`: a
//! `parking_lot::RwLock`-guarded map is the source of truth, with one
//! difference from the teacher's version — here the lock also has to encode
//! *ordering* (spec §4.1's monotonic `sequence_number` plus a parallel
//! decreasing counter for forefront inserts), since unlike the teacher's
//! flat claim-by-arrival-order table, `fetch_next` must honor forefront
//! precedence.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{AddRequestsResult, ProcessedRequest, QueueMetadata, RequestQueue};
use crate::error::Result;
use crate::request::{AnyRequest, Handled, InProgress, LeaseConfig, Pending, Request, RequestData, RequestId};

struct InProgressEntry {
    data: RequestData,
    sequence: i64,
    lease_expires_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    pending: BTreeMap<i64, RequestData>,
    in_progress: HashMap<RequestId, InProgressEntry>,
    handled: HashMap<RequestId, RequestData>,
    /// unique_key -> id, spanning all three partitions, for O(1) dedup checks.
    unique_index: HashMap<String, RequestId>,
}

/// The default, always-on request queue implementation.
pub struct InMemoryRequestQueue {
    inner: RwLock<Inner>,
    next_sequence: AtomicI64,
    next_forefront_sequence: AtomicI64,
    lease: LeaseConfig,
}

impl InMemoryRequestQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_sequence: AtomicI64::new(1),
            next_forefront_sequence: AtomicI64::new(-1),
            lease: LeaseConfig::default(),
        }
    }

    pub fn with_lease_config(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Return any in-progress requests whose lease has expired to the
    /// pending partition, preserving their original ordering key. Mirrors
    /// `PostgresRequestManager::unclaim_stale_requests`, called as the first
    /// step of every `fetch_next`.
    fn reclaim_expired_leases(&self, inner: &mut Inner) {
        let now = Utc::now();
        let expired: Vec<RequestId> = inner
            .in_progress
            .iter()
            .filter(|(_, entry)| entry.lease_expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(entry) = inner.in_progress.remove(&id) {
                inner.pending.insert(entry.sequence, entry.data);
            }
        }
    }
}

impl Default for InMemoryRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestQueue for InMemoryRequestQueue {
    async fn add_batch(&self, requests: Vec<RequestData>, forefront: bool) -> Result<AddRequestsResult> {
        let mut inner = self.inner.write();
        let mut result = AddRequestsResult::default();

        // Forefront batches need their own items to stay in the caller's
        // order (the first request handed to `add_batch` is the first one
        // `fetch_next` returns) while still jumping ahead of anything
        // already pending. A plain per-item `fetch_sub` assigns the
        // *smallest* (most-negative, so highest-priority) sequence to the
        // *last* item in the batch instead of the first, so reserve the
        // whole block up front and hand out ascending sequences within it.
        let forefront_base = if forefront {
            let count = requests.len() as i64;
            Some(self.next_forefront_sequence.fetch_sub(count, Ordering::SeqCst) - count)
        } else {
            None
        };

        for (index, data) in requests.into_iter().enumerate() {
            if let Some(&existing_id) = inner.unique_index.get(&data.unique_key) {
                let was_already_handled = inner.handled.contains_key(&existing_id);
                result.processed.push(ProcessedRequest {
                    id: existing_id,
                    unique_key: data.unique_key,
                    was_already_present: true,
                    was_already_handled,
                });
                continue;
            }

            let sequence = match forefront_base {
                Some(base) => base + index as i64,
                None => self.next_sequence.fetch_add(1, Ordering::SeqCst),
            };

            inner.unique_index.insert(data.unique_key.clone(), data.id);
            result.processed.push(ProcessedRequest {
                id: data.id,
                unique_key: data.unique_key.clone(),
                was_already_present: false,
                was_already_handled: false,
            });
            inner.pending.insert(sequence, data);
        }

        Ok(result)
    }

    async fn fetch_next(&self) -> Result<Option<Request<InProgress>>> {
        let mut inner = self.inner.write();
        self.reclaim_expired_leases(&mut inner);

        let now = Utc::now();
        let Some(sequence) = inner.pending.keys().next().copied() else {
            return Ok(None);
        };

        let data = inner.pending.remove(&sequence).expect("just found");
        let lease_expires_at = now + chrono::Duration::from_std(self.lease.lease_duration).unwrap_or(chrono::Duration::seconds(60));
        let id = data.id;
        inner.in_progress.insert(
            id,
            InProgressEntry {
                data: data.clone(),
                sequence,
                lease_expires_at,
            },
        );

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
        let mut inner = self.inner.write();
        let Some(entry) = inner.in_progress.remove(&id) else {
            return Ok(None);
        };
        let handled_at = Utc::now();
        let mut data = entry.data;
        data.handled_at = Some(handled_at);
        inner.handled.insert(id, data.clone());

        Ok(Some(Request {
            data,
            state: Handled { handled_at },
        }))
    }

    async fn reclaim(&self, request: RequestData, forefront: bool) -> Result<Option<Request<Pending>>> {
        let mut inner = self.inner.write();
        if inner.in_progress.remove(&request.id).is_none() {
            return Ok(None);
        };

        let sequence = if forefront {
            self.next_forefront_sequence.fetch_sub(1, Ordering::SeqCst)
        } else {
            self.next_sequence.fetch_add(1, Ordering::SeqCst)
        };

        inner.pending.insert(sequence, request.clone());

        Ok(Some(Request {
            data: request,
            state: Pending {
                sequence,
                not_before: None,
            },
        }))
    }

    async fn get(&self, unique_key: &str) -> Result<Option<AnyRequest>> {
        let inner = self.inner.read();
        let Some(&id) = inner.unique_index.get(unique_key) else {
            return Ok(None);
        };

        if let Some(data) = inner.handled.get(&id) {
            return Ok(Some(AnyRequest::Handled(Request {
                data: data.clone(),
                state: Handled {
                    handled_at: data.handled_at.unwrap_or_else(Utc::now),
                },
            })));
        }
        if let Some(entry) = inner.in_progress.get(&id) {
            return Ok(Some(AnyRequest::InProgress(Request {
                data: entry.data.clone(),
                state: InProgress {
                    sequence: entry.sequence,
                    leased_at: Utc::now(),
                    lease_expires_at: entry.lease_expires_at,
                },
            })));
        }
        for (sequence, data) in inner.pending.iter() {
            if data.id == id {
                return Ok(Some(AnyRequest::Pending(Request {
                    data: data.clone(),
                    state: Pending {
                        sequence: *sequence,
                        not_before: None,
                    },
                })));
            }
        }
        Ok(None)
    }

    async fn is_empty(&self) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner.pending.is_empty() && inner.in_progress.is_empty())
    }

    async fn metadata(&self) -> Result<QueueMetadata> {
        let inner = self.inner.read();
        Ok(QueueMetadata {
            total_request_count: (inner.pending.len() + inner.in_progress.len() + inner.handled.len()) as u64,
            handled_request_count: inner.handled.len() as u64,
            pending_request_count: inner.pending.len() as u64,
            in_progress_request_count: inner.in_progress.len() as u64,
        })
    }

    async fn purge(&self) -> Result<()> {
        let mut inner = self.inner.write();
        *inner = Inner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;

    fn req(url: &str) -> RequestData {
        RequestInput::new(url).build().unwrap()
    }

    #[tokio::test]
    async fn fifo_across_three_urls() {
        let queue = InMemoryRequestQueue::new();
        queue
            .add_batch(
                vec![req("https://a/"), req("https://b/"), req("https://c/")],
                false,
            )
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(r) = queue.fetch_next().await.unwrap() {
            order.push(r.data.url.clone());
            r.mark_handled(&queue).await.unwrap();
        }
        assert_eq!(order, vec!["https://a/", "https://b/", "https://c/"]);
    }

    #[tokio::test]
    async fn forefront_precedes_regular_pending() {
        let queue = InMemoryRequestQueue::new();
        queue
            .add_batch(vec![req("https://n1/"), req("https://n2/")], false)
            .await
            .unwrap();

        // Simulate n1 being handled, and during its handling p1..p3 are
        // enqueued at the forefront and n3 normally — matches seed scenario S3.
        let n1 = queue.fetch_next().await.unwrap().unwrap();
        queue
            .add_batch(
                vec![req("https://p1/"), req("https://p2/"), req("https://p3/")],
                true,
            )
            .await
            .unwrap();
        queue.add_batch(vec![req("https://n3/")], false).await.unwrap();
        n1.mark_handled(&queue).await.unwrap();

        let mut order = Vec::new();
        while let Some(r) = queue.fetch_next().await.unwrap() {
            order.push(r.data.url.clone());
            r.mark_handled(&queue).await.unwrap();
        }
        assert_eq!(
            order,
            vec!["https://p1/", "https://p2/", "https://p3/", "https://n2/", "https://n3/"]
        );
    }

    #[tokio::test]
    async fn add_batch_is_idempotent_on_unique_key() {
        let queue = InMemoryRequestQueue::new();
        let a = queue.add_batch(vec![req("https://a/")], false).await.unwrap();
        assert!(!a.processed[0].was_already_present);

        let b = queue.add_batch(vec![req("https://a/")], false).await.unwrap();
        assert!(b.processed[0].was_already_present);

        let metadata = queue.metadata().await.unwrap();
        assert_eq!(metadata.pending_request_count, 1);
    }

    #[tokio::test]
    async fn mark_handled_reports_was_already_handled_on_readd() {
        let queue = InMemoryRequestQueue::new();
        queue.add_batch(vec![req("https://a/")], false).await.unwrap();
        let fetched = queue.fetch_next().await.unwrap().unwrap();
        fetched.mark_handled(&queue).await.unwrap();

        let readd = queue.add_batch(vec![req("https://a/")], false).await.unwrap();
        assert!(readd.processed[0].was_already_present);
        assert!(readd.processed[0].was_already_handled);
    }

    #[tokio::test]
    async fn reclaim_forefront_becomes_next_candidate() {
        let queue = InMemoryRequestQueue::new();
        queue
            .add_batch(vec![req("https://a/"), req("https://b/")], false)
            .await
            .unwrap();

        let a = queue.fetch_next().await.unwrap().unwrap();
        a.reclaim(true, &queue).await.unwrap();

        let next = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(next.data.url, "https://a/");
    }

    #[tokio::test]
    async fn expired_lease_is_released_back_to_pending() {
        let queue = InMemoryRequestQueue::new().with_lease_config(LeaseConfig {
            lease_duration: std::time::Duration::from_millis(1),
        });
        queue.add_batch(vec![req("https://a/")], false).await.unwrap();
        let _leased = queue.fetch_next().await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let refetched = queue.fetch_next().await.unwrap();
        assert!(refetched.is_some());
    }

    #[tokio::test]
    async fn reclaim_persists_mutated_retry_count() {
        let queue = InMemoryRequestQueue::new();
        queue.add_batch(vec![req("https://a/")], false).await.unwrap();

        let mut leased = queue.fetch_next().await.unwrap().unwrap();
        leased.data.retry_count += 1;
        leased.reclaim(false, &queue).await.unwrap();

        let refetched = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(refetched.data.retry_count, 1);
    }
}

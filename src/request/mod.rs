//! Core request types for the crawler runtime.
//!
//! Follows the typestate pattern used throughout the teacher crate: the
//! request queue's three partitions (pending / in-progress / handled) are
//! distinct types so that a caller can never, say, call `reclaim` on a
//! request that was never fetched. The richer handler-level state machine
//! (`unprocessed | request_handler | error_handler | done | error | skipped`)
//! is carried as plain data on `RequestData`, since the dispatcher — not the
//! queue — owns those transitions and doesn't need the compiler's help.

mod transitions;
mod unique_key;

pub use transitions::LeaseConfig;
pub use unique_key::derive_unique_key;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used to derive a `RequestId` deterministically from a
/// `unique_key` via `Uuid::new_v5`. Arbitrary but fixed for the lifetime of
/// the crate so that ids are stable across processes and restarts.
const REQUEST_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x3d, 0x1a, 0x2e, 0x9b, 0x44, 0x4c, 0x77, 0xa1, 0x9e, 0x5d, 0x2f, 0x8c, 0x63, 0x0b, 0x11,
]);

/// Unique identifier for a request, deterministically derived from its
/// `unique_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Derive the id for a given `unique_key`.
    pub fn from_unique_key(unique_key: &str) -> Self {
        RequestId(Uuid::new_v5(&REQUEST_ID_NAMESPACE, unique_key.as_bytes()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a session, see [`crate::session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        SessionId(uuid)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Policy restricting which links a handler may enqueue, relative to the
/// request that produced them. See spec §4.6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EnqueueStrategy {
    /// Accept any absolute URL.
    #[default]
    All,
    /// Same scheme, host and port as the originating request.
    SameOrigin,
    /// Same host as the originating request (any scheme/port).
    SameHostname,
    /// Same registrable (public-suffix-stripped) domain.
    SameDomain,
}

/// Handler-level progress of a request, distinct from the request queue's
/// own pending/in-progress/handled partitioning. Owned by the Dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProcessingState {
    #[default]
    Unprocessed,
    RequestHandler,
    ErrorHandler,
    Done,
    Error,
    Skipped,
}

/// The reason a request was skipped rather than handled or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    RobotsDisallowed,
    Custom(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::RobotsDisallowed => write!(f, "robots_txt"),
            SkipReason::Custom(reason) => write!(f, "{reason}"),
        }
    }
}

/// The immutable-by-identity, mutable-processing-state work unit described
/// in spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub id: RequestId,
    pub unique_key: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub payload: Option<Vec<u8>>,
    pub user_data: serde_json::Value,
    pub label: Option<String>,
    pub session_id: Option<SessionId>,
    pub enqueue_strategy: EnqueueStrategy,

    pub retry_count: u32,
    pub session_rotation_count: u32,
    pub no_retry: bool,
    pub max_retries: Option<u32>,
    pub crawl_depth: u32,
    pub processing_state: ProcessingState,
    pub handled_at: Option<DateTime<Utc>>,
    pub loaded_url: Option<String>,
}

/// Builder-style input for constructing a new [`RequestData`] before it is
/// ever inserted into a queue.
#[derive(Debug, Clone)]
pub struct RequestInput {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub payload: Option<Vec<u8>>,
    pub user_data: serde_json::Value,
    pub label: Option<String>,
    pub session_id: Option<SessionId>,
    pub enqueue_strategy: EnqueueStrategy,
    pub unique_key: Option<String>,
    pub strip_fragment: bool,
    pub max_retries: Option<u32>,
    pub no_retry: bool,
    pub crawl_depth: u32,
    /// Whether this link should be queued ahead of currently-pending
    /// non-forefront requests (spec §4.6.1's `add_requests(..., forefront?)`).
    /// Transient to the enqueue call, not persisted on [`RequestData`].
    pub forefront: bool,
}

impl Default for RequestInput {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            payload: None,
            user_data: serde_json::Value::Null,
            label: None,
            session_id: None,
            enqueue_strategy: EnqueueStrategy::All,
            unique_key: None,
            strip_fragment: true,
            max_retries: None,
            no_retry: false,
            crawl_depth: 0,
            forefront: false,
        }
    }
}

impl RequestInput {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Finalize into a [`RequestData`], deriving `unique_key` and `id` if
    /// not already set.
    pub fn build(self) -> crate::error::Result<RequestData> {
        let unique_key = match self.unique_key {
            Some(key) => key,
            None => derive_unique_key(
                &self.url,
                &self.method,
                self.payload.as_deref(),
                self.strip_fragment,
            )?,
        };
        let id = RequestId::from_unique_key(&unique_key);

        Ok(RequestData {
            id,
            unique_key,
            url: self.url,
            method: self.method,
            headers: self.headers,
            payload: self.payload,
            user_data: self.user_data,
            label: self.label,
            session_id: self.session_id,
            enqueue_strategy: self.enqueue_strategy,
            retry_count: 0,
            session_rotation_count: 0,
            no_retry: self.no_retry,
            max_retries: self.max_retries,
            crawl_depth: self.crawl_depth,
            processing_state: ProcessingState::Unprocessed,
            handled_at: None,
            loaded_url: None,
        })
    }
}

/// Marker trait for the request queue's three partitions. Enables the
/// typestate pattern: operations are only exposed for the state they're
/// valid in.
pub trait QueueState: Send + Sync + 'static {}

/// Newly added or reclaimed, eligible to be fetched.
#[derive(Debug, Clone)]
pub struct Pending {
    /// Ordering key: positive and increasing for normal inserts, negative
    /// and decreasing for forefront inserts, so `fetch_next` can always pick
    /// the minimum. See spec §4.1 "Ordering".
    pub sequence: i64,
    pub not_before: Option<DateTime<Utc>>,
}
impl QueueState for Pending {}

/// Leased to a worker; invisible to `fetch_next` until `mark_handled`,
/// `reclaim`, or the lease expires.
#[derive(Debug, Clone)]
pub struct InProgress {
    pub sequence: i64,
    pub leased_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}
impl QueueState for InProgress {}

/// Terminal: will never be returned by `fetch_next` again.
#[derive(Debug, Clone)]
pub struct Handled {
    pub handled_at: DateTime<Utc>,
}
impl QueueState for Handled {}

/// A request together with its queue-partition state.
#[derive(Debug, Clone)]
pub struct Request<S: QueueState> {
    pub data: RequestData,
    pub state: S,
}

impl<S: QueueState> Request<S> {
    pub fn id(&self) -> RequestId {
        self.data.id
    }

    pub fn unique_key(&self) -> &str {
        &self.data.unique_key
    }
}

/// A request in any queue partition, used for lookups and bulk listing
/// where the caller doesn't statically know the state.
#[derive(Debug, Clone)]
pub enum AnyRequest {
    Pending(Request<Pending>),
    InProgress(Request<InProgress>),
    Handled(Request<Handled>),
}

impl AnyRequest {
    pub fn id(&self) -> RequestId {
        match self {
            AnyRequest::Pending(r) => r.id(),
            AnyRequest::InProgress(r) => r.id(),
            AnyRequest::Handled(r) => r.id(),
        }
    }

    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::InProgress(r) => &r.data,
            AnyRequest::Handled(r) => &r.data,
        }
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, AnyRequest::Handled(_))
    }
}

impl From<Request<Pending>> for AnyRequest {
    fn from(r: Request<Pending>) -> Self {
        AnyRequest::Pending(r)
    }
}
impl From<Request<InProgress>> for AnyRequest {
    fn from(r: Request<InProgress>) -> Self {
        AnyRequest::InProgress(r)
    }
}
impl From<Request<Handled>> for AnyRequest {
    fn from(r: Request<Handled>) -> Self {
        AnyRequest::Handled(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic_from_unique_key() {
        let a = RequestId::from_unique_key("https://example.com/");
        let b = RequestId::from_unique_key("https://example.com/");
        let c = RequestId::from_unique_key("https://example.com/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn request_input_builds_with_derived_key() {
        let data = RequestInput::new("https://example.com/a?x=1#frag")
            .build()
            .unwrap();
        assert_eq!(data.unique_key, "GET:https://example.com/a?x=1");
        assert_eq!(data.crawl_depth, 0);
        assert_eq!(data.processing_state, ProcessingState::Unprocessed);
    }
}

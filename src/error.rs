//! Error taxonomy for the crawler runtime.
//!
//! Mirrors the shape of `fusillade::error::FusilladeError`: one variant per
//! named error kind the dispatcher classifies on, plus an `Other` catch-all
//! for anything fatal (wrapped in `anyhow::Error` so callers don't need to
//! enumerate every possible source error).

use thiserror::Error;

use crate::request::RequestId;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CrawlerError>;

/// The error taxonomy described in spec §7.
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// The session used for a request is blocked or otherwise suspicious.
    #[error("session error: {0}")]
    Session(String),

    /// A response carried a server error (5xx) or a user-configured error status.
    #[error("http status code error ({status}): {0}", status = .1)]
    HttpStatusCode(String, u16),

    /// A response carried a client error (4xx) that is never retried.
    #[error("http client status code error ({status}): {0}", status = .1)]
    HttpClientStatusCode(String, u16),

    /// A middleware raised during setup. Carries the wrapped cause and is
    /// retried like `RequestHandlerError`.
    #[error("context pipeline initialization failed: {0}")]
    ContextPipelineInitialization(#[source] Box<CrawlerError>),

    /// A middleware asked, during setup, for the request to be silently
    /// dropped (marked handled, not failed).
    #[error("context pipeline interrupted: {0}")]
    ContextPipelineInterrupted(String),

    /// A middleware's cleanup raised.
    #[error("context pipeline finalization failed: {0}")]
    ContextPipelineFinalization(#[source] Box<CrawlerError>),

    /// The request handler (user code) raised.
    #[error("request handler error: {0}")]
    RequestHandler(#[source] anyhow::Error),

    /// A request bound to a specific session could not be routed to it.
    #[error("request collision: request {0} is bound to a session no longer available")]
    RequestCollision(RequestId),

    /// The user-supplied error handler itself raised. Always fatal.
    #[error("user-defined error handler failed: {0}")]
    UserDefinedErrorHandler(#[source] anyhow::Error),

    /// The request handler exceeded `request_handler_timeout`.
    #[error("request handler timed out after {0:?}")]
    HandlerTimeout(std::time::Duration),

    /// An internal RQ/KVS/session call exceeded `internal_timeout` after
    /// exhausting its bounded retry.
    #[error("internal operation timed out after {0:?}")]
    InternalTimeout(std::time::Duration),

    /// The request queue could not find the request referenced by an
    /// operation (e.g. `mark_handled` on an unknown id).
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    /// A request queue operation observed the request in a state that made
    /// the requested transition invalid (e.g. reclaiming a request nobody
    /// currently leases).
    #[error("invalid request state for {0}: expected {1}, found {2}")]
    InvalidState(RequestId, &'static str, &'static str),

    /// Schema or protocol violation in a storage backend. Always fatal.
    #[error("storage schema violation: {0}")]
    SchemaViolation(String),

    /// A retriable I/O error from a request queue or storage backend.
    #[error("storage I/O error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Any other, un-enumerated fatal error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrawlerError {
    /// Whether this error kind is ever retried per the spec §4.6 decision table.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CrawlerError::HttpStatusCode(..)
                | CrawlerError::Session(_)
                | CrawlerError::ContextPipelineInitialization(_)
                | CrawlerError::RequestHandler(_)
                | CrawlerError::HandlerTimeout(_)
        )
    }

    /// Whether this error kind is fatal to the whole run (terminates `run()`).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlerError::UserDefinedErrorHandler(_)
                | CrawlerError::SchemaViolation(_)
                | CrawlerError::Other(_)
        )
    }

    /// Whether this error kind marks the request as skipped rather than
    /// retried or failed (spec §4.6's third outcome, alongside retry/fail).
    pub fn is_skip(&self) -> bool {
        matches!(self, CrawlerError::ContextPipelineInterrupted(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for CrawlerError {
    fn from(e: sqlx::Error) -> Self {
        CrawlerError::Storage(anyhow::anyhow!(e))
    }
}

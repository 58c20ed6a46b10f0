//! An autoscaling, retry-aware, session-rotating request dispatcher for
//! crawler runtimes.
//!
//! The runtime is built from a handful of independent pieces, wired
//! together by [`dispatcher::Crawler`]:
//!
//! - [`request`] — the work unit and its typestate-tracked queue lifecycle.
//! - [`queue`] — the Request Queue (RQ): durable, ordered, deduplicated.
//! - [`session`] — a rotating pool of cookie-jar/proxy identities.
//! - [`pipeline`] — the Context Pipeline: setup/teardown around a handler.
//! - [`router`] — label-based handler dispatch.
//! - [`autoscale`] — a load-responsive concurrency gate.
//! - [`stats`] — run counters and a retry histogram.
//! - [`http`] — the network boundary, swappable for tests.
//! - [`interfaces`] — external collaborators (dataset, KVS, events, robots).
//! - [`middleware`] — stock [`pipeline::Middleware`] implementations.
//! - [`dispatcher`] — the run loop and error decision table.
//! - [`error`] — the crate-wide error taxonomy.

pub mod autoscale;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod interfaces;
pub mod middleware;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod router;
pub mod session;
pub mod stats;

#[cfg(test)]
mod scenarios;

pub use dispatcher::{Crawler, DispatcherConfig};
pub use error::{CrawlerError, Result};
pub use request::{EnqueueStrategy, RequestData, RequestId, RequestInput, SessionId};

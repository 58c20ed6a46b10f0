//! The Crawler Dispatcher: the run loop that ties the request queue,
//! session pool, context pipeline, router and autoscaler together. See
//! spec §4.6.
//!
//! `run`'s structure — poll for work, spawn a task per item behind a
//! concurrency gate, track in-flight count with a `scopeguard` guard, drain
//! the `JoinSet` opportunistically between claims — is lifted directly from
//! `fusillade::daemon::Daemon::run`. What's new relative to the teacher is
//! the per-item control flow inside the spawned task (pipeline + router
//! instead of a single HTTP call) and the enqueue-commit protocol for links
//! the handler discovers along the way.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::autoscale::{AutoscaleConfig, AutoscaledPool, FinishedProbe, RunTaskProbe, Snapshotter, TaskReadyProbe};
use crate::error::{CrawlerError, Result};
use crate::http::SharedHttpClient;
use crate::interfaces::{
    CrawlerEvent, InMemoryDataset, InMemoryKeyValueStore, SharedDataset, SharedEventManager, SharedKeyValueStore, SharedRobotsTxtFile,
    TracingEventManager,
};
use crate::pipeline::{AddRequestsOptions, Context, ContextPipeline};
use crate::queue::RequestQueue;
use crate::request::{Handled, InProgress, ProcessingState, Request, RequestData, SkipReason};
use crate::router::Router;
use crate::session::SessionPool;
use crate::stats::Statistics;

mod enqueue;
pub use enqueue::{EnqueueFilter, EnqueueOutcome};

/// Configuration for a single `Crawler` run.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Drop everything in the queue before starting (spec's "Supplemented
    /// features" reopen semantics).
    pub purge_on_start: bool,
    /// Stop once this many requests have been handled, regardless of
    /// queue occupancy. `None` means unbounded.
    pub max_requests_per_crawl: Option<u64>,
    pub max_crawl_depth: Option<u32>,
    pub request_handler_timeout: Duration,
    /// Bound on a single attempt of an internal RQ/KVS call (spec §5).
    pub internal_timeout: Duration,
    /// Extra attempts after the first, once `internal_timeout` elapses.
    pub internal_timeout_retries: u32,
    /// Fixed pause between internal-timeout retry attempts. Deliberately
    /// constant rather than exponential: unlike the request-handler retry
    /// policy below, an internal RQ/KVS call has no `Request` to carry a
    /// growing `retry_count` on, and the point is just to ride out a brief
    /// stall, not to back off from sustained backend pressure.
    pub internal_retry_delay: Duration,
    pub max_retries: u32,
    /// Cap on `SessionError` retries, tracked via `session_rotation_count`
    /// rather than `retry_count` — spec §4.6: rotations don't count
    /// against `max_retries`.
    pub max_session_rotations: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_factor: u64,
    pub retry_backoff_max: Duration,
    /// If true, the first permanently-failed request (fatal, session
    /// rotations exhausted, or retries exhausted — spec §4.6.3) stops the
    /// run gracefully once in-flight tasks drain. Fatal errors (spec §7)
    /// always terminate the run regardless of this flag; this setting
    /// extends that behavior to ordinary exhausted-retry failures too.
    pub abort_on_error: bool,
    /// If true, `run` keeps polling even after the queue drains, instead
    /// of returning — for long-lived crawlers fed externally.
    pub keep_alive: bool,
    pub idle_poll_interval: Duration,
    pub autoscale: AutoscaleConfig,
    /// Sent as the `User-Agent` string to the configured `RobotsTxtFile`
    /// collaborator (spec §4.6's robots gate) — not an HTTP header override,
    /// just the identity a robots.txt ruleset is evaluated against.
    pub user_agent: String,
    /// Status codes that would otherwise classify as an HTTP error (4xx/5xx)
    /// but should be treated as a normal response instead.
    pub ignore_http_error_status_codes: Vec<u16>,
    /// Status codes outside the 4xx/5xx range that should still classify as
    /// an HTTP error (retriable, matching the 5xx treatment).
    pub additional_http_error_status_codes: Vec<u16>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            purge_on_start: false,
            max_requests_per_crawl: None,
            max_crawl_depth: None,
            request_handler_timeout: Duration::from_secs(60),
            internal_timeout: Duration::from_secs(5),
            internal_timeout_retries: 3,
            internal_retry_delay: Duration::from_millis(200),
            max_retries: 3,
            max_session_rotations: 10,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_factor: 2,
            retry_backoff_max: Duration::from_secs(30),
            abort_on_error: false,
            keep_alive: false,
            idle_poll_interval: Duration::from_millis(200),
            autoscale: AutoscaleConfig::default(),
            user_agent: "skein-crawler/0.1".to_string(),
            ignore_http_error_status_codes: Vec::new(),
            additional_http_error_status_codes: Vec::new(),
        }
    }
}

/// Callback invoked whenever a request is skipped rather than handled or
/// failed (spec's "Supplemented features": `on_skipped_request`).
pub type OnSkippedRequest = Arc<dyn Fn(&RequestData, &SkipReason) + Send + Sync>;

/// A user-supplied hook run before every retry decision (spec §4.6): may
/// inspect the classified error and return a replacement `RequestData` to
/// reclaim instead of the original (e.g. to rewrite headers before the next
/// attempt). Raising from this hook is always fatal
/// (`CrawlerError::UserDefinedErrorHandler`).
pub type ErrorHandler =
    Arc<dyn Fn(&RequestData, &CrawlerError) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<RequestData>>> + Send>> + Send + Sync>;

/// A user-supplied hook run once per request, after retries (and session
/// rotations) are exhausted and the request is about to be recorded as
/// permanently failed. Raising from this hook is also fatal.
pub type FailedRequestHandler =
    Arc<dyn Fn(&RequestData, &CrawlerError) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// The crawler dispatcher.
pub struct Crawler {
    queue: Arc<dyn RequestQueue>,
    http: SharedHttpClient,
    sessions: Arc<SessionPool>,
    router: Router,
    pipeline: ContextPipeline,
    stats: Arc<Statistics>,
    autoscale: Arc<AutoscaledPool>,
    snapshotter: Arc<Snapshotter>,
    config: DispatcherConfig,
    enqueue_filter: EnqueueFilter,
    on_skipped_request: Option<OnSkippedRequest>,
    error_handler: Option<ErrorHandler>,
    failed_request_handler: Option<FailedRequestHandler>,
    handled_count: AtomicU64,
    dataset: SharedDataset,
    kvs: SharedKeyValueStore,
    abort_flag: Arc<AtomicBool>,
    robots_txt_file: Option<SharedRobotsTxtFile>,
    events: SharedEventManager,
    stop_signal: CancellationToken,
    stop_reason: SyncMutex<Option<String>>,
}

impl Crawler {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        http: SharedHttpClient,
        sessions: Arc<SessionPool>,
        router: Router,
        pipeline: ContextPipeline,
        config: DispatcherConfig,
    ) -> Self {
        let autoscale = Arc::new(AutoscaledPool::new(config.autoscale.clone()));
        Self {
            queue,
            http,
            sessions,
            router,
            pipeline,
            stats: Arc::new(Statistics::new()),
            autoscale,
            snapshotter: Arc::new(Snapshotter::new()),
            config,
            enqueue_filter: EnqueueFilter::default(),
            on_skipped_request: None,
            error_handler: None,
            failed_request_handler: None,
            handled_count: AtomicU64::new(0),
            dataset: Arc::new(InMemoryDataset::new()),
            kvs: Arc::new(InMemoryKeyValueStore::new()),
            abort_flag: Arc::new(AtomicBool::new(false)),
            robots_txt_file: None,
            events: Arc::new(TracingEventManager),
            stop_signal: CancellationToken::new(),
            stop_reason: SyncMutex::new(None),
        }
    }

    pub fn with_enqueue_filter(mut self, filter: EnqueueFilter) -> Self {
        self.enqueue_filter = filter;
        self
    }

    pub fn with_on_skipped_request(mut self, callback: OnSkippedRequest) -> Self {
        self.on_skipped_request = Some(callback);
        self
    }

    /// Register the user-defined error handler (spec §4.6): runs before
    /// every retry decision, ahead of the failed-request handler.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Register the failed-request handler (spec §4.6): runs once per
    /// request, after retries/rotations are exhausted and immediately before
    /// it is recorded as permanently failed.
    pub fn with_failed_request_handler(mut self, handler: FailedRequestHandler) -> Self {
        self.failed_request_handler = Some(handler);
        self
    }

    /// Override the dataset new records are pushed to via `Context::push_data`
    /// (default: an in-process `InMemoryDataset`, discarded at the end of
    /// the run).
    pub fn with_dataset(mut self, dataset: SharedDataset) -> Self {
        self.dataset = dataset;
        self
    }

    /// Override the key-value store backing `Context::get_key_value_store`
    /// / `use_state` (default: an in-process `InMemoryKeyValueStore`).
    pub fn with_key_value_store(mut self, kvs: SharedKeyValueStore) -> Self {
        self.kvs = kvs;
        self
    }

    /// Gate every request on `robots_txt_file` before it's handled (spec
    /// §4.6's robots gate, evaluated with `DispatcherConfig::user_agent`).
    /// Core, unconditional control flow once set — unlike `RobotsGate`,
    /// which is opt-in pipeline middleware a caller must remember to push.
    pub fn with_robots_txt_file(mut self, robots: SharedRobotsTxtFile) -> Self {
        self.robots_txt_file = Some(robots);
        self
    }

    /// Override the event sink crawl lifecycle events are emitted to
    /// (default: `TracingEventManager`).
    pub fn with_event_manager(mut self, events: SharedEventManager) -> Self {
        self.events = events;
        self
    }

    pub fn stats(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    /// Ask the run to stop gracefully once in-flight tasks drain (spec
    /// §4.6.2). `reason`, if given, is retrievable via `stop_reason` —
    /// useful for a host application to distinguish "I asked for this" from
    /// an ordinary queue drain.
    pub fn stop(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            *self.stop_reason.lock() = Some(reason);
        }
        self.stop_signal.cancel();
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().clone()
    }

    /// The predicate spec §4.1/§6.3/§4.6.2/§8 call `is_finished()`: true once
    /// `stop()` has been called, `abort_on_error`'s flag has tripped,
    /// `max_requests_per_crawl` has been reached, or (absent `keep_alive`)
    /// the request queue itself reports done.
    pub async fn is_finished(&self) -> Result<bool> {
        if self.stop_signal.is_cancelled() || self.abort_flag.load(Ordering::Relaxed) {
            return Ok(true);
        }
        if let Some(limit) = self.config.max_requests_per_crawl {
            if self.handled_count.load(Ordering::Relaxed) >= limit {
                return Ok(true);
            }
        }
        if self.config.keep_alive {
            return Ok(false);
        }
        self.queue.is_finished().await
    }

    /// Add seed requests before starting the run.
    pub async fn add_requests(&self, requests: Vec<RequestData>) -> Result<()> {
        self.queue.add_batch(requests, false).await?;
        Ok(())
    }

    /// Run until the queue drains (or forever, if `keep_alive`), `stop()` is
    /// called, or a fatal/aborting error occurs.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.config.purge_on_start {
            self.with_internal_retry("purge", || self.queue.purge()).await?;
        }

        self.events.emit(CrawlerEvent::Started);

        let (scale_stop_tx, scale_stop_rx) = tokio::sync::oneshot::channel();
        let autoscale = self.autoscale.clone();
        let snapshotter = self.snapshotter.clone();
        let scaling_task = tokio::spawn(autoscale.run_scaling_loop(snapshotter, scale_stop_rx));

        let result = self.run_inner().await;

        let _ = scale_stop_tx.send(());
        let _ = scaling_task.await;

        self.events.emit(CrawlerEvent::Stopped);

        result
    }

    /// Drive the autoscaled pool against this crawler's three probes (spec
    /// §4.5): ready-to-claim, claim-and-process-one, and done. Replaces a
    /// hand-managed `JoinSet`+`Semaphore` with `AutoscaledPool::run`, the
    /// same loop every probe-driven caller gets.
    async fn run_inner(self: &Arc<Self>) -> Result<()> {
        let fatal: Arc<SyncMutex<Option<CrawlerError>>> = Arc::new(SyncMutex::new(None));

        let is_task_ready: TaskReadyProbe = {
            let crawler = self.clone();
            Arc::new(move || {
                let crawler = crawler.clone();
                Box::pin(async move { !crawler.queue.is_empty().await.unwrap_or(true) })
            })
        };

        let run_task: RunTaskProbe = {
            let crawler = self.clone();
            let fatal = fatal.clone();
            Arc::new(move || {
                let crawler = crawler.clone();
                let fatal = fatal.clone();
                Box::pin(async move {
                    if let Err(e) = crawler.claim_and_process_one().await {
                        tracing::error!(error = %e, "request task ended in error");
                        *fatal.lock() = Some(e);
                        crawler.stop_signal.cancel();
                    }
                })
            })
        };

        let is_finished: FinishedProbe = {
            let crawler = self.clone();
            let fatal = fatal.clone();
            Arc::new(move || {
                let crawler = crawler.clone();
                let fatal = fatal.clone();
                Box::pin(async move { fatal.lock().is_some() || crawler.is_finished().await.unwrap_or(true) })
            })
        };

        self.autoscale
            .clone()
            .run(is_task_ready, run_task, is_finished, self.config.idle_poll_interval)
            .await;

        match fatal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Claim one pending request and process it to completion, or idle-sleep
    /// if nothing is currently fetchable. One call is one `AutoscaledPool`
    /// `run_task` unit.
    async fn claim_and_process_one(self: &Arc<Self>) -> Result<()> {
        let fetched = self.with_internal_retry("fetch_next", || self.queue.fetch_next()).await?;
        match fetched {
            Some(request) => self.clone().process_one(request).await,
            None => {
                tokio::time::sleep(self.config.idle_poll_interval).await;
                Ok(())
            }
        }
    }

    /// Run `op` up to `internal_timeout_retries` extra times, each attempt
    /// bounded by `internal_timeout`, pausing `internal_retry_delay` between
    /// attempts (spec §5's internal-timeout wrapper around RQ/KVS calls).
    /// A fixed-delay retry, not a reuse of
    /// `Request<Failed>::retry`'s exponential backoff calculator — that
    /// calculator paces retries of a specific failed `Request` against the
    /// request-handler retry policy; this wrapper has no `Request` in scope
    /// and exists only to ride out a brief stall in the RQ/KVS backend.
    async fn with_internal_retry<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.config.internal_timeout, op()).await {
                Ok(result) => return result,
                Err(_) => {
                    if attempt >= self.config.internal_timeout_retries {
                        return Err(CrawlerError::InternalTimeout(self.config.internal_timeout));
                    }
                    attempt += 1;
                    tracing::warn!(op = op_name, attempt, "internal operation timed out, retrying");
                    tokio::time::sleep(self.config.internal_retry_delay).await;
                }
            }
        }
    }

    /// `request.mark_handled`, wrapped in the internal-timeout retry.
    /// `Request<InProgress>` is cheaply `Clone`, so each attempt gets its own
    /// owned copy to hand to the consuming `mark_handled` call.
    async fn mark_handled_with_retry(&self, request: Request<InProgress>) -> Result<Option<Request<Handled>>> {
        self.with_internal_retry("mark_handled", || {
            let request = request.clone();
            async move { request.mark_handled(self.queue.as_ref()).await }
        })
        .await
    }

    /// `request.reclaim`, wrapped in the internal-timeout retry.
    async fn reclaim_with_retry(&self, request: Request<InProgress>, forefront: bool) -> Result<Option<crate::request::Request<crate::request::Pending>>> {
        self.with_internal_retry("reclaim", || {
            let request = request.clone();
            async move { request.reclaim(forefront, self.queue.as_ref()).await }
        })
        .await
    }

    /// Process a single leased request end-to-end: check robots.txt, bind a
    /// session, run the pipeline and handler, then apply the outcome
    /// (commit/retry/skip/fail) per the error decision table in spec §4.6.
    async fn process_one(self: Arc<Self>, request: crate::request::Request<crate::request::InProgress>) -> Result<()> {
        if let Some(robots) = self.robots_txt_file.clone() {
            match robots.is_allowed(&request.data.url, &self.config.user_agent).await {
                Ok(true) => {}
                Ok(false) => return self.skip_request(request, SkipReason::RobotsDisallowed).await,
                Err(e) => return self.handle_failure(request, e).await,
            }
        }

        let mut data = request.data.clone();
        data.processing_state = ProcessingState::RequestHandler;

        let session = if let Some(bound_id) = request.data.session_id {
            match self.sessions.get_session_by_id(bound_id) {
                Some(s) => Some(s),
                None => {
                    let request_id = request.id();
                    return self
                        .handle_failure(request, CrawlerError::RequestCollision(request_id))
                        .await;
                }
            }
        } else {
            self.sessions.get_session().ok()
        };
        if let Some(s) = &session {
            data.session_id = Some(s.id);
        }

        let proxy_url = session.as_ref().and_then(|s| s.proxy_url.clone());
        match tokio::time::timeout(
            self.config.request_handler_timeout,
            self.http.execute(&data, proxy_url.as_deref(), self.config.request_handler_timeout),
        )
        .await
        {
            Ok(Ok(response)) => {
                if let Some(fetch_err) = classify_status(&self.config, response.status) {
                    self.penalize_session(session.as_ref(), &fetch_err);
                    return self.handle_failure(request, fetch_err).await;
                }
                data.loaded_url = Some(response.final_url.clone());
                let mut ctx = Context::new(data).with_collaborators(self.dataset.clone(), self.kvs.clone(), self.http.clone());
                ctx.session = session.clone();
                ctx.response = Some(response);
                self.run_pipeline(request, ctx, session).await
            }
            Ok(Err(e)) => {
                self.penalize_session(session.as_ref(), &e);
                self.handle_failure(request, e).await
            }
            Err(_) => {
                let err = CrawlerError::HandlerTimeout(self.config.request_handler_timeout);
                self.penalize_session(session.as_ref(), &err);
                self.handle_failure(request, err).await
            }
        }
    }

    /// Apply spec §4.6's per-error session action: a `SessionError` always
    /// retires the session outright (it may be blocked), anything else
    /// retriable just dings its health score.
    fn penalize_session(&self, session: Option<&crate::session::Session>, error: &CrawlerError) {
        let Some(session) = session else { return };
        match error {
            CrawlerError::Session(_) => self.sessions.retire(session.id),
            _ => self.sessions.mark_bad(session.id),
        }
    }

    /// Mark a request handled without ever running its handler (spec §4.6's
    /// third disposition, alongside retry/fail): a robots.txt disallow or a
    /// middleware's `ContextPipelineInterrupted` both land here.
    async fn skip_request(&self, request: crate::request::Request<crate::request::InProgress>, reason: SkipReason) -> Result<()> {
        if let Some(cb) = &self.on_skipped_request {
            cb(&request.data, &reason);
        }
        let unique_key = request.unique_key().to_string();
        self.mark_handled_with_retry(request).await?;
        self.stats.record_skipped();
        self.events.emit(CrawlerEvent::RequestSkipped {
            unique_key,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Resolve a handler for `ctx.request.label` and run the context
    /// pipeline around it, then apply the outcome (commit/retry/skip/fail).
    async fn run_pipeline(
        self: Arc<Self>,
        request: crate::request::Request<crate::request::InProgress>,
        ctx: Context,
        session: Option<crate::session::Session>,
    ) -> Result<()> {
        let handler = match self.router.resolve(ctx.request.label.clone().as_deref()) {
            Ok(handler) => handler,
            Err(e) => {
                self.penalize_session(session.as_ref(), &e);
                return self.handle_failure(request, e).await;
            }
        };

        let (mut ctx, handler_result) = match tokio::time::timeout(self.config.request_handler_timeout, self.pipeline.run(ctx, handler)).await {
            Ok((ctx, result)) => (ctx, result),
            Err(_) => {
                let mut ctx =
                    Context::new(request.data.clone()).with_collaborators(self.dataset.clone(), self.kvs.clone(), self.http.clone());
                ctx.session = session.clone();
                (ctx, Err(CrawlerError::HandlerTimeout(self.config.request_handler_timeout)))
            }
        };

        match handler_result {
            Ok(()) => {
                if let Some(s) = &session {
                    self.sessions.mark_good(s.id);
                }
                self.commit_links(&mut ctx, request.data.crawl_depth).await?;
                let unique_key = request.unique_key().to_string();
                self.mark_handled_with_retry(request).await?;
                self.stats.record_finished();
                self.handled_count.fetch_add(1, Ordering::Relaxed);
                self.events.emit(CrawlerEvent::RequestFinished { unique_key });
                Ok(())
            }
            Err(e) if e.is_skip() => {
                if let Some(s) = &session {
                    self.sessions.mark_good(s.id);
                }
                let reason = match &e {
                    CrawlerError::ContextPipelineInterrupted(msg) => SkipReason::Custom(msg.clone()),
                    _ => unreachable!(),
                };
                self.skip_request(request, reason).await
            }
            Err(e) => {
                self.penalize_session(session.as_ref(), &e);
                self.handle_failure(request, e).await
            }
        }
    }

    /// Apply spec §4.6's error decision table: fatal errors always terminate
    /// the whole run; `SessionError` retries up to `max_session_rotations`
    /// without touching `retry_count`; everything else retriable retries up
    /// to `max_retries` (or the request's own override). The user-defined
    /// error handler (if registered) runs first, ahead of every branch; the
    /// failed-request handler runs immediately before any permanent-failure
    /// outcome is recorded.
    async fn handle_failure(
        &self,
        mut request: crate::request::Request<crate::request::InProgress>,
        error: CrawlerError,
    ) -> Result<()> {
        let error_kind = error_kind_name(&error);
        let request_id = request.id();

        if let Some(eh) = &self.error_handler {
            match eh(&request.data, &error).await {
                Ok(Some(replacement)) => request.data = replacement,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "user-defined error handler raised");
                    self.stats.record_failed("UserDefinedErrorHandler");
                    self.mark_handled_with_retry(request).await?;
                    return Err(CrawlerError::UserDefinedErrorHandler(e));
                }
            }
        }

        if error.is_fatal() {
            tracing::error!(request_id = %request_id, error = %error, "fatal error, not retrying");
            self.stats.record_failed(&error_kind);
            self.run_failed_request_handler(&request.data, &error).await?;
            self.events.emit(CrawlerEvent::RequestFailed {
                unique_key: request.unique_key().to_string(),
                error: error.to_string(),
            });
            self.mark_handled_with_retry(request).await?;
            return Err(error);
        }

        if matches!(error, CrawlerError::Session(_)) {
            let rotations = request.data.session_rotation_count;
            if rotations >= self.config.max_session_rotations {
                tracing::warn!(request_id = %request_id, rotations, "request failed: session rotations exhausted");
                self.stats.record_failed(&error_kind);
                self.run_failed_request_handler(&request.data, &error).await?;
                self.events.emit(CrawlerEvent::RequestFailed {
                    unique_key: request.unique_key().to_string(),
                    error: error.to_string(),
                });
                self.mark_handled_with_retry(request).await?;
                if self.config.abort_on_error {
                    self.abort_flag.store(true, Ordering::Relaxed);
                }
                return Ok(());
            }
            self.stats.record_retry(rotations + 1, &error_kind);
            tracing::info!(request_id = %request_id, rotations = rotations + 1, "rotating session and retrying");
            request.data.session_rotation_count = rotations + 1;
            self.reclaim_with_retry(request, false).await?;
            return Ok(());
        }

        let retry_count = request.data.retry_count;
        let max_retries = request.data.max_retries.unwrap_or(self.config.max_retries);

        if request.data.no_retry || !error.is_retriable() || retry_count >= max_retries {
            tracing::warn!(
                request_id = %request_id,
                retry_count,
                max_retries,
                error = %error,
                "request failed permanently"
            );
            self.stats.record_failed(&error_kind);
            self.run_failed_request_handler(&request.data, &error).await?;
            self.events.emit(CrawlerEvent::RequestFailed {
                unique_key: request.unique_key().to_string(),
                error: error.to_string(),
            });
            self.mark_handled_with_retry(request).await?;
            if self.config.abort_on_error {
                self.abort_flag.store(true, Ordering::Relaxed);
            }
            return Ok(());
        }

        self.stats.record_retry(retry_count + 1, &error_kind);
        tracing::info!(request_id = %request_id, retry_count = retry_count + 1, error = %error, "retrying request");
        request.data.retry_count = retry_count + 1;
        self.reclaim_with_retry(request, false).await?;
        Ok(())
    }

    /// Run the failed-request handler, if registered, once a request's
    /// outcome has been decided as a permanent failure. Per spec §4.6, any
    /// exception it raises is fatal.
    async fn run_failed_request_handler(&self, request: &RequestData, error: &CrawlerError) -> Result<()> {
        let Some(fh) = &self.failed_request_handler else {
            return Ok(());
        };
        if let Err(e) = fh(request, error).await {
            tracing::error!(request_id = %request.id, error = %e, "failed-request handler raised");
            return Err(CrawlerError::UserDefinedErrorHandler(e));
        }
        Ok(())
    }

    /// Flush a handler's buffered links and dataset pushes (spec §6.1's
    /// `add_requests`/`push_data`), per the enqueue-commit protocol in
    /// spec §4.6.1. Only reached once the handler has returned `Ok`, so a
    /// handler that fails partway through never gets its links enqueued.
    ///
    /// Each `add_requests`/`add_requests_with` call the handler made is its
    /// own [`crate::pipeline::EnqueuedBatch`], carrying its own
    /// `base_url`/`strategy`/`include`/`exclude` overrides; a link must pass
    /// both the crawler-wide `EnqueueFilter` and that call's own filter to be
    /// enqueued.
    async fn commit_links(&self, ctx: &mut Context, parent_depth: u32) -> Result<()> {
        let batches = ctx.take_new_requests();
        let pushed = ctx.take_pushed_data();
        for item in pushed {
            ctx.dataset().push(item).await?;
        }

        if batches.is_empty() {
            return Ok(());
        }

        let parent_url = ctx.request.loaded_url.clone().unwrap_or_else(|| ctx.request.url.clone());

        // Split into forefront and regular batches, preserving each
        // sub-sequence's relative order, and insert each as its own
        // `add_batch` call so forefront links precede the currently-pending
        // tail while regular links still append in the order the handler
        // produced them (spec §4.6.1).
        let mut forefront = Vec::new();
        let mut regular = Vec::new();

        for batch in batches {
            let base_url = batch.options.base_url.as_deref().unwrap_or(&parent_url);
            let per_call_filter = build_enqueue_filter(&batch.options)?;

            for mut input in batch.requests {
                if let Some(resolved) = resolve_against_base(base_url, &input.url) {
                    input.url = resolved;
                }

                if let Some(max_depth) = self.config.max_crawl_depth {
                    if parent_depth + 1 > max_depth {
                        continue;
                    }
                }

                let strategy = batch.options.strategy.unwrap_or(input.enqueue_strategy);
                if !self.enqueue_filter.allows(&parent_url, &input.url, strategy) {
                    continue;
                }
                if let Some(filter) = &per_call_filter {
                    if !filter.allows(&parent_url, &input.url, strategy) {
                        continue;
                    }
                }

                input.crawl_depth = parent_depth + 1;
                let is_forefront = input.forefront;
                let data = input.build()?;
                if is_forefront {
                    forefront.push(data);
                } else {
                    regular.push(data);
                }
            }
        }

        if !forefront.is_empty() {
            self.with_internal_retry("add_batch_forefront", || {
                let forefront = forefront.clone();
                async move { self.queue.add_batch(forefront, true).await }
            })
            .await?;
        }
        if !regular.is_empty() {
            self.with_internal_retry("add_batch_regular", || {
                let regular = regular.clone();
                async move { self.queue.add_batch(regular, false).await }
            })
            .await?;
        }
        Ok(())
    }
}

/// Build the per-call `include`/`exclude` glob filter for one
/// `add_requests_with` batch, or `None` if neither was supplied. Invalid
/// glob patterns are a handler bug, surfaced as `CrawlerError::Other` rather
/// than silently ignored.
fn build_enqueue_filter(options: &AddRequestsOptions) -> Result<Option<EnqueueFilter>> {
    if options.include.is_empty() && options.exclude.is_empty() {
        return Ok(None);
    }
    let mut filter = EnqueueFilter::new();
    for pattern in &options.include {
        filter = filter
            .with_include_glob(pattern)
            .map_err(|e| CrawlerError::Other(anyhow::anyhow!("invalid include pattern {pattern:?}: {e}")))?;
    }
    for pattern in &options.exclude {
        filter = filter
            .with_exclude_glob(pattern)
            .map_err(|e| CrawlerError::Other(anyhow::anyhow!("invalid exclude pattern {pattern:?}: {e}")))?;
    }
    Ok(Some(filter))
}

/// Resolve `candidate` against `base` if `candidate` isn't already an
/// absolute URL. Returns `None` (leave `candidate` untouched) if `base`
/// itself can't be parsed, or if `candidate` is already absolute.
fn resolve_against_base(base: &str, candidate: &str) -> Option<String> {
    if Url::parse(candidate).is_ok() {
        return None;
    }
    let base = Url::parse(base).ok()?;
    base.join(candidate).ok().map(|u| u.to_string())
}

/// Turn a fetched HTTP status into an error per the decision table (spec
/// §4.6 / §7): 5xx is a retriable server error, 4xx is a non-retriable
/// client error, anything else is not an error at all — except for the two
/// host-configured overrides, which take priority over those ranges.
fn classify_status(config: &DispatcherConfig, status: u16) -> Option<CrawlerError> {
    if config.ignore_http_error_status_codes.contains(&status) {
        return None;
    }
    if config.additional_http_error_status_codes.contains(&status) {
        return Some(CrawlerError::HttpStatusCode(format!("configured error status {status}"), status));
    }
    match status {
        500..=599 => Some(CrawlerError::HttpStatusCode(format!("server error {status}"), status)),
        400..=499 => Some(CrawlerError::HttpClientStatusCode(format!("client error {status}"), status)),
        _ => None,
    }
}


fn error_kind_name(error: &CrawlerError) -> String {
    match error {
        CrawlerError::Session(_) => "Session",
        CrawlerError::HttpStatusCode(..) => "HttpStatusCode",
        CrawlerError::HttpClientStatusCode(..) => "HttpClientStatusCode",
        CrawlerError::ContextPipelineInitialization(_) => "ContextPipelineInitialization",
        CrawlerError::ContextPipelineInterrupted(_) => "ContextPipelineInterrupted",
        CrawlerError::ContextPipelineFinalization(_) => "ContextPipelineFinalization",
        CrawlerError::RequestHandler(_) => "RequestHandler",
        CrawlerError::RequestCollision(_) => "RequestCollision",
        CrawlerError::UserDefinedErrorHandler(_) => "UserDefinedErrorHandler",
        CrawlerError::HandlerTimeout(_) => "HandlerTimeout",
        CrawlerError::InternalTimeout(_) => "InternalTimeout",
        CrawlerError::RequestNotFound(_) => "RequestNotFound",
        CrawlerError::InvalidState(..) => "InvalidState",
        CrawlerError::SchemaViolation(_) => "SchemaViolation",
        CrawlerError::Storage(_) => "Storage",
        CrawlerError::Other(_) => "Other",
    }
    .to_string()
}

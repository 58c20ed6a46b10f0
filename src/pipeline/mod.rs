//! Context Pipeline: an explicit setup/teardown stack run around each
//! request handler invocation, rather than a coroutine-style generator —
//! see spec §4.2.
//!
//! Each [`Middleware`] gets a chance to enrich the [`Context`] before the
//! handler runs and to react once it (and every middleware below it) has
//! finished. Cleanups run in LIFO order via a `scopeguard`-style stack,
//! mirroring how `fusillade::daemon::Daemon::run` wraps a single in-flight
//! task with a `scopeguard::guard` that decrements `requests_in_flight`
//! regardless of how the task exits — generalized here to an arbitrary
//! number of nested guards instead of one fixed counter.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CrawlerError, Result};
use crate::http::{HttpClient, HttpResponse, SharedHttpClient};
use crate::interfaces::{InMemoryDataset, InMemoryKeyValueStore, SharedDataset, SharedKeyValueStore};
use crate::request::{EnqueueStrategy, RequestData, RequestInput};
use crate::session::Session;

/// Per-call overrides for [`Context::add_requests_with`] (spec §4.6.1),
/// layered on top of the crawler-wide `EnqueueFilter`: a link must pass both
/// to be enqueued.
#[derive(Debug, Clone, Default)]
pub struct AddRequestsOptions {
    /// Overrides every link's own `RequestInput::enqueue_strategy` for this
    /// call, rather than relying on each input carrying its own.
    pub strategy: Option<EnqueueStrategy>,
    /// Glob patterns a link must match at least one of, if non-empty.
    pub include: Vec<String>,
    /// Glob patterns that reject a link if any match.
    pub exclude: Vec<String>,
    /// Truncate this call's batch to at most this many links, preserving
    /// the order the handler produced them in.
    pub limit: Option<usize>,
    /// Resolve relative links against this URL instead of the request that
    /// produced them (its `loaded_url`, falling back to `url`).
    pub base_url: Option<String>,
}

/// One `add_requests`/`add_requests_with` call's buffered links, carried
/// through to the dispatcher's commit step alongside the options that call
/// was made with.
pub struct EnqueuedBatch {
    pub requests: Vec<RequestInput>,
    pub options: AddRequestsOptions,
}

/// A handler's future, borrowing the context for the duration of one call.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A request handler: takes the context, does its work (parsing, enqueuing
/// links, writing to a dataset), and returns whether it succeeded.
pub type Handler = Arc<dyn Fn(&mut Context) -> HandlerFuture<'_> + Send + Sync>;

/// Wrap a closure returning a boxed future into a [`Handler`].
///
/// Callers box their own `async move` block (`handler(|ctx| Box::pin(async
/// move { ... }))`) rather than handing back a bare `Fut` type parameter,
/// since the handler's future generally borrows `ctx` for its own duration
/// — fixing `Fut` to one concrete type across every call (as a naive
/// generic wrapper would require) would rule that out.
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-request state threaded through middleware and into the handler,
/// implementing the Handler API described in spec §6.1.
///
/// `extensions` lets middleware attach typed side-channel data (parsed DOM,
/// extracted links, a decoded response body) without the pipeline needing to
/// know about every middleware's concrete type up front. `new_requests` and
/// `pushed_data` are the buffered halves of spec §3's `RequestHandlerRunResult`
/// — populated by `add_requests`/`push_data`, drained and committed by the
/// dispatcher only once the handler returns successfully.
pub struct Context {
    pub request: RequestData,
    pub session: Option<Session>,
    pub response: Option<HttpResponse>,
    extensions: HashMap<TypeId, Box<dyn Any + Send>>,
    dataset: SharedDataset,
    kvs: SharedKeyValueStore,
    http: Option<SharedHttpClient>,
    new_requests: Vec<EnqueuedBatch>,
    pushed_data: Vec<Value>,
    span: tracing::Span,
}

impl Context {
    pub fn new(request: RequestData) -> Self {
        let span = tracing::info_span!("request", request_id = %request.id, url = %request.url);
        Self {
            request,
            session: None,
            response: None,
            extensions: HashMap::new(),
            dataset: Arc::new(InMemoryDataset::new()),
            kvs: Arc::new(InMemoryKeyValueStore::new()),
            http: None,
            new_requests: Vec::new(),
            pushed_data: Vec::new(),
            span,
        }
    }

    /// Wire in the dispatcher's shared collaborators (spec §6.3) so
    /// `push_data`/`get_key_value_store`/`send_request` reach the real
    /// backends instead of this context's private in-memory defaults.
    pub fn with_collaborators(mut self, dataset: SharedDataset, kvs: SharedKeyValueStore, http: SharedHttpClient) -> Self {
        self.dataset = dataset;
        self.kvs = kvs;
        self.http = Some(http);
        self
    }

    pub fn insert<T: Send + 'static>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Send + 'static>(&self) -> Option<&T> {
        self.extensions.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref())
    }

    /// Buffer links for the dispatcher's enqueue-commit protocol (spec
    /// §4.6 step 5). Not visible to the RQ until the handler returns `Ok`.
    pub fn add_requests(&mut self, requests: impl IntoIterator<Item = RequestInput>) {
        self.add_requests_with(requests, AddRequestsOptions::default());
    }

    /// Like [`Context::add_requests`], but with per-call overrides (spec
    /// §4.6.1's `include`/`exclude`/`limit`/`base_url`/`strategy`) layered on
    /// top of the crawler-wide `EnqueueFilter` at commit time.
    pub fn add_requests_with(&mut self, requests: impl IntoIterator<Item = RequestInput>, options: AddRequestsOptions) {
        let mut requests: Vec<RequestInput> = requests.into_iter().collect();
        if let Some(limit) = options.limit {
            requests.truncate(limit);
        }
        self.new_requests.push(EnqueuedBatch { requests, options });
    }

    /// Buffer a scraped record for the dataset. Flushed after the handler
    /// succeeds, alongside `add_requests`.
    pub fn push_data(&mut self, item: Value) {
        self.pushed_data.push(item);
    }

    /// The key-value store backing `get_key_value_store`/`use_state` (spec
    /// §6.1). Writes go through immediately rather than buffering — unlike
    /// `add_requests`/`push_data`, KVS entries are typically cursors or
    /// dedup markers a crashed handler would want persisted regardless.
    pub fn get_key_value_store(&self) -> SharedKeyValueStore {
        self.kvs.clone()
    }

    /// Read a per-key shared value from the default KVS, seeding it with
    /// `default` on first access (spec §6.1's `use_state`).
    pub async fn use_state(&self, key: &str, default: Value) -> Result<Value> {
        if let Some(existing) = self.kvs.get(key).await? {
            return Ok(existing);
        }
        self.kvs.set(key, default.clone()).await?;
        Ok(default)
    }

    /// Issue an additional HTTP request through the crawler's injected
    /// client, reusing this context's session/proxy (spec §6.1's
    /// `send_request`).
    pub async fn send_request(&self, url: &str, method: &str) -> Result<HttpResponse> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| CrawlerError::Other(anyhow::anyhow!("context has no http client configured")))?;
        let mut input = RequestInput::new(url);
        input.method = method.to_string();
        let data = input.build()?;
        let proxy_url = self.session.as_ref().and_then(|s| s.proxy_url.clone());
        http.execute(&data, proxy_url.as_deref(), Duration::from_secs(60)).await
    }

    /// Scoped logger for this request (spec §6.1's `log`): every event
    /// emitted through it carries `request_id`/`url` fields automatically.
    pub fn log(&self) -> &tracing::Span {
        &self.span
    }

    /// Drain buffered links for the dispatcher's commit step. Internal:
    /// handlers go through `add_requests`/`add_requests_with`, not this.
    pub(crate) fn take_new_requests(&mut self) -> Vec<EnqueuedBatch> {
        std::mem::take(&mut self.new_requests)
    }

    /// Drain buffered dataset pushes for the dispatcher's commit step.
    pub(crate) fn take_pushed_data(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pushed_data)
    }

    pub(crate) fn dataset(&self) -> &SharedDataset {
        &self.dataset
    }
}

/// A single stage of the pipeline. Implementations typically bind a
/// session, attach a proxy, parse a response body, or enforce a policy.
///
/// `setup` runs before the handler (and before any middleware further down
/// the stack); the returned `Cleanup` runs after the handler returns,
/// innermost-first. Returning `Err` from `setup` aborts the remaining setup
/// phase and unwinds whatever cleanups have already been registered —
/// see [`ContextPipeline::run`].
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn setup(&self, ctx: &mut Context) -> Result<Cleanup>;
}

/// A no-op cleanup that middleware can return from `setup` when they have
/// nothing to unwind.
pub fn no_cleanup() -> Cleanup {
    Cleanup(None)
}

/// Boxed teardown action, run regardless of whether the handler (or a
/// middleware further down the stack) succeeded or failed. Fallible: a
/// cleanup that itself raises surfaces as
/// [`CrawlerError::ContextPipelineFinalization`] (spec §4.2).
pub struct Cleanup(Option<Box<dyn FnOnce(&mut Context, Option<&CrawlerError>) -> Result<()> + Send>>);

impl Cleanup {
    pub fn new(f: impl FnOnce(&mut Context, Option<&CrawlerError>) -> Result<()> + Send + 'static) -> Self {
        Cleanup(Some(Box::new(f)))
    }

    fn run(self, ctx: &mut Context, err: Option<&CrawlerError>) -> Result<()> {
        match self.0 {
            Some(f) => f(ctx, err),
            None => Ok(()),
        }
    }
}

/// An ordered stack of middleware, run around a request handler.
pub struct ContextPipeline {
    middleware: Vec<Box<dyn Middleware>>,
}

impl ContextPipeline {
    pub fn new() -> Self {
        Self { middleware: Vec::new() }
    }

    pub fn push(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(middleware));
        self
    }

    /// Run setup for every middleware, then the handler, then every
    /// cleanup in reverse order — regardless of whether the handler
    /// succeeded.
    ///
    /// Error classification (spec §4.2 / §7):
    /// - a middleware's `setup` failing is wrapped as
    ///   [`CrawlerError::ContextPipelineInitialization`] and is retriable.
    /// - the handler itself failing is surfaced as-is (already a
    ///   `CrawlerError`, typically [`CrawlerError::RequestHandler`]).
    /// - a cleanup that itself raises is wrapped as
    ///   [`CrawlerError::ContextPipelineFinalization`] and takes priority
    ///   over whatever error (if any) the handler/setup phase already
    ///   produced, since the run otherwise looks like it tore down cleanly.
    /// - a cleanup that wants to convert a failure into a skip (rather than
    ///   a retry) returns that decision to its caller out-of-band, since
    ///   cleanups run for side effects only; the dispatcher applies that
    ///   policy by inspecting the request's `processing_state` after
    ///   `run` returns (see [`crate::dispatcher`]).
    pub async fn run(&self, mut ctx: Context, handler: Handler) -> (Context, Result<()>) {
        let mut cleanups = Vec::with_capacity(self.middleware.len());

        for mw in &self.middleware {
            match mw.setup(&mut ctx).await {
                Ok(cleanup) => cleanups.push(cleanup),
                // A middleware asking for the request to be skipped (e.g. a
                // robots.txt gate) is passed through unwrapped; anything
                // else is a genuine setup failure and is retriable.
                Err(e @ CrawlerError::ContextPipelineInterrupted(_)) => {
                    let result = unwind(&mut ctx, cleanups, Some(&e)).and(Err(e));
                    return (ctx, result);
                }
                Err(e) => {
                    let init_err = CrawlerError::ContextPipelineInitialization(Box::new(e));
                    let result = unwind(&mut ctx, cleanups, Some(&init_err)).and(Err(init_err));
                    return (ctx, result);
                }
            }
        }

        let handler_result = handler(&mut ctx).await;
        let unwind_result = unwind(&mut ctx, cleanups, handler_result.as_ref().err());

        match unwind_result {
            Ok(()) => (ctx, handler_result),
            Err(finalization_err) => (ctx, Err(finalization_err)),
        }
    }
}

impl Default for ContextPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Run every cleanup in LIFO order, regardless of earlier failures. The
/// first cleanup that raises wins and is wrapped as
/// [`CrawlerError::ContextPipelineFinalization`]; later cleanups still run
/// for their side effects but their own errors are logged, not propagated,
/// since only one error can be reported per `run` call.
fn unwind(ctx: &mut Context, cleanups: Vec<Cleanup>, err: Option<&CrawlerError>) -> Result<()> {
    let mut first_failure = None;
    for cleanup in cleanups.into_iter().rev() {
        if let Err(e) = cleanup.run(ctx, err) {
            tracing::error!(error = %e, "cleanup failed");
            first_failure.get_or_insert(e);
        }
    }
    match first_failure {
        Some(e) => Err(CrawlerError::ContextPipelineFinalization(Box::new(e))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recording {
        order: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        fail_setup: bool,
        fail_cleanup: bool,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn setup(&self, _ctx: &mut Context) -> Result<Cleanup> {
            if self.fail_setup {
                return Err(CrawlerError::Session("boom".to_string()));
            }
            self.order.lock().push(self.name);
            let order = self.order.clone();
            let name = self.name;
            let fail_cleanup = self.fail_cleanup;
            Ok(Cleanup::new(move |_ctx, _err| {
                order.lock().push(name);
                if fail_cleanup {
                    return Err(CrawlerError::Session("cleanup boom".to_string()));
                }
                Ok(())
            }))
        }
    }

    impl Recording {
        fn new(order: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Self {
            Self {
                order,
                name,
                fail_setup: false,
                fail_cleanup: false,
            }
        }
    }

    fn request() -> RequestData {
        RequestInput::new("https://example.com/").build().unwrap()
    }

    #[tokio::test]
    async fn cleanups_run_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new()
            .push(Recording::new(order.clone(), "outer-setup"))
            .push(Recording::new(order.clone(), "inner-setup"));

        let (_, result) = pipeline
            .run(Context::new(request()), handler(|_ctx| Box::pin(async { Ok(()) })))
            .await;
        assert!(result.is_ok());

        let recorded = order.lock().clone();
        assert_eq!(recorded, vec!["outer-setup", "inner-setup", "inner-setup", "outer-setup"]);
    }

    #[tokio::test]
    async fn failed_setup_unwinds_already_registered_cleanups() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new().push(Recording::new(order.clone(), "a")).push(Recording {
            fail_setup: true,
            ..Recording::new(order.clone(), "b")
        });

        let (_, result) = pipeline
            .run(Context::new(request()), handler(|_ctx| Box::pin(async { Ok(()) })))
            .await;

        assert!(matches!(result, Err(CrawlerError::ContextPipelineInitialization(_))));
        assert_eq!(order.lock().clone(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn handler_error_still_runs_cleanups() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new().push(Recording::new(order.clone(), "only"));

        let (_, result) = pipeline
            .run(
                Context::new(request()),
                handler(|_ctx| {
                    Box::pin(async { Err(CrawlerError::RequestHandler(anyhow::anyhow!("handler blew up"))) })
                }),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(order.lock().clone(), vec!["only", "only"]);
    }

    #[tokio::test]
    async fn failing_cleanup_surfaces_as_finalization_error_but_still_unwinds_the_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new().push(Recording::new(order.clone(), "outer")).push(Recording {
            fail_cleanup: true,
            ..Recording::new(order.clone(), "inner")
        });

        let (_, result) = pipeline
            .run(Context::new(request()), handler(|_ctx| Box::pin(async { Ok(()) })))
            .await;

        assert!(matches!(result, Err(CrawlerError::ContextPipelineFinalization(_))));
        // Both cleanups still ran despite the inner one raising.
        assert_eq!(order.lock().clone(), vec!["outer", "inner", "inner", "outer"]);
    }
}

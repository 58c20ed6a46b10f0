//! End-to-end seed scenarios for the crawler dispatcher, each exercising one
//! of the testable invariants the runtime is built around: FIFO ordering,
//! the retry bound, forefront precedence, session rotation, robots.txt
//! skipping, and the crawl depth bound.
//!
//! Every scenario wires the same five collaborators (`InMemoryRequestQueue`,
//! `MockHttpClient`, `SessionPool`, `Router`, `ContextPipeline`) into a
//! `Crawler` and runs it to completion, the same integration-test shape
//! `fusillade`'s own daemon tests use, extended with a crawl-specific set of
//! seed requests per scenario. `AutoscaleConfig::default()`'s 5s
//! `scale_interval` never ticks during these short runs, so concurrency
//! stays pinned at `min_concurrency` (1) and request handling order is
//! deterministic.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatcher::{Crawler, DispatcherConfig};
use crate::error::CrawlerError;
use crate::http::{ok_response, MockHttpClient};
use crate::interfaces::RobotsTxtFile;
use crate::pipeline::{handler, ContextPipeline};
use crate::queue::in_memory::InMemoryRequestQueue;
use crate::queue::RequestQueue;
use crate::request::{RequestInput, SessionId};
use crate::router::Router;
use crate::session::{SessionPool, SessionPoolConfig};

/// S1: three seeded URLs are handled in the order they were enqueued.
#[tokio::test]
async fn s1_fifo_across_seeded_urls() {
    let queue: Arc<dyn RequestQueue> = Arc::new(InMemoryRequestQueue::new());
    let http = MockHttpClient::new();
    for url in ["https://a.example/", "https://b.example/", "https://c.example/"] {
        http.add_response("GET", url, ok_response(200, ""));
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let recorded = order.clone();
    let mut router = Router::new();
    router
        .set_default_handler(handler(move |ctx| {
            let recorded = recorded.clone();
            let url = ctx.request.url.clone();
            Box::pin(async move {
                recorded.lock().push(url);
                Ok(())
            })
        }))
        .unwrap();

    queue
        .add_batch(
            vec![
                RequestInput::new("https://a.example/").build().unwrap(),
                RequestInput::new("https://b.example/").build().unwrap(),
                RequestInput::new("https://c.example/").build().unwrap(),
            ],
            false,
        )
        .await
        .unwrap();

    let crawler = Arc::new(Crawler::new(
        queue,
        Arc::new(http),
        Arc::new(SessionPool::new(SessionPoolConfig::default())),
        router,
        ContextPipeline::new(),
        DispatcherConfig::default(),
    ));

    crawler.clone().run().await.unwrap();

    assert_eq!(
        order.lock().clone(),
        vec!["https://a.example/", "https://b.example/", "https://c.example/"]
    );
    let snapshot = crawler.stats().snapshot();
    assert_eq!(snapshot.requests_finished, 3);
    assert_eq!(snapshot.requests_failed, 0);
}

/// S2: 20 requests, `max_retries=2`. Requests whose id is a multiple of 5
/// fail every attempt and exhaust their retry budget (permanent failure);
/// the remaining even ids fail their first attempt then succeed; odd ids
/// (other than multiples of 5) succeed immediately. Exercises the retry
/// bound (invariant 3) and the retry histogram.
#[tokio::test]
async fn s2_retry_bound_and_histogram() {
    let queue: Arc<dyn RequestQueue> = Arc::new(InMemoryRequestQueue::new());
    let http = MockHttpClient::new();
    let mut inputs = Vec::new();

    for id in 0..20u32 {
        let url = format!("https://s2.example/{id}");
        if id % 5 == 0 {
            for _ in 0..3 {
                http.add_response("GET", &url, ok_response(500, ""));
            }
        } else if id % 2 == 0 {
            http.add_response("GET", &url, ok_response(500, ""));
            http.add_response("GET", &url, ok_response(200, ""));
        } else {
            http.add_response("GET", &url, ok_response(200, ""));
        }
        inputs.push(RequestInput::new(url).build().unwrap());
    }

    queue.add_batch(inputs, false).await.unwrap();

    let mut router = Router::new();
    router
        .set_default_handler(handler(|_ctx| Box::pin(async { Ok(()) })))
        .unwrap();

    let crawler = Arc::new(Crawler::new(
        queue,
        Arc::new(http),
        Arc::new(SessionPool::new(SessionPoolConfig::default())),
        router,
        ContextPipeline::new(),
        DispatcherConfig {
            max_retries: 2,
            ..Default::default()
        },
    ));

    crawler.clone().run().await.unwrap();

    let snapshot = crawler.stats().snapshot();
    assert_eq!(snapshot.requests_finished, 16);
    assert_eq!(snapshot.requests_failed, 4);
    assert_eq!(snapshot.requests_retried, 16);
    assert_eq!(snapshot.retry_histogram.get(&1), Some(&12));
    assert_eq!(snapshot.retry_histogram.get(&2), Some(&4));
}

/// S3: while handling `n1`, the handler enqueues `p1..p3` at the forefront
/// and `n3` normally. Forefront links precede the rest of the already-
/// pending tail (`n2`), which in turn precedes the newly-queued `n3`.
#[tokio::test]
async fn s3_forefront_precedes_pending_tail() {
    let queue: Arc<dyn RequestQueue> = Arc::new(InMemoryRequestQueue::new());
    let http = MockHttpClient::new();
    for url in [
        "https://s3.example/n1",
        "https://s3.example/n2",
        "https://s3.example/p1",
        "https://s3.example/p2",
        "https://s3.example/p3",
        "https://s3.example/n3",
    ] {
        http.add_response("GET", url, ok_response(200, ""));
    }

    queue
        .add_batch(
            vec![
                RequestInput::new("https://s3.example/n1").build().unwrap(),
                RequestInput::new("https://s3.example/n2").build().unwrap(),
            ],
            false,
        )
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let recorded = order.clone();
    let mut router = Router::new();
    router
        .set_default_handler(handler(move |ctx| {
            let recorded = recorded.clone();
            Box::pin(async move {
                let url = ctx.request.url.clone();
                recorded.lock().push(url.clone());
                if url == "https://s3.example/n1" {
                    ctx.add_requests(vec![
                        RequestInput {
                            forefront: true,
                            ..RequestInput::new("https://s3.example/p1")
                        },
                        RequestInput {
                            forefront: true,
                            ..RequestInput::new("https://s3.example/p2")
                        },
                        RequestInput {
                            forefront: true,
                            ..RequestInput::new("https://s3.example/p3")
                        },
                        RequestInput::new("https://s3.example/n3"),
                    ]);
                }
                Ok(())
            })
        }))
        .unwrap();

    let crawler = Arc::new(Crawler::new(
        queue,
        Arc::new(http),
        Arc::new(SessionPool::new(SessionPoolConfig::default())),
        router,
        ContextPipeline::new(),
        DispatcherConfig::default(),
    ));

    crawler.clone().run().await.unwrap();

    assert_eq!(
        order.lock().clone(),
        vec![
            "https://s3.example/n1",
            "https://s3.example/p1",
            "https://s3.example/p2",
            "https://s3.example/p3",
            "https://s3.example/n2",
            "https://s3.example/n3",
        ]
    );
}

/// S4: a single-session pool with a handler that always raises
/// `CrawlerError::Session`. Each failure retires the session outright
/// (spec §4.3), so with `max_session_rotations=6` the request burns through
/// 7 distinct sessions before failing permanently.
#[tokio::test]
async fn s4_session_rotation_on_repeated_block() {
    let queue: Arc<dyn RequestQueue> = Arc::new(InMemoryRequestQueue::new());
    let http = MockHttpClient::new();
    for _ in 0..10 {
        http.add_response("GET", "https://s4.example/", ok_response(200, ""));
    }

    queue
        .add_batch(vec![RequestInput::new("https://s4.example/").build().unwrap()], false)
        .await
        .unwrap();

    let seen: Arc<Mutex<HashSet<SessionId>>> = Arc::new(Mutex::new(HashSet::new()));
    let recorded = seen.clone();
    let mut router = Router::new();
    router
        .set_default_handler(handler(move |ctx| {
            let recorded = recorded.clone();
            let session_id = ctx.session.as_ref().map(|s| s.id);
            Box::pin(async move {
                if let Some(id) = session_id {
                    recorded.lock().insert(id);
                }
                Err(CrawlerError::Session("blocked".to_string()))
            })
        }))
        .unwrap();

    let crawler = Arc::new(Crawler::new(
        queue,
        Arc::new(http),
        Arc::new(SessionPool::new(SessionPoolConfig {
            max_pool_size: 1,
            ..Default::default()
        })),
        router,
        ContextPipeline::new(),
        DispatcherConfig {
            max_session_rotations: 6,
            ..Default::default()
        },
    ));

    crawler.clone().run().await.unwrap();

    assert_eq!(seen.lock().len(), 7);
    let snapshot = crawler.stats().snapshot();
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.requests_finished, 0);
}

struct DenyPrivate;

#[async_trait::async_trait]
impl RobotsTxtFile for DenyPrivate {
    async fn is_allowed(&self, url: &str, _user_agent: &str) -> crate::error::Result<bool> {
        Ok(!url.contains("/private"))
    }
}

/// S5: a robots.txt file disallows `/private`, gated unconditionally at the
/// dispatcher's core control flow (not the opt-in `RobotsGate` middleware).
/// The disallowed request is skipped (not failed), the allowed one is
/// handled normally.
#[tokio::test]
async fn s5_robots_disallowed_path_is_skipped() {
    let queue: Arc<dyn RequestQueue> = Arc::new(InMemoryRequestQueue::new());
    let http = MockHttpClient::new();
    http.add_response("GET", "http://h.example/ok", ok_response(200, ""));
    http.add_response("GET", "http://h.example/private", ok_response(200, ""));

    queue
        .add_batch(
            vec![
                RequestInput::new("http://h.example/ok").build().unwrap(),
                RequestInput::new("http://h.example/private").build().unwrap(),
            ],
            false,
        )
        .await
        .unwrap();

    let handled = Arc::new(Mutex::new(Vec::new()));
    let recorded = handled.clone();
    let mut router = Router::new();
    router
        .set_default_handler(handler(move |ctx| {
            let recorded = recorded.clone();
            let url = ctx.request.url.clone();
            Box::pin(async move {
                recorded.lock().push(url);
                Ok(())
            })
        }))
        .unwrap();

    let skipped: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let skipped_cb = skipped.clone();

    let crawler = Arc::new(
        Crawler::new(
            queue,
            Arc::new(http),
            Arc::new(SessionPool::new(SessionPoolConfig::default())),
            router,
            ContextPipeline::new(),
            DispatcherConfig {
                user_agent: "test-bot".to_string(),
                ..Default::default()
            },
        )
        .with_robots_txt_file(Arc::new(DenyPrivate))
        .with_on_skipped_request(Arc::new(move |request, reason| {
            skipped_cb.lock().push((request.url.clone(), reason.to_string()));
        })),
    );

    crawler.clone().run().await.unwrap();

    assert_eq!(handled.lock().clone(), vec!["http://h.example/ok"]);
    assert_eq!(
        skipped.lock().clone(),
        vec![("http://h.example/private".to_string(), "robots_txt".to_string())]
    );
    let snapshot = crawler.stats().snapshot();
    assert_eq!(snapshot.requests_finished, 1);
    assert_eq!(snapshot.requests_skipped, 1);
}

/// S6: `max_crawl_depth=2`. A handler that unconditionally enqueues one
/// child link per request produces exactly 3 handled requests (depths
/// 0, 1, 2) — the depth-3 child is discarded at commit time.
#[tokio::test]
async fn s6_depth_limit_stops_expansion() {
    let queue: Arc<dyn RequestQueue> = Arc::new(InMemoryRequestQueue::new());
    let http = MockHttpClient::new();
    for depth in 0..=3u32 {
        http.add_response("GET", &format!("https://s6.example/{depth}"), ok_response(200, ""));
    }

    queue
        .add_batch(vec![RequestInput::new("https://s6.example/0").build().unwrap()], false)
        .await
        .unwrap();

    let depths = Arc::new(Mutex::new(Vec::new()));
    let recorded = depths.clone();
    let mut router = Router::new();
    router
        .set_default_handler(handler(move |ctx| {
            let recorded = recorded.clone();
            Box::pin(async move {
                let depth = ctx.request.crawl_depth;
                recorded.lock().push(depth);
                ctx.add_requests(vec![RequestInput::new(format!("https://s6.example/{}", depth + 1))]);
                Ok(())
            })
        }))
        .unwrap();

    let crawler = Arc::new(Crawler::new(
        queue,
        Arc::new(http),
        Arc::new(SessionPool::new(SessionPoolConfig::default())),
        router,
        ContextPipeline::new(),
        DispatcherConfig {
            max_crawl_depth: Some(2),
            ..Default::default()
        },
    ));

    crawler.clone().run().await.unwrap();

    assert_eq!(depths.lock().clone(), vec![0, 1, 2]);
    let snapshot = crawler.stats().snapshot();
    assert_eq!(snapshot.requests_finished, 3);
}

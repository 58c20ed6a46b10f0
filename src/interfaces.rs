//! External collaborator traits the dispatcher depends on but doesn't own
//! the implementation of: datasets, key-value stores, event notification,
//! and robots.txt lookups. See spec §6.
//!
//! Each comes with a minimal in-memory default so the crate is usable
//! standalone; production deployments are expected to supply their own
//! (e.g. an S3-backed dataset, a Redis-backed KVS). The trait-plus-default
//! split follows the same shape as [`crate::queue::RequestQueue`] and
//! [`crate::http::HttpClient`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::Result;

/// Append-only storage for structured results a handler produces (spec
/// §6's Dataset). Mirrors the "write, never read back mid-run" usage
/// pattern of a crawl's scraped-item output.
#[async_trait]
pub trait Dataset: Send + Sync {
    async fn push(&self, item: Value) -> Result<()>;
    async fn len(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct InMemoryDataset {
    items: RwLock<Vec<Value>>,
}

impl InMemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<Value> {
        self.items.read().clone()
    }
}

#[async_trait]
impl Dataset for InMemoryDataset {
    async fn push(&self, item: Value) -> Result<()> {
        self.items.write().push(item);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.read().len())
    }
}

/// Small persistent key/value side-channel for crawl-level state (spec
/// §6's KeyValueStore) — e.g. a handler persisting pagination cursors.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Crawl lifecycle events a host application can subscribe to (spec §6's
/// EventManager): request finished/failed/skipped, crawl started/stopped.
#[derive(Debug, Clone, Serialize)]
pub enum CrawlerEvent {
    Started,
    Stopped,
    RequestFinished { unique_key: String },
    RequestFailed { unique_key: String, error: String },
    RequestSkipped { unique_key: String, reason: String },
}

pub trait EventManager: Send + Sync {
    fn emit(&self, event: CrawlerEvent);
}

/// Emits events via `tracing`, which is what every ambient log line in this
/// crate already goes through — no separate event bus needed for the
/// in-process default.
pub struct TracingEventManager;

impl EventManager for TracingEventManager {
    fn emit(&self, event: CrawlerEvent) {
        tracing::info!(?event, "crawler event");
    }
}

/// An [`EventManager`] a host application can subscribe to, for callers
/// that want a live feed of crawl lifecycle events rather than log lines
/// (e.g. a progress UI). Lagging subscribers silently drop the events they
/// fell behind on — `tokio::sync::broadcast`'s own overflow policy — rather
/// than blocking `emit` on a slow reader.
pub struct BroadcastEventManager {
    tx: broadcast::Sender<CrawlerEvent>,
}

impl BroadcastEventManager {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events. Events emitted before this call are not
    /// replayed.
    pub fn subscribe(&self) -> impl Stream<Item = CrawlerEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|result| async move { result.ok() })
    }
}

impl EventManager for BroadcastEventManager {
    fn emit(&self, event: CrawlerEvent) {
        // No subscribers is not an error: `emit` is fire-and-forget.
        let _ = self.tx.send(event);
    }
}

/// Robots.txt lookups (spec §6's RobotsTxtFile), abstracted so a handler
/// or middleware can check `is_allowed` without the dispatcher depending
/// on a specific robots-parsing crate.
#[async_trait]
pub trait RobotsTxtFile: Send + Sync {
    async fn is_allowed(&self, url: &str, user_agent: &str) -> Result<bool>;
}

/// A permissive default that allows everything — used when no robots.txt
/// policy has been configured.
pub struct AllowAllRobots;

#[async_trait]
impl RobotsTxtFile for AllowAllRobots {
    async fn is_allowed(&self, _url: &str, _user_agent: &str) -> Result<bool> {
        Ok(true)
    }
}

pub type SharedDataset = Arc<dyn Dataset>;
pub type SharedKeyValueStore = Arc<dyn KeyValueStore>;
pub type SharedEventManager = Arc<dyn EventManager>;
pub type SharedRobotsTxtFile = Arc<dyn RobotsTxtFile>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_dataset_accumulates_items() {
        let dataset = InMemoryDataset::new();
        dataset.push(serde_json::json!({"title": "a"})).await.unwrap();
        dataset.push(serde_json::json!({"title": "b"})).await.unwrap();
        assert_eq!(dataset.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn in_memory_kvs_round_trips() {
        let kvs = InMemoryKeyValueStore::new();
        kvs.set("cursor", serde_json::json!(42)).await.unwrap();
        assert_eq!(kvs.get("cursor").await.unwrap(), Some(serde_json::json!(42)));
        kvs.delete("cursor").await.unwrap();
        assert_eq!(kvs.get("cursor").await.unwrap(), None);
    }

    #[tokio::test]
    async fn allow_all_robots_always_allows() {
        let robots = AllowAllRobots;
        assert!(robots.is_allowed("https://example.com/", "test-agent").await.unwrap());
    }

    #[tokio::test]
    async fn broadcast_event_manager_delivers_to_subscriber() {
        let manager = BroadcastEventManager::new(16);
        let mut stream = Box::pin(manager.subscribe());
        manager.emit(CrawlerEvent::Started);
        manager.emit(CrawlerEvent::RequestFinished {
            unique_key: "k".to_string(),
        });

        assert!(matches!(stream.next().await, Some(CrawlerEvent::Started)));
        assert!(matches!(stream.next().await, Some(CrawlerEvent::RequestFinished { .. })));
    }
}

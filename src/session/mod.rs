//! Session pool: a set of independent "browser identities" (cookie jars,
//! sticky proxy assignment, a simple health score) that requests can be
//! bound to, so that a block on one session doesn't take down the whole
//! crawl. See spec §4.3.
//!
//! Grounded on `fusillade::daemon::Daemon`'s `semaphores: Arc<RwLock<HashMap<..>>>`
//! lazy-registry pattern, but swapped for `dashmap` (already part of the
//! dependency stack for [`crate::queue`]'s dedup index) since sessions are
//! independent entries rather than per-key serialized resources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

use crate::error::{CrawlerError, Result};
use crate::request::SessionId;

/// A single session's health and identity state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Cookie jar / local-storage stand-in. Handlers may read and mutate
    /// this via [`SessionPool::with_session_mut`].
    pub store: HashMap<String, String>,
    pub proxy_url: Option<String>,
    pub usage_count: u32,
    pub error_score: u32,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(proxy_url: Option<String>) -> Self {
        Self {
            id: SessionId::from(uuid::Uuid::new_v4()),
            store: HashMap::new(),
            proxy_url,
            usage_count: 0,
            error_score: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_usable(&self, config: &SessionPoolConfig) -> bool {
        self.usage_count < config.max_usage_count && self.error_score < config.max_error_score
    }
}

/// Tunables for session lifetime and retirement thresholds.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub max_pool_size: usize,
    pub max_usage_count: u32,
    pub max_error_score: u32,
    /// Penalty applied to a session's error score on a retriable error
    /// attributed to it (spec §4.3 "blocked detection").
    pub block_penalty: u32,
    pub proxy_urls: Vec<String>,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            max_usage_count: 50,
            max_error_score: 3,
            block_penalty: 1,
            proxy_urls: Vec::new(),
        }
    }
}

/// A rotating pool of [`Session`]s.
///
/// `get_session` returns a random usable session, creating a new one if the
/// pool has spare capacity and none is usable — this matches the teacher's
/// "lazily populate, never block the caller on a missing entry" posture in
/// `Daemon::get_semaphore`, generalized from one entry per model to many
/// entries cycling by health.
pub struct SessionPool {
    sessions: DashMap<SessionId, Session>,
    config: SessionPoolConfig,
    next_proxy: AtomicU32,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            next_proxy: AtomicU32::new(0),
        }
    }

    fn next_proxy_url(&self) -> Option<String> {
        if self.config.proxy_urls.is_empty() {
            return None;
        }
        let i = self.next_proxy.fetch_add(1, Ordering::Relaxed) as usize % self.config.proxy_urls.len();
        Some(self.config.proxy_urls[i].clone())
    }

    /// Return a usable session, creating one if capacity allows.
    pub fn get_session(&self) -> Result<Session> {
        let usable: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_usable(&self.config))
            .map(|entry| *entry.key())
            .collect();

        if let Some(&id) = usable.iter().choose(&mut rand::thread_rng()) {
            return Ok(self.sessions.get(&id).expect("just selected").clone());
        }

        if self.sessions.len() >= self.config.max_pool_size {
            return Err(CrawlerError::Session(
                "session pool exhausted: no usable session and pool is at capacity".to_string(),
            ));
        }

        let session = Session::new(self.next_proxy_url());
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub fn get_session_by_id(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|e| e.clone())
    }

    /// Record a successful use of a session, incrementing its usage count.
    pub fn mark_good(&self, id: SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.usage_count += 1;
        }
    }

    /// Record a session-attributable failure. If the session crosses its
    /// error threshold it's evicted outright, freeing its slot in
    /// `max_pool_size` for a freshly created replacement on the next
    /// `get_session` call — this is what makes session rotation under a
    /// tight pool size work (spec §4.3's blocked-session rotation).
    pub fn mark_bad(&self, id: SessionId) {
        let crossed = if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.error_score += self.config.block_penalty;
            entry.usage_count += 1;
            entry.error_score >= self.config.max_error_score
        } else {
            false
        };
        if crossed {
            self.sessions.remove(&id);
        }
    }

    /// Evict a session immediately, regardless of its error score.
    pub fn retire(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Mutate a session's cookie/local-storage stand-in in place.
    pub fn with_session_mut<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.get_mut(&id).map(|mut entry| f(&mut entry))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

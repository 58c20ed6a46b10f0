//! Label-based request routing: dispatches each request to the handler
//! registered for its `label`, falling back to a default handler. See
//! spec §4.4.
//!
//! Handlers are `async fn(&mut Context) -> Result<()>` closures stored as
//! trait objects, the same "registry of boxed async callables" shape as
//! `fusillade::daemon::ShouldRetryFn` (there a predicate, here a handler),
//! generalized from one slot to a label-keyed map.

use std::collections::HashMap;

use crate::error::{CrawlerError, Result};
pub use crate::pipeline::{handler, Handler, HandlerFuture};

/// Registry of label -> handler bindings plus one default handler.
///
/// Per spec §4.4, registering a second handler for the same label, or a
/// second default, is a configuration error, surfaced eagerly rather than
/// silently overwriting the first registration.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<String, Handler>,
    default: Option<Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&mut self, label: impl Into<String>, handler: Handler) -> Result<()> {
        let label = label.into();
        if self.handlers.insert(label.clone(), handler).is_some() {
            return Err(CrawlerError::Other(anyhow::anyhow!(
                "a handler is already registered for label '{label}'"
            )));
        }
        Ok(())
    }

    pub fn set_default_handler(&mut self, handler: Handler) -> Result<()> {
        if self.default.is_some() {
            return Err(CrawlerError::Other(anyhow::anyhow!(
                "a default handler is already registered"
            )));
        }
        self.default = Some(handler);
        Ok(())
    }

    /// Resolve the handler for a request's label, falling back to the
    /// default. Returns an error if neither exists — a request with no
    /// routable handler is a configuration bug, not a retriable condition,
    /// so the dispatcher should treat it as fatal.
    pub fn resolve(&self, label: Option<&str>) -> Result<Handler> {
        if let Some(label) = label {
            if let Some(h) = self.handlers.get(label) {
                return Ok(h.clone());
            }
        }
        self.default
            .clone()
            .ok_or_else(|| CrawlerError::Other(anyhow::anyhow!("no handler for label {label:?} and no default set")))
    }
}

//! Stock [`Middleware`] implementations built on the external interfaces
//! in [`crate::interfaces`]. Each one mirrors the "one setup, one
//! matching cleanup" shape from [`crate::pipeline`]'s doc example, applied
//! to a concrete concern.

use async_trait::async_trait;

use crate::error::{CrawlerError, Result};
use crate::interfaces::SharedRobotsTxtFile;
use crate::pipeline::{no_cleanup, Cleanup, Context, Middleware};
use crate::request::SkipReason;

/// Gates a request on `robots.txt` before the handler ever runs. A
/// disallowed URL is turned into a skip (spec §4.6's third disposition),
/// not a failure.
pub struct RobotsGate {
    robots: SharedRobotsTxtFile,
    user_agent: String,
}

impl RobotsGate {
    pub fn new(robots: SharedRobotsTxtFile, user_agent: impl Into<String>) -> Self {
        Self {
            robots,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl Middleware for RobotsGate {
    async fn setup(&self, ctx: &mut Context) -> Result<Cleanup> {
        if self.robots.is_allowed(&ctx.request.url, &self.user_agent).await? {
            Ok(no_cleanup())
        } else {
            Err(CrawlerError::ContextPipelineInterrupted(
                SkipReason::RobotsDisallowed.to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{AllowAllRobots, RobotsTxtFile};
    use crate::request::RequestInput;
    use std::sync::Arc;

    struct DenyAll;

    #[async_trait]
    impl RobotsTxtFile for DenyAll {
        async fn is_allowed(&self, _url: &str, _user_agent: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn allows_when_robots_permits() {
        let gate = RobotsGate::new(Arc::new(AllowAllRobots), "test-bot");
        let mut ctx = Context::new(RequestInput::new("https://example.com/").build().unwrap());
        assert!(gate.setup(&mut ctx).await.is_ok());
    }

    #[tokio::test]
    async fn skips_when_robots_denies() {
        let gate = RobotsGate::new(Arc::new(DenyAll), "test-bot");
        let mut ctx = Context::new(RequestInput::new("https://example.com/").build().unwrap());
        let err = gate.setup(&mut ctx).await.unwrap_err();
        assert!(matches!(err, CrawlerError::ContextPipelineInterrupted(_)));
    }
}

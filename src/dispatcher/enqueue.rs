//! Enqueue-strategy filtering: decides whether a link a handler discovered
//! is allowed to be queued, relative to the page that produced it, plus
//! optional include/exclude glob and regex patterns. See spec §4.6.1.
//!
//! No single teacher file covers this (the corpus's crates don't crawl),
//! so it's grounded piecewise: `url::Url` origin/host comparisons are
//! standard library usage already pulled in for [`crate::request::unique_key`];
//! the `regex`/`glob` combination is grounded in the pattern-matching style
//! used throughout `paritytech-polkadot-sdk`'s tooling crates (see
//! `other_examples/`); the public-suffix-based registrable-domain
//! extraction via the `publicsuffix` crate is an explicit enrichment pick
//! with no pack precedent, noted as such in DESIGN.md.

use glob::Pattern;
use publicsuffix::{List, Psl};
use regex::Regex;
use url::Url;

use crate::request::EnqueueStrategy;

/// The outcome of evaluating one candidate link against the active filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    RejectedByStrategy,
    RejectedByPattern,
}

/// Combines origin-scoping (spec's `EnqueueStrategy`) with optional
/// include/exclude glob or regex patterns.
#[derive(Default)]
pub struct EnqueueFilter {
    include_globs: Vec<Pattern>,
    exclude_globs: Vec<Pattern>,
    include_regexes: Vec<Regex>,
    exclude_regexes: Vec<Regex>,
    psl: Option<List>,
}

impl EnqueueFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_include_glob(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.include_globs.push(Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn with_exclude_glob(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.exclude_globs.push(Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn with_include_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.include_regexes.push(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_exclude_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.exclude_regexes.push(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_public_suffix_list(mut self, list: List) -> Self {
        self.psl = Some(list);
        self
    }

    /// Whether `candidate_url` may be enqueued given it was discovered on
    /// `parent_url`, under `strategy`.
    pub fn allows(&self, parent_url: &str, candidate_url: &str, strategy: EnqueueStrategy) -> bool {
        self.evaluate(parent_url, candidate_url, strategy) == EnqueueOutcome::Accepted
    }

    pub fn evaluate(&self, parent_url: &str, candidate_url: &str, strategy: EnqueueStrategy) -> EnqueueOutcome {
        let (Ok(parent), Ok(candidate)) = (Url::parse(parent_url), Url::parse(candidate_url)) else {
            return EnqueueOutcome::RejectedByStrategy;
        };

        let strategy_ok = match strategy {
            EnqueueStrategy::All => true,
            EnqueueStrategy::SameOrigin => parent.origin() == candidate.origin(),
            EnqueueStrategy::SameHostname => parent.host_str() == candidate.host_str(),
            EnqueueStrategy::SameDomain => self.same_registrable_domain(&parent, &candidate),
        };

        if !strategy_ok {
            return EnqueueOutcome::RejectedByStrategy;
        }

        if !self.exclude_globs.is_empty() && self.exclude_globs.iter().any(|p| p.matches(candidate_url)) {
            return EnqueueOutcome::RejectedByPattern;
        }
        if !self.exclude_regexes.is_empty() && self.exclude_regexes.iter().any(|r| r.is_match(candidate_url)) {
            return EnqueueOutcome::RejectedByPattern;
        }
        if !self.include_globs.is_empty() && !self.include_globs.iter().any(|p| p.matches(candidate_url)) {
            return EnqueueOutcome::RejectedByPattern;
        }
        if !self.include_regexes.is_empty() && !self.include_regexes.iter().any(|r| r.is_match(candidate_url)) {
            return EnqueueOutcome::RejectedByPattern;
        }

        EnqueueOutcome::Accepted
    }

    fn same_registrable_domain(&self, parent: &Url, candidate: &Url) -> bool {
        let (Some(parent_host), Some(candidate_host)) = (parent.host_str(), candidate.host_str()) else {
            return false;
        };
        match &self.psl {
            Some(list) => {
                let parent_domain = list.domain(parent_host.as_bytes()).map(|d| d.as_bytes().to_vec());
                let candidate_domain = list.domain(candidate_host.as_bytes()).map(|d| d.as_bytes().to_vec());
                parent_domain.is_some() && parent_domain == candidate_domain
            }
            // Without a loaded public suffix list, fall back to exact
            // hostname equality rather than guessing at suffix rules.
            None => parent_host == candidate_host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_origin_rejects_cross_scheme() {
        let filter = EnqueueFilter::new();
        assert!(!filter.allows("https://a.com/", "http://a.com/", EnqueueStrategy::SameOrigin));
        assert!(filter.allows("https://a.com/", "https://a.com/other", EnqueueStrategy::SameOrigin));
    }

    #[test]
    fn same_hostname_ignores_scheme_and_port() {
        let filter = EnqueueFilter::new();
        assert!(filter.allows("https://a.com/", "http://a.com:8080/x", EnqueueStrategy::SameHostname));
        assert!(!filter.allows("https://a.com/", "https://b.com/", EnqueueStrategy::SameHostname));
    }

    #[test]
    fn same_domain_without_psl_falls_back_to_exact_host() {
        let filter = EnqueueFilter::new();
        assert!(!filter.allows("https://shop.a.com/", "https://blog.a.com/", EnqueueStrategy::SameDomain));
    }

    #[test]
    fn exclude_glob_wins_over_all_strategy() {
        let filter = EnqueueFilter::new().with_exclude_glob("*.pdf").unwrap();
        assert!(!filter.allows("https://a.com/", "https://a.com/report.pdf", EnqueueStrategy::All));
        assert!(filter.allows("https://a.com/", "https://a.com/page.html", EnqueueStrategy::All));
    }

    #[test]
    fn include_regex_restricts_to_matching_paths() {
        let filter = EnqueueFilter::new().with_include_regex(r"/product/\d+").unwrap();
        assert!(filter.allows("https://a.com/", "https://a.com/product/42", EnqueueStrategy::All));
        assert!(!filter.allows("https://a.com/", "https://a.com/about", EnqueueStrategy::All));
    }
}

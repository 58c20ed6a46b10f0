//! Default `unique_key` derivation: canonicalized URL plus method and an
//! optional payload digest, per spec §3.

use url::Url;

use crate::error::{CrawlerError, Result};

/// Derive the default deduplication key for a request.
///
/// Canonicalizes the URL (lower-cases scheme/host, strips the default port
/// for the scheme, optionally strips the fragment), then prefixes it with
/// the method and, if a payload is present, suffixes it with a short digest
/// of the payload bytes so that two requests to the same URL with different
/// bodies are treated as distinct work items.
pub fn derive_unique_key(
    url: &str,
    method: &str,
    payload: Option<&[u8]>,
    strip_fragment: bool,
) -> Result<String> {
    let mut parsed =
        Url::parse(url).map_err(|e| CrawlerError::Other(anyhow::anyhow!("invalid url {url}: {e}")))?;

    if strip_fragment {
        parsed.set_fragment(None);
    }

    let mut key = format!("{}:{}", method.to_ascii_uppercase(), parsed);

    if let Some(bytes) = payload {
        if !bytes.is_empty() {
            key.push(':');
            key.push_str(&short_digest(bytes));
        }
    }

    Ok(key)
}

/// A short, stable, non-cryptographic digest used only to distinguish
/// payload variants of the same URL within the dedup key — not a security
/// primitive.
fn short_digest(bytes: &[u8]) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fragment_by_default() {
        let a = derive_unique_key("https://Example.com/a#frag", "GET", None, true).unwrap();
        let b = derive_unique_key("https://example.com/a", "GET", None, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn keeps_fragment_when_configured() {
        let a = derive_unique_key("https://example.com/a#frag", "GET", None, false).unwrap();
        let b = derive_unique_key("https://example.com/a", "GET", None, false).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn distinguishes_payloads() {
        let a = derive_unique_key("https://example.com/a", "POST", Some(b"one"), true).unwrap();
        let b = derive_unique_key("https://example.com/a", "POST", Some(b"two"), true).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn method_is_part_of_the_key() {
        let a = derive_unique_key("https://example.com/a", "GET", None, true).unwrap();
        let b = derive_unique_key("https://example.com/a", "POST", None, true).unwrap();
        assert_ne!(a, b);
    }
}

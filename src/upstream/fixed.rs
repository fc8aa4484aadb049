use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;

use super::{Source, Upstream};
use crate::error::{ProxyError, Result};

/// An upstream source that stores a fixed set of URLs. The URLs are parsed
/// lazily on the first fetch; the parsed list, or the first parse error, is
/// memoized so concurrent first readers observe exactly one parse attempt.
pub struct FixedSet {
    url_strs: Vec<String>,
    parsed: OnceCell<std::result::Result<Arc<Vec<Upstream>>, String>>,
}

impl FixedSet {
    pub fn new(url_strs: Vec<String>) -> FixedSet {
        FixedSet {
            url_strs,
            parsed: OnceCell::new(),
        }
    }

    fn parse_urls(&self) -> std::result::Result<Arc<Vec<Upstream>>, String> {
        let mut urls = Vec::with_capacity(self.url_strs.len());
        for url_str in &self.url_strs {
            match Upstream::parse(url_str) {
                Ok(u) => urls.push(u),
                Err(e) => return Err(format!("unable to parse '{url_str}': {e}")),
            }
        }
        Ok(Arc::new(urls))
    }
}

#[async_trait]
impl Source for FixedSet {
    async fn all(&self) -> Result<Arc<Vec<Upstream>>> {
        match self.parsed.get_or_init(|| self.parse_urls()) {
            Ok(urls) => Ok(urls.clone()),
            Err(e) => Err(ProxyError::UpstreamResolution(e.clone())),
        }
    }

    fn debug_info(&self) -> Vec<(String, String)> {
        match self.parsed.get() {
            Some(Err(e)) => vec![("error".to_string(), e.clone())],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_lazily_and_memoizes() {
        let set = FixedSet::new(vec![
            "http://back-1.test.com".to_string(),
            "http://back-2.test.com".to_string(),
        ]);
        assert!(set.parsed.get().is_none());

        let urls = set.all().await.unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].to_string(), "http://back-1.test.com");

        // The published list is shared, not re-parsed.
        let again = set.all().await.unwrap();
        assert!(Arc::ptr_eq(&urls, &again));
    }

    #[tokio::test]
    async fn parse_errors_are_sticky() {
        let set = FixedSet::new(vec![
            "http://ok.test.com".to_string(),
            "not a url".to_string(),
        ]);

        let err = set.all().await.unwrap_err();
        assert!(err.to_string().contains("not a url"), "got: {err}");

        let err = set.all().await.unwrap_err();
        assert!(err.to_string().contains("not a url"));
        assert_eq!(set.debug_info().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_readers_share_one_parse() {
        let set = Arc::new(FixedSet::new(vec!["http://back-1.test.com".to_string()]));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            handles.push(tokio::spawn(async move { set.all().await.unwrap() }));
        }

        let mut lists = Vec::new();
        for handle in handles {
            lists.push(handle.await.unwrap());
        }
        for list in &lists[1..] {
            assert!(Arc::ptr_eq(&lists[0], list));
        }
    }
}

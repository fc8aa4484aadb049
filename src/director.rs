//! The request rewrite stage.
//!
//! A [`Director`] combines a path prefix, an upstream provider, and a set of
//! header operations, and turns an inbound request into the outbound request
//! that will be proxied. The inbound request is never mutated.

use std::sync::Arc;

use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

use crate::error::{ProxyError, Result};
use crate::upstream::{Provider, Upstream};

/// A fully formed outbound request. The body of the inbound request is
/// passed through separately; only metadata is copied.
#[derive(Debug)]
pub struct ProxiedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Director specifies how to direct a request to an upstream backend.
pub struct Director {
    /// Stripped from the incoming request path, iff the selected upstream
    /// specifies a path in its URL. When a rule is built from a bind
    /// pattern, this is the pattern's path.
    path_prefix: String,

    provider: Arc<dyn Provider>,

    strip_headers: Vec<HeaderName>,
    set_headers: Vec<(HeaderName, HeaderValue)>,
    add_headers: Vec<(HeaderName, HeaderValue)>,
}

impl std::fmt::Debug for Director {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Director")
            .field("path_prefix", &self.path_prefix)
            .field("strip_headers", &self.strip_headers)
            .field("set_headers", &self.set_headers)
            .field("add_headers", &self.add_headers)
            .finish_non_exhaustive()
    }
}

impl Director {
    pub fn new(provider: Arc<dyn Provider>) -> Director {
        Director {
            path_prefix: String::new(),
            provider,
            strip_headers: Vec::new(),
            set_headers: Vec::new(),
            add_headers: Vec::new(),
        }
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Director {
        self.path_prefix = prefix.into();
        self
    }

    /// Specifies a header to be removed from the proxied request.
    pub fn strip_header(&mut self, key: HeaderName) {
        self.strip_headers.push(key);
    }

    /// Specifies a header to set on the proxied request, overriding any
    /// value that already exists.
    pub fn set_header(&mut self, key: HeaderName, value: HeaderValue) {
        self.set_headers.push((key, value));
    }

    /// Specifies a header to add to the proxied request, preserving existing
    /// values.
    pub fn add_header(&mut self, key: HeaderName, value: HeaderValue) {
        self.add_headers.push((key, value));
    }

    /// The upstreams currently known to the rule's provider.
    pub async fn upstreams(&self) -> Result<Arc<Vec<Upstream>>> {
        self.provider.all().await
    }

    pub fn provider_debug_info(&self) -> Vec<(String, String)> {
        self.provider.debug_info()
    }

    /// Produces the outbound request for proxying to an upstream server.
    ///
    /// The provider picks one upstream, which supplies scheme and host. If
    /// the upstream URL has no path, the inbound path is preserved verbatim.
    /// If it has a path, e.g. `/` or `/some/prefix/`, the configured path
    /// prefix is stripped from the inbound path and the remainder is joined
    /// to the upstream path with a single slash.
    ///
    /// Example 1: pathless upstream proxies the entire request path.
    ///
    /// ```text
    /// match     = http://abc.com/def
    /// upstream  = http://upstream.com
    /// request   = http://abc.com/def/ghi
    /// proxied   = http://upstream.com/def/ghi
    /// ```
    ///
    /// Example 2: upstream with trailing slash strips the matched prefix.
    ///
    /// ```text
    /// match     = http://abc.com/def
    /// upstream  = http://upstream.com/
    /// request   = http://abc.com/def/ghi
    /// proxied   = http://upstream.com/ghi
    /// ```
    ///
    /// Example 3: upstream with a path strips the matched prefix and
    /// concatenates the remainder.
    ///
    /// ```text
    /// match     = http://abc.com/def
    /// upstream  = http://upstream.com/xyz
    /// request   = http://abc.com/def/ghi
    /// proxied   = http://upstream.com/xyz/ghi
    /// ```
    ///
    /// The Host header is not set to the upstream's host by default, as it
    /// is common for upstreams to be IPs and to want the Host from the
    /// original request. Configure a `Host` set-header for the alternate
    /// behavior.
    pub async fn direct(&self, req: &Parts) -> Result<ProxiedRequest> {
        let upstream = self.provider.get(req).await?;

        let path = if upstream.path.is_empty() {
            req.uri.path().to_string()
        } else {
            let suffix = req
                .uri
                .path()
                .strip_prefix(&self.path_prefix)
                .unwrap_or(req.uri.path());
            if suffix.is_empty() {
                upstream.path.clone()
            } else {
                single_joining_slash(&upstream.path, suffix)
            }
        };

        let path_and_query = match req.uri.query() {
            Some(q) if !q.is_empty() => format!("{path}?{q}"),
            _ => path,
        };
        let uri = Uri::builder()
            .scheme(upstream.scheme.as_str())
            .authority(upstream.authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| ProxyError::Director(format!("invalid proxied URL: {e}")))?;

        // Strip, set and add headers, in that order. HeaderName is
        // canonically lowercase, so "Cookie" and "cookie" collapse.
        let mut headers = req.headers.clone();
        for key in &self.strip_headers {
            headers.remove(key);
        }
        for (key, value) in &self.set_headers {
            headers.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.add_headers {
            headers.append(key.clone(), value.clone());
        }

        Ok(ProxiedRequest {
            method: req.method.clone(),
            uri,
            headers,
        })
    }
}

/// Joins two path segments with exactly one separating slash.
fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

//! Request matching for site rules.
//!
//! A [`Matcher`] is a predicate over host, port, path, and query string.
//! Empty constraints are wildcards; a request matches when every populated
//! constraint matches.

use std::fmt;

use http::header::HOST;
use http::request::Parts;
use url::form_urlencoded;

/// Matcher is used to match incoming requests.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    host: String,
    port: String,
    wild: bool,
    path: String,
    has_query: bool,
    query: Vec<(String, String)>,
}

impl Matcher {
    /// Constructs a matcher from a host-and-port string and a request URI.
    pub fn new(host_port: &str, request_uri: &str) -> Matcher {
        let mut m = Matcher::default();
        m.bind_host(host_port);
        m.bind_location(request_uri);
        m
    }

    /// Sets which host and port to match on. If either host or port are
    /// blank they will match any value.
    /// Example inputs include: "www.test.com", "test.com:5000", ":80".
    pub fn bind_host(&mut self, host_port: &str) {
        let (host, port) = split_host(host_port);

        // A leading "." or "*" makes the host a wildcard suffix match.
        if let Some(suffix) = host.strip_prefix('*') {
            self.host = suffix.to_string();
            self.wild = true;
        } else {
            self.wild = host.starts_with('.');
            self.host = host.to_string();
        }
        self.port = port.to_string();
    }

    /// Sets the path and query (request URI) portion that should be matched.
    /// Path will prefix match, all query params must be present with their
    /// first listed value.
    pub fn bind_location(&mut self, request_uri: &str) {
        if request_uri.is_empty() {
            self.path = String::new();
            self.has_query = false;
            self.query = Vec::new();
            return;
        }

        // Make the API a bit more intuitive, don't require binding "/?foo".
        let request_uri = if request_uri.starts_with('?') {
            format!("/{request_uri}")
        } else {
            request_uri.to_string()
        };

        match request_uri.split_once('?') {
            Some((path, query)) if !query.is_empty() => {
                self.path = path.to_string();
                self.query = first_values(query);
                self.has_query = true;
            }
            Some((path, _)) => {
                self.path = path.to_string();
                self.has_query = false;
                self.query = Vec::new();
            }
            None => {
                self.path = request_uri;
                self.has_query = false;
                self.query = Vec::new();
            }
        }
    }

    /// The bound path prefix.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns true if an inbound request satisfies all the requirements of
    /// the matcher, along with a reason string for verbose logs.
    pub fn matches(&self, req: &Parts) -> (bool, &'static str) {
        // Per RFC 2616 most request URLs will only include path+query. For
        // purpose of matching we rely on the host header.
        let (host, port) = split_host(request_host(req));

        if !self.host.is_empty() && !self.match_host(host) {
            return (false, "host mismatch");
        }
        if !self.port.is_empty() && !self.match_port(port, req.uri.scheme_str()) {
            return (false, "port mismatch");
        }
        if !self.path.is_empty() && !req.uri.path().starts_with(&self.path) {
            return (false, "path prefix mismatch");
        }
        if self.has_query && !self.match_query(req.uri.query().unwrap_or("")) {
            return (false, "query mismatch");
        }
        (true, "match")
    }

    fn match_host(&self, host: &str) -> bool {
        if self.wild {
            return host.ends_with(&self.host);
        }
        host == self.host
    }

    fn match_port(&self, port: &str, scheme: Option<&str>) -> bool {
        if self.port == port {
            true
        } else if self.port == "80" && port.is_empty() && scheme == Some("http") {
            // For fully formed request URLs, allow http to imply port 80.
            true
        } else if self.port == "443" && port.is_empty() && scheme == Some("https") {
            // For fully formed request URLs, allow https to imply port 443.
            true
        } else {
            false
        }
    }

    fn match_query(&self, raw_query: &str) -> bool {
        let req_query = first_values(raw_query);
        self.query.iter().all(|(k, v)| {
            req_query
                .iter()
                .find(|(rk, _)| rk == k)
                .is_some_and(|(_, rv)| rv == v)
        })
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wild && !self.host.starts_with('.') {
            write!(f, "*")?;
        }
        write!(f, "{}", self.host)?;
        if !self.port.is_empty() {
            write!(f, ":{}", self.port)?;
        }
        write!(f, "{}", self.path)?;
        if self.has_query {
            let mut encoded = form_urlencoded::Serializer::new(String::new());
            for (k, v) in &self.query {
                encoded.append_pair(k, v);
            }
            write!(f, "?{}", encoded.finish())?;
        }
        Ok(())
    }
}

/// The host the request was addressed to: the Host header when present,
/// otherwise the authority of the request URL.
pub fn request_host(req: &Parts) -> &str {
    req.headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri.authority().map(|a| a.as_str()))
        .unwrap_or("")
}

/// Decodes a query string into (key, first value) pairs, keeping the first
/// occurrence of each key in insertion order.
fn first_values(raw_query: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for (k, v) in form_urlencoded::parse(raw_query.as_bytes()) {
        if !pairs.iter().any(|(pk, _)| pk.as_str() == &*k) {
            pairs.push((k.into_owned(), v.into_owned()));
        }
    }
    pairs
}

fn split_host(host_port: &str) -> (&str, &str) {
    match host_port.split_once(':') {
        Some((host, port)) => (host, port),
        None => (host_port, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;

    fn must_req(url: &str) -> Parts {
        let (parts, _) = Request::builder()
            .uri(url)
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn url_matching() {
        let url_tests: &[(&str, &str, &str, bool)] = &[
            // Host only binding.
            ("test.com", "", "http://test.com", true),
            ("test.com", "", "https://test.com", true),
            ("test.com", "", "ftp://test.com", true),
            ("test.com", "", "http://test.com:5000", true),
            ("test.com", "", "http://test.com/foobar", true),
            ("test.com", "", "http://test.com/foobar/bazbar", true),
            ("test.com", "", "https://test.com/foobar", true),
            ("test.com", "", "https://www.test.com", false),
            // Wildcard host binding.
            (".test.com", "", "http://test.com", false),
            (".test.com", "", "http://notmytest.com", false),
            (".test.com", "", "http://www.test.com", true),
            (".test.com", "", "http://about.test.com", true),
            (".test.com", "", "http://one.two.three.test.com", true),
            ("*.test.com", "", "http://www.test.com", true),
            ("*.test.com", "", "http://test.com", false),
            // Full host and port binding.
            ("test.com:5000", "", "http://test.com/foo", false),
            ("test.com:5000", "", "http://test.com:5000/foo", true),
            // Host and path binding.
            ("test.com", "/foo", "http://test.com/foo", true),
            ("test.com", "/foo", "http://test.com/foo/", true),
            ("test.com", "/foo", "http://test.com/foo/bar", true),
            ("test.com", "/foo", "http://test.com/baz", false),
            // Path only binding.
            ("", "/foo", "http://test.com/foo", true),
            ("", "/foo", "http://google.com/foo/bar", true),
            ("", "/foo", "http://google.com/baz/foo/bar", false),
            // Port only binding.
            (":5000", "", "http://test.com:5000/foo", true),
            (":5000", "", "https://google.com:5000/foo/bar", true),
            (":5000", "", "http://google.com/baz/foo/bar", false),
            // Port 80 is implied for HTTP.
            ("test.com", "", "http://test.com:80/foo", true),
            ("test.com:80", "", "http://test.com/foo", true),
            ("test.com:80", "", "http://test.com:80/foo", true),
            ("test.com:80", "", "http://test.com:5000/foo", false),
            // Port 443 is implied for HTTPS.
            ("test.com:443", "", "https://test.com/foo", true),
            ("test.com:443", "", "https://test.com:443/foo", true),
            ("test.com:443", "", "http://test.com:443/foo", true),
            ("test.com:443", "", "http://test.com/foo", false),
            ("test.com:443", "", "https://test.com:5000/foo", false),
            // Query param binding.
            ("", "?staging=true", "http://test.com/?staging=true", true),
            ("", "?staging=true", "http://test.com/?staging=true&debug=true", true),
            ("", "?staging=true", "http://test.com/?staging=false", false),
            ("", "?staging=true", "http://test.com/?staging=false&staging=true", false),
            ("", "?staging=true", "http://test.com/?staging=1", false),
            ("", "?staging=true", "http://test.com/", false),
            ("", "?lang=en&country=us", "http://test.com/?lang=en&country=us", true),
            ("", "?lang=en&country=us", "http://test.com/?country=us&lang=en", true),
            ("", "?lang=en&country=us", "http://test.com/?lang=en", false),
            ("", "?lang=en&country=us", "http://test.com/?country=us", false),
        ];

        for (match_host, match_path, requrl, expected) in url_tests {
            let req = must_req(requrl);
            let m = Matcher::new(match_host, match_path);
            let (actual, reason) = m.matches(&req);
            assert_eq!(
                actual, *expected,
                "matching '{requrl}' against '{m}' => {actual}, want {expected} ({reason})"
            );
        }
    }

    // Per RFC 2616, Section 5.1.2, most request URLs will only be
    // path+query. This ensures the Host header is used when the URL carries
    // no authority.
    #[test]
    fn hostless_requests_use_host_header() {
        let (mut parts, _) = Request::builder()
            .uri("/foo/bar/baz")
            .header(HOST, "www.test.com")
            .body(Body::empty())
            .unwrap()
            .into_parts();

        let m1 = Matcher::new("www.test.com", "/foo");
        let (ok, reason) = m1.matches(&parts);
        assert!(ok, "expected match, but got reason '{reason}'");

        let m2 = Matcher::new("other.test.com", "/foo/bar/baz");
        let (ok, _) = m2.matches(&parts);
        assert!(!ok, "didn't expect a match");

        parts.headers.remove(HOST);
        let (ok, reason) = m1.matches(&parts);
        assert!(!ok, "expected host mismatch without a Host header, got '{reason}'");
    }

    #[test]
    fn display_round_trips_bound_pattern() {
        let m = Matcher::new("test.com:5000", "/foo?staging=true");
        assert_eq!(m.to_string(), "test.com:5000/foo?staging=true");

        let m = Matcher::new(".test.com", "");
        assert_eq!(m.to_string(), ".test.com");
    }
}

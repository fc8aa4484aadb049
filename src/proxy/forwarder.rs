//! The outbound leg of the proxy.
//!
//! Takes a directed request, performs the round trip, and streams the
//! response body back without buffering it. Hop-by-hop headers are removed
//! in both directions and the client address is recorded in
//! X-Forwarded-For.

use std::net::IpAddr;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Version};
use tracing::debug;

use crate::director::ProxiedRequest;
use crate::error::{ProxyError, Result};

/// Hop-by-hop headers, removed when sent to the backend and again on the
/// way back to the client. The RFC 2616 section 13.5.1 set, plus
/// Proxy-Connection which is non-standard but still sent by some clients.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Performs proxy round trips over a shared connection pool.
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> anyhow::Result<Forwarder> {
        // No request timeout: a slow upstream must not be cut off by the
        // proxy. Redirects are relayed to the client, never followed.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build()?;
        Ok(Forwarder { client })
    }

    /// Makes the outbound request and assembles the response for the
    /// client, streaming the body through. Transport failures surface as a
    /// bad-gateway error; the caller renders the user-facing status.
    ///
    /// Cancellation is driven by the connection: when the client goes away
    /// the response body stream is dropped, which aborts the outbound
    /// request.
    pub async fn forward(
        &self,
        proxyreq: ProxiedRequest,
        client_ip: Option<IpAddr>,
        body: Body,
    ) -> Result<Response> {
        let ProxiedRequest { method, uri, mut headers } = proxyreq;

        // Decide whether the inbound request carries a body before the
        // framing headers are stripped.
        let has_body = request_has_body(&headers);

        // Remove hop-by-hop headers to the backend. Especially important is
        // Connection, because we want a persistent connection regardless of
        // what the client sent to us.
        strip_hop_headers(&mut headers);

        // If we aren't the first proxy, retain prior X-Forwarded-For
        // information as a comma+space separated list, folding multiple
        // headers into one.
        if let Some(ip) = client_ip {
            append_forwarded_for(&mut headers, ip);
        }

        let url = reqwest::Url::parse(&uri.to_string())
            .map_err(|e| ProxyError::Gateway(format!("proxy error: {e}")))?;

        debug!("forwarding {} {}", method, url);

        let outbound_body = if has_body {
            reqwest::Body::wrap_stream(body.into_data_stream())
        } else {
            reqwest::Body::from(Vec::new())
        };

        let upstream_response = self
            .client
            .request(method, url)
            .version(Version::HTTP_11)
            .headers(headers)
            .body(outbound_body)
            .send()
            .await
            .map_err(|e| ProxyError::Gateway(format!("proxy error: {e}")))?;

        let status = upstream_response.status();
        let mut response_headers = upstream_response.headers().clone();
        strip_hop_headers(&mut response_headers);

        let mut response = Response::builder().status(status);
        if let Some(h) = response.headers_mut() {
            *h = response_headers;
        }
        response
            .body(Body::from_stream(upstream_response.bytes_stream()))
            .map_err(|e| ProxyError::Gateway(format!("proxy error: {e}")))
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn request_has_body(headers: &HeaderMap) -> bool {
    if let Some(len) = headers.get(CONTENT_LENGTH) {
        return len
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .is_none_or(|n| n > 0);
    }
    headers.contains_key(TRANSFER_ENCODING)
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let chain = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_folds_prior_values() {
        let mut headers = HeaderMap::new();
        headers.append("X-Forwarded-For", HeaderValue::from_static("1.2.3.4"));
        headers.append("X-Forwarded-For", HeaderValue::from_static("5.6.7.8"));

        append_forwarded_for(&mut headers, "10.0.0.9".parse().unwrap());

        let values: Vec<_> = headers.get_all("x-forwarded-for").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "1.2.3.4, 5.6.7.8, 10.0.0.9");
    }

    #[test]
    fn forwarded_for_starts_the_chain() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.9".parse().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.9");
    }

    #[test]
    fn hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        headers.insert("Proxy-Connection", HeaderValue::from_static("keep-alive"));
        headers.insert("Keep-Alive", HeaderValue::from_static("timeout=5"));
        headers.insert("Transfer-Encoding", HeaderValue::from_static("chunked"));
        headers.insert("Upgrade", HeaderValue::from_static("websocket"));
        headers.insert("Content-Type", HeaderValue::from_static("text/plain"));

        strip_hop_headers(&mut headers);

        for name in HOP_HEADERS {
            assert!(headers.get(name).is_none(), "{name} should be stripped");
        }
        assert!(headers.get("content-type").is_some());
    }

    #[test]
    fn body_detection_uses_framing_headers() {
        let mut headers = HeaderMap::new();
        assert!(!request_has_body(&headers));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!request_has_body(&headers));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert!(request_has_body(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(request_has_body(&headers));
    }
}

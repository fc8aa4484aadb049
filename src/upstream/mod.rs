//! Upstream sources and selection policies.
//!
//! A [`Source`] surfaces the current set of candidate backend URLs. A
//! [`Provider`] wraps a source with a per-request selection policy. Both are
//! safe for concurrent callers.

pub mod dns;
pub mod fixed;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ConnectInfo;
use http::request::Parts;
use rand::Rng;

use crate::error::{ProxyError, Result};

pub use dns::Dns;
pub use fixed::FixedSet;

/// A backend destination: scheme, host and port, and an optional path
/// prefix that will be joined onto the rewritten request path. An empty
/// path means the inbound path is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub scheme: String,
    pub authority: String,
    pub path: String,
}

impl Upstream {
    /// Parses `scheme://host[:port][/path]`.
    pub fn parse(s: &str) -> std::result::Result<Upstream, String> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| "missing scheme".to_string())?;
        if scheme.is_empty() {
            return Err("missing scheme".to_string());
        }
        let (authority, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err("missing host".to_string());
        }
        Ok(Upstream {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

/// Source defines an interface for fetching sets of upstream servers.
#[async_trait]
pub trait Source: Send + Sync {
    /// Returns all the known upstream URLs.
    async fn all(&self) -> Result<Arc<Vec<Upstream>>>;

    /// Returns information about the upstream, for presentation on debug
    /// screens.
    fn debug_info(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Provider picks a single upstream to forward a request to. Providers must
/// also satisfy the [`Source`] interface.
#[async_trait]
pub trait Provider: Source {
    /// Returns a single URL that can be used to make a request to.
    async fn get(&self, req: &Parts) -> Result<Upstream>;
}

enum Policy {
    First,
    Random,
    RoundRobin(AtomicUsize),
    IpHash,
}

/// A [`Source`] combined with a selection policy, satisfying [`Provider`].
pub struct Balanced<S> {
    source: S,
    policy: Policy,
}

/// Returns a provider that always uses the first upstream in a source.
pub fn first<S: Source>(source: S) -> Balanced<S> {
    Balanced { source, policy: Policy::First }
}

/// Returns a provider that picks a random upstream from a source.
pub fn random<S: Source>(source: S) -> Balanced<S> {
    Balanced { source, policy: Policy::Random }
}

/// Returns a provider that cycles through the upstreams in a source. The
/// counter is shared across concurrent callers and advances by exactly one
/// per call.
pub fn round_robin<S: Source>(source: S) -> Balanced<S> {
    Balanced {
        source,
        policy: Policy::RoundRobin(AtomicUsize::new(0)),
    }
}

/// Returns a provider that sends traffic to a consistent backend based on a
/// hash of the requesting IP (via X-Forwarded-For or the connection remote
/// address).
pub fn ip_hash<S: Source>(source: S) -> Balanced<S> {
    Balanced { source, policy: Policy::IpHash }
}

/// Returns a provider that only has one upstream.
pub fn single(url: &str) -> Balanced<FixedSet> {
    first(FixedSet::new(vec![url.to_string()]))
}

#[async_trait]
impl<S: Source> Source for Balanced<S> {
    async fn all(&self) -> Result<Arc<Vec<Upstream>>> {
        self.source.all().await
    }

    fn debug_info(&self) -> Vec<(String, String)> {
        self.source.debug_info()
    }
}

#[async_trait]
impl<S: Source> Provider for Balanced<S> {
    async fn get(&self, req: &Parts) -> Result<Upstream> {
        let urls = self.source.all().await?;
        if urls.is_empty() {
            return Err(ProxyError::UpstreamResolution(
                "no upstreams available".to_string(),
            ));
        }
        let idx = match &self.policy {
            Policy::First => 0,
            Policy::Random => rand::thread_rng().gen_range(0..urls.len()),
            Policy::RoundRobin(counter) => counter.fetch_add(1, Ordering::Relaxed) % urls.len(),
            Policy::IpHash => fnv32(client_ip(req).as_bytes()) as usize % urls.len(),
        };
        Ok(urls[idx].clone())
    }
}

/// The address a request originated from: the X-Forwarded-For header when
/// present, otherwise the IP of the connection peer.
pub fn client_ip(req: &Parts) -> String {
    if let Some(ff) = req
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if !ff.is_empty() {
            return ff.to_string();
        }
    }
    req.extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_default()
}

// 32-bit FNV-1.
fn fnv32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= u32::from(b);
    }
    hash
}

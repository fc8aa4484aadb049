use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Source, Upstream};
use crate::error::{ProxyError, Result};

/// The default TTL for resolved entries is 1 minute.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// A host name that is hardcoded not to hit the actual resolver, instead
/// returning a fixed set of local IPs. Used for deterministic tests and for
/// exercising configurations offline.
pub const FAKE_HOST: &str = "dns.test.fake";

/// Resolves a host name to its addresses. The system implementation defers
/// to the runtime's resolver; tests substitute their own.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// [`Resolve`] implementation backed by the operating system resolver.
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// An upstream source that looks up hosts from DNS.
///
/// If allow-stale is set, an old list of upstreams will be used following a
/// failed refresh. Otherwise the error is propagated to callers.
///
/// Once the TTL has expired, the next fetch blocks on refreshing the
/// upstreams; concurrent callers wait on the same refresh and observe its
/// result without triggering additional lookups.
pub struct Dns {
    host: String,
    port: u16,
    path: String,
    allow_stale: bool,
    ttl: Duration,
    resolver: Arc<dyn Resolve>,
    state: Mutex<CacheState>,
}

struct CacheState {
    addrs: Arc<Vec<Upstream>>,
    expires_at: Option<Instant>,
    err: Option<String>,
}

impl Dns {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Dns {
        Dns {
            host: host.into(),
            port,
            path: path.into(),
            allow_stale: false,
            ttl: DEFAULT_TTL,
            resolver: Arc::new(SystemResolver),
            state: Mutex::new(CacheState {
                addrs: Arc::new(Vec::new()),
                expires_at: None,
                err: None,
            }),
        }
    }

    pub fn allow_stale(mut self, allow_stale: bool) -> Dns {
        self.allow_stale = allow_stale;
        self
    }

    /// Overrides the refresh TTL. A zero duration keeps the default.
    pub fn ttl(mut self, ttl: Duration) -> Dns {
        if !ttl.is_zero() {
            self.ttl = ttl;
        }
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Dns {
        self.resolver = resolver;
        self
    }

    async fn maybe_refresh(&self, state: &mut CacheState) {
        let now = Instant::now();
        if !state.addrs.is_empty() && state.expires_at.is_some_and(|at| now < at) {
            return;
        }

        let addrs: Vec<String> = if self.host == FAKE_HOST {
            ["192.168.0.0", "192.168.0.1", "192.168.0.2", "192.168.0.3"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            match self.resolver.lookup(&self.host).await {
                Ok(ips) => ips.iter().map(ToString::to_string).collect(),
                Err(e) => {
                    if self.allow_stale && !state.addrs.is_empty() {
                        warn!("error looking up {}, using stale upstreams", self.host);
                    } else {
                        state.addrs = Arc::new(Vec::new());
                        state.err = Some(e.to_string());
                    }
                    return;
                }
            }
        };

        info!("dns refreshed for {}, {} upstream(s) found", self.host, addrs.len());

        let scheme = if self.port == 443 { "https" } else { "http" };
        state.addrs = Arc::new(
            addrs
                .iter()
                .map(|addr| Upstream {
                    scheme: scheme.to_string(),
                    authority: format!("{}:{}", addr, self.port),
                    path: self.path.clone(),
                })
                .collect(),
        );
        state.err = None;
        state.expires_at = Some(now + self.ttl);
    }
}

#[async_trait]
impl Source for Dns {
    async fn all(&self) -> Result<Arc<Vec<Upstream>>> {
        let mut state = self.state.lock().await;
        self.maybe_refresh(&mut state).await;
        if let Some(err) = &state.err {
            return Err(ProxyError::UpstreamResolution(err.clone()));
        }
        Ok(state.addrs.clone())
    }

    fn debug_info(&self) -> Vec<(String, String)> {
        let mut m = vec![
            ("allow stale".to_string(), self.allow_stale.to_string()),
            ("TTL".to_string(), format!("{:?}", self.ttl)),
        ];
        if let Ok(state) = self.state.try_lock() {
            if let Some(err) = &state.err {
                m.push(("error".to_string(), err.clone()));
            }
            if let Some(at) = state.expires_at {
                let remaining = at.saturating_duration_since(Instant::now());
                m.push(("expires in".to_string(), format!("{remaining:?}")));
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lookups and serves a scripted sequence of results, repeating
    /// the last one forever.
    struct ScriptedResolver {
        lookups: AtomicUsize,
        script: Vec<std::result::Result<Vec<IpAddr>, String>>,
    }

    impl ScriptedResolver {
        fn new(script: Vec<std::result::Result<Vec<IpAddr>, String>>) -> Arc<Self> {
            Arc::new(ScriptedResolver {
                lookups: AtomicUsize::new(0),
                script,
            })
        }

        fn count(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolve for ScriptedResolver {
        async fn lookup(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            let step = self.script.get(n).unwrap_or_else(|| self.script.last().unwrap());
            match step {
                Ok(ips) => Ok(ips.clone()),
                Err(e) => Err(io::Error::other(e.clone())),
            }
        }
    }

    fn ips(specs: &[&str]) -> std::result::Result<Vec<IpAddr>, String> {
        Ok(specs.iter().map(|s| s.parse().unwrap()).collect())
    }

    #[tokio::test]
    async fn builds_urls_from_resolved_addresses() {
        let resolver = ScriptedResolver::new(vec![ips(&["10.1.0.1", "10.1.0.2"])]);
        let dns = Dns::new("pool.test.com", 4000, "/prefix/").resolver(resolver);

        let urls = dns.all().await.unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].to_string(), "http://10.1.0.1:4000/prefix/");
        assert_eq!(urls[1].to_string(), "http://10.1.0.2:4000/prefix/");
    }

    #[tokio::test]
    async fn port_443_implies_https() {
        let resolver = ScriptedResolver::new(vec![ips(&["10.1.0.1"])]);
        let dns = Dns::new("pool.test.com", 443, "").resolver(resolver);

        let urls = dns.all().await.unwrap();
        assert_eq!(urls[0].to_string(), "https://10.1.0.1:443");
    }

    #[tokio::test]
    async fn fake_host_short_circuits_the_resolver() {
        let resolver = ScriptedResolver::new(vec![Err("should not be called".to_string())]);
        let dns = Dns::new(FAKE_HOST, 8080, "").resolver(resolver.clone());

        let urls = dns.all().await.unwrap();
        assert_eq!(urls.len(), 4);
        assert_eq!(urls[0].authority, "192.168.0.0:8080");
        assert_eq!(resolver.count(), 0);
    }

    #[tokio::test]
    async fn fresh_cache_skips_lookup() {
        let resolver = ScriptedResolver::new(vec![ips(&["10.1.0.1"])]);
        let dns = Dns::new("pool.test.com", 80, "").resolver(resolver.clone());

        for _ in 0..5 {
            dns.all().await.unwrap();
        }
        assert_eq!(resolver.count(), 1);
    }

    #[tokio::test]
    async fn expired_cache_refreshes_exactly_once_under_contention() {
        let resolver = ScriptedResolver::new(vec![
            ips(&["10.1.0.1"]),
            ips(&["10.2.0.1", "10.2.0.2"]),
        ]);
        let dns = Arc::new(
            Dns::new("pool.test.com", 80, "")
                .ttl(Duration::from_millis(10))
                .resolver(resolver.clone()),
        );

        dns.all().await.unwrap();
        assert_eq!(resolver.count(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dns = dns.clone();
            handles.push(tokio::spawn(async move { dns.all().await.unwrap() }));
        }
        for handle in handles {
            let urls = handle.await.unwrap();
            assert_eq!(urls.len(), 2, "caller saw the pre-refresh snapshot");
        }
        assert_eq!(resolver.count(), 2);
    }

    #[tokio::test]
    async fn failed_lookup_clears_the_cache() {
        let resolver = ScriptedResolver::new(vec![
            ips(&["10.1.0.1"]),
            Err("no such host".to_string()),
        ]);
        let dns = Dns::new("pool.test.com", 80, "")
            .ttl(Duration::from_millis(1))
            .resolver(resolver);

        assert_eq!(dns.all().await.unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = dns.all().await.unwrap_err();
        assert!(err.to_string().contains("no such host"));
        // The error sticks until a lookup succeeds again.
        let err = dns.all().await.unwrap_err();
        assert!(err.to_string().contains("no such host"));
    }

    #[tokio::test]
    async fn allow_stale_preserves_the_previous_list() {
        let resolver = ScriptedResolver::new(vec![
            ips(&["10.1.0.1"]),
            Err("no such host".to_string()),
        ]);
        let dns = Dns::new("pool.test.com", 80, "")
            .allow_stale(true)
            .ttl(Duration::from_millis(1))
            .resolver(resolver.clone());

        let fresh = dns.all().await.unwrap();
        assert_eq!(fresh.len(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stale = dns.all().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(Arc::ptr_eq(&fresh, &stale));
        assert!(resolver.count() >= 2);
    }
}

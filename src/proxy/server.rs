use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use http::header::{HOST, LOCATION, USER_AGENT};
use http::request::Parts;
use http::{HeaderValue, StatusCode, Uri};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use url::form_urlencoded;

use super::{debug, forwarder::Forwarder, SiteRule};
use crate::config::Config;
use crate::matcher::request_host;

/// Query parameter that, when specified, overrides the host of the
/// requested URL. Intended for testing staged sites.
/// e.g. http://localhost:5555/?locus_host=sample.locus.xyz
pub const HOST_OVERRIDE_PARAM: &str = "locus_host";

/// The top-level dispatcher: owns the ordered site rules and routes each
/// inbound request through matcher, director, and forwarder.
pub struct Server {
    rules: Vec<SiteRule>,
    forwarder: Forwarder,
    stats: ServerStats,
    metrics_handle: Option<PrometheusHandle>,
    verbose_logging: bool,
    port: u16,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Server {
    /// Returns a server with the following defaults set:
    /// port 5555, read timeout 30s, write timeout 30s.
    pub fn new(rules: Vec<SiteRule>) -> anyhow::Result<Server> {
        Ok(Server {
            rules,
            forwarder: Forwarder::new()?,
            stats: ServerStats::default(),
            metrics_handle: None,
            verbose_logging: false,
            port: 5555,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        })
    }

    /// Builds a server from a loaded configuration. Upstream providers are
    /// validated eagerly, so a bad upstream fails startup instead of the
    /// first request.
    pub async fn from_config(config: &Config) -> anyhow::Result<Server> {
        let rules = config.build_rules().await?;
        let mut server = Server::new(rules)?;
        server.port = config.globals.port;
        server.read_timeout = config.globals.read_timeout;
        server.write_timeout = config.globals.write_timeout;
        server.verbose_logging = config.globals.verbose_logging;
        Ok(server)
    }

    /// Serves the metrics exporter's rendering on /debug/vars.
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Server {
        self.metrics_handle = Some(handle);
        self
    }

    /// Listens on the configured port for incoming connections.
    pub async fn run(self) -> anyhow::Result<()> {
        use anyhow::Context;

        let port = self.port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind port {port}"))?;

        info!(
            "starting locus on port {} ({} site rules, read timeout {:?}, write timeout {:?})",
            port,
            self.rules.len(),
            self.read_timeout,
            self.write_timeout,
        );

        let app = Router::new()
            .fallback(dispatch)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(self.write_timeout)),
            )
            .with_state(Arc::new(self));

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("server error")?;
        Ok(())
    }

    /// Routes one request. Site rules are checked in the order they were
    /// added; the first matching rule wins.
    pub async fn handle(&self, mut req: Request, client_addr: SocketAddr) -> Response {
        apply_host_override(&mut req);

        let _guard = self.stats.track();
        let (parts, body) = req.into_parts();

        match self.rules.iter().find(|r| r.matcher.matches(&parts).0) {
            Some(rule) => self.serve_rule(rule, &parts, body, client_addr).await,
            None => {
                let response = self.serve_default(&parts).await;
                self.log_access(None, response.status(), &parts, None, client_addr);
                response
            }
        }
    }

    async fn serve_rule(
        &self,
        rule: &SiteRule,
        parts: &Parts,
        body: Body,
        client_addr: SocketAddr,
    ) -> Response {
        let proxied = match rule.director.direct(parts).await {
            Ok(proxied) => proxied,
            Err(err) => {
                error!("error transforming request for {}: {}", rule.name, err);
                let response = self.render_status(err.status_code());
                self.log_access(Some(&rule.name), response.status(), parts, None, client_addr);
                return response;
            }
        };

        let proxied_url = proxied.uri.clone();
        let response = if let Some(redirect) = rule.redirect {
            self.redirect_response(redirect, &proxied_url)
        } else {
            match self
                .forwarder
                .forward(proxied, Some(client_addr.ip()), body)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    error!("error proxying request: {}", err);
                    self.render_status(StatusCode::BAD_GATEWAY)
                }
            }
        };

        self.log_access(
            Some(&rule.name),
            response.status(),
            parts,
            Some(&proxied_url),
            client_addr,
        );
        response
    }

    async fn serve_default(&self, parts: &Parts) -> Response {
        match parts.uri.path() {
            "/debug/configs" => {
                Html(debug::render_configs_page(&self.rules, &self.stats).await).into_response()
            }
            "/debug/vars" => match &self.metrics_handle {
                Some(handle) => handle.render().into_response(),
                None => self.render_status(StatusCode::NOT_FOUND),
            },
            // For legacy healthchecking, render 200 on the root path.
            "/" => self.render_status(StatusCode::OK),
            _ => self.render_status(StatusCode::NOT_FOUND),
        }
    }

    fn redirect_response(&self, status: StatusCode, location: &Uri) -> Response {
        match HeaderValue::from_str(&location.to_string()) {
            Ok(value) => {
                let mut response = self.render_status(status);
                response.headers_mut().insert(LOCATION, value);
                response
            }
            Err(e) => {
                error!("invalid redirect location {}: {}", location, e);
                self.render_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn render_status(&self, status: StatusCode) -> Response {
        if status.is_server_error() {
            self.stats.record_error();
        }
        let body = format!("{} {}\n", status.as_u16(), status.canonical_reason().unwrap_or(""));
        (status, body).into_response()
    }

    fn log_access(
        &self,
        rule: Option<&str>,
        status: StatusCode,
        parts: &Parts,
        proxied: Option<&Uri>,
        client_addr: SocketAddr,
    ) {
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let client = remote_addr(parts, client_addr);
        let dump = if self.verbose_logging {
            dump_request(parts)
        } else {
            String::new()
        };

        match proxied {
            Some(proxied) => info!(
                target: "locus::access",
                "locus[{}] {} {} {} {} => {} - {} {:?} {}",
                rule.unwrap_or("-"),
                status.as_u16(),
                parts.method,
                request_host(parts),
                parts.uri,
                proxied,
                client,
                user_agent,
                dump,
            ),
            None => info!(
                target: "locus::access",
                "locus[-] {} {} {} {} - {} {:?} {}",
                status.as_u16(),
                parts.method,
                request_host(parts),
                parts.uri,
                client,
                user_agent,
                dump,
            ),
        }
    }

    pub fn rules(&self) -> &[SiteRule] {
        &self.rules
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

async fn dispatch(
    State(server): State<Arc<Server>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    server.handle(req, client_addr).await
}

/// Aggregate counters surfaced on the debug page. The exporter-facing
/// metrics are recorded alongside through the metrics facade.
#[derive(Debug, Default)]
pub struct ServerStats {
    requests: AtomicU64,
    errors: AtomicU64,
    open_connections: AtomicI64,
}

impl ServerStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> i64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    fn track(&self) -> InFlightGuard<'_> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        counter!("locus_requests_total").increment(1);
        gauge!("locus_connections").increment(1.0);
        InFlightGuard {
            stats: self,
            started: Instant::now(),
        }
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("locus_errors_total").increment(1);
    }
}

/// Keeps the in-flight gauge honest on every exit path and records latency
/// when the request completes.
struct InFlightGuard<'a> {
    stats: &'a ServerStats,
    started: Instant,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.open_connections.fetch_sub(1, Ordering::Relaxed);
        gauge!("locus_connections").decrement(1.0);
        histogram!("locus_request_duration_seconds").record(self.started.elapsed().as_secs_f64());
    }
}

/// Registers metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!("locus_requests_total", "Total number of requests handled");
    describe_counter!("locus_errors_total", "Total number of 5xx responses rendered");
    describe_gauge!("locus_connections", "Number of requests currently in flight");
    describe_histogram!(
        "locus_request_duration_seconds",
        "Time spent handling a request, in seconds"
    );
}

/// Applies the host-override query parameter: the request's host is
/// replaced with the parameter's value and the parameter is removed from
/// the query so the proxied request can not loop back.
fn apply_host_override(req: &mut Request) {
    let Some(query) = req.uri().query() else { return };

    let mut override_host: Option<String> = None;
    let mut remaining = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == HOST_OVERRIDE_PARAM {
            if override_host.is_none() {
                override_host = Some(value.into_owned());
            }
        } else {
            remaining.append_pair(&key, &value);
        }
    }
    let Some(host) = override_host else { return };

    if let Ok(value) = HeaderValue::from_str(&host) {
        req.headers_mut().insert(HOST, value);
    }

    let remaining = remaining.finish();
    let path_and_query = if remaining.is_empty() {
        req.uri().path().to_string()
    } else {
        format!("{}?{}", req.uri().path(), remaining)
    };
    let mut parts = req.uri().clone().into_parts();
    match http::uri::PathAndQuery::try_from(path_and_query.as_str()) {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(_) => return,
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}

fn remote_addr(parts: &Parts, client_addr: SocketAddr) -> String {
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| client_addr.to_string())
}

fn dump_request(parts: &Parts) -> String {
    let mut out = format!("{} {} {:?}", parts.method, parts.uri, parts.version);
    for (name, value) in &parts.headers {
        out.push_str("; ");
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<binary>"));
    }
    out
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use http::{HeaderName, HeaderValue, StatusCode};
use serde::Deserialize;

use crate::director::Director;
use crate::matcher::Matcher;
use crate::proxy::SiteRule;
use crate::upstream::{self, Dns, FixedSet, Provider, Source};

/// Demonstrates using YAML to define site configs which can be loaded from
/// a file. It is also used in tests as a canonical example that exercises
/// all options.
pub const SAMPLE_YAML_CONFIG: &str = r#"
# The 'globals' section contains settings that affect the core operation of
# the proxy.
globals:
  port: 5556
  read_timeout: 10s
  write_timeout: 20s
# The 'defaults' section contains settings to be applied to all sites.
defaults:
  add_header:
    X-Proxied-For: Locus
# The 'sites' section allows multiple configurations.
sites:
  # 'about_us' is a single upstream site that drops some request headers.
  - name: about_us
    bind: //us.mysite.com/about
    upstream: http://about-1.mysite.com
    strip_header:
      - Cookie
      - User-Agent
    set_header:
      Accept-Language: en-US
  # 'search' is a site with multiple fixed upstreams.
  - name: search
    bind: //www.mysite.com/search
    upstream_set:
      - http://search-1.mysite.com
      - http://search-2.mysite.com
      - http://search-3.mysite.com
    strategy: round_robin
  # 'fallthrough' uses DNS to fetch upstream hosts and handles all other
  # requests to mysite.com. A bare host name demarks a DNS upstream.
  - name: fallthrough
    bind_host: mysite.com
    upstream: dns.test.fake
    upstream_port: 4000
    upstream_path: /2016/mysite/
    ttl: 5m
    allow_stale: true
    strategy: round_robin
  # 'redirect' sends any non-matched subdomain to the fallthrough route.
  - name: redirect
    bind_host: .mysite.com
    upstream: http://mysite.com
    redirect: 301
"#;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub globals: GlobalSettings,
    #[serde(default)]
    pub defaults: SiteConfig,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub read_timeout: Duration,
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub write_timeout: Duration,
    #[serde(default)]
    pub verbose_logging: bool,
}

impl Default for GlobalSettings {
    fn default() -> GlobalSettings {
        GlobalSettings {
            port: default_port(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
            verbose_logging: false,
        }
    }
}

fn default_port() -> u16 {
    5555
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// One entry in the 'sites' list (or the 'defaults' section).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bind: String,
    #[serde(default)]
    pub bind_host: String,
    #[serde(default)]
    pub bind_location: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub upstream_set: Vec<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// For DNS upstreams only.
    #[serde(default)]
    pub upstream_port: u16,
    /// For DNS upstreams only.
    #[serde(default)]
    pub upstream_path: String,
    /// For DNS upstreams only.
    #[serde(default, with = "opt_duration_serde")]
    pub ttl: Option<Duration>,
    /// For DNS upstreams only.
    #[serde(default)]
    pub allow_stale: bool,
    #[serde(default)]
    pub add_header: BTreeMap<String, String>,
    #[serde(default)]
    pub set_header: BTreeMap<String, String>,
    #[serde(default)]
    pub strip_header: Vec<String>,
    #[serde(default)]
    pub redirect: u16,
}

/// How a provider picks an upstream for each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    First,
    Random,
    RoundRobin,
    IpHash,
}

impl Config {
    /// Loads configuration from a YAML file.
    pub async fn load(path: &str) -> Result<Config> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {path}"))?;
        Config::parse(&content).with_context(|| format!("failed to load config file: {path}"))
    }

    /// Parses configuration from YAML text.
    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(content).context("error loading YAML")?;
        Ok(config)
    }

    /// Builds the ordered routing table. Each site is merged with the
    /// defaults section first. Upstreams are fetched once so invalid
    /// entries fail here rather than on the first request.
    pub async fn build_rules(&self) -> Result<Vec<SiteRule>> {
        let mut rules = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            let merged = merge_site(&self.defaults, site);
            let rule = build_rule(&merged)
                .await
                .with_context(|| format!("error loading config for '{}'", site.name))?;
            rules.push(rule);
        }
        Ok(rules)
    }
}

/// Overlays a site on the defaults section. Scalars are taken from the site
/// when set; header operations accumulate, with the site winning per key.
fn merge_site(defaults: &SiteConfig, site: &SiteConfig) -> SiteConfig {
    let mut merged = site.clone();
    if merged.bind.is_empty() && merged.bind_host.is_empty() && merged.bind_location.is_empty() {
        merged.bind = defaults.bind.clone();
        merged.bind_host = defaults.bind_host.clone();
        merged.bind_location = defaults.bind_location.clone();
    }
    if merged.upstream.is_empty() && merged.upstream_set.is_empty() {
        merged.upstream = defaults.upstream.clone();
        merged.upstream_set = defaults.upstream_set.clone();
    }
    if merged.strategy.is_none() {
        merged.strategy = defaults.strategy;
    }
    if merged.upstream_port == 0 {
        merged.upstream_port = defaults.upstream_port;
    }
    if merged.upstream_path.is_empty() {
        merged.upstream_path = defaults.upstream_path.clone();
    }
    if merged.ttl.is_none() {
        merged.ttl = defaults.ttl;
    }
    merged.allow_stale = merged.allow_stale || defaults.allow_stale;
    if merged.redirect == 0 {
        merged.redirect = defaults.redirect;
    }

    let mut add_header = defaults.add_header.clone();
    add_header.extend(merged.add_header);
    merged.add_header = add_header;

    let mut set_header = defaults.set_header.clone();
    set_header.extend(merged.set_header);
    merged.set_header = set_header;

    let mut strip_header = defaults.strip_header.clone();
    strip_header.extend(merged.strip_header);
    merged.strip_header = strip_header;

    merged
}

async fn build_rule(site: &SiteConfig) -> Result<SiteRule> {
    if !site.bind.is_empty() && (!site.bind_host.is_empty() || !site.bind_location.is_empty()) {
        bail!("'bind' can not be used with 'bind_host' or 'bind_location'");
    }

    let matcher = if site.bind.is_empty() {
        Matcher::new(&site.bind_host, &site.bind_location)
    } else {
        let (host_port, location) = split_bind(&site.bind);
        Matcher::new(host_port, location)
    };

    let provider = provider_from_config(site)?;

    // Pre-emptively check there are no errors fetching upstreams. For fixed
    // sets this verifies the URLs are valid; for DNS it performs a lookup.
    provider
        .all()
        .await
        .map_err(|e| anyhow::anyhow!("invalid upstream: {e}"))?;

    let mut director = Director::new(provider).path_prefix(matcher.path());
    for key in &site.strip_header {
        director.strip_header(parse_header_name(key)?);
    }
    for (key, value) in &site.set_header {
        director.set_header(parse_header_name(key)?, parse_header_value(key, value)?);
    }
    for (key, value) in &site.add_header {
        director.add_header(parse_header_name(key)?, parse_header_value(key, value)?);
    }

    let redirect = match site.redirect {
        0 => None,
        301 | 302 | 307 => Some(StatusCode::from_u16(site.redirect).unwrap()),
        other => bail!("invalid redirect, should be one of (301, 302, 307), was '{other}'"),
    };

    Ok(SiteRule {
        name: site.name.clone(),
        matcher,
        director,
        redirect,
    })
}

/// Chooses the upstream source from the shape of the configuration: an
/// 'upstream_set' is always a fixed set; a single 'upstream' containing
/// "//" is a fixed URL, and a bare host name demarks a DNS source.
fn provider_from_config(site: &SiteConfig) -> Result<Arc<dyn Provider>> {
    if !site.upstream.is_empty() && !site.upstream_set.is_empty() {
        bail!("must specify one of 'upstream' or 'upstream_set' not both");
    }

    if !site.upstream_set.is_empty() {
        let source = FixedSet::new(site.upstream_set.clone());
        return Ok(balanced(source, site.strategy.unwrap_or(Strategy::Random)));
    }

    if site.upstream.is_empty() {
        bail!("missing upstream in '{}', must specify one of 'upstream' or 'upstream_set'", site.name);
    }

    if site.upstream.contains("//") {
        // Looks like a full URL so treat as a single upstream.
        let source = FixedSet::new(vec![site.upstream.clone()]);
        return Ok(balanced(source, site.strategy.unwrap_or(Strategy::First)));
    }

    let port = if site.upstream_port == 0 { 80 } else { site.upstream_port };
    let mut dns = Dns::new(site.upstream.clone(), port, site.upstream_path.clone())
        .allow_stale(site.allow_stale);
    if let Some(ttl) = site.ttl {
        dns = dns.ttl(ttl);
    }
    Ok(balanced(dns, site.strategy.unwrap_or(Strategy::Random)))
}

fn balanced<S: Source + 'static>(source: S, strategy: Strategy) -> Arc<dyn Provider> {
    match strategy {
        Strategy::First => Arc::new(upstream::first(source)),
        Strategy::Random => Arc::new(upstream::random(source)),
        Strategy::RoundRobin => Arc::new(upstream::round_robin(source)),
        Strategy::IpHash => Arc::new(upstream::ip_hash(source)),
    }
}

/// Splits a bind pattern like "//host:port/path?query" into its
/// host-and-port and request-URI parts. A pattern without the leading "//"
/// is a location-only bind.
fn split_bind(bind: &str) -> (&str, &str) {
    match bind.strip_prefix("//") {
        Some(rest) => match rest.find(['/', '?']) {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        },
        None => ("", bind),
    }
}

fn parse_header_name(key: &str) -> Result<HeaderName> {
    key.parse::<HeaderName>()
        .with_context(|| format!("invalid header name '{key}'"))
}

fn parse_header_value(key: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).with_context(|| format!("invalid value for header '{key}'"))
}

mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => super::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let parse = |num: &str, unit: u64| -> std::result::Result<Duration, String> {
        num.parse::<u64>()
            .map(|n| Duration::from_secs(n * unit))
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    };
    if let Some(num) = s.strip_suffix('h') {
        parse(num, 3600)
    } else if let Some(num) = s.strip_suffix('m') {
        parse(num, 60)
    } else if let Some(num) = s.strip_suffix('s') {
        parse(num, 1)
    } else {
        parse(s, 1)
    }
}

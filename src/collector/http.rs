//! HTTP/HTTPS collector.
//!
//! Targets come from the flat `targets` list and from enabled `groups`, whose
//! relative URLs are joined onto the group's base URL. All targets share one
//! `reqwest` client built from the collector defaults.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Url};

use super::error::{find_io_error, io_failure, CollectorError};
use super::{collection_error, fan_out, Collector};
use crate::config::{resolve_thresholds, GlobalMonitorConfig, HttpDefaults, HttpMonitorConfig, HttpTarget};
use crate::model::{monitor_id, AgentIdentity, ErrorType, MonitorType, ProbeResult, Thresholds};

/// Longest response body kept on a result, in characters.
const MAX_BODY_CHARS: usize = 1000;
const MAX_REDIRECTS: usize = 5;

/// One fully-resolved HTTP target.
#[derive(Debug, Clone)]
pub struct HttpProbeTarget {
    pub id: String,
    pub name: String,
    pub url: Url,
    pub method: Method,
    pub expected_status: Option<Vec<u16>>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub include_body: bool,
    pub thresholds: Thresholds,
}

impl HttpProbeTarget {
    pub fn monitor_type(&self) -> MonitorType {
        if self.url.scheme() == "https" {
            MonitorType::Https
        } else {
            MonitorType::Http
        }
    }
}

pub struct HttpCollector {
    enabled: bool,
    interval: Duration,
    client: Client,
    targets: Vec<HttpProbeTarget>,
    identity: Arc<AgentIdentity>,
}

impl HttpCollector {
    pub fn new(
        config: &HttpMonitorConfig,
        global: &GlobalMonitorConfig,
        identity: Arc<AgentIdentity>,
    ) -> Result<Self, CollectorError> {
        Ok(Self {
            enabled: config.enabled,
            interval: config.defaults.interval(),
            client: build_client(&config.defaults)?,
            targets: expand_targets(config, global)?,
            identity,
        })
    }

    pub fn targets(&self) -> &[HttpProbeTarget] {
        &self.targets
    }
}

#[async_trait]
impl Collector for HttpCollector {
    fn name(&self) -> &str {
        "http"
    }

    fn monitor_type(&self) -> MonitorType {
        MonitorType::Http
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    async fn collect(&self) -> Vec<ProbeResult> {
        let identity = self.identity.clone();
        let client = self.client.clone();
        fan_out(
            &self.targets,
            move |target| {
                let identity = identity.clone();
                let client = client.clone();
                async move { probe_http(&client, &identity, &target).await }
            },
            |target, message| collection_error(base_result(&self.identity, target), message),
        )
        .await
    }
}

/// Shared client for one collector generation.
pub fn build_client(defaults: &HttpDefaults) -> Result<Client, CollectorError> {
    let redirect = if defaults.follow_redirects {
        reqwest::redirect::Policy::limited(MAX_REDIRECTS)
    } else {
        reqwest::redirect::Policy::none()
    };

    Client::builder()
        .redirect(redirect)
        .danger_accept_invalid_certs(!defaults.verify_ssl)
        .user_agent(defaults.user_agent.as_str())
        // Every probe opens a fresh connection so timings stay comparable.
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| CollectorError::Build {
            collector: "http",
            reason: e.to_string(),
        })
}

/// Join a possibly relative monitor URL onto a group base URL.
pub fn build_full_url(base_url: Option<&str>, url: &str) -> Result<Url, CollectorError> {
    let joined = match base_url {
        Some(base) if !url.starts_with("http://") && !url.starts_with("https://") => {
            format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'))
        }
        _ => url.to_string(),
    };
    Url::parse(&joined).map_err(|e| CollectorError::Config(format!("invalid url {:?}: {}", joined, e)))
}

/// Flatten plain targets and enabled groups into probe targets.
pub fn expand_targets(
    config: &HttpMonitorConfig,
    global: &GlobalMonitorConfig,
) -> Result<Vec<HttpProbeTarget>, CollectorError> {
    let defaults = &config.defaults;
    let mut targets = Vec::new();

    for target in &config.targets {
        targets.push(resolve_target(target, None, defaults, global)?);
    }

    for group in config.groups.iter().filter(|g| g.enabled) {
        for target in &group.monitors {
            targets.push(resolve_target(target, Some(group), defaults, global)?);
        }
    }

    Ok(targets)
}

fn resolve_target(
    target: &HttpTarget,
    group: Option<&crate::config::HttpGroup>,
    defaults: &HttpDefaults,
    global: &GlobalMonitorConfig,
) -> Result<HttpProbeTarget, CollectorError> {
    let url = build_full_url(group.and_then(|g| g.base_url.as_deref()), &target.url)?;

    let method_name = target.method.as_deref().unwrap_or(&defaults.method).to_ascii_uppercase();
    let method = Method::from_bytes(method_name.as_bytes())
        .map_err(|_| CollectorError::Config(format!("invalid http method {:?}", method_name)))?;

    // defaults < group < target
    let mut headers = defaults.headers.clone();
    if let Some(group) = group {
        headers.extend(group.defaults.headers.clone());
    }
    headers.extend(target.headers.clone());

    let timeout_seconds = target
        .timeout_seconds
        .or_else(|| group.and_then(|g| g.defaults.timeout_seconds))
        .unwrap_or(defaults.timeout_seconds);

    Ok(HttpProbeTarget {
        id: monitor_id("http", &target.name),
        name: target.name.clone(),
        url,
        method,
        expected_status: target.expected_status.clone().filter(|s| !s.is_empty()),
        headers,
        body: target.body.clone(),
        timeout: Duration::from_secs(timeout_seconds.max(1)),
        include_body: target.include_response_body.unwrap_or(global.include_response_body),
        thresholds: resolve_thresholds(target.thresholds, defaults.thresholds, global.response_time_thresholds),
    })
}

fn base_result(identity: &AgentIdentity, target: &HttpProbeTarget) -> ProbeResult {
    let host = target.url.host_str().unwrap_or_default();
    let mut result = ProbeResult::begin(identity, target.monitor_type(), target.id.clone(), &target.name, host)
        .with_thresholds(target.thresholds);

    result.target_port = target.url.port_or_known_default();
    let mut path = target.url.path().to_string();
    if let Some(query) = target.url.query() {
        path.push('?');
        path.push_str(query);
    }
    result.target_path = Some(path);
    result.http_method = Some(target.method.to_string());
    result.expected_status_code = target.expected_status.as_ref().and_then(|s| s.first().copied());
    if !target.headers.is_empty() {
        result.raw_request_headers = serde_json::to_value(&target.headers).ok();
    }
    result
}

struct Exchange {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    ttfb: Duration,
}

enum ExchangeFailure {
    Resolve(String),
    Request(reqwest::Error),
}

async fn execute(
    client: &Client,
    target: &HttpProbeTarget,
    dns_ms: &mut Option<u64>,
) -> Result<Exchange, ExchangeFailure> {
    // Resolve up front so name resolution shows up as its own phase.
    if let Some(host) = target.url.host_str() {
        let port = target.url.port_or_known_default().unwrap_or(80);
        let lookup_start = Instant::now();
        let mut addrs = tokio::net::lookup_host((host.trim_matches(['[', ']']), port))
            .await
            .map_err(|e| ExchangeFailure::Resolve(format!("DNS lookup failed for {}: {}", host, e)))?;
        if addrs.next().is_none() {
            return Err(ExchangeFailure::Resolve(format!("DNS lookup failed for {}: no addresses", host)));
        }
        *dns_ms = Some(lookup_start.elapsed().as_millis() as u64);
    }

    let mut request = client
        .request(target.method.clone(), target.url.clone())
        .timeout(target.timeout);
    for (name, value) in &target.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &target.body {
        request = request.body(body.clone());
    }

    let start = Instant::now();
    let response = request.send().await.map_err(ExchangeFailure::Request)?;
    let ttfb = start.elapsed();

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(ExchangeFailure::Request)?;

    Ok(Exchange {
        status,
        headers,
        body: body.to_vec(),
        ttfb,
    })
}

/// Probe one target.
pub async fn probe_http(client: &Client, identity: &AgentIdentity, target: &HttpProbeTarget) -> ProbeResult {
    let mut result = base_result(identity, target);
    let start = Instant::now();

    let mut dns_ms = None;
    let outcome = tokio::time::timeout(target.timeout, execute(client, target, &mut dns_ms)).await;
    result.response_time = start.elapsed().as_millis() as u64;
    result.dns_lookup_ms = dns_ms;

    let exchange = match outcome {
        Ok(Ok(exchange)) => exchange,
        Ok(Err(ExchangeFailure::Resolve(message))) => return result.fail(ErrorType::DnsError, message),
        Ok(Err(ExchangeFailure::Request(e))) => {
            let (kind, message) = classify_request_error(&e, target.timeout);
            return result.fail(kind, message);
        }
        Err(_) => return result.fail(ErrorType::Timeout, timeout_message(target.timeout)),
    };

    record_response(&mut result, &exchange, target.include_body);

    match &target.expected_status {
        Some(expected) if !expected.contains(&exchange.status) => {
            let expected = expected.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ");
            result.fail(
                ErrorType::StatusCodeMismatch,
                format!("Unexpected status code: {}, expected: {}", exchange.status, expected),
            )
        }
        _ => result.succeed(),
    }
}

fn record_response(result: &mut ProbeResult, exchange: &Exchange, include_body: bool) {
    let header = |name: &str| {
        exchange
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    result.response_status_code = Some(exchange.status);
    result.time_to_first_byte_ms = Some(exchange.ttfb.as_millis() as u64);
    result.response_content_type = header("content-type");
    result.response_server = header("server");
    result.response_cache_status = header("cf-cache-status").or_else(|| header("x-cache"));
    result.response_size_bytes = header("content-length")
        .and_then(|v| v.parse().ok())
        .or(Some(exchange.body.len() as u64));

    let headers: serde_json::Map<String, serde_json::Value> = exchange
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    result.raw_response_headers = Some(serde_json::Value::Object(headers));

    if include_body {
        result.raw_response_body = Some(truncate_body(&String::from_utf8_lossy(&exchange.body)));
    }
}

pub fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}... [TRUNCATED]", &body[..cut]),
        None => body.to_string(),
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("Request timeout after {}ms", timeout.as_millis())
}

/// Message built from the error and its sources.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        let text = e.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = e.source();
    }
    message
}

fn classify_request_error(err: &reqwest::Error, timeout: Duration) -> (ErrorType, String) {
    if err.is_timeout() {
        return (ErrorType::Timeout, timeout_message(timeout));
    }
    if let Some(io_err) = find_io_error(err) {
        let (kind, message) = io_failure(io_err);
        if kind != ErrorType::ConnectionError {
            return (kind, message);
        }
    }

    let message = error_chain(err);
    if err.is_connect() {
        if message.contains("dns error") {
            (ErrorType::DnsError, message)
        } else {
            (ErrorType::ConnectionError, message)
        }
    } else {
        (ErrorType::HttpError, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::identity;
    use crate::config::{HttpGroup, HttpGroupDefaults};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    async fn spawn_server() -> SocketAddr {
        let app = Router::new()
            .route("/ok", get(|| async { ([("server", "probe-test")], "hello") }))
            .route("/fail", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
            .route("/big", get(|| async { "x".repeat(2000) }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn target(url: &str, expected: Option<Vec<u16>>, timeout_secs: u64) -> HttpProbeTarget {
        HttpProbeTarget {
            id: monitor_id("http", "t"),
            name: "t".into(),
            url: Url::parse(url).unwrap(),
            method: Method::GET,
            expected_status: expected,
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(timeout_secs),
            include_body: true,
            thresholds: Thresholds::default(),
        }
    }

    fn client() -> Client {
        build_client(&HttpDefaults::default()).unwrap()
    }

    #[test]
    fn test_build_full_url() {
        let url = build_full_url(Some("https://api.example.com/v1/"), "/health?deep=1").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/health?deep=1");

        let absolute = build_full_url(Some("https://api.example.com"), "http://other.example.com/x").unwrap();
        assert_eq!(absolute.host_str(), Some("other.example.com"));

        assert!(build_full_url(None, "/relative").is_err());
    }

    #[test]
    fn test_expand_targets_merges_groups() {
        let mut defaults = HttpDefaults::default();
        defaults.headers.insert("x-env".into(), "prod".into());
        let config = HttpMonitorConfig {
            enabled: true,
            defaults,
            targets: vec![HttpTarget {
                name: "home".into(),
                url: "https://example.com/".into(),
                ..Default::default()
            }],
            groups: vec![
                HttpGroup {
                    name: "api".into(),
                    base_url: Some("https://api.example.com".into()),
                    defaults: HttpGroupDefaults {
                        timeout_seconds: Some(3),
                        headers: [("x-env".to_string(), "api".to_string())].into_iter().collect(),
                    },
                    monitors: vec![HttpTarget {
                        name: "Api Health".into(),
                        url: "/health".into(),
                        method: Some("head".into()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                HttpGroup {
                    name: "off".into(),
                    enabled: false,
                    monitors: vec![HttpTarget {
                        name: "skipped".into(),
                        url: "https://skipped.example.com".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
        };

        let targets = expand_targets(&config, &GlobalMonitorConfig::default()).unwrap();
        assert_eq!(targets.len(), 2);
        let api = &targets[1];
        assert_eq!(api.id, "http-api-health");
        assert_eq!(api.url.as_str(), "https://api.example.com/health");
        assert_eq!(api.method, Method::HEAD);
        assert_eq!(api.timeout, Duration::from_secs(3));
        assert_eq!(api.headers.get("x-env").map(String::as_str), Some("api"));
        assert_eq!(api.monitor_type(), MonitorType::Https);
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");
        let long = "é".repeat(1500);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("... [TRUNCATED]"));
        assert_eq!(truncated.chars().count(), 1000 + "... [TRUNCATED]".len());
    }

    #[tokio::test]
    async fn test_successful_request_records_response() {
        let addr = spawn_server().await;
        let t = target(&format!("http://{}/ok", addr), Some(vec![200]), 5);
        let result = probe_http(&client(), &identity(), &t).await;

        assert!(result.success(), "{:?}", result.error_message());
        assert_eq!(result.monitor_type, MonitorType::Http);
        assert_eq!(result.response_status_code, Some(200));
        assert_eq!(result.expected_status_code, Some(200));
        assert_eq!(result.response_server.as_deref(), Some("probe-test"));
        assert_eq!(result.response_size_bytes, Some(5));
        assert_eq!(result.raw_response_body.as_deref(), Some("hello"));
        assert_eq!(result.target_path.as_deref(), Some("/ok"));
        assert!(result.time_to_first_byte_ms.is_some());
    }

    #[tokio::test]
    async fn test_status_mismatch() {
        let addr = spawn_server().await;
        let t = target(&format!("http://{}/fail", addr), Some(vec![200, 204]), 5);
        let result = probe_http(&client(), &identity(), &t).await;

        assert!(!result.success());
        assert_eq!(result.error_type(), Some(ErrorType::StatusCodeMismatch));
        assert_eq!(
            result.error_message(),
            Some("Unexpected status code: 500, expected: 200, 204")
        );
        assert_eq!(result.response_status_code, Some(500));
    }

    #[tokio::test]
    async fn test_any_status_accepted_without_expectation() {
        let addr = spawn_server().await;
        let t = target(&format!("http://{}/fail", addr), None, 5);
        let result = probe_http(&client(), &identity(), &t).await;
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_body_truncated() {
        let addr = spawn_server().await;
        let t = target(&format!("http://{}/big", addr), None, 5);
        let result = probe_http(&client(), &identity(), &t).await;
        let body = result.raw_response_body.unwrap();
        assert!(body.ends_with("... [TRUNCATED]"));
        assert_eq!(result.response_size_bytes, Some(2000));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let addr = spawn_server().await;
        let t = target(&format!("http://{}/slow", addr), None, 1);
        let result = probe_http(&client(), &identity(), &t).await;

        assert!(!result.success());
        assert_eq!(result.error_type(), Some(ErrorType::Timeout));
        assert!(result.response_time < 2500);
    }

    #[tokio::test]
    async fn test_closed_port_is_connection_failure() {
        let t = target("http://127.0.0.1:1/", None, 2);
        let result = probe_http(&client(), &identity(), &t).await;
        assert!(!result.success());
        assert!(matches!(
            result.error_type(),
            Some(ErrorType::ConnectionRefused) | Some(ErrorType::ConnectionError)
        ));
    }
}

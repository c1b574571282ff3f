//! DNS collector backed by `hickory-resolver`.
//!
//! Targets without a `nameserver` share the system resolver; each distinct
//! nameserver gets its own resolver. Caching is disabled so every cycle
//! measures a real query.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::{ResolveError, TokioResolver};

use super::{collection_error, fan_out, Collector};
use crate::config::{resolve_thresholds, DnsMonitorConfig, DnsRecordType, GlobalMonitorConfig};
use crate::model::{monitor_id, AgentIdentity, ErrorType, MonitorType, ProbeResult, Thresholds};

/// One resolved DNS target.
#[derive(Debug, Clone)]
pub struct DnsProbeTarget {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub record_type: DnsRecordType,
    pub expected: Option<String>,
    pub nameserver: Option<IpAddr>,
    pub timeout: Duration,
    pub thresholds: Thresholds,
}

pub struct DnsCollector {
    enabled: bool,
    interval: Duration,
    targets: Vec<DnsProbeTarget>,
    system: TokioResolver,
    dedicated: HashMap<IpAddr, TokioResolver>,
    identity: Arc<AgentIdentity>,
}

fn resolver_opts() -> ResolverOpts {
    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts
}

/// Resolver built from the host configuration, or public defaults when the
/// host has none.
fn system_resolver() -> TokioResolver {
    match TokioResolver::builder_tokio() {
        Ok(builder) => builder.with_options(resolver_opts()).build(),
        Err(e) => {
            tracing::warn!(error = %e, "System resolver configuration unavailable, using defaults");
            TokioResolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
                .with_options(resolver_opts())
                .build()
        }
    }
}

fn nameserver_resolver(ip: IpAddr) -> TokioResolver {
    let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
    let config = ResolverConfig::from_parts(None, Vec::new(), group);
    TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
        .with_options(resolver_opts())
        .build()
}

/// What the target expects, as recorded on the result.
fn expected_response(expected_ips: &[String], expected_cname: Option<&str>) -> Option<String> {
    if !expected_ips.is_empty() {
        Some(expected_ips.join(", "))
    } else {
        expected_cname.map(str::to_string)
    }
}

impl DnsCollector {
    pub fn new(config: &DnsMonitorConfig, global: &GlobalMonitorConfig, identity: Arc<AgentIdentity>) -> Self {
        let defaults = &config.defaults;
        let targets: Vec<DnsProbeTarget> = config
            .targets
            .iter()
            .map(|t| DnsProbeTarget {
                id: monitor_id("dns", &t.name),
                name: t.name.clone(),
                domain: t.domain.clone(),
                record_type: t.record_type,
                expected: expected_response(&t.expected_ips, t.expected_cname.as_deref()),
                nameserver: t.nameserver,
                timeout: Duration::from_secs(t.timeout_seconds.unwrap_or(defaults.timeout_seconds).max(1)),
                thresholds: resolve_thresholds(t.thresholds, defaults.thresholds, global.response_time_thresholds),
            })
            .collect();

        let dedicated = targets
            .iter()
            .filter_map(|t| t.nameserver)
            .map(|ip| (ip, nameserver_resolver(ip)))
            .collect();

        Self {
            enabled: config.enabled,
            interval: defaults.interval(),
            targets,
            system: system_resolver(),
            dedicated,
            identity,
        }
    }

    fn resolver_for(&self, target: &DnsProbeTarget) -> TokioResolver {
        target
            .nameserver
            .and_then(|ip| self.dedicated.get(&ip))
            .unwrap_or(&self.system)
            .clone()
    }
}

#[async_trait]
impl Collector for DnsCollector {
    fn name(&self) -> &str {
        "dns"
    }

    fn monitor_type(&self) -> MonitorType {
        MonitorType::Dns
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
        let jobs: Vec<(DnsProbeTarget, TokioResolver)> = self
            .targets
            .iter()
            .map(|t| (t.clone(), self.resolver_for(t)))
            .collect();

        fan_out(
            &jobs,
            move |(target, resolver)| {
                let identity = identity.clone();
                async move { probe_dns(&resolver, &identity, &target).await }
            },
            |(target, _), message| collection_error(base_result(&self.identity, target), message),
        )
        .await
    }
}

fn base_result(identity: &AgentIdentity, target: &DnsProbeTarget) -> ProbeResult {
    let mut result = ProbeResult::begin(identity, MonitorType::Dns, target.id.clone(), &target.name, &target.domain)
        .with_thresholds(target.thresholds);
    result.dns_query_type = Some(target.record_type.as_str().to_string());
    result.dns_expected_response = target.expected.clone();
    result
}

/// Run the lookup for the target's record type.
async fn lookup(resolver: &TokioResolver, domain: &str, record_type: DnsRecordType) -> Result<Vec<String>, ResolveError> {
    let values = match record_type {
        DnsRecordType::A => resolver.ipv4_lookup(domain).await?.iter().map(|a| a.0.to_string()).collect(),
        DnsRecordType::Aaaa => resolver.ipv6_lookup(domain).await?.iter().map(|a| a.0.to_string()).collect(),
        DnsRecordType::Mx => resolver
            .mx_lookup(domain)
            .await?
            .iter()
            .map(|mx| format!("{} {}", mx.preference(), mx.exchange()))
            .collect(),
        DnsRecordType::Txt => resolver
            .txt_lookup(domain)
            .await?
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<String>()
            })
            .collect(),
        DnsRecordType::Ns => resolver.ns_lookup(domain).await?.iter().map(|ns| ns.0.to_string()).collect(),
        DnsRecordType::Cname => resolver
            .lookup(domain, RecordType::CNAME)
            .await?
            .iter()
            .filter_map(|rdata| match rdata {
                RData::CNAME(cname) => Some(cname.0.to_string()),
                _ => None,
            })
            .collect(),
    };
    Ok(values)
}

/// Probe one target.
pub async fn probe_dns(resolver: &TokioResolver, identity: &AgentIdentity, target: &DnsProbeTarget) -> ProbeResult {
    let mut result = base_result(identity, target);
    let start = Instant::now();

    let outcome = tokio::time::timeout(target.timeout, lookup(resolver, &target.domain, target.record_type)).await;
    let elapsed = start.elapsed().as_millis() as u64;
    result.response_time = elapsed;

    match outcome {
        Ok(Ok(values)) => {
            result.dns_lookup_ms = Some(elapsed);
            result.raw_network_data = Some(serde_json::json!({
                "recordType": target.record_type.as_str(),
                "recordCount": values.len(),
                "nameserver": target.nameserver.map(|ip| ip.to_string()),
            }));
            result.dns_response_value = Some(values);
            result.succeed()
        }
        Ok(Err(e)) => result.fail(ErrorType::DnsError, format!("DNS lookup failed: {}", e)),
        Err(_) => result.fail(ErrorType::Timeout, "DNS lookup timeout"),
    }
}

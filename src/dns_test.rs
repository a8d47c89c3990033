//! Loopback resolver queries: the `test` command and the reload canary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveErrorKind, Resolver};

use crate::error::Result;
use crate::lists::normalize_domain;
use crate::paths::LISTEN_PORT;

/// What a query against the loopback resolver told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// NXDOMAIN or a sinkhole address: the domain is blocked.
    Blocked(String),
    /// A real answer came back.
    Allowed(Vec<IpAddr>),
    /// REFUSED, SERVFAIL, timeout or transport failure.
    Error(String),
}

fn is_sinkhole_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::UNSPECIFIED || v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_unspecified() || v6.is_loopback(),
    }
}

/// Classifies a set of answered addresses.
pub fn classify_answers(ips: Vec<IpAddr>) -> QueryOutcome {
    if let Some(ip) = ips.iter().find(|ip| is_sinkhole_ip(**ip)) {
        return QueryOutcome::Blocked(format!("resolved to sinkhole address {ip}"));
    }
    if ips.is_empty() {
        return QueryOutcome::Blocked("no answer returned (sinkholed)".to_string());
    }
    QueryOutcome::Allowed(ips)
}

fn classify_response_code(code: ResponseCode) -> QueryOutcome {
    match code {
        ResponseCode::NXDomain => QueryOutcome::Blocked("NXDOMAIN".to_string()),
        ResponseCode::Refused => QueryOutcome::Error(
            "REFUSED - upstream.conf may be empty or dnsmasq misconfigured".to_string(),
        ),
        ResponseCode::ServFail => QueryOutcome::Error("SERVFAIL - upstream DNS failure".to_string()),
        ResponseCode::NoError => QueryOutcome::Blocked("no answer returned (sinkholed)".to_string()),
        other => QueryOutcome::Error(format!("unexpected response code {other}")),
    }
}

/// Queries `domain` against 127.0.0.1:53.
pub async fn query_loopback(domain: &str) -> QueryOutcome {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), LISTEN_PORT);
    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));

    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts.attempts = 1;
    opts.timeout = Duration::from_secs(3);

    let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
        .with_options(opts)
        .build();

    match resolver.lookup_ip(domain).await {
        Ok(lookup) => classify_answers(lookup.iter().collect()),
        Err(err) => match err.kind() {
            ResolveErrorKind::Proto(proto) => match proto.kind() {
                ProtoErrorKind::NoRecordsFound { response_code, .. } => {
                    classify_response_code(*response_code)
                }
                ProtoErrorKind::Timeout => {
                    QueryOutcome::Error("query timed out - is dnsmasq running?".to_string())
                }
                _ => QueryOutcome::Error(err.to_string()),
            },
            _ => QueryOutcome::Error(err.to_string()),
        },
    }
}

/// The `test <domain>` command.
pub async fn run_test(raw_domain: &str) -> Result<i32> {
    let domain = normalize_domain(raw_domain)?;

    println!("querying {domain} via {}:{LISTEN_PORT}", Ipv4Addr::LOCALHOST);

    match query_loopback(&domain).await {
        QueryOutcome::Blocked(reason) => {
            println!("[BLOCKED] {reason}");
            Ok(0)
        }
        QueryOutcome::Allowed(ips) => {
            let rendered: Vec<String> = ips.iter().map(IpAddr::to_string).collect();
            println!("[ALLOWED] resolved to {}", rendered.join(", "));
            Ok(0)
        }
        QueryOutcome::Error(msg) => {
            eprintln!("error: {msg}");
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sinkhole_addresses() {
        assert!(is_sinkhole_ip("0.0.0.0".parse().unwrap()));
        assert!(is_sinkhole_ip("127.0.0.1".parse().unwrap()));
        assert!(is_sinkhole_ip("::".parse().unwrap()));
        assert!(!is_sinkhole_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_classify_answers() {
        let real: IpAddr = "93.184.216.34".parse().unwrap();
        assert_eq!(classify_answers(vec![real]), QueryOutcome::Allowed(vec![real]));

        let sink: IpAddr = "0.0.0.0".parse().unwrap();
        assert!(matches!(classify_answers(vec![sink]), QueryOutcome::Blocked(_)));
        assert!(matches!(classify_answers(vec![]), QueryOutcome::Blocked(_)));
    }

    #[test]
    fn test_classify_response_codes() {
        assert!(matches!(
            classify_response_code(ResponseCode::NXDomain),
            QueryOutcome::Blocked(_)
        ));
        assert!(matches!(
            classify_response_code(ResponseCode::Refused),
            QueryOutcome::Error(_)
        ));
        assert!(matches!(
            classify_response_code(ResponseCode::ServFail),
            QueryOutcome::Error(_)
        ));
    }
}

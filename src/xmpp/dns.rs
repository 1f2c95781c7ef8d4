//! XMPP server resolution and transport establishment.
//!
//! Converts a server input string (bare domain, `tls://host:port`, etc.) into
//! resolved [`XmppEndpoint`]s, then opens the first one that accepts a
//! connection. SRV candidates are returned sorted by priority (RFC 2782), so a
//! dead high-priority host falls through to the next one.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use super::error::{Error, Result};
use super::transport::{TlsUpgrader, Transport};

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP, upgraded through STARTTLS (port 5222)
    Tcp,
    /// TLS from the first byte (port 5223)
    DirectTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain for TLS SNI when `host` is an SRV target.
    ///
    /// RFC 6120 §13.7.2: certificates are checked against the service domain
    /// (e.g. "diebesban.de"), not the SRV target (e.g. "v4.mdosch.de").
    pub domain: Option<String>,
}

impl XmppEndpoint {
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedServer {
    /// Explicit endpoint, SRV is skipped
    Direct(XmppEndpoint),
    /// Domain only, SRV resolution needed
    Domain(String),
}

/// Split an optional `?domain=` parameter off a URI remainder.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (host_port, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

fn host_and_port(host_port: &str, default_port: u16) -> (String, u16) {
    // rsplit keeps IPv6 literals intact
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host_port.to_string(), default_port),
        },
        None => (host_port.to_string(), default_port),
    }
}

/// Parse the server input string into an explicit endpoint or a domain.
///
/// Supported formats:
/// - `tls://host[:port][?domain=d]` → direct TLS, port 5223 by default
/// - `tcp://host[:port][?domain=d]` → STARTTLS, port 5222 by default
/// - `host:port`                    → 5223 means direct TLS, anything else STARTTLS
/// - `domain`                       → SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    let schemes = [
        ("tls://", ConnectionMode::DirectTls, 5223),
        ("tcp://", ConnectionMode::Tcp, 5222),
    ];
    for (scheme, mode, default_port) in schemes {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let (host_port, domain) = split_domain_param(rest);
            let (host, port) = host_and_port(host_port, default_port);
            return ParsedServer::Direct(XmppEndpoint {
                host,
                port,
                mode,
                domain,
            });
        }
    }

    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let mode = if port == 5223 {
                ConnectionMode::DirectTls
            } else {
                ConnectionMode::Tcp
            };
            return ParsedServer::Direct(XmppEndpoint {
                host: host.to_string(),
                port,
                mode,
                domain: None,
            });
        }
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// One SRV answer, before ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SrvCandidate {
    priority: u16,
    weight: u16,
    target: String,
    port: u16,
}

/// Order by priority ascending, then weight descending, and drop "." targets
/// (RFC 2782: service explicitly not available).
fn order_candidates(
    mut records: Vec<SrvCandidate>,
    mode: ConnectionMode,
    domain: &str,
) -> Vec<XmppEndpoint> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .filter(|r| !r.target.is_empty())
        .map(|r| XmppEndpoint {
            host: r.target,
            port: r.port,
            mode,
            domain: Some(domain.to_string()),
        })
        .collect()
}

async fn lookup_service(
    resolver: &TokioAsyncResolver,
    domain: &str,
    service: &str,
    mode: ConnectionMode,
) -> Vec<XmppEndpoint> {
    let srv_name = format!("{}.{}", service, domain);
    let started = Instant::now();
    match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => {
            let records = lookup
                .iter()
                .map(|r| SrvCandidate {
                    priority: r.priority(),
                    weight: r.weight(),
                    target: r.target().to_string().trim_end_matches('.').to_string(),
                    port: r.port(),
                })
                .collect();
            let endpoints = order_candidates(records, mode, domain);
            for ep in &endpoints {
                info!(domain, host = %ep.host, port = ep.port, ?mode, "SRV record");
            }
            info!(domain, srv = %srv_name, count = endpoints.len(), lookup_ms = elapsed_ms(started), "SRV resolved");
            endpoints
        }
        Err(e) => {
            info!(domain, srv = %srv_name, lookup_ms = elapsed_ms(started), error = %e, "SRV lookup failed");
            Vec::new()
        }
    }
}

/// Resolve an XMPP domain into candidate endpoints, in attempt order:
/// `_xmpps-client._tcp` records, then `_xmpp-client._tcp` records, and
/// `domain:5222` only when no SRV record exists at all.
pub async fn resolve_xmpp_server(domain: &str) -> Result<Vec<XmppEndpoint>> {
    if domain.is_empty() {
        return Err(Error::Resolve("empty domain".into()));
    }
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system DNS config: {}, falling back to default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints =
        lookup_service(&resolver, domain, "_xmpps-client._tcp", ConnectionMode::DirectTls).await;
    endpoints.extend(lookup_service(&resolver, domain, "_xmpp-client._tcp", ConnectionMode::Tcp).await);

    if endpoints.is_empty() {
        warn!(domain, resolve_total_ms = elapsed_ms(started), "No SRV records found, using fallback: {}:5222 (STARTTLS)", domain);
        endpoints.push(XmppEndpoint {
            host: domain.to_string(),
            port: 5222,
            mode: ConnectionMode::Tcp,
            domain: None,
        });
    } else {
        info!(domain, total = endpoints.len(), resolve_total_ms = elapsed_ms(started), "SRV resolution complete");
    }
    Ok(endpoints)
}

/// Candidate endpoints for an account: the explicit server if one is
/// configured, SRV resolution of the account domain otherwise.
pub async fn candidates(server: Option<&str>, account_domain: &str) -> Result<Vec<XmppEndpoint>> {
    match server.map(parse_server_input) {
        Some(ParsedServer::Direct(endpoint)) => Ok(vec![endpoint]),
        Some(ParsedServer::Domain(domain)) => resolve_xmpp_server(&domain).await,
        None => resolve_xmpp_server(account_domain).await,
    }
}

/// Open one endpoint. Direct TLS endpoints come back already encrypted.
pub async fn connect_endpoint(
    endpoint: &XmppEndpoint,
    connect_timeout: Duration,
    upgrader: &dyn TlsUpgrader,
) -> Result<Transport> {
    let started = Instant::now();
    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(host = %endpoint.host, port = endpoint.port, error = %e, "TCP connect failed");
            return Err(Error::Connect(format!("{}: {}", addr, e)));
        }
        Err(_) => {
            warn!(host = %endpoint.host, port = endpoint.port, timeout_ms = connect_timeout.as_millis() as u64, "TCP connect timed out");
            return Err(Error::Connect(format!(
                "{}: timed out after {}s",
                addr,
                connect_timeout.as_secs()
            )));
        }
    };
    if let Err(e) = tcp.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }
    info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, connect_ms = elapsed_ms(started), "TCP connected");

    match endpoint.mode {
        ConnectionMode::Tcp => Ok(Transport::plain(tcp)),
        ConnectionMode::DirectTls => {
            let stream = upgrader.upgrade(Box::new(tcp), endpoint.tls_name()).await?;
            Ok(Transport::secure(stream))
        }
    }
}

/// Try candidates in order and keep the first that connects.
pub async fn connect_any(
    endpoints: &[XmppEndpoint],
    connect_timeout: Duration,
    upgrader: &dyn TlsUpgrader,
) -> Result<(XmppEndpoint, Transport)> {
    let mut last_error = Error::Resolve("no candidate endpoints".into());
    for (attempt, endpoint) in endpoints.iter().enumerate() {
        match connect_endpoint(endpoint, connect_timeout, upgrader).await {
            Ok(transport) => return Ok((endpoint.clone(), transport)),
            Err(e) => {
                info!(attempt = attempt + 1, total = endpoints.len(), host = %endpoint.host, error = %e, "Endpoint failed, trying next");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::test_util::PassthroughUpgrader;
    use tokio::net::TcpListener;

    fn direct(host: &str, port: u16, mode: ConnectionMode, domain: Option<&str>) -> ParsedServer {
        ParsedServer::Direct(XmppEndpoint {
            host: host.to_string(),
            port,
            mode,
            domain: domain.map(str::to_string),
        })
    }

    #[test]
    fn test_parse_server_input_forms() {
        use ConnectionMode::*;
        let cases = [
            ("tls://chat.example.com:5270", direct("chat.example.com", 5270, DirectTls, None)),
            ("tls://chat.example.com", direct("chat.example.com", 5223, DirectTls, None)),
            ("tcp://chat.example.com", direct("chat.example.com", 5222, Tcp, None)),
            ("chat.example.com:5223", direct("chat.example.com", 5223, DirectTls, None)),
            ("chat.example.com:5280", direct("chat.example.com", 5280, Tcp, None)),
            (
                "  tls://v6.mdosch.de?domain=diebesban.de ",
                direct("v6.mdosch.de", 5223, DirectTls, Some("diebesban.de")),
            ),
            (
                "tcp://v4.mdosch.de:5222?domain=diebesban.de",
                direct("v4.mdosch.de", 5222, Tcp, Some("diebesban.de")),
            ),
            ("  process-one.net ", ParsedServer::Domain("process-one.net".to_string())),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_server_input(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_split_domain_param_ignores_other_params() {
        assert_eq!(split_domain_param("host:5223?other=value"), ("host:5223", None));
    }

    #[test]
    fn test_tls_name_prefers_service_domain() {
        let ParsedServer::Direct(ep) = parse_server_input("tls://v6.mdosch.de?domain=diebesban.de")
        else {
            panic!("expected direct endpoint");
        };
        assert_eq!(ep.tls_name(), "diebesban.de");
        let ParsedServer::Direct(ep) = parse_server_input("chat.example.com:5222") else {
            panic!("expected direct endpoint");
        };
        assert_eq!(ep.tls_name(), "chat.example.com");
    }

    #[test]
    fn test_order_candidates_priority_then_weight() {
        let record = |priority, weight, target: &str| SrvCandidate {
            priority,
            weight,
            target: target.to_string(),
            port: 5222,
        };
        let ordered = order_candidates(
            vec![
                record(20, 0, "backup.example.com"),
                record(10, 5, "light.example.com"),
                record(10, 50, "heavy.example.com"),
                record(5, 0, ""),
            ],
            ConnectionMode::Tcp,
            "example.com",
        );
        let hosts: Vec<_> = ordered.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, ["heavy.example.com", "light.example.com", "backup.example.com"]);
        assert!(ordered.iter().all(|e| e.domain.as_deref() == Some("example.com")));
    }

    #[tokio::test]
    async fn test_explicit_server_skips_resolution() {
        let endpoints = candidates(Some("tcp://127.0.0.1:15222"), "example.com")
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, 15222);
    }

    #[tokio::test]
    async fn test_connect_any_falls_through_to_listening_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good_port = listener.local_addr().unwrap().port();
        // Bind then drop to get a port with nothing listening
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let endpoints = vec![
            XmppEndpoint {
                host: "127.0.0.1".into(),
                port: closed_port,
                mode: ConnectionMode::Tcp,
                domain: None,
            },
            XmppEndpoint {
                host: "127.0.0.1".into(),
                port: good_port,
                mode: ConnectionMode::Tcp,
                domain: None,
            },
        ];
        let (chosen, transport) =
            connect_any(&endpoints, Duration::from_secs(2), &PassthroughUpgrader)
                .await
                .unwrap();
        assert_eq!(chosen.port, good_port);
        assert!(!transport.is_secure());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_direct_tls_endpoint_starts_secure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let endpoint = XmppEndpoint {
            host: "127.0.0.1".into(),
            port,
            mode: ConnectionMode::DirectTls,
            domain: Some("example.com".into()),
        };
        let transport = connect_endpoint(&endpoint, Duration::from_secs(2), &PassthroughUpgrader)
            .await
            .unwrap();
        assert!(transport.is_secure());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_any_with_no_candidates() {
        let result = connect_any(&[], Duration::from_secs(1), &PassthroughUpgrader).await;
        assert!(matches!(result, Err(Error::Resolve(_))));
    }
}

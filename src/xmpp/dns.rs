//! XMPP server resolution: `--server` override parsing and SRV record lookup.
//!
//! Produces the single `XmppEndpoint` the probe connects to. SRV records are
//! ordered per RFC 2782 and only the best one is used: the probe never falls
//! back to a second endpoint.

use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use super::DEFAULT_CLIENT_PORT;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// TCP endpoint for the STARTTLS connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
}

impl XmppEndpoint {
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// What `--server` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Connect to this host and port as given.
    Direct(String, u16),
    /// Look up SRV records for this domain instead of the JID's.
    Domain(String),
}

/// Interpret `--server`. `tcp://host[:port]`, `host:port` and `[v6]:port`
/// name an endpoint directly (the scheme form defaults to port 5222); any
/// other value is a domain to resolve.
pub fn parse_server_input(server: &str) -> ParsedServer {
    let value = server.trim();
    match value.strip_prefix("tcp://") {
        Some(rest) => split_host_port(rest)
            .map(|(host, port)| ParsedServer::Direct(host, port))
            .unwrap_or_else(|| ParsedServer::Direct(rest.to_string(), DEFAULT_CLIENT_PORT)),
        None => split_host_port(value)
            .map(|(host, port)| ParsedServer::Direct(host, port))
            .unwrap_or_else(|| ParsedServer::Domain(value.to_string())),
    }
}

/// `host:port` with `rsplit_once` so bracketed IPv6 addresses keep their colons.
fn split_host_port(input: &str) -> Option<(String, u16)> {
    let (host, port_str) = input.rsplit_once(':')?;
    let port = port_str.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// One `_xmpp-client._tcp` answer, reduced to what ordering needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvCandidate {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target host without the trailing dot. Empty for a `.` target.
    pub target: String,
}

/// Best candidate per RFC 2782: lowest priority, then highest weight.
/// A `.` target means "no service here" and is never chosen.
pub fn pick_srv_target(mut candidates: Vec<SrvCandidate>) -> Option<XmppEndpoint> {
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.weight.cmp(&a.weight))
    });
    candidates
        .into_iter()
        .find(|c| !c.target.is_empty())
        .map(|c| XmppEndpoint {
            host: c.target,
            port: c.port,
        })
}

/// Resolve the client endpoint for `domain` (RFC 6120 section 3.2), falling
/// back to `domain:5222` when there is no usable SRV record.
pub async fn resolve_xmpp_server(domain: &str) -> XmppEndpoint {
    let started = std::time::Instant::now();
    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        warn!(error = %e, "No system DNS config, using default resolver");
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    });

    let srv_name = format!("_xmpp-client._tcp.{}", domain);
    debug!(srv = %srv_name, "SRV lookup");
    match resolver.srv_lookup(srv_name.as_str()).await {
        Ok(lookup) => {
            let candidates: Vec<SrvCandidate> = lookup
                .iter()
                .map(|r| SrvCandidate {
                    priority: r.priority(),
                    weight: r.weight(),
                    port: r.port(),
                    target: r.target().to_utf8().trim_end_matches('.').to_string(),
                })
                .collect();
            let count = candidates.len();
            if let Some(endpoint) = pick_srv_target(candidates) {
                info!(domain, host = %endpoint.host, port = endpoint.port,
                    candidates = count, resolve_ms = elapsed_ms(started), "SRV resolved");
                return endpoint;
            }
            info!(domain, candidates = count, "No usable SRV target");
        }
        Err(e) => {
            info!(domain, srv = %srv_name, lookup_ms = elapsed_ms(started), error = %e,
                "SRV lookup failed");
        }
    }

    let endpoint = XmppEndpoint {
        host: domain.to_string(),
        port: DEFAULT_CLIENT_PORT,
    };
    info!(domain, address = %endpoint.address(), "Using fallback endpoint");
    endpoint
}

//! Where to connect: the server-input syntax and SRV lookup (RFC 6120 §3.2).

use std::time::Instant;

use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::proto::rr::rdata::SRV;
use trust_dns_resolver::TokioAsyncResolver;

pub const DEFAULT_STARTTLS_PORT: u16 = 5222;
pub const DEFAULT_DIRECT_TLS_PORT: u16 = 5223;

/// SRV services in the order they are tried. XEP-0368 direct TLS first.
const SRV_SERVICES: [(&str, Security); 2] = [
    ("_xmpps-client._tcp", Security::DirectTls),
    ("_xmpp-client._tcp", Security::StartTls),
];

/// How the byte stream to an endpoint gets encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// Plaintext first; the negotiation may upgrade it.
    StartTls,
    DirectTls,
}

impl Security {
    fn for_port(port: u16) -> Self {
        if port == DEFAULT_DIRECT_TLS_PORT {
            Security::DirectTls
        } else {
            Security::StartTls
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub security: Security,
    /// Name to verify the certificate against when it is not `host`. An SRV
    /// target still presents a certificate for the XMPP domain (RFC 6120 §13.7.2).
    pub sni: Option<String>,
}

impl Endpoint {
    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.host)
    }
}

/// A parsed server override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget {
    Endpoint(Endpoint),
    /// RFC 7395 URL, used as is.
    WebSocket(String),
    /// Look the domain up in DNS.
    Srv(String),
}

impl ServerTarget {
    /// Accepted forms:
    ///
    /// | input                          | result                         |
    /// |--------------------------------|--------------------------------|
    /// | `tls://host[:port][?domain=d]` | direct TLS, port 5223          |
    /// | `tcp://host[:port][?domain=d]` | STARTTLS, port 5222            |
    /// | `ws://…`, `wss://…`            | WebSocket                      |
    /// | `host:port`                    | direct TLS on 5223, else STARTTLS |
    /// | anything else                  | SRV lookup                     |
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.starts_with("ws://") || input.starts_with("wss://") {
            return ServerTarget::WebSocket(input.to_string());
        }
        for (scheme, security, default_port) in [
            ("tls://", Security::DirectTls, DEFAULT_DIRECT_TLS_PORT),
            ("tcp://", Security::StartTls, DEFAULT_STARTTLS_PORT),
        ] {
            if let Some(rest) = input.strip_prefix(scheme) {
                let (authority, sni) = match rest.split_once('?') {
                    Some((authority, query)) => (authority, query.strip_prefix("domain=").map(str::to_string)),
                    None => (rest, None),
                };
                let (host, port) = host_and_port(authority).unwrap_or((authority, default_port));
                return ServerTarget::Endpoint(Endpoint {
                    host: host.to_string(),
                    port,
                    security,
                    sni,
                });
            }
        }
        match host_and_port(input) {
            Some((host, port)) => ServerTarget::Endpoint(Endpoint {
                host: host.to_string(),
                port,
                security: Security::for_port(port),
                sni: None,
            }),
            None => ServerTarget::Srv(input.to_string()),
        }
    }
}

/// Split at the last colon so bracketless IPv6 literals keep their colons.
fn host_and_port(authority: &str) -> Option<(&str, u16)> {
    let (host, port) = authority.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

/// Endpoints for the records of one service, best first: lowest priority,
/// then highest weight. A lone `.` target means "not offered here".
fn endpoints_from_srv(mut records: Vec<&SRV>, domain: &str, security: Security) -> Vec<Endpoint> {
    records.sort_by(|a, b| a.priority().cmp(&b.priority()).then(b.weight().cmp(&a.weight())));
    records
        .into_iter()
        .filter_map(|record| {
            let host = record.target().to_utf8();
            let host = host.trim_end_matches('.');
            if host.is_empty() {
                debug!(domain, security = ?security, "SRV says service unavailable");
                return None;
            }
            Some(Endpoint {
                host: host.to_string(),
                port: record.port(),
                security,
                sni: Some(domain.to_string()),
            })
        })
        .collect()
}

/// Every endpoint worth trying for `domain`, in order. Falls back to
/// `domain:5222` only when DNS has no SRV records at all.
pub async fn resolve(domain: &str) -> Vec<Endpoint> {
    let started = Instant::now();
    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        warn!(error = %e, "No usable system DNS configuration, using defaults");
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    });

    let mut endpoints = Vec::new();
    for (service, security) in SRV_SERVICES {
        let name = format!("{}.{}", service, domain);
        match resolver.srv_lookup(name.as_str()).await {
            Ok(lookup) => {
                let found = endpoints_from_srv(lookup.iter().collect(), domain, security);
                for endpoint in &found {
                    debug!(domain, host = %endpoint.host, port = endpoint.port, security = ?security, "SRV endpoint");
                }
                endpoints.extend(found);
            }
            Err(e) => debug!(domain, srv = %name, error = %e, "SRV lookup returned nothing"),
        }
    }

    let lookup_ms = started.elapsed().as_millis() as u64;
    if endpoints.is_empty() {
        warn!(domain, lookup_ms, "No SRV records, falling back to port {}", DEFAULT_STARTTLS_PORT);
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: DEFAULT_STARTTLS_PORT,
            security: Security::StartTls,
            sni: None,
        });
    } else {
        info!(domain, count = endpoints.len(), lookup_ms, "Resolved XMPP endpoints");
    }
    endpoints
}

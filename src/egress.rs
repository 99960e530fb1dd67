//! Egress configuration: how the gateway reaches a backend.
//!
//! Egress kinds form a closed set. Configuration strings are turned into an
//! [`EgressConfig`] once, at load time, so the request path never sees an
//! unknown kind.

use crate::error::GatewayError;
use base64::{Engine as _, engine::general_purpose};
use percent_encoding::percent_decode_str;
use std::fmt;
use url::Url;

const HTTP_PROXY_DEFAULT_PORT: u16 = 80;
const HTTPS_PROXY_DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EgressKind {
    Direct,
    Http,
    Socks5,
}

impl EgressKind {
    /// Maps the configuration `type` field. Only `http` and `socks5` name a proxy.
    pub fn from_type_name(name: &str) -> Result<Self, GatewayError> {
        match name {
            "http" => Ok(EgressKind::Http),
            "socks5" => Ok(EgressKind::Socks5),
            other => Err(GatewayError::Config(format!(
                "unsupported proxy type '{}' (expected 'http' or 'socks5')",
                other
            ))),
        }
    }
}

impl fmt::Display for EgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressKind::Direct => write!(f, "direct"),
            EgressKind::Http => write!(f, "http"),
            EgressKind::Socks5 => write!(f, "socks5"),
        }
    }
}

/// HTTP forward/CONNECT proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpProxy {
    /// Proxy URL with any password masked, for logs.
    pub display: String,
    pub host: String,
    pub port: u16,
    /// The proxy itself is reached over TLS (`https://` URL).
    pub tls: bool,
    /// Pre-computed `Proxy-Authorization` value from the URL's userinfo.
    pub authorization: Option<String>,
}

/// Anonymous SOCKS5 endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Socks5Proxy {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EgressConfig {
    Direct,
    HttpProxy(HttpProxy),
    Socks5(Socks5Proxy),
}

static DIRECT: EgressConfig = EgressConfig::Direct;

impl EgressConfig {
    /// Builds a proxy egress from a configuration `type` and address.
    pub fn from_settings(type_name: &str, address: &str) -> Result<Self, GatewayError> {
        if address.is_empty() {
            return Err(GatewayError::Config(format!(
                "proxy of type '{}' requires a non-empty address",
                type_name
            )));
        }
        match EgressKind::from_type_name(type_name)? {
            EgressKind::Http => Self::http_proxy(address),
            EgressKind::Socks5 => Self::socks5(address),
            EgressKind::Direct => Ok(EgressConfig::Direct),
        }
    }

    pub fn http_proxy(address: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: &str| {
            GatewayError::Config(format!(
                "invalid HTTP proxy address '{}': {}",
                mask_password(address),
                reason
            ))
        };

        let mut url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        let (tls, default_port) = match url.scheme() {
            "http" => (false, HTTP_PROXY_DEFAULT_PORT),
            "https" => (true, HTTPS_PROXY_DEFAULT_PORT),
            _ => return Err(invalid("expected an http:// or https:// proxy URL")),
        };
        let host = match url.host() {
            Some(url::Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("missing host")),
        };
        let port = url.port().unwrap_or(default_port);

        let authorization = if url.username().is_empty() {
            None
        } else {
            let username = percent_decode_str(url.username()).decode_utf8_lossy().into_owned();
            let password = url
                .password()
                .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned())
                .unwrap_or_default();
            let credentials = format!("{}:{}", username, password);
            Some(format!("Basic {}", general_purpose::STANDARD.encode(credentials.as_bytes())))
        };
        if url.password().is_some() {
            // Url::set_password only fails for cannot-be-a-base URLs, ruled out above.
            let _ = url.set_password(Some("****"));
        }

        Ok(EgressConfig::HttpProxy(HttpProxy {
            display: url.to_string(),
            host,
            port,
            tls,
            authorization,
        }))
    }

    pub fn socks5(address: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: &str| {
            GatewayError::Config(format!("invalid SOCKS5 proxy address '{}': {}", address, reason))
        };

        let authority = address
            .strip_prefix("socks5://")
            .or_else(|| address.strip_prefix("socks5h://"))
            .unwrap_or(address)
            .trim_end_matches('/');

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number in 1-65535"))?;
        if port == 0 {
            return Err(invalid("port must be greater than 0"));
        }

        // IPv6 literals must be bracketed, otherwise the port split is ambiguous.
        let host = if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            inner.parse::<std::net::Ipv6Addr>().map_err(|_| invalid("invalid IPv6 host"))?;
            inner
        } else if host.contains([':', '/', '@', '[', ']']) {
            return Err(invalid("malformed host"));
        } else {
            host
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(EgressConfig::Socks5(Socks5Proxy {
            host: host.to_string(),
            port,
        }))
    }

    pub fn kind(&self) -> EgressKind {
        match self {
            EgressConfig::Direct => EgressKind::Direct,
            EgressConfig::HttpProxy(_) => EgressKind::Http,
            EgressConfig::Socks5(_) => EgressKind::Socks5,
        }
    }

    /// Endpoint description for logs; never contains a password.
    pub fn address(&self) -> String {
        match self {
            EgressConfig::Direct => "-".to_string(),
            EgressConfig::HttpProxy(proxy) => proxy.display.clone(),
            EgressConfig::Socks5(proxy) => format_host_port(&proxy.host, proxy.port),
        }
    }
}

impl fmt::Display for EgressConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressConfig::Direct => write!(f, "direct"),
            other => write!(f, "{} via {}", other.kind(), other.address()),
        }
    }
}

/// Route-level egress wins, then the global one, then a direct connection.
pub fn resolve<'a>(route: Option<&'a EgressConfig>, global: Option<&'a EgressConfig>) -> &'a EgressConfig {
    route.or(global).unwrap_or(&DIRECT)
}

pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn mask_password(address: &str) -> String {
    match Url::parse(address) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => address.to_string(),
    }
}

use crate::common::{ProxyBody, ResponseBuilder};
use crate::config_validation::GatewayConfig;
use crate::egress::{self, EgressConfig};
use crate::error::GatewayError;
use crate::routing::parse_target_uri;
use crate::security_headers;
use crate::transport::TransportFactory;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHORIZATION, TE, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::time::timeout;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// Connection-scoped headers that must not cross the gateway in either direction.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything resolved about one routed request before it is forwarded.
#[derive(Debug)]
pub struct ForwardContext<'a> {
    pub request_id: u64,
    pub client_addr: SocketAddr,
    pub prefix: &'a str,
    pub remainder: String,
    pub target_url: String,
    pub egress: &'a EgressConfig,
}

impl fmt::Display for ForwardContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (prefix {}, egress {})", self.target_url, self.prefix, self.egress)
    }
}

pub struct ReverseProxy {
    config: Arc<GatewayConfig>,
    transports: TransportFactory,
    next_request_id: AtomicU64,
}

impl ReverseProxy {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self {
            config,
            transports: TransportFactory::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        match req.uri().path() {
            "/" | "/index.html" => return Ok(ResponseBuilder::index()),
            "/robots.txt" => return Ok(ResponseBuilder::robots()),
            _ => {}
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let method = req.method().clone();
        let uri = req.uri().clone();

        let ctx = match self.resolve(request_id, &uri, client_addr) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("[{}] {} {} from {}: {}", request_id, method, uri.path(), client_addr, e);
                return Ok(ResponseBuilder::from_error(&e));
            }
        };

        info!("[{}] {} {} -> {}", request_id, method, uri.path(), ctx);
        debug!("[{}] remainder '{}', client {}", request_id, ctx.remainder, ctx.client_addr);

        let start = Instant::now();
        match self.forward(&ctx, req).await {
            Ok(response) => {
                info!(
                    "[{}] {} {} <- {} in {:?}",
                    request_id,
                    method,
                    uri.path(),
                    response.status(),
                    start.elapsed()
                );
                Ok(response)
            }
            Err(e) => {
                if let GatewayError::TransportConstruction(_) = e {
                    error!(
                        "[{}] egress {} passed startup validation but has no usable transport",
                        request_id, ctx.egress
                    );
                }
                error!(
                    "[{}] {} {} -> {} failed after {:?}: {}",
                    request_id,
                    method,
                    uri.path(),
                    ctx,
                    start.elapsed(),
                    e
                );
                Ok(ResponseBuilder::from_error(&e))
            }
        }
    }

    /// Matches the path and decides the target URL and egress.
    pub fn resolve<'a>(
        &'a self,
        request_id: u64,
        uri: &Uri,
        client_addr: SocketAddr,
    ) -> Result<ForwardContext<'a>, GatewayError> {
        let path = uri.path();
        let matched = self
            .config
            .routes
            .match_path(path)
            .ok_or_else(|| GatewayError::RouteNotFound(path.to_string()))?;

        let route = matched.route;
        let egress = egress::resolve(route.egress.as_ref(), self.config.global_egress.as_ref());

        Ok(ForwardContext {
            request_id,
            client_addr,
            prefix: &route.prefix,
            remainder: matched.remainder.to_string(),
            target_url: matched.target_url(uri.query()),
            egress,
        })
    }

    async fn forward(&self, ctx: &ForwardContext<'_>, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, GatewayError> {
        let target = parse_target_uri(&ctx.target_url)?;
        let transport = self.transports.transport_for(ctx.egress)?;
        let client_upgrade = upgrade_protocol(req.headers())
            .is_some()
            .then(|| hyper::upgrade::on(&mut req));
        let outbound = modify_request(req, target, ctx)?;

        let pending = transport.request(outbound);
        let result = match self.config.upstream_timeout {
            Some(limit) => timeout(limit, pending)
                .await
                .map_err(|_| GatewayError::Timeout(limit.as_secs()))?,
            None => pending.await,
        };
        let response = result.map_err(|e| GatewayError::Upstream(describe_client_error(&e)))?;

        match client_upgrade {
            Some(client_upgrade) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                Ok(switch_protocols(ctx, client_upgrade, response))
            }
            _ => Ok(modify_response(response)),
        }
    }
}

/// Relays a `101 Switching Protocols` to the client and splices the two
/// upgraded connections together once both sides have switched.
fn switch_protocols(ctx: &ForwardContext<'_>, client: OnUpgrade, mut response: Response<Incoming>) -> Response<ProxyBody> {
    let protocol = response.headers().get(UPGRADE).cloned();
    let upstream = hyper::upgrade::on(&mut response);
    let request_id = ctx.request_id;
    let target = ctx.target_url.clone();

    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("[{}] upgrade to {} failed: {}", request_id, target, e);
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => debug!(
                "[{}] upgraded connection to {} closed: {} bytes sent, {} bytes received",
                request_id, target, sent, received
            ),
            Err(e) => debug!("[{}] upgraded connection to {} ended: {}", request_id, target, e),
        }
    });

    let mut response = modify_response(response);
    if let Some(protocol) = protocol {
        set_upgrade_headers(response.headers_mut(), protocol);
    }
    response
}

/// Rewrites the inbound request into the one sent upstream. Method, headers
/// and body carry over; the URI, `Host` and `X-Forwarded-For` are replaced.
pub fn modify_request<B>(req: Request<B>, target: Uri, ctx: &ForwardContext<'_>) -> Result<Request<B>, GatewayError> {
    let (mut parts, body) = req.into_parts();

    let wants_trailers = header_has_token(&parts.headers, &TE, "trailers");
    let upgrade = upgrade_protocol(&parts.headers);
    remove_hop_by_hop_headers(&mut parts.headers);
    if wants_trailers {
        parts.headers.insert(TE, HeaderValue::from_static("trailers"));
    }
    if let Some(protocol) = upgrade {
        set_upgrade_headers(&mut parts.headers, protocol);
    }

    let host = match (target.host(), target.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    let host = HeaderValue::from_str(&host).map_err(|e| GatewayError::TargetUrl {
        url: ctx.target_url.clone(),
        reason: e.to_string(),
    })?;
    parts.headers.insert(HOST, host);

    append_forwarded_for(&mut parts.headers, ctx.client_addr);

    if let EgressConfig::HttpProxy(proxy) = ctx.egress {
        if target.scheme_str() == Some("http") {
            if let Some(auth) = &proxy.authorization {
                let value = HeaderValue::from_str(auth)
                    .map_err(|e| GatewayError::TransportConstruction(format!("proxy credentials: {}", e)))?;
                parts.headers.insert(PROXY_AUTHORIZATION, value);
            }
        }
    }

    parts.uri = target;
    parts.version = Version::HTTP_11;
    Ok(Request::from_parts(parts, body))
}

/// Strips hop-by-hop headers and stamps the security headers on a backend
/// response. The body is passed through as a stream.
pub fn modify_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    remove_hop_by_hop_headers(&mut parts.headers);
    security_headers::apply(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too.
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// The requested protocol when `headers` ask for a connection upgrade.
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    if header_has_token(headers, &CONNECTION, "upgrade") {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn set_upgrade_headers(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, protocol);
}

fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}

fn describe_client_error(err: &hyper_util::client::legacy::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

//! Outbound transports, one per distinct egress.
//!
//! A [`Transport`] owns a pooled hyper client whose connector dials through
//! the egress it was built for. Transports are built lazily and cached by the
//! [`TransportFactory`], so every route sharing an egress also shares its
//! connection pool.

use crate::egress::{EgressConfig, HttpProxy, format_host_port};
use crate::error::GatewayError;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Request, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::{Client, ResponseFuture};
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::debug;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsConnector, TlsStream};
use tokio_socks::tcp::Socks5Stream;
use tower::Service;

const POOL_MAX_IDLE_PER_HOST: usize = 10;
// Upper bound on the header block of a CONNECT reply
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

pub type HttpClient = Client<HttpsConnector<EgressConnector>, Incoming>;

/// Connection to a backend, or to the HTTP proxy standing in front of it.
pub struct EgressStream {
    inner: EgressIo,
    // Requests on this stream are sent to an HTTP proxy in absolute form.
    forward_proxied: bool,
}

enum EgressIo {
    Plain(TokioIo<TcpStream>),
    // TLS to an https:// proxy
    Tls(TokioIo<TlsStream<TcpStream>>),
}

impl EgressStream {
    fn plain(stream: TcpStream, forward_proxied: bool) -> Self {
        Self {
            inner: EgressIo::Plain(TokioIo::new(stream)),
            forward_proxied,
        }
    }

    fn tls(stream: TlsStream<TcpStream>, forward_proxied: bool) -> Self {
        Self {
            inner: EgressIo::Tls(TokioIo::new(stream)),
            forward_proxied,
        }
    }
}

impl Read for EgressStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: ReadBufCursor<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            EgressIo::Plain(io) => Pin::new(io).poll_read(cx, buf),
            EgressIo::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl Write for EgressStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            EgressIo::Plain(io) => Pin::new(io).poll_write(cx, buf),
            EgressIo::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            EgressIo::Plain(io) => Pin::new(io).poll_flush(cx),
            EgressIo::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            EgressIo::Plain(io) => Pin::new(io).poll_shutdown(cx),
            EgressIo::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.inner {
            EgressIo::Plain(io) => io.is_write_vectored(),
            EgressIo::Tls(io) => io.is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            EgressIo::Plain(io) => Pin::new(io).poll_write_vectored(cx, bufs),
            EgressIo::Tls(io) => Pin::new(io).poll_write_vectored(cx, bufs),
        }
    }
}

impl Connection for EgressStream {
    fn connected(&self) -> Connected {
        let connected = match &self.inner {
            EgressIo::Plain(io) => io.inner().connected(),
            EgressIo::Tls(io) => io.inner().get_ref().get_ref().get_ref().connected(),
        };
        connected.proxy(self.forward_proxied)
    }
}

/// Connector that reaches the destination URI through one egress.
#[derive(Clone)]
pub struct EgressConnector {
    egress: Arc<EgressConfig>,
    // Set when the egress is an https:// proxy.
    proxy_tls: Option<TlsConnector>,
}

impl EgressConnector {
    pub fn new(egress: EgressConfig) -> Result<Self, GatewayError> {
        let proxy_tls = match &egress {
            EgressConfig::HttpProxy(proxy) if proxy.tls => {
                let connector = native_tls::TlsConnector::new().map_err(|e| {
                    GatewayError::TransportConstruction(format!("TLS for proxy {}: {}", proxy.display, e))
                })?;
                Some(TlsConnector::from(connector))
            }
            _ => None,
        };
        Ok(Self {
            egress: Arc::new(egress),
            proxy_tls,
        })
    }
}

impl Service<Uri> for EgressConnector {
    type Response = EgressStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<EgressStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let egress = self.egress.clone();
        let proxy_tls = self.proxy_tls.clone();
        Box::pin(async move { dial(&egress, proxy_tls.as_ref(), &dst).await })
    }
}

async fn dial(egress: &EgressConfig, proxy_tls: Option<&TlsConnector>, dst: &Uri) -> io::Result<EgressStream> {
    let (host, port) = destination(dst)?;
    // https targets are tunnelled with CONNECT, http ones sent in absolute form.
    let tunnel = dst.scheme_str() == Some("https");

    match egress {
        EgressConfig::Direct => Ok(EgressStream::plain(connect_tcp(&host, port).await?, false)),
        EgressConfig::HttpProxy(proxy) => {
            let stream = connect_tcp(&proxy.host, proxy.port).await?;
            match proxy_tls {
                Some(connector) if proxy.tls => {
                    let mut stream = connector.connect(&proxy.host, stream).await.map_err(|e| {
                        io::Error::other(format!("TLS handshake with proxy {}: {}", proxy.display, e))
                    })?;
                    if tunnel {
                        connect_tunnel(&mut stream, proxy, &host, port).await?;
                    }
                    Ok(EgressStream::tls(stream, !tunnel))
                }
                _ if proxy.tls => Err(io::Error::other(format!(
                    "proxy {} requires TLS but no TLS connector was built",
                    proxy.display
                ))),
                _ => {
                    let mut stream = stream;
                    if tunnel {
                        connect_tunnel(&mut stream, proxy, &host, port).await?;
                    }
                    Ok(EgressStream::plain(stream, !tunnel))
                }
            }
        }
        EgressConfig::Socks5(proxy) => {
            let socket = connect_tcp(&proxy.host, proxy.port).await?;
            let stream = Socks5Stream::connect_with_socket(socket, format_host_port(&host, port))
                .await
                .map_err(|e| io::Error::other(format!("SOCKS5 proxy {}: {}", egress.address(), e)))?;
            Ok(EgressStream::plain(stream.into_inner(), false))
        }
    }
}

fn destination(dst: &Uri) -> io::Result<(String, u16)> {
    let host = dst
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("destination {} has no host", dst)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = dst
        .port_u16()
        .unwrap_or(if dst.scheme_str() == Some("https") { 443 } else { 80 });
    Ok((host, port))
}

async fn connect_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Opens a CONNECT tunnel to `host:port` through an HTTP proxy.
async fn connect_tunnel<S>(stream: &mut S, proxy: &HttpProxy, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format_host_port(host, port);
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if let Some(auth) = &proxy.authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 1024];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("proxy {} sent an oversized CONNECT response", proxy.display),
            ));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("proxy {} closed the connection during CONNECT", proxy.display),
            ));
        }
        response.extend_from_slice(&buf[..n]);
    }

    let response = String::from_utf8_lossy(&response);
    let status_line = response.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if !status.starts_with('2') {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("proxy {} rejected CONNECT to {}: {}", proxy.display, authority, status_line),
        ));
    }
    Ok(())
}

/// Pooled client bound to one egress.
#[derive(Clone)]
pub struct Transport {
    client: HttpClient,
    egress: Arc<EgressConfig>,
}

impl Transport {
    pub fn new(egress: &EgressConfig) -> Result<Self, GatewayError> {
        match egress {
            EgressConfig::Direct => {}
            EgressConfig::HttpProxy(proxy) => check_endpoint(egress, &proxy.host, proxy.port)?,
            EgressConfig::Socks5(proxy) => check_endpoint(egress, &proxy.host, proxy.port)?,
        }

        let connector = EgressConnector::new(egress.clone())?;
        let https = HttpsConnector::new_with_connector(connector);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(https);

        Ok(Self {
            client,
            egress: Arc::new(egress.clone()),
        })
    }

    pub fn egress(&self) -> &EgressConfig {
        &self.egress
    }

    /// Sends `req`, whose URI must be absolute. The body is streamed as it arrives.
    pub fn request(&self, req: Request<Incoming>) -> ResponseFuture {
        self.client.request(req)
    }
}

fn check_endpoint(egress: &EgressConfig, host: &str, port: u16) -> Result<(), GatewayError> {
    if host.is_empty() || port == 0 {
        return Err(GatewayError::TransportConstruction(format!(
            "{} egress has an unusable endpoint '{}'",
            egress.kind(),
            egress.address()
        )));
    }
    Ok(())
}

/// Lazily built, shared transports keyed by egress.
#[derive(Default)]
pub struct TransportFactory {
    cache: DashMap<EgressConfig, Transport>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport_for(&self, egress: &EgressConfig) -> Result<Transport, GatewayError> {
        if let Some(transport) = self.cache.get(egress) {
            return Ok(transport.value().clone());
        }

        let built = Transport::new(egress)?;
        // Concurrent first requests may both build; the first insert wins.
        let transport = self.cache.entry(egress.clone()).or_insert(built).value().clone();
        debug!("Transport ready for egress {}", egress);
        Ok(transport)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

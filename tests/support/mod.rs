//! Mock backends, proxies and a gateway launcher shared by the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HeaderMap, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use prefix_gateway::config::{Config, ListenPort, ProxyConfig, TargetConfig};
use prefix_gateway::{Gateway, GatewayConfig};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A request as observed by a mock server.
#[derive(Debug)]
pub struct Seen {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Starts an HTTP server that records every request and answers with
/// `reply`, plus a permissive `X-Frame-Options` the gateway must overwrite.
pub async fn spawn_recording_server(reply: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                        let _ = tx.send(Seen {
                            method: parts.method,
                            uri: parts.uri.to_string(),
                            headers: parts.headers,
                            body,
                        });
                        let response = Response::builder()
                            .status(StatusCode::OK)
                            .header("x-frame-options", "ALLOWALL")
                            .header("x-backend", "yes")
                            .body(Full::new(Bytes::from(reply)))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });

    (addr, rx)
}

/// An HTTP server that accepts every upgrade request with `101` and then
/// echoes all bytes written on the upgraded connection.
pub async fn spawn_upgrade_echo_server() -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |mut req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let on_upgrade = hyper::upgrade::on(&mut req);
                        let protocol = req.headers().get(UPGRADE).cloned();
                        let _ = tx.send(Seen {
                            method: req.method().clone(),
                            uri: req.uri().to_string(),
                            headers: req.headers().clone(),
                            body: Bytes::new(),
                        });

                        tokio::spawn(async move {
                            let Ok(upgraded) = on_upgrade.await else {
                                return;
                            };
                            let mut io = TokioIo::new(upgraded);
                            let mut buf = [0u8; 1024];
                            loop {
                                match io.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if io.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });

                        let mut response = Response::builder()
                            .status(StatusCode::SWITCHING_PROTOCOLS)
                            .header(CONNECTION, "upgrade");
                        if let Some(protocol) = protocol {
                            response = response.header(UPGRADE, protocol);
                        }
                        Ok::<_, Infallible>(response.body(Full::new(Bytes::new())).unwrap())
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    (addr, rx)
}

/// Reads an HTTP response head, up to and including the blank line.
pub async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

/// A minimal SOCKS5 server (no authentication, CONNECT only) that reports
/// each requested destination and then relays bytes to it.
pub async fn spawn_socks5_server() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                client.read_exact(&mut greeting).await.unwrap();
                assert_eq!(greeting[0], 5);
                let mut methods = vec![0u8; greeting[1] as usize];
                client.read_exact(&mut methods).await.unwrap();
                client.write_all(&[5, 0]).await.unwrap();

                let mut head = [0u8; 4];
                client.read_exact(&mut head).await.unwrap();
                assert_eq!(head[1], 1, "only CONNECT is supported");
                let host = match head[3] {
                    1 => {
                        let mut ip = [0u8; 4];
                        client.read_exact(&mut ip).await.unwrap();
                        std::net::Ipv4Addr::from(ip).to_string()
                    }
                    3 => {
                        let len = client.read_u8().await.unwrap();
                        let mut name = vec![0u8; len as usize];
                        client.read_exact(&mut name).await.unwrap();
                        String::from_utf8(name).unwrap()
                    }
                    4 => {
                        let mut ip = [0u8; 16];
                        client.read_exact(&mut ip).await.unwrap();
                        format!("[{}]", std::net::Ipv6Addr::from(ip))
                    }
                    other => panic!("unknown address type {}", other),
                };
                let port = client.read_u16().await.unwrap();
                let destination = format!("{}:{}", host, port);
                let _ = tx.send(destination.clone());

                let Ok(mut upstream) = TcpStream::connect(destination.as_str()).await else {
                    // Host unreachable
                    let _ = client.write_all(&[5, 4, 0, 1, 0, 0, 0, 0, 0, 0]).await;
                    return;
                };
                client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
                let _ = copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });

    (addr, rx)
}

/// A port nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn mapping(prefix: &str, target: &str) -> (String, TargetConfig) {
    (prefix.to_string(), TargetConfig::Url(target.to_string()))
}

pub fn mapping_via(prefix: &str, target: &str, proxy: ProxyConfig) -> (String, TargetConfig) {
    (
        prefix.to_string(),
        TargetConfig::Detailed {
            target_url: target.to_string(),
            proxy: Some(proxy),
        },
    )
}

pub fn config(mappings: Vec<(String, TargetConfig)>, global: Option<ProxyConfig>) -> Config {
    Config {
        port: Some(ListenPort::Number(0)),
        api_mapping: mappings.into_iter().collect(),
        proxy: global,
        ..Config::default()
    }
}

/// Validates `config` and serves it on an ephemeral loopback port.
pub async fn start_gateway(config: Config) -> SocketAddr {
    let gateway = Gateway::new(GatewayConfig::from_config(&config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(gateway.serve(listener));
    addr
}

pub fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

pub async fn send(
    method: Method,
    gateway: SocketAddr,
    path: &str,
    body: &'static str,
) -> (StatusCode, HeaderMap, String) {
    let req = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", gateway, path))
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    let response = client().request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, String::from_utf8_lossy(&body).into_owned())
}

pub async fn get(gateway: SocketAddr, path: &str) -> (StatusCode, HeaderMap, String) {
    send(Method::GET, gateway, path, "").await
}

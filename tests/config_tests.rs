//! Loading and validating configuration files from disk.

use prefix_gateway::config::{Config, DEFAULT_CONFIG_FILE, LogFormat};
use prefix_gateway::egress::EgressKind;
use prefix_gateway::{GatewayConfig, GatewayError};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_short_form_mapping() {
    let file = write_config(
        r#"{
            "port": "8080",
            "api_mapping": {
                "/api/": "http://127.0.0.1:3000/",
                "/ext/": "https://api.example.com/v1/"
            },
            "proxy": { "type": "socks5", "address": "127.0.0.1:1080" }
        }"#,
    );

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    let gateway = GatewayConfig::from_config(&config).unwrap();
    assert_eq!(gateway.listen_port, 8080);
    assert_eq!(gateway.routes.len(), 2);
    assert_eq!(gateway.global_egress.unwrap().kind(), EgressKind::Socks5);
}

#[test]
fn test_bad_socks5_address_fails_startup() {
    let file = write_config(
        r#"{
            "port": 8080,
            "api_mapping": {
                "/tor/": { "target_url": "http://hidden/", "proxy": { "type": "socks5", "address": "nowhere" } }
            }
        }"#,
    );

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    let err = GatewayConfig::from_config(&config).unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
    assert!(err.to_string().contains("SOCKS5"));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(DEFAULT_CONFIG_FILE);
    let err = Config::from_file(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, GatewayError::Io(_)));
}

#[test]
fn test_generated_sample_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.json");
    let path = path.to_str().unwrap();

    Config::sample().to_file(path).unwrap();
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.logging.as_ref().unwrap().format, Some(LogFormat::Text));
    let gateway = GatewayConfig::from_config(&config).unwrap();

    assert_eq!(gateway.global_egress.unwrap().kind(), EgressKind::Http);
    assert_eq!(
        gateway.routes.get("/api/v2/").unwrap().egress.as_ref().unwrap().kind(),
        EgressKind::Socks5
    );
}

#[test]
fn test_timeout_and_logging_sections() {
    let file = write_config(
        r#"{
            "port": ":9000",
            "api_mapping": { "/a/": "http://a/" },
            "upstream_timeout_secs": 15,
            "logging": { "level": "debug", "format": "json" }
        }"#,
    );

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.logging.as_ref().unwrap().format, Some(LogFormat::Json));
    let gateway = GatewayConfig::from_config(&config).unwrap();
    assert_eq!(gateway.listen_port, 9000);
    assert_eq!(gateway.upstream_timeout, Some(std::time::Duration::from_secs(15)));
}

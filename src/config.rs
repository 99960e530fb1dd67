use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CONFIG_FILE: &str = "api.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

/// `port` may be written as `8080` or `"8080"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListenPort {
    Number(u16),
    Text(String),
}

impl ListenPort {
    pub fn parse(&self) -> Result<u16, GatewayError> {
        match self {
            ListenPort::Number(port) => Ok(*port),
            ListenPort::Text(text) => text
                .trim()
                .trim_start_matches(':')
                .parse()
                .map_err(|_| GatewayError::Config(format!("invalid listen port '{}'", text))),
        }
    }
}

/// Egress proxy descriptor as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type", default)]
    pub proxy_type: String,
    // Preferred field for the proxy address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    // Legacy alias, used only when `address` is missing or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ProxyConfig {
    pub fn new(proxy_type: &str, address: &str) -> Self {
        Self {
            proxy_type: proxy_type.to_string(),
            address: Some(address.to_string()),
            url: None,
        }
    }

    pub fn get_address(&self) -> &str {
        match self.address.as_deref() {
            Some(address) if !address.is_empty() => address,
            _ => self.url.as_deref().unwrap_or(""),
        }
    }
}

/// An `api_mapping` value: either a bare target URL (the short form)
/// or an object carrying the target and an optional per-route proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetConfig {
    Url(String),
    Detailed {
        #[serde(default)]
        target_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proxy: Option<ProxyConfig>,
    },
}

impl TargetConfig {
    pub fn target_url(&self) -> &str {
        match self {
            TargetConfig::Url(url) => url,
            TargetConfig::Detailed { target_url, .. } => target_url,
        }
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        match self {
            TargetConfig::Url(_) => None,
            TargetConfig::Detailed { proxy, .. } => proxy.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub port: Option<ListenPort>,
    #[serde(default)]
    pub api_mapping: BTreeMap<String, TargetConfig>,
    // Global egress proxy, used by routes without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    // Opt-in bound from dispatch until upstream response headers arrive.
    // Covers dialing, proxy handshakes and the upstream's time to first byte.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, GatewayError> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), GatewayError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Configuration written by `--generate-config`.
    pub fn sample() -> Self {
        let mut api_mapping = BTreeMap::new();
        api_mapping.insert(
            "/api/".to_string(),
            TargetConfig::Url("http://127.0.0.1:3000/".to_string()),
        );
        api_mapping.insert(
            "/api/v2/".to_string(),
            TargetConfig::Detailed {
                target_url: "https://api.example.com/v2/".to_string(),
                proxy: Some(ProxyConfig::new("socks5", "127.0.0.1:1080")),
            },
        );

        Self {
            port: Some(ListenPort::Text("8080".to_string())),
            api_mapping,
            proxy: Some(ProxyConfig::new("http", "http://127.0.0.1:3128")),
            upstream_timeout_secs: None,
            logging: Some(LoggingConfig {
                level: Some(LogLevel::Info),
                format: Some(LogFormat::Text),
            }),
        }
    }
}

//! Startup validation of the gateway configuration.
//!
//! Every problem in the document is collected before failing, so an operator
//! sees all of them at once. The output of a successful validation is a
//! [`GatewayConfig`], the only configuration type the server accepts.

use crate::config::{Config, ProxyConfig};
use crate::egress::EgressConfig;
use crate::error::GatewayError;
use crate::routing::{Route, RouteTable};
use log::warn;
use std::time::Duration;
use url::Url;

/// Comprehensive validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

/// Immutable, validated configuration handed to the server.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_port: u16,
    pub routes: RouteTable,
    pub global_egress: Option<EgressConfig>,
    pub upstream_timeout: Option<Duration>,
}

impl GatewayConfig {
    /// Validates `config`, logging warnings and failing with every error found.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let (result, gateway) = validate_config(config);
        for warning in &result.warnings {
            warn!("Configuration warning: {}", warning);
        }
        match gateway {
            Some(gateway) if result.is_valid => Ok(gateway),
            _ => Err(GatewayError::Config(result.errors.join("; "))),
        }
    }
}

/// Validates the whole document. The gateway config is only produced when no
/// error was found.
pub fn validate_config(config: &Config) -> (ValidationResult, Option<GatewayConfig>) {
    let mut result = ValidationResult::success();

    let listen_port = match &config.port {
        Some(port) => match port.parse() {
            Ok(port) => Some(port),
            Err(e) => {
                result.add_error(e.to_string());
                None
            }
        },
        None => {
            result.add_error("listen port is not set".to_string());
            None
        }
    };

    let global_egress = config
        .proxy
        .as_ref()
        .and_then(|proxy| validate_proxy(proxy, "global proxy", &mut result));

    if config.api_mapping.is_empty() {
        result.add_warning("api_mapping is empty; every routed request will return 404".to_string());
    }

    let mut routes = Vec::with_capacity(config.api_mapping.len());
    for (prefix, target) in &config.api_mapping {
        let target_url = target.target_url();
        if prefix.is_empty() || target_url.is_empty() {
            result.add_error(format!(
                "invalid mapping: prefix '{}' and target URL '{}' must both be non-empty",
                prefix, target_url
            ));
            continue;
        }
        if !prefix.starts_with('/') {
            result.add_warning(format!(
                "prefix '{}' does not start with '/' and will never match a request path",
                prefix
            ));
        }
        validate_target_url(prefix, target_url, &mut result);

        let mut route = Route::new(prefix.as_str(), target_url);
        if let Some(proxy) = target.proxy() {
            match validate_proxy(proxy, &format!("proxy for prefix {}", prefix), &mut result) {
                Some(egress) => route = route.with_egress(egress),
                None => continue,
            }
        }
        routes.push(route);
    }

    if !result.is_valid {
        return (result, None);
    }

    let routes = match RouteTable::new(routes) {
        Ok(routes) => routes,
        Err(e) => {
            result.add_error(e.to_string());
            return (result, None);
        }
    };

    let gateway = listen_port.map(|listen_port| GatewayConfig {
        listen_port,
        routes,
        global_egress,
        upstream_timeout: config.upstream_timeout_secs.map(Duration::from_secs),
    });
    (result, gateway)
}

fn validate_proxy(proxy: &ProxyConfig, context: &str, result: &mut ValidationResult) -> Option<EgressConfig> {
    match EgressConfig::from_settings(&proxy.proxy_type, proxy.get_address()) {
        Ok(egress) => Some(egress),
        Err(e) => {
            result.add_error(format!("invalid {}: {}", context, e));
            None
        }
    }
}

// The target is concatenated with the request remainder, so only obvious
// mistakes are reported here and the final URL is checked per request.
fn validate_target_url(prefix: &str, target_url: &str, result: &mut ValidationResult) {
    match Url::parse(target_url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => result.add_warning(format!(
            "target for prefix '{}' uses unsupported scheme '{}'",
            prefix,
            url.scheme()
        )),
        Err(e) => result.add_warning(format!(
            "target for prefix '{}' is not an absolute URL ({}): {}",
            prefix, target_url, e
        )),
    }
}

use crate::config::{LogFormat, LogLevel, LoggingConfig};
use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;

/// Installs the process logger. `RUST_LOG` still overrides the configured level.
pub fn init(config: &LoggingConfig) -> Result<(), GatewayError> {
    let level = config.level.unwrap_or_default().to_string();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if config.format.unwrap_or_default() == LogFormat::Json {
        builder.format(|buf, record| {
            let timestamp: DateTime<Utc> = Utc::now();
            let log_entry = json!({
                "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            let line = serde_json::to_string(&log_entry).map_err(std::io::Error::other)?;
            writeln!(buf, "{}", line)
        });
    }

    builder
        .try_init()
        .map_err(|e| GatewayError::Config(format!("failed to install logger: {}", e)))
}

// Parse string to LogLevel
pub fn parse_log_level(s: &str) -> Result<LogLevel, GatewayError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(GatewayError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

// Parse string to LogFormat
pub fn parse_log_format(s: &str) -> Result<LogFormat, GatewayError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(GatewayError::Config(format!(
            "Invalid log format: {}. Must be one of: text, json",
            s
        ))),
    }
}

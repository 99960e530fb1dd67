use anyhow::Context;
use clap::Parser;
use log::{error, info};
use prefix_gateway::config::{Config, DEFAULT_CONFIG_FILE, ListenPort, LogFormat, LogLevel, LoggingConfig};
use prefix_gateway::logging::{self, parse_log_format, parse_log_level};
use prefix_gateway::{Gateway, GatewayConfig};
use std::process::ExitCode;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Path-prefix reverse proxy gateway with per-route HTTP and SOCKS5 egress"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE, help = "Configuration file path")]
    config: String,

    #[clap(short, long, value_name = "PORT", help = "Listen port, overrides the configuration file")]
    port: Option<u16>,

    #[clap(long, value_name = "LEVEL", value_parser = parse_log_level, help = "Log level: trace, debug, info, warn or error")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", value_parser = parse_log_format, help = "Log format: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, help = "Validate the configuration and exit")]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        return match Config::sample().to_file(path) {
            Ok(()) => {
                println!("Sample configuration file generated: {}", path);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to write {}: {}", path, e);
                ExitCode::FAILURE
            }
        };
    }

    let loaded = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config));

    let file_logging = loaded
        .as_ref()
        .ok()
        .and_then(|config| config.logging.clone())
        .unwrap_or_default();
    let logging = LoggingConfig {
        level: args.log_level.or(file_logging.level),
        format: args.log_format.or(file_logging.format),
    };
    if let Err(e) = logging::init(&logging) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(&args, loaded).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, loaded: anyhow::Result<Config>) -> anyhow::Result<()> {
    let mut config = loaded?;
    if let Some(port) = args.port {
        config.port = Some(ListenPort::Number(port));
    }

    let gateway_config = GatewayConfig::from_config(&config).context("invalid configuration")?;
    if args.check {
        info!(
            "Configuration {} is valid: port {}, {} routes",
            args.config,
            gateway_config.listen_port,
            gateway_config.routes.len()
        );
        return Ok(());
    }

    info!("Starting gateway...");
    let gateway = Gateway::new(gateway_config);

    tokio::select! {
        result = gateway.run() => {
            result.context("gateway stopped with an error")?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Gateway stopped");
    Ok(())
}

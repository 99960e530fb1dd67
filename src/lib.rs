pub mod common;
pub mod config;
pub mod config_validation;
pub mod egress;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod reverse_proxy;
pub mod routing;
pub mod security_headers;
pub mod transport;

pub use config::Config;
pub use config_validation::GatewayConfig;
pub use error::GatewayError;
pub use proxy::Gateway;

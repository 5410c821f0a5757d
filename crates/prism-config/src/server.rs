use std::net::SocketAddr;

use serde::Deserialize;

use crate::cors::CorsConfig;
use crate::health::HealthConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_address: Option<SocketAddr>,
    #[serde(default)]
    pub health: HealthConfig,
    /// CORS is off unless configured
    #[serde(default)]
    pub cors: Option<CorsConfig>,
    /// Upper bound for request bodies, including file uploads
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

const fn default_body_limit_mb() -> usize {
    64
}

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Prism AI gateway
#[derive(Debug, Parser)]
#[command(name = "prism", about = "One API in front of OpenAI, Anthropic, Google, and Bedrock")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "prism.toml", env = "PRISM_CONFIG")]
    pub config: PathBuf,

    /// Override the listen address
    #[arg(long, env = "PRISM_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Fallback log filter when `[telemetry.logs] filter` is unset
    #[arg(long, default_value = "info", env = "PRISM_LOG")]
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_prism_toml() {
        let args = Args::try_parse_from(["prism"]).unwrap();
        assert_eq!(args.config, PathBuf::from("prism.toml"));
        assert!(args.listen.is_none());
        assert_eq!(args.log, "info");
    }

    #[test]
    fn listen_override_parses_socket_addresses() {
        let args = Args::try_parse_from(["prism", "--listen", "127.0.0.1:8080"]).unwrap();
        assert_eq!(args.listen, Some("127.0.0.1:8080".parse().unwrap()));
    }
}

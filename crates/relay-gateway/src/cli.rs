use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "relay-gateway",
    version,
    about = "Tunneling reverse-proxy gateway for a hybrid-connection relay"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gateway.yaml")]
    pub config: PathBuf,

    /// Relay listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Status probe listen address (overrides config file setting)
    #[arg(long)]
    pub status_listen: Option<String>,

    /// Default local target host, e.g. http://localhost:9000 (overrides config file setting)
    #[arg(long)]
    pub default_target: Option<String>,

    /// Logical connection name of the tunnel (overrides config file setting)
    #[arg(long)]
    pub connection_name: Option<String>,
}

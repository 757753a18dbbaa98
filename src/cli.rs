use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ccproxy", version, about = "Translating reverse proxy for chat-completion APIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the proxy server.
    Start(RunArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CCPROXY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Override the configured listen host.
    #[arg(long)]
    pub host: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    pub port: Option<u16>,
}

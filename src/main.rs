//! certdist - TLS certificate distribution
//!
//! ```bash
//! # Print a sample configuration
//! certdist config server > server.toml
//!
//! # Generate a client key pair and allow-list the public half on the server
//! certdist keygen
//!
//! certdist server server.toml
//! certdist client client.toml
//! ```

use anyhow::{Context, Result};
use certdist::configs::{ClientConfig, ServerConfig};
use certdist::encryption::Identity;
use certdist::{client, logging, webserver};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "certdist", version, about = "Distribute TLS certificates to remote hosts")]
struct Cli {
    /// More log output (-v, -vv, -vvv); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve certificates to allow-listed clients
    Server {
        /// Path to the server configuration file
        config: PathBuf,
    },
    /// Fetch and install certificates from a server
    Client {
        /// Path to the client configuration file
        config: PathBuf,
    },
    /// Generate a new key pair for a client
    Keygen,
    /// Print a sample configuration
    Config {
        #[arg(value_enum)]
        mode: ConfigMode,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ConfigMode {
    Server,
    Client,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    match cli.command {
        Command::Server { config } => {
            let config = ServerConfig::from_file(&config)?;
            webserver::start_webserver(config)
        }
        Command::Client { config } => {
            let config = ClientConfig::from_file(&config)?;
            client::start_client(config)
        }
        Command::Keygen => {
            let identity = Identity::generate().context("Failed to generate key pair")?;
            println!("# public key: {}", identity.to_recipient()?);
            println!("{}", identity.to_secret_string());
            Ok(())
        }
        Command::Config { mode } => {
            let sample = match mode {
                ConfigMode::Server => toml::to_string_pretty(&ServerConfig::example()),
                ConfigMode::Client => toml::to_string_pretty(&ClientConfig::example()),
            }
            .context("Failed to render sample configuration")?;
            print!("{}", sample);
            Ok(())
        }
    }
}

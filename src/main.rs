use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use tunnelcrab_client::ClientConfig;
use tunnelcrab_server::ServerConfig;

#[derive(Parser)]
#[command(name = "tunnelcrab", version, about = "Reverse HTTP tunnel broker and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker: accepts inbound HTTP and tunnel registrations.
    Serve {
        /// Path to the broker's TOML config file.
        #[arg(long, default_value = "tunnelcrab-server.toml")]
        config: PathBuf,
    },
    /// Run the client: dial the broker and relay to a local HTTP server.
    Tunnel {
        /// Path to the client's TOML config file.
        #[arg(long, default_value = "tunnelcrab-client.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();

    match cli.command {
        Commands::Serve { config } => {
            tunnelcrab_server::init_tracing();
            let config = ServerConfig::load(&config)
                .wrap_err("failed to load broker config")?;
            tunnelcrab_server::spawn_signal_handler(shutdown.clone());
            tunnelcrab_server::serve(config, shutdown)
                .await
                .wrap_err("broker exited with an error")?;
        }
        Commands::Tunnel { config } => {
            tunnelcrab_client::init_tracing();
            let config = ClientConfig::load(&config)
                .wrap_err("failed to load client config")?;
            tunnelcrab_client::spawn_signal_handler(shutdown.clone());
            tunnelcrab_client::run(config, shutdown)
                .await
                .wrap_err("client exited with an error")?;
        }
    }

    Ok(())
}

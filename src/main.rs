use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use spieven::config::Config;
use spieven::display::probe::{watch_display, SocketDisplayBackend};
use spieven::protocol::types::DisplaySelection;
use spieven::server::run_server;

#[derive(Parser)]
#[command(name = "spieven", about = "Spieven - a process supervisor for Linux")]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon.
    Serve {
        /// Enable very frequent resource trimming. This flag should only be
        /// used for testing purposes.
        #[arg(short = 't', long)]
        frequent_trim: bool,

        /// Accept connections from non-loopback addresses.
        #[arg(short = 'r', long)]
        remote: bool,

        /// How long tasks on a dead display get before they are stopped,
        /// in milliseconds.
        #[arg(short = 'g', long, default_value_t = 1000)]
        display_kill_grace_period: u64,
    },

    /// Helpers the daemon spawns for itself.
    #[command(subcommand, hide = true)]
    Internal(InternalCommands),

    /// Print the version number.
    Version,
}

#[derive(Subcommand)]
enum InternalCommands {
    /// Block until the named xorg display goes away.
    Watchxorg { name: String },
    /// Block until the named wayland display goes away.
    Watchwayland { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            frequent_trim,
            remote,
            display_kill_grace_period,
        } => {
            let config = Config {
                allow_remote: remote,
                frequent_trim,
                display_kill_grace: Duration::from_millis(display_kill_grace_period),
                ..Config::default()
            };
            run_server(config, Arc::new(SocketDisplayBackend)).await?;
            Ok(())
        }
        Commands::Internal(InternalCommands::Watchxorg { name }) => {
            let selection = DisplaySelection::xorg(name);
            println!("Connected to {}", selection.label_long());
            watch_display(&selection).await?;
            println!("Disconnected from {}", selection.label_long());
            Ok(())
        }
        Commands::Internal(InternalCommands::Watchwayland { name }) => {
            let selection = DisplaySelection::wayland(name);
            println!("Connected to {}", selection.label_long());
            watch_display(&selection).await?;
            println!("Disconnected from {}", selection.label_long());
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

//! p2pmsg command-line harness.
//!
//! A thin terminal front-end over the core: vault management, a listen /
//! dial chat session on stdin/stdout, and history queries. Exit codes:
//! 0 ok, 2 bad arguments, 10 vault errors, 20 network errors,
//! 30 protocol errors, 40 storage errors.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// p2pmsg - peer-to-peer encrypted messaging over direct TCP
#[derive(Parser)]
#[command(name = "p2pmsg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "data")]
    data_dir: String,

    /// Config file path (JSON; missing file means defaults)
    #[arg(short, long, default_value = "p2pmsg.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new key vault
    Init,

    /// Show the local identity fingerprint
    Fingerprint,

    /// Listen for one peer and chat
    Listen {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Dial a peer and chat
    Dial {
        /// Peer address (IP or hostname)
        addr: String,

        /// Peer port
        #[arg(short, long)]
        port: Option<u16>,

        /// Expected peer fingerprint (hex); mismatch aborts the handshake
        #[arg(long)]
        expect: Option<String>,
    },

    /// Show stored conversation history with a peer
    History {
        /// Peer fingerprint (hex, colons optional)
        fingerprint: String,

        /// Number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: u32,

        /// Messages to skip, counting back from the latest
        #[arg(short, long, default_value = "0")]
        offset: u32,
    },

    /// Mark a peer verified after out-of-band fingerprint comparison
    Verify {
        /// Peer fingerprint (hex, colons optional)
        fingerprint: String,
    },

    /// Rotate the vault passphrase
    RotatePassphrase,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<p2pmsg_core::Error>()
                .map(|core_error| core_error.exit_code())
                .unwrap_or(2);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = p2pmsg_core::config::Config::load(std::path::Path::new(&cli.config))?;
    config.data_dir = cli.data_dir.into();

    match cli.command {
        Commands::Init => commands::init(config).await,
        Commands::Fingerprint => commands::fingerprint(config).await,
        Commands::Listen { port } => commands::listen(config, port).await,
        Commands::Dial { addr, port, expect } => {
            commands::dial(config, &addr, port, expect.as_deref()).await
        }
        Commands::History {
            fingerprint,
            limit,
            offset,
        } => commands::history(config, &fingerprint, limit, offset).await,
        Commands::Verify { fingerprint } => commands::verify(config, &fingerprint).await,
        Commands::RotatePassphrase => commands::rotate_passphrase(config).await,
    }
}

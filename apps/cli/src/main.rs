//! DOSDK CLI - downloads through the delivery-optimization service
//!
//! Drives the SDK from the command line: one-shot downloads with a progress
//! bar, control of transfers owned by the agent, and settings management.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dosdk_core::{ServiceKind, SettingsStore};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// DOSDK - Delivery Optimization downloads
#[derive(Parser)]
#[command(name = "dosdk")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding settings.json
    #[arg(long, env = "DOSDK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Agent REST port, overrides settings and port discovery
    #[arg(long, env = "DOSDK_AGENT_PORT")]
    agent_port: Option<u16>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Which delivery service performs the transfer
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ServiceArg {
    /// In-process engine
    Local,
    /// Delivery-optimization agent on this host
    Agent,
}

impl From<ServiceArg> for ServiceKind {
    fn from(value: ServiceArg) -> Self {
        match value {
            ServiceArg::Local => ServiceKind::Local,
            ServiceArg::Agent => ServiceKind::Agent,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL and wait for it to finish
    Get {
        /// URL to download
        url: String,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,

        /// Delivery service to use
        #[arg(long, default_value = "local")]
        service: ServiceArg,

        /// Caller name reported to the service
        #[arg(long)]
        caller_name: Option<String>,

        /// Run at foreground priority
        #[arg(long)]
        foreground: bool,

        /// Extra request header as Name=value (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Correlation vector for telemetry
        #[arg(long)]
        correlation_vector: Option<String>,

        /// Integrity descriptor as JSON
        #[arg(long)]
        integrity_info: Option<String>,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the status of an agent download
    Status {
        /// Download ID
        id: String,
    },

    /// Pause an agent download
    Pause {
        /// Download ID
        id: String,
    },

    /// Resume an agent download
    Resume {
        /// Download ID
        id: String,
    },

    /// Abort an agent download
    Abort {
        /// Download ID
        id: String,
    },

    /// Read a property of an agent download
    Property {
        /// Download ID
        id: String,

        /// Property name, e.g. CallerName
        name: String,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key, e.g. local.background_limit_bps
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "dosdk=debug,dosdk_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Determine data directory
    let data_dir = cli
        .data_dir
        .or_else(SettingsStore::default_data_dir)
        .unwrap_or_else(|| PathBuf::from(".dosdk"));

    tracing::debug!("Using data directory {}", data_dir.display());
    let store = SettingsStore::new(data_dir).await?;
    let mut settings = store.load_settings().await?;
    if let Some(port) = cli.agent_port {
        settings.agent.port = Some(port);
    }

    // Execute command
    match cli.command {
        Commands::Get {
            url,
            output,
            service,
            caller_name,
            foreground,
            headers,
            correlation_vector,
            integrity_info,
            timeout,
        } => {
            let request = commands::GetRequest {
                url,
                output,
                caller_name,
                foreground,
                headers,
                correlation_vector,
                integrity_info,
                timeout,
            };
            commands::get(settings, service.into(), request, cli.output).await?
        }

        Commands::Status { id } => commands::show_status(&settings, &id, cli.output).await?,

        Commands::Pause { id } => commands::pause_download(&settings, &id).await?,

        Commands::Resume { id } => commands::resume_download(&settings, &id).await?,

        Commands::Abort { id } => commands::abort_download(&settings, &id).await?,

        Commands::Property { id, name } => {
            commands::show_property(&settings, &id, &name, cli.output).await?
        }

        Commands::Config { action } => {
            commands::config_action(&store, settings, action, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "dosdk", &mut std::io::stdout());
        }
    }

    Ok(())
}

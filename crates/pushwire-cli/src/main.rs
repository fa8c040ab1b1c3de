//! Pushwire CLI - Command-line tool for push streaming sessions
//!
//! Creates sessions against a streaming server, subscribes to items and
//! prints their updates as they arrive.

mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pushwire_client::{HttpTransport, SessionManager, SubscriptionMode};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::StreamArgs;
use crate::config::{Config, MergedConfig, Overrides};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "pushwire-cli")]
#[command(author, version, about = "Push streaming session CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Server URL
    #[arg(short, long, env = "PUSHWIRE_SERVER")]
    server: Option<String>,

    /// Adapter set to open the session on
    #[arg(short, long, env = "PUSHWIRE_ADAPTER_SET")]
    adapter_set: Option<String>,

    /// User name
    #[arg(long, env = "PUSHWIRE_USER")]
    user: Option<String>,

    /// Password
    #[arg(long, env = "PUSHWIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "PUSHWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to items and print their updates until Ctrl+C
    Stream {
        /// Item names
        #[arg(required = true)]
        items: Vec<String>,

        /// Field names, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        fields: Vec<String>,

        /// Subscription mode
        #[arg(long, value_enum, default_value = "merge")]
        mode: Mode,

        /// Ask for the current state first
        #[arg(long)]
        snapshot: bool,

        /// Maximum updates per second
        #[arg(long)]
        max_frequency: Option<f64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Fail instead of rebinding when the connection drops
        #[arg(long)]
        no_rebind: bool,
    },

    /// Create a session and show the parameters the server granted
    Info,

    /// Decode protocol lines given as arguments (or read from stdin)
    Decode {
        /// Lines to decode
        lines: Vec<String>,
    },
}

/// Subscription mode as accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Merge,
    Distinct,
    Raw,
    Command,
}

impl From<Mode> for SubscriptionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Merge => SubscriptionMode::Merge,
            Mode::Distinct => SubscriptionMode::Distinct,
            Mode::Raw => SubscriptionMode::Raw,
            Mode::Command => SubscriptionMode::Command,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let mut merged = config.merge_with_args(&Overrides {
        server: cli.server.as_deref(),
        adapter_set: cli.adapter_set.as_deref(),
        user: cli.user.as_deref(),
        password: cli.password.as_deref(),
        output: cli.output.map(<&str>::from),
        no_color: cli.no_color,
    })?;

    let format = OutputFormat::from_str(&merged.output, true)
        .map_err(|e| anyhow::anyhow!("Invalid output format '{}': {}", merged.output, e))?;
    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    match cli.command {
        Commands::Stream {
            items,
            fields,
            mode,
            snapshot,
            max_frequency,
            duration,
            no_rebind,
        } => {
            if no_rebind {
                merged.client = merged.client.with_autorebind(false);
            }
            let manager = create_manager(&merged)?;
            let args = StreamArgs {
                items,
                fields,
                mode: mode.into(),
                snapshot,
                max_frequency,
                duration: duration.map(Duration::from_secs),
            };
            commands::stream(&manager, &merged, args, &ctx).await?;
        }

        Commands::Info => {
            let manager = create_manager(&merged)?;
            commands::info(&manager, &merged, &ctx).await?;
        }

        Commands::Decode { lines } => {
            commands::decode(&lines, &ctx)?;
        }
    }

    Ok(())
}

/// Create a session manager talking HTTP to the configured server
fn create_manager(config: &MergedConfig) -> Result<SessionManager> {
    let transport = HttpTransport::new(config.client.connect_timeout())
        .context("Failed to create HTTP transport")?;
    Ok(SessionManager::new(config.client.clone(), Arc::new(transport)))
}

// Implement conversion for OutputFormat to string (for config merge)
impl From<OutputFormat> for &str {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Table => "table",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

//! GeekWear CLI - tab sync simulation and session token tools.
//!
//! # Usage
//!
//! ```bash
//! # Simulate three tabs of one origin sharing a cart and a session
//! gw-cli simulate --tabs 3
//!
//! # Same, then kill the leader without releasing its lock
//! gw-cli simulate --tabs 3 --crash-leader
//!
//! # Mint and inspect a session token with the configured secret
//! gw-cli token sign -e link@hyrule.example -n Link
//! gw-cli token verify <TOKEN>
//! ```
//!
//! # Commands
//!
//! - `simulate` - Run tabs against in-memory storage and a local channel
//! - `token sign` - Mint a session token
//! - `token verify` - Decode and validate a session token
//!
//! # Environment Variables
//!
//! - `SENTRY_DSN` - Optional Sentry DSN for error reporting
//! - `GEEKWEAR_*` - Sync settings, see `geekwear_sync::config`

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::num::NonZeroUsize;

use clap::{Parser, Subcommand};
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "gw-cli")]
#[command(author, version, about = "GeekWear tab sync tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate several tabs of one origin
    Simulate {
        /// Number of tabs to open
        #[arg(short, long, default_value = "3")]
        tabs: NonZeroUsize,

        /// Drop the leader without releasing its lock and wait for failover
        #[arg(long)]
        crash_leader: bool,

        /// Generate throwaway secrets instead of reading them from the environment
        #[arg(long)]
        ephemeral_secrets: bool,
    },
    /// Mint or inspect session tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Mint a token for a user
    Sign {
        /// User email address
        #[arg(short, long)]
        email: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Grant the admin claim
        #[arg(long)]
        admin: bool,
    },
    /// Decode and validate a token
    Verify {
        /// The encoded token
        token: String,
    },
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: std::env::var("SENTRY_ENVIRONMENT")
                .ok()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN | tracing::Level::INFO => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let _sentry_guard = init_sentry();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "geekwear_sync=info,gw_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), commands::CommandError> {
    match cli.command {
        Commands::Simulate {
            tabs,
            crash_leader,
            ephemeral_secrets,
        } => {
            let options = commands::simulate::SimulateOptions {
                tabs: tabs.get(),
                crash_leader,
                ephemeral_secrets,
            };
            let report = commands::simulate::run(&options).await?;
            tracing::info!(
                leader = %report.leader.map_or_else(|| "none".to_string(), |id| id.to_string()),
                cart_total = %report.cart_total,
                authenticated_tabs = report.authenticated_tabs,
                resyncs = report.resyncs,
                "simulation finished"
            );
        }
        Commands::Token { action } => match action {
            TokenAction::Sign { email, name, admin } => {
                let token = commands::token::sign(&email, name, admin)?;
                tracing::info!(%token, "token minted");
            }
            TokenAction::Verify { token } => {
                let claims = commands::token::verify(&token)?;
                tracing::info!(claims = %claims, "token valid");
            }
        },
    }
    Ok(())
}

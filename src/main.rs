use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use rootcause::Report;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::http::HttpClient;
use crate::apply::{Action, Manifest};
use crate::config::Config;
use crate::state::State;

mod api;
mod apply;
mod config;
mod reconcile;
mod resource;
mod role;
mod schema;
mod state;

/// Declarative management of PowerDNS-Admin accounts, users and API keys
#[derive(Parser, Debug)]
#[command(name = "pdnsadmin-sync")]
#[command(version)]
struct Cli {
    /// where ids and last applied attributes are kept
    #[arg(long, default_value = "pdnsadmin.state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// check a manifest without contacting the server
    Validate { manifest: PathBuf },

    /// show what apply would change
    Plan { manifest: PathBuf },

    /// converge the server onto a manifest
    Apply { manifest: PathBuf },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(err = %e, "Application error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Report> {
    match cli.command {
        Command::Validate { manifest } => {
            let manifest = Manifest::load(&manifest)?;
            info!(resources = manifest.resources.len(), "manifest is valid");
        }
        Command::Plan { manifest } => {
            let manifest = Manifest::load(&manifest)?;
            let client = connect()?;
            print_plan(&client, &manifest, &cli.state).await?;
        }
        Command::Apply { manifest } => {
            let manifest = Manifest::load(&manifest)?;
            let client = connect()?;
            let summary = apply::apply(&client, &manifest, &cli.state).await?;
            println!("{summary}");
        }
    }
    Ok(())
}

fn connect() -> Result<HttpClient, Report> {
    let config = Config::from_env()?;
    HttpClient::new(&config)
}

async fn print_plan(client: &HttpClient, manifest: &Manifest, state_path: &Path) -> Result<(), Report> {
    let mut state = State::load(state_path)?;
    let steps = apply::plan(client, manifest, &mut state).await?;

    let pending: Vec<_> = steps
        .iter()
        .filter(|step| step.action != Action::NoOp)
        .collect();
    if pending.is_empty() {
        println!("No changes.");
        return Ok(());
    }
    for step in pending {
        println!("{step}");
    }
    Ok(())
}

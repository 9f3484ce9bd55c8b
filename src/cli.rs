use std::io;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use crate::{
    catalog::Catalog,
    environment::{self, Environment},
    scheduler::Scheduler,
};

#[derive(Parser, Debug)]
#[command(name = "benchfleet", version, about = "Fan benchmark runs out across the device fleet", long_about = None)]
pub struct Cli {
    /// Source-tree reference the benchmark tool compares against (the "old" side).
    #[arg(long, default_value = "srcfs")]
    pub reference: String,

    /// Print the expanded matrix as resolved command lines and exit.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

pub fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "benchfleet=debug"
    } else {
        "benchfleet=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let env = Environment::discover()?;
    let benchy = environment::resolve_tool("BENCHFLEET_BENCHY", "benchy")?;
    let scheduler = Scheduler::new(env, Catalog::builtin().clone(), &cli.reference, benchy)?;

    if cli.dry_run {
        scheduler.print_plan(&mut io::stdout())?;
        return Ok(());
    }
    scheduler.run().await
}

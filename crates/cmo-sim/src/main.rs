mod config;
mod logging;
mod runner;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use crate::config::{CheckArgs, Cli, Commands, RunArgs, Scenario};

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run_scenario(run_args).await,
        Commands::Check(check_args) => check_scenario(check_args),
    }
}

async fn run_scenario(run_args: RunArgs) -> Result<()> {
    let _guard = logging::init(run_args.stats_file.as_deref())?;

    let mut scenario = Scenario::load(&run_args.scenario)?;
    if let Some(entitlement) = run_args.entitlement {
        scenario.entitlement = entitlement;
    }
    tracing::info!(
        scenario = %run_args.scenario.display(),
        entitlement = scenario.entitlement,
        steps = scenario.steps.len(),
        "replaying scenario"
    );

    let report = runner::replay(scenario, run_args.strict).await?;
    let json = serde_json::to_string_pretty(&report).context("serialize report")?;
    println!("{json}");
    Ok(())
}

fn check_scenario(check_args: CheckArgs) -> Result<()> {
    let scenario = Scenario::load(&check_args.scenario)?;
    println!("{:#?}", scenario.config);
    println!(
        "entitlement {} for {} expected device(s), {} step(s)",
        scenario.entitlement,
        scenario.expected_devices,
        scenario.steps.len()
    );
    Ok(())
}

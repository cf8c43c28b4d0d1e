//! facetsmith deploys interdependent libraries, facets and diamond composites,
//! and re-runs without deploying anything twice.

mod cli;

use anyhow::Result;
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, RegistryAction};
use facetsmith_deploy::{DeployError, DeploymentConfig, DeploymentReport, InitState, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let mut config = DeploymentConfig::load(cli.config.as_deref())?;
    if cli.debug {
        config.composite.debug = true;
    }

    match cli.command {
        Command::Deploy { dry_run } => deploy(&config, dry_run).await,
        Command::Plan => plan(&config),
        Command::Registry { action } => registry(&config, action),
    }
}

async fn deploy(config: &DeploymentConfig, dry_run: bool) -> Result<()> {
    let result = if dry_run {
        config.dry_run().await
    } else {
        config.deploy().await
    };

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if let Some(deploy_err) = err.downcast_ref::<DeployError>() {
                tracing::error!(
                    stage = %deploy_err.stage(),
                    artifact = deploy_err.artifact().unwrap_or("-"),
                    retryable = deploy_err.is_retryable(),
                    "Deployment aborted"
                );
                if deploy_err.is_retryable() {
                    tracing::warn!("Run deploy again to re-attach to the pending transaction");
                }
            }
            return Err(err);
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &DeploymentReport) {
    for entry in &report.artifacts {
        tracing::info!(
            artifact = %entry.name,
            kind = entry.kind,
            address = %entry.address,
            reused = entry.reused,
            "Deployed artifact"
        );
    }

    match report.composite_address() {
        Some(address) => println!("{address}"),
        None => tracing::warn!("No composite in the deployment"),
    }
}

fn plan(config: &DeploymentConfig) -> Result<()> {
    let plan = config.plan()?;

    for (position, step) in plan.steps().iter().enumerate() {
        if step.dependencies.is_empty() {
            println!("{:>3}. {} ({})", position + 1, step.name, step.kind);
        } else {
            println!(
                "{:>3}. {} ({}) after {}",
                position + 1,
                step.name,
                step.kind,
                step.dependencies.join(", ")
            );
        }
    }

    Ok(())
}

fn registry(config: &DeploymentConfig, action: RegistryAction) -> Result<()> {
    match action {
        RegistryAction::List => {
            let state = config.registry_snapshot()?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec![
                "Artifact",
                "Address",
                "Fingerprint",
                "Block",
                "Initialization",
            ]);

            for entry in &state.entries {
                let init = match state.init_record(&entry.address).map(|record| &record.state) {
                    Some(InitState::Initialized) => "initialized".to_string(),
                    Some(InitState::Failed { reason }) => format!("FAILED: {reason}"),
                    None => "-".to_string(),
                };
                table.add_row(vec![
                    entry.artifact.clone(),
                    entry.address.to_string(),
                    entry.fingerprint.short().to_string(),
                    entry.block_number.to_string(),
                    init,
                ]);
            }

            for pending in &state.pending {
                table.add_row(vec![
                    pending.artifact.clone(),
                    format!("pending tx {}", pending.tx_hash),
                    pending.fingerprint.short().to_string(),
                    "-".to_string(),
                    "-".to_string(),
                ]);
            }

            println!("{table}");
        }
        RegistryAction::Forget { artifact } => {
            let registry = config.open_registry()?;
            let removed = registry.forget(&artifact)?;
            if removed == 0 {
                anyhow::bail!("No record of `{artifact}` in {}", registry.path().display());
            }
            tracing::info!(artifact = %artifact, removed, "Artifact forgotten");
        }
    }

    Ok(())
}

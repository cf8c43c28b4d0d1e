use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "facetsmith")]
#[command(
    author,
    version,
    about = "Deploy libraries, facets and diamond composites idempotently"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "FSM_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a Facetsmith.toml configuration file, or to the directory holding it.
    ///
    /// If not provided, ./Facetsmith.toml is used when present. Any value can be
    /// overridden with FSM_ environment variables, e.g. FSM_NETWORK__RPC_URL.
    #[arg(short, long, alias = "conf", env = "FSM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target the debug composite, which adds the debug facets.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy every artifact that is not already in the registry, then print
    /// the composite address.
    Deploy {
        /// Run against an in-memory chain seeded with the current registry.
        /// Nothing is sent and nothing is written.
        #[arg(long, env = "FSM_DRY_RUN")]
        dry_run: bool,
    },

    /// Resolve and check the deployment plan without deploying anything.
    Plan,

    /// Inspect or edit the deployment registry.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum RegistryAction {
    /// List recorded deployments.
    List,

    /// Remove every record of an artifact, so the next run deploys it again.
    ///
    /// This is the way out of a composite whose initialization failed.
    Forget {
        /// Name of the artifact to forget.
        artifact: String,
    },
}

//! Deployment configuration.
//!
//! Loaded in layers: built-in defaults, then `Facetsmith.toml`, then `FSM_`
//! environment variables (nested keys separated by `__`, e.g.
//! `FSM_NETWORK__RPC_URL`). Every field is validated before anything is
//! deployed.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use alloy_signer_local::{MnemonicBuilder, coins_bip39::English};
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    abi::ArgValue,
    artifact::{Artifact, CompositeSpec, InitDirective},
    chain::{JsonRpcChain, MemoryChain},
    error::ConfigurationError,
    orchestrator::{
        DEFAULT_CONFIRMATION_TIMEOUT, DEFAULT_MAX_PARALLEL, DeploymentReport, Orchestrator,
        OrchestratorOptions,
    },
    registry::{FileRegistry, MemoryRegistry, Registry, RegistryState},
    resolver::DeploymentPlan,
    source::HardhatArtifacts,
};

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "Facetsmith.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "FSM_";

/// Mnemonic of the standard development node accounts.
pub const DEV_MNEMONIC: &str = "test test test test test test test test test test test junk";

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";

/// Facets added to the composite in debug mode.
pub const DEBUG_FACETS: [&str; 3] = [
    "RollupsDebugFacet",
    "OutputDebugFacet",
    "ValidatorManagerDebugFacet",
];

/// Seconds in a day.
const DAY: u64 = 24 * 60 * 60;

/// Target network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network name, also the registry file name.
    pub name: String,
    pub rpc_url: Url,
    /// When set, the node must report this chain id.
    pub chain_id: Option<u64>,
    /// Account sending the creations. Defaults to the node's first account.
    pub from: Option<Address>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            rpc_url: Url::parse(DEFAULT_RPC_URL).expect("default RPC URL is valid"),
            chain_id: None,
            from: None,
        }
    }
}

/// A standalone library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgValue>,
    /// Libraries linked into this one.
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl LibraryConfig {
    fn new(name: &str, libraries: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
            libraries: libraries.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// The composite and its facets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeConfig {
    pub name: String,
    /// Proxy contract the composite is created from.
    pub proxy: String,
    /// Owner of the composite. Defaults to the deploying account.
    pub owner: Option<Address>,
    /// Facets, in cut order.
    pub facets: Vec<String>,
    /// Libraries linked into the facets and the proxy.
    pub libraries: Vec<String>,
    pub init_method: String,
    /// Deploy the debug variant: [`DEBUG_FACETS`] are cut in after `facets`
    /// and the composite name gets a `Debug` suffix.
    pub debug: bool,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            name: "CartesiRollups".to_string(),
            proxy: "Diamond".to_string(),
            owner: None,
            facets: [
                "InputFacet",
                "RollupsFacet",
                "RollupsInitFacet",
                "ValidatorManagerFacet",
                "OutputFacet",
            ]
            .map(String::from)
            .to_vec(),
            libraries: vec!["Bitmask".to_string(), "Merkle".to_string()],
            init_method: "init".to_string(),
            debug: false,
        }
    }
}

impl CompositeConfig {
    /// Name the composite is deployed and recorded under.
    pub fn deployed_name(&self) -> String {
        if self.debug {
            format!("{}Debug", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Facets in cut order, debug facets included when enabled.
    pub fn deployed_facets(&self) -> Vec<String> {
        let mut facets = self.facets.clone();
        if self.debug {
            facets.extend(DEBUG_FACETS.map(String::from));
        }
        facets
    }
}

/// Arguments of the rollups initializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupsConfig {
    /// How long inputs accumulate before an epoch closes.
    pub input_duration_secs: u64,
    pub challenge_period_secs: u64,
    pub input_log2_size: u32,
    /// Explicit validator set. Takes precedence over the mnemonic.
    pub validators: Vec<Address>,
    /// Mnemonic the validator set is derived from when no list is given.
    pub validator_mnemonic: Option<String>,
    /// Number of accounts derived from the mnemonic.
    pub validator_count: u32,
}

impl Default for RollupsConfig {
    fn default() -> Self {
        Self {
            input_duration_secs: DAY,
            challenge_period_secs: 7 * DAY,
            input_log2_size: 7,
            validators: Vec::new(),
            validator_mnemonic: Some(DEV_MNEMONIC.to_string()),
            validator_count: 10,
        }
    }
}

impl RollupsConfig {
    /// The validator set, in order.
    pub fn validators(&self) -> Result<Vec<Address>, ConfigurationError> {
        let validators = if !self.validators.is_empty() {
            self.validators.clone()
        } else if let Some(phrase) = &self.validator_mnemonic {
            derive_addresses(phrase, self.validator_count)?
        } else {
            Vec::new()
        };

        if validators.is_empty() {
            return Err(ConfigurationError::InvalidValidatorSet {
                reason: "no validators configured".to_string(),
            });
        }

        for (i, validator) in validators.iter().enumerate() {
            if validators[..i].contains(validator) {
                return Err(ConfigurationError::InvalidValidatorSet {
                    reason: format!("{validator} is listed more than once"),
                });
            }
        }

        Ok(validators)
    }

    /// Initializer arguments: `(inputDuration, challengePeriod, inputLog2Size, validators)`.
    pub fn init_args(&self) -> Result<Vec<ArgValue>, ConfigurationError> {
        Ok(vec![
            Duration::from_secs(self.input_duration_secs).into(),
            Duration::from_secs(self.challenge_period_secs).into(),
            u64::from(self.input_log2_size).into(),
            self.validators()?.into(),
        ])
    }
}

/// Derive the first `count` accounts of a BIP-39 mnemonic.
fn derive_addresses(phrase: &str, count: u32) -> Result<Vec<Address>, ConfigurationError> {
    (0..count)
        .map(|index| {
            let signer = MnemonicBuilder::<English>::default()
                .phrase(phrase)
                .index(index)
                .and_then(|builder| builder.build())
                .map_err(|e| ConfigurationError::InvalidValidatorSet {
                    reason: format!("cannot derive validator {index} from mnemonic: {e}"),
                })?;
            Ok(Address::from(signer.address().into_array()))
        })
        .collect()
}

/// Everything a deployment run needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub network: NetworkConfig,
    /// Hardhat `artifacts/` directory.
    pub artifacts_dir: PathBuf,
    /// Directory holding one registry file per network.
    pub registry_dir: PathBuf,
    pub max_parallel: usize,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Standalone libraries, in declaration order.
    pub libraries: Vec<LibraryConfig>,
    pub composite: CompositeConfig,
    pub rollups: RollupsConfig,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            artifacts_dir: PathBuf::from("artifacts"),
            registry_dir: PathBuf::from("deployments"),
            max_parallel: DEFAULT_MAX_PARALLEL,
            confirmation_timeout_secs: DEFAULT_CONFIRMATION_TIMEOUT.as_secs(),
            poll_interval_ms: 1000,
            libraries: vec![
                LibraryConfig::new("Bitmask", &[]),
                LibraryConfig::new("CartesiMath", &[]),
                LibraryConfig::new("Merkle", &["CartesiMath"]),
            ],
            composite: CompositeConfig::default(),
            rollups: RollupsConfig::default(),
        }
    }
}

impl DeploymentConfig {
    /// Load defaults, then the TOML file, then `FSM_` environment variables.
    ///
    /// Without an explicit path, `Facetsmith.toml` in the working directory is
    /// used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Configuration file not found: {}", path.display());
                }
                if path.is_dir() {
                    path.join(CONFIG_FILENAME)
                } else {
                    path.to_path_buf()
                }
            }
            None => PathBuf::from(CONFIG_FILENAME),
        };

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to load configuration")?;

        config.validate().context("Invalid configuration")?;
        tracing::debug!(path = %file.display(), network = %config.network.name, "Configuration loaded");
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load a configuration from a TOML file, without defaults or environment.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Reject invalid values before anything is deployed.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |field: &str, reason: &str| ConfigurationError::InvalidField {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        let name = &self.network.name;
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(invalid("network.name", "must be a non-empty file name"));
        }
        if self.max_parallel == 0 {
            return Err(invalid("max_parallel", "must be at least 1"));
        }
        if self.confirmation_timeout_secs == 0 {
            return Err(invalid("confirmation_timeout_secs", "must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be positive"));
        }
        if self.rollups.input_duration_secs == 0 {
            return Err(invalid("rollups.input_duration_secs", "must be positive"));
        }
        if self.rollups.challenge_period_secs == 0 {
            return Err(invalid("rollups.challenge_period_secs", "must be positive"));
        }
        if !(1..=64).contains(&self.rollups.input_log2_size) {
            return Err(invalid("rollups.input_log2_size", "must be between 1 and 64"));
        }
        if self.composite.facets.is_empty() {
            return Err(ConfigurationError::EmptyComposite {
                composite: self.composite.name.clone(),
            });
        }
        if self.composite.init_method.is_empty() {
            return Err(invalid("composite.init_method", "must not be empty"));
        }

        self.rollups.validators().map(drop)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            max_parallel: self.max_parallel,
            confirmation_timeout: self.confirmation_timeout(),
        }
    }

    /// The declared artifacts: libraries, then facets, then the composite.
    ///
    /// `deployer` owns the composite unless an owner is configured.
    pub fn to_artifacts(&self, deployer: Address) -> Result<Vec<Artifact>, ConfigurationError> {
        let composite = &self.composite;
        let facet_names = composite.deployed_facets();

        let libraries = self.libraries.iter().map(|library| {
            Artifact::library(&library.name)
                .with_args(library.args.iter().cloned())
                .depends_on(&library.libraries)
        });

        let facets = facet_names
            .iter()
            .map(|facet| Artifact::facet(facet).depends_on(&composite.libraries));

        let spec = CompositeSpec {
            proxy: composite.proxy.clone(),
            owner: composite.owner.unwrap_or(deployer),
            facets: facet_names.clone(),
            init: InitDirective {
                method: composite.init_method.clone(),
                args: self.rollups.init_args()?,
            },
        };

        Ok(libraries
            .chain(facets)
            .chain([
                Artifact::composite(composite.deployed_name(), spec)
                    .depends_on(&composite.libraries),
            ])
            .collect())
    }

    /// Open this network's registry.
    pub fn open_registry(&self) -> Result<FileRegistry> {
        FileRegistry::open(&self.registry_dir, &self.network.name).context(format!(
            "Failed to open registry in {}",
            self.registry_dir.display()
        ))
    }

    /// Deploy against the configured node.
    pub async fn deploy(&self) -> Result<DeploymentReport> {
        let source = HardhatArtifacts::open(&self.artifacts_dir)?;
        let registry = self.open_registry()?;
        let chain = JsonRpcChain::connect(
            self.network.rpc_url.clone(),
            self.network.chain_id,
            self.network.from,
            self.poll_interval(),
        )
        .await?;

        let artifacts = self.to_artifacts(chain.from())?;

        tracing::info!(
            network = %self.network.name,
            rpc_url = %self.network.rpc_url,
            registry = %registry.path().display(),
            artifacts = artifacts.len(),
            "Deploying"
        );

        let report = Orchestrator::new(source, chain, registry)
            .with_options(self.orchestrator_options())
            .run(&artifacts)
            .await?;

        Ok(report)
    }

    /// Run the deployment against an in-memory chain seeded with the current
    /// registry. Nothing is sent and nothing is written.
    pub async fn dry_run(&self) -> Result<DeploymentReport> {
        let source = HardhatArtifacts::open(&self.artifacts_dir)?;
        let deployer = self.network.from.unwrap_or(Address::ZERO);
        let registry = MemoryRegistry::with_state(self.registry_snapshot()?);
        let artifacts = self.to_artifacts(deployer)?;

        tracing::info!(network = %self.network.name, "Dry run against an in-memory chain");

        let report = Orchestrator::new(source, MemoryChain::new(deployer), registry)
            .with_options(self.orchestrator_options())
            .run(&artifacts)
            .await?;

        Ok(report)
    }

    /// Resolve and check the plan without deploying.
    pub fn plan(&self) -> Result<DeploymentPlan> {
        let source = HardhatArtifacts::open(&self.artifacts_dir)?;
        let deployer = self.network.from.unwrap_or(Address::ZERO);
        let artifacts = self.to_artifacts(deployer)?;

        let plan = Orchestrator::new(source, MemoryChain::new(deployer), MemoryRegistry::new())
            .plan(&artifacts)?;
        Ok(plan)
    }

    /// Current registry contents, empty when the registry was never written.
    pub fn registry_snapshot(&self) -> Result<RegistryState> {
        let path = self.registry_dir.join(format!("{}.json", self.network.name));
        if !path.exists() {
            return Ok(RegistryState::default());
        }
        Ok(self.open_registry()?.read()?)
    }
}

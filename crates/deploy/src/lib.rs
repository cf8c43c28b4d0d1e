//! facetsmith-deploy - Idempotent deployment of libraries, facets and diamond composites.
//!
//! A run resolves the declared artifacts into a dependency-ordered plan,
//! links deployed library addresses into dependents, creates every composite
//! together with its facet cut and initializer in one transaction, and records
//! each confirmed deployment in a registry so that re-running the same
//! configuration submits nothing new.

pub mod abi;
pub use abi::ArgValue;

mod artifact;
pub use artifact::{Artifact, ArtifactKind, CompositeSpec, InitDirective};

pub mod chain;
pub use chain::{ChainClient, ChainError, Fault, JsonRpcChain, MemoryChain};

mod config;
pub use config::{
    CONFIG_FILENAME, CompositeConfig, DEBUG_FACETS, DEV_MNEMONIC, DeploymentConfig, ENV_PREFIX,
    LibraryConfig, NetworkConfig, RollupsConfig,
};

mod deployer;
pub use deployer::{ArtifactDeployer, DeployedArtifact, PreparedDeployment};

mod diamond;
pub use diamond::{DiamondBuilder, FacetCut};

mod error;
pub use error::{ConfigurationError, DeployError, DeployStage};

mod fingerprint;
pub use fingerprint::Fingerprint;

mod init;
pub use init::InitCall;

mod linker;
pub use linker::{LinkedBytecode, link};

mod orchestrator;
pub use orchestrator::{
    DeployedEntry, DeploymentReport, Orchestrator, OrchestratorOptions,
};

pub mod registry;
pub use registry::{
    FileRegistry, InitRecord, InitState, MemoryRegistry, Registry, RegistryEntry, RegistryError,
};

mod resolver;
pub use resolver::{DeploymentPlan, PlanStep, resolve};

mod source;
pub use source::{
    ArtifactSource, CompiledArtifact, HardhatArtifacts, LinkReference, MemorySource, SourceError,
};

//! Dependency-ordered deployment of a whole declaration set.

use std::{collections::HashMap, time::Duration};

use alloy_core::primitives::{Address, B256};
use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};

use crate::{
    abi::encode_constructor_args,
    artifact::{Artifact, ArtifactKind, CompositeSpec},
    chain::ChainClient,
    deployer::{ArtifactDeployer, DeployedArtifact, PreparedDeployment},
    diamond::DiamondBuilder,
    error::{ConfigurationError, DeployError},
    fingerprint::Fingerprint,
    registry::Registry,
    resolver::{DeploymentPlan, resolve},
    source::{ArtifactSource, CompiledArtifact, SourceError},
};

/// Default number of creations in flight at once.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default time to wait for a creation to confirm.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Tuning knobs of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Upper bound on concurrent creations. Zero is treated as one.
    pub max_parallel: usize,
    pub confirmation_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

/// One deployed artifact in a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedEntry {
    pub name: String,
    pub kind: &'static str,
    pub address: Address,
    pub fingerprint: Fingerprint,
    pub tx_hash: B256,
    /// Found in the registry rather than created by this run.
    pub reused: bool,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub plan: DeploymentPlan,
    /// Deployed artifacts, in plan order.
    pub artifacts: Vec<DeployedEntry>,
}

impl DeploymentReport {
    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.artifacts
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.address)
    }

    /// Address of the last composite in the plan, the run's public output.
    pub fn composite_address(&self) -> Option<Address> {
        self.artifacts
            .iter()
            .rev()
            .find(|entry| entry.kind == "composite")
            .map(|entry| entry.address)
    }

    /// Number of creations confirmed by this run.
    pub fn new_deployments(&self) -> usize {
        self.artifacts.iter().filter(|entry| !entry.reused).count()
    }
}

type StepOutcome = (String, Result<DeployedArtifact, DeployError>);

/// Deploys declared artifacts in dependency order.
///
/// Independent artifacts are deployed concurrently, up to
/// [`OrchestratorOptions::max_parallel`]. An artifact is only started once
/// every one of its dependencies has a confirmed address.
#[derive(Debug)]
pub struct Orchestrator<S, C, R> {
    source: S,
    chain: C,
    registry: R,
    options: OrchestratorOptions,
}

impl<S: ArtifactSource, C: ChainClient, R: Registry> Orchestrator<S, C, R> {
    pub fn new(source: S, chain: C, registry: R) -> Self {
        Self {
            source,
            chain,
            registry,
            options: OrchestratorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Resolve and check the declarations without submitting anything.
    pub fn plan(&self, artifacts: &[Artifact]) -> Result<DeploymentPlan, DeployError> {
        let plan = resolve(artifacts)?;
        self.preflight(artifacts, &plan)?;
        Ok(plan)
    }

    /// Deploy every declared artifact.
    ///
    /// Configuration problems are reported before the first submission. Any
    /// failure stops the run: no new artifact is started, creations already in
    /// flight are awaited, and the first error is returned.
    pub async fn run(&self, artifacts: &[Artifact]) -> Result<DeploymentReport, DeployError> {
        let plan = resolve(artifacts)?;
        let compiled = self.preflight(artifacts, &plan)?;

        tracing::info!(
            steps = plan.len(),
            max_parallel = self.options.max_parallel,
            "Starting deployment"
        );

        let deployer = ArtifactDeployer::new(
            &self.chain,
            &self.registry,
            self.options.confirmation_timeout,
        );
        let max_parallel = self.options.max_parallel.max(1);

        let mut addresses: HashMap<String, Address> = HashMap::new();
        let mut deployed: HashMap<String, DeployedArtifact> = HashMap::new();
        let mut started = vec![false; plan.len()];
        let mut failure: Option<DeployError> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            if failure.is_none() {
                for (position, step) in plan.steps().iter().enumerate() {
                    if in_flight.len() >= max_parallel {
                        break;
                    }
                    if started[position]
                        || !step.dependencies.iter().all(|dep| addresses.contains_key(dep))
                    {
                        continue;
                    }

                    started[position] = true;
                    tracing::info!(
                        step = position + 1,
                        total = plan.len(),
                        artifact = %step.name,
                        kind = step.kind,
                        "Deploying"
                    );

                    match self.start(&artifacts[step.index], &compiled, &addresses, &deployer) {
                        Ok(future) => in_flight.push(future),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
            }

            let Some((name, outcome)) = in_flight.next().await else {
                break;
            };

            match outcome {
                Ok(artifact) => {
                    addresses.insert(name.clone(), artifact.address());
                    deployed.insert(name, artifact);
                }
                Err(err) => {
                    tracing::error!(
                        artifact = %name,
                        stage = %err.stage(),
                        err = %err,
                        "Deployment step failed"
                    );
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let artifacts = plan
            .steps()
            .iter()
            .filter_map(|step| {
                deployed.remove(&step.name).map(|artifact| DeployedEntry {
                    name: step.name.clone(),
                    kind: step.kind,
                    address: artifact.entry.address,
                    fingerprint: artifact.entry.fingerprint,
                    tx_hash: artifact.entry.tx_hash,
                    reused: artifact.reused,
                })
            })
            .collect();

        let report = DeploymentReport { plan, artifacts };
        tracing::info!(
            deployed = report.new_deployments(),
            reused = report.artifacts.len() - report.new_deployments(),
            composite = ?report.composite_address(),
            "Deployment complete"
        );

        Ok(report)
    }

    /// Link or compose one ready artifact and return the future deploying it.
    fn start<'d>(
        &self,
        artifact: &Artifact,
        compiled: &HashMap<String, CompiledArtifact>,
        addresses: &HashMap<String, Address>,
        deployer: &'d ArtifactDeployer<'d, C, R>,
    ) -> Result<BoxFuture<'d, StepOutcome>, DeployError> {
        let code = compiled
            .get(&artifact.name)
            .ok_or_else(|| SourceError::NotFound {
                name: artifact.name.clone(),
            })?;

        let name = artifact.name.clone();
        match &artifact.kind {
            ArtifactKind::Composite(spec) => {
                let builder = compose(artifact, spec, code, compiled, addresses)?;
                let addresses = addresses.clone();
                Ok(Box::pin(async move {
                    let outcome = builder.compose_and_initialize(&addresses, deployer).await;
                    (name, outcome)
                }))
            }
            ArtifactKind::Library | ArtifactKind::Facet => {
                let prepared = PreparedDeployment::standalone(artifact, code, addresses)?;
                tracing::debug!(
                    artifact = %name,
                    payload_bytes = prepared.payload.len(),
                    fingerprint = %prepared.fingerprint.short(),
                    "Creation prepared"
                );
                Ok(Box::pin(async move {
                    let outcome = deployer.deploy(&prepared).await;
                    (name, outcome)
                }))
            }
        }
    }

    /// Load every artifact and check what can be checked without addresses.
    ///
    /// Returns the code to deploy per artifact name: the compiled artifact for
    /// libraries and facets, the proxy for composites.
    fn preflight(
        &self,
        artifacts: &[Artifact],
        plan: &DeploymentPlan,
    ) -> Result<HashMap<String, CompiledArtifact>, DeployError> {
        let mut compiled: HashMap<String, CompiledArtifact> = HashMap::with_capacity(plan.len());

        for step in plan.steps() {
            let artifact = &artifacts[step.index];

            let code = match &artifact.kind {
                ArtifactKind::Composite(spec) => {
                    let proxy = self.source.load(&spec.proxy)?;
                    check_link_references(artifact, &proxy)?;
                    // Facets precede the composite in the plan, so they are loaded.
                    compose(artifact, spec, &proxy, &compiled, &HashMap::new())?.check()?;
                    proxy
                }
                ArtifactKind::Library | ArtifactKind::Facet => {
                    let code = self.source.load(&artifact.name)?;
                    check_link_references(artifact, &code)?;
                    encode_constructor_args(&code.abi, &artifact.constructor_args).map_err(
                        |reason| ConfigurationError::ArgumentMismatch {
                            artifact: artifact.name.clone(),
                            reason,
                        },
                    )?;
                    code
                }
            };

            compiled.insert(artifact.name.clone(), code);
        }

        tracing::debug!(artifacts = compiled.len(), "Preflight checks passed");
        Ok(compiled)
    }
}

/// Build the composite's cut. Facets without an address yet are cut in at
/// the zero address, which is enough for preflight checks.
fn compose(
    artifact: &Artifact,
    spec: &CompositeSpec,
    proxy: &CompiledArtifact,
    compiled: &HashMap<String, CompiledArtifact>,
    addresses: &HashMap<String, Address>,
) -> Result<DiamondBuilder, DeployError> {
    let mut builder = DiamondBuilder::new(&artifact.name, spec.clone(), proxy.clone())
        .with_libraries(&artifact.library_dependencies);

    for facet in &spec.facets {
        let code = compiled
            .get(facet)
            .ok_or_else(|| SourceError::NotFound { name: facet.clone() })?;
        let address = addresses.get(facet).copied().unwrap_or(Address::ZERO);
        builder.add_facet(facet, address, &code.abi)?;
    }

    Ok(builder)
}

/// Every library referenced by the bytecode must be a declared dependency.
fn check_link_references(
    artifact: &Artifact,
    code: &CompiledArtifact,
) -> Result<(), ConfigurationError> {
    match code
        .link_references
        .iter()
        .find(|reference| !artifact.library_dependencies.contains(&reference.library))
    {
        Some(reference) => Err(ConfigurationError::MissingDependency {
            artifact: artifact.name.clone(),
            dependency: reference.library.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MemoryChain, MemoryRegistry, MemorySource,
        abi::{ArgValue, tests::init_facet_abi},
        artifact::InitDirective,
        chain::Fault,
        diamond::tests::{diamond_proxy, single_function_abi},
        source::LinkReference,
    };
    use alloy_core::json_abi::JsonAbi;

    /// Bytecode with one 20-byte library placeholder after a 2-byte prefix.
    fn linked_code(name: &str, library: &str) -> CompiledArtifact {
        CompiledArtifact {
            name: name.to_string(),
            abi: single_function_abi(&format!("use{name}")),
            bytecode: format!("0x6080{}6040", "__$0123456789abcdef0123456789abcdef01$__"),
            link_references: vec![LinkReference {
                library: library.to_string(),
                start: 2,
                length: 20,
            }],
        }
    }

    fn plain_code(name: &str) -> CompiledArtifact {
        CompiledArtifact {
            name: name.to_string(),
            abi: JsonAbi::default(),
            bytecode: "0x60806040".to_string(),
            link_references: vec![],
        }
    }

    fn source() -> MemorySource {
        let mut source = MemorySource::new();
        source
            .insert(plain_code("CartesiMath"))
            .insert(linked_code("Merkle", "CartesiMath"))
            .insert(CompiledArtifact {
                abi: single_function_abi("getInput"),
                ..plain_code("InputFacet")
            })
            .insert(CompiledArtifact {
                abi: init_facet_abi(),
                ..linked_code("RollupsInitFacet", "Merkle")
            })
            .insert(diamond_proxy());
        source
    }

    fn declarations(validators: Vec<Address>) -> Vec<Artifact> {
        vec![
            Artifact::library("CartesiMath"),
            Artifact::library("Merkle").depends_on(["CartesiMath"]),
            Artifact::facet("InputFacet"),
            Artifact::facet("RollupsInitFacet").depends_on(["Merkle"]),
            Artifact::composite(
                "Rollups",
                CompositeSpec {
                    proxy: "Diamond".to_string(),
                    owner: Address::repeat_byte(0x0f),
                    facets: vec!["InputFacet".to_string(), "RollupsInitFacet".to_string()],
                    init: InitDirective {
                        method: "init".to_string(),
                        args: vec![
                            ArgValue::Number(86400),
                            ArgValue::Number(604800),
                            ArgValue::Number(7),
                            ArgValue::from(validators),
                        ],
                    },
                },
            )
            .depends_on(["Merkle"]),
        ]
    }

    fn orchestrator() -> Orchestrator<MemorySource, MemoryChain, MemoryRegistry> {
        Orchestrator::new(source(), MemoryChain::default(), MemoryRegistry::new()).with_options(
            OrchestratorOptions {
                max_parallel: 2,
                confirmation_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_run_deploys_in_dependency_order() {
        let orchestrator = orchestrator();
        let report = orchestrator
            .run(&declarations(vec![Address::repeat_byte(0xa)]))
            .await
            .expect("deploys");

        assert_eq!(report.artifacts.len(), 5);
        assert_eq!(report.new_deployments(), 5);

        // Every artifact is submitted after its dependencies confirmed.
        let order: Vec<String> = orchestrator
            .chain()
            .submissions()
            .into_iter()
            .map(|record| record.artifact)
            .collect();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("CartesiMath") < position("Merkle"));
        assert!(position("Merkle") < position("RollupsInitFacet"));
        assert!(position("InputFacet") < position("Rollups"));
        assert!(position("RollupsInitFacet") < position("Rollups"));

        // The library address is linked into the dependent bytecode.
        let merkle = orchestrator
            .chain()
            .submissions()
            .into_iter()
            .find(|record| record.artifact == "Merkle")
            .unwrap();
        let cartesi_math = report.address_of("CartesiMath").unwrap();
        assert_eq!(&merkle.payload[2..22], cartesi_math.as_slice());

        assert_eq!(report.composite_address(), report.address_of("Rollups"));
    }

    #[tokio::test]
    async fn test_rerun_reuses_everything() {
        let orchestrator = orchestrator();
        let declarations = declarations(vec![Address::repeat_byte(0xa)]);

        let first = orchestrator.run(&declarations).await.expect("deploys");
        let second = orchestrator.run(&declarations).await.expect("reuses");

        assert_eq!(second.new_deployments(), 0);
        assert_eq!(first.composite_address(), second.composite_address());
        assert_eq!(orchestrator.chain().submission_count(), 5);
    }

    #[tokio::test]
    async fn test_changed_init_args_redeploy_only_the_composite() {
        let orchestrator = orchestrator();

        let first = orchestrator
            .run(&declarations(vec![Address::repeat_byte(0xa)]))
            .await
            .expect("deploys");
        let second = orchestrator
            .run(&declarations(vec![Address::repeat_byte(0xb)]))
            .await
            .expect("deploys the new composite");

        assert_eq!(second.new_deployments(), 1);
        assert_ne!(first.composite_address(), second.composite_address());
        assert_eq!(first.address_of("Merkle"), second.address_of("Merkle"));
    }

    #[tokio::test]
    async fn test_configuration_errors_submit_nothing() {
        let orchestrator = orchestrator();

        let mut missing_init = declarations(vec![]);
        if let ArtifactKind::Composite(spec) = &mut missing_init[4].kind {
            spec.init.method = "initialize".to_string();
        }
        let err = orchestrator.run(&missing_init).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Configuration(ConfigurationError::MissingInitMethod { .. })
        ));

        let mut undeclared_link = declarations(vec![]);
        undeclared_link[1].library_dependencies.clear();
        let err = orchestrator.run(&undeclared_link).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Configuration(ConfigurationError::MissingDependency { .. })
        ));

        let mut missing_source = declarations(vec![]);
        missing_source.push(Artifact::library("Bitmask"));
        let err = orchestrator.run(&missing_source).await.unwrap_err();
        assert!(matches!(err, DeployError::Source(SourceError::NotFound { .. })));

        assert_eq!(orchestrator.chain().submission_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_dependents() {
        let orchestrator = orchestrator();
        orchestrator
            .chain()
            .inject("Merkle", Fault::Revert("out of gas".to_string()));

        let err = orchestrator
            .run(&declarations(vec![Address::repeat_byte(0xa)]))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::TransactionReverted { .. }));
        assert_eq!(err.artifact(), Some("Merkle"));
        assert_eq!(orchestrator.chain().submissions_of("RollupsInitFacet"), 0);
        assert_eq!(orchestrator.chain().submissions_of("Rollups"), 0);
    }

    #[test]
    fn test_plan_checks_without_submitting() {
        let orchestrator = orchestrator();
        let plan = orchestrator
            .plan(&declarations(vec![Address::repeat_byte(0xa)]))
            .expect("plans");

        assert_eq!(
            plan.names(),
            vec!["CartesiMath", "Merkle", "InputFacet", "RollupsInitFacet", "Rollups"]
        );
        assert_eq!(orchestrator.chain().submission_count(), 0);
    }
}

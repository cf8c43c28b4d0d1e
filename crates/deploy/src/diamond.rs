//! Composite ("diamond") construction.
//!
//! A composite is created by a single transaction: the proxy's constructor
//! receives the owner, the full facet cut and the initializer call, so the
//! composite address only ever exists fully composed and initialized.

use std::collections::HashMap;

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, Specifier},
    json_abi::JsonAbi,
    primitives::{Address, B256, Selector, U256},
};

use crate::{
    abi::function_selectors,
    artifact::CompositeSpec,
    chain::ChainClient,
    deployer::{ArtifactDeployer, DeployedArtifact, PreparedDeployment},
    error::{ConfigurationError, DeployError},
    fingerprint::{CompositeInput, FacetInput, FingerprintInput, bytecode_hash},
    init::{FacetAbi, InitCall},
    linker::link,
    registry::Registry,
    source::CompiledArtifact,
};

/// `FacetCutAction.Add`.
const ADD_ACTION: u8 = 0;

/// One facet of a composite and the selectors routed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetCut {
    pub facet: String,
    pub address: Address,
    pub selectors: Vec<Selector>,
}

#[derive(Debug, Clone)]
struct FacetEntry {
    cut: FacetCut,
    abi: JsonAbi,
}

/// Accumulates the facets of a composite, then creates it.
///
/// There is no handle to a half-composed composite: the builder is consumed
/// by [`DiamondBuilder::compose_and_initialize`], which either yields a
/// composed and initialized composite or fails as a unit.
#[derive(Debug, Clone)]
pub struct DiamondBuilder {
    name: String,
    spec: CompositeSpec,
    libraries: Vec<String>,
    proxy: CompiledArtifact,
    facets: Vec<FacetEntry>,
}

impl DiamondBuilder {
    pub fn new(name: impl Into<String>, spec: CompositeSpec, proxy: CompiledArtifact) -> Self {
        Self {
            name: name.into(),
            spec,
            libraries: Vec::new(),
            proxy,
            facets: Vec::new(),
        }
    }

    /// Libraries the proxy bytecode is linked against.
    pub fn with_libraries(mut self, libraries: &[String]) -> Self {
        self.libraries = libraries.to_vec();
        self
    }

    /// Add a deployed facet.
    ///
    /// Fails when the facet is not part of the composite, was already added,
    /// or exposes a selector another facet already provides.
    pub fn add_facet(
        &mut self,
        name: &str,
        address: Address,
        abi: &JsonAbi,
    ) -> Result<&mut Self, ConfigurationError> {
        if !self.spec.facets.iter().any(|facet| facet == name) {
            return Err(ConfigurationError::UnknownFacet {
                composite: self.name.clone(),
                facet: name.to_string(),
            });
        }

        if self.facets.iter().any(|entry| entry.cut.facet == name) {
            return Err(ConfigurationError::DuplicateFacet {
                composite: self.name.clone(),
                facet: name.to_string(),
            });
        }

        let selectors = function_selectors(abi);
        for selector in &selectors {
            if let Some(owner) = self
                .facets
                .iter()
                .find(|entry| entry.cut.selectors.contains(selector))
            {
                return Err(ConfigurationError::DuplicateSelector {
                    facet: name.to_string(),
                    owner: owner.cut.facet.clone(),
                    selector: selector.to_string(),
                });
            }
        }

        tracing::debug!(
            composite = %self.name,
            facet = name,
            address = %address,
            selectors = selectors.len(),
            "Facet added to cut"
        );

        self.facets.push(FacetEntry {
            cut: FacetCut {
                facet: name.to_string(),
                address,
                selectors,
            },
            abi: abi.clone(),
        });
        Ok(self)
    }

    /// The cut in declaration order. Facets not added yet are missing.
    pub fn cut(&self) -> Vec<FacetCut> {
        self.ordered().map(|entry| entry.cut.clone()).collect()
    }

    fn ordered(&self) -> impl Iterator<Item = &FacetEntry> {
        self.spec.facets.iter().filter_map(|name| {
            self.facets
                .iter()
                .find(|entry| &entry.cut.facet == name)
        })
    }

    /// Resolve the initializer against the added facets.
    pub fn init_call(&self) -> Result<InitCall, ConfigurationError> {
        let facets: Vec<FacetAbi<'_>> = self
            .ordered()
            .map(|entry| FacetAbi {
                name: &entry.cut.facet,
                address: entry.cut.address,
                abi: &entry.abi,
            })
            .collect();

        InitCall::resolve(&self.name, &self.spec.init, &facets)
    }

    /// Check everything that does not depend on deployed addresses: the
    /// proxy constructor shape and the initializer.
    pub fn check(&self) -> Result<(), ConfigurationError> {
        self.check_proxy_constructor()?;
        self.init_call().map(drop)
    }

    fn check_proxy_constructor(&self) -> Result<(), ConfigurationError> {
        let expected = proxy_constructor_types();
        let mismatch = || ConfigurationError::ArgumentMismatch {
            artifact: self.name.clone(),
            reason: format!(
                "proxy `{}` must have a constructor taking ({})",
                self.spec.proxy,
                expected
                    .iter()
                    .map(DynSolType::sol_type_name)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        };

        let constructor = self.proxy.abi.constructor().ok_or_else(mismatch)?;
        let actual = constructor
            .inputs
            .iter()
            .map(|param| param.resolve())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| mismatch())?;

        if actual != expected {
            return Err(mismatch());
        }
        Ok(())
    }

    /// Build the creation of the composite.
    ///
    /// Every facet must have been added. The payload is the linked proxy
    /// bytecode followed by the encoded `(owner, cut, (initTarget, initCalldata))`.
    pub fn prepare(
        &self,
        addresses: &HashMap<String, Address>,
    ) -> Result<PreparedDeployment, ConfigurationError> {
        if let Some(missing) = self
            .spec
            .facets
            .iter()
            .find(|name| !self.facets.iter().any(|entry| &entry.cut.facet == *name))
        {
            return Err(ConfigurationError::UnresolvedDependency {
                artifact: self.name.clone(),
                dependency: missing.clone(),
            });
        }

        self.check_proxy_constructor()?;
        let init = self.init_call()?;
        let cut = self.cut();

        let linked = link(&self.name, &self.proxy, &self.libraries, addresses)?;
        let args = encode_proxy_constructor(self.spec.owner, &cut, &init);

        let fingerprint = FingerprintInput {
            name: self.name.clone(),
            kind: "composite".to_string(),
            bytecode_hash: bytecode_hash(&linked.bytecode),
            constructor_args: Vec::new(),
            libraries: linked.libraries,
            composite: Some(CompositeInput {
                owner: self.spec.owner,
                facets: cut
                    .iter()
                    .map(|cut| FacetInput {
                        name: cut.facet.clone(),
                        address: cut.address,
                        selectors: cut.selectors.iter().map(ToString::to_string).collect(),
                    })
                    .collect(),
                init_method: init.signature.clone(),
                init_args: self.spec.init.args.clone(),
            }),
        }
        .compute();

        let mut payload = linked.bytecode.to_vec();
        payload.extend(args);

        tracing::debug!(
            composite = %self.name,
            payload_bytes = payload.len(),
            fingerprint = %fingerprint.short(),
            "Composite creation prepared"
        );

        Ok(PreparedDeployment {
            artifact: self.name.clone(),
            kind: "composite",
            payload: payload.into(),
            fingerprint,
            init: Some(init),
        })
    }

    /// Create the composite with its full cut and run its initializer, as one
    /// transaction.
    pub async fn compose_and_initialize<C: ChainClient, R: Registry>(
        self,
        addresses: &HashMap<String, Address>,
        deployer: &ArtifactDeployer<'_, C, R>,
    ) -> Result<DeployedArtifact, DeployError> {
        let prepared = self.prepare(addresses)?;

        if let Some(init) = &prepared.init {
            tracing::info!(
                composite = %self.name,
                facets = self.facets.len(),
                init = %init.signature,
                init_facet = %init.facet,
                "Composing"
            );
        }

        deployer.deploy(&prepared).await
    }
}

/// `(address owner, (address,uint8,bytes4[])[] cut, (address,bytes) init)`.
fn proxy_constructor_types() -> Vec<DynSolType> {
    let facet_cut = DynSolType::Tuple(vec![
        DynSolType::Address,
        DynSolType::Uint(8),
        DynSolType::Array(Box::new(DynSolType::FixedBytes(4))),
    ]);

    vec![
        DynSolType::Address,
        DynSolType::Array(Box::new(facet_cut)),
        DynSolType::Tuple(vec![DynSolType::Address, DynSolType::Bytes]),
    ]
}

fn encode_proxy_constructor(owner: Address, cut: &[FacetCut], init: &InitCall) -> Vec<u8> {
    let cut = cut
        .iter()
        .map(|facet| {
            DynSolValue::Tuple(vec![
                DynSolValue::Address(facet.address),
                DynSolValue::Uint(U256::from(ADD_ACTION), 8),
                DynSolValue::Array(
                    facet
                        .selectors
                        .iter()
                        .map(|selector| {
                            DynSolValue::FixedBytes(B256::right_padding_from(selector.as_slice()), 4)
                        })
                        .collect(),
                ),
            ])
        })
        .collect();

    DynSolValue::Tuple(vec![
        DynSolValue::Address(owner),
        DynSolValue::Array(cut),
        DynSolValue::Tuple(vec![
            DynSolValue::Address(init.target),
            DynSolValue::Bytes(init.calldata.to_vec()),
        ]),
    ])
    .abi_encode_params()
}

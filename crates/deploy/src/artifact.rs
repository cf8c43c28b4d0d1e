//! Declared deployable artifacts.
//!
//! Artifacts are declared before a run starts. Their addresses are not part
//! of the declaration: they are assigned by the deployer and recorded in the
//! [`Registry`](crate::Registry).

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::abi::ArgValue;

/// The one-shot initialization call executed against a composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitDirective {
    /// Name of the initializer function, looked up among the facets.
    pub method: String,
    /// Arguments passed to the initializer.
    pub args: Vec<ArgValue>,
}

/// A proxy ("diamond") composed of several facets under one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeSpec {
    /// Name of the proxy contract in the artifact source.
    pub proxy: String,
    /// Owner of the composite, allowed to cut facets later on.
    pub owner: Address,
    /// Facet artifacts, in cut order.
    pub facets: Vec<String>,
    /// Initializer executed as part of the creation.
    pub init: InitDirective,
}

/// What an artifact is, and how it gets deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A standalone library, linked into dependents.
    Library,
    /// Logic composed into a composite, never called directly.
    Facet,
    /// A proxy aggregating facets.
    Composite(CompositeSpec),
}

impl ArtifactKind {
    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Library => "library",
            Self::Facet => "facet",
            Self::Composite(_) => "composite",
        }
    }
}

/// A named deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique name, also used to look up the compiled artifact.
    pub name: String,
    pub kind: ArtifactKind,
    pub constructor_args: Vec<ArgValue>,
    /// Libraries that must be deployed, and linked, before this artifact.
    pub library_dependencies: Vec<String>,
}

impl Artifact {
    fn new(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
            constructor_args: Vec::new(),
            library_dependencies: Vec::new(),
        }
    }

    /// Declare a library.
    pub fn library(name: impl Into<String>) -> Self {
        Self::new(name, ArtifactKind::Library)
    }

    /// Declare a facet.
    pub fn facet(name: impl Into<String>) -> Self {
        Self::new(name, ArtifactKind::Facet)
    }

    /// Declare a composite.
    pub fn composite(name: impl Into<String>, spec: CompositeSpec) -> Self {
        Self::new(name, ArtifactKind::Composite(spec))
    }

    /// Set the constructor arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = ArgValue>) -> Self {
        self.constructor_args = args.into_iter().collect();
        self
    }

    /// Add library dependencies. Repeated names are kept once.
    pub fn depends_on<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for library in libraries {
            let library = library.into();
            if !self.library_dependencies.contains(&library) {
                self.library_dependencies.push(library);
            }
        }
        self
    }

    /// The composite description, if this artifact is one.
    pub fn composite_spec(&self) -> Option<&CompositeSpec> {
        match &self.kind {
            ArtifactKind::Composite(spec) => Some(spec),
            _ => None,
        }
    }

    /// Everything that must be confirmed before this artifact can be deployed:
    /// its libraries, then its facets for a composite.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        let facets = self
            .composite_spec()
            .map(|spec| spec.facets.as_slice())
            .unwrap_or_default();

        self.library_dependencies
            .iter()
            .chain(facets)
            .map(String::as_str)
    }
}

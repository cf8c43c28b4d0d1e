//! Dependency resolution.
//!
//! Turns the declared artifacts into a [`DeploymentPlan`]: every artifact
//! comes after all of its dependencies, and artifacts with no ordering
//! constraint between them keep their declaration order.

use std::collections::HashMap;

use crate::{
    artifact::{Artifact, ArtifactKind},
    error::ConfigurationError,
};

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    /// Index of the artifact in the declarations.
    pub index: usize,
    pub name: String,
    pub kind: &'static str,
    /// Names this step waits for.
    pub dependencies: Vec<String>,
}

/// Artifacts in deployment order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeploymentPlan {
    steps: Vec<PlanStep>,
}

impl DeploymentPlan {
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Artifact names in plan order.
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    /// Position of an artifact in the plan.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name == name)
    }
}

/// Resolve the declared artifacts into a plan.
///
/// Fails without side effects on duplicate names, undeclared dependencies,
/// malformed composites and dependency cycles.
pub fn resolve(artifacts: &[Artifact]) -> Result<DeploymentPlan, ConfigurationError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(artifacts.len());
    for (i, artifact) in artifacts.iter().enumerate() {
        if index.insert(artifact.name.as_str(), i).is_some() {
            return Err(ConfigurationError::DuplicateArtifact {
                name: artifact.name.clone(),
            });
        }
    }

    for artifact in artifacts {
        validate(artifact, artifacts, &index)?;
    }

    let dependencies: Vec<Vec<usize>> = artifacts
        .iter()
        .map(|artifact| artifact.dependencies().map(|name| index[name]).collect())
        .collect();

    let mut placed = vec![false; artifacts.len()];
    let mut steps = Vec::with_capacity(artifacts.len());

    while steps.len() < artifacts.len() {
        // Earliest declared artifact whose dependencies are all placed.
        let ready = (0..artifacts.len())
            .find(|&i| !placed[i] && dependencies[i].iter().all(|&dep| placed[dep]));

        let Some(i) = ready else {
            return Err(ConfigurationError::CyclicDependency {
                cycle: find_cycle(artifacts, &dependencies, &placed),
            });
        };

        placed[i] = true;
        steps.push(PlanStep {
            index: i,
            name: artifacts[i].name.clone(),
            kind: artifacts[i].kind.label(),
            dependencies: artifacts[i].dependencies().map(String::from).collect(),
        });
    }

    tracing::debug!(steps = steps.len(), "Deployment plan resolved");

    Ok(DeploymentPlan { steps })
}

fn validate(
    artifact: &Artifact,
    artifacts: &[Artifact],
    index: &HashMap<&str, usize>,
) -> Result<(), ConfigurationError> {
    for dependency in &artifact.library_dependencies {
        if !index.contains_key(dependency.as_str()) {
            return Err(ConfigurationError::MissingDependency {
                artifact: artifact.name.clone(),
                dependency: dependency.clone(),
            });
        }
    }

    let Some(spec) = artifact.composite_spec() else {
        return Ok(());
    };

    if spec.facets.is_empty() {
        return Err(ConfigurationError::EmptyComposite {
            composite: artifact.name.clone(),
        });
    }

    for (i, facet) in spec.facets.iter().enumerate() {
        if spec.facets[..i].contains(facet) {
            return Err(ConfigurationError::DuplicateFacet {
                composite: artifact.name.clone(),
                facet: facet.clone(),
            });
        }

        let Some(&position) = index.get(facet.as_str()) else {
            return Err(ConfigurationError::UnknownFacet {
                composite: artifact.name.clone(),
                facet: facet.clone(),
            });
        };

        let declared = &artifacts[position].kind;
        if !matches!(declared, ArtifactKind::Facet) {
            return Err(ConfigurationError::NotAFacet {
                composite: artifact.name.clone(),
                artifact: facet.clone(),
                kind: declared.label().to_string(),
            });
        }
    }

    Ok(())
}

/// Name a cycle among the unplaced artifacts.
///
/// Every unplaced artifact has at least one unplaced dependency, so following
/// those edges from any of them must eventually revisit a node.
fn find_cycle(artifacts: &[Artifact], dependencies: &[Vec<usize>], placed: &[bool]) -> Vec<String> {
    let Some(start) = placed.iter().position(|placed| !placed) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = dependencies[current]
            .iter()
            .copied()
            .find(|&dep| !placed[dep])
            .unwrap_or(current);

        if let Some(seen) = path.iter().position(|&node| node == next) {
            let mut cycle: Vec<String> = path[seen..]
                .iter()
                .map(|&node| artifacts[node].name.clone())
                .collect();
            cycle.push(artifacts[next].name.clone());
            return cycle;
        }

        path.push(next);
        current = next;
    }
}

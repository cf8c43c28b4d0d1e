//! Composite initialization.
//!
//! The initializer is not a separate transaction: its calldata is folded into
//! the composite's creation payload and delegate-called by the proxy
//! constructor, so a composite never exists uninitialized. What remains here
//! is resolving which facet implements the initializer and encoding the call.
//! The deployer records the outcome in the registry's initialization ledger,
//! which is what keeps the call at most once per composite address.

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Address, Bytes},
};

use crate::{
    abi::{encode_call, find_function},
    artifact::InitDirective,
    error::ConfigurationError,
};

/// A facet as needed to resolve the initializer.
#[derive(Debug, Clone, Copy)]
pub struct FacetAbi<'a> {
    pub name: &'a str,
    pub address: Address,
    pub abi: &'a JsonAbi,
}

/// The resolved initializer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCall {
    pub method: String,
    /// Canonical signature, e.g. `init(uint256,uint256,uint256,address[])`.
    pub signature: String,
    /// Facet implementing the initializer.
    pub facet: String,
    /// Address the proxy delegate-calls into.
    pub target: Address,
    pub calldata: Bytes,
}

impl InitCall {
    /// Find the first facet, in cut order, declaring the initializer with a
    /// matching arity and encode the call.
    pub fn resolve(
        composite: &str,
        directive: &InitDirective,
        facets: &[FacetAbi<'_>],
    ) -> Result<Self, ConfigurationError> {
        let arity = directive.args.len();

        let (facet, function) = facets
            .iter()
            .find_map(|facet| {
                find_function(facet.abi, &directive.method, arity).map(|function| (facet, function))
            })
            .ok_or_else(|| ConfigurationError::MissingInitMethod {
                composite: composite.to_string(),
                method: directive.method.clone(),
                arity,
            })?;

        let calldata = encode_call(function, &directive.args).map_err(|reason| {
            ConfigurationError::ArgumentMismatch {
                artifact: composite.to_string(),
                reason: format!("{}: {reason}", function.signature()),
            }
        })?;

        Ok(Self {
            method: directive.method.clone(),
            signature: function.signature(),
            facet: facet.name.to_string(),
            target: facet.address,
            calldata,
        })
    }
}

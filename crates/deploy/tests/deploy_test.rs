//! End-to-end deployment of the rollups composite against an in-memory chain
//! and a registry persisted on disk.
//!
//! Run with: cargo test --test deploy_test

use std::time::Duration;

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    json_abi::JsonAbi,
    primitives::Address,
};
use facetsmith_deploy::{
    ArgValue, Artifact, CompiledArtifact, CompositeSpec, DeployError, Fault, FileRegistry,
    InitDirective, InitState, LinkReference, MemoryChain, MemorySource, Orchestrator,
    OrchestratorOptions, Registry,
    abi::{encode_call, find_function},
};
use tempdir::TempDir;

const COMPOSITE: &str = "CartesiRollups";
const NETWORK: &str = "localhost";

/// A 20-byte library placeholder.
const PLACEHOLDER: &str = "__$9d2c8d4a04b1a1e5a58a8a1fd0e8a87f5b$__";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn abi(value: serde_json::Value) -> JsonAbi {
    serde_json::from_value(value).expect("valid abi")
}

fn function(name: &str, inputs: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "name": name,
        "stateMutability": "nonpayable",
        "inputs": inputs,
        "outputs": []
    })
}

fn rollups_facet_abi() -> JsonAbi {
    abi(serde_json::json!([
        function(
            "init",
            serde_json::json!([
                { "name": "_inputDuration", "type": "uint256" },
                { "name": "_challengePeriod", "type": "uint256" },
                { "name": "_inputLog2Size", "type": "uint256" },
                { "name": "_validators", "type": "address[]" }
            ])
        ),
        function("getCurrentPhase", serde_json::json!([])),
    ]))
}

fn plain(name: &str, abi: JsonAbi) -> CompiledArtifact {
    CompiledArtifact {
        name: name.to_string(),
        abi,
        bytecode: "0x6080604052".to_string(),
        link_references: vec![],
    }
}

fn linked(name: &str, abi: JsonAbi, library: &str) -> CompiledArtifact {
    CompiledArtifact {
        name: name.to_string(),
        abi,
        bytecode: format!("0x73{PLACEHOLDER}3014"),
        link_references: vec![LinkReference {
            library: library.to_string(),
            start: 1,
            length: 20,
        }],
    }
}

fn diamond() -> CompiledArtifact {
    plain(
        "Diamond",
        abi(serde_json::json!([
            {
                "type": "constructor",
                "stateMutability": "payable",
                "inputs": [
                    { "name": "_contractOwner", "type": "address" },
                    {
                        "name": "_diamondCut",
                        "type": "tuple[]",
                        "components": [
                            { "name": "facetAddress", "type": "address" },
                            { "name": "action", "type": "uint8" },
                            { "name": "functionSelectors", "type": "bytes4[]" }
                        ]
                    },
                    {
                        "name": "_args",
                        "type": "tuple",
                        "components": [
                            { "name": "initContract", "type": "address" },
                            { "name": "initCalldata", "type": "bytes" }
                        ]
                    }
                ]
            }
        ])),
    )
}

fn source() -> MemorySource {
    let mut source = MemorySource::new();
    source
        .insert(plain("Bitmask", JsonAbi::default()))
        .insert(plain("CartesiMath", JsonAbi::default()))
        .insert(linked("Merkle", JsonAbi::default(), "CartesiMath"))
        .insert(linked(
            "InputFacet",
            abi(serde_json::json!([
                function("addInput", serde_json::json!([{ "name": "_input", "type": "bytes" }])),
                function("getInput", serde_json::json!([{ "name": "_index", "type": "uint256" }])),
            ])),
            "Bitmask",
        ))
        .insert(linked("RollupsFacet", rollups_facet_abi(), "Merkle"))
        .insert(diamond());
    source
}

fn validators() -> Vec<Address> {
    vec![
        Address::repeat_byte(0xa),
        Address::repeat_byte(0xb),
        Address::repeat_byte(0xc),
    ]
}

fn init_args(validators: Vec<Address>) -> Vec<ArgValue> {
    vec![
        ArgValue::Number(86400),
        ArgValue::Number(604800),
        ArgValue::Number(7),
        ArgValue::from(validators),
    ]
}

fn declarations(validators: Vec<Address>) -> Vec<Artifact> {
    vec![
        Artifact::library("Bitmask"),
        Artifact::library("CartesiMath"),
        Artifact::library("Merkle").depends_on(["CartesiMath"]),
        Artifact::facet("InputFacet").depends_on(["Bitmask", "Merkle"]),
        Artifact::facet("RollupsFacet").depends_on(["Bitmask", "Merkle"]),
        Artifact::composite(
            COMPOSITE,
            CompositeSpec {
                proxy: "Diamond".to_string(),
                owner: Address::repeat_byte(0x0f),
                facets: vec!["InputFacet".to_string(), "RollupsFacet".to_string()],
                init: InitDirective {
                    method: "init".to_string(),
                    args: init_args(validators),
                },
            },
        )
        .depends_on(["Bitmask", "Merkle"]),
    ]
}

fn orchestrator<'c>(
    chain: &'c MemoryChain,
    temp_dir: &TempDir,
) -> Orchestrator<MemorySource, &'c MemoryChain, FileRegistry> {
    let registry = FileRegistry::open(temp_dir.path(), NETWORK).expect("Failed to open registry");
    Orchestrator::new(source(), chain, registry).with_options(OrchestratorOptions {
        max_parallel: 3,
        confirmation_timeout: Duration::from_secs(5),
    })
}

/// The `(initTarget, initCalldata)` tuple of a composite creation payload.
fn init_of(payload: &[u8]) -> (Address, Vec<u8>) {
    let facet_cut = DynSolType::Tuple(vec![
        DynSolType::Address,
        DynSolType::Uint(8),
        DynSolType::Array(Box::new(DynSolType::FixedBytes(4))),
    ]);
    let constructor = DynSolType::Tuple(vec![
        DynSolType::Address,
        DynSolType::Array(Box::new(facet_cut)),
        DynSolType::Tuple(vec![DynSolType::Address, DynSolType::Bytes]),
    ]);

    // Skip the proxy bytecode.
    let DynSolValue::Tuple(values) = constructor
        .abi_decode_params(&payload[5..])
        .expect("constructor arguments decode")
    else {
        panic!("constructor arguments are a tuple");
    };

    match &values[2] {
        DynSolValue::Tuple(init) => match (&init[0], &init[1]) {
            (DynSolValue::Address(target), DynSolValue::Bytes(calldata)) => {
                (*target, calldata.clone())
            }
            other => panic!("unexpected init tuple {other:?}"),
        },
        other => panic!("unexpected init value {other:?}"),
    }
}

#[tokio::test]
async fn test_rollups_deployment() {
    init_logging();
    let temp_dir = TempDir::new("facetsmith-test").expect("Failed to create temp dir");
    let chain = MemoryChain::default();

    let report = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .expect("Deployment should succeed");

    // Plan order.
    let plan = report.plan.names();
    let position = |name: &str| plan.iter().position(|n| *n == name).unwrap();
    assert!(position("Bitmask") < position("CartesiMath"));
    assert!(position("CartesiMath") < position("Merkle"));
    assert!(position("Merkle") < position(COMPOSITE));
    assert_eq!(plan.last(), Some(&COMPOSITE));

    // The composite is created after every facet confirmed.
    let submissions = chain.submissions();
    let submitted = |name: &str| {
        submissions
            .iter()
            .position(|record| record.artifact == name)
            .unwrap()
    };
    assert!(submitted("InputFacet") < submitted(COMPOSITE));
    assert!(submitted("RollupsFacet") < submitted(COMPOSITE));

    // Initialized exactly once, with validators [A, B, C].
    assert_eq!(chain.submissions_of(COMPOSITE), 1);
    let composite = &submissions[submitted(COMPOSITE)];
    assert!(composite.initializes);

    let rollups_abi = rollups_facet_abi();
    let init = find_function(&rollups_abi, "init", 4).expect("init is declared");
    let expected = encode_call(init, &init_args(validators())).expect("encodes");

    let (target, calldata) = init_of(&composite.payload);
    assert_eq!(Some(target), report.address_of("RollupsFacet"));
    assert_eq!(calldata, expected.to_vec());

    let composite_address = report.composite_address().expect("composite deployed");
    assert_eq!(composite_address, composite.address);

    let registry = FileRegistry::open(temp_dir.path(), NETWORK).unwrap();
    let record = registry
        .init_record(&composite_address)
        .unwrap()
        .expect("initialization recorded");
    assert_eq!(record.state, InitState::Initialized);
    assert!(registry.read().unwrap().pending.is_empty());
}

#[tokio::test]
async fn test_rerun_submits_nothing() {
    init_logging();
    let temp_dir = TempDir::new("facetsmith-test").expect("Failed to create temp dir");
    let chain = MemoryChain::default();

    let first = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .expect("First deployment should succeed");
    let submitted = chain.submission_count();
    assert_eq!(submitted, 6);

    // A fresh orchestrator over the persisted registry.
    let second = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .expect("Second deployment should succeed");

    assert_eq!(chain.submission_count(), submitted, "Re-run must not submit anything");
    assert_eq!(second.new_deployments(), 0);
    assert_eq!(first.composite_address(), second.composite_address());
}

#[tokio::test]
async fn test_timeout_then_reattach() {
    init_logging();
    let temp_dir = TempDir::new("facetsmith-test").expect("Failed to create temp dir");
    let chain = MemoryChain::default();

    chain.inject("Merkle", Fault::TimeoutOnce);
    let err = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ConfirmationTimeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.artifact(), Some("Merkle"));
    assert_eq!(chain.submissions_of(COMPOSITE), 0);

    let report = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .expect("Re-run should re-attach and finish");

    assert_eq!(chain.submissions_of("Merkle"), 1, "Merkle must not be resubmitted");
    assert!(report.composite_address().is_some());
}

#[tokio::test]
async fn test_reverted_creation_aborts_the_plan() {
    init_logging();
    let temp_dir = TempDir::new("facetsmith-test").expect("Failed to create temp dir");
    let chain = MemoryChain::default();

    chain.inject("CartesiMath", Fault::Revert("out of gas".to_string()));
    let err = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::TransactionReverted { .. }));
    assert_eq!(err.artifact(), Some("CartesiMath"));
    assert_eq!(chain.submissions_of("Merkle"), 0);
    assert_eq!(chain.submissions_of(COMPOSITE), 0);

    let registry = FileRegistry::open(temp_dir.path(), NETWORK).unwrap();
    assert!(registry.read().unwrap().pending.is_empty());
}

#[tokio::test]
async fn test_failed_initialization_needs_operator() {
    init_logging();
    let temp_dir = TempDir::new("facetsmith-test").expect("Failed to create temp dir");
    let chain = MemoryChain::default();

    chain.inject(COMPOSITE, Fault::InitRevert("validators rejected".to_string()));
    let err = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .unwrap_err();

    let DeployError::PartialInitialization { address, .. } = err else {
        panic!("expected a partial initialization, got {err:?}");
    };

    // Re-running surfaces the same failure and never retries the initializer.
    let err = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::PartialInitialization { address: a, .. } if a == address
    ));
    assert_eq!(chain.submissions_of(COMPOSITE), 1);

    // Forgetting the composite lets the next run create a fresh one.
    let registry = FileRegistry::open(temp_dir.path(), NETWORK).unwrap();
    assert_eq!(registry.forget(COMPOSITE).unwrap(), 2);

    let report = orchestrator(&chain, &temp_dir)
        .run(&declarations(validators()))
        .await
        .expect("Deployment after forget should succeed");
    assert_ne!(report.composite_address(), Some(address));
    assert_eq!(chain.submissions_of(COMPOSITE), 2);
    assert_eq!(report.new_deployments(), 1);
}

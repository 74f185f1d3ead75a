use tessera_common::crypto::{KeyKind, Privatekey};
use tessera_common::env::Height;
use tessera_common::error::TesseraError;
use tessera_node::config::{NodeDesign, StorageKind};
use tessera_node::{build_runtime, exit_code, init_genesis};

fn design(dir: &std::path::Path, threshold: f64) -> NodeDesign {
    let key = Privatekey::generate(KeyKind::Btc);
    let json = serde_json::json!({
        "network_id": "config-scenarios",
        "address": "solo",
        "privatekey": key.to_string(),
        "data_dir": dir.join("data"),
        "nodes": [ { "address": "solo", "publickey": key.publickey().to_string() } ],
        "genesis_policy": { "threshold": threshold, "num_acting_suffrage_nodes": 1 },
        "genesis_operations": [ { "key": "motd", "value": "hello" } ]
    });
    let path = dir.join("node.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&json).unwrap()).unwrap();
    NodeDesign::load_from_file(&path).unwrap()
}

#[tokio::test]
async fn minority_threshold_is_rejected_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let design = design(dir.path(), 0.4);

    let err = build_runtime(&design).await.err().unwrap();
    assert!(matches!(err, TesseraError::Config(_)), "{err}");
    assert_eq!(exit_code(&err), 1);

    let err = init_genesis(&design, false).await.unwrap_err();
    assert_eq!(exit_code(&err), 1);
    assert!(!dir.path().join("data").exists());
}

#[tokio::test]
async fn init_refuses_an_existing_chain_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let design = design(dir.path(), 67.0);
    assert_eq!(design.storage, StorageKind::Redb);

    let first = init_genesis(&design, false).await.unwrap();
    assert_eq!(first.height(), Height(0));
    assert!(first.states.iter().any(|s| s.key == "motd" && s.value == b"hello".to_vec()));

    let err = init_genesis(&design, false).await.unwrap_err();
    assert!(err.is_duplicate(), "{err}");

    let again = init_genesis(&design, true).await.unwrap();
    assert_eq!(again.height(), Height(0));
}

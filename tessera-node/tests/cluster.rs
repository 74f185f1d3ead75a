mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_common::env::{Height, Round, Seal, Stage};
use tessera_common::utils::Address;
use tessera_consensus::StateKind;

use common::{eventually, Cluster};

#[tokio::test]
async fn three_nodes_commit_an_operation() {
    let mut cluster = Cluster::new(3, &[0, 1, 2]).await;
    for i in 0..3 {
        cluster.start(i);
    }
    eventually(Duration::from_secs(2), "nodes out of booting", || {
        (0..3).all(|i| cluster.runtime(i).state() != StateKind::Booting)
    })
    .await;

    let op = cluster.kv_operation(0, "scenario-a", "k", "v");
    cluster.submit(op.clone()).await;

    eventually(Duration::from_secs(10), "k committed on every node", || {
        cluster.storages.iter().all(|s| s.state("k").ok().flatten().is_some_and(|st| st.value == b"v".to_vec()))
    })
    .await;

    for i in 0..3 {
        let genesis = cluster.block(i, Height(0));
        let first = cluster.block(i, Height(1));
        assert_eq!(first.manifest.previous_block, genesis.hash());

        let height = cluster.storages[i].state("k").unwrap().unwrap().height;
        let block = cluster.block(i, height);
        assert!(block.operations.iter().any(|o| o.hash == op.hash));
        assert_eq!(block.hash(), cluster.block(0, height).hash(), "n{i} diverged at {height}");
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn silent_proposer_moves_the_round() {
    let mut cluster = Cluster::new(3, &[0, 1, 2]).await;

    // round-robin over n0, n1, n2 picks n1 for height 1 round 0
    let silent = cluster.address(1);
    let encoders = cluster.encoders.clone();
    cluster.network.set_filter(
        &silent,
        Arc::new(move |_to: &Address, bytes: &[u8]| {
            !matches!(encoders.decode_seal(bytes), Ok(Seal::Ballot(b)) if b.stage() == Stage::Proposal)
        }),
    );
    for i in 0..3 {
        cluster.start(i);
    }
    for i in 0..3 {
        cluster.wait_height(i, Height(1), Duration::from_secs(15)).await;
    }

    let first = cluster.block(0, Height(1));
    assert!(first.round() >= Round(1), "height 1 closed in round {}", first.round());
    for i in 1..3 {
        assert_eq!(cluster.block(i, Height(1)).hash(), first.hash());
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn late_joiner_syncs_and_joins() {
    let mut cluster = Cluster::new(4, &[0, 1, 2]).await;
    for i in 0..3 {
        cluster.start(i);
    }
    cluster.wait_height(0, Height(10), Duration::from_secs(60)).await;

    cluster.start(3);
    let seen = Arc::new(Mutex::new(vec![cluster.runtime(3).state()]));
    let mut watch = cluster.runtime(3).subscribe_state();
    let recorder = {
        let seen = seen.clone();
        tokio::spawn(async move {
            while watch.changed().await.is_ok() {
                let kind = *watch.borrow_and_update();
                seen.lock().unwrap().push(kind);
            }
        })
    };

    cluster.wait_height(3, Height(10), Duration::from_secs(30)).await;
    eventually(Duration::from_secs(30), "n3 in consensus", || cluster.runtime(3).state() == StateKind::Consensus).await;
    recorder.abort();

    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&StateKind::Syncing), "states seen: {seen:?}");
    assert_eq!(seen.last(), Some(&StateKind::Consensus), "states seen: {seen:?}");

    for h in 0..=10 {
        assert_eq!(cluster.block(3, Height(h)).hash(), cluster.block(0, Height(h)).hash(), "height {h}");
    }
    cluster.shutdown().await;
}

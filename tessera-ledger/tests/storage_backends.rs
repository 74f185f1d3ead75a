use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_common::crypto::{FixedTreeGenerator, Hash, Privatekey};
use tessera_common::env::block::operation_tree_node;
use tessera_common::env::voteproof::VoteproofVote;
use tessera_common::env::{
    Ballot, BallotFact, Block, ConsensusInfo, FactSign, Height, InitFact, KvSetFact, Manifest, NetworkId, Operation,
    OperationFact, ProposalFact, Round, Seal, State, SuffrageInfo, ThresholdRatio, VoteResult, Voteproof,
};
use tessera_common::utils::{time, Address};
use tessera_common::TesseraError;
use tessera_ledger::{MemoryStorage, RedbStorage, Storage};

fn net() -> NetworkId {
    NetworkId::new("ledger-test")
}

fn init_voteproof(height: Height, node: &Address, pk: &Privatekey) -> Voteproof {
    let fact = BallotFact::Init(InitFact { height, round: Round(0), previous_block: Hash::zero() });
    let mut votes = BTreeMap::new();
    votes.insert(
        node.clone(),
        VoteproofVote { fact: fact.hash(), sign: FactSign::new(pk, &fact.hash(), &net()).unwrap() },
    );
    let mut facts = BTreeMap::new();
    facts.insert(fact.hash(), fact.clone());
    Voteproof {
        hint: Voteproof::new_hint(),
        height,
        round: Round(0),
        stage: fact.stage(),
        result: VoteResult::Majority,
        majority: Some(fact),
        facts,
        votes,
        suffrages: vec![node.clone()],
        threshold_ratio: ThresholdRatio::DEFAULT,
        finished_at: time::utc_now(),
        closed: false,
    }
}

fn block_at(height: Height, previous: Hash, operations: Vec<Operation>) -> Block {
    let node = Address::new("n0").unwrap();
    let pk = Privatekey::new_btc();
    let ivp = init_voteproof(height, &node, &pk);
    let proposal = Ballot::new(
        node.clone(),
        BallotFact::Proposal(ProposalFact {
            height,
            round: Round(0),
            proposer: node.clone(),
            operations: operations.iter().map(|o| o.hash).collect(),
            seals: vec![],
        }),
        Some(ivp.clone()),
        None,
        &pk,
        &net(),
    )
    .unwrap();

    let mut gen = FixedTreeGenerator::new(operations.len());
    for (i, op) in operations.iter().enumerate() {
        gen.add(operation_tree_node(i as u64, &op.fact_hash(), true, None)).unwrap();
    }
    let ops_tree = gen.tree().unwrap();
    let states_tree = FixedTreeGenerator::new(0).tree().unwrap();

    let manifest = Manifest::new(
        height,
        Round(0),
        proposal.fact_hash(),
        previous,
        ops_tree.root(),
        states_tree.root(),
        time::utc_now(),
    );
    Block::new(
        manifest,
        operations,
        ops_tree,
        vec![],
        states_tree,
        ConsensusInfo {
            init_voteproof: ivp,
            accept_voteproof: None,
            suffrage: SuffrageInfo { proposer: node.clone(), nodes: vec![node] },
            proposal,
        },
    )
}

fn kv_op(pk: &Privatekey, token: &str) -> Operation {
    Operation::new(OperationFact::KvSet(KvSetFact::new(token, "k", "v").unwrap()), pk, &net()).unwrap()
}

fn backends() -> Vec<(Arc<dyn Storage>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let redb: Arc<dyn Storage> = Arc::new(RedbStorage::open(dir.path()).unwrap());
    vec![(Arc::new(MemoryStorage::new()), None), (redb, Some(dir))]
}

#[test]
fn test_block_chain_commit() {
    for (storage, _dir) in backends() {
        assert!(storage.last_manifest().unwrap().is_none());

        let genesis = block_at(Height::GENESIS, Hash::zero(), vec![]);
        assert!(genesis.is_valid(&net()).is_ok());
        storage.open_block_tx(genesis.clone()).unwrap().commit().unwrap();

        let b1 = block_at(Height(1), genesis.hash(), vec![]);
        let mut tx = storage.open_block_tx(b1.clone()).unwrap();
        tx.state_put(vec![State::new("k", b"v".to_vec(), Height(1), Height::PRE_GENESIS, vec![])]);
        tx.commit().unwrap();

        assert_eq!(storage.last_manifest().unwrap().unwrap(), b1.manifest);
        assert_eq!(storage.manifest_by_height(Height::GENESIS).unwrap().unwrap(), genesis.manifest);
        assert_eq!(storage.block_by_height(Height(1)).unwrap().unwrap().hash(), b1.hash());
        assert_eq!(storage.manifests(Height(0), Height(5)).unwrap().len(), 2);
        assert_eq!(storage.state("k").unwrap().unwrap().value, b"v".to_vec());
    }
}

#[test]
fn test_out_of_order_block_is_refused() {
    for (storage, _dir) in backends() {
        let not_genesis = block_at(Height(1), Hash::zero(), vec![]);
        assert!(storage.open_block_tx(not_genesis).is_err());

        let genesis = block_at(Height::GENESIS, Hash::zero(), vec![]);
        storage.open_block_tx(genesis).unwrap().commit().unwrap();

        let wrong_parent = block_at(Height(1), Hash::sha256(b"elsewhere"), vec![]);
        assert!(storage.open_block_tx(wrong_parent).is_err());
    }
}

#[test]
fn test_seal_written_once() {
    for (storage, _dir) in backends() {
        let pk = Privatekey::new_btc();
        let seal = Seal::Operation(
            tessera_common::env::OperationSeal::new(vec![kv_op(&pk, "t")], &pk, &net()).unwrap(),
        );
        storage.new_seal(&seal).unwrap();
        let err = storage.new_seal(&seal).unwrap_err();
        assert!(matches!(err, TesseraError::Duplicate(_)));
        assert!(storage.has_seal(&seal.hash()).unwrap());
        assert_eq!(storage.seal_by_hash(&seal.hash()).unwrap().unwrap(), seal);
    }
}

#[test]
fn test_staged_operations_leave_after_commit() {
    for (storage, _dir) in backends() {
        let pk = Privatekey::new_btc();
        let a = kv_op(&pk, "a");
        let b = kv_op(&pk, "b");
        storage.new_operations(&[a.clone(), b.clone()]).unwrap();
        storage.new_operations(&[a.clone()]).unwrap();

        let staged = storage.staged_operations(10).unwrap();
        assert_eq!(staged.iter().map(|o| o.hash).collect::<Vec<_>>(), vec![a.hash, b.hash]);
        assert_eq!(storage.staged_operations(1).unwrap().len(), 1);

        let genesis = block_at(Height::GENESIS, Hash::zero(), vec![a.clone()]);
        storage.open_block_tx(genesis).unwrap().commit().unwrap();

        assert!(storage.has_operation_fact(&a.fact_hash()).unwrap());
        assert!(storage.has_token(&pk.publickey(), b"a").unwrap());
        assert!(!storage.has_token(&pk.publickey(), b"b").unwrap());
        let staged = storage.staged_operations(10).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].hash, b.hash);
        assert!(storage.operation(&a.hash).unwrap().is_some());
    }
}

#[test]
fn test_clean_wipes_everything() {
    for (storage, _dir) in backends() {
        let genesis = block_at(Height::GENESIS, Hash::zero(), vec![]);
        storage.new_proposal(&genesis.consensus.proposal).unwrap();
        storage.open_block_tx(genesis.clone()).unwrap().commit().unwrap();
        assert!(storage.proposal(&genesis.manifest.proposal).unwrap().is_some());

        storage.clean().unwrap();
        assert!(storage.last_block().unwrap().is_none());
        assert!(storage.proposal(&genesis.manifest.proposal).unwrap().is_none());
        storage.open_block_tx(genesis).unwrap().commit().unwrap();
    }
}

#[test]
fn test_redb_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = block_at(Height::GENESIS, Hash::zero(), vec![]);
    {
        let storage = RedbStorage::open(dir.path()).unwrap();
        let storage: &dyn Storage = &storage;
        storage.open_block_tx(genesis.clone()).unwrap().commit().unwrap();
    }
    let storage = RedbStorage::open(dir.path()).unwrap();
    assert_eq!(storage.last_manifest().unwrap().unwrap().hash, genesis.hash());
}

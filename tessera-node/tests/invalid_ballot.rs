mod common;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_common::crypto::{KeyKind, Privatekey};
use tessera_common::env::{Ballot, BallotFact, Height, InitFact, Round, Seal, Stage};
use tessera_common::utils::Address;

use common::{eventually, network_id, Cluster};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[tokio::test]
async fn foreign_key_ballot_is_dropped() {
    let logs = Captured::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    // n1 and n2 stay down, so n0 keeps voting INIT for height 1 alone
    let mut cluster = Cluster::new(3, &[0, 1, 2]).await;
    cluster.start(0);
    let ballotbox = cluster.runtime(0).context().ballotbox.clone();
    let (h, r) = (Height(1), Round(0));
    eventually(Duration::from_secs(5), "own INIT vote", || ballotbox.count(h, r, Stage::Init) == 1).await;

    let avp = cluster.genesis.consensus.accept_voteproof.clone();
    let fact = BallotFact::Init(InitFact { height: h, round: r, previous_block: cluster.genesis.hash() });
    let outsider = Privatekey::generate(KeyKind::Btc);
    for node in [cluster.address(1), Address::from("intruder")] {
        let forged = Ballot::new(node, fact.clone(), avp.clone(), avp.clone(), &outsider, &network_id()).unwrap();
        cluster.runtime(0).seals().send(Seal::from(forged)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(ballotbox.count(h, r, Stage::Init), 1);
    assert!(ballotbox.voteproof(h, r, Stage::Init).map_or(true, |vp| !vp.is_finished()));
    assert_eq!(cluster.height(0), Height(0));
    let text = logs.text();
    assert_eq!(text.matches("invalid seal dropped").count(), 2, "{text}");

    cluster.shutdown().await;
}

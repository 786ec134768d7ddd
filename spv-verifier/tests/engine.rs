use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use spv_types::{Header, H256, MAX_BITS};
use spv_verifier::{
    Config, HeaderRecord, HeaderStore, PeerChannels, PeerRequest, RpcError, Verifier,
};
use tokio::sync::watch;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn genesis_header() -> Header {
    serde_json::from_value(serde_json::json!({
        "version": 1,
        "prev_block_hash": "0000000000000000000000000000000000000000000000000000000000000000",
        "merkle_root": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        "timestamp": 1_231_006_505,
        "bits": 486_604_799,
        "nonce": 2_083_236_893
    }))
    .expect("value is invalid")
}

// Mainnet block 1.
fn block_1_header() -> Header {
    serde_json::from_value(serde_json::json!({
        "version": 1,
        "prev_block_hash": "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        "merkle_root": "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098",
        "timestamp": 1_231_469_665,
        "bits": 486_604_799,
        "nonce": 2_573_394_689_u32
    }))
    .expect("value is invalid")
}

fn synthetic_header(prev_hash: &H256, time: u32, nonce: u32) -> Header {
    Header {
        version: 2,
        prev_block_hash: prev_hash.clone(),
        merkle_root: H256([0x5a; 32]),
        time,
        bits: MAX_BITS,
        nonce,
    }
}

fn record(header: &Header, height: u64) -> HeaderRecord {
    HeaderRecord {
        header: header.clone(),
        block_height: height,
    }
}

fn test_config(dir: &Path, skip_pow: bool) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        // Unroutable: tests must never hit the network.
        headers_url: "http://127.0.0.1:1/blockchain_headers".into(),
        download_timeout_secs: 1,
        request_retries: 5,
        skip_pow_verification: skip_pow,
        ..Config::default()
    }
}

fn seed_store(config: &Config, headers: &[(u64, Header)]) {
    let store = HeaderStore::open(config.headers_path()).unwrap();
    for (height, header) in headers {
        store.write_header(*height, header).unwrap();
    }
}

/// Stands in for a peer transport task: answers `get_header` requests from a
/// fixed table, or with an error record for unknown heights.
fn spawn_responder(mut channels: PeerChannels, replies: HashMap<u64, HeaderRecord>) {
    tokio::spawn(async move {
        while let Some(PeerRequest::GetHeader { height }) = channels.requests.recv().await {
            let reply = replies
                .get(&height)
                .cloned()
                .ok_or_else(|| RpcError(format!("no header at height {height}")));
            if channels.headers.send(reply).await.is_err() {
                break;
            }
        }
    });
}

async fn wait_for_tip(rx: &mut watch::Receiver<Option<u64>>, want: u64) {
    let reached = async {
        loop {
            if *rx.borrow_and_update() == Some(want) {
                break;
            }
            rx.changed().await.expect("verifier dropped the tip channel");
        }
    };
    tokio::time::timeout(Duration::from_secs(20), reached)
        .await
        .expect("timed out waiting for the tip");
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(3)).await;
}

#[tokio::test]
async fn accepts_a_valid_extension() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), false);
    seed_store(&config, &[(0, genesis_header())]);

    let mut verifier = Verifier::bootstrap(config.clone()).await.unwrap();
    let channels = verifier.add_peer("peer-a");
    let tips = channels.tips.clone();
    spawn_responder(channels, HashMap::new());

    tips.send(record(&block_1_header(), 1)).await.unwrap();

    let handle = verifier.start();
    let mut events = handle.tip_events();
    wait_for_tip(&mut events, 1).await;

    assert_eq!(handle.tip_height(), Some(1));
    assert_eq!(handle.read_header(1).unwrap(), Some(block_1_header()));
    assert_eq!(
        std::fs::metadata(config.headers_path()).unwrap().len(),
        160
    );

    handle.stop();
    assert!(!handle.is_running());
    handle.join().await.unwrap();
}

#[tokio::test]
async fn reorgs_onto_a_competing_branch() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), true);

    let genesis = genesis_header();
    let a1 = synthetic_header(&genesis.block_hash(), 1_231_469_001, 0xa1);
    let a2 = synthetic_header(&a1.block_hash(), 1_231_469_002, 0xa2);
    let b1 = synthetic_header(&genesis.block_hash(), 1_231_469_101, 0xb1);
    let b2 = synthetic_header(&b1.block_hash(), 1_231_469_102, 0xb2);
    seed_store(
        &config,
        &[(0, genesis.clone()), (1, a1.clone()), (2, a2.clone())],
    );

    let mut verifier = Verifier::bootstrap(config.clone()).await.unwrap();
    let channels = verifier.add_peer("peer-b");
    let tips = channels.tips.clone();
    spawn_responder(channels, HashMap::from([(1, record(&b1, 1))]));

    tips.send(record(&b2, 2)).await.unwrap();

    let handle = verifier.start();
    let overwritten = async {
        loop {
            if handle.read_header(1).unwrap() == Some(b1.clone()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(20), overwritten)
        .await
        .expect("timed out waiting for the reorg");

    // Same tip height, both records supplanted.
    assert_eq!(handle.tip_height(), Some(2));
    assert_eq!(handle.read_header(2).unwrap(), Some(b2));
    assert_eq!(
        std::fs::metadata(config.headers_path()).unwrap().len(),
        240
    );

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn rejects_weak_work_and_flags_the_peer() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), false);
    let genesis = genesis_header();
    seed_store(&config, &[(0, genesis.clone())]);

    let mut verifier = Verifier::bootstrap(config.clone()).await.unwrap();
    let channels_a = verifier.add_peer("peer-a");
    let channels_b = verifier.add_peer("peer-b");
    let tips_a = channels_a.tips.clone();
    let tips_b = channels_b.tips.clone();
    spawn_responder(channels_a, HashMap::new());
    spawn_responder(channels_b, HashMap::new());

    // A linked, correctly-bitted header that does not meet the target.
    let bogus = synthetic_header(&genesis.block_hash(), 1_231_469_665, 7);
    tips_a.send(record(&bogus, 1)).await.unwrap();

    let handle = verifier.start();
    settle().await;
    assert_eq!(handle.tip_height(), Some(0));
    assert_eq!(
        std::fs::metadata(config.headers_path()).unwrap().len(),
        80
    );

    // The peer is on cooldown now: even a real header from it is ignored.
    tips_a.send(record(&block_1_header(), 1)).await.unwrap();
    settle().await;
    assert_eq!(handle.tip_height(), Some(0));

    // The engine keeps going with the remaining peers.
    tips_b.send(record(&block_1_header(), 1)).await.unwrap();
    let mut events = handle.tip_events();
    wait_for_tip(&mut events, 1).await;
    assert_eq!(handle.read_header(1).unwrap(), Some(block_1_header()));

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn abandons_a_reorg_past_the_depth_cap() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), true);
    config.max_reorg_depth = 2;

    let genesis = genesis_header();
    let a1 = synthetic_header(&genesis.block_hash(), 1_231_469_001, 0xa1);
    let a2 = synthetic_header(&a1.block_hash(), 1_231_469_002, 0xa2);
    let a3 = synthetic_header(&a2.block_hash(), 1_231_469_003, 0xa3);
    seed_store(
        &config,
        &[
            (0, genesis.clone()),
            (1, a1.clone()),
            (2, a2.clone()),
            (3, a3.clone()),
        ],
    );

    let b1 = synthetic_header(&genesis.block_hash(), 1_231_469_101, 0xb1);
    let b2 = synthetic_header(&b1.block_hash(), 1_231_469_102, 0xb2);
    let b3 = synthetic_header(&b2.block_hash(), 1_231_469_103, 0xb3);
    let b4 = synthetic_header(&b3.block_hash(), 1_231_469_104, 0xb4);

    let mut verifier = Verifier::bootstrap(config.clone()).await.unwrap();
    let channels = verifier.add_peer("peer-b");
    let tips = channels.tips.clone();
    spawn_responder(
        channels,
        HashMap::from([
            (1, record(&b1, 1)),
            (2, record(&b2, 2)),
            (3, record(&b3, 3)),
        ]),
    );

    tips.send(record(&b4, 4)).await.unwrap();

    let handle = verifier.start();
    settle().await;

    // The walk-back hit the cap: nothing was written.
    assert_eq!(handle.tip_height(), Some(3));
    assert_eq!(handle.read_header(1).unwrap(), Some(a1));
    assert_eq!(handle.read_header(3).unwrap(), Some(a3));

    handle.stop();
    handle.join().await.unwrap();
}

async fn run_sequence(dir: &Path) -> Vec<u8> {
    let config = test_config(dir, true);
    let genesis = genesis_header();
    seed_store(&config, &[(0, genesis.clone())]);

    let c1 = synthetic_header(&genesis.block_hash(), 1_231_469_001, 1);
    let c2 = synthetic_header(&c1.block_hash(), 1_231_469_002, 2);

    let mut verifier = Verifier::bootstrap(config.clone()).await.unwrap();
    let channels = verifier.add_peer("peer-a");
    let tips = channels.tips.clone();
    spawn_responder(channels, HashMap::from([(1, record(&c1, 1))]));

    tips.send(record(&c1, 1)).await.unwrap();
    tips.send(record(&c2, 2)).await.unwrap();

    let handle = verifier.start();
    let mut events = handle.tip_events();
    wait_for_tip(&mut events, 2).await;

    handle.stop();
    handle.join().await.unwrap();
    std::fs::read(config.headers_path()).unwrap()
}

#[tokio::test]
async fn replaying_the_same_events_is_byte_identical() {
    init_logging();
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();

    let one = run_sequence(first.path()).await;
    let two = run_sequence(second.path()).await;

    assert_eq!(one.len(), 240);
    assert_eq!(one, two);
}

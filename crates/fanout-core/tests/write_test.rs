//! Replicated write scenarios against the in-memory cluster
//!
//! Covers single-shot and chunked uploads, rollback of under-replicated
//! writes, cleanup of groups that fell behind during a chunked upload and
//! the liveness gate.

use bytes::Bytes;
use fanout_core::testing::{FailRule, MemoryCluster, OpKind};
use fanout_core::{
    DataContainer, Error, IoFlags, Key, Proxy, ProxyConfig, Remote, SuccessCopies, Timestamp,
    WriteOptions,
};
use std::sync::Arc;

fn setup(groups: &[u32], config: ProxyConfig) -> (Arc<MemoryCluster>, Proxy) {
    let cluster = Arc::new(MemoryCluster::new(groups));
    let config = config
        .with_remotes(vec![Remote::new("localhost", 1025)])
        .with_groups(groups.to_vec());
    let proxy = Proxy::new(config, cluster.clone()).unwrap();
    (cluster, proxy)
}

fn payload(len: usize) -> DataContainer {
    DataContainer::new((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn groups_of(results: &[fanout_core::LookupResult]) -> Vec<u32> {
    let mut groups: Vec<u32> = results.iter().map(|r| r.group).collect();
    groups.sort_unstable();
    groups
}

#[test]
fn test_simple_write_reaches_every_group() {
    let (cluster, proxy) = setup(&[1, 2, 3], ProxyConfig::default());
    let key = Key::remote("photo.jpg");

    let results = proxy
        .write(&key, &DataContainer::from("hello"), &WriteOptions::default())
        .unwrap();

    assert_eq!(groups_of(&results), vec![1, 2, 3]);
    assert_eq!(results[0].host, format!("10.0.0.{}", results[0].group));
    assert_eq!(cluster.groups_holding(&key), vec![1, 2, 3]);
    assert!(cluster.ops_of(OpKind::Remove).is_empty());

    let meta = cluster.metadata(1, &key).unwrap();
    assert_eq!(meta.remote, "photo.jpg");
    assert_eq!(meta.groups.len(), 3);
}

#[test]
fn test_chunked_write_with_lagging_group() {
    // default groups [1,2,3], chunk 1024, 2500 bytes, quorum of 3
    let (cluster, proxy) = setup(&[1, 2, 3], ProxyConfig::default().with_chunk_size(1024));
    cluster.fail(FailRule::on(OpKind::Plain).group(2));
    let key = Key::remote("video.mp4");
    let data = payload(2500);

    let results = proxy.write(&key, &data, &WriteOptions::default()).unwrap();

    assert_eq!(groups_of(&results), vec![1, 3]);
    assert_eq!(cluster.ops_of(OpKind::Prepare).len(), 1);
    assert_eq!(cluster.ops_of(OpKind::Plain).len(), 1);
    assert_eq!(cluster.ops_of(OpKind::Commit).len(), 1);

    let removes = cluster.ops_of(OpKind::Remove);
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].groups, vec![2]);

    assert_eq!(cluster.object(1, &key), Some(data.data().clone()));
    assert_eq!(cluster.object(3, &key), Some(data.data().clone()));
    assert!(cluster.object(2, &key).is_none());
    assert!(!cluster.has_staged(2, &key));
}

#[test]
fn test_chunk_targets_shrink_monotonically() {
    let (cluster, proxy) = setup(
        &[1, 2, 3, 4],
        ProxyConfig::default()
            .with_chunk_size(100)
            .with_success_copies(SuccessCopies::Any),
    );
    // group 3 drops out at the second plain chunk, group 1 at the fourth
    cluster.fail(FailRule::on(OpKind::Plain).group(3).after(1));
    cluster.fail(FailRule::on(OpKind::Plain).group(1).after(3));
    let key = Key::remote("log.bin");

    let results = proxy
        .write(&key, &payload(1000), &WriteOptions::default())
        .unwrap();

    let prepare = cluster.ops_of(OpKind::Prepare);
    let mut chunk_targets: Vec<Vec<u32>> = cluster
        .ops()
        .into_iter()
        .filter(|op| matches!(op.kind, OpKind::Plain | OpKind::Commit))
        .map(|op| op.groups)
        .collect();
    chunk_targets.insert(0, prepare[0].groups.clone());

    for pair in chunk_targets.windows(2) {
        assert!(pair[1].iter().all(|g| pair[0].contains(g)));
    }
    let after_third = &chunk_targets[3];
    assert!(!after_third.contains(&3));

    let achieved = groups_of(&results);
    assert_eq!(achieved, vec![2, 4]);
    assert!(achieved.iter().all(|g| prepare[0].groups.contains(g)));

    let removes = cluster.ops_of(OpKind::Remove);
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].groups, vec![1, 3]);
}

#[test]
fn test_explicit_single_group_any() {
    let (cluster, proxy) = setup(&[1, 2, 3, 5], ProxyConfig::default());
    let key = Key::remote("single");
    let opts = WriteOptions::default()
        .with_groups(vec![5])
        .with_success_copies(SuccessCopies::Any);

    let results = proxy.write(&key, &DataContainer::from("x"), &opts).unwrap();

    assert_eq!(groups_of(&results), vec![5]);
    assert!(cluster.ops_of(OpKind::Remove).is_empty());
    assert_eq!(cluster.groups_holding(&key), vec![5]);
}

#[test]
fn test_all_mode_rolls_back_on_partial_write() {
    let (cluster, proxy) = setup(&[1, 2], ProxyConfig::default());
    cluster.fail(FailRule::on(OpKind::Write).group(2));
    let key = Key::remote("strict");
    let opts = WriteOptions::default()
        .with_groups(vec![1, 2])
        .with_success_copies(SuccessCopies::All);

    let err = proxy
        .write(&key, &DataContainer::from("x"), &opts)
        .unwrap_err();

    match err {
        Error::InsufficientReplicas {
            achieved, required, ..
        } => {
            assert_eq!(achieved, 1);
            assert_eq!(required, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
    let removes = cluster.ops_of(OpKind::Remove);
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].groups, vec![1, 2]);
    assert!(cluster.groups_holding(&key).is_empty());
    assert!(cluster.ops_of(OpKind::Metadata).is_empty());
}

#[test]
fn test_rollback_covers_full_desired_set_after_failed_prepare() {
    let (cluster, proxy) = setup(
        &[1, 2, 3],
        ProxyConfig::default().with_chunk_size(10),
    );
    cluster.fail(FailRule::on(OpKind::Prepare).group(1));
    cluster.fail(FailRule::on(OpKind::Prepare).group(3));
    let key = Key::remote("half");

    let err = proxy
        .write(&key, &payload(40), &WriteOptions::default())
        .unwrap_err();

    assert!(matches!(err, Error::InsufficientReplicas { .. }));
    assert!(cluster.ops_of(OpKind::Plain).is_empty());
    let mut removed = cluster.ops_of(OpKind::Remove)[0].groups.clone();
    removed.sort_unstable();
    assert_eq!(removed, vec![1, 2, 3]);
    assert!(!cluster.has_staged(2, &key));
}

#[test]
fn test_rollback_failure_does_not_mask_error() {
    let (cluster, proxy) = setup(&[1, 2], ProxyConfig::default());
    cluster.fail(FailRule::on(OpKind::Write).group(2));
    cluster.fail(FailRule::on(OpKind::Remove));
    let opts = WriteOptions::default().with_success_copies(SuccessCopies::All);

    let err = proxy
        .write(&Key::remote("k"), &DataContainer::from("x"), &opts)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientReplicas { .. }));
}

#[test]
fn test_replication_count_truncates_groups() {
    let (cluster, proxy) = setup(
        &[1, 2, 3, 4],
        ProxyConfig::default().with_replication_count(2),
    );
    let key = Key::remote("two");

    let results = proxy
        .write(&key, &DataContainer::from("x"), &WriteOptions::default())
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().any(|r| r.group == 1));
    assert_eq!(cluster.ops_of(OpKind::Write)[0].groups.len(), 2);
}

#[test]
fn test_liveness_gate() {
    let (cluster, proxy) = setup(&[1, 2, 3], ProxyConfig::default().with_die_limit(2));
    cluster.set_state_num(1);

    let err = proxy
        .write(&Key::remote("k"), &DataContainer::from("x"), &WriteOptions::default())
        .unwrap_err();

    assert!(matches!(
        err,
        Error::InsufficientEndpoints {
            live: 1,
            required: 2,
            ..
        }
    ));
    assert!(cluster.ops().is_empty());
    assert!(!proxy.ping());

    cluster.set_state_num(2);
    assert!(proxy.ping());
}

#[test]
fn test_whole_call_failure_is_write_failed() {
    let (cluster, proxy) = setup(&[1, 2], ProxyConfig::default());
    cluster.fail_next_call(
        OpKind::Write,
        fanout_core::TransportError::io("connection reset"),
    );

    let err = proxy
        .write(&Key::remote("k"), &DataContainer::from("x"), &WriteOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::WriteFailed { .. }));
    assert!(err.to_string().contains("connection reset"));
}

#[test]
fn test_staged_flags_disable_chunking() {
    let (cluster, proxy) = setup(&[1], ProxyConfig::default().with_chunk_size(4));
    let key = Key::remote("manual");
    let opts = WriteOptions {
        size: 16,
        ioflags: IoFlags::PREPARE,
        ..Default::default()
    };

    proxy.write(&key, &payload(8), &opts).unwrap();

    assert_eq!(cluster.ops_of(OpKind::Prepare).len(), 1);
    assert!(cluster.ops_of(OpKind::Plain).is_empty());
    assert!(cluster.has_staged(1, &key));
}

#[test]
fn test_chunked_tail_covered_by_prepare_commits_at_end() {
    let (cluster, proxy) = setup(&[1, 2], ProxyConfig::default().with_chunk_size(1024));
    let key = Key::remote("tail");
    let data = payload(2500);
    let opts = WriteOptions::default().with_offset(2000);

    let results = proxy.write(&key, &data, &opts).unwrap();

    assert_eq!(groups_of(&results), vec![1, 2]);
    assert_eq!(cluster.ops_of(OpKind::Prepare).len(), 1);
    assert!(cluster.ops_of(OpKind::Plain).is_empty());
    assert_eq!(cluster.ops_of(OpKind::Commit).len(), 1);

    let stored = cluster.object(1, &key).unwrap();
    assert_eq!(stored.len(), 2500);
    assert_eq!(stored.slice(2000..), data.data().slice(2000..));
    assert!(!cluster.has_staged(1, &key));
}

#[test]
fn test_embedded_timestamp_reaches_metadata() {
    let (cluster, proxy) = setup(&[1], ProxyConfig::default());
    let key = Key::remote("stamped");
    let ts = Timestamp::new(1_700_000_000, 42);
    let data = DataContainer::new(Bytes::from_static(b"body")).with_timestamp(ts);

    proxy.write(&key, &data, &WriteOptions::default()).unwrap();

    assert_eq!(cluster.metadata(1, &key).unwrap().timestamp, ts);
    assert_eq!(cluster.object(1, &key), Some(data.pack()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_async_recv() {
    let (cluster, proxy) = setup(&[1, 2], ProxyConfig::default().with_chunk_size(2));
    let key = Key::remote("async");

    let handle = proxy
        .write_async(&key, &payload(10), &WriteOptions::default())
        .unwrap();
    let results = handle.recv().await.unwrap();

    assert_eq!(groups_of(&results), vec![1, 2]);
    // async writes never chunk
    assert!(cluster.ops_of(OpKind::Prepare).is_empty());
}

//! Read-side operations against the in-memory cluster

use bytes::Bytes;
use fanout_core::testing::{FailRule, MemoryCluster, OpKind};
use fanout_core::{
    DataContainer, Error, IoFlags, Key, Proxy, ProxyConfig, RangeOptions, RangeOutcome, RawId,
    ReadOptions, Remote, Timestamp, TransportError, WriteOptions,
};
use std::sync::Arc;

fn setup(groups: &[u32]) -> (Arc<MemoryCluster>, Proxy) {
    let cluster = Arc::new(MemoryCluster::new(groups));
    let config = ProxyConfig::default()
        .with_remotes(vec![Remote::new("localhost", 1025)])
        .with_groups(groups.to_vec());
    let proxy = Proxy::new(config, cluster.clone()).unwrap();
    (cluster, proxy)
}

#[test]
fn test_read_after_write() {
    let (_cluster, proxy) = setup(&[1, 2]);
    let key = Key::remote("doc.txt");
    proxy
        .write(&key, &DataContainer::from("contents"), &WriteOptions::default())
        .unwrap();

    let read = proxy.read(&key, &ReadOptions::default()).unwrap();
    assert_eq!(read.data(), &Bytes::from_static(b"contents"));

    let partial = proxy
        .read(
            &key,
            &ReadOptions {
                offset: 3,
                size: 4,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(partial.data(), &Bytes::from_static(b"tent"));
}

#[test]
fn test_read_missing_is_not_found() {
    let (_cluster, proxy) = setup(&[1, 2]);
    let err = proxy
        .read(&Key::remote("nope"), &ReadOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(err.to_string().contains("nope"));
}

#[test]
fn test_read_transport_failure_is_read_failed() {
    let (cluster, proxy) = setup(&[1]);
    cluster.fail_next_call(OpKind::Read, TransportError::io("timeout"));
    let err = proxy
        .read(&Key::remote("k"), &ReadOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::ReadFailed { .. }));
}

#[test]
fn test_read_skips_failing_group() {
    let (cluster, proxy) = setup(&[1, 2]);
    let key = Key::remote("k");
    cluster.put(1, &key, "one");
    cluster.put(2, &key, "two");
    cluster.fail(FailRule::on(OpKind::Read).group(1));

    let read = proxy
        .read(&key, &ReadOptions::default().with_groups(vec![1, 2]))
        .unwrap();
    assert_eq!(read.data(), &Bytes::from_static(b"two"));
}

#[test]
fn test_latest_read() {
    let (cluster, proxy) = setup(&[1, 2, 3]);
    let key = Key::remote("k");
    cluster.put(1, &key, "old");
    cluster.put(3, &key, "new");

    let read = proxy
        .read(&key, &ReadOptions::default().with_groups(vec![1, 2, 3]).latest())
        .unwrap();
    assert_eq!(read.data(), &Bytes::from_static(b"new"));
    assert_eq!(cluster.ops_of(OpKind::ReadLatest).len(), 1);
}

#[test]
fn test_embedded_read() {
    let (_cluster, proxy) = setup(&[1]);
    let key = Key::remote("stamped");
    let ts = Timestamp::new(10, 20);
    proxy
        .write(
            &key,
            &DataContainer::from("body").with_timestamp(ts),
            &WriteOptions::default(),
        )
        .unwrap();

    let read = proxy.read(&key, &ReadOptions::default().embedded()).unwrap();
    assert_eq!(read.data(), &Bytes::from_static(b"body"));
    assert_eq!(read.timestamp(), Some(ts));
}

#[test]
fn test_lookup_drops_failing_groups() {
    let (cluster, proxy) = setup(&[1, 2, 3]);
    let key = Key::remote("k");
    cluster.put(3, &key, "x");

    let result = proxy.lookup(&key, &[1, 2, 3]).unwrap();
    assert_eq!(result.group, 3);
    assert_eq!(result.port, 1027);
    assert_eq!(result.path, "/3/data-0.0:0:1");

    let err = proxy.lookup(&Key::remote("missing"), &[1, 2]).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn test_remove() {
    let (cluster, proxy) = setup(&[1, 2]);
    let key = Key::remote("k");
    cluster.put(1, &key, "x");
    cluster.put(2, &key, "x");

    let acks = proxy.remove(&key, &[]).unwrap();
    assert_eq!(acks.len(), 2);
    assert!(cluster.groups_holding(&key).is_empty());

    let err = proxy.remove(&key, &[]).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_read_and_remove() {
    let (cluster, proxy) = setup(&[1]);
    let key = Key::remote("k");
    cluster.put(1, &key, "async");

    let read = proxy
        .read_async(&key, &ReadOptions::default())
        .unwrap()
        .recv()
        .await
        .unwrap();
    assert_eq!(read.data(), &Bytes::from_static(b"async"));

    let acks = proxy.remove_async(&key, &[]).unwrap().recv().await.unwrap();
    assert_eq!(acks[0].status, 0);
}

#[test]
fn test_range_get() {
    let (cluster, proxy) = setup(&[1, 2]);
    for name in ["a", "b", "c", "d"] {
        cluster.put(2, &Key::remote(name), name);
    }
    let group_key = Key::remote("range");
    let from = Key::from_id(RawId::MIN);
    let to = Key::from_id(RawId::MAX);

    let opts = RangeOptions {
        groups: vec![1, 2],
        ..Default::default()
    };
    match proxy.range_get(&from, &to, &opts, &group_key).unwrap() {
        RangeOutcome::Records(records) => assert_eq!(records.len(), 4),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let limited = RangeOptions {
        limit_start: 1,
        limit_num: 2,
        ..opts.clone()
    };
    match proxy.range_get(&from, &to, &limited, &group_key).unwrap() {
        RangeOutcome::Records(records) => assert_eq!(records.len(), 2),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let counting = RangeOptions {
        ioflags: IoFlags::NODATA,
        ..opts.clone()
    };
    assert_eq!(
        proxy.range_get(&from, &to, &counting, &group_key).unwrap(),
        RangeOutcome::Count(4)
    );
}

#[test]
fn test_range_get_nothing_found() {
    let (cluster, proxy) = setup(&[1, 2]);
    cluster.fail(FailRule::on(OpKind::ReadRange).group(1));
    let err = proxy
        .range_get(
            &Key::from_id(RawId::MIN),
            &Key::from_id(RawId::MAX),
            &RangeOptions::default(),
            &Key::remote("range"),
        )
        .unwrap_err();
    assert!(matches!(err, Error::ReadFailed { .. }));
    assert_eq!(cluster.ops_of(OpKind::ReadRange).len(), 2);
}

#[test]
fn test_lookup_addr() {
    let (_cluster, proxy) = setup(&[1, 2]);
    let remotes = proxy.lookup_addr(&Key::remote("k"), &[2, 1]).unwrap();
    assert_eq!(
        remotes,
        vec![Remote::new("10.0.0.2", 1026), Remote::new("10.0.0.1", 1025)]
    );
    assert!(proxy.lookup_addr(&Key::remote("k"), &[9]).is_err());
}

mod common;

use cloudstore::query::KEY_FIELD;
use cloudstore::KeyValueStore;
use common::{store, MemoryRemote};
use futures::TryStreamExt;

fn entries(n: usize) -> Vec<(String, Vec<u8>)> {
    (0..n)
        .map(|i| (format!("k{i}"), format!("value-{i}").into_bytes()))
        .collect()
}

#[tokio::test]
async fn test_save_and_get_by_ids() {
    let remote = MemoryRemote::new();
    let kv = KeyValueStore::new(store(&remote));

    kv.save_batch("kv", entries(3)).await.unwrap();

    let ids = vec!["k2".to_string(), "k0".to_string(), "nope".to_string()];
    let got = kv.get_by_ids("kv", &ids).await.unwrap();
    assert_eq!(
        got,
        vec![
            ("k0".to_string(), b"value-0".to_vec()),
            ("k2".to_string(), b"value-2".to_vec()),
        ]
    );

    let payloads = remote.saved_payloads();
    assert!(payloads
        .iter()
        .all(|p| p.exclude_from_indexes == vec!["v".to_string()]));
}

#[tokio::test]
async fn test_streams_and_count() {
    let remote = MemoryRemote::new();
    let kv = KeyValueStore::new(store(&remote));
    kv.save_batch("kv", entries(5)).await.unwrap();

    let ids: Vec<String> = kv.stream_ids("kv", None).try_collect().await.unwrap();
    assert_eq!(ids, vec!["k0", "k1", "k2", "k3", "k4"]);

    let limited: Vec<String> = kv.stream_ids("kv", Some(2)).try_collect().await.unwrap();
    assert_eq!(limited, vec!["k0", "k1"]);

    let values: Vec<Vec<u8>> = kv.stream_values("kv", Some(1)).try_collect().await.unwrap();
    assert_eq!(values, vec![b"value-0".to_vec()]);

    let all: Vec<(String, Vec<u8>)> = kv.stream_entries("kv", None).try_collect().await.unwrap();
    assert_eq!(all, entries(5));

    assert_eq!(kv.count("kv").await.unwrap(), 5);
}

#[tokio::test]
async fn test_value_streams_request_id_order() {
    let remote = MemoryRemote::new();
    let kv = KeyValueStore::new(store(&remote));
    kv.save_batch("kv", entries(3)).await.unwrap();

    let _: Vec<Vec<u8>> = kv.stream_values("kv", None).try_collect().await.unwrap();
    let _: Vec<(String, Vec<u8>)> = kv.stream_entries("kv", None).try_collect().await.unwrap();

    let requests = remote.query_requests();
    assert_eq!(requests.len(), 2);
    for request in requests {
        assert_eq!(request.orders.len(), 1);
        assert_eq!(request.orders[0].field, KEY_FIELD);
        assert!(!request.orders[0].descending);
    }
}

#[tokio::test]
async fn test_delete_by_ids() {
    let remote = MemoryRemote::new();
    let kv = KeyValueStore::new(store(&remote));
    kv.save_batch("kv", entries(3)).await.unwrap();

    let deleted = kv
        .delete_by_ids("kv", &["k0".to_string(), "k1".to_string()])
        .await
        .unwrap();

    assert_eq!(deleted, 2);
    assert_eq!(kv.count("kv").await.unwrap(), 1);
}

#![forbid(unsafe_code)]

//! Store behavior against a real (temporary) filesystem tree.

use box_store::{QueueName, QueueStore, StoreError};

fn open_store(tmp: &tempfile::TempDir) -> QueueStore {
    QueueStore::open(tmp.path().join("queues"), vec!["/whoswho".to_string()], 4096).unwrap()
}

#[test]
fn builtin_queues_exist_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let metrics = store.metrics().unwrap();
    assert_eq!(metrics.queue_count, 2);
    assert_eq!(metrics.object_count, 0);
}

#[test]
fn ephemeral_put_get_consumes() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let inbox = QueueName::normalize("/INBOX").unwrap();

    store.put(&inbox, "text/plain", b"alpha").unwrap();
    let object = store.get(&inbox).unwrap();
    assert_eq!(object.payload, b"alpha");
    assert_eq!(object.content_type, "text/plain");

    // Consumed: second GET finds nothing.
    assert!(matches!(store.get(&inbox), Err(StoreError::NotFound)));
}

#[test]
fn permanent_get_peeks() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let whoswho = QueueName::normalize("/whoswho").unwrap();

    store.put(&whoswho, "application/json", b"{\"node\":1}").unwrap();
    for _ in 0..3 {
        let object = store.get(&whoswho).unwrap();
        assert_eq!(object.payload, b"{\"node\":1}");
    }
    assert_eq!(store.metrics().unwrap().object_count, 1);
}

#[test]
fn permanent_applies_to_nested_paths() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let nested = QueueName::normalize("/whoswho/6d1c5cde-3f4a-4a39-9df6-cdd8bb14c2a4").unwrap();

    store.put(&nested, "application/json", b"record").unwrap();
    store.get(&nested).unwrap();
    store.get(&nested).unwrap();
    assert!(store.is_permanent(&nested));
}

#[test]
fn duplicate_put_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let inbox = QueueName::normalize("/INBOX").unwrap();

    let first = store.put(&inbox, "text/plain", b"same").unwrap();
    let second = store.put(&inbox, "text/plain", b"same").unwrap();
    assert_eq!(first, second);
    assert_eq!(store.metrics().unwrap().object_count, 1);
}

#[test]
fn get_returns_lexicographically_smallest() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let inbox = QueueName::normalize("/INBOX").unwrap();

    let d1 = store.put(&inbox, "t", b"one").unwrap();
    let d2 = store.put(&inbox, "t", b"two").unwrap();
    let expected_first = if d1 < d2 { b"one".as_ref() } else { b"two".as_ref() };

    assert_eq!(store.get(&inbox).unwrap().payload, expected_first);
}

#[test]
fn oversized_payload_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let inbox = QueueName::normalize("/INBOX").unwrap();

    let result = store.put(&inbox, "application/octet-stream", &[0u8; 4097]);
    assert!(matches!(result, Err(StoreError::TooLarge { .. })));
}

#[test]
fn purge_drains_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let inbox = QueueName::normalize("/INBOX").unwrap();

    store.put(&inbox, "t", b"a").unwrap();
    store.put(&inbox, "t", b"b").unwrap();
    assert_eq!(store.purge(&inbox).unwrap(), 2);
    assert!(matches!(store.get(&inbox), Err(StoreError::NotFound)));

    let missing = QueueName::normalize("/nope").unwrap();
    assert!(matches!(store.purge(&missing), Err(StoreError::NotFound)));
}

#[test]
fn digest_matches_object_filename() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let inbox = QueueName::normalize("/INBOX").unwrap();

    let digest = store.put(&inbox, "t", b"alpha").unwrap();
    let path = store
        .root()
        .join("%2FINBOX")
        .join(format!("{digest}.json"));
    assert!(path.is_file());

    let object = store.get(&inbox).unwrap();
    assert_eq!(object.digest, digest);
}

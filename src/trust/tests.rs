//! Tests for trust-on-first-use verification and the TOML host key store.

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::command::read_if_present;
use crate::remote::{RemoteError, RemoteRunner, RemoteTarget};
use crate::test_support::{FakeScanner, MemoryHostKeyStore, RemoteReply, ScriptedRemote};

#[fixture]
fn target() -> RemoteTarget {
    RemoteTarget {
        vm_name: String::from("default"),
        instance_id: String::from("i-0abc"),
        zone: String::from("us-east-1a"),
        host: String::from("203.0.113.10"),
        port: 22,
        user: String::from("ubuntu"),
        host_key: None,
    }
}

fn keepalive_read() -> crate::command::RemoteCommand {
    read_if_present(Utf8Path::new("/var/lib/berth/keepalive"))
}

#[rstest]
#[tokio::test]
async fn first_use_pins_the_scanned_fingerprint(target: RemoteTarget) {
    let inner = ScriptedRemote::new();
    let scanner = FakeScanner::new("SHA256:FIRST");
    let store = MemoryHostKeyStore::new();
    let runner = TrustedRunner::new(&inner, &scanner, &store);

    runner
        .run(&target, &keepalive_read())
        .await
        .expect("first run should succeed");

    assert_eq!(
        store.fingerprint("default").expect("store read"),
        Some(String::from("SHA256:FIRST"))
    );
    assert_eq!(inner.call_count(), 1);
}

#[rstest]
#[tokio::test]
async fn inner_runner_connects_with_the_verified_key(target: RemoteTarget) {
    let inner = ScriptedRemote::new();
    let scanner = FakeScanner::new("SHA256:SAME");
    let store = MemoryHostKeyStore::new().with_entry("default", "SHA256:SAME");
    let runner = TrustedRunner::new(&inner, &scanner, &store);

    runner.run(&target, &keepalive_read()).await.expect("first run");
    runner.run(&target, &keepalive_read()).await.expect("cached run");

    assert_eq!(
        inner.host_keys(),
        vec![Some(String::from("ssh-ed25519 AAAAfake")); 2]
    );
}

#[rstest]
#[tokio::test]
async fn repeated_calls_scan_once_per_endpoint(target: RemoteTarget) {
    let inner = ScriptedRemote::new();
    let scanner = FakeScanner::new("SHA256:SAME");
    let store = MemoryHostKeyStore::new().with_entry("default", "SHA256:SAME");
    let runner = TrustedRunner::new(&inner, &scanner, &store);

    for _ in 0..3 {
        runner
            .run(&target, &keepalive_read())
            .await
            .expect("run should succeed");
    }

    assert_eq!(scanner.scan_count(), 1);
    assert_eq!(inner.call_count(), 3);

    let other_port = RemoteTarget {
        port: 2222,
        ..target
    };
    runner
        .run(&other_port, &keepalive_read())
        .await
        .expect("run should succeed");
    assert_eq!(scanner.scan_count(), 2);
}

#[rstest]
#[tokio::test]
async fn changed_fingerprint_is_rejected_without_running(target: RemoteTarget) {
    let inner = ScriptedRemote::new();
    let scanner = FakeScanner::new("SHA256:NEW");
    let store = MemoryHostKeyStore::new().with_entry("default", "SHA256:OLD");
    let runner = TrustedRunner::new(&inner, &scanner, &store);

    let err = runner
        .run(&target, &keepalive_read())
        .await
        .expect_err("mismatch must fail");

    let message = err.to_string();
    assert!(message.contains("HOST KEY CHANGED"), "{message}");
    assert!(message.contains("Stored fingerprint: SHA256:OLD"), "{message}");
    assert!(message.contains("Current fingerprint: SHA256:NEW"), "{message}");
    assert!(message.contains("default"), "{message}");
    assert!(message.contains("berth recreate"), "{message}");
    assert!(matches!(err, RemoteError::Trust(ref trust) if trust.is_violation()));
    assert_eq!(inner.call_count(), 0);
    assert_eq!(
        store.fingerprint("default").expect("store read"),
        Some(String::from("SHA256:OLD")),
        "a mismatch must never overwrite the pin"
    );

    runner
        .run(&target, &keepalive_read())
        .await
        .expect_err("cached mismatch must fail again");
    assert_eq!(scanner.scan_count(), 1);
    assert_eq!(inner.call_count(), 0);
}

#[rstest]
#[tokio::test]
async fn scan_failure_short_circuits(target: RemoteTarget) {
    let inner = ScriptedRemote::new();
    let scanner = FakeScanner::failing("connection timed out");
    let store = MemoryHostKeyStore::new();
    let runner = TrustedRunner::new(&inner, &scanner, &store);

    let err = runner
        .run(&target, &keepalive_read())
        .await
        .expect_err("scan failure must fail");

    assert!(
        matches!(err, RemoteError::Trust(TrustError::ScanFailed { port: 22, .. })),
        "{err:?}"
    );
    assert_eq!(inner.call_count(), 0);
    assert!(store.entries().is_empty());
}

#[rstest]
fn reset_forces_a_fresh_scan(target: RemoteTarget) {
    let inner = ScriptedRemote::new();
    let scanner = FakeScanner::new("SHA256:SAME");
    let store = MemoryHostKeyStore::new();
    let runner = TrustedRunner::new(&inner, &scanner, &store);

    runner.verify(&target).expect("verify");
    runner.reset();
    runner.verify(&target).expect("verify again");

    assert_eq!(scanner.scan_count(), 2);
}

#[rstest]
#[tokio::test]
async fn inner_errors_pass_through(target: RemoteTarget) {
    let inner = ScriptedRemote::new();
    inner.reply_to("keepalive", RemoteReply::transport("connection reset"));
    let scanner = FakeScanner::new("SHA256:SAME");
    let store = MemoryHostKeyStore::new();
    let runner = TrustedRunner::new(&inner, &scanner, &store);

    let err = runner
        .run(&target, &keepalive_read())
        .await
        .expect_err("inner failure should propagate");
    assert!(err.is_transport(), "{err:?}");
}

struct StoreFixture {
    _tmp: TempDir,
    store: FileHostKeyStore,
}

#[fixture]
fn file_store() -> StoreFixture {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("nested").join(HOST_KEYS_FILE_NAME))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    StoreFixture {
        _tmp: tmp,
        store: FileHostKeyStore::new(path),
    }
}

#[rstest]
fn file_store_reads_nothing_when_missing(file_store: StoreFixture) {
    assert_eq!(
        file_store.store.fingerprint("default").expect("read"),
        None
    );
}

#[rstest]
fn file_store_records_and_forgets(file_store: StoreFixture) {
    let StoreFixture { store, .. } = file_store;
    store.record("default", "SHA256:AAA").expect("record");
    store.record("work", "SHA256:BBB").expect("record");

    assert_eq!(
        store.fingerprint("default").expect("read"),
        Some(String::from("SHA256:AAA"))
    );
    assert!(store.forget("default").expect("forget"));
    assert!(!store.forget("default").expect("forget twice"));
    assert_eq!(store.fingerprint("default").expect("read"), None);
    assert_eq!(
        store.fingerprint("work").expect("read"),
        Some(String::from("SHA256:BBB"))
    );

    let contents = std::fs::read_to_string(store.path()).expect("store file");
    assert!(contents.contains("[host_keys]"), "{contents}");
}

#[rstest]
fn file_store_rejects_malformed_content(file_store: StoreFixture) {
    let StoreFixture { store, .. } = file_store;
    let parent = store.path().parent().expect("parent");
    std::fs::create_dir_all(parent).expect("mkdir");
    std::fs::write(store.path(), "host_keys = 3\n").expect("seed");

    let err = store.fingerprint("default").expect_err("malformed store");
    assert!(matches!(err, HostKeyStoreError::Invalid { .. }), "{err:?}");
}

#[test]
fn fingerprint_of_rejects_garbage() {
    assert!(fingerprint_of("ssh-ed25519 not-base64!").is_err());
}

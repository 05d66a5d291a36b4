//! Key derivation, persistence, and mismatch detection.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sealpost::vault::{CryptoKey, KeyVault, VaultError, KEY_LEN, SALT_LEN};

/// Run `derive_or_load` from several threads released together.
fn race_first_run(vault: &KeyVault, passphrase: Option<&'static str>) -> Vec<CryptoKey> {
    const RACERS: usize = 4;
    let barrier = Arc::new(Barrier::new(RACERS));
    let handles: Vec<_> = (0..RACERS)
        .map(|_| {
            let vault = vault.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                vault.derive_or_load("default", passphrase)
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| {
            h.join()
                .expect("racer should not panic")
                .expect("racer should get a key")
        })
        .collect()
}

#[test]
fn derivation_is_deterministic_per_salt() {
    let salt = [3u8; SALT_LEN];
    let a = CryptoKey::derive("correct horse", &salt);
    let b = CryptoKey::derive("correct horse", &salt);
    let other_salt = CryptoKey::derive("correct horse", &[4u8; SALT_LEN]);
    let other_pass = CryptoKey::derive("battery staple", &salt);

    assert_eq!(a, b);
    assert_ne!(a, other_salt);
    assert_ne!(a, other_pass);
}

#[test]
fn generated_keys_differ() {
    assert_ne!(CryptoKey::generate(), CryptoKey::generate());
}

#[test]
fn fingerprint_is_short_hex() {
    let key = CryptoKey::from_bytes([1u8; KEY_LEN]);
    let fp = key.fingerprint();
    assert_eq!(fp.len(), 16);
    assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn random_key_is_persisted_and_reloaded() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path().join("keys"));

    let first = vault.derive_or_load("default", None).expect("should create");
    assert!(vault.key_path("default").exists());
    assert!(!vault.salt_path("default").exists());

    let second = vault.derive_or_load("default", None).expect("should load");
    assert_eq!(first, second);
}

#[test]
fn blank_passphrase_counts_as_absent() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());

    vault.derive_or_load("default", Some("   ")).expect("should create");
    assert!(!vault.salt_path("default").exists());
}

#[test]
fn passphrase_key_survives_key_file_loss() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());

    let first = vault
        .derive_or_load("alice", Some("hunter2"))
        .expect("should derive");
    assert!(vault.salt_path("alice").exists());

    std::fs::remove_file(vault.key_path("alice")).expect("should remove key");

    let again = vault
        .derive_or_load("alice", Some("hunter2"))
        .expect("should re-derive from stored salt");
    assert_eq!(first, again);
}

#[test]
fn wrong_passphrase_is_a_mismatch() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());

    vault
        .derive_or_load("alice", Some("hunter2"))
        .expect("should derive");

    match vault.derive_or_load("alice", Some("hunter3")) {
        Err(VaultError::KeyMismatch { label }) => assert_eq!(label, "alice"),
        other => panic!("expected key mismatch, got {other:?}"),
    }
}

#[test]
fn labels_are_isolated() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());

    let a = vault.derive_or_load("a", None).expect("should create a");
    let b = vault.derive_or_load("b", None).expect("should create b");
    assert_ne!(a, b);
}

#[test]
fn corrupt_key_file_is_a_storage_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());
    std::fs::write(vault.key_path("default"), "not base64 !!").expect("should write");

    let result = vault.derive_or_load("default", None);
    assert!(matches!(result, Err(VaultError::Storage { .. })));
}

#[cfg(unix)]
#[test]
fn key_artifacts_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());
    vault
        .derive_or_load("default", Some("pass"))
        .expect("should derive");

    for path in [vault.key_path("default"), vault.salt_path("default")] {
        let mode = std::fs::metadata(&path)
            .expect("should stat")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600, "{} should be 0600", path.display());
    }
}

#[test]
fn concurrent_first_run_agrees_on_passphrase_key() {
    for _ in 0..5 {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let vault = KeyVault::new(tmp.path().join("keys"));

        let keys = race_first_run(&vault, Some("pw"));
        assert!(keys.windows(2).all(|pair| pair[0] == pair[1]));

        let later = vault
            .derive_or_load("default", Some("pw"))
            .expect("correct passphrase should still verify");
        assert_eq!(later, keys[0]);
    }
}

#[test]
fn concurrent_first_run_agrees_on_random_key() {
    for _ in 0..20 {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let vault = KeyVault::new(tmp.path());

        let keys = race_first_run(&vault, None);
        assert!(keys.windows(2).all(|pair| pair[0] == pair[1]));

        let stored = vault.derive_or_load("default", None).expect("should load");
        assert_eq!(stored, keys[0]);
    }
}

#[test]
fn empty_key_file_is_waited_on_until_written() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());
    let key_path = vault.key_path("default");
    std::fs::write(&key_path, "").expect("should create empty key file");

    let expected = CryptoKey::generate();
    let text = expected.to_text();
    let staged = tmp.path().join("staged.key");
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        std::fs::write(&staged, text).expect("should stage key");
        std::fs::rename(&staged, &key_path).expect("should fill key file");
    });

    let key = vault
        .derive_or_load("default", None)
        .expect("should pick up the late key");
    writer.join().expect("writer should not panic");
    assert_eq!(key, expected);
}

#[test]
fn publishing_leaves_no_temp_files() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let vault = KeyVault::new(tmp.path());
    vault
        .derive_or_load("default", Some("pass"))
        .expect("should derive");

    let mut names: Vec<String> = std::fs::read_dir(tmp.path())
        .expect("should list vault")
        .map(|entry| {
            entry
                .expect("should read entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    assert_eq!(names, ["default.key", "default.salt"]);
}

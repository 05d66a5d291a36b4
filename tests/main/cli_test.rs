//! CLI contract tests, run against the built binary in a temporary home.

use std::path::Path;

use assert_cmd::Command;

fn sealpost(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sealpost").expect("binary should build");
    cmd.env_remove("SEALPOST_HOME")
        .env_remove("SEALPOST_TARGET")
        .env_remove("RUST_LOG")
        .arg("--home")
        .arg(home);
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("should run");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn resolve_prints_thread_id_for_long_numbers() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let out = stdout_of(sealpost(tmp.path()).args(["resolve", "1234567890123456"]));
    assert!(out.contains("thread_id"));
    assert!(out.contains("1234567890123456"));
}

#[test]
fn resolve_prints_thread_hint_for_user_ids() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let out = stdout_of(sealpost(tmp.path()).args(["resolve", "1234567890"]));
    assert!(out.contains("user_id"));
    assert!(out.contains("00000001234567890"));
}

#[test]
fn seal_then_open_round_trips() {
    let tmp = tempfile::tempdir().expect("should create temp dir");

    let envelope = stdout_of(sealpost(tmp.path()).args(["seal", "meet at noon"]));
    let envelope = envelope.trim();
    assert!(!envelope.contains("meet"));
    assert!(tmp.path().join("keys/default.key").exists());

    let plaintext = stdout_of(sealpost(tmp.path()).args(["open", envelope]));
    assert_eq!(plaintext.trim(), "meet at noon");

    let audit = std::fs::read_to_string(tmp.path().join("audit.log")).expect("audit written");
    assert!(audit.contains("DECRYPTED"));
}

#[test]
fn open_reads_framed_body_from_stdin() {
    let tmp = tempfile::tempdir().expect("should create temp dir");

    let body = stdout_of(sealpost(tmp.path()).args(["seal", "--framed", "from stdin"]));
    assert!(body.contains("ENCRYPTED_MESSAGE_START"));

    let plaintext = stdout_of(sealpost(tmp.path()).arg("open").write_stdin(body));
    assert_eq!(plaintext.trim(), "from stdin");
}

#[test]
fn open_with_another_home_fails() {
    let first = tempfile::tempdir().expect("should create temp dir");
    let second = tempfile::tempdir().expect("should create temp dir");

    let envelope = stdout_of(sealpost(first.path()).args(["seal", "private"]));
    sealpost(second.path())
        .args(["open", envelope.trim()])
        .assert()
        .failure();
}

#[test]
fn init_creates_runtime_layout() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let home = tmp.path().join("home");

    stdout_of(sealpost(&home).arg("init"));
    assert!(home.join("config.toml").exists());
    assert!(home.join("messages.txt").exists());
    assert!(home.join("keys").is_dir());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(home.join(".env"))
            .expect("env file")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    // Second run leaves files alone.
    std::fs::write(home.join("messages.txt"), "custom\n").expect("should write");
    stdout_of(sealpost(&home).arg("init"));
    let messages = std::fs::read_to_string(home.join("messages.txt")).expect("should read");
    assert_eq!(messages, "custom\n");
}

#[test]
fn keygen_prints_stable_fingerprint() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let first = stdout_of(sealpost(tmp.path()).arg("keygen"));
    let second = stdout_of(sealpost(tmp.path()).arg("keygen"));
    assert!(first.contains("fingerprint:"));
    assert_eq!(first, second);
}

#[test]
fn status_without_snapshot_fails() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    sealpost(tmp.path()).arg("status").assert().failure();
}

#[test]
fn start_without_target_fails_fast() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    sealpost(tmp.path()).arg("start").assert().failure();
}

//! Tests for `src/dispatch/status.rs`: report shape and the reporter task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use sealpost::audit::AuditLog;
use sealpost::dispatch::status::{
    read_status_file, run_status_reporter, write_status_file, StatusReport,
};
use sealpost::dispatch::{DispatchLoop, DispatchSettings, DispatchState, Phase};
use sealpost::ring::MessageRing;
use sealpost::target::{classify, Classification, ResolverThresholds, TargetKind};
use sealpost::vault::CryptoKey;

fn sample_state() -> DispatchState {
    DispatchState {
        phase: Phase::Backoff,
        running: true,
        sent_count: 7,
        failed_count: 2,
        cycle_count: 1,
        last_error: Some("delivery rejected with status 500: boom".to_owned()),
        target: "1234567890".to_owned(),
        target_kind: Some(TargetKind::UserId),
        cursor: 3,
        ring_len: 5,
    }
}

#[test]
fn report_flattens_state_fields() {
    let report = StatusReport::from_state(sample_state());
    let json: serde_json::Value = serde_json::to_value(&report).expect("should serialize");

    assert_eq!(json["phase"], "backoff");
    assert_eq!(json["sent_count"], 7);
    assert_eq!(json["target_kind"], "user_id");
    assert!(json["updated_at"].is_string());
    assert!(json.get("state").is_none());
}

#[tokio::test]
async fn write_then_read_status_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("status.json");
    let report = StatusReport::from_state(sample_state());

    write_status_file(&report, &path).await.expect("should write");
    assert!(!tmp.path().join("status.json.tmp").exists());

    let loaded = read_status_file(&path).await.expect("should read");
    assert_eq!(loaded, report);
}

#[tokio::test]
async fn read_status_file_fails_when_missing() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    assert!(read_status_file(&tmp.path().join("status.json"))
        .await
        .is_err());
}

#[tokio::test]
async fn reporter_writes_snapshots_until_shutdown() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("status.json");

    let target = match classify("1234567890123456", &ResolverThresholds::default()) {
        Classification::Resolved(target) => target,
        Classification::NeedsLookup { .. } => panic!("numeric target must classify offline"),
    };
    let (_dispatch, handle) = DispatchLoop::new(
        DispatchSettings::default(),
        CryptoKey::generate(),
        target,
        MessageRing::new(vec!["hi".to_owned()]).expect("non-empty ring"),
        Arc::new(NoopTransport),
        Arc::new(AuditLog::from_writers(
            Box::new(std::io::sink()),
            Box::new(std::io::sink()),
        )),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = tokio::spawn(run_status_reporter(
        handle,
        path.clone(),
        Duration::from_millis(20),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(path.exists(), "first snapshot should be written promptly");

    shutdown_tx.send(true).expect("reporter should be listening");
    reporter.await.expect("reporter should exit cleanly");

    let report = read_status_file(&path).await.expect("should read");
    assert_eq!(report.state.phase, Phase::Idle);
    assert!(!report.state.running);
    assert_eq!(report.state.target_kind, Some(TargetKind::ThreadId));
    assert_eq!(report.state.ring_len, 1);
}

struct NoopTransport;

#[async_trait::async_trait]
impl sealpost::transport::Transport for NoopTransport {
    async fn deliver(
        &self,
        _target: &str,
        _body: &str,
    ) -> Result<(), sealpost::transport::TransportError> {
        Ok(())
    }
}

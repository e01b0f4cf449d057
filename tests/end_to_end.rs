//! End-to-end tests against an in-process mock server
//!
//! Covers first-contact trust, key rotation, quiet commands and
//! cancelled streaming.

mod common;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use common::{FixedFingerprint, MockServer, connection, fstat, message};
use p4rpc::rpc::error::{ConnectionError, TrustError};
use p4rpc::rpc::{
    AuthStore, CommandRecord, ConnectOutcome, ConnectionState, FingerprintRole, LockPolicy,
    RpcConfig, Severity, TrustDecision, TrustKind, TrustOptions, TrustStore,
};
use tempfile::TempDir;

const FP_OLD: &str = "0A:1B:2C:3D:4E:5F";
const FP_NEW: &str = "F0:E1:D2:C3:B4:A5";

fn idle_server() -> MockServer {
    MockServer::start(Arc::new(|_command: &str, _args: &[String]| Vec::new()))
}

fn file_trust(dir: &TempDir) -> Arc<TrustStore> {
    Arc::new(TrustStore::new(AuthStore::file(
        dir.path().join("p4trust"),
        LockPolicy::default(),
    )))
}

#[test]
fn test_new_connection_requires_trust_then_reconnects() {
    let server = idle_server();
    let temp = TempDir::new().unwrap();
    let trust = file_trust(&temp);
    let connector = FixedFingerprint::new(FP_OLD);
    let mut conn = connection(&server, true, RpcConfig::default(), trust.clone(), connector);

    let outcome = conn.connect().unwrap();
    let fingerprint = match outcome.clone() {
        ConnectOutcome::TrustRequired {
            kind,
            server: ip_port,
            fingerprint,
        } => {
            assert_eq!(kind, TrustKind::NewConnection);
            assert_eq!(ip_port, server.ip_port());
            fingerprint
        }
        other => panic!("expected trust to be required, got {other:?}"),
    };
    assert_eq!(fingerprint, FP_OLD);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(!trust.fingerprint_exists(&server.ip_port(), FingerprintRole::Normal).unwrap());

    match outcome.into_result() {
        Err(ConnectionError::Trust(TrustError::NotEstablished { fingerprint, .. })) => {
            assert_eq!(fingerprint, FP_OLD)
        }
        other => panic!("expected NotEstablished, got {other:?}"),
    }

    conn.add_trust(Some(&fingerprint), TrustOptions::default()).unwrap();
    assert!(trust
        .fingerprint_matches(&server.ip_port(), FingerprintRole::Normal, FP_OLD)
        .unwrap());

    let outcome = conn.connect().unwrap();
    assert_eq!(
        outcome,
        ConnectOutcome::Connected {
            trust: Some(TrustDecision::Trusted)
        }
    );
    assert!(conn.is_connected());
    assert_eq!(conn.fingerprint(), Some(FP_OLD));
    conn.disconnect();
}

#[test]
fn test_auto_accept_installs_on_first_contact() {
    let server = idle_server();
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    let config = RpcConfig {
        auto_accept_trust: true,
        ..RpcConfig::default()
    };
    let mut conn = connection(&server, true, config, trust.clone(), FixedFingerprint::new(FP_OLD));

    let outcome = conn.connect().unwrap();
    assert_eq!(
        outcome,
        ConnectOutcome::Connected {
            trust: Some(TrustDecision::Installed(TrustKind::NewConnection))
        }
    );
    assert!(trust
        .fingerprint_matches(&server.ip_port(), FingerprintRole::Normal, FP_OLD)
        .unwrap());
}

#[test]
fn test_changed_key_without_replacement_is_refused() {
    let server = idle_server();
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    trust
        .install_fingerprint(&server.ip_port(), FingerprintRole::Normal, FP_OLD)
        .unwrap();
    let mut conn = connection(
        &server,
        true,
        RpcConfig::default(),
        trust.clone(),
        FixedFingerprint::new(FP_NEW),
    );

    match conn.connect().unwrap() {
        ConnectOutcome::TrustRequired { kind, fingerprint, .. } => {
            assert_eq!(kind, TrustKind::NewKey);
            assert_eq!(fingerprint, FP_NEW);
        }
        other => panic!("expected NEW_KEY, got {other:?}"),
    }
    assert!(trust
        .fingerprint_matches(&server.ip_port(), FingerprintRole::Normal, FP_OLD)
        .unwrap());
}

#[test]
fn test_key_rotation_promotes_replacement() {
    let server = idle_server();
    let temp = TempDir::new().unwrap();
    let trust = file_trust(&temp);
    let ip_port = server.ip_port();
    trust
        .install_fingerprint(&ip_port, FingerprintRole::Normal, FP_OLD)
        .unwrap();

    let connector = FixedFingerprint::new(FP_OLD);
    let mut conn = connection(
        &server,
        true,
        RpcConfig::default(),
        trust.clone(),
        connector.clone(),
    );
    assert!(conn.connect().unwrap().is_connected());
    conn.disconnect();

    trust
        .install_fingerprint(&ip_port, FingerprintRole::Replacement, FP_NEW)
        .unwrap();
    connector.rotate(FP_NEW);

    let outcome = conn.connect().unwrap();
    assert_eq!(
        outcome,
        ConnectOutcome::Connected {
            trust: Some(TrustDecision::Rotated)
        }
    );
    conn.disconnect();

    // A fresh store over the same file sees the rotation.
    let reopened = file_trust(&temp);
    let normal = reopened
        .get_fingerprint(&ip_port, FingerprintRole::Normal)
        .unwrap()
        .unwrap();
    assert_eq!(normal.value, FP_NEW);
    assert!(!reopened
        .fingerprint_exists(&ip_port, FingerprintRole::Replacement)
        .unwrap());
}

#[test]
fn test_quiet_variant_returns_no_info_records() {
    const N: usize = 4;
    let server = MockServer::start(Arc::new(|_command: &str, args: &[String]| {
        if args.iter().any(|arg| arg == "-q") {
            Vec::new()
        } else {
            (0..N)
                .map(|i| message(Severity::Info, &format!("//depot/f{i} - refreshing")))
                .collect()
        }
    }));
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    let mut conn = connection(
        &server,
        false,
        RpcConfig::default(),
        trust,
        FixedFingerprint::new(FP_OLD),
    );
    conn.connect().unwrap();

    let loud = conn.run("sync", &["//depot/..."], HashMap::new()).unwrap();
    assert_eq!(loud.records.len(), N);
    assert_eq!(loud.infos().count(), N);
    assert_eq!(loud.status.severity, Severity::Info);

    let quiet = conn.run("sync", &["-q", "//depot/..."], HashMap::new()).unwrap();
    assert!(quiet.records.is_empty());
    assert_eq!(quiet.status.severity, Severity::Empty);
    assert!(conn.is_connected());
}

#[test]
fn test_quiet_mode_drops_info_but_keeps_warnings_and_failures() {
    let server = MockServer::start(Arc::new(|_command: &str, _args: &[String]| {
        vec![
            message(Severity::Info, "//depot/a - refreshing"),
            message(Severity::Warning, "//depot/b - file(s) up-to-date."),
            message(Severity::Failed, "//depot/c - no such file(s)."),
        ]
    }));
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    let config = RpcConfig {
        quiet_mode: true,
        ..RpcConfig::default()
    };
    let mut conn = connection(&server, false, config, trust, FixedFingerprint::new(FP_OLD));
    let recorder = Arc::new(Recorder::default());
    conn.set_command_callback(Some(recorder.clone()));
    conn.connect().unwrap();

    let output = conn.run("sync", &["//depot/..."], HashMap::new()).unwrap();
    conn.disconnect();

    let protocols = server.protocol_fields();
    assert_eq!(protocols.len(), 1);
    assert!(protocols[0].iter().any(|field| field == "quiet"));

    let texts: Vec<(bool, String)> = output
        .records
        .iter()
        .map(|record| match record {
            CommandRecord::Info(message) => (false, message.text().to_string()),
            CommandRecord::Error(message) => (true, message.text().to_string()),
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    assert_eq!(
        texts,
        vec![
            (false, "//depot/b - file(s) up-to-date.".to_string()),
            (true, "//depot/c - no such file(s).".to_string()),
        ]
    );
    assert_eq!(output.status.severity, Severity::Failed);

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "1 issue sync //depot/...".to_string(),
            "1 info //depot/b - file(s) up-to-date.".to_string(),
            "1 error //depot/c - no such file(s).".to_string(),
            "1 done".to_string(),
        ]
    );
}

#[test]
fn test_cancelled_stream_leaves_connection_usable() {
    const TOTAL: u32 = 10;
    const STOP_AFTER: usize = 3;
    let server = MockServer::start(Arc::new(|command: &str, _args: &[String]| match command {
        "fstat" => (1..=TOTAL).map(|rev| fstat(&format!("//depot/f{rev}"), rev)).collect(),
        _ => vec![message(Severity::Info, "pong")],
    }));
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    let mut conn = connection(
        &server,
        false,
        RpcConfig::default(),
        trust,
        FixedFingerprint::new(FP_OLD),
    );
    conn.connect().unwrap();

    let mut seen = Vec::new();
    let mut sink = |record: CommandRecord| {
        seen.push(record);
        if seen.len() == STOP_AFTER {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    let status = conn
        .execute("fstat", &["//depot/..."], HashMap::new(), &mut sink)
        .unwrap();
    assert!(status.cancelled);
    assert_eq!(status.delivered, STOP_AFTER);
    assert_eq!(seen.len(), STOP_AFTER);
    match &seen[0] {
        CommandRecord::Tagged(fields) => {
            assert_eq!(fields.get_str("depotFile").as_deref(), Some("//depot/f1"));
            assert!(fields.func().is_none());
        }
        other => panic!("expected tagged record, got {other:?}"),
    }

    let output = conn.run("info", &[], HashMap::new()).unwrap();
    assert_eq!(output.records.len(), 1);
    assert_eq!(output.infos().next().map(|m| m.text()).as_deref(), Some("pong"));
    conn.disconnect();

    let requests = server.requests();
    assert_eq!(requests.iter().filter(|f| f.as_str() == "protocol").count(), 1);
    assert!(requests.contains(&"user-fstat".to_string()));
    assert!(requests.contains(&"user-info".to_string()));
}

#[derive(Default)]
struct Recorder {
    events: std::sync::Mutex<Vec<String>>,
}

impl p4rpc::rpc::CommandCallback for Recorder {
    fn issuing_command(&self, key: u64, text: &str) {
        self.events.lock().unwrap().push(format!("{key} issue {text}"));
    }

    fn received_info(&self, key: u64, message: &p4rpc::rpc::ServerMessage) {
        self.events.lock().unwrap().push(format!("{key} info {}", message.text()));
    }

    fn received_error(&self, key: u64, message: &p4rpc::rpc::ServerMessage) {
        self.events.lock().unwrap().push(format!("{key} error {}", message.text()));
    }

    fn completed(&self, key: u64, _elapsed_ms: u64) {
        self.events.lock().unwrap().push(format!("{key} done"));
    }
}

#[test]
fn test_callback_and_login_ticket() {
    let server = MockServer::start(Arc::new(|command: &str, _args: &[String]| match command {
        "login" => {
            let mut set_password = p4rpc::rpc::WireRecord::for_function("client-SetPassword");
            set_password.set("data", "0123ABCD");
            set_password.set("data2", "login");
            vec![set_password, message(Severity::Info, "User alice logged in.")]
        }
        _ => vec![message(Severity::Failed, "Path not in client view.")],
    }));
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    let config = RpcConfig {
        user: Some("alice".to_string()),
        ..RpcConfig::default()
    };
    let mut conn = connection(&server, false, config, trust, FixedFingerprint::new(FP_OLD));
    let recorder = Arc::new(Recorder::default());
    conn.set_command_callback(Some(recorder.clone()));
    conn.connect().unwrap();

    conn.run("login", &[], HashMap::new()).unwrap();
    assert_eq!(conn.ticket().unwrap().as_deref(), Some("0123ABCD"));

    let output = conn.run("files", &["//other/..."], HashMap::new()).unwrap();
    assert_eq!(output.status.severity, Severity::Failed);
    assert_eq!(output.errors().count(), 1);

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "1 issue login".to_string(),
            "1 info User alice logged in.".to_string(),
            "1 done".to_string(),
            "2 issue files //other/...".to_string(),
            "2 error Path not in client view.".to_string(),
            "2 done".to_string(),
        ]
    );
}

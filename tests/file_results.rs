//! Decoding command results into file records

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{FixedFingerprint, MockServer, connection, message};
use p4rpc::rpc::codec::WireRecord;
use p4rpc::rpc::error::CommandError;
use p4rpc::rpc::filespec::FileAction;
use p4rpc::rpc::{AuthStore, ChangelistId, FileSpec, Revision, RpcConfig, Severity, TrustStore};

fn fstat_reply(depot_file: &str) -> WireRecord {
    let mut record = WireRecord::for_function("client-FstatInfo");
    record.set("depotFile", depot_file);
    record.set("clientFile", "//ws/main/a.c");
    record.set("headAction", "edit");
    record.set("headChange", "1234");
    record.set("headRev", "7");
    record.set("haveRev", "none");
    record.set("action", "edit");
    record.set("change", "default");
    record.set("attr-owner", "build");
    record.set("headTime", "not-a-number");
    record
}

#[test]
fn test_revision_text_forms() {
    assert_eq!(Revision::parse("head"), Revision::Head);
    assert_eq!(Revision::parse("none"), Revision::None);
    assert_eq!(Revision::parse("#12"), Revision::Number(12));
    assert_eq!(Revision::parse("12"), Revision::Number(12));
    assert_eq!(Revision::parse("#"), Revision::None);
    assert_eq!(Revision::parse("twelve"), Revision::None);
    assert_eq!(Revision::Head.as_raw(), Revision::HEAD_RAW);
    assert_eq!(Revision::Number(3).to_string(), "#3");
}

#[test]
fn test_changelist_text_forms() {
    assert_eq!(ChangelistId::parse(None), ChangelistId::Unknown);
    assert_eq!(ChangelistId::parse(Some("")), ChangelistId::Unknown);
    assert_eq!(ChangelistId::parse(Some("default")), ChangelistId::Default);
    assert_eq!(ChangelistId::parse(Some("default change")), ChangelistId::Default);
    assert_eq!(ChangelistId::parse(Some("change 42")), ChangelistId::Number(42));
    assert_eq!(ChangelistId::parse(Some("42")), ChangelistId::Number(42));
    assert_eq!(ChangelistId::parse(Some("pending")), ChangelistId::Unknown);
    assert_eq!(ChangelistId::Default.as_raw(), 0);
}

#[test]
fn test_fstat_results_decode_through_the_dispatcher() {
    let server = MockServer::start(Arc::new(|_command: &str, args: &[String]| {
        let mut replies = Vec::new();
        for arg in args {
            if arg.contains("missing") {
                replies.push(message(Severity::Warning, &format!("{arg} - no such file(s).")));
            } else {
                replies.push(fstat_reply(arg));
            }
        }
        replies
    }));
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    let mut conn = connection(
        &server,
        false,
        RpcConfig::default(),
        trust,
        FixedFingerprint::new("AA:BB"),
    );
    conn.connect().unwrap();

    let output = conn
        .run("fstat", &["//depot/main/a.c", "//depot/missing.c"], HashMap::new())
        .unwrap();
    assert_eq!(output.status.severity, Severity::Warning);

    let specs: Vec<FileSpec> = output
        .records
        .iter()
        .filter_map(|record| FileSpec::from_command_record(record, true))
        .collect();
    assert_eq!(specs.len(), 2);

    let fields = specs[0].fields().unwrap();
    assert_eq!(fields.depot_path.as_deref(), Some("//depot/main/a.c"));
    assert_eq!(fields.action, Some(FileAction::Edit));
    assert_eq!(fields.changelist, ChangelistId::Default);

    let extended = specs[0].extended().unwrap();
    assert_eq!(extended.head_change, ChangelistId::Number(1234));
    assert_eq!(extended.head_rev, 7);
    assert_eq!(extended.have_rev, Revision::None);
    assert_eq!(extended.head_time, None);
    assert_eq!(extended.attributes.get("owner").map(Vec::as_slice), Some(&b"build"[..]));

    match &specs[1] {
        FileSpec::Info(message) => {
            assert_eq!(message.text(), "//depot/missing.c - no such file(s).")
        }
        other => panic!("expected an info spec, got {other:?}"),
    }
}

#[test]
fn test_fatal_message_fails_the_command() {
    let server = MockServer::start(Arc::new(|_command: &str, _args: &[String]| {
        vec![message(Severity::Fatal, "Server is shutting down.")]
    }));
    let trust = Arc::new(TrustStore::new(AuthStore::memory()));
    let mut conn = connection(
        &server,
        false,
        RpcConfig::default(),
        trust,
        FixedFingerprint::new("AA:BB"),
    );
    conn.connect().unwrap();

    match conn.run("info", &[], HashMap::new()) {
        Err(CommandError::Request(message)) => {
            assert_eq!(message.severity(), Severity::Fatal);
            assert_eq!(message.text(), "Server is shutting down.");
        }
        other => panic!("expected a request failure, got {other:?}"),
    }
}

//! Shared test harness: an in-process mock Perforce server and a connector
//! that reports a configurable certificate fingerprint.

#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use p4rpc::rpc::codec::{Charset, WireRecord, read_packet, write_packet};
use p4rpc::rpc::connection::{ConnectTarget, Connection};
use p4rpc::rpc::error::ConnectionResult;
use p4rpc::rpc::message::{MessageCode, Severity};
use p4rpc::rpc::transport::{Connector, Transport};
use p4rpc::rpc::{AuthStore, RpcConfig, TicketStore, TrustStore};

/// Produces the records the server sends back for `user-<command> args...`
pub type Handler = dyn Fn(&str, &[String]) -> Vec<WireRecord> + Send + Sync;

/// A mock server accepting any number of sequential connections.
pub struct MockServer {
    /// Listening port on 127.0.0.1
    pub port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    protocols: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockServer {
    /// Start serving with `handler` on a background thread.
    pub fn start(handler: Arc<Handler>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let protocols = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        let announced = Arc::clone(&protocols);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let handler = Arc::clone(&handler);
                let seen = Arc::clone(&seen);
                let announced = Arc::clone(&announced);
                thread::spawn(move || serve(stream, handler, seen, announced));
            }
        });
        Self {
            port,
            requests,
            protocols,
        }
    }

    /// Function names received so far, across all connections
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Field names of every client `protocol` record received
    pub fn protocol_fields(&self) -> Vec<Vec<String>> {
        self.protocols.lock().expect("protocols lock").clone()
    }

    /// The `ip:port` key the client stores trust under
    pub fn ip_port(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

fn serve(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    seen: Arc<Mutex<Vec<String>>>,
    announced: Arc<Mutex<Vec<Vec<String>>>>,
) {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    while let Ok((record, _)) = read_packet(&mut stream, Charset::Utf8) {
        let func = record.func().unwrap_or_default().into_owned();
        seen.lock().expect("requests lock").push(func.clone());
        if func == "release" {
            break;
        }
        if func == "protocol" {
            let fields = record.keys().map(str::to_string).collect();
            announced.lock().expect("protocols lock").push(fields);
        }
        let Some(command) = func.strip_prefix("user-") else {
            continue;
        };
        let args: Vec<String> = record
            .args()
            .map(|arg| String::from_utf8_lossy(arg.as_bytes()).into_owned())
            .collect();
        for reply in handler(command, &args) {
            if write_packet(&mut stream, &reply, Charset::Utf8).is_err() {
                return;
            }
        }
        if write_packet(&mut stream, &WireRecord::for_function("release"), Charset::Utf8).is_err() {
            return;
        }
    }
}

/// Plain TCP connector that claims the peer presented `fingerprint`.
#[derive(Default)]
pub struct FixedFingerprint {
    fingerprint: Mutex<Option<String>>,
}

impl FixedFingerprint {
    /// Connector reporting `fingerprint`
    pub fn new(fingerprint: &str) -> Arc<Self> {
        Arc::new(Self {
            fingerprint: Mutex::new(Some(fingerprint.to_string())),
        })
    }

    /// Simulate a server key rotation
    pub fn rotate(&self, fingerprint: &str) {
        *self.fingerprint.lock().expect("fingerprint lock") = Some(fingerprint.to_string());
    }
}

impl Connector for FixedFingerprint {
    fn connect(
        &self,
        host: &str,
        port: u16,
        _secure: bool,
        _timeout: Option<Duration>,
    ) -> ConnectionResult<Transport> {
        let stream = TcpStream::connect((host, port))?;
        Ok(Transport {
            peer_addr: stream.peer_addr().ok(),
            local_addr: stream.local_addr().ok(),
            stream: Box::new(stream),
            fingerprint: self.fingerprint.lock().expect("fingerprint lock").clone(),
        })
    }
}

/// A `client-Message` record carrying one line of `severity`
pub fn message(severity: Severity, text: &str) -> WireRecord {
    let mut record = WireRecord::for_function("client-Message");
    record.set("code0", MessageCode::new(severity, 0, 6, 1).0.to_string());
    record.set("fmt0", text);
    record
}

/// A tagged `client-FstatInfo` record
pub fn fstat(depot_file: &str, rev: u32) -> WireRecord {
    let mut record = WireRecord::for_function("client-FstatInfo");
    record.set("depotFile", depot_file);
    record.set("headRev", rev.to_string());
    record
}

/// Connection to `server` over `connector` with the given stores
pub fn connection(
    server: &MockServer,
    secure: bool,
    config: RpcConfig,
    trust: Arc<TrustStore>,
    connector: Arc<dyn Connector>,
) -> Connection {
    Connection::new(
        ConnectTarget::new("127.0.0.1", server.port, secure),
        config,
        trust,
        Arc::new(TicketStore::new(AuthStore::memory())),
    )
    .with_connector(connector)
}

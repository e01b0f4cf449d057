//! Connection manager
//!
//! A [`Connection`] owns one transport to a server and walks it through
//! `Disconnected → Handshaking → TrustCheck → AuthPending → Connected`.
//! Secure connections are checked against the injected [`TrustStore`] before
//! any command can be sent.

use std::io::{BufReader, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::codec::{Charset, WireRecord, encode_packet, read_packet};
use super::config::RpcConfig;
use super::dispatch::CommandCallback;
use super::env::{ExternalEnv, OsClass, local_host_name};
use super::error::{CodecError, ConnectionError, ConnectionResult, StoreResult, TrustError, TrustKind};
use super::stats::{ServerStats, StatsSnapshot};
use super::tickets::{ServerIdentity, TicketStore};
use super::transport::{Connector, RpcStream, TcpConnector, format_ip_port};
use super::trust::{Fingerprint, FingerprintRole, TrustDecision, TrustOptions, TrustOutcome, TrustStore};
use super::uri::ServerUri;

/// Client API level advertised in the protocol record
pub const CLIENT_API_LEVEL: u32 = 82;

/// Server API level requested; the server clamps it to what it supports
pub const SERVER_API_LEVEL: u32 = 99999;

/// Lifecycle state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Opening the transport and negotiating TLS
    Handshaking,
    /// Checking the server fingerprint
    TrustCheck,
    /// Sending the protocol record and resolving credentials
    AuthPending,
    /// Ready for commands
    Connected,
}

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Host name or address, without IPv6 brackets
    pub host: String,
    /// Port
    pub port: u16,
    /// Use TLS
    pub secure: bool,
}

impl ConnectTarget {
    /// New target
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// `host:port`, bracketing IPv6 hosts
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl From<&ServerUri> for ConnectTarget {
    fn from(uri: &ServerUri) -> Self {
        Self::new(uri.host.clone(), uri.port, uri.secure())
    }
}

/// Result of [`Connection::connect`].
///
/// An untrusted server is an expected outcome on first contact, so it is
/// returned as a value rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The connection is ready for commands
    Connected {
        /// Trust decision taken for secure connections
        trust: Option<TrustDecision>,
    },
    /// The server's fingerprint must be accepted with
    /// [`Connection::add_trust`] before connecting again
    TrustRequired {
        /// Why the server is not trusted
        kind: TrustKind,
        /// Server `ip:port`
        server: String,
        /// Fingerprint observed on the wire
        fingerprint: String,
    },
}

impl ConnectOutcome {
    /// Whether the connection is ready
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected { .. })
    }

    /// Convert a required trust decision into [`TrustError::NotEstablished`].
    pub fn into_result(self) -> ConnectionResult<Option<TrustDecision>> {
        match self {
            ConnectOutcome::Connected { trust } => Ok(trust),
            ConnectOutcome::TrustRequired {
                kind,
                server,
                fingerprint,
            } => Err(ConnectionError::Trust(TrustError::NotEstablished {
                kind,
                server,
                fingerprint,
            })),
        }
    }
}

/// Capabilities the server announced in its `protocol` record.
///
/// Only the first record of a connection is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerProtocol {
    /// Server API level (`server2`)
    pub server_level: Option<u32>,
    /// Security level
    pub security: Option<u32>,
    /// Server runs in unicode mode
    pub unicode: bool,
    /// Server compares names case-insensitively (`nocase`)
    pub case_insensitive: bool,
    received: bool,
}

impl ServerProtocol {
    /// Whether the server's protocol record has arrived
    pub fn received(&self) -> bool {
        self.received
    }

    fn apply(&mut self, record: &WireRecord) {
        if self.received {
            debug!("ignoring repeated server protocol record");
            return;
        }
        self.received = true;
        self.server_level = record.get_str("server2").and_then(|v| v.trim().parse().ok());
        self.security = record.get_str("security").and_then(|v| v.trim().parse().ok());
        self.unicode = record.contains("unicode");
        self.case_insensitive = record.contains("nocase");
        debug!(
            server_level = ?self.server_level,
            unicode = self.unicode,
            case_insensitive = self.case_insensitive,
            "server protocol"
        );
    }
}

pub(crate) struct Session {
    pub(crate) stream: BufReader<Box<dyn RpcStream>>,
    pub(crate) fingerprint: Option<String>,
    pub(crate) server_ip_port: String,
    pub(crate) connected_at: DateTime<Utc>,
    pub(crate) started: Instant,
    pub(crate) env: ExternalEnv,
    pub(crate) env_sent: bool,
    pub(crate) tagged: bool,
    pub(crate) server: ServerProtocol,
}

/// One logical session with a Perforce server.
pub struct Connection {
    target: ConnectTarget,
    pub(crate) config: RpcConfig,
    charset: Charset,
    unicode: bool,
    trust: Arc<TrustStore>,
    tickets: Arc<TicketStore>,
    connector: Arc<dyn Connector>,
    state: ConnectionState,
    pub(crate) session: Option<Session>,
    stats: ServerStats,
    connected_time: Duration,
    server_id: Option<String>,
    cluster_id: Option<String>,
    pub(crate) callback: Option<Arc<dyn CommandCallback>>,
    pub(crate) next_command_key: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("charset", &self.charset)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a disconnected connection using the TCP/TLS connector.
    pub fn new(
        target: ConnectTarget,
        config: RpcConfig,
        trust: Arc<TrustStore>,
        tickets: Arc<TicketStore>,
    ) -> Self {
        Self {
            target,
            config,
            charset: Charset::default(),
            unicode: false,
            trust,
            tickets,
            connector: Arc::new(TcpConnector),
            state: ConnectionState::Disconnected,
            session: None,
            stats: ServerStats::new(),
            connected_time: Duration::ZERO,
            server_id: None,
            cluster_id: None,
            callback: None,
            next_command_key: 0,
        }
    }

    /// Create from a server URI; query pairs are applied as properties.
    pub fn from_uri(
        uri: &str,
        mut config: RpcConfig,
        trust: Arc<TrustStore>,
        tickets: Arc<TicketStore>,
    ) -> ConnectionResult<Self> {
        let uri = ServerUri::parse(uri)?;
        config.apply_properties(&uri.properties);
        Ok(Self::new(ConnectTarget::from(&uri), config, trust, tickets))
    }

    /// Replace the transport connector
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether commands can be sent
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Connection target
    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Configuration in effect
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Negotiated charset
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Trust store shared with other connections
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Ticket store shared with other connections
    pub fn ticket_store(&self) -> &Arc<TicketStore> {
        &self.tickets
    }

    /// Server fingerprint of the live secure session
    pub fn fingerprint(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.fingerprint.as_deref())
    }

    /// Server `ip:port` of the live session
    pub fn server_ip_port(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.server_ip_port.as_str())
    }

    /// Server capabilities seen so far in the live session
    pub fn server_protocol(&self) -> Option<&ServerProtocol> {
        self.session.as_ref().map(|s| &s.server)
    }

    /// When the live session was established
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.session.as_ref().map(|s| s.connected_at)
    }

    /// Total connected time, including the live session
    pub fn elapsed(&self) -> Duration {
        self.connected_time + self.session.as_ref().map(|s| s.started.elapsed()).unwrap_or_default()
    }

    /// Traffic counters since the last disconnect
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn server_stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Record the server and cluster ids reported by `info`.
    pub fn set_server_ids(&mut self, server_id: Option<String>, cluster_id: Option<String>) {
        self.server_id = server_id;
        self.cluster_id = cluster_id;
    }

    /// Identity used for ticket keys.
    ///
    /// Case folding is only known once the server's `protocol` record has
    /// arrived, which happens with the first command's replies. Before that
    /// user names are compared as given.
    pub fn server_identity(&self) -> ServerIdentity {
        ServerIdentity {
            host_port: self.target.host_port(),
            server_id: self.server_id.clone(),
            cluster_id: self.cluster_id.clone(),
            case_insensitive: self
                .session
                .as_ref()
                .is_some_and(|s| s.server.case_insensitive),
        }
    }

    /// User name sent to the server
    pub fn user_name(&self) -> &str {
        self.config
            .user
            .as_deref()
            .filter(|user| !user.trim().is_empty())
            .unwrap_or(&self.config.unset_user_name)
    }

    /// Cached ticket for the configured user.
    ///
    /// On a `nocase` server the user is folded from the first command on.
    pub fn ticket(&self) -> StoreResult<Option<String>> {
        self.tickets.load_for(&self.server_identity(), self.user_name())
    }

    /// Cache (or clear) the configured user's ticket
    pub fn save_ticket(&self, value: Option<&str>) -> StoreResult<()> {
        self.tickets.save_for(&self.server_identity(), self.user_name(), value)
    }

    /// Open the transport, check trust and send the protocol record.
    ///
    /// When the server is not trusted the transport is closed and
    /// [`ConnectOutcome::TrustRequired`] is returned.
    pub fn connect(&mut self) -> ConnectionResult<ConnectOutcome> {
        if self.state != ConnectionState::Disconnected {
            return Err(ConnectionError::InvalidState("already connected"));
        }
        let result = self.establish();
        match &result {
            Ok(ConnectOutcome::Connected { .. }) => {}
            Ok(ConnectOutcome::TrustRequired { kind, server, .. }) => {
                warn!(%kind, server = %server, "server is not trusted");
                self.abort();
            }
            Err(err) => {
                warn!(target = %self.target.host_port(), error = %err, "connect failed");
                self.abort();
            }
        }
        result
    }

    fn establish(&mut self) -> ConnectionResult<ConnectOutcome> {
        self.state = ConnectionState::Handshaking;
        let charset_name = self.config.charset.clone().unwrap_or_default();
        self.charset = Charset::from_name(&charset_name)?;
        self.unicode = !matches!(charset_name.trim().to_ascii_lowercase().as_str(), "" | "none");

        let transport = self.connector.connect(
            &self.target.host,
            self.target.port,
            self.target.secure,
            self.config.socket_timeout(),
        )?;
        let server_ip_port = self.ip_port_for(transport.peer_addr);

        let mut trust = None;
        if self.target.secure {
            self.state = ConnectionState::TrustCheck;
            let fingerprint = transport
                .fingerprint
                .as_deref()
                .ok_or_else(|| TrustError::NotSecure(server_ip_port.clone()))?;
            let policy = TrustOptions {
                auto_accept: self.config.auto_accept_trust,
                ..TrustOptions::default()
            };
            match self.trust.evaluate(&server_ip_port, fingerprint, policy)? {
                TrustDecision::NeedsDecision { kind, fingerprint } => {
                    return Ok(ConnectOutcome::TrustRequired {
                        kind,
                        server: server_ip_port,
                        fingerprint,
                    });
                }
                decision => trust = Some(decision),
            }
        }

        self.state = ConnectionState::AuthPending;
        let env = self.build_env();
        self.session = Some(Session {
            stream: BufReader::new(transport.stream),
            fingerprint: transport.fingerprint,
            server_ip_port,
            connected_at: Utc::now(),
            started: Instant::now(),
            env,
            env_sent: false,
            tagged: true,
            server: ServerProtocol::default(),
        });
        self.send_protocol(true)?;

        self.state = ConnectionState::Connected;
        info!(
            server = %self.target.host_port(),
            secure = self.target.secure,
            charset = self.charset.name(),
            "connected"
        );
        Ok(ConnectOutcome::Connected { trust })
    }

    fn ip_port_for(&self, peer: Option<SocketAddr>) -> String {
        peer.as_ref()
            .map(format_ip_port)
            .unwrap_or_else(|| self.target.host_port())
    }

    fn build_env(&self) -> ExternalEnv {
        ExternalEnv {
            prog_name: self.config.program_name.clone(),
            prog_version: self.config.program_version.clone(),
            client: self
                .config
                .client
                .clone()
                .filter(|client| !client.trim().is_empty())
                .unwrap_or_else(|| self.config.unset_client_name.clone()),
            cwd: std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default(),
            host: local_host_name(),
            port: self.target.host_port(),
            language: String::new(),
            os: OsClass::current(),
            user: self.user_name().to_string(),
            unicode: self.unicode,
            charset: self.charset,
        }
    }

    /// The `protocol` capability record for the given tag state.
    pub(crate) fn protocol_record(&self, tagged: bool) -> WireRecord {
        let mut record = WireRecord::for_function("protocol");
        record.set("client", CLIENT_API_LEVEL.to_string());
        record.set("api", SERVER_API_LEVEL.to_string());
        if tagged {
            record.set("tag", "");
        }
        if self.config.enable_streams {
            record.set("enableStreams", "");
        }
        if self.config.quiet_mode {
            record.set("quiet", "");
        }
        if let Some(app) = self.config.application_name.as_deref() {
            record.set("app", app);
        }
        if let Some(session) = &self.session {
            record.set("host", session.env.host.as_str());
            record.set("port", session.env.port.as_str());
        }
        record
    }

    pub(crate) fn send_protocol(&mut self, tagged: bool) -> ConnectionResult<()> {
        let record = self.protocol_record(tagged);
        self.send(&record)?;
        if let Some(session) = self.session.as_mut() {
            session.tagged = tagged;
        }
        Ok(())
    }

    pub(crate) fn apply_server_protocol(&mut self, record: &WireRecord) {
        if let Some(session) = self.session.as_mut() {
            session.server.apply(record);
        }
    }

    /// Write one record to the server.
    pub fn send(&mut self, record: &WireRecord) -> ConnectionResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(ConnectionError::InvalidState("not connected"))?;
        let bytes = encode_packet(record, self.charset)?;
        let stream = session.stream.get_mut();
        stream.write_all(&bytes)?;
        stream.flush()?;
        self.stats.record_send(bytes.len());
        debug!(func = ?record.func(), bytes = bytes.len(), "sent packet");
        Ok(())
    }

    /// Read the next record from the server.
    pub fn receive(&mut self) -> ConnectionResult<WireRecord> {
        let session = self
            .session
            .as_mut()
            .ok_or(ConnectionError::InvalidState("not connected"))?;
        let (record, size) = match read_packet(&mut session.stream, self.charset) {
            Ok(packet) => packet,
            Err(CodecError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ConnectionError::Closed);
            }
            Err(err) => return Err(err.into()),
        };
        self.stats.record_receive(size);
        debug!(func = ?record.func(), bytes = size, "received packet");
        Ok(record)
    }

    /// Close the session, sending a best-effort `release` first.
    ///
    /// Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            self.state = ConnectionState::Disconnected;
            return;
        };
        let notice = encode_packet(&WireRecord::for_function("release"), self.charset);
        let delivered = match notice {
            Ok(bytes) => {
                let stream = session.stream.get_mut();
                stream.write_all(&bytes).and_then(|()| stream.flush()).is_ok()
            }
            Err(_) => false,
        };
        if !delivered {
            debug!("release notice not delivered");
        }
        self.finish(session);
    }

    /// Drop the transport without notifying the server.
    pub(crate) fn abort(&mut self) {
        match self.session.take() {
            Some(session) => self.finish(session),
            None => self.state = ConnectionState::Disconnected,
        }
    }

    fn finish(&mut self, session: Session) {
        let elapsed = session.started.elapsed();
        self.connected_time += elapsed;
        drop(session);
        self.state = ConnectionState::Disconnected;
        info!(
            server = %self.target.host_port(),
            "connected for {} msec elapsed time",
            elapsed.as_millis()
        );
        info!(stats = %self.stats.snapshot(), "server statistics");
        self.stats.clear();
    }

    fn probe(&self) -> ConnectionResult<(String, String)> {
        if let Some(session) = &self.session {
            if let Some(fingerprint) = &session.fingerprint {
                return Ok((session.server_ip_port.clone(), fingerprint.clone()));
            }
        }
        if !self.target.secure {
            return Err(TrustError::NotSecure(self.target.host_port()).into());
        }
        let transport = self.connector.connect(
            &self.target.host,
            self.target.port,
            true,
            self.config.socket_timeout(),
        )?;
        let server_ip_port = self.ip_port_for(transport.peer_addr);
        let fingerprint = transport
            .fingerprint
            .ok_or_else(|| TrustError::NotSecure(server_ip_port.clone()))?;
        Ok((server_ip_port, fingerprint))
    }

    /// Accept the server's fingerprint.
    ///
    /// With `value` the given fingerprint is installed outright; otherwise the
    /// observed one is installed subject to `opts`.
    pub fn add_trust(&self, value: Option<&str>, opts: TrustOptions) -> ConnectionResult<TrustOutcome> {
        let (server_ip_port, observed) = self.probe()?;
        let outcome = self.trust.add_trust(&server_ip_port, &observed, value, opts)?;
        info!(server = %server_ip_port, %outcome, "add trust");
        Ok(outcome)
    }

    /// Remove the server's NORMAL or REPLACEMENT fingerprint.
    pub fn remove_trust(&self, replacement: bool) -> ConnectionResult<bool> {
        let (server_ip_port, _) = self.probe()?;
        self.trust
            .remove_trust(&server_ip_port, replacement)
            .map_err(|err| TrustError::Store(err).into())
    }

    /// Stored fingerprints, optionally limited to one role
    pub fn get_trusts(&self, role: Option<FingerprintRole>) -> StoreResult<Vec<Fingerprint>> {
        self.trust.list_fingerprints(role)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

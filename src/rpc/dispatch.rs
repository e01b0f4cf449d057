//! Command dispatch
//!
//! Sends `user-<command>` requests over a [`Connection`] and streams the
//! server's replies to a [`ResultSink`] until the server releases the command.
//! Each reply is classified by the severity packed into its message code.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::codec::{FUNC_KEY, FUNC2_KEY, FieldValue, WireRecord};
use super::connection::Connection;
use super::error::{CommandError, CommandResult, ConnectionError};
use super::message::{AuthFailure, ServerMessage, Severity};

/// Reserved input key overriding tagged output (`"true"` / `"false"`)
pub const USE_TAGS_KEY: &str = "useTags";

/// Input keys answering password prompts, in lookup order
const PASSWORD_KEYS: [&str; 4] = ["password", "oldPassword", "newPassword", "newPassword2"];

/// Commands accepted without relaxed name checks
const KNOWN_COMMANDS: &[&str] = &[
    "add", "admin", "annotate", "attribute", "branch", "branches", "change", "changes",
    "client", "clients", "copy", "counter", "counters", "cstat", "delete", "depot", "depots",
    "describe", "diff", "diff2", "dirs", "edit", "export", "filelog", "files", "fix", "fixes",
    "fstat", "grep", "group", "groups", "have", "info", "integrate", "integrated",
    "interchanges", "istat", "job", "jobs", "jobspec", "key", "keys", "label", "labels",
    "labelsync", "license", "list", "lock", "login", "login2", "logout", "logtail", "merge",
    "monitor", "move", "obliterate", "opened", "passwd", "print", "property", "protect",
    "protects", "reconcile", "reload", "rename", "reopen", "resolve", "resolved", "revert",
    "review", "reviews", "search", "shelve", "sizes", "spec", "status", "stream", "streams",
    "submit", "sync", "tag", "tickets", "triggers", "typemap", "unload", "unlock", "unshelve",
    "user", "users", "verify", "where",
];

/// Commands whose tagged output is unusable when streamed
const UNTAGGED_WHEN_STREAMING: &[&str] = &["describe", "diff2", "print", "protect"];

/// Observer for command lifecycle events.
///
/// Invoked on the connection's I/O path; implementations must return promptly.
pub trait CommandCallback: Send + Sync {
    /// A command is about to be sent
    fn issuing_command(&self, _key: u64, _text: &str) {}

    /// An informational message arrived
    fn received_info(&self, _key: u64, _message: &ServerMessage) {}

    /// An error message arrived
    fn received_error(&self, _key: u64, _message: &ServerMessage) {}

    /// The command finished
    fn completed(&self, _key: u64, _elapsed_ms: u64) {}
}

/// One result delivered for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRecord {
    /// Tagged result fields (`client-FstatInfo`)
    Tagged(WireRecord),
    /// Informational or warning message
    Info(ServerMessage),
    /// Failed or fatal message
    Error(ServerMessage),
    /// Untagged text output (`client-OutputInfo`)
    Text(String),
    /// File content (`client-OutputText`, `client-OutputData`, `client-OutputBinary`)
    Data(Vec<u8>),
}

/// Receives a command's results as they arrive.
///
/// Returning [`ControlFlow::Break`] from [`record`](ResultSink::record) stops
/// delivery; the rest of the command is drained from the connection.
pub trait ResultSink {
    /// Called before the first record
    fn start(&mut self, _key: u64) {}

    /// Called for each record
    fn record(&mut self, key: u64, record: CommandRecord) -> ControlFlow<()>;

    /// Called once the server has released the command
    fn end(&mut self, _key: u64, _status: &CommandStatus) {}
}

impl<F> ResultSink for F
where
    F: FnMut(CommandRecord) -> ControlFlow<()>,
{
    fn record(&mut self, _key: u64, record: CommandRecord) -> ControlFlow<()> {
        self(record)
    }
}

/// Terminal status of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Callback key
    pub key: u64,
    /// Worst severity seen
    pub severity: Severity,
    /// Records delivered to the sink
    pub delivered: usize,
    /// The sink asked to stop
    pub cancelled: bool,
    /// Time from issue to release
    pub elapsed: Duration,
}

/// Collected results of [`Connection::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Records in arrival order
    pub records: Vec<CommandRecord>,
    /// Terminal status
    pub status: CommandStatus,
}

impl CommandOutput {
    /// Tagged result records
    pub fn tagged(&self) -> impl Iterator<Item = &WireRecord> {
        self.records.iter().filter_map(|record| match record {
            CommandRecord::Tagged(fields) => Some(fields),
            _ => None,
        })
    }

    /// Informational messages
    pub fn infos(&self) -> impl Iterator<Item = &ServerMessage> {
        self.records.iter().filter_map(|record| match record {
            CommandRecord::Info(message) => Some(message),
            _ => None,
        })
    }

    /// Error messages
    pub fn errors(&self) -> impl Iterator<Item = &ServerMessage> {
        self.records.iter().filter_map(|record| match record {
            CommandRecord::Error(message) => Some(message),
            _ => None,
        })
    }
}

#[derive(Default)]
struct Collector {
    records: Vec<CommandRecord>,
}

impl ResultSink for Collector {
    fn record(&mut self, _key: u64, record: CommandRecord) -> ControlFlow<()> {
        self.records.push(record);
        ControlFlow::Continue(())
    }
}

/// Whether a command should run with tagged output.
///
/// The [`USE_TAGS_KEY`] override is always removed from `input`.
pub fn use_tags(command: &str, input: &mut HashMap<String, String>, streaming: bool) -> bool {
    let requested = input
        .remove(USE_TAGS_KEY)
        .map(|value| value.trim().eq_ignore_ascii_case("true"));
    if matches!(command, "login" | "login2") {
        return false;
    }
    if streaming && UNTAGGED_WHEN_STREAMING.contains(&command) {
        return false;
    }
    requested.unwrap_or(true)
}

/// Check a lower-cased command name.
pub fn validate_command_name(command: &str, relaxed: bool) -> CommandResult<()> {
    let plausible = !command.is_empty()
        && command
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if plausible && (relaxed || KNOWN_COMMANDS.contains(&command)) {
        Ok(())
    } else {
        Err(CommandError::InvalidCommand(command.to_string()))
    }
}

/// Render input fields as a spec form: `Key:\tvalue`, continuation lines
/// indented with a tab, entries separated by blank lines.
pub fn render_form(input: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = input
        .keys()
        .filter(|key| !PASSWORD_KEYS.contains(&key.as_str()))
        .collect();
    keys.sort();
    let mut form = String::new();
    for key in keys {
        let value = &input[key];
        if value.contains('\n') {
            form.push_str(key);
            form.push_str(":\n");
            for line in value.lines() {
                form.push('\t');
                form.push_str(line);
                form.push('\n');
            }
        } else {
            form.push_str(&format!("{key}:\t{value}\n"));
        }
        form.push('\n');
    }
    form
}

struct Progress {
    key: u64,
    worst: Severity,
    delivered: usize,
    cancelled: bool,
    auth: Option<(AuthFailure, ServerMessage)>,
    fatal: Option<ServerMessage>,
}

impl Progress {
    fn deliver(&mut self, sink: &mut dyn ResultSink, record: CommandRecord) {
        if self.cancelled {
            return;
        }
        self.delivered += 1;
        if sink.record(self.key, record).is_break() {
            debug!(key = self.key, delivered = self.delivered, "result stream stopped by caller");
            self.cancelled = true;
        }
    }
}

impl Connection {
    /// Set the lifecycle observer for subsequent commands
    pub fn set_command_callback(&mut self, callback: Option<std::sync::Arc<dyn CommandCallback>>) {
        self.callback = callback;
    }

    /// Run a command, streaming results to `sink`.
    ///
    /// The command is in streaming mode, so `describe`, `diff2`, `print` and
    /// `protect` run untagged.
    pub fn execute(
        &mut self,
        command: &str,
        args: &[&str],
        input: HashMap<String, String>,
        sink: &mut dyn ResultSink,
    ) -> CommandResult<CommandStatus> {
        self.dispatch(command, args, input, true, sink)
    }

    /// Run a command and collect every result.
    pub fn run(
        &mut self,
        command: &str,
        args: &[&str],
        input: HashMap<String, String>,
    ) -> CommandResult<CommandOutput> {
        let mut collector = Collector::default();
        let status = self.dispatch(command, args, input, false, &mut collector)?;
        Ok(CommandOutput {
            records: collector.records,
            status,
        })
    }

    fn dispatch(
        &mut self,
        command: &str,
        args: &[&str],
        mut input: HashMap<String, String>,
        streaming: bool,
        sink: &mut dyn ResultSink,
    ) -> CommandResult<CommandStatus> {
        if !self.is_connected() {
            return Err(ConnectionError::InvalidState("not connected").into());
        }
        let command = command.trim().to_ascii_lowercase();
        validate_command_name(&command, self.config.relax_cmd_name_checks)?;
        let tagged = use_tags(&command, &mut input, streaming);

        self.next_command_key += 1;
        let key = self.next_command_key;
        let started = Instant::now();
        self.server_stats().record_command();

        let text = std::iter::once(command.as_str())
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        info!(key, command = %text, tagged, "issuing command");
        if let Some(callback) = &self.callback {
            callback.issuing_command(key, &text);
        }

        if let Err(err) = self.send_request(&command, args, tagged) {
            self.abort();
            return Err(err.into());
        }

        sink.start(key);
        let mut progress = Progress {
            key,
            worst: Severity::Empty,
            delivered: 0,
            cancelled: false,
            auth: None,
            fatal: None,
        };
        if let Err(err) = self.pump(&mut progress, &mut input, sink) {
            self.abort();
            return Err(err.into());
        }

        let elapsed = started.elapsed();
        let status = CommandStatus {
            key,
            severity: progress.worst,
            delivered: progress.delivered,
            cancelled: progress.cancelled,
            elapsed,
        };
        sink.end(key, &status);
        if let Some(callback) = &self.callback {
            callback.completed(key, elapsed.as_millis() as u64);
        }
        debug!(key, severity = ?status.severity, delivered = status.delivered, "command released");

        if let Some((kind, message)) = progress.auth {
            return Err(CommandError::Access { kind, message });
        }
        if let Some(message) = progress.fatal {
            return Err(CommandError::Request(message));
        }
        Ok(status)
    }

    fn send_request(&mut self, command: &str, args: &[&str], tagged: bool) -> Result<(), ConnectionError> {
        let tag_changed = self.session.as_ref().is_some_and(|s| s.tagged != tagged);
        if tag_changed {
            self.send_protocol(tagged)?;
        }

        let mut request = WireRecord::for_function(&format!("user-{command}"));
        for arg in args {
            request.push_arg(*arg);
        }
        if let Some(session) = self.session.as_mut() {
            if !session.env_sent {
                session.env.marshal_into(&mut request);
                session.env_sent = true;
            }
        }
        if tagged {
            request.set("tag", "");
        }
        if self.config.enable_progress {
            request.set("progress", "1");
        }
        self.send(&request)
    }

    fn pump(
        &mut self,
        progress: &mut Progress,
        input: &mut HashMap<String, String>,
        sink: &mut dyn ResultSink,
    ) -> Result<(), ConnectionError> {
        loop {
            let mut record = self.receive()?;
            let func = record
                .func()
                .map(|func| func.into_owned())
                .unwrap_or_default();
            match func.as_str() {
                "release" | "release2" => return Ok(()),
                "protocol" => self.apply_server_protocol(&record),
                "flush1" => {
                    let mut reply = WireRecord::for_function("flush2");
                    for field in ["himark", "fseq", "rseq"] {
                        if let Some(value) = record.get(field) {
                            reply.set(field, value.clone());
                        }
                    }
                    self.send(&reply)?;
                }
                "client-Message" => {
                    if let Some(message) = ServerMessage::from_record(&record) {
                        self.on_message(progress, sink, message);
                    }
                }
                "client-FstatInfo" => {
                    record.remove(FUNC_KEY);
                    record.remove(FUNC2_KEY);
                    progress.deliver(sink, CommandRecord::Tagged(record));
                }
                "client-OutputInfo" => {
                    let text = record.get_str("data").map(|t| t.into_owned()).unwrap_or_default();
                    progress.deliver(sink, CommandRecord::Text(text));
                }
                "client-OutputText" | "client-OutputData" | "client-OutputBinary" => {
                    let data = record.get_bytes("data").map(<[u8]>::to_vec).unwrap_or_default();
                    progress.deliver(sink, CommandRecord::Data(data));
                }
                "client-OutputError" => {
                    let text = record.get_str("data").map(|t| t.into_owned()).unwrap_or_default();
                    self.on_message(progress, sink, ServerMessage::output_error(text));
                }
                "client-Prompt" => self.answer_prompt(&record, input)?,
                "client-InputData" => {
                    let confirm = confirm_function(&record)?;
                    let mut reply = WireRecord::for_function(&confirm);
                    reply.set("data", render_form(input));
                    self.send(&reply)?;
                }
                "client-SetPassword" => self.on_set_password(&record),
                other => warn!(func = other, "ignoring unhandled server function"),
            }
        }
    }

    fn on_message(&mut self, progress: &mut Progress, sink: &mut dyn ResultSink, message: ServerMessage) {
        self.server_stats().record_message();
        let severity = message.severity();
        progress.worst = progress.worst.max(severity);

        if severity.is_error() {
            if let Some(callback) = &self.callback {
                callback.received_error(progress.key, &message);
            }
            if progress.auth.is_none() {
                if let Some(kind) = message.auth_failure() {
                    progress.auth = Some((kind, message.clone()));
                }
            }
            if severity == Severity::Fatal && progress.fatal.is_none() {
                progress.fatal = Some(message.clone());
            }
            progress.deliver(sink, CommandRecord::Error(message));
            return;
        }

        if self.config.quiet_mode && severity <= Severity::Info {
            return;
        }
        if let Some(callback) = &self.callback {
            callback.received_info(progress.key, &message);
        }
        progress.deliver(sink, CommandRecord::Info(message));
    }

    fn answer_prompt(
        &mut self,
        record: &WireRecord,
        input: &HashMap<String, String>,
    ) -> Result<(), ConnectionError> {
        let confirm = confirm_function(record)?;
        let secret = PASSWORD_KEYS
            .iter()
            .find_map(|key| input.get(*key))
            .map(|value| value.replace(['\r', '\n'], ""))
            .or_else(|| match self.ticket() {
                Ok(ticket) => ticket,
                Err(err) => {
                    warn!(error = %err, "ticket store unreadable");
                    None
                }
            })
            .unwrap_or_default();

        let mut reply = WireRecord::for_function(&confirm);
        for (name, value) in record.iter() {
            if !name.is_empty() && !matches!(name, FUNC_KEY | "data") {
                reply.set(name, value.clone());
            }
        }
        reply.set("data", secret);
        self.send(&reply)
    }

    fn on_set_password(&mut self, record: &WireRecord) {
        let action = record.get_str("data2").map(|a| a.into_owned()).unwrap_or_default();
        let value = match action.as_str() {
            "logout" => None,
            "login" => match record.get("data") {
                Some(FieldValue::Text(text)) => Some(text.clone()),
                Some(FieldValue::Bytes(bytes)) => Some(self.charset().decode(bytes).into_owned()),
                None => return,
            },
            _ => return,
        };
        if let Some(server_id) = record.get_str("serverAddress") {
            let identity = self.server_identity();
            self.set_server_ids(Some(server_id.into_owned()), identity.cluster_id);
        }
        if let Err(err) = self.save_ticket(value.as_deref()) {
            warn!(error = %err, "ticket not cached");
        }
    }
}

fn confirm_function(record: &WireRecord) -> Result<String, ConnectionError> {
    record
        .get_str("confirm")
        .map(|confirm| confirm.into_owned())
        .filter(|confirm| !confirm.is_empty())
        .ok_or_else(|| {
            ConnectionError::Codec(super::error::CodecError::MalformedField {
                offset: 0,
                detail: "server prompt has no confirm function".to_string(),
            })
        })
}

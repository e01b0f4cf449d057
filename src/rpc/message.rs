//! Server messages: numeric codes, format interpolation and auth classification

use std::collections::HashMap;
use std::fmt;

use super::codec::WireRecord;
use super::decode::scan_indexed;

/// Message severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// No message
    Empty,
    /// Informational
    Info,
    /// Warning; the command still succeeded
    Warning,
    /// The request failed
    Failed,
    /// Fatal; the command or connection is unusable
    Fatal,
}

impl Severity {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Severity::Empty,
            1 => Severity::Info,
            2 => Severity::Warning,
            3 => Severity::Failed,
            _ => Severity::Fatal,
        }
    }

    /// Whether the severity is `Failed` or worse
    pub fn is_error(self) -> bool {
        self >= Severity::Failed
    }
}

/// A packed Perforce message code.
///
/// Layout, high to low: severity (4 bits), argument count (4), generic code
/// (8), subsystem (6), sub-code (10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(pub u32);

impl MessageCode {
    /// Subsystem number for client-side messages
    pub const SUBSYSTEM_CLIENT: u32 = 14;

    /// Pack a code from its parts
    pub fn new(severity: Severity, generic: u32, subsystem: u32, sub_code: u32) -> Self {
        let severity = severity as u32;
        MessageCode(
            (severity << 28) | ((generic & 0xFF) << 16) | ((subsystem & 0x3F) << 10) | (sub_code & 0x3FF),
        )
    }

    /// Parse a decimal code as sent in `code{i}` fields
    pub fn parse(text: &str) -> Option<Self> {
        let value: i64 = text.trim().parse().ok()?;
        Some(MessageCode(value as u32))
    }

    /// Severity
    pub fn severity(self) -> Severity {
        Severity::from_raw((self.0 >> 28) & 0xF)
    }

    /// Number of format arguments
    pub fn arg_count(self) -> u32 {
        (self.0 >> 24) & 0xF
    }

    /// Generic error class
    pub fn generic(self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    /// Server subsystem
    pub fn subsystem(self) -> u32 {
        (self.0 >> 10) & 0x3F
    }

    /// Code within the subsystem
    pub fn sub_code(self) -> u32 {
        self.0 & 0x3FF
    }

    /// Subsystem plus sub-code; stable across releases
    pub fn unique_code(self) -> u32 {
        self.0 & 0xFFFF
    }
}

/// Authentication failure categories recognised in server text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No valid ticket or password
    NotLoggedIn,
    /// Ticket expired or was logged out
    SessionExpired,
    /// Single sign-on trigger failed
    SsoLogin,
    /// Password rejected
    PasswordInvalid,
}

const AUTH_PATTERNS: &[(&str, AuthFailure)] = &[
    ("Perforce password (P4PASSWD)", AuthFailure::NotLoggedIn),
    ("Perforce password (%'P4PASSWD'%)", AuthFailure::NotLoggedIn),
    ("Access for user", AuthFailure::NotLoggedIn),
    ("Your session has expired", AuthFailure::SessionExpired),
    ("Your session was logged out", AuthFailure::SessionExpired),
    ("Single sign-on on client failed", AuthFailure::SsoLogin),
    ("Password invalid", AuthFailure::PasswordInvalid),
];

impl AuthFailure {
    /// Classify a message text
    pub fn classify(text: &str) -> Option<Self> {
        AUTH_PATTERNS
            .iter()
            .find(|(pattern, _)| text.contains(pattern))
            .map(|(_, kind)| *kind)
    }
}

/// One coded line of a server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLine {
    /// Packed code
    pub code: MessageCode,
    /// Uninterpolated format string
    pub format: String,
    /// Interpolated text
    pub text: String,
}

/// A message returned by the server, possibly spanning several coded lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    lines: Vec<MessageLine>,
}

impl ServerMessage {
    /// Build a single-line message
    pub fn new(code: MessageCode, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            lines: vec![MessageLine {
                code,
                format: text.clone(),
                text,
            }],
        }
    }

    /// Fatal client-side message used for `client-OutputError` text
    pub fn output_error(text: impl Into<String>) -> Self {
        Self::new(
            MessageCode::new(Severity::Fatal, 0, MessageCode::SUBSYSTEM_CLIENT, 1),
            text,
        )
    }

    /// Extract the message carried in `code0`/`fmt0`, `code1`/`fmt1`, ...
    ///
    /// Returns `None` when the record has no `code0`.
    pub fn from_record(record: &WireRecord) -> Option<Self> {
        let codes = scan_indexed(record, "code");
        if codes.is_empty() {
            return None;
        }
        let args: HashMap<String, String> = record
            .keys()
            .filter(|key| !key.is_empty())
            .filter_map(|key| record.get_str(key).map(|value| (key.to_string(), value.into_owned())))
            .collect();
        let lines = codes
            .into_iter()
            .enumerate()
            .map(|(index, code)| {
                let code = MessageCode::parse(&code).unwrap_or(MessageCode(0));
                let format = record
                    .get_str(&format!("fmt{index}"))
                    .map(|fmt| fmt.into_owned())
                    .unwrap_or_default();
                let text = interpolate(&format, &args);
                MessageLine { code, format, text }
            })
            .collect();
        Some(Self { lines })
    }

    /// Coded lines in order
    pub fn lines(&self) -> &[MessageLine] {
        &self.lines
    }

    /// Worst severity of all lines
    pub fn severity(&self) -> Severity {
        self.lines
            .iter()
            .map(|line| line.code.severity())
            .max()
            .unwrap_or(Severity::Empty)
    }

    /// Code of the first line
    pub fn code(&self) -> MessageCode {
        self.lines.first().map(|line| line.code).unwrap_or(MessageCode(0))
    }

    /// Interpolated text, one line per code
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Authentication failure category, checked against text and raw formats
    pub fn auth_failure(&self) -> Option<AuthFailure> {
        self.lines.iter().find_map(|line| {
            AuthFailure::classify(&line.text).or_else(|| AuthFailure::classify(&line.format))
        })
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Expand a server format string.
///
/// `%name%` is replaced by the argument `name`; `%'text'%` is a literal.
/// A bracketed `[a|b]` group keeps whichever alternative references an
/// argument that is present; `[a]` is kept only if its argument is present.
pub fn interpolate(format: &str, args: &HashMap<String, String>) -> String {
    if !format.contains('%') && !format.contains('|') {
        return format.to_string();
    }
    let resolved = resolve_alternatives(format, args);
    substitute(&resolved, args)
}

fn is_literal(token: &str) -> bool {
    token.len() >= 4 && token.as_bytes()[1] == b'\'' && token.as_bytes()[token.len() - 2] == b'\''
}

/// Iterate over `%...%` tokens as (start, end) byte ranges including the markers.
fn percent_tokens(text: &str) -> Vec<(usize, usize)> {
    let mut tokens = Vec::new();
    let mut search = 0;
    while let Some(start) = text[search..].find('%').map(|i| search + i) {
        match text[start + 1..].find('%') {
            Some(len) => {
                let end = start + 1 + len + 1;
                tokens.push((start, end));
                search = end;
            }
            None => break,
        }
    }
    tokens
}

fn references_present_arg(text: &str, args: &HashMap<String, String>) -> bool {
    percent_tokens(text).into_iter().any(|(start, end)| {
        let token = &text[start..end];
        is_literal(token)
            || args
                .get(&token[1..token.len() - 1])
                .is_some_and(|value| !value.is_empty())
    })
}

fn resolve_alternatives(format: &str, args: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(format.len());
    let mut rest = format;
    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open + 1..].find(']').map(|i| open + 1 + i) else {
            break;
        };
        let inner = &rest[open + 1..close];
        if inner.contains('[') {
            out.push_str(&rest[..open + 1]);
            rest = &rest[open + 1..];
            continue;
        }
        out.push_str(&rest[..open]);
        match inner.split_once('|') {
            Some((first, second)) => {
                let choice = if first.contains('%') {
                    Some(if references_present_arg(first, args) { first } else { second })
                } else if second.contains('%') {
                    Some(if references_present_arg(second, args) { second } else { first })
                } else {
                    None
                };
                match choice {
                    Some(text) => out.push_str(text),
                    None => {
                        out.push('[');
                        out.push_str(inner);
                        out.push(']');
                    }
                }
            }
            None => {
                if references_present_arg(inner, args) {
                    out.push_str(inner);
                } else if !inner.contains('%') {
                    out.push('[');
                    out.push_str(inner);
                    out.push(']');
                }
            }
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

fn substitute(text: &str, args: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end) in percent_tokens(text) {
        out.push_str(&text[last..start]);
        let token = &text[start..end];
        if is_literal(token) {
            out.push_str(&token[2..token.len() - 2]);
        } else {
            match args.get(&token[1..token.len() - 1]) {
                Some(value) => out.push_str(value),
                None => out.push_str(token),
            }
        }
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn code_fields_decompose() {
        let code = MessageCode(0x3512_1C2A);
        assert_eq!(code.severity(), Severity::Failed);
        assert_eq!(code.arg_count(), 5);
        assert_eq!(code.generic(), 0x12);
        assert_eq!(code.subsystem(), 7);
        assert_eq!(code.sub_code(), 0x02A);
        assert_eq!(code.unique_code(), 0x1C2A);
    }

    #[test]
    fn output_error_is_fatal_client_message() {
        let msg = ServerMessage::output_error("disk full");
        assert_eq!(msg.code().0, 1 | (14 << 10) | (4 << 28));
        assert_eq!(msg.severity(), Severity::Fatal);
    }

    #[test]
    fn interpolates_names_and_literals() {
        let a = args(&[("depotFile", "//depot/a.c"), ("rev", "3")]);
        assert_eq!(
            interpolate("%depotFile%#%rev% - %'opened'% for edit", &a),
            "//depot/a.c#3 - opened for edit"
        );
        assert_eq!(interpolate("%missing% stays", &a), "%missing% stays");
    }

    #[test]
    fn picks_alternative_with_present_argument() {
        let a = args(&[("change", "12")]);
        assert_eq!(
            interpolate("Change [%change%|default] submitted.", &a),
            "Change 12 submitted."
        );
        assert_eq!(
            interpolate("Change [%change%|default] submitted.", &args(&[])),
            "Change default submitted."
        );
        assert_eq!(interpolate("file[ (%note%)]", &args(&[])), "file");
    }

    #[test]
    fn message_from_record_collects_all_lines() {
        let mut record = WireRecord::for_function("client-Message");
        record.push("code0", "822483067");
        record.push("fmt0", "%path% - no such file(s).");
        record.push("code1", "285219329");
        record.push("fmt1", "second");
        record.push("path", "//depot/x");
        let msg = ServerMessage::from_record(&record).unwrap();
        assert_eq!(msg.lines().len(), 2);
        assert_eq!(msg.text(), "//depot/x - no such file(s).\nsecond");
        assert_eq!(msg.severity(), Severity::Failed);
    }

    #[test]
    fn classifies_auth_failures() {
        let expired = ServerMessage::new(
            MessageCode::new(Severity::Failed, 0, 0, 0),
            "Your session has expired, please login again.",
        );
        assert_eq!(expired.auth_failure(), Some(AuthFailure::SessionExpired));
        assert_eq!(
            AuthFailure::classify("Perforce password (P4PASSWD) invalid or unset."),
            Some(AuthFailure::NotLoggedIn)
        );
        assert_eq!(AuthFailure::classify("no such file"), None);
    }
}

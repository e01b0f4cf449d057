//! Client environment sent with the first command of a session

use serde::{Deserialize, Serialize};

use super::codec::{Charset, WireRecord};

/// Operating-system class reported to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsClass {
    /// Windows
    #[serde(rename = "NT")]
    Nt,
    /// Everything else
    #[serde(rename = "UNIX")]
    Unix,
}

impl OsClass {
    /// Class of the running platform
    pub fn current() -> Self {
        if cfg!(windows) { OsClass::Nt } else { OsClass::Unix }
    }

    /// Wire form
    pub fn as_str(self) -> &'static str {
        match self {
            OsClass::Nt => "NT",
            OsClass::Unix => "UNIX",
        }
    }
}

/// Immutable per-connection environment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEnv {
    /// Program name
    pub prog_name: String,
    /// Program version
    pub prog_version: String,
    /// Client workspace name
    pub client: String,
    /// Current working directory
    pub cwd: String,
    /// Local host name
    pub host: String,
    /// Server port as configured by the caller
    pub port: String,
    /// Message language
    pub language: String,
    /// OS class
    pub os: OsClass,
    /// User name
    pub user: String,
    /// Whether the server runs in unicode mode
    pub unicode: bool,
    /// Active charset
    pub charset: Charset,
}

impl ExternalEnv {
    /// Append the environment fields to an outgoing record.
    pub fn marshal_into(&self, record: &mut WireRecord) {
        record.set("prog", self.prog_name.as_str());
        record.set("version", self.prog_version.as_str());
        record.set("client", self.client.as_str());
        record.set("cwd", self.cwd.as_str());
        record.set("host", self.host.as_str());
        record.set("port", self.port.as_str());
        if !self.language.is_empty() {
            record.set("language", self.language.as_str());
        }
        record.set("os", self.os.as_str());
        record.set("user", self.user.as_str());
        if self.unicode {
            record.set("unicode", "");
            record.set("charset", self.charset.name());
        }
    }
}

/// Local host name from the environment, or `localhost`.
pub fn local_host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(unicode: bool) -> ExternalEnv {
        ExternalEnv {
            prog_name: "p4rpc".into(),
            prog_version: "0.1.0".into(),
            client: "ws".into(),
            cwd: "/work".into(),
            host: "builder".into(),
            port: "perforce:1666".into(),
            language: String::new(),
            os: OsClass::Unix,
            user: "alice".into(),
            unicode,
            charset: Charset::Utf8,
        }
    }

    #[test]
    fn marshals_identity_fields() {
        let mut record = WireRecord::for_function("user-info");
        sample(false).marshal_into(&mut record);
        assert_eq!(record.get_str("prog").as_deref(), Some("p4rpc"));
        assert_eq!(record.get_str("os").as_deref(), Some("UNIX"));
        assert_eq!(record.get_str("user").as_deref(), Some("alice"));
        assert!(!record.contains("language"));
        assert!(!record.contains("unicode"));
    }

    #[test]
    fn unicode_servers_get_charset() {
        let mut record = WireRecord::for_function("user-info");
        sample(true).marshal_into(&mut record);
        assert_eq!(record.get_str("charset").as_deref(), Some("utf8"));
        assert!(record.contains("unicode"));
    }
}

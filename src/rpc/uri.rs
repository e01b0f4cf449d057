//! Server URIs: `p4java://host:port?key=value&...`

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::error::{ConnectionError, ConnectionResult};

/// Recognized URI schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UriScheme {
    /// `p4java`
    P4Java,
    /// `p4javassl`
    P4JavaSsl,
    /// `p4jrpc`
    P4JRpc,
    /// `p4jrpcssl`
    P4JRpcSsl,
    /// `p4jrpcnts`
    P4JRpcNts,
    /// `p4jrpcntsssl`
    P4JRpcNtsSsl,
}

impl UriScheme {
    const ALL: [UriScheme; 6] = [
        UriScheme::P4Java,
        UriScheme::P4JavaSsl,
        UriScheme::P4JRpc,
        UriScheme::P4JRpcSsl,
        UriScheme::P4JRpcNts,
        UriScheme::P4JRpcNtsSsl,
    ];

    /// Scheme text
    pub fn as_str(self) -> &'static str {
        match self {
            UriScheme::P4Java => "p4java",
            UriScheme::P4JavaSsl => "p4javassl",
            UriScheme::P4JRpc => "p4jrpc",
            UriScheme::P4JRpcSsl => "p4jrpcssl",
            UriScheme::P4JRpcNts => "p4jrpcnts",
            UriScheme::P4JRpcNtsSsl => "p4jrpcntsssl",
        }
    }

    /// Whether the scheme uses TLS
    pub fn is_secure(self) -> bool {
        matches!(
            self,
            UriScheme::P4JavaSsl | UriScheme::P4JRpcSsl | UriScheme::P4JRpcNtsSsl
        )
    }
}

impl fmt::Display for UriScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UriScheme {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// A parsed server URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    /// Scheme
    pub scheme: UriScheme,
    /// Host name or address, without IPv6 brackets
    pub host: String,
    /// Port
    pub port: u16,
    /// Query pairs, values left undecoded
    pub properties: HashMap<String, String>,
}

impl ServerUri {
    /// Parse a URI of the form `scheme://host:port[?k=v&...]`.
    pub fn parse(uri: &str) -> ConnectionResult<Self> {
        let invalid = |detail: &str| ConnectionError::InvalidUri {
            uri: uri.to_string(),
            detail: detail.to_string(),
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let scheme: UriScheme = scheme
            .parse()
            .map_err(|_| invalid("unrecognized scheme"))?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            authority
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

        let properties = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            properties,
        })
    }

    /// Whether the connection should use TLS
    pub fn secure(&self) -> bool {
        self.scheme.is_secure()
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

impl FromStr for ServerUri {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host_port())?;
        let mut pairs: Vec<_> = self.properties.iter().collect();
        pairs.sort();
        for (i, (key, value)) in pairs.into_iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

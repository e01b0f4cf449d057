//! Lenient field decoding shared by the message and file-spec mappers
//!
//! Malformed values never fail a record: they are logged once here and
//! replaced by a default.

use std::fmt;

use super::codec::WireRecord;

/// A file revision as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Revision {
    /// No revision (`none`, absent or unparseable)
    #[default]
    None,
    /// The head revision
    Head,
    /// A specific revision number
    Number(i32),
}

impl Revision {
    /// Sentinel integer for "no revision"
    pub const NONE_RAW: i32 = -1;
    /// Sentinel integer for the head revision
    pub const HEAD_RAW: i32 = -2;

    /// Integer form, using the protocol sentinels
    pub fn as_raw(self) -> i32 {
        match self {
            Revision::None => Self::NONE_RAW,
            Revision::Head => Self::HEAD_RAW,
            Revision::Number(n) => n,
        }
    }

    /// Parse `head`, `none`, `#N` or `N`. Anything else is `None` and logged.
    pub fn parse(text: &str) -> Self {
        decode_with_default("rev", Some(text), parse_revision, Revision::None)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::None => f.write_str("none"),
            Revision::Head => f.write_str("head"),
            Revision::Number(n) => write!(f, "#{n}"),
        }
    }
}

fn parse_revision(text: &str) -> Option<Revision> {
    if text.trim().is_empty() {
        return Some(Revision::None);
    }
    if text.contains("head") {
        return Some(Revision::Head);
    }
    if text.contains("none") {
        return Some(Revision::None);
    }
    let digits = match text.strip_prefix('#') {
        Some(rest) if !rest.is_empty() => rest,
        Some(_) => return None,
        None => text,
    };
    digits.trim().parse().ok().map(Revision::Number)
}

/// A changelist reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangelistId {
    /// Not reported
    #[default]
    Unknown,
    /// The client's default changelist
    Default,
    /// A numbered changelist
    Number(i32),
}

impl ChangelistId {
    /// Sentinel integer for an unknown changelist
    pub const UNKNOWN_RAW: i32 = -1;
    /// Sentinel integer for the default changelist
    pub const DEFAULT_RAW: i32 = 0;

    /// Integer form, using the protocol sentinels
    pub fn as_raw(self) -> i32 {
        match self {
            ChangelistId::Unknown => Self::UNKNOWN_RAW,
            ChangelistId::Default => Self::DEFAULT_RAW,
            ChangelistId::Number(n) => n,
        }
    }

    /// Decode an optional `change` field.
    ///
    /// Absent or blank is `Unknown`; `default` and `default change` are
    /// `Default`; `change N` and `N` are numbers. Unparseable text is `Unknown`.
    pub fn parse(text: Option<&str>) -> Self {
        match text {
            None => ChangelistId::Unknown,
            Some(text) => {
                decode_with_default("change", Some(text), parse_changelist, ChangelistId::Unknown)
            }
        }
    }
}

fn parse_changelist(text: &str) -> Option<ChangelistId> {
    let text = text.trim();
    if text.is_empty() {
        return Some(ChangelistId::Unknown);
    }
    if text.eq_ignore_ascii_case("default") || text.eq_ignore_ascii_case("default change") {
        return Some(ChangelistId::Default);
    }
    let number = match text.split_once(' ') {
        Some((_, rest)) => rest,
        None => text,
    };
    number.trim().parse().ok().map(ChangelistId::Number)
}

/// Decode `raw` with `parse`, falling back to `default`.
///
/// An absent value falls back silently; a present value that does not parse
/// is logged with the field name.
pub fn decode_with_default<T, F>(field: &str, raw: Option<&str>, parse: F, default: T) -> T
where
    F: FnOnce(&str) -> Option<T>,
{
    match raw {
        None => default,
        Some(text) => match parse(text) {
            Some(value) => value,
            None => {
                tracing::warn!(field, value = text, "unparseable field value, using default");
                default
            }
        },
    }
}

/// Decode a numeric field of `record`, leniently.
pub fn field_number<T: std::str::FromStr>(record: &WireRecord, field: &str) -> Option<T> {
    let raw = record.get_str(field)?;
    decode_with_default(field, Some(raw.as_ref()), |text| text.trim().parse().ok().map(Some), None)
}

/// Collect `f(0), f(1), ...` until the first `None`.
pub fn scan_until_gap<T, F>(mut f: F) -> Vec<T>
where
    F: FnMut(usize) -> Option<T>,
{
    let mut out = Vec::new();
    let mut index = 0;
    while let Some(item) = f(index) {
        out.push(item);
        index += 1;
    }
    out
}

/// Values of `prefix0`, `prefix1`, ... until the first missing index.
pub fn scan_indexed(record: &WireRecord, prefix: &str) -> Vec<String> {
    scan_until_gap(|index| {
        record
            .get_str(&format!("{prefix}{index}"))
            .map(|value| value.into_owned())
    })
}

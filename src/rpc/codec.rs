//! Wire record codec
//!
//! A Perforce RPC packet is a 5-byte preamble followed by a payload of
//! concatenated fields. Each field is framed as
//!
//! ```text
//! name NUL len(u32 little-endian) value NUL
//! ```
//!
//! The preamble's first byte is the XOR of the four length bytes that follow
//! it. Field names are always UTF-8; text values use the negotiated charset.

use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{CodecError, CodecResult};

/// Size of the packet preamble in bytes
pub const PREAMBLE_SIZE: usize = 5;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Field carrying the function name
pub const FUNC_KEY: &str = "func";

/// Secondary function name; servers behind some proxies repeat it
pub const FUNC2_KEY: &str = "func2";

/// Character set used for text values on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// UTF-8, used for unicode servers and as the fallback
    #[default]
    Utf8,
    /// ISO-8859-1, one byte per code point
    Latin1,
}

impl Charset {
    /// Resolve a Perforce charset name (`P4CHARSET` style).
    ///
    /// `none` and the empty string mean a non-unicode server that passes
    /// bytes through; those are treated as UTF-8.
    pub fn from_name(name: &str) -> CodecResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "auto" | "utf8" | "utf-8" | "utf8-bom" | "utf8unchecked" => {
                Ok(Charset::Utf8)
            }
            "iso8859-1" | "iso-8859-1" | "latin1" | "winansi" => Ok(Charset::Latin1),
            other => Err(CodecError::UnsupportedCharset(other.to_string())),
        }
    }

    /// Canonical name sent to the server
    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "utf8",
            Charset::Latin1 => "iso8859-1",
        }
    }

    /// Encode text into wire bytes.
    pub fn encode<'a>(self, text: &'a str) -> CodecResult<Cow<'a, [u8]>> {
        match self {
            Charset::Utf8 => Ok(Cow::Borrowed(text.as_bytes())),
            Charset::Latin1 => {
                let mut out = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    let code = u32::from(ch);
                    if code > 0xFF {
                        return Err(CodecError::Unencodable {
                            charset: self.name().to_string(),
                            detail: format!("character {ch:?} is outside ISO-8859-1"),
                        });
                    }
                    out.push(code as u8);
                }
                Ok(Cow::Owned(out))
            }
        }
    }

    /// Decode wire bytes into text. Invalid UTF-8 is replaced, never rejected.
    pub fn decode<'a>(self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes),
            Charset::Latin1 => Cow::Owned(bytes.iter().map(|b| char::from(*b)).collect()),
        }
    }
}

impl Serialize for Charset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Charset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Charset::from_name(&name).map_err(serde::de::Error::custom)
    }
}

/// A field value as carried in a [`WireRecord`].
#[derive(Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Text, encoded with the record's charset when written
    Text(String),
    /// Raw bytes, written as-is
    Bytes(Vec<u8>),
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(text) => write!(f, "{text:?}"),
            FieldValue::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl FieldValue {
    /// Raw bytes; text is returned in its UTF-8 form
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FieldValue::Text(text) => text.as_bytes(),
            FieldValue::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

/// One protocol message: an ordered list of named fields.
///
/// Unnamed fields (empty name) are positional command arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireRecord {
    fields: Vec<(String, FieldValue)>,
    charset: Charset,
}

impl WireRecord {
    /// Create an empty record using UTF-8 text
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty record whose text is interpreted with `charset`
    pub fn with_charset(charset: Charset) -> Self {
        Self {
            fields: Vec::new(),
            charset,
        }
    }

    /// Create a record for calling `func`
    pub fn for_function(func: &str) -> Self {
        let mut record = Self::new();
        record.push(FUNC_KEY, func);
        record
    }

    /// Charset used to interpret text values
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Append a field, keeping any earlier field of the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replace the first field named `name`, or append it.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(key, _)| key == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Append a positional argument
    pub fn push_arg(&mut self, value: impl Into<FieldValue>) {
        self.fields.push((String::new(), value.into()));
    }

    /// Remove and return the first field named `name`
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let index = self.fields.iter().position(|(key, _)| key == name)?;
        Some(self.fields.remove(index).1)
    }

    /// Raw value of the first field named `name`
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Whether a field named `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Text of the first field named `name`, decoding bytes with the record's charset.
    pub fn get_str(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(|value| match value {
            FieldValue::Text(text) => Cow::Borrowed(text.as_str()),
            FieldValue::Bytes(bytes) => self.charset.decode(bytes),
        })
    }

    /// Bytes of the first field named `name`.
    ///
    /// Text values are returned in their UTF-8 form.
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name).map(FieldValue::as_bytes)
    }

    /// Function name carried by the record
    pub fn func(&self) -> Option<Cow<'_, str>> {
        self.get_str(FUNC_KEY)
    }

    /// Positional arguments in order
    pub fn args(&self) -> impl Iterator<Item = &FieldValue> {
        self.fields
            .iter()
            .filter(|(key, _)| key.is_empty())
            .map(|(_, value)| value)
    }

    /// Iterate over all fields in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Iterate over field names in wire order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Append one field's framing to `out`.
fn put_field(out: &mut Vec<u8>, name: &str, value: &[u8]) -> CodecResult<()> {
    let len = u32::try_from(value.len()).map_err(|_| CodecError::FrameTooLarge(value.len()))?;
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value);
    out.push(0);
    Ok(())
}

/// Encode a record's fields into a payload (no preamble).
///
/// The function name is always written last and always as UTF-8, matching
/// the field order servers expect.
pub fn encode_fields(record: &WireRecord, charset: Charset) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    let mut func = None;
    for (name, value) in record.iter() {
        if name == FUNC_KEY {
            func = Some(value);
            continue;
        }
        match value {
            FieldValue::Text(text) => {
                let bytes = if name == FUNC2_KEY {
                    Cow::Borrowed(text.as_bytes())
                } else {
                    charset.encode(text)?
                };
                put_field(&mut out, name, &bytes)?;
            }
            FieldValue::Bytes(bytes) => put_field(&mut out, name, bytes)?,
        }
    }
    match func {
        Some(FieldValue::Text(text)) => put_field(&mut out, FUNC_KEY, text.as_bytes())?,
        Some(FieldValue::Bytes(bytes)) => put_field(&mut out, FUNC_KEY, bytes)?,
        None => return Err(CodecError::MissingFunction),
    }
    Ok(out)
}

/// Build the 5-byte preamble for a payload of `len` bytes.
pub fn preamble(len: usize) -> CodecResult<[u8; PREAMBLE_SIZE]> {
    let len = u32::try_from(len).map_err(|_| CodecError::FrameTooLarge(len))?;
    let [b1, b2, b3, b4] = len.to_le_bytes();
    Ok([b1 ^ b2 ^ b3 ^ b4, b1, b2, b3, b4])
}

/// Validate a preamble and return the payload length it announces.
pub fn parse_preamble(bytes: &[u8; PREAMBLE_SIZE]) -> CodecResult<usize> {
    let expected = bytes[1] ^ bytes[2] ^ bytes[3] ^ bytes[4];
    if expected != bytes[0] {
        return Err(CodecError::BadChecksum {
            expected,
            actual: bytes[0],
        });
    }
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Encode a complete packet (preamble plus payload).
pub fn encode_packet(record: &WireRecord, charset: Charset) -> CodecResult<Vec<u8>> {
    let payload = encode_fields(record, charset)?;
    let mut packet = Vec::with_capacity(PREAMBLE_SIZE + payload.len());
    packet.extend_from_slice(&preamble(payload.len())?);
    packet.extend_from_slice(&payload);
    Ok(packet)
}

/// Decode a payload into a record.
///
/// Repeated names get a numeric suffix (`change`, `change0`, `change1`, ...)
/// so no value is lost; only the first `func2` is kept. Values stay as raw
/// bytes and are decoded on access with `charset`.
pub fn decode_fields(payload: &[u8], charset: Charset) -> CodecResult<WireRecord> {
    let mut record = WireRecord::with_charset(charset);
    let mut pos = 0;
    while pos < payload.len() {
        let name_end = payload[pos..]
            .iter()
            .position(|b| *b == 0)
            .map(|offset| pos + offset)
            .ok_or_else(|| CodecError::MalformedField {
                offset: pos,
                detail: "unterminated field name".into(),
            })?;
        let name = String::from_utf8_lossy(&payload[pos..name_end]).into_owned();
        let len_start = name_end + 1;
        let len_bytes: [u8; 4] = payload
            .get(len_start..len_start + 4)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| CodecError::MalformedField {
                offset: len_start,
                detail: format!("truncated length for field '{name}'"),
            })?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let value_start = len_start + 4;
        let value_end = value_start
            .checked_add(len)
            .filter(|end| *end < payload.len())
            .ok_or_else(|| CodecError::MalformedField {
                offset: value_start,
                detail: format!("value for field '{name}' overruns packet"),
            })?;
        if payload[value_end] != 0 {
            return Err(CodecError::MalformedField {
                offset: value_end,
                detail: format!("value for field '{name}' is not NUL terminated"),
            });
        }
        let value = FieldValue::Bytes(payload[value_start..value_end].to_vec());
        pos = value_end + 1;

        if name.is_empty() {
            record.push_arg(value);
        } else if name == FUNC2_KEY {
            if !record.contains(&name) {
                record.push(name, value);
            }
        } else if record.contains(&name) {
            let mut suffix = 0usize;
            while record.contains(&format!("{name}{suffix}")) {
                suffix += 1;
            }
            record.push(format!("{name}{suffix}"), value);
        } else {
            record.push(name, value);
        }
    }
    Ok(record)
}

/// Write one packet to `writer` and flush it. Returns the bytes written.
pub fn write_packet<W: Write>(
    writer: &mut W,
    record: &WireRecord,
    charset: Charset,
) -> CodecResult<usize> {
    let packet = encode_packet(record, charset)?;
    writer.write_all(&packet)?;
    writer.flush()?;
    Ok(packet.len())
}

/// Read one packet from `reader`. Returns the record and the bytes consumed.
pub fn read_packet<R: Read>(reader: &mut R, charset: Charset) -> CodecResult<(WireRecord, usize)> {
    let mut head = [0u8; PREAMBLE_SIZE];
    reader.read_exact(&mut head)?;
    let len = parse_preamble(&head)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let record = decode_fields(&payload, charset)?;
    Ok((record, PREAMBLE_SIZE + len))
}

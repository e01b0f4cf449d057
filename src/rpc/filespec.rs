//! Typed file records decoded from command results
//!
//! Decoding never fails. Malformed fields are logged and defaulted so one bad
//! value does not invalidate a large file listing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use super::codec::WireRecord;
use super::decode::{ChangelistId, Revision, decode_with_default, field_number, scan_indexed, scan_until_gap};
use super::dispatch::CommandRecord;
use super::message::ServerMessage;

/// What was done to a file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileAction {
    /// `add`
    Add,
    /// `edit`
    Edit,
    /// `delete`
    Delete,
    /// `branch`
    Branch,
    /// `move/add`
    MoveAdd,
    /// `move/delete`
    MoveDelete,
    /// `integrate`
    Integrate,
    /// `import`
    Import,
    /// `purge`
    Purge,
    /// `archive`
    Archive,
    /// Anything else, kept verbatim
    Other(String),
}

impl FileAction {
    /// Parse a server action name
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "add" => FileAction::Add,
            "edit" => FileAction::Edit,
            "delete" => FileAction::Delete,
            "branch" => FileAction::Branch,
            "move/add" => FileAction::MoveAdd,
            "move/delete" => FileAction::MoveDelete,
            "integrate" => FileAction::Integrate,
            "import" => FileAction::Import,
            "purge" => FileAction::Purge,
            "archive" => FileAction::Archive,
            _ => FileAction::Other(text.to_string()),
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileAction::Add => "add",
            FileAction::Edit => "edit",
            FileAction::Delete => "delete",
            FileAction::Branch => "branch",
            FileAction::MoveAdd => "move/add",
            FileAction::MoveDelete => "move/delete",
            FileAction::Integrate => "integrate",
            FileAction::Import => "import",
            FileAction::Purge => "purge",
            FileAction::Archive => "archive",
            FileAction::Other(other) => other,
        };
        f.write_str(name)
    }
}

/// Core fields common to every file result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFields {
    /// Depot path (`depotFile` or `dir`)
    pub depot_path: Option<String>,
    /// Client path (`clientFile`)
    pub client_path: Option<String>,
    /// Local path (`path`, else `localFile`)
    pub local_path: Option<String>,
    /// File type
    pub file_type: Option<String>,
    /// Action
    pub action: Option<FileAction>,
    /// User
    pub user_name: Option<String>,
    /// Client workspace
    pub client_name: Option<String>,
    /// Changelist
    pub changelist: ChangelistId,
    /// End revision (`rev`, falling back to `haveRev`)
    pub end_revision: Revision,
    /// Start of the source revision range
    pub start_from_rev: Revision,
    /// End of the source revision range
    pub end_from_rev: Revision,
    /// Start of the target revision range
    pub start_to_rev: Revision,
    /// End of the target revision range
    pub end_to_rev: Revision,
    /// Working revision
    pub work_rev: Revision,
    /// Base revision for resolves
    pub base_rev: Revision,
    /// Source file of an integration
    pub from_file: Option<String>,
    /// Target file of an integration
    pub to_file: Option<String>,
    /// Base file for resolves
    pub base_file: Option<String>,
    /// How a resolve was done
    pub how_resolved: Option<String>,
    /// Other user's action on the file
    pub other_action: Option<FileAction>,
    /// Locked by this or another client
    pub locked: bool,
    /// Modification date (`time`)
    pub date: Option<DateTime<Utc>>,
    /// Shelved changelist
    pub shelved_change: Option<i32>,
    /// Pending resolve types (`resolveType0`, ...)
    pub resolve_types: Vec<String>,
    /// Unmapped in the client view
    pub unmap: bool,
}

/// Opaque attribute values by name, as raw bytes
pub type Attributes = BTreeMap<String, Vec<u8>>;

/// One pending or completed resolve (`resolveAction{i}` and friends)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveRecord {
    /// Resolve action, such as `copy from` or `merge from`
    pub action: String,
    /// Base file
    pub base_file: Option<String>,
    /// Base revision
    pub base_rev: Revision,
    /// Source file
    pub from_file: Option<String>,
    /// Start of the source range
    pub start_from_rev: Revision,
    /// End of the source range
    pub end_from_rev: Revision,
}

/// Extended `fstat` metadata, composed into [`FileSpec::Valid`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedAttributes {
    /// File is mapped into the client
    pub mapped: bool,
    /// Head action
    pub head_action: Option<FileAction>,
    /// Head changelist
    pub head_change: ChangelistId,
    /// Head revision number, 0 when absent
    pub head_rev: i32,
    /// Head file type
    pub head_type: Option<String>,
    /// Head submit time
    pub head_time: Option<DateTime<Utc>>,
    /// Head modification time
    pub head_mod_time: Option<DateTime<Utc>>,
    /// Head charset
    pub head_charset: Option<String>,
    /// Revision in the client
    pub have_rev: Revision,
    /// Head changelist description
    pub desc: Option<String>,
    /// Content digest
    pub digest: Option<String>,
    /// File size in bytes, 0 when absent
    pub file_size: u64,
    /// Open action in this client
    pub open_action: Option<FileAction>,
    /// Open file type
    pub open_type: Option<String>,
    /// Owner of the open action
    pub open_action_owner: Option<String>,
    /// Changelist the file is open in, 0 when absent
    pub open_changelist: i32,
    /// Resolved
    pub resolved: bool,
    /// Unresolved
    pub unresolved: bool,
    /// Can be re-resolved
    pub reresolvable: bool,
    /// Locked by another client
    pub other_locked: bool,
    /// Other clients' open actions
    pub other_actions: Vec<String>,
    /// Other clients' changelists
    pub other_changelists: Vec<String>,
    /// Other clients that have the file open
    pub other_opens: Vec<String>,
    /// Owner of the action
    pub action_owner: Option<String>,
    /// Charset
    pub charset: Option<String>,
    /// File is shelved
    pub shelved: bool,
    /// Moved-from or moved-to file
    pub moved_file: Option<String>,
    /// Verify status
    pub verify_status: Option<String>,
    /// Resolve records
    pub resolve_records: Vec<ResolveRecord>,
    /// `attr-` and `openattr-` values
    pub attributes: Attributes,
    /// `attrProp-` and `openattrProp-` values
    pub propagating_attributes: Attributes,
    /// `attrType-` and `openattrType-` values
    pub attribute_types: Attributes,
}

/// A file result: a decoded file, or a message the server sent in its place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSpec {
    /// A file record
    Valid {
        /// Core fields
        fields: FileFields,
        /// Extended metadata, for `fstat`-style results
        extended: Option<Box<ExtendedAttributes>>,
    },
    /// Informational message, for example "file(s) up-to-date"
    Info(ServerMessage),
    /// Error message with its codes
    Error(ServerMessage),
}

fn text(record: &WireRecord, field: &str) -> Option<String> {
    record.get_str(field).map(|value| value.into_owned())
}

fn revision(record: &WireRecord, field: &str) -> Revision {
    record
        .get_str(field)
        .map(|value| Revision::parse(&value))
        .unwrap_or_default()
}

fn epoch_seconds(record: &WireRecord, field: &str) -> Option<DateTime<Utc>> {
    let raw = record.get_str(field)?;
    decode_with_default(
        field,
        Some(raw.as_ref()),
        |value| {
            value
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(Some)
        },
        None,
    )
}

impl FileFields {
    /// Decode core fields; `index` selects `depotFile0`-style keys.
    pub fn from_record(record: &WireRecord, index: Option<usize>) -> Self {
        let suffix = index.map(|i| i.to_string()).unwrap_or_default();
        let key = |name: &str| format!("{name}{suffix}");

        let depot_path = text(record, &key("depotFile")).or_else(|| text(record, &key("dir")));
        let local_path = text(record, &key("path")).or_else(|| text(record, &key("localFile")));
        let end_revision = record
            .get_str(&key("rev"))
            .or_else(|| record.get_str(&key("haveRev")))
            .map(|value| Revision::parse(&value))
            .unwrap_or_default();

        Self {
            depot_path,
            client_path: text(record, &key("clientFile")),
            local_path,
            file_type: text(record, &key("type")),
            action: text(record, &key("action")).map(|a| FileAction::parse(&a)),
            user_name: text(record, &key("user")),
            client_name: text(record, &key("client")),
            changelist: ChangelistId::parse(record.get_str(&key("change")).as_deref()),
            end_revision,
            start_from_rev: revision(record, &key("startFromRev")),
            end_from_rev: revision(record, &key("endFromRev")),
            start_to_rev: revision(record, &key("startToRev")),
            end_to_rev: revision(record, &key("endToRev")),
            work_rev: revision(record, &key("workRev")),
            base_rev: revision(record, &key("baseRev")),
            from_file: text(record, &key("fromFile")),
            to_file: text(record, &key("toFile")),
            base_file: text(record, &key("baseFile")),
            how_resolved: text(record, "how"),
            other_action: text(record, &key("otherAction")).map(|a| FileAction::parse(&a)),
            locked: record.contains("ourLock") || record.contains("otherLock"),
            date: epoch_seconds(record, "time"),
            shelved_change: field_number(record, "shelvedChange"),
            resolve_types: scan_indexed(record, "resolveType"),
            unmap: record.contains(&key("unmap")),
        }
    }
}

impl ResolveRecord {
    /// Resolve record `index` of `record`, if present
    pub fn from_record(record: &WireRecord, index: usize) -> Option<Self> {
        let action = text(record, &format!("resolveAction{index}"))?;
        Some(Self {
            action,
            base_file: text(record, &format!("resolveBaseFile{index}")),
            base_rev: revision(record, &format!("resolveBaseRev{index}")),
            from_file: text(record, &format!("resolveFromFile{index}")),
            start_from_rev: revision(record, &format!("resolveStartFromRev{index}")),
            end_from_rev: revision(record, &format!("resolveEndFromRev{index}")),
        })
    }
}

impl ExtendedAttributes {
    /// Decode extended `fstat` fields
    pub fn from_record(record: &WireRecord) -> Self {
        let mut attributes = Attributes::new();
        let mut propagating_attributes = Attributes::new();
        let mut attribute_types = Attributes::new();
        for (name, value) in record.iter() {
            let (target, attr) = if let Some(attr) =
                name.strip_prefix("attr-").or_else(|| name.strip_prefix("openattr-"))
            {
                (&mut attributes, attr)
            } else if let Some(attr) = name
                .strip_prefix("attrProp-")
                .or_else(|| name.strip_prefix("openattrProp-"))
            {
                (&mut propagating_attributes, attr)
            } else if let Some(attr) = name
                .strip_prefix("attrType-")
                .or_else(|| name.strip_prefix("openattrType-"))
            {
                (&mut attribute_types, attr)
            } else {
                continue;
            };
            if attr.is_empty() {
                tracing::warn!(field = name, "attribute field without a name");
                continue;
            }
            target.insert(attr.to_string(), value.as_bytes().to_vec());
        }

        Self {
            mapped: record.contains("isMapped"),
            head_action: text(record, "headAction").map(|a| FileAction::parse(&a)),
            head_change: ChangelistId::parse(record.get_str("headChange").as_deref()),
            head_rev: field_number(record, "headRev").unwrap_or(0),
            head_type: text(record, "headType"),
            head_time: epoch_seconds(record, "headTime"),
            head_mod_time: epoch_seconds(record, "headModTime"),
            head_charset: text(record, "headCharset"),
            have_rev: revision(record, "haveRev"),
            desc: text(record, "desc"),
            digest: text(record, "digest"),
            file_size: field_number(record, "fileSize").unwrap_or(0),
            open_action: text(record, "action").map(|a| FileAction::parse(&a)),
            open_type: text(record, "type"),
            open_action_owner: text(record, "actionOwner"),
            open_changelist: field_number(record, "change").unwrap_or(0),
            resolved: record.contains("resolved"),
            unresolved: record.contains("unresolved"),
            reresolvable: record.contains("reresolvable"),
            other_locked: record.contains("otherLock"),
            other_actions: scan_indexed(record, "otherAction"),
            other_changelists: scan_indexed(record, "otherChange"),
            other_opens: scan_indexed(record, "otherOpen"),
            action_owner: text(record, "actionOwner"),
            charset: text(record, "charset"),
            shelved: record.contains("shelved"),
            moved_file: text(record, "movedFile"),
            verify_status: text(record, "status"),
            resolve_records: scan_until_gap(|i| ResolveRecord::from_record(record, i)),
            attributes,
            propagating_attributes,
            attribute_types,
        }
    }
}

impl FileSpec {
    /// Decode a plain file record
    pub fn from_record(record: &WireRecord, index: Option<usize>) -> Self {
        FileSpec::Valid {
            fields: FileFields::from_record(record, index),
            extended: None,
        }
    }

    /// Decode an `fstat`-style record with extended metadata
    pub fn extended_from_record(record: &WireRecord) -> Self {
        FileSpec::Valid {
            fields: FileFields::from_record(record, None),
            extended: Some(Box::new(ExtendedAttributes::from_record(record))),
        }
    }

    /// Wrap a server message; failures become [`FileSpec::Error`].
    pub fn from_message(message: ServerMessage) -> Self {
        if message.severity().is_error() {
            FileSpec::Error(message)
        } else {
            FileSpec::Info(message)
        }
    }

    /// Decode a dispatcher result; raw text and data yield `None`.
    pub fn from_command_record(record: &CommandRecord, extended: bool) -> Option<Self> {
        match record {
            CommandRecord::Tagged(fields) if extended => Some(Self::extended_from_record(fields)),
            CommandRecord::Tagged(fields) => Some(Self::from_record(fields, None)),
            CommandRecord::Info(message) | CommandRecord::Error(message) => {
                Some(Self::from_message(message.clone()))
            }
            CommandRecord::Text(_) | CommandRecord::Data(_) => None,
        }
    }

    /// Core fields of a valid record
    pub fn fields(&self) -> Option<&FileFields> {
        match self {
            FileSpec::Valid { fields, .. } => Some(fields),
            _ => None,
        }
    }

    /// Extended metadata of a valid record
    pub fn extended(&self) -> Option<&ExtendedAttributes> {
        match self {
            FileSpec::Valid { extended, .. } => extended.as_deref(),
            _ => None,
        }
    }

    /// Whether this is a file record
    pub fn is_valid(&self) -> bool {
        matches!(self, FileSpec::Valid { .. })
    }
}

//! This module declares the command records exchanged between the parent and its workers, and the
//! text codec used to put them on the control channel.
//!
//! A record is a list of `key=value` fields joined by [`FIELD_DELIMITER`]. Values are sanitized so
//! that they never contain a bare delimiter, separator, marker or line break, which lets the
//! channel frame records by newline. The effect chain is written as a concatenation of entries,
//! each wrapped in a pair of [`CHAIN_MARKER`]s.
//!
//! Only fields holding a non-zero value are emitted. Unknown keys are skipped on decode.

use std::fmt;

pub use crate::error::ProtocolParseError;

pub const FIELD_DELIMITER: char = ';';
pub const KEY_VALUE_SEPARATOR: char = '=';
pub const ESCAPE: char = '\\';
pub const CHAIN_MARKER: char = '@';

/// Short wire keys of the record fields.
pub mod keys {
    pub const COMMAND: &str = "cmd";
    pub const FILE_PATH: &str = "fp";
    pub const DEBUG: &str = "dbg";
    pub const ID: &str = "id";
    pub const GUILD_ID: &str = "gid";
    pub const READY: &str = "rdy";
    pub const SEEK: &str = "sk";
    pub const VOLUME: &str = "vl";
    /// Effect chain. Every entry is an audio filter spec for the media engine.
    pub const HELPER_CHAIN: &str = "ehl";
    pub const FORCE: &str = "frc";
}

/// The action requested by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Start the media pipeline for the record's file. Sent once, as the first record a worker
    /// receives.
    CreateProcessor,
    /// Stop. Sent by the parent to stop a worker, and by a worker to announce it is done.
    Shutdown,
}

impl CommandKind {
    pub fn as_wire(self) -> &'static str {
        match self {
            CommandKind::CreateProcessor => "cap",
            CommandKind::Shutdown => "shut",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "cap" => Some(CommandKind::CreateProcessor),
            "shut" => Some(CommandKind::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// The unit exchanged over the control channel.
///
/// A record without a command is an update: it carries readiness from a worker, or live
/// seek/volume/effect changes from the parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRecord {
    pub command: Option<CommandKind>,
    pub file_path: String,
    pub debug: bool,
    /// Worker identifier.
    pub id: String,
    /// Session the worker plays for.
    pub guild_id: String,
    /// Readiness status. `Some(0)` is success, any other value is an opaque failure code.
    pub ready: Option<i32>,
    /// Seek target, `[[h:]m:]s[.fraction]`.
    pub seek: Option<String>,
    /// Gain in percent.
    pub volume: Option<u32>,
    pub helper_chain: Vec<String>,
    /// Skip the receiver's usual guards.
    pub force: bool,
}

impl CommandRecord {
    pub fn create_processor(id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            command: Some(CommandKind::CreateProcessor),
            id: id.into(),
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn shutdown(id: impl Into<String>) -> Self {
        Self {
            command: Some(CommandKind::Shutdown),
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn update(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn ready(id: impl Into<String>, status: i32) -> Self {
        Self {
            id: id.into(),
            ready: Some(status),
            ..Default::default()
        }
    }

    /// Serializes the record. The result never contains a line break.
    pub fn encode(&self) -> String {
        encode(self)
    }

    pub fn decode(wire: &str) -> Result<Self, ProtocolParseError> {
        decode(wire)
    }
}

/// Escapes every reserved character in `value`.
pub fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ESCAPE | FIELD_DELIMITER | KEY_VALUE_SEPARATOR | CHAIN_MARKER => {
                out.push(ESCAPE);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`sanitize`].
pub fn unsanitize(raw: &str) -> Result<String, ProtocolParseError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            out.push(unescape_char(chars.next())?);
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn unescape_char(c: Option<char>) -> Result<char, ProtocolParseError> {
    match c {
        None => Err(ProtocolParseError::UnterminatedEscape),
        Some('n') => Ok('\n'),
        Some('r') => Ok('\r'),
        Some(c @ (ESCAPE | FIELD_DELIMITER | KEY_VALUE_SEPARATOR | CHAIN_MARKER)) => Ok(c),
        Some(other) => Err(ProtocolParseError::InvalidEscape(other)),
    }
}

pub fn encode(record: &CommandRecord) -> String {
    let mut out = String::new();
    let mut field = |key: &str, value: &str| {
        if !out.is_empty() {
            out.push(FIELD_DELIMITER);
        }
        out.push_str(key);
        out.push(KEY_VALUE_SEPARATOR);
        out.push_str(value);
    };

    if let Some(command) = record.command {
        field(keys::COMMAND, command.as_wire());
    }
    if !record.file_path.is_empty() {
        field(keys::FILE_PATH, &sanitize(&record.file_path));
    }
    if record.debug {
        field(keys::DEBUG, "1");
    }
    if !record.id.is_empty() {
        field(keys::ID, &sanitize(&record.id));
    }
    if !record.guild_id.is_empty() {
        field(keys::GUILD_ID, &sanitize(&record.guild_id));
    }
    if let Some(ready) = record.ready {
        field(keys::READY, &ready.to_string());
    }
    if let Some(ref seek) = record.seek {
        field(keys::SEEK, &sanitize(seek));
    }
    if let Some(volume) = record.volume {
        field(keys::VOLUME, &volume.to_string());
    }
    if !record.helper_chain.is_empty() {
        let mut chain = String::new();
        for entry in &record.helper_chain {
            chain.push(CHAIN_MARKER);
            chain.push_str(&sanitize(entry));
            chain.push(CHAIN_MARKER);
        }
        field(keys::HELPER_CHAIN, &chain);
    }
    if record.force {
        field(keys::FORCE, "1");
    }
    out
}

/// Parses a record. Fails without yielding any partial state.
pub fn decode(wire: &str) -> Result<CommandRecord, ProtocolParseError> {
    let mut record = CommandRecord::default();
    for field in split_fields(wire)? {
        if field.is_empty() {
            continue;
        }
        let Some((key, raw)) = field.split_once(KEY_VALUE_SEPARATOR) else {
            return Err(ProtocolParseError::MissingSeparator(field.to_string()));
        };
        match key {
            keys::COMMAND => {
                let value = unsanitize(raw)?;
                match CommandKind::from_wire(&value) {
                    Some(kind) => record.command = Some(kind),
                    None => return Err(ProtocolParseError::UnknownCommand(value)),
                }
            }
            keys::FILE_PATH => record.file_path = unsanitize(raw)?,
            keys::DEBUG => record.debug = parse_bool(keys::DEBUG, raw)?,
            keys::ID => record.id = unsanitize(raw)?,
            keys::GUILD_ID => record.guild_id = unsanitize(raw)?,
            keys::READY => record.ready = Some(parse_number(keys::READY, raw)?),
            keys::SEEK => record.seek = Some(unsanitize(raw)?),
            keys::VOLUME => record.volume = Some(parse_number(keys::VOLUME, raw)?),
            keys::HELPER_CHAIN => record.helper_chain = decode_chain(raw)?,
            keys::FORCE => record.force = parse_bool(keys::FORCE, raw)?,
            _ => {}
        }
    }
    Ok(record)
}

/// Splits on every delimiter that is not escaped. Escapes are left in place.
fn split_fields(wire: &str) -> Result<Vec<&str>, ProtocolParseError> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in wire.char_indices() {
        if escaped {
            escaped = false;
        } else if c == ESCAPE {
            escaped = true;
        } else if c == FIELD_DELIMITER {
            fields.push(&wire[start..i]);
            start = i + 1;
        }
    }
    if escaped {
        return Err(ProtocolParseError::UnterminatedEscape);
    }
    fields.push(&wire[start..]);
    Ok(fields)
}

fn decode_chain(raw: &str) -> Result<Vec<String>, ProtocolParseError> {
    let mut chain = Vec::new();
    let mut chars = raw.chars();
    while let Some(open) = chars.next() {
        if open != CHAIN_MARKER {
            return Err(ProtocolParseError::MalformedChain("text outside of a marker pair"));
        }
        let mut entry = String::new();
        loop {
            match chars.next() {
                None => return Err(ProtocolParseError::MalformedChain("unterminated entry")),
                Some(CHAIN_MARKER) => break,
                Some(ESCAPE) => entry.push(unescape_char(chars.next())?),
                Some(c) => entry.push(c),
            }
        }
        chain.push(entry);
    }
    Ok(chain)
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ProtocolParseError> {
    match raw {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ProtocolParseError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    raw: &str,
) -> Result<T, ProtocolParseError> {
    raw.parse().map_err(|_| ProtocolParseError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

//! File metadata records and their single-line text form.
//!
//! A [`FileInfo`] is an immutable value built either from a remote stat
//! response or from its external text form:
//!
//! ```text
//! <escaped-name> <rwxrwxrwx> <type-char> <gid> <uid> <mtime-epoch-ms> <size> [<escaped-link-target>]
//! ```
//!
//! Names and link targets are percent-encoded so that whitespace, `%` and
//! non-ASCII characters survive the whitespace-separated layout.

use std::fmt;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::profile::HostProfile;

/// Bytes escaped in names and link targets (non-ASCII is always escaped).
const FIELD_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'\t');

/// File-type bits of a Unix mode word.
pub const S_IFMT: u32 = 0o170000;

/// Kind of file, derived from the `S_IFMT` bits of a mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Fifo,
    CharDevice,
    MultiplexedChar,
    Directory,
    NamedSpecial,
    BlockDevice,
    MultiplexedBlock,
    Regular,
    Symlink,
    Socket,
    Door,
    EventPort,
    Unknown,
}

impl FileType {
    pub const ALL: [FileType; 13] = [
        FileType::Fifo,
        FileType::CharDevice,
        FileType::MultiplexedChar,
        FileType::Directory,
        FileType::NamedSpecial,
        FileType::BlockDevice,
        FileType::MultiplexedBlock,
        FileType::Regular,
        FileType::Symlink,
        FileType::Socket,
        FileType::Door,
        FileType::EventPort,
        FileType::Unknown,
    ];

    /// Classify a full mode word.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            0o010000 => Self::Fifo,
            0o020000 => Self::CharDevice,
            0o030000 => Self::MultiplexedChar,
            0o040000 => Self::Directory,
            0o050000 => Self::NamedSpecial,
            0o060000 => Self::BlockDevice,
            0o070000 => Self::MultiplexedBlock,
            0o100000 => Self::Regular,
            0o120000 => Self::Symlink,
            0o140000 => Self::Socket,
            0o150000 => Self::Door,
            0o160000 => Self::EventPort,
            _ => Self::Unknown,
        }
    }

    /// The `S_IFMT` bits for this type; zero for [`FileType::Unknown`].
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Fifo => 0o010000,
            Self::CharDevice => 0o020000,
            Self::MultiplexedChar => 0o030000,
            Self::Directory => 0o040000,
            Self::NamedSpecial => 0o050000,
            Self::BlockDevice => 0o060000,
            Self::MultiplexedBlock => 0o070000,
            Self::Regular => 0o100000,
            Self::Symlink => 0o120000,
            Self::Socket => 0o140000,
            Self::Door => 0o150000,
            Self::EventPort => 0o160000,
            Self::Unknown => 0,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Fifo => 'p',
            Self::CharDevice => 'c',
            Self::MultiplexedChar => 'm',
            Self::Directory => 'd',
            Self::NamedSpecial => 'n',
            Self::BlockDevice => 'b',
            Self::MultiplexedBlock => 'M',
            Self::Regular => '-',
            Self::Symlink => 'l',
            Self::Socket => 's',
            Self::Door => 'D',
            Self::EventPort => 'P',
            Self::Unknown => 'u',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_char() == c)
    }
}

/// Failure to parse the external text form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataParseError {
    #[error("expected 7 or 8 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid access string '{0}'")]
    Access(String),
    #[error("unknown file type '{0}'")]
    FileType(String),
    #[error("invalid number in field {field}: '{value}'")]
    Number { field: &'static str, value: String },
    #[error("invalid escape sequence in '{0}'")]
    Escape(String),
}

/// Immutable metadata of one remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    name: String,
    gid: u32,
    uid: u32,
    size: u64,
    /// Permission bits only (`0o777`).
    mode: u32,
    mtime_ms: i64,
    link_target: Option<String>,
    file_type: FileType,
}

impl FileInfo {
    /// An empty link target is stored as no target; no symlink can point at "".
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        file_type: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
        mtime_ms: i64,
        link_target: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            gid,
            uid,
            size,
            mode: mode & 0o777,
            mtime_ms,
            link_target: link_target.filter(|target| !target.is_empty()),
            file_type,
        }
    }

    /// Build from a raw stat mode word that carries both type and permission bits.
    pub fn from_raw_mode(
        name: impl Into<String>,
        raw_mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
        mtime_ms: i64,
        link_target: Option<String>,
    ) -> Self {
        Self::new(
            name,
            FileType::from_mode(raw_mode),
            raw_mode,
            uid,
            gid,
            size,
            mtime_ms,
            link_target,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn mtime_ms(&self) -> i64 {
        self.mtime_ms
    }

    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_link(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    pub fn is_plain_file(&self) -> bool {
        self.file_type == FileType::Regular
    }

    /// Same record under another name (listing entries carry only the segment).
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The 9-character `rwxrwxrwx` access string.
    pub fn access_string(&self) -> String {
        access_string(self.mode)
    }

    pub fn can_read(&self, profile: &HostProfile) -> bool {
        profile.uid == 0 || self.class_bits(profile) & 0o4 != 0
    }

    pub fn can_write(&self, profile: &HostProfile) -> bool {
        profile.uid == 0 || self.class_bits(profile) & 0o2 != 0
    }

    /// Root may execute only if some execute bit is set.
    pub fn can_execute(&self, profile: &HostProfile) -> bool {
        if profile.uid == 0 {
            return self.mode & 0o111 != 0;
        }
        self.class_bits(profile) & 0o1 != 0
    }

    fn class_bits(&self, profile: &HostProfile) -> u32 {
        if self.uid == profile.uid {
            (self.mode >> 6) & 0o7
        } else if profile.gids.contains(&self.gid) {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        }
    }

    /// Serialize to the single-line external form.
    pub fn to_external_form(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {} {}",
            escape(&self.name),
            self.access_string(),
            self.file_type.as_char(),
            self.gid,
            self.uid,
            self.mtime_ms,
            self.size
        );
        if let Some(target) = &self.link_target {
            line.push(' ');
            line.push_str(&escape(target));
        }
        line
    }

    /// Parse the single-line external form.
    pub fn from_external_form(line: &str) -> Result<Self, MetadataParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 7 && fields.len() != 8 {
            return Err(MetadataParseError::FieldCount(fields.len()));
        }
        let name = unescape(fields[0])?;
        let mode = parse_access(fields[1])?;
        let mut type_chars = fields[2].chars();
        let file_type = match (type_chars.next(), type_chars.next()) {
            (Some(c), None) => FileType::from_char(c)
                .ok_or_else(|| MetadataParseError::FileType(fields[2].to_string()))?,
            _ => return Err(MetadataParseError::FileType(fields[2].to_string())),
        };
        let gid = parse_number(fields[3], "gid")?;
        let uid = parse_number(fields[4], "uid")?;
        let mtime_ms = parse_number(fields[5], "mtime")?;
        let size = parse_number(fields[6], "size")?;
        let link_target = fields.get(7).map(|f| unescape(f)).transpose()?;
        Ok(Self::new(
            name,
            file_type,
            mode,
            uid,
            gid,
            size,
            mtime_ms,
            link_target,
        ))
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

/// Render permission bits as `rwxrwxrwx`.
pub fn access_string(mode: u32) -> String {
    const LETTERS: [char; 3] = ['r', 'w', 'x'];
    (0..9)
        .map(|i| {
            let bit = 0o400 >> i;
            if mode & bit != 0 { LETTERS[i % 3] } else { '-' }
        })
        .collect()
}

fn parse_access(text: &str) -> Result<u32, MetadataParseError> {
    const LETTERS: [char; 3] = ['r', 'w', 'x'];
    let chars: Vec<char> = text.chars().collect();
    if chars.len() != 9 {
        return Err(MetadataParseError::Access(text.to_string()));
    }
    let mut mode = 0;
    for (i, c) in chars.into_iter().enumerate() {
        if c == LETTERS[i % 3] {
            mode |= 0o400 >> i;
        } else if c != '-' {
            return Err(MetadataParseError::Access(text.to_string()));
        }
    }
    Ok(mode)
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    field: &'static str,
) -> Result<T, MetadataParseError> {
    value.parse().map_err(|_| MetadataParseError::Number {
        field,
        value: value.to_string(),
    })
}

fn escape(text: &str) -> String {
    utf8_percent_encode(text, FIELD_ESCAPE).to_string()
}

fn unescape(text: &str) -> Result<String, MetadataParseError> {
    percent_decode_str(text)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| MetadataParseError::Escape(text.to_string()))
}

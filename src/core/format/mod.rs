// src/core/format/mod.rs

//! The three-file on-disk backup format.
//!
//! Every file is a stream of 32-bit words; all multi-byte integers are
//! big-endian on disk. Sections carry a `{type, length}` prefix with the
//! length in words. The control file describes the backed-up tables and the
//! GCP cut points; the data file carries scanned rows per fragment; the log
//! file carries the change records captured by triggers between the cut
//! points.

pub mod parser;
pub mod sections;

use crate::core::errors::BackupError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use parser::{CtlFileContents, DataFileContents, FragmentData, LogFileContents};
pub use sections::{
    FileHeader, FragmentFooter, FragmentHeader, FragmentInfo, GcpEntry, LogEntry, TableDescription,
    TableList,
};

/// First eight bytes of every backup file.
pub const MAGIC: &[u8; 8] = b"NDBBACKU";

/// Per-release format version stamped into every file header.
pub const BACKUP_VERSION: u32 = 0x0009_0004;

/// Cluster software version stamped into the header.
pub const CLUSTER_VERSION: u32 = 0x0009_0400;

/// Host server version stamped into the header.
pub const SERVER_VERSION: u32 = 0x0009_0400;

/// Byte-order marker written literally; a reader seeing it byte-swapped
/// knows the file was produced on a foreign-endian host.
pub const BYTE_ORDER_MARKER: u32 = 0x1234_5678;

/// Set on a log entry's trigger-event word when a gci word trails the entry.
pub const LOG_ENTRY_GCI_FLAG: u32 = 0x10000;

/// Section type tags.
pub mod section_type {
    pub const FILE_HEADER: u32 = 1;
    pub const TABLE_LIST: u32 = 2;
    pub const TABLE_DESCRIPTION: u32 = 3;
    pub const FRAGMENT_INFO: u32 = 4;
    pub const GCP_ENTRY: u32 = 5;
    pub const FRAGMENT_HEADER: u32 = 6;
    pub const FRAGMENT_FOOTER: u32 = 7;
}

/// File type tags stored in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u32)]
pub enum FileType {
    Ctl = 1,
    Log = 2,
    Data = 3,
    Lcp = 4,
    UndoLog = 5,
}

impl FileType {
    pub fn from_wire(value: u32) -> Result<Self, BackupError> {
        match value {
            1 => Ok(FileType::Ctl),
            2 => Ok(FileType::Log),
            3 => Ok(FileType::Data),
            4 => Ok(FileType::Lcp),
            5 => Ok(FileType::UndoLog),
            other => Err(BackupError::MalformedSection(format!(
                "unknown file type {other}"
            ))),
        }
    }
}

/// Trigger event codes as stored in log-file entries. These are the internal
/// event codes shifted by one so that zero stays free as a terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u32)]
pub enum LogEventType {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

impl LogEventType {
    pub fn from_wire(value: u32) -> Result<Self, BackupError> {
        match value {
            1 => Ok(LogEventType::Insert),
            2 => Ok(LogEventType::Update),
            3 => Ok(LogEventType::Delete),
            other => Err(BackupError::MalformedSection(format!(
                "unknown log event type {other}"
            ))),
        }
    }
}

/// Serializes words as big-endian bytes for the file system.
pub fn words_to_bytes(words: &[u32]) -> Bytes {
    let mut out = BytesMut::with_capacity(words.len() * 4);
    for w in words {
        out.put_u32(*w);
    }
    out.freeze()
}

/// Reassembles big-endian bytes into words; the byte count must be word
/// aligned.
pub fn bytes_to_words(mut bytes: &[u8]) -> Result<Vec<u32>, BackupError> {
    if bytes.len() % 4 != 0 {
        return Err(BackupError::MalformedSection(format!(
            "file length {} is not word aligned",
            bytes.len()
        )));
    }
    let mut words = Vec::with_capacity(bytes.len() / 4);
    while bytes.has_remaining() {
        words.push(bytes.get_u32());
    }
    Ok(words)
}

/// A forward cursor over a word stream, shared by all section decoders.
#[derive(Debug)]
pub struct WordReader<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> WordReader<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.words.len() - self.pos
    }

    pub fn peek(&self) -> Option<u32> {
        self.words.get(self.pos).copied()
    }

    pub fn take(&mut self) -> Result<u32, BackupError> {
        let w = self
            .peek()
            .ok_or_else(|| BackupError::MalformedSection("unexpected end of file".into()))?;
        self.pos += 1;
        Ok(w)
    }

    pub fn take_slice(&mut self, n: usize) -> Result<&'a [u32], BackupError> {
        if self.remaining() < n {
            return Err(BackupError::MalformedSection(format!(
                "section truncated: wanted {n} words, {} left",
                self.remaining()
            )));
        }
        let slice = &self.words[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn expect(&mut self, value: u32, what: &str) -> Result<(), BackupError> {
        let got = self.take()?;
        if got != value {
            return Err(BackupError::MalformedSection(format!(
                "expected {what} = {value}, got {got}"
            )));
        }
        Ok(())
    }
}

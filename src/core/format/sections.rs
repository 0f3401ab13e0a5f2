// src/core/format/sections.rs

//! Word-level encode/decode of every section in the three backup files.
//!
//! Encoders append words to a `Vec<u32>`; the file-set drain converts words
//! to big-endian bytes at append time. Decoders consume a `WordReader` and
//! are exact inverses, which the property tests rely on.

use super::{
    BACKUP_VERSION, BYTE_ORDER_MARKER, FileType, LOG_ENTRY_GCI_FLAG, LogEventType, MAGIC,
    WordReader, section_type,
};
use crate::core::errors::BackupError;

/// Total size of the file header in words.
pub const FILE_HEADER_WORDS: usize = 12;

/// Fixed header opening every backup file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub file_type: FileType,
    pub backup_id: u32,
    pub backup_key: (u32, u32),
    pub cluster_version: u32,
    pub server_version: u32,
}

impl FileHeader {
    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(u32::from_be_bytes([MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3]]));
        out.push(u32::from_be_bytes([MAGIC[4], MAGIC[5], MAGIC[6], MAGIC[7]]));
        out.push(BACKUP_VERSION);
        out.push(section_type::FILE_HEADER);
        out.push((FILE_HEADER_WORDS - 3) as u32);
        out.push(self.file_type as u32);
        out.push(self.backup_id);
        out.push(self.backup_key.0);
        out.push(self.backup_key.1);
        out.push(BYTE_ORDER_MARKER);
        out.push(self.cluster_version);
        out.push(self.server_version);
    }

    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, BackupError> {
        let magic0 = reader.take()?.to_be_bytes();
        let magic1 = reader.take()?.to_be_bytes();
        if magic0 != MAGIC[0..4] || magic1 != MAGIC[4..8] {
            return Err(BackupError::MalformedSection("bad magic".into()));
        }
        let _version = reader.take()?;
        reader.expect(section_type::FILE_HEADER, "section type")?;
        reader.expect((FILE_HEADER_WORDS - 3) as u32, "header length")?;
        let file_type = FileType::from_wire(reader.take()?)?;
        let backup_id = reader.take()?;
        let backup_key = (reader.take()?, reader.take()?);
        reader.expect(BYTE_ORDER_MARKER, "byte order marker")?;
        let cluster_version = reader.take()?;
        let server_version = reader.take()?;
        Ok(Self {
            file_type,
            backup_id,
            backup_key,
            cluster_version,
            server_version,
        })
    }
}

/// Control file: the ids of every enrolled table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableList {
    pub table_ids: Vec<u32>,
}

impl TableList {
    /// Section size in words, including the type/length prefix.
    pub fn encoded_words(&self) -> usize {
        2 + self.table_ids.len()
    }

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(section_type::TABLE_LIST);
        out.push(self.encoded_words() as u32);
        out.extend_from_slice(&self.table_ids);
    }

    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, BackupError> {
        reader.expect(section_type::TABLE_LIST, "section type")?;
        let len = reader.take()? as usize;
        if len < 2 {
            return Err(BackupError::MalformedSection("table list too short".into()));
        }
        let table_ids = reader.take_slice(len - 2)?.to_vec();
        Ok(Self { table_ids })
    }
}

/// Control file: one dictionary-serialised table descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub table_type: u32,
    /// Opaque dictionary payload, already word-packed.
    pub data: Vec<u32>,
}

impl TableDescription {
    pub fn encoded_words(&self) -> usize {
        3 + self.data.len()
    }

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(section_type::TABLE_DESCRIPTION);
        out.push(self.encoded_words() as u32);
        out.push(self.table_type);
        out.extend_from_slice(&self.data);
    }

    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, BackupError> {
        reader.expect(section_type::TABLE_DESCRIPTION, "section type")?;
        let len = reader.take()? as usize;
        if len < 3 {
            return Err(BackupError::MalformedSection(
                "table description too short".into(),
            ));
        }
        let table_type = reader.take()?;
        let data = reader.take_slice(len - 3)?.to_vec();
        Ok(Self { table_type, data })
    }
}

/// Control file: per-fragment record totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    pub table_id: u32,
    pub fragment_no: u32,
    pub records: u64,
}

impl FragmentInfo {
    pub const WORDS: usize = 8;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(section_type::FRAGMENT_INFO);
        out.push(Self::WORDS as u32);
        out.push(self.table_id);
        out.push(self.fragment_no);
        out.push((self.records & 0xFFFF_FFFF) as u32);
        out.push((self.records >> 32) as u32);
        out.push(0); // file position, reserved
        out.push(0);
    }

    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, BackupError> {
        reader.expect(section_type::FRAGMENT_INFO, "section type")?;
        reader.expect(Self::WORDS as u32, "fragment info length")?;
        let table_id = reader.take()?;
        let fragment_no = reader.take()?;
        let lo = reader.take()? as u64;
        let hi = reader.take()? as u64;
        let _file_pos_lo = reader.take()?;
        let _file_pos_hi = reader.take()?;
        Ok(Self {
            table_id,
            fragment_no,
            records: (hi << 32) | lo,
        })
    }
}

/// Control file footer: the backup's cut points. `stop_gcp` is stored as the
/// last fully captured gci, i.e. the coordinator's stop barrier minus one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcpEntry {
    pub start_gcp: u32,
    pub stop_gcp: u32,
}

impl GcpEntry {
    pub const WORDS: usize = 4;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(section_type::GCP_ENTRY);
        out.push(Self::WORDS as u32);
        out.push(self.start_gcp);
        out.push(self.stop_gcp);
    }

    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, BackupError> {
        reader.expect(section_type::GCP_ENTRY, "section type")?;
        reader.expect(Self::WORDS as u32, "gcp entry length")?;
        Ok(Self {
            start_gcp: reader.take()?,
            stop_gcp: reader.take()?,
        })
    }
}

/// Data file: opens one fragment's record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub table_id: u32,
    pub fragment_no: u32,
}

impl FragmentHeader {
    pub const WORDS: usize = 5;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(section_type::FRAGMENT_HEADER);
        out.push(Self::WORDS as u32);
        out.push(self.table_id);
        out.push(self.fragment_no);
        out.push(0); // checksum type: none
    }

    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, BackupError> {
        reader.expect(section_type::FRAGMENT_HEADER, "section type")?;
        reader.expect(Self::WORDS as u32, "fragment header length")?;
        let table_id = reader.take()?;
        let fragment_no = reader.take()?;
        reader.expect(0, "checksum type")?;
        Ok(Self {
            table_id,
            fragment_no,
        })
    }
}

/// Data file: closes one fragment's record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentFooter {
    pub table_id: u32,
    pub fragment_no: u32,
    pub records: u32,
}

impl FragmentFooter {
    pub const WORDS: usize = 6;

    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(section_type::FRAGMENT_FOOTER);
        out.push(Self::WORDS as u32);
        out.push(self.table_id);
        out.push(self.fragment_no);
        out.push(self.records);
        out.push(0); // checksum: none
    }

    pub fn decode(reader: &mut WordReader<'_>) -> Result<Self, BackupError> {
        reader.expect(section_type::FRAGMENT_FOOTER, "section type")?;
        reader.expect(Self::WORDS as u32, "fragment footer length")?;
        let table_id = reader.take()?;
        let fragment_no = reader.take()?;
        let records = reader.take()?;
        reader.expect(0, "checksum")?;
        Ok(Self {
            table_id,
            fragment_no,
            records,
        })
    }
}

/// One change record in the log file.
///
/// The leading length word counts everything that follows it except the
/// undo-mode length echo: table id, event word, fragment id, payload, and
/// the optional trailing gci. In undo mode the length is echoed after the
/// entry so the file can be scanned backwards; the echo is not counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub table_id: u32,
    pub event: LogEventType,
    pub fragment_id: u32,
    pub data: Vec<u32>,
    pub gci: Option<u32>,
}

impl LogEntry {
    /// Words between the length word and the optional undo echo.
    pub fn body_words(&self) -> usize {
        3 + self.data.len() + usize::from(self.gci.is_some())
    }

    /// Total encoded size in words.
    pub fn encoded_words(&self, undo: bool) -> usize {
        1 + self.body_words() + usize::from(undo)
    }

    pub fn encode(&self, undo: bool, out: &mut Vec<u32>) {
        let body = self.body_words() as u32;
        let mut event_word = self.event as u32;
        if self.gci.is_some() {
            event_word |= LOG_ENTRY_GCI_FLAG;
        }
        out.push(body);
        out.push(self.table_id);
        out.push(event_word);
        out.push(self.fragment_id);
        out.extend_from_slice(&self.data);
        if let Some(gci) = self.gci {
            out.push(gci);
        }
        if undo {
            out.push(body);
        }
    }

    /// Decodes one entry. Returns `None` on the zero-word stream terminator.
    pub fn decode(reader: &mut WordReader<'_>, undo: bool) -> Result<Option<Self>, BackupError> {
        let body = reader.take()? as usize;
        if body == 0 {
            return Ok(None);
        }
        if body < 3 {
            return Err(BackupError::MalformedSection(format!(
                "log entry body of {body} words is impossible"
            )));
        }
        let table_id = reader.take()?;
        let event_word = reader.take()?;
        let fragment_id = reader.take()?;
        let has_gci = event_word & LOG_ENTRY_GCI_FLAG != 0;
        let event = LogEventType::from_wire(event_word & !LOG_ENTRY_GCI_FLAG)?;
        let data_words = body - 3 - usize::from(has_gci);
        let data = reader.take_slice(data_words)?.to_vec();
        let gci = if has_gci { Some(reader.take()?) } else { None };
        if undo {
            reader.expect(body as u32, "undo length echo")?;
        }
        Ok(Some(Self {
            table_id,
            event,
            fragment_id,
            data,
            gci,
        }))
    }
}

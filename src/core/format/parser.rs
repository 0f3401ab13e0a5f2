// src/core/format/parser.rs

//! Whole-file readers for the three backup files.
//!
//! The writer side emits sections incrementally through the FlowBuffer; these
//! readers reassemble complete files, primarily for verification and for the
//! restore tooling that consumes the format. Control-file sections after the
//! table descriptions are accepted in any order, since the GCP entry lands
//! before the fragment-info records during a normal stop.

use super::sections::{
    FileHeader, FragmentFooter, FragmentHeader, FragmentInfo, GcpEntry, LogEntry, TableDescription,
    TableList,
};
use super::{FileType, WordReader, bytes_to_words, section_type};
use crate::core::errors::BackupError;

/// Parsed control file.
#[derive(Debug, Clone)]
pub struct CtlFileContents {
    pub header: FileHeader,
    pub table_list: TableList,
    pub table_descriptions: Vec<TableDescription>,
    pub fragment_info: Vec<FragmentInfo>,
    pub gcp: GcpEntry,
}

impl CtlFileContents {
    pub fn parse(bytes: &[u8]) -> Result<Self, BackupError> {
        let words = bytes_to_words(bytes)?;
        let mut reader = WordReader::new(&words);

        let header = FileHeader::decode(&mut reader)?;
        if header.file_type != FileType::Ctl {
            return Err(BackupError::MalformedSection(format!(
                "control file carries file type {}",
                header.file_type
            )));
        }
        let table_list = TableList::decode(&mut reader)?;

        let mut table_descriptions = Vec::new();
        let mut fragment_info = Vec::new();
        let mut gcp = None;
        while reader.remaining() > 0 {
            match reader.peek() {
                Some(section_type::TABLE_DESCRIPTION) => {
                    table_descriptions.push(TableDescription::decode(&mut reader)?);
                }
                Some(section_type::FRAGMENT_INFO) => {
                    fragment_info.push(FragmentInfo::decode(&mut reader)?);
                }
                Some(section_type::GCP_ENTRY) => {
                    gcp = Some(GcpEntry::decode(&mut reader)?);
                }
                other => {
                    return Err(BackupError::MalformedSection(format!(
                        "unexpected section {other:?} in control file"
                    )));
                }
            }
        }

        let gcp = gcp.ok_or_else(|| {
            BackupError::MalformedSection("control file is missing its GCP entry".into())
        })?;
        Ok(Self {
            header,
            table_list,
            table_descriptions,
            fragment_info,
            gcp,
        })
    }
}

/// One fragment's stream inside a data file.
#[derive(Debug, Clone)]
pub struct FragmentData {
    pub header: FragmentHeader,
    pub records: Vec<Vec<u32>>,
    pub footer: FragmentFooter,
}

/// Parsed data file.
#[derive(Debug, Clone)]
pub struct DataFileContents {
    pub header: FileHeader,
    pub fragments: Vec<FragmentData>,
}

impl DataFileContents {
    pub fn parse(bytes: &[u8]) -> Result<Self, BackupError> {
        let words = bytes_to_words(bytes)?;
        let mut reader = WordReader::new(&words);

        let header = FileHeader::decode(&mut reader)?;
        if header.file_type != FileType::Data {
            return Err(BackupError::MalformedSection(format!(
                "data file carries file type {}",
                header.file_type
            )));
        }

        let mut fragments = Vec::new();
        while reader.remaining() > 0 {
            let frag_header = FragmentHeader::decode(&mut reader)?;
            let mut records = Vec::new();
            loop {
                let len = reader.take()? as usize;
                if len == 0 {
                    break;
                }
                records.push(reader.take_slice(len)?.to_vec());
            }
            let footer = FragmentFooter::decode(&mut reader)?;
            if footer.table_id != frag_header.table_id
                || footer.fragment_no != frag_header.fragment_no
            {
                return Err(BackupError::MalformedSection(format!(
                    "fragment footer ({}, {}) does not match header ({}, {})",
                    footer.table_id,
                    footer.fragment_no,
                    frag_header.table_id,
                    frag_header.fragment_no
                )));
            }
            fragments.push(FragmentData {
                header: frag_header,
                records,
                footer,
            });
        }
        Ok(Self { header, fragments })
    }
}

/// Parsed log file.
#[derive(Debug, Clone)]
pub struct LogFileContents {
    pub header: FileHeader,
    pub entries: Vec<LogEntry>,
}

impl LogFileContents {
    pub fn parse(bytes: &[u8]) -> Result<Self, BackupError> {
        let words = bytes_to_words(bytes)?;
        let mut reader = WordReader::new(&words);

        let header = FileHeader::decode(&mut reader)?;
        let undo = match header.file_type {
            FileType::Log => false,
            FileType::UndoLog => true,
            other => {
                return Err(BackupError::MalformedSection(format!(
                    "log file carries file type {other}"
                )));
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = LogEntry::decode(&mut reader, undo)? {
            entries.push(entry);
        }
        Ok(Self { header, entries })
    }
}

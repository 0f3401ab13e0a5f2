// src/core/records.rs

//! In-memory records of one in-flight backup: the Backup itself and its
//! Tables, Fragments, Triggers, and Files.
//!
//! The Backup exclusively owns the storage of everything it references;
//! cross-references are plain indices into the owning vectors, invalidated
//! together when the Backup is released. The slave state machine is the
//! source of truth on every participant; the master phase is a derivation
//! kept only on the coordinator.

use crate::core::buffer::FlowBuffer;
use crate::core::errors::ErrorCode;
use crate::core::format::FileType;
use crate::core::services::{ScanCursor, TableBrief, TableType};
use crate::core::signals::{
    AttrKind, BackupId, BackupReqFlags, ClientHandle, NodeId, NodeSet, TriggerEvent,
};
use bitflags::bitflags;

/// Index of the control file in `Backup::files`.
pub const CTL_FILE: usize = 0;
/// Index of the log file in `Backup::files`.
pub const LOG_FILE: usize = 1;
/// Index of the data file in `Backup::files`.
pub const DATA_FILE: usize = 2;

/// Per-node participant state of one backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SlaveState {
    Initial,
    Defining,
    Defined,
    Started,
    Scanning,
    Stopping,
    Cleaning,
    Aborting,
}

impl SlaveState {
    /// The allowed transitions; anything else is a programming error.
    fn may_transition(self, to: SlaveState) -> bool {
        use SlaveState::*;
        matches!(
            (self, to),
            (Initial, Defining)
                | (Defining, Defined)
                | (Defined, Started)
                | (Started, Scanning)
                | (Scanning, Started)
                | (Started, Stopping)
                | (Stopping, Cleaning)
                | (Cleaning, Initial)
                | (Aborting, Initial)
        ) || (to == Aborting && self != Initial)
    }
}

/// The coordinator phase currently awaiting replies. `None` means nothing is
/// waited on, which is also the state a takeover master starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MasterGsn {
    UtilSequence,
    DefineBackup,
    StartBackup,
    WaitGcpStart,
    BackupFragment,
    WaitGcpStop,
    StopBackup,
    AbortBackup,
}

/// Coordinator-only state, held by the node in a map keyed by backup id and
/// instantiated on demand — at request time or on master takeover. The slave
/// state machine on the same node stays the source of truth; this is a
/// derivation.
#[derive(Debug)]
pub struct MasterData {
    pub gsn: Option<MasterGsn>,
    /// Nodes whose reply for the current phase is still outstanding.
    pub reply_set: NodeSet,
    /// Nodes currently running a fragment scan.
    pub busy: NodeSet,
    /// Whether BackupConf has been delivered; decides Ref vs AbortRep later.
    pub conf_sent: bool,
    pub define_mutex_locked: bool,
    pub dict_mutex_locked: bool,
}

impl MasterData {
    pub fn new() -> Self {
        Self {
            gsn: None,
            reply_set: NodeSet::new(),
            busy: NodeSet::new(),
            conf_sent: false,
            define_mutex_locked: false,
            dict_mutex_locked: false,
        }
    }
}

impl Default for MasterData {
    fn default() -> Self {
        Self::new()
    }
}

/// One replica assignment of one fragment within a backup.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub fragment_id: u32,
    /// The single node responsible for scanning this fragment.
    pub node: NodeId,
    pub instance_key: u32,
    pub scanned: bool,
    pub scanning: bool,
    /// Row total, filled by the scanning node or by the master's
    /// per-fragment completion re-broadcast.
    pub records: u64,
}

/// A table enrolled in a backup.
#[derive(Debug)]
pub struct Table {
    pub table_id: u32,
    pub table_type: TableType,
    pub schema_version: u32,
    pub attr_count: u32,
    pub max_row_words: u32,
    /// Packed read-attribute template handed to every fragment scan.
    pub scan_template: Vec<u32>,
    /// Trigger handles into `Backup::triggers`, one per event, once allocated.
    pub trigger_slots: [Option<usize>; 3],
    pub fragments: Vec<Fragment>,
    /// Set once the descriptor has been written to the control file.
    pub meta_written: bool,
}

impl Table {
    pub fn from_brief(brief: &TableBrief) -> Self {
        Self {
            table_id: brief.table_id,
            table_type: brief.table_type,
            schema_version: 0,
            attr_count: 0,
            max_row_words: 0,
            scan_template: Vec::new(),
            trigger_slots: [None; 3],
            fragments: Vec::new(),
            meta_written: false,
        }
    }

    pub fn triggers_allocated(&self) -> usize {
        self.trigger_slots.iter().flatten().count()
    }
}

/// A log entry being assembled between TrigAttrInfo and FireTrigOrd.
#[derive(Debug)]
pub struct PendingLogEntry {
    pub words: Vec<u32>,
    /// Words of log-buffer space reserved for the maximum-size entry.
    pub reserved_words: usize,
}

/// One (event, table) change-capture subscription owned by a backup.
#[derive(Debug)]
pub struct Trigger {
    pub trigger_id: u32,
    pub table_idx: usize,
    /// Sanity copy; the table index alone would survive a stale handle.
    pub table_id: u32,
    pub event: TriggerEvent,
    pub created: bool,
    pub pending: Option<PendingLogEntry>,
    pub error: ErrorCode,
}

impl Trigger {
    /// Whether a value-set signal contributes to the log entry in the
    /// given logging mode. Redo keeps keys and after-values; undo keeps keys
    /// and before-values.
    pub fn keeps(&self, kind: AttrKind, undo: bool) -> bool {
        match kind {
            AttrKind::PrimaryKey => true,
            AttrKind::BeforeValues => undo,
            AttrKind::AfterValues => !undo,
        }
    }
}

bitflags! {
    /// Lifecycle bits of one backup file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        /// FsOpenReq issued, reply pending.
        const OPENING         = 0x01;
        /// FsOpenConf received; handle is valid.
        const OPEN            = 0x02;
        /// FsCloseReq issued, reply pending.
        const CLOSING         = 0x04;
        /// The drain task is running for this file.
        const FILE_THREAD     = 0x08;
        /// A fragment scan is producing into this file's buffer.
        const SCAN_THREAD     = 0x10;
        /// Close must delete the file (error or abort).
        const REMOVE_ON_CLOSE = 0x20;
    }
}

/// One of the three files of a backup on this node.
#[derive(Debug)]
pub struct BackupFile {
    pub file_type: FileType,
    pub name: String,
    pub flags: FileFlags,
    pub handle: Option<u64>,
    pub buffer: FlowBuffer,
    pub error: ErrorCode,
    /// Words handed to an in-flight FsAppendReq, 0 when idle.
    pub outstanding_words: usize,
    /// Close wanted but blocked behind the in-flight append.
    pub close_requested: bool,
    /// Table/fragment currently streaming into a data file.
    pub current_fragment: Option<(u32, u32)>,
    /// Transient scan-error retry counter.
    pub scan_retries: u32,
    /// Log-buffer words promised to pending trigger entries.
    pub reserved_words: usize,
    pub records: u64,
    pub bytes: u64,
    /// Records produced into the fragment currently being written.
    pub op_records: u64,
    /// Bytes produced into the fragment currently being written.
    pub op_bytes: u64,
}

impl BackupFile {
    pub fn new(file_type: FileType, name: String, buffer: FlowBuffer) -> Self {
        Self {
            file_type,
            name,
            flags: FileFlags::empty(),
            handle: None,
            buffer,
            error: ErrorCode::None,
            outstanding_words: 0,
            close_requested: false,
            current_fragment: None,
            scan_retries: 0,
            reserved_words: 0,
            records: 0,
            bytes: 0,
            op_records: 0,
            op_bytes: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.flags.contains(FileFlags::OPEN) && !self.flags.contains(FileFlags::CLOSING)
    }
}

/// Progress of the DEFINING phase on a slave.
#[derive(Debug, Default)]
pub struct DefineProgress {
    /// Files still waiting for FsOpenConf.
    pub files_opening: usize,
    /// Next table whose descriptor must be fetched and written.
    pub next_meta: usize,
    /// Next table whose fragments must be enumerated.
    pub next_frag_table: usize,
    /// Fragments of the current table still waiting for placement.
    pub placements_outstanding: u32,
    pub scan_cookie: u64,
}

/// Progress of the StartBackup trigger installation on a slave.
#[derive(Debug, Default)]
pub struct StartProgress {
    pub next_table: usize,
    pub outstanding: usize,
}

/// Progress of the StopBackup fragment-info emission on a slave.
#[derive(Debug, Default)]
pub struct StopProgress {
    pub table_locked: bool,
    pub drops_outstanding: usize,
}

/// Cleanup accounting while ABORTING.
#[derive(Debug, Default)]
pub struct AbortProgress {
    pub files_closing: usize,
    pub drops_outstanding: usize,
}

/// One in-flight backup job on this node.
pub struct Backup {
    pub backup_id: BackupId,
    pub backup_key: (u32, u32),
    pub client: Option<ClientHandle>,
    pub flags: BackupReqFlags,
    pub nodes: NodeSet,
    pub master: NodeId,
    state: SlaveState,
    pub error: ErrorCode,

    pub start_gcp: u32,
    pub stop_gcp: u32,
    pub curr_gcp: u32,

    pub tables: Vec<Table>,
    pub triggers: Vec<Trigger>,
    pub files: Vec<BackupFile>,

    pub define: DefineProgress,
    pub start: StartProgress,
    pub stop: StopProgress,
    pub abort: AbortProgress,

    /// Cursor of the scan in progress, parked between batches.
    pub scan_cursor: Option<Box<dyn ScanCursor>>,

    /// Totals; on the master these accumulate the whole cluster's confs,
    /// on a slave only the local files.
    pub bytes: u64,
    pub records: u64,
    pub log_bytes: u64,
    pub log_records: u64,
}

impl Backup {
    pub fn new(
        backup_id: BackupId,
        backup_key: (u32, u32),
        flags: BackupReqFlags,
        nodes: NodeSet,
        master: NodeId,
    ) -> Self {
        Self {
            backup_id,
            backup_key,
            client: None,
            flags,
            nodes,
            master,
            state: SlaveState::Initial,
            error: ErrorCode::None,
            start_gcp: 0,
            stop_gcp: 0,
            curr_gcp: 0,
            tables: Vec::new(),
            triggers: Vec::new(),
            files: Vec::new(),
            define: DefineProgress::default(),
            start: StartProgress::default(),
            stop: StopProgress::default(),
            abort: AbortProgress::default(),
            scan_cursor: None,
            bytes: 0,
            records: 0,
            log_bytes: 0,
            log_records: 0,
        }
    }

    pub fn state(&self) -> SlaveState {
        self.state
    }

    /// Advances the slave state machine. An illegal transition is a bug in
    /// the caller and is fatal.
    pub fn set_state(&mut self, to: SlaveState) {
        assert!(
            self.state.may_transition(to),
            "illegal backup state transition {} -> {} (backup {})",
            self.state,
            to,
            self.backup_id
        );
        self.state = to;
    }

    /// Master-takeover only: the new coordinator reconstructs its phase from
    /// the local slave state without transition checking.
    pub fn force_state(&mut self, to: SlaveState) {
        self.state = to;
    }

    /// Records the first error only, preserving the root cause.
    pub fn record_error(&mut self, error: ErrorCode) {
        if !self.error.is_set() {
            self.error = error;
        }
    }

    pub fn uses_undo_log(&self) -> bool {
        self.flags.contains(BackupReqFlags::USE_UNDO_LOG)
    }

    pub fn is_aborting(&self) -> bool {
        self.state == SlaveState::Aborting
    }

    pub fn table_by_id(&self, table_id: u32) -> Option<usize> {
        self.tables.iter().position(|t| t.table_id == table_id)
    }

    pub fn trigger_by_id(&self, trigger_id: u32) -> Option<usize> {
        self.triggers.iter().position(|t| t.trigger_id == trigger_id)
    }

    /// The master phase a takeover coordinator starts from, derived from the
    /// local slave state.
    pub fn takeover_gsn(&self) -> Option<MasterGsn> {
        match self.state {
            SlaveState::Initial => None,
            SlaveState::Defining
            | SlaveState::Defined
            | SlaveState::Started
            | SlaveState::Scanning
            | SlaveState::Aborting => Some(MasterGsn::BackupFragment),
            SlaveState::Stopping | SlaveState::Cleaning => Some(MasterGsn::StopBackup),
        }
    }
}

impl std::fmt::Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup")
            .field("backup_id", &self.backup_id)
            .field("state", &self.state.to_string())
            .field("master", &self.master)
            .field("nodes", &self.nodes)
            .field("error", &self.error)
            .field("tables", &self.tables.len())
            .field("triggers", &self.triggers.len())
            .field("bytes", &self.bytes)
            .field("records", &self.records)
            .field("log_bytes", &self.log_bytes)
            .field("log_records", &self.log_records)
            .finish()
    }
}

// src/core/signals.rs

//! Typed signals exchanged between backup participants and posted back by
//! service wrapper tasks.
//!
//! Signals are processed run-to-completion by the owning node's signal loop.
//! Delivery between two nodes preserves send order; "suspension" inside a
//! handler is expressed by re-posting a `ContinueB` continuation to self with
//! one of the fixed delays.

use crate::core::errors::{AbortReason, ErrorCode};
use crate::core::services::{ScanCursor, ScanErrorCode, TableBrief, TableMeta};
use bitflags::bitflags;
use std::collections::BTreeSet;
use tokio::sync::mpsc;

/// Cluster-wide identifier of a data node.
pub type NodeId = u32;

/// Cluster-wide identifier of a backup, drawn from the cluster sequence.
pub type BackupId = u64;

/// The set of nodes participating in a backup.
pub type NodeSet = BTreeSet<NodeId>;

bitflags! {
    /// Client-selected behaviour of a backup request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BackupReqFlags: u32 {
        const WAIT_STARTED   = 0x1;
        const WAIT_COMPLETED = 0x2;
        const USE_UNDO_LOG   = 0x4;
        const MULTI_THREADED = 0x8;
    }
}

/// Replies delivered to the requesting client.
#[derive(Debug, Clone)]
pub enum ClientReply {
    BackupConf {
        backup_id: BackupId,
        nodes: NodeSet,
    },
    BackupRef {
        error: ErrorCode,
    },
    BackupCompleteRep {
        backup_id: BackupId,
        start_gcp: u32,
        stop_gcp: u32,
        bytes: u64,
        records: u64,
        log_bytes: u64,
        log_records: u64,
        nodes: NodeSet,
    },
    BackupAbortRep {
        backup_id: BackupId,
        reason: ErrorCode,
    },
    BackupStatusConf {
        backups: Vec<BackupStatus>,
    },
}

/// One in-flight backup's counters, as reported by BackupStatusReq.
#[derive(Debug, Clone)]
pub struct BackupStatus {
    pub backup_id: BackupId,
    pub state: String,
    pub bytes: u64,
    pub records: u64,
    pub log_bytes: u64,
    pub log_records: u64,
}

/// Where client replies go. Cheap to clone; a dropped receiver simply
/// discards further replies.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub client_data: u32,
    tx: mpsc::UnboundedSender<ClientReply>,
}

impl ClientHandle {
    pub fn channel(client_data: u32) -> (Self, mpsc::UnboundedReceiver<ClientReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { client_data, tx }, rx)
    }

    /// A handle whose replies are discarded, used by the admin self-test.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { client_data: 0, tx }
    }

    pub fn send(&self, reply: ClientReply) {
        let _ = self.tx.send(reply);
    }
}

/// Trigger event codes as used in trigger subscriptions and Trigger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u32)]
pub enum TriggerEvent {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl TriggerEvent {
    pub const ALL: [TriggerEvent; 3] =
        [TriggerEvent::Insert, TriggerEvent::Update, TriggerEvent::Delete];
}

/// Which value set a TrigAttrInfo signal carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    PrimaryKey,
    BeforeValues,
    AfterValues,
}

/// The two cluster mutexes serialising backup definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MutexId {
    /// Serialises concurrent backup starts across the cluster.
    BackupDefine,
    /// Prevents schema commits while a backup is being defined.
    DictCommitTable,
}

/// Admin channel commands (the dump/diagnostic surface).
#[derive(Debug, Clone)]
pub enum DumpCommand {
    SetDataBufferSize(usize),
    SetLogBufferSize(usize),
    SetDiskWriteSpeed(usize),
    ToggleCompression,
    /// Loop-back backup against the local node, replies discarded.
    SelfTestBackup,
    /// Remove the three on-disk files of a finished backup.
    RemoveBackupFiles { backup_id: BackupId },
    /// Dump the in-memory backup records through tracing.
    PrintRecords,
}

/// Delayed self-posted continuations; the only suspension mechanism.
#[derive(Debug, Clone)]
pub enum ContinueB {
    /// Periodic write-rate governor tick.
    RateTick,
    /// Drain one file's FlowBuffer toward the file system.
    DrainFile { backup_id: BackupId, file_idx: usize },
    /// Re-fetch one table's descriptor after a full control-file buffer.
    FetchTableMeta { backup_id: BackupId, table_idx: usize },
    /// Retry a fragment scan after a transient row-store error.
    RetryScan {
        backup_id: BackupId,
        table_id: u32,
        fragment_no: u32,
    },
    /// Ask the open scan cursor for its next batch.
    ScanNext { backup_id: BackupId },
    /// Emit fragment-info records, one table at a time, under BackupLockTab.
    FragmentInfo {
        backup_id: BackupId,
        table_idx: usize,
        frag_idx: usize,
    },
    /// Re-run the sequence request after a transient failure.
    RetrySequence { token: u32 },
}

/// Everything a backup node can receive.
pub enum Signal {
    // --- client surface ---
    BackupReq {
        client: ClientHandle,
        flags: BackupReqFlags,
        backup_data_len: u32,
        input_backup_id: Option<BackupId>,
    },
    BackupStatusReq {
        client: ClientHandle,
    },
    DumpStateOrd(DumpCommand),

    // --- master <-> slave coordination ---
    DefineBackupReq {
        backup_id: BackupId,
        backup_key: (u32, u32),
        master: NodeId,
        nodes: NodeSet,
        flags: BackupReqFlags,
        /// Propagated to every participant so a takeover master can still
        /// reach the requesting client.
        client: Option<ClientHandle>,
    },
    DefineBackupConf {
        backup_id: BackupId,
        node: NodeId,
    },
    DefineBackupRef {
        backup_id: BackupId,
        node: NodeId,
        error: ErrorCode,
    },
    StartBackupReq {
        backup_id: BackupId,
    },
    StartBackupConf {
        backup_id: BackupId,
        node: NodeId,
    },
    StartBackupRef {
        backup_id: BackupId,
        node: NodeId,
        error: ErrorCode,
    },
    BackupFragmentReq {
        backup_id: BackupId,
        table_id: u32,
        fragment_no: u32,
    },
    BackupFragmentConf {
        backup_id: BackupId,
        node: NodeId,
        table_id: u32,
        fragment_no: u32,
        records: u64,
        bytes: u64,
    },
    BackupFragmentRef {
        backup_id: BackupId,
        node: NodeId,
        table_id: u32,
        fragment_no: u32,
        error: ErrorCode,
    },
    /// Master re-broadcast of a completed fragment so every participant's
    /// control file carries complete fragment totals.
    BackupFragmentCompleteRep {
        backup_id: BackupId,
        table_id: u32,
        fragment_no: u32,
        records: u64,
        bytes: u64,
    },
    StopBackupReq {
        backup_id: BackupId,
        start_gcp: u32,
        stop_gcp: u32,
    },
    StopBackupConf {
        backup_id: BackupId,
        node: NodeId,
        log_bytes: u64,
        log_records: u64,
    },
    StopBackupRef {
        backup_id: BackupId,
        node: NodeId,
        error: ErrorCode,
    },
    AbortBackupOrd {
        backup_id: BackupId,
        reason: AbortReason,
    },

    // --- cluster membership ---
    NodeFailRep {
        failed: NodeSet,
        new_master: NodeId,
    },

    // --- sequence service replies ---
    UtilSequenceConf {
        token: u32,
        value: u64,
    },
    UtilSequenceRef {
        token: u32,
        transient: bool,
    },

    // --- mutex service replies ---
    MutexLocked {
        backup_id: BackupId,
        mutex: MutexId,
    },
    MutexLockFailed {
        backup_id: BackupId,
        mutex: MutexId,
    },

    // --- dictionary service replies ---
    ListTablesConf {
        backup_id: BackupId,
        tables: Vec<TableBrief>,
    },
    ListTablesRef {
        backup_id: BackupId,
    },
    GetTabInfoConf {
        backup_id: BackupId,
        table_idx: usize,
        meta: TableMeta,
    },
    GetTabInfoRef {
        backup_id: BackupId,
        table_idx: usize,
    },
    CreateTrigConf {
        backup_id: BackupId,
        table_id: u32,
        trigger_id: u32,
    },
    CreateTrigRef {
        backup_id: BackupId,
        table_id: u32,
        trigger_id: u32,
    },
    DropTrigConf {
        backup_id: BackupId,
        trigger_id: u32,
    },
    DropTrigRef {
        backup_id: BackupId,
        trigger_id: u32,
    },
    BackupLockTabConf {
        backup_id: BackupId,
        table_idx: usize,
        locked: bool,
    },
    BackupLockTabRef {
        backup_id: BackupId,
        table_idx: usize,
    },

    // --- distribution service replies ---
    DihScanTabConf {
        backup_id: BackupId,
        table_idx: usize,
        fragment_count: u32,
        scan_cookie: u64,
    },
    DihScanTabRef {
        backup_id: BackupId,
        table_idx: usize,
    },
    DihScanGetNodesConf {
        backup_id: BackupId,
        table_idx: usize,
        fragment_no: u32,
        node: NodeId,
        instance_key: u32,
    },
    DihScanGetNodesRef {
        backup_id: BackupId,
        table_idx: usize,
        fragment_no: u32,
    },
    WaitGcpConf {
        backup_id: BackupId,
        gci: u32,
    },
    WaitGcpRef {
        backup_id: BackupId,
    },

    // --- row store scan replies ---
    ScanFragConf {
        backup_id: BackupId,
        cursor: Box<dyn ScanCursor>,
        rows: Vec<Vec<u32>>,
        fragment_complete: bool,
    },
    ScanFragRef {
        backup_id: BackupId,
        error: ScanErrorCode,
    },

    // --- trigger firing (from the row store) ---
    TrigAttrInfo {
        trigger_id: u32,
        kind: AttrKind,
        words: Vec<u32>,
    },
    FireTrigOrd {
        trigger_id: u32,
        fragment_id: u32,
        gci: u32,
    },

    // --- file system replies ---
    FsOpenConf {
        backup_id: BackupId,
        file_idx: usize,
        handle: u64,
    },
    FsOpenRef {
        backup_id: BackupId,
        file_idx: usize,
    },
    FsAppendConf {
        backup_id: BackupId,
        file_idx: usize,
        words: usize,
    },
    FsAppendRef {
        backup_id: BackupId,
        file_idx: usize,
    },
    FsCloseConf {
        backup_id: BackupId,
        file_idx: usize,
    },
    FsCloseRef {
        backup_id: BackupId,
        file_idx: usize,
    },

    // --- delayed continuations ---
    ContinueB(ContinueB),
}

impl Signal {
    /// Short name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::BackupReq { .. } => "BACKUP_REQ",
            Signal::BackupStatusReq { .. } => "BACKUP_STATUS_REQ",
            Signal::DumpStateOrd(_) => "DUMP_STATE_ORD",
            Signal::DefineBackupReq { .. } => "DEFINE_BACKUP_REQ",
            Signal::DefineBackupConf { .. } => "DEFINE_BACKUP_CONF",
            Signal::DefineBackupRef { .. } => "DEFINE_BACKUP_REF",
            Signal::StartBackupReq { .. } => "START_BACKUP_REQ",
            Signal::StartBackupConf { .. } => "START_BACKUP_CONF",
            Signal::StartBackupRef { .. } => "START_BACKUP_REF",
            Signal::BackupFragmentReq { .. } => "BACKUP_FRAGMENT_REQ",
            Signal::BackupFragmentConf { .. } => "BACKUP_FRAGMENT_CONF",
            Signal::BackupFragmentRef { .. } => "BACKUP_FRAGMENT_REF",
            Signal::BackupFragmentCompleteRep { .. } => "BACKUP_FRAGMENT_COMPLETE_REP",
            Signal::StopBackupReq { .. } => "STOP_BACKUP_REQ",
            Signal::StopBackupConf { .. } => "STOP_BACKUP_CONF",
            Signal::StopBackupRef { .. } => "STOP_BACKUP_REF",
            Signal::AbortBackupOrd { .. } => "ABORT_BACKUP_ORD",
            Signal::NodeFailRep { .. } => "NODE_FAIL_REP",
            Signal::UtilSequenceConf { .. } => "UTIL_SEQUENCE_CONF",
            Signal::UtilSequenceRef { .. } => "UTIL_SEQUENCE_REF",
            Signal::MutexLocked { .. } => "MUTEX_LOCKED",
            Signal::MutexLockFailed { .. } => "MUTEX_LOCK_FAILED",
            Signal::ListTablesConf { .. } => "LIST_TABLES_CONF",
            Signal::ListTablesRef { .. } => "LIST_TABLES_REF",
            Signal::GetTabInfoConf { .. } => "GET_TABINFO_CONF",
            Signal::GetTabInfoRef { .. } => "GET_TABINFO_REF",
            Signal::CreateTrigConf { .. } => "CREATE_TRIG_CONF",
            Signal::CreateTrigRef { .. } => "CREATE_TRIG_REF",
            Signal::DropTrigConf { .. } => "DROP_TRIG_CONF",
            Signal::DropTrigRef { .. } => "DROP_TRIG_REF",
            Signal::BackupLockTabConf { .. } => "BACKUP_LOCK_TAB_CONF",
            Signal::BackupLockTabRef { .. } => "BACKUP_LOCK_TAB_REF",
            Signal::DihScanTabConf { .. } => "DIH_SCAN_TAB_CONF",
            Signal::DihScanTabRef { .. } => "DIH_SCAN_TAB_REF",
            Signal::DihScanGetNodesConf { .. } => "DIH_SCAN_GET_NODES_CONF",
            Signal::DihScanGetNodesRef { .. } => "DIH_SCAN_GET_NODES_REF",
            Signal::WaitGcpConf { .. } => "WAIT_GCP_CONF",
            Signal::WaitGcpRef { .. } => "WAIT_GCP_REF",
            Signal::ScanFragConf { .. } => "SCAN_FRAG_CONF",
            Signal::ScanFragRef { .. } => "SCAN_FRAG_REF",
            Signal::TrigAttrInfo { .. } => "TRIG_ATTRINFO",
            Signal::FireTrigOrd { .. } => "FIRE_TRIG_ORD",
            Signal::FsOpenConf { .. } => "FSOPEN_CONF",
            Signal::FsOpenRef { .. } => "FSOPEN_REF",
            Signal::FsAppendConf { .. } => "FSAPPEND_CONF",
            Signal::FsAppendRef { .. } => "FSAPPEND_REF",
            Signal::FsCloseConf { .. } => "FSCLOSE_CONF",
            Signal::FsCloseRef { .. } => "FSCLOSE_REF",
            Signal::ContinueB(_) => "CONTINUEB",
        }
    }
}

/// A signal together with its routing, as carried by the cluster bus.
pub struct SignalEnvelope {
    pub from: NodeId,
    pub to: NodeId,
    pub signal: Signal,
}

// src/core/services/mod.rs

//! Asynchronous interfaces to the cluster services the backup subsystem
//! consumes: sequence allocation, cluster mutexes, the dictionary, the
//! distribution service, the row store, and the file system.
//!
//! The subsystem never blocks on a service inside a signal handler; each call
//! is spawned and its outcome is posted back into the owning node's signal
//! queue as the matching Conf/Ref.

pub mod local_fs;

use crate::core::signals::{NodeId, TriggerEvent};
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub use local_fs::LocalFileSystem;

/// The cluster sequence the backup subsystem draws its ids from.
pub const BACKUP_SEQUENCE: u32 = 0x2F_0000;

/// Backup trigger ids come from this reserved sub-range so they can never
/// clash with dictionary-allocated trigger ids.
pub const BACKUP_TRIGGER_BASE: u32 = 0x00F0_0000;

#[derive(Debug, Error)]
pub enum SequenceError {
    /// Transaction-coordinator hiccup; the caller retries with a delay.
    #[error("transient sequence failure")]
    Transient,
    #[error("permanent sequence failure")]
    Permanent,
}

impl SequenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SequenceError::Transient)
    }
}

/// Cluster-wide monotonic 64-bit sequences.
#[async_trait]
pub trait SequenceService: Send + Sync {
    async fn next_val(&self, sequence_id: u32) -> Result<u64, SequenceError>;
}

/// Cluster-wide mutexes. A successful `lock` holds the mutex until `unlock`.
#[async_trait]
pub trait MutexService: Send + Sync {
    async fn lock(&self, mutex: crate::core::signals::MutexId) -> Result<(), ServiceError>;
    fn unlock(&self, mutex: crate::core::signals::MutexId);
}

#[derive(Debug, Error)]
#[error("service failure: {0}")]
pub struct ServiceError(pub String);

/// Dictionary object classes as returned by ListTables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum TableType {
    UserTable,
    Index,
    Filegroup,
    File,
    HashMap,
    ForeignKey,
    Other,
}

impl TableType {
    /// Object classes that a backup enrolls at all.
    pub fn is_backed_up(self) -> bool {
        !matches!(self, TableType::Other)
    }

    /// Only plain user tables get change-capture triggers and fragment scans;
    /// every other class is schema-only.
    pub fn has_row_data(self) -> bool {
        matches!(self, TableType::UserTable)
    }
}

/// One row of a ListTables reply.
#[derive(Debug, Clone)]
pub struct TableBrief {
    pub table_id: u32,
    pub table_type: TableType,
    pub online: bool,
}

/// The dictionary's descriptor of one table.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub table_id: u32,
    pub table_type: TableType,
    pub schema_version: u32,
    pub attr_count: u32,
    /// Upper bound of one packed row, in words.
    pub max_row_words: u32,
    /// Opaque serialised descriptor, written verbatim to the control file.
    pub descriptor: Vec<u32>,
}

/// The action-time class of a backup subscription trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Fires with after-values: redo logging.
    Subscription,
    /// Fires with before-values: undo logging.
    SubscriptionBefore,
}

/// A CreateTrigImpl request: one (event, table) subscription bound to one
/// backup on the node where the fragment data lives.
#[derive(Debug, Clone)]
pub struct CreateTriggerReq {
    pub trigger_id: u32,
    pub table_id: u32,
    pub event: TriggerEvent,
    pub kind: SubscriptionKind,
    pub monitor_replicas: bool,
    pub monitor_all_attributes: bool,
    /// One bit per attribute, word-packed.
    pub attribute_mask: Vec<u32>,
    /// Node whose signal queue receives TrigAttrInfo/FireTrigOrd.
    pub receiver: NodeId,
}

/// Table metadata resolution and trigger management.
#[async_trait]
pub trait DictionaryService: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableBrief>, ServiceError>;
    async fn get_tab_info(&self, table_id: u32) -> Result<TableMeta, ServiceError>;
    async fn create_trigger(&self, req: CreateTriggerReq) -> Result<(), ServiceError>;
    async fn drop_trigger(&self, trigger_id: u32) -> Result<(), ServiceError>;
    /// BackupLockTab: hold off schema changes on one table while its
    /// fragment-info records are written.
    async fn lock_table(&self, table_id: u32, lock: bool) -> Result<(), ServiceError>;
}

/// Fragment placement for one table.
#[derive(Debug, Clone, Copy)]
pub struct FragmentPlacement {
    pub node: NodeId,
    pub instance_key: u32,
}

/// Fragment enumeration and global-checkpoint barriers.
#[async_trait]
pub trait DistributionService: Send + Sync {
    async fn scan_tab(&self, table_id: u32) -> Result<(u32, u64), ServiceError>;
    async fn scan_get_nodes(
        &self,
        table_id: u32,
        fragment_id: u32,
    ) -> Result<FragmentPlacement, ServiceError>;
    async fn scan_tab_complete(&self, table_id: u32, scan_cookie: u64);
    /// WaitGcp(CompleteForceStart): forces a fresh gci and resolves once it
    /// has started, returning its number.
    async fn wait_gcp_complete_force_start(&self) -> Result<u32, ServiceError>;
}

/// Row-store scan error codes; a few are transient and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorCode {
    TooManyActiveScans,
    ScanBookAccOpError,
    NoTcConnect,
    Other(u32),
}

impl ScanErrorCode {
    pub fn is_transient(self) -> bool {
        !matches!(self, ScanErrorCode::Other(_))
    }
}

/// One batch of a fragment range scan.
#[derive(Debug)]
pub struct ScanBatch {
    /// Packed rows, each a word vector matching the attribute template.
    pub rows: Vec<Vec<u32>>,
    pub fragment_complete: bool,
}

/// An open fragment scan. Dropping the cursor closes the scan.
#[async_trait]
pub trait ScanCursor: Send {
    async fn next_batch(&mut self) -> Result<ScanBatch, ScanErrorCode>;
}

/// A fragment range-scan request.
#[derive(Debug, Clone)]
pub struct ScanFragReq {
    pub table_id: u32,
    pub fragment_id: u32,
    pub batch_size: u32,
    /// Packed read-attribute template declaring what each row carries.
    pub attr_template: Vec<u32>,
    pub tup_order: bool,
    pub read_committed: bool,
    pub no_disk: bool,
}

/// The on-disk row store.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn scan_frag(&self, req: ScanFragReq) -> Result<Box<dyn ScanCursor>, ScanErrorCode>;
}

bitflags! {
    /// Open flags for backup files.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsOpenFlags: u32 {
        const WRITE_ONLY     = 0x01;
        const CREATE_IF_NONE = 0x02;
        const APPEND         = 0x04;
        const AUTO_SYNC      = 0x08;
        const DIRECT_IO      = 0x10;
        const COMPRESSED     = 0x20;
    }
}

/// An FsOpenReq.
#[derive(Debug, Clone)]
pub struct FsOpenReq {
    pub name: String,
    pub flags: FsOpenFlags,
    /// Auto-sync threshold in bytes when AUTO_SYNC is set.
    pub sync_size: usize,
}

/// The file-system abstraction executing open/append/close/remove.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self, req: FsOpenReq) -> io::Result<u64>;
    async fn append(&self, handle: u64, data: Bytes) -> io::Result<()>;
    async fn close(&self, handle: u64, remove: bool) -> io::Result<()>;
    async fn remove(&self, name: &str) -> io::Result<()>;
}

/// The bundle of service handles one backup node runs against.
#[derive(Clone)]
pub struct Services {
    pub sequence: Arc<dyn SequenceService>,
    pub mutex: Arc<dyn MutexService>,
    pub dictionary: Arc<dyn DictionaryService>,
    pub distribution: Arc<dyn DistributionService>,
    pub row_store: Arc<dyn RowStore>,
    pub file_system: Arc<dyn FileSystem>,
}

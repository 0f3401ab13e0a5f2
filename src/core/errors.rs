// src/core/errors.rs

//! Defines the primary error type of the backup subsystem and the compact
//! wire-level error codes carried by Ref signals between nodes.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the backup
/// subsystem. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Buffer setup failed: {0}")]
    BufferSetup(&'static str),

    #[error("Backup rejected: {0}")]
    Rejected(ErrorCode),

    #[error("Backup {0} aborted: {1}")]
    Aborted(u64, ErrorCode),

    #[error("File system error on {path}: {source}")]
    FileSystem {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Malformed backup file section: {0}")]
    MalformedSection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        BackupError::Io(Arc::new(e))
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for BackupError {
    fn clone(&self) -> Self {
        match self {
            BackupError::Io(e) => BackupError::Io(Arc::clone(e)),
            BackupError::InvalidConfig(s) => BackupError::InvalidConfig(s.clone()),
            BackupError::BufferSetup(s) => BackupError::BufferSetup(s),
            BackupError::Rejected(c) => BackupError::Rejected(*c),
            BackupError::Aborted(id, c) => BackupError::Aborted(*id, *c),
            BackupError::FileSystem { path, source } => BackupError::FileSystem {
                path: path.clone(),
                source: Arc::clone(source),
            },
            BackupError::MalformedSection(s) => BackupError::MalformedSection(s.clone()),
            BackupError::Internal(s) => BackupError::Internal(s.clone()),
        }
    }
}

/// Wire-level error codes carried inside Ref and AbortBackupOrd signals.
///
/// A Backup record keeps the *first* code it observes; later codes are
/// suppressed so the root cause survives the abort cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorCode {
    /// No error recorded yet.
    None,
    /// Backup requested on a diskless node.
    Diskless,
    /// The request carried an inline data specification, which is unimplemented.
    InlineDataSpec,
    /// The request reached a node that is not the designated master.
    NotMaster,
    /// The cluster sequence service failed permanently.
    SequenceFailure,
    /// A Backup/Table/Fragment/Trigger/File record could not be seized.
    OutOfRecords,
    /// Buffer page allocation or FlowBuffer setup failed.
    OutOfBuffers,
    /// The control-file buffer had no room for the header or table list.
    NoRoomInControlFile,
    /// Table enumeration or descriptor fetch failed.
    DictionaryFailure,
    /// Fragment placement lookup failed.
    DistributionFailure,
    /// Trigger installation failed.
    TriggerCreateFailure,
    /// Trigger removal failed.
    TriggerDropFailure,
    /// A fragment scan failed permanently.
    ScanFailure,
    /// StopBackup carried cut points without a full gci boundary between them.
    InvalidCutPoints,
    /// A file-system open/append/close failed.
    FileSystemFailure,
    /// A trigger firing could not fit in the log buffer.
    LogBufferFull,
    /// A participating node died during the backup.
    NodeFailure,
    /// A participant runs an incompatible binary version.
    IncompatibleVersions,
    /// The client requested cancellation.
    ClientAbort,
}

impl ErrorCode {
    pub fn is_set(self) -> bool {
        self != ErrorCode::None
    }
}

/// The reason carried by an AbortBackupOrd fan-out.
///
/// `BackupComplete` travels on the same signal: the final ordered shutdown of
/// a successful backup reuses the abort path to tear down slave resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum AbortReason {
    ClientAbort,
    BackupComplete,
    BackupFailure,
    BackupFailureDueToNodeFail,
    LogBufferFull,
    FileOrScanError,
    AbortScan,
    IncompatibleVersions,
}

impl AbortReason {
    /// The error code recorded on a Backup when this abort reason is the
    /// first failure observed. `BackupComplete` never records an error.
    pub fn error_code(self) -> ErrorCode {
        match self {
            AbortReason::ClientAbort => ErrorCode::ClientAbort,
            AbortReason::BackupComplete => ErrorCode::None,
            AbortReason::BackupFailure => ErrorCode::FileSystemFailure,
            AbortReason::BackupFailureDueToNodeFail => ErrorCode::NodeFailure,
            AbortReason::LogBufferFull => ErrorCode::LogBufferFull,
            AbortReason::FileOrScanError => ErrorCode::ScanFailure,
            AbortReason::AbortScan => ErrorCode::NodeFailure,
            AbortReason::IncompatibleVersions => ErrorCode::IncompatibleVersions,
        }
    }
}

// src/core/events.rs

//! The cluster event channel for backup lifecycle reports.
//!
//! Every node publishes Started/Completed/Aborted/FailedToStart reports for
//! human visibility; management tooling subscribes through `EventBus`.

use crate::core::errors::ErrorCode;
use crate::core::signals::{BackupId, NodeSet};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUS_CAPACITY: usize = 1024;

/// A backup lifecycle report.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Started {
        backup_id: BackupId,
        nodes: NodeSet,
    },
    Completed {
        backup_id: BackupId,
        start_gcp: u32,
        stop_gcp: u32,
        bytes: u64,
        records: u64,
        log_bytes: u64,
        log_records: u64,
    },
    Aborted {
        backup_id: BackupId,
        error: ErrorCode,
    },
    FailedToStart {
        error: ErrorCode,
    },
}

/// One-to-many distribution of backup events on a node.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: BackupEvent) {
        if self.sender.send(event).is_err() {
            debug!("published a backup event with no active subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

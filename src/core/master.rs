// src/core/master.rs

//! The backup coordinator.
//!
//! One node at a time is master for a given backup: it draws the backup id
//! from the cluster sequence, serialises definition behind the two cluster
//! mutexes, fans the phase requests out to every participant, picks the two
//! GCP cut points, schedules fragment scans with one outstanding fragment
//! per node, and owns abort propagation. Coordinator state lives beside the
//! shared Backup record and is instantiated on demand — at request time, or
//! when master failover promotes this node.

use crate::core::errors::{AbortReason, ErrorCode};
use crate::core::events::BackupEvent;
use crate::core::node::{BackupNode, PendingBackup};
use crate::core::records::{Backup, MasterData, MasterGsn};
use crate::core::signals::{
    BackupId, BackupReqFlags, ClientHandle, ClientReply, ContinueB, MutexId, NodeId, NodeSet,
    Signal,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Transient sequence failures are retried this many times.
const MAX_SEQUENCE_RETRIES: u32 = 3;
const SEQUENCE_RETRY_DELAY: Duration = Duration::from_millis(300);

/// The stop barrier keeps waiting until this many gcis lie past the start
/// cut point, guaranteeing a full boundary after the last scan.
const STOP_GCP_MARGIN: u32 = 3;

fn wall_clock_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// The abort reason broadcast for a recorded error code.
fn abort_reason_for(error: ErrorCode) -> AbortReason {
    match error {
        ErrorCode::NodeFailure => AbortReason::BackupFailureDueToNodeFail,
        ErrorCode::LogBufferFull => AbortReason::LogBufferFull,
        ErrorCode::ClientAbort => AbortReason::ClientAbort,
        ErrorCode::ScanFailure | ErrorCode::FileSystemFailure => AbortReason::FileOrScanError,
        ErrorCode::IncompatibleVersions => AbortReason::IncompatibleVersions,
        _ => AbortReason::BackupFailure,
    }
}

enum Role {
    Bystander,
    TakeOver,
    MasterSurvived(Vec<NodeId>),
}

impl BackupNode {
    // ------------------------------------------------------------------
    // BackupReq: acquire an identity
    // ------------------------------------------------------------------

    pub(crate) fn handle_backup_req(
        &mut self,
        client: ClientHandle,
        flags: BackupReqFlags,
        backup_data_len: u32,
        input_backup_id: Option<BackupId>,
    ) {
        let reject = if self.config.diskless {
            Some(ErrorCode::Diskless)
        } else if backup_data_len != 0 {
            Some(ErrorCode::InlineDataSpec)
        } else if self.node_id != self.master_node {
            Some(ErrorCode::NotMaster)
        } else if self.peer_versions_mismatch() {
            Some(ErrorCode::IncompatibleVersions)
        } else {
            None
        };
        if let Some(error) = reject {
            warn!("rejecting backup request: {error}");
            client.send(ClientReply::BackupRef { error });
            self.events.publish(BackupEvent::FailedToStart { error });
            return;
        }

        match input_backup_id {
            // An explicit id skips the sequence service.
            Some(backup_id) => self.start_master_backup(client, flags, backup_id),
            None => {
                let token = self.allocate_token();
                self.pending_requests.insert(
                    token,
                    PendingBackup {
                        client,
                        flags,
                        retries: 0,
                    },
                );
                self.spawn_sequence_next(token);
            }
        }
    }

    fn peer_versions_mismatch(&self) -> bool {
        let mine = self
            .nodes
            .get(&self.node_id)
            .map(|e| e.version)
            .unwrap_or_default();
        self.nodes.values().any(|e| e.alive && e.version != mine)
    }

    pub(crate) fn handle_util_sequence_conf(&mut self, token: u32, value: u64) {
        let Some(pending) = self.pending_requests.remove(&token) else {
            debug!("sequence reply for unknown token {token}");
            return;
        };
        self.start_master_backup(pending.client, pending.flags, value);
    }

    pub(crate) fn handle_util_sequence_ref(&mut self, token: u32, transient: bool) {
        let retry = match self.pending_requests.get_mut(&token) {
            None => return,
            Some(pending) if transient && pending.retries < MAX_SEQUENCE_RETRIES => {
                pending.retries += 1;
                true
            }
            Some(_) => false,
        };
        if retry {
            self.post_self_delayed(
                Signal::ContinueB(ContinueB::RetrySequence { token }),
                SEQUENCE_RETRY_DELAY,
            );
            return;
        }
        let pending = self.pending_requests.remove(&token).expect("checked above");
        warn!("backup id sequence failed permanently");
        pending.client.send(ClientReply::BackupRef {
            error: ErrorCode::SequenceFailure,
        });
        self.events.publish(BackupEvent::FailedToStart {
            error: ErrorCode::SequenceFailure,
        });
    }

    pub(crate) fn handle_retry_sequence(&mut self, token: u32) {
        if self.pending_requests.contains_key(&token) {
            self.spawn_sequence_next(token);
        }
    }

    /// Seizes the coordinator's record and begins mutex acquisition.
    fn start_master_backup(
        &mut self,
        client: ClientHandle,
        flags: BackupReqFlags,
        backup_id: BackupId,
    ) {
        if self.backups.contains_key(&backup_id) {
            client.send(ClientReply::BackupRef {
                error: ErrorCode::OutOfRecords,
            });
            return;
        }
        let backup_key = (self.node_id, wall_clock_millis());
        let nodes: NodeSet = self.alive_nodes().collect();
        let mut backup = Backup::new(backup_id, backup_key, flags, nodes, self.node_id);
        backup.client = Some(client);
        self.backups.insert(backup_id, backup);
        self.masters.insert(
            backup_id,
            MasterData {
                gsn: Some(MasterGsn::UtilSequence),
                ..MasterData::new()
            },
        );
        info!(
            "backup {backup_id}: coordinating from node {}, key {backup_key:?}",
            self.node_id
        );
        self.spawn_mutex_lock(backup_id, MutexId::BackupDefine);
    }

    // ------------------------------------------------------------------
    // Mutexes and DefineBackup fan-out
    // ------------------------------------------------------------------

    pub(crate) fn handle_mutex_locked(&mut self, backup_id: BackupId, mutex: MutexId) {
        let aborting = match self.masters.get(&backup_id) {
            // The backup died while the lock was in flight; hand it back.
            None => {
                self.services.mutex.unlock(mutex);
                return;
            }
            Some(md) => md.gsn == Some(MasterGsn::AbortBackup),
        };
        if aborting {
            self.services.mutex.unlock(mutex);
            return;
        }

        match mutex {
            MutexId::BackupDefine => {
                let md = self.masters.get_mut(&backup_id).expect("checked above");
                md.define_mutex_locked = true;
                self.spawn_mutex_lock(backup_id, MutexId::DictCommitTable);
            }
            MutexId::DictCommitTable => {
                let Some(backup) = self.backups.get(&backup_id) else {
                    self.services.mutex.unlock(mutex);
                    return;
                };
                let backup_key = backup.backup_key;
                let nodes = backup.nodes.clone();
                let flags = backup.flags;
                let client = backup.client.clone();
                {
                    let md = self.masters.get_mut(&backup_id).expect("checked above");
                    md.dict_mutex_locked = true;
                    md.gsn = Some(MasterGsn::DefineBackup);
                    md.reply_set = nodes.clone();
                }
                let master = self.node_id;
                for node in nodes.iter().copied() {
                    if node == master {
                        // Local participant: executed direct, skipping the bus.
                        self.handle_define_backup_req(
                            backup_id,
                            backup_key,
                            master,
                            nodes.clone(),
                            flags,
                            client.clone(),
                        );
                    } else {
                        self.send_to(
                            node,
                            Signal::DefineBackupReq {
                                backup_id,
                                backup_key,
                                master,
                                nodes: nodes.clone(),
                                flags,
                                client: client.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    pub(crate) fn handle_mutex_lock_failed(&mut self, backup_id: BackupId, mutex: MutexId) {
        warn!("backup {backup_id}: failed to lock {mutex}");
        self.master_abort(backup_id, ErrorCode::OutOfRecords);
    }

    fn unlock_mutexes(&mut self, backup_id: BackupId) {
        let Some(md) = self.masters.get_mut(&backup_id) else {
            return;
        };
        if md.define_mutex_locked {
            md.define_mutex_locked = false;
            self.services.mutex.unlock(MutexId::BackupDefine);
        }
        let Some(md) = self.masters.get_mut(&backup_id) else {
            return;
        };
        if md.dict_mutex_locked {
            md.dict_mutex_locked = false;
            self.services.mutex.unlock(MutexId::DictCommitTable);
        }
    }

    pub(crate) fn handle_define_backup_conf(&mut self, backup_id: BackupId, node: NodeId) {
        let all_in = {
            let Some(md) = self.master_at(backup_id, MasterGsn::DefineBackup) else {
                debug!("backup {backup_id}: stray define conf from {node}");
                return;
            };
            md.reply_set.remove(&node);
            md.reply_set.is_empty()
        };
        if !all_in {
            return;
        }
        self.unlock_mutexes(backup_id);

        let nodes = {
            let Some(backup) = self.backups.get(&backup_id) else {
                return;
            };
            let nodes = backup.nodes.clone();
            if let Some(client) = &backup.client {
                client.send(ClientReply::BackupConf {
                    backup_id,
                    nodes: nodes.clone(),
                });
            }
            self.events.publish(BackupEvent::Started {
                backup_id,
                nodes: nodes.clone(),
            });
            nodes
        };
        {
            let md = self.masters.get_mut(&backup_id).expect("checked above");
            md.conf_sent = true;
            md.gsn = Some(MasterGsn::StartBackup);
            md.reply_set = nodes.clone();
        }
        info!("backup {backup_id}: defined on all nodes, starting");
        for node in nodes {
            if node == self.node_id {
                self.handle_start_backup_req(backup_id);
            } else {
                self.send_to(node, Signal::StartBackupReq { backup_id });
            }
        }
    }

    pub(crate) fn handle_define_backup_ref(
        &mut self,
        backup_id: BackupId,
        node: NodeId,
        error: ErrorCode,
    ) {
        warn!("backup {backup_id}: define refused by node {node}: {error}");
        if let Some(md) = self.master_at(backup_id, MasterGsn::DefineBackup) {
            md.reply_set.remove(&node);
        }
        self.master_abort(backup_id, error);
    }

    // ------------------------------------------------------------------
    // StartBackup fan-in and the start cut point
    // ------------------------------------------------------------------

    pub(crate) fn handle_start_backup_conf(&mut self, backup_id: BackupId, node: NodeId) {
        let all_in = {
            let Some(md) = self.master_at(backup_id, MasterGsn::StartBackup) else {
                debug!("backup {backup_id}: stray start conf from {node}");
                return;
            };
            md.reply_set.remove(&node);
            md.reply_set.is_empty()
        };
        if all_in {
            let md = self.masters.get_mut(&backup_id).expect("checked above");
            md.gsn = Some(MasterGsn::WaitGcpStart);
            self.spawn_wait_gcp(backup_id);
        }
    }

    pub(crate) fn handle_start_backup_ref(
        &mut self,
        backup_id: BackupId,
        node: NodeId,
        error: ErrorCode,
    ) {
        warn!("backup {backup_id}: start refused by node {node}: {error}");
        if let Some(md) = self.master_at(backup_id, MasterGsn::StartBackup) {
            md.reply_set.remove(&node);
        }
        self.master_abort(backup_id, error);
    }

    pub(crate) fn handle_wait_gcp_conf(&mut self, backup_id: BackupId, gci: u32) {
        enum Next {
            Fragments,
            WaitAgain,
            StopFanOut(u32, u32, NodeSet),
            Ignore,
        }
        let next = {
            let Some(md) = self.masters.get_mut(&backup_id) else {
                return;
            };
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            match md.gsn {
                Some(MasterGsn::WaitGcpStart) => {
                    backup.start_gcp = gci;
                    md.gsn = Some(MasterGsn::BackupFragment);
                    info!("backup {backup_id}: start cut point at gci {gci}");
                    Next::Fragments
                }
                Some(MasterGsn::WaitGcpStop) => {
                    // Loop until a full boundary lies behind every scan.
                    if gci < backup.start_gcp + STOP_GCP_MARGIN {
                        Next::WaitAgain
                    } else {
                        backup.stop_gcp = gci;
                        md.gsn = Some(MasterGsn::StopBackup);
                        md.reply_set = backup.nodes.clone();
                        info!("backup {backup_id}: stop cut point at gci {gci}");
                        Next::StopFanOut(backup.start_gcp, gci, backup.nodes.clone())
                    }
                }
                _ => Next::Ignore,
            }
        };
        match next {
            Next::Fragments => self.send_next_fragments(backup_id),
            Next::WaitAgain => self.spawn_wait_gcp(backup_id),
            Next::StopFanOut(start_gcp, stop_gcp, nodes) => {
                for node in nodes {
                    if node == self.node_id {
                        self.handle_stop_backup_req(backup_id, start_gcp, stop_gcp);
                    } else {
                        self.send_to(
                            node,
                            Signal::StopBackupReq {
                                backup_id,
                                start_gcp,
                                stop_gcp,
                            },
                        );
                    }
                }
            }
            Next::Ignore => debug!("backup {backup_id}: stray WaitGcpConf ignored"),
        }
    }

    pub(crate) fn handle_wait_gcp_ref(&mut self, backup_id: BackupId) {
        self.master_abort(backup_id, ErrorCode::DistributionFailure);
    }

    // ------------------------------------------------------------------
    // Fragment scheduling
    // ------------------------------------------------------------------

    /// Dispatches fragments to idle owners until every fragment is scanned
    /// or scanning, or all nodes are busy. Fragments are visited in
    /// (tableId, fragmentId) order.
    fn send_next_fragments(&mut self, backup_id: BackupId) {
        enum Outcome {
            Dispatch(Vec<(NodeId, u32, u32)>),
            AllScanned,
            Wait,
        }
        let outcome = {
            let Some(md) = self.masters.get_mut(&backup_id) else {
                return;
            };
            if md.gsn != Some(MasterGsn::BackupFragment) {
                return;
            }
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let alive: NodeSet = self
                .nodes
                .iter()
                .filter(|(_, e)| e.alive)
                .map(|(&n, _)| n)
                .collect();
            let mut dispatch = Vec::new();
            let mut unfinished = false;
            for table in &mut backup.tables {
                for fragment in &mut table.fragments {
                    if fragment.scanned {
                        continue;
                    }
                    if fragment.scanning {
                        unfinished = true;
                        continue;
                    }
                    unfinished = true;
                    if !alive.contains(&fragment.node) || md.busy.contains(&fragment.node) {
                        continue;
                    }
                    fragment.scanning = true;
                    md.busy.insert(fragment.node);
                    dispatch.push((fragment.node, table.table_id, fragment.fragment_id));
                }
            }
            if dispatch.is_empty() {
                if unfinished { Outcome::Wait } else { Outcome::AllScanned }
            } else {
                Outcome::Dispatch(dispatch)
            }
        };

        match outcome {
            Outcome::Wait => {}
            Outcome::AllScanned => {
                info!("backup {backup_id}: all fragments scanned");
                if let Some(md) = self.masters.get_mut(&backup_id) {
                    md.gsn = Some(MasterGsn::WaitGcpStop);
                }
                self.spawn_wait_gcp(backup_id);
            }
            Outcome::Dispatch(dispatch) => {
                for (node, table_id, fragment_no) in dispatch {
                    if node == self.node_id {
                        self.handle_backup_fragment_req(backup_id, table_id, fragment_no);
                    } else {
                        self.send_to(
                            node,
                            Signal::BackupFragmentReq {
                                backup_id,
                                table_id,
                                fragment_no,
                            },
                        );
                    }
                }
            }
        }
    }

    pub(crate) fn handle_backup_fragment_conf(
        &mut self,
        backup_id: BackupId,
        node: NodeId,
        table_id: u32,
        fragment_no: u32,
        records: u64,
        bytes: u64,
    ) {
        {
            let Some(md) = self.masters.get_mut(&backup_id) else {
                debug!("fragment conf for unknown backup {backup_id}; ignored");
                return;
            };
            if md.gsn != Some(MasterGsn::BackupFragment) {
                // A conf can trail an abort; log and ignore, consistently.
                debug!("backup {backup_id}: late fragment conf ignored");
                return;
            }
            md.busy.remove(&node);
        }
        let rebroadcast = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            backup.records += records;
            backup.bytes += bytes;
            if let Some(table_idx) = backup.table_by_id(table_id) {
                if let Some(fragment) = backup.tables[table_idx]
                    .fragments
                    .get_mut(fragment_no as usize)
                {
                    fragment.scanning = false;
                    fragment.scanned = true;
                    fragment.records = records;
                }
            }
            backup
                .nodes
                .iter()
                .copied()
                .filter(|&n| n != node && n != self.node_id)
                .collect::<Vec<_>>()
        };
        for peer in rebroadcast {
            self.send_to(
                peer,
                Signal::BackupFragmentCompleteRep {
                    backup_id,
                    table_id,
                    fragment_no,
                    records,
                    bytes,
                },
            );
        }
        self.send_next_fragments(backup_id);
    }

    pub(crate) fn handle_backup_fragment_ref(
        &mut self,
        backup_id: BackupId,
        node: NodeId,
        table_id: u32,
        fragment_no: u32,
        error: ErrorCode,
    ) {
        warn!(
            "backup {backup_id}: fragment ({table_id}, {fragment_no}) refused by node {node}: {error}"
        );
        if let Some(md) = self.masters.get_mut(&backup_id) {
            md.busy.remove(&node);
        }
        if let Some(backup) = self.backups.get_mut(&backup_id) {
            if let Some(table_idx) = backup.table_by_id(table_id) {
                if let Some(fragment) = backup.tables[table_idx]
                    .fragments
                    .get_mut(fragment_no as usize)
                {
                    fragment.scanning = false;
                }
            }
        }
        self.master_abort(backup_id, error);
    }

    // ------------------------------------------------------------------
    // StopBackup fan-in and completion
    // ------------------------------------------------------------------

    pub(crate) fn handle_stop_backup_conf(
        &mut self,
        backup_id: BackupId,
        node: NodeId,
        log_bytes: u64,
        log_records: u64,
    ) {
        let all_in = {
            let Some(md) = self.master_at(backup_id, MasterGsn::StopBackup) else {
                debug!("backup {backup_id}: late stop conf ignored");
                return;
            };
            md.reply_set.remove(&node);
            md.reply_set.is_empty()
        };
        if let Some(backup) = self.backups.get_mut(&backup_id) {
            // The coordinator's own totals were accumulated locally as the
            // log was written; remote slaves report theirs here.
            if node != self.node_id {
                backup.log_bytes += log_bytes;
                backup.log_records += log_records;
            }
        }
        if all_in {
            self.complete_backup(backup_id);
        }
    }

    pub(crate) fn handle_stop_backup_ref(
        &mut self,
        backup_id: BackupId,
        node: NodeId,
        error: ErrorCode,
    ) {
        warn!("backup {backup_id}: stop refused by node {node}: {error}");
        if let Some(md) = self.master_at(backup_id, MasterGsn::StopBackup) {
            md.reply_set.remove(&node);
        }
        self.master_abort(backup_id, error);
    }

    fn complete_backup(&mut self, backup_id: BackupId) {
        let (client, report, remotes) = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let report = BackupEvent::Completed {
                backup_id,
                start_gcp: backup.start_gcp,
                stop_gcp: backup.stop_gcp,
                bytes: backup.bytes,
                records: backup.records,
                log_bytes: backup.log_bytes,
                log_records: backup.log_records,
            };
            let reply = ClientReply::BackupCompleteRep {
                backup_id,
                start_gcp: backup.start_gcp,
                stop_gcp: backup.stop_gcp,
                bytes: backup.bytes,
                records: backup.records,
                log_bytes: backup.log_bytes,
                log_records: backup.log_records,
                nodes: backup.nodes.clone(),
            };
            let client = if backup.flags.contains(BackupReqFlags::WAIT_COMPLETED) {
                backup.client.clone().map(|c| (c, reply))
            } else {
                None
            };
            let remotes: Vec<NodeId> = backup
                .nodes
                .iter()
                .copied()
                .filter(|&n| n != self.node_id)
                .collect();
            (client, report, remotes)
        };

        info!("backup {backup_id}: complete");
        if let Some((client, reply)) = client {
            client.send(reply);
        }
        self.events.publish(report);
        for node in remotes {
            self.send_to(
                node,
                Signal::AbortBackupOrd {
                    backup_id,
                    reason: AbortReason::BackupComplete,
                },
            );
        }
        self.masters.remove(&backup_id);
        // Local participant last; this releases the shared record.
        self.handle_abort_backup_ord(self.node_id, backup_id, AbortReason::BackupComplete);
    }

    // ------------------------------------------------------------------
    // Abort and node failure
    // ------------------------------------------------------------------

    /// Records the first error, quiesces the current phase, reports to the
    /// client, and fans the abort out. Idempotent.
    pub(crate) fn master_abort(&mut self, backup_id: BackupId, error: ErrorCode) {
        {
            let Some(md) = self.masters.get_mut(&backup_id) else {
                return;
            };
            if md.gsn == Some(MasterGsn::AbortBackup) {
                return;
            }
            md.gsn = Some(MasterGsn::AbortBackup);
            md.busy.clear();
            md.reply_set.clear();
        }
        self.unlock_mutexes(backup_id);

        let conf_sent = self.masters.get(&backup_id).map(|md| md.conf_sent).unwrap_or(false);
        let (first_error, client, remotes) = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            backup.record_error(error);
            (
                backup.error,
                backup.client.take(),
                backup
                    .nodes
                    .iter()
                    .copied()
                    .filter(|&n| n != self.node_id)
                    .collect::<Vec<_>>(),
            )
        };

        warn!("backup {backup_id}: master abort, error {first_error}");
        if let Some(client) = client {
            if conf_sent {
                client.send(ClientReply::BackupAbortRep {
                    backup_id,
                    reason: first_error,
                });
            } else {
                client.send(ClientReply::BackupRef { error: first_error });
            }
        }
        if conf_sent {
            self.events.publish(BackupEvent::Aborted {
                backup_id,
                error: first_error,
            });
        } else {
            self.events
                .publish(BackupEvent::FailedToStart { error: first_error });
        }

        let reason = abort_reason_for(first_error);
        for node in remotes {
            if self.node_is_alive(node) {
                self.send_to(node, Signal::AbortBackupOrd { backup_id, reason });
            }
        }
        self.masters.remove(&backup_id);
        // Local teardown last, via the same ordered path the slaves take.
        self.handle_abort_backup_ord(self.node_id, backup_id, reason);
    }

    /// Cluster membership update: drop the dead, fail their outstanding
    /// expectations, and take over coordination if the master died.
    pub(crate) fn handle_node_fail_rep(&mut self, failed: &NodeSet, new_master: NodeId) {
        for node in failed {
            if let Some(entry) = self.nodes.get_mut(node) {
                entry.alive = false;
            }
        }
        self.master_node = new_master;
        info!("node failure: {failed:?} dead, coordinator is now {new_master}");

        let ids: Vec<BackupId> = self.backups.keys().copied().collect();
        for backup_id in ids {
            let role = {
                let Some(backup) = self.backups.get_mut(&backup_id) else {
                    continue;
                };
                let lost: Vec<NodeId> = backup
                    .nodes
                    .iter()
                    .copied()
                    .filter(|n| failed.contains(n))
                    .collect();
                for n in &lost {
                    backup.nodes.remove(n);
                }
                if lost.is_empty() {
                    continue;
                }
                if failed.contains(&backup.master) {
                    backup.master = new_master;
                    if new_master == self.node_id {
                        Role::TakeOver
                    } else {
                        Role::Bystander
                    }
                } else if backup.master == self.node_id {
                    Role::MasterSurvived(lost)
                } else {
                    Role::Bystander
                }
            };
            match role {
                Role::Bystander => {}
                Role::TakeOver => {
                    // Reconstruct the coordinator phase from the local slave
                    // state, with nothing waited on, then abort cluster-wide.
                    info!("backup {backup_id}: taking over as coordinator");
                    let gsn = self
                        .backups
                        .get(&backup_id)
                        .and_then(|b| b.takeover_gsn());
                    self.masters.insert(
                        backup_id,
                        MasterData {
                            gsn,
                            conf_sent: true,
                            ..MasterData::new()
                        },
                    );
                    self.master_abort(backup_id, ErrorCode::NodeFailure);
                }
                Role::MasterSurvived(lost) => {
                    self.fail_lost_participants(backup_id, &lost);
                }
            }
        }
    }

    /// Injects synthetic Refs from each dead participant so the fan-in
    /// counters of the current phase complete. The Refs are dispatched on a
    /// later loop iteration like any other signal; their handlers do the
    /// reply-set and scan bookkeeping and then run masterAbort.
    fn fail_lost_participants(&mut self, backup_id: BackupId, lost: &[NodeId]) {
        let gsn = self.masters.get(&backup_id).and_then(|md| md.gsn);
        let scanning = {
            let Some(backup) = self.backups.get(&backup_id) else {
                return;
            };
            let mut scanning = Vec::new();
            for table in &backup.tables {
                for fragment in &table.fragments {
                    if fragment.scanning && lost.contains(&fragment.node) {
                        scanning.push((fragment.node, table.table_id, fragment.fragment_id));
                    }
                }
            }
            scanning
        };

        for &node in lost {
            match gsn {
                Some(MasterGsn::DefineBackup) => self.post_self(Signal::DefineBackupRef {
                    backup_id,
                    node,
                    error: ErrorCode::NodeFailure,
                }),
                Some(MasterGsn::StartBackup) => self.post_self(Signal::StartBackupRef {
                    backup_id,
                    node,
                    error: ErrorCode::NodeFailure,
                }),
                Some(MasterGsn::BackupFragment) => {
                    for &(owner, table_id, fragment_no) in &scanning {
                        if owner == node {
                            self.post_self(Signal::BackupFragmentRef {
                                backup_id,
                                node,
                                table_id,
                                fragment_no,
                                error: ErrorCode::NodeFailure,
                            });
                        }
                    }
                }
                Some(MasterGsn::StopBackup) => self.post_self(Signal::StopBackupRef {
                    backup_id,
                    node,
                    error: ErrorCode::NodeFailure,
                }),
                _ => {}
            }
        }
    }

    /// The coordinator state, only while it is in the given phase.
    fn master_at(&mut self, backup_id: BackupId, gsn: MasterGsn) -> Option<&mut MasterData> {
        self.masters
            .get_mut(&backup_id)
            .filter(|md| md.gsn == Some(gsn))
    }
}

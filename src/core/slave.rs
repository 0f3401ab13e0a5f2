// src/core/slave.rs

//! The per-node participant engine.
//!
//! A slave accepts the master's phase requests — DefineBackup, StartBackup,
//! BackupFragment, StopBackup, AbortBackup — and drives table enumeration,
//! trigger installation, fragment scanning, change-log assembly, and file
//! teardown on its own node. The slave state machine is the source of truth
//! for the backup's progress on this node.

use crate::core::errors::{AbortReason, ErrorCode};
use crate::core::format::sections::{
    FileHeader, FragmentFooter, FragmentHeader, FragmentInfo, GcpEntry, LogEntry, TableDescription,
    TableList,
};
use crate::core::format::{CLUSTER_VERSION, LogEventType, SERVER_VERSION};
use crate::core::node::BackupNode;
use crate::core::records::{
    Backup, CTL_FILE, DATA_FILE, FileFlags, Fragment, LOG_FILE, PendingLogEntry, SlaveState, Table,
};
use crate::core::services::{
    CreateTriggerReq, ScanCursor, ScanErrorCode, ScanFragReq, SubscriptionKind, TableBrief,
    TableMeta,
};
use crate::core::signals::{
    AttrKind, BackupId, BackupReqFlags, ClientHandle, ContinueB, NodeId, NodeSet, Signal,
    TriggerEvent,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rows requested per scan batch.
const SCAN_BATCH_SIZE: u32 = 16;
/// Transient scan errors are retried this many times.
const MAX_SCAN_RETRIES: u32 = 10;
const SCAN_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Delay before re-trying a fragment request that found the buffer full.
const FRAGMENT_REQUEUE_DELAY: Duration = Duration::from_millis(50);
/// Delay before re-fetching a descriptor that found the control buffer full.
const META_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Delay before re-trying a fragment-info write on a full control buffer.
const FRAGMENT_INFO_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Delay before asking the parked scan cursor for its next batch.
const SCAN_NEXT_DELAY: Duration = Duration::from_millis(50);

/// Worst-case log entry: length word, three header words, a full row, the
/// gci word and the undo length echo.
fn max_log_entry_words(max_row_words: u32) -> usize {
    6 + max_row_words as usize
}

/// One bit per attribute, word-packed, all attributes included.
fn full_attribute_mask(attr_count: u32) -> Vec<u32> {
    let mut mask = vec![u32::MAX; (attr_count as usize).div_ceil(32)];
    let tail_bits = attr_count % 32;
    if tail_bits != 0 {
        if let Some(last) = mask.last_mut() {
            *last = (1u32 << tail_bits) - 1;
        }
    }
    mask
}

impl BackupNode {
    // ------------------------------------------------------------------
    // DefineBackup
    // ------------------------------------------------------------------

    pub(crate) fn handle_define_backup_req(
        &mut self,
        backup_id: BackupId,
        backup_key: (u32, u32),
        master: NodeId,
        nodes: NodeSet,
        flags: BackupReqFlags,
        client: Option<ClientHandle>,
    ) {
        let node = self.node_id;
        if self.config.diskless {
            self.send_to(
                master,
                Signal::DefineBackupRef {
                    backup_id,
                    node,
                    error: ErrorCode::Diskless,
                },
            );
            return;
        }
        match self.backups.get_mut(&backup_id) {
            None => {
                let mut backup = Backup::new(backup_id, backup_key, flags, nodes, master);
                backup.client = client;
                backup.set_state(SlaveState::Defining);
                self.backups.insert(backup_id, backup);
            }
            // The coordinator seized its own record before the fan-out; the
            // local define reuses it.
            Some(existing)
                if existing.master == node && existing.state() == SlaveState::Initial =>
            {
                existing.set_state(SlaveState::Defining);
            }
            Some(_) => {
                self.send_to(
                    master,
                    Signal::DefineBackupRef {
                        backup_id,
                        node,
                        error: ErrorCode::OutOfRecords,
                    },
                );
                return;
            }
        }

        info!("backup {backup_id}: defining on node {node}, master {master}");
        if let Err(code) = self.open_backup_files(backup_id) {
            self.define_backup_ref(backup_id, code);
        }
    }

    /// Reports a define failure to the master and tears down locally.
    pub(crate) fn define_backup_ref(&mut self, backup_id: BackupId, error: ErrorCode) {
        let node = self.node_id;
        let Some(backup) = self.backups.get_mut(&backup_id) else {
            return;
        };
        backup.record_error(error);
        let master = backup.master;
        warn!("backup {backup_id}: define failed on node {node}: {error}");
        self.send_to(
            master,
            Signal::DefineBackupRef {
                backup_id,
                node,
                error,
            },
        );
        self.begin_local_abort(backup_id);
    }

    pub(crate) fn handle_fs_open_conf(&mut self, backup_id: BackupId, file_idx: usize, handle: u64) {
        let (opened_all, close_now) = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let file = &mut backup.files[file_idx];
            file.handle = Some(handle);
            file.flags.remove(FileFlags::OPENING);
            file.flags |= FileFlags::OPEN;
            if file.close_requested {
                // An abort raced the open; close straight back.
                file.close_requested = false;
                file.flags.remove(FileFlags::OPEN);
                file.flags |= FileFlags::CLOSING;
                let remove =
                    file.flags.contains(FileFlags::REMOVE_ON_CLOSE) || file.error.is_set();
                (false, Some((handle, remove)))
            } else {
                backup.define.files_opening -= 1;
                (
                    backup.define.files_opening == 0
                        && backup.state() == SlaveState::Defining,
                    None,
                )
            }
        };

        if let Some((handle, remove)) = close_now {
            self.spawn_fs_close(backup_id, file_idx, handle, remove);
            return;
        }
        if !opened_all {
            return;
        }

        // All three files are open: frame them and enumerate tables.
        if !self.insert_file_headers(backup_id) {
            self.define_backup_ref(backup_id, ErrorCode::NoRoomInControlFile);
            return;
        }
        self.start_file_thread(backup_id, CTL_FILE);
        self.spawn_list_tables(backup_id);
    }

    pub(crate) fn handle_fs_open_ref(&mut self, backup_id: BackupId, file_idx: usize) {
        let state = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let file = &mut backup.files[file_idx];
            file.flags.remove(FileFlags::OPENING);
            file.error = ErrorCode::FileSystemFailure;
            backup.state()
        };
        match state {
            SlaveState::Defining => {
                self.define_backup_ref(backup_id, ErrorCode::FileSystemFailure)
            }
            SlaveState::Aborting => self.maybe_release_aborted(backup_id),
            other => debug!("backup {backup_id}: open failed in state {other}"),
        }
    }

    fn insert_file_headers(&mut self, backup_id: BackupId) -> bool {
        let Some(backup) = self.backups.get_mut(&backup_id) else {
            return false;
        };
        let backup_key = backup.backup_key;
        for file in &mut backup.files {
            let header = FileHeader {
                file_type: file.file_type,
                backup_id: backup_id as u32,
                backup_key,
                cluster_version: CLUSTER_VERSION,
                server_version: SERVER_VERSION,
            };
            let mut words = Vec::new();
            header.encode(&mut words);
            if !file.buffer.push_words(&words) {
                return false;
            }
        }
        true
    }

    pub(crate) fn handle_list_tables_conf(&mut self, backup_id: BackupId, tables: Vec<TableBrief>) {
        {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Defining {
                return;
            }
            backup.tables = tables
                .iter()
                .filter(|b| b.online && b.table_type.is_backed_up())
                .map(Table::from_brief)
                .collect();

            let list = TableList {
                table_ids: backup.tables.iter().map(|t| t.table_id).collect(),
            };
            let ctl = &mut backup.files[CTL_FILE];
            if list.encoded_words() > ctl.buffer.max_write() {
                self.define_backup_ref(backup_id, ErrorCode::NoRoomInControlFile);
                return;
            }
            let mut words = Vec::new();
            list.encode(&mut words);
            if !ctl.buffer.push_words(&words) {
                self.define_backup_ref(backup_id, ErrorCode::NoRoomInControlFile);
                return;
            }
            backup.define.next_meta = 0;
        }
        self.advance_define_meta(backup_id);
    }

    pub(crate) fn handle_list_tables_ref(&mut self, backup_id: BackupId) {
        self.define_backup_ref(backup_id, ErrorCode::DictionaryFailure);
    }

    /// Fetches and writes table descriptors one table at a time.
    fn advance_define_meta(&mut self, backup_id: BackupId) {
        let next = {
            let Some(backup) = self.backups.get(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Defining {
                return;
            }
            let idx = backup.define.next_meta;
            backup.tables.get(idx).map(|t| (idx, t.table_id))
        };
        match next {
            Some((table_idx, table_id)) => {
                self.spawn_get_tab_info(backup_id, table_idx, table_id)
            }
            None => {
                // All descriptors written; enumerate fragment placement.
                if let Some(backup) = self.backups.get_mut(&backup_id) {
                    backup.define.next_frag_table = 0;
                }
                self.advance_define_frags(backup_id);
            }
        }
    }

    pub(crate) fn handle_fetch_table_meta(&mut self, backup_id: BackupId, table_idx: usize) {
        let table_id = {
            let Some(backup) = self.backups.get(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Defining {
                return;
            }
            match backup.tables.get(table_idx) {
                Some(t) => t.table_id,
                None => return,
            }
        };
        self.spawn_get_tab_info(backup_id, table_idx, table_id);
    }

    pub(crate) fn handle_get_tab_info_conf(
        &mut self,
        backup_id: BackupId,
        table_idx: usize,
        meta: TableMeta,
    ) {
        enum Next {
            Advance,
            Retry,
            Fail(ErrorCode),
        }
        let next = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Defining {
                return;
            }
            let max_write = backup.files[DATA_FILE].buffer.max_write();
            let desc = TableDescription {
                table_type: meta.table_type as u32,
                data: meta.descriptor.clone(),
            };
            if desc.encoded_words() > backup.files[CTL_FILE].buffer.max_write() {
                Next::Fail(ErrorCode::NoRoomInControlFile)
            } else if meta.max_row_words as usize + 1 > max_write {
                // A row must fit in a single data-file write window.
                Next::Fail(ErrorCode::OutOfBuffers)
            } else {
                let mut words = Vec::new();
                desc.encode(&mut words);
                if !backup.files[CTL_FILE].buffer.push_words(&words) {
                    Next::Retry
                } else {
                    let table = &mut backup.tables[table_idx];
                    table.schema_version = meta.schema_version;
                    table.attr_count = meta.attr_count;
                    table.max_row_words = meta.max_row_words;
                    table.scan_template = (0..meta.attr_count).collect();
                    table.meta_written = true;
                    backup.define.next_meta = table_idx + 1;
                    Next::Advance
                }
            }
        };
        match next {
            Next::Advance => self.advance_define_meta(backup_id),
            Next::Retry => self.post_self_delayed(
                Signal::ContinueB(ContinueB::FetchTableMeta {
                    backup_id,
                    table_idx,
                }),
                META_RETRY_DELAY,
            ),
            Next::Fail(code) => self.define_backup_ref(backup_id, code),
        }
    }

    pub(crate) fn handle_get_tab_info_ref(&mut self, backup_id: BackupId, _table_idx: usize) {
        self.define_backup_ref(backup_id, ErrorCode::DictionaryFailure);
    }

    fn advance_define_frags(&mut self, backup_id: BackupId) {
        let next = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Defining {
                return;
            }
            let mut idx = backup.define.next_frag_table;
            loop {
                match backup.tables.get(idx) {
                    Some(t) if t.table_type.has_row_data() => break Some((idx, t.table_id)),
                    Some(_) => idx += 1,
                    None => break None,
                }
            }
        };
        match next {
            Some((table_idx, table_id)) => {
                if let Some(backup) = self.backups.get_mut(&backup_id) {
                    backup.define.next_frag_table = table_idx;
                }
                self.spawn_dih_scan_tab(backup_id, table_idx, table_id);
            }
            None => self.define_complete(backup_id),
        }
    }

    pub(crate) fn handle_dih_scan_tab_conf(
        &mut self,
        backup_id: BackupId,
        table_idx: usize,
        fragment_count: u32,
        scan_cookie: u64,
    ) {
        let placements = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Defining {
                return;
            }
            let table = &mut backup.tables[table_idx];
            table.fragments = (0..fragment_count)
                .map(|fragment_id| Fragment {
                    fragment_id,
                    node: 0,
                    instance_key: 0,
                    scanned: false,
                    scanning: false,
                    records: 0,
                })
                .collect();
            backup.define.placements_outstanding = fragment_count;
            backup.define.scan_cookie = scan_cookie;
            (table.table_id, fragment_count)
        };

        let (table_id, count) = placements;
        if count == 0 {
            self.spawn_dih_scan_tab_complete(table_id, scan_cookie);
            if let Some(backup) = self.backups.get_mut(&backup_id) {
                backup.define.next_frag_table = table_idx + 1;
            }
            self.advance_define_frags(backup_id);
            return;
        }
        for fragment_no in 0..count {
            self.spawn_dih_scan_get_nodes(backup_id, table_idx, table_id, fragment_no);
        }
    }

    pub(crate) fn handle_dih_scan_tab_ref(&mut self, backup_id: BackupId, _table_idx: usize) {
        self.define_backup_ref(backup_id, ErrorCode::DistributionFailure);
    }

    pub(crate) fn handle_dih_scan_get_nodes_conf(
        &mut self,
        backup_id: BackupId,
        table_idx: usize,
        fragment_no: u32,
        node: NodeId,
        instance_key: u32,
    ) {
        let table_done = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Defining {
                return;
            }
            let table = &mut backup.tables[table_idx];
            let fragment = &mut table.fragments[fragment_no as usize];
            fragment.node = node;
            fragment.instance_key = instance_key;
            backup.define.placements_outstanding -= 1;
            if backup.define.placements_outstanding == 0 {
                Some((table.table_id, backup.define.scan_cookie))
            } else {
                None
            }
        };
        if let Some((table_id, cookie)) = table_done {
            self.spawn_dih_scan_tab_complete(table_id, cookie);
            if let Some(backup) = self.backups.get_mut(&backup_id) {
                backup.define.next_frag_table += 1;
            }
            self.advance_define_frags(backup_id);
        }
    }

    pub(crate) fn handle_dih_scan_get_nodes_ref(
        &mut self,
        backup_id: BackupId,
        _table_idx: usize,
        _fragment_no: u32,
    ) {
        self.define_backup_ref(backup_id, ErrorCode::DistributionFailure);
    }

    fn define_complete(&mut self, backup_id: BackupId) {
        let master = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            backup.set_state(SlaveState::Defined);
            backup.master
        };
        let node = self.node_id;
        info!("backup {backup_id}: defined on node {node}");
        self.send_to(master, Signal::DefineBackupConf { backup_id, node });
    }

    // ------------------------------------------------------------------
    // StartBackup: trigger installation
    // ------------------------------------------------------------------

    pub(crate) fn handle_start_backup_req(&mut self, backup_id: BackupId) {
        {
            let node = self.node_id;
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                self.send_to(
                    self.master_node,
                    Signal::StartBackupRef {
                        backup_id,
                        node,
                        error: ErrorCode::OutOfRecords,
                    },
                );
                return;
            };
            if backup.is_aborting() {
                return;
            }
            backup.set_state(SlaveState::Started);
            backup.start.next_table = 0;
        }
        self.advance_start_triggers(backup_id);
    }

    fn advance_start_triggers(&mut self, backup_id: BackupId) {
        let work = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.is_aborting() {
                return;
            }
            let mut idx = backup.start.next_table;
            loop {
                match backup.tables.get(idx) {
                    Some(t) if t.table_type.has_row_data() => break,
                    Some(_) => idx += 1,
                    None => {
                        backup.start.next_table = idx;
                        break;
                    }
                }
            }
            backup.start.next_table = idx;
            match backup.tables.get(idx) {
                None => None,
                Some(table) => {
                    let undo = backup.uses_undo_log();
                    Some((
                        idx,
                        table.table_id,
                        table.attr_count,
                        if undo {
                            SubscriptionKind::SubscriptionBefore
                        } else {
                            SubscriptionKind::Subscription
                        },
                    ))
                }
            }
        };

        match work {
            None => {
                // Triggers armed everywhere; start the log/data drains.
                self.start_file_thread(backup_id, LOG_FILE);
                self.start_file_thread(backup_id, DATA_FILE);
                let node = self.node_id;
                let master = match self.backups.get(&backup_id) {
                    Some(b) => b.master,
                    None => return,
                };
                info!("backup {backup_id}: started on node {node}");
                self.send_to(master, Signal::StartBackupConf { backup_id, node });
            }
            Some((table_idx, table_id, attr_count, kind)) => {
                let receiver = self.node_id;
                let mut reqs = Vec::new();
                {
                    let trigger_ids: Vec<u32> =
                        (0..3).map(|_| self.allocate_trigger_id()).collect();
                    let backup = self.backups.get_mut(&backup_id).expect("checked above");
                    backup.start.outstanding = 3;
                    for (slot, event) in TriggerEvent::ALL.into_iter().enumerate() {
                        let trigger_id = trigger_ids[slot];
                        let trigger_idx = backup.triggers.len();
                        backup.triggers.push(crate::core::records::Trigger {
                            trigger_id,
                            table_idx,
                            table_id,
                            event,
                            created: false,
                            pending: None,
                            error: ErrorCode::None,
                        });
                        backup.tables[table_idx].trigger_slots[slot] = Some(trigger_idx);
                        reqs.push(CreateTriggerReq {
                            trigger_id,
                            table_id,
                            event,
                            kind,
                            monitor_replicas: true,
                            monitor_all_attributes: false,
                            attribute_mask: full_attribute_mask(attr_count),
                            receiver,
                        });
                    }
                }
                for req in reqs {
                    self.spawn_create_trigger(backup_id, req);
                }
            }
        }
    }

    pub(crate) fn handle_create_trig_conf(
        &mut self,
        backup_id: BackupId,
        _table_id: u32,
        trigger_id: u32,
    ) {
        let table_done = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if let Some(idx) = backup.trigger_by_id(trigger_id) {
                backup.triggers[idx].created = true;
            }
            backup.start.outstanding -= 1;
            backup.start.outstanding == 0
        };
        if table_done {
            if let Some(backup) = self.backups.get_mut(&backup_id) {
                backup.start.next_table += 1;
            }
            self.advance_start_triggers(backup_id);
        }
    }

    pub(crate) fn handle_create_trig_ref(
        &mut self,
        backup_id: BackupId,
        table_id: u32,
        _trigger_id: u32,
    ) {
        let master = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            backup.record_error(ErrorCode::TriggerCreateFailure);
            warn!("backup {backup_id}: trigger install failed on table {table_id}");
            backup.master
        };
        let node = self.node_id;
        self.send_to(
            master,
            Signal::StartBackupRef {
                backup_id,
                node,
                error: ErrorCode::TriggerCreateFailure,
            },
        );
        self.begin_local_abort(backup_id);
    }

    // ------------------------------------------------------------------
    // BackupFragment: the scan
    // ------------------------------------------------------------------

    pub(crate) fn handle_backup_fragment_req(
        &mut self,
        backup_id: BackupId,
        table_id: u32,
        fragment_no: u32,
    ) {
        enum Action {
            Ignore,
            Requeue,
            Refuse(ErrorCode),
            Scan(ScanFragReq),
        }
        let action = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.is_aborting() {
                Action::Ignore
            } else if backup.state() == SlaveState::Scanning {
                // The master re-issues on takeover; the scan is already ours.
                Action::Ignore
            } else {
                match backup.table_by_id(table_id) {
                    None => Action::Refuse(ErrorCode::ScanFailure),
                    Some(table_idx) => {
                        // The coordinator pre-marks its own fragments when it
                        // dispatches to itself, so the precondition is only
                        // enforced for remote masters.
                        let relaxed = backup.master == self.node_id;
                        let table = &backup.tables[table_idx];
                        let fragment = &table.fragments[fragment_no as usize];
                        if !relaxed && (fragment.scanned || fragment.scanning) {
                            Action::Refuse(ErrorCode::ScanFailure)
                        } else {
                            let needed = FragmentHeader::WORDS
                                + SCAN_BATCH_SIZE as usize * (table.max_row_words as usize + 1);
                            if backup.files[DATA_FILE].buffer.free_words() <= needed {
                                Action::Requeue
                            } else {
                                let attr_template = table.scan_template.clone();
                                backup.set_state(SlaveState::Scanning);
                                let table = &mut backup.tables[table_idx];
                                table.fragments[fragment_no as usize].scanning = true;
                                let file = &mut backup.files[DATA_FILE];
                                file.flags |= FileFlags::SCAN_THREAD;
                                file.current_fragment = Some((table_id, fragment_no));
                                file.op_records = 0;
                                file.op_bytes = 0;
                                file.scan_retries = 0;
                                let header = FragmentHeader {
                                    table_id,
                                    fragment_no,
                                };
                                let mut words = Vec::new();
                                header.encode(&mut words);
                                // Room was checked above.
                                assert!(file.buffer.push_words(&words));
                                Action::Scan(ScanFragReq {
                                    table_id,
                                    fragment_id: fragment_no,
                                    batch_size: SCAN_BATCH_SIZE,
                                    attr_template,
                                    tup_order: true,
                                    read_committed: true,
                                    no_disk: true,
                                })
                            }
                        }
                    }
                }
            }
        };
        match action {
            Action::Ignore => {}
            Action::Requeue => self.post_self_delayed(
                Signal::BackupFragmentReq {
                    backup_id,
                    table_id,
                    fragment_no,
                },
                FRAGMENT_REQUEUE_DELAY,
            ),
            Action::Refuse(error) => {
                let node = self.node_id;
                let master = self
                    .backups
                    .get(&backup_id)
                    .map(|b| b.master)
                    .unwrap_or(self.master_node);
                self.send_to(
                    master,
                    Signal::BackupFragmentRef {
                        backup_id,
                        node,
                        table_id,
                        fragment_no,
                        error,
                    },
                );
            }
            Action::Scan(req) => self.spawn_scan_open(backup_id, req),
        }
    }

    pub(crate) fn handle_scan_frag_conf(
        &mut self,
        backup_id: BackupId,
        cursor: Box<dyn ScanCursor>,
        rows: Vec<Vec<u32>>,
        fragment_complete: bool,
    ) {
        enum Next {
            Done {
                master: NodeId,
                table_id: u32,
                fragment_no: u32,
                records: u64,
                bytes: u64,
            },
            MoreNow(Box<dyn ScanCursor>),
            MoreLater,
            Dropped,
            Overrun,
        }
        let next = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.is_aborting() || backup.state() != SlaveState::Scanning {
                debug!("backup {backup_id}: dropping scan batch in state {}", backup.state());
                backup.files[DATA_FILE].flags.remove(FileFlags::SCAN_THREAD);
                Next::Dropped
            } else {
                let file = &mut backup.files[DATA_FILE];
                let (table_id, fragment_no) =
                    file.current_fragment.expect("scan conf without a fragment");
                let mut overrun = false;
                for row in &rows {
                    let mut words = Vec::with_capacity(row.len() + 1);
                    words.push(row.len() as u32);
                    words.extend_from_slice(row);
                    if !file.buffer.push_words(&words) {
                        overrun = true;
                        break;
                    }
                    file.op_records += 1;
                    file.op_bytes += (words.len() * 4) as u64;
                }
                if overrun {
                    Next::Overrun
                } else if fragment_complete {
                    let records = file.op_records;
                    let bytes = file.op_bytes;
                    let footer = FragmentFooter {
                        table_id,
                        fragment_no,
                        records: records as u32,
                    };
                    let mut words = vec![0u32];
                    footer.encode(&mut words);
                    if !file.buffer.push_words(&words) {
                        Next::Overrun
                    } else {
                        file.flags.remove(FileFlags::SCAN_THREAD);
                        file.current_fragment = None;
                        file.records += records;
                        let table_idx = backup
                            .table_by_id(table_id)
                            .expect("scanned table disappeared");
                        let fragment =
                            &mut backup.tables[table_idx].fragments[fragment_no as usize];
                        fragment.scanning = false;
                        fragment.scanned = true;
                        fragment.records = records;
                        backup.set_state(SlaveState::Started);
                        Next::Done {
                            master: backup.master,
                            table_id,
                            fragment_no,
                            records,
                            bytes,
                        }
                    }
                } else {
                    let table_idx = backup
                        .table_by_id(table_id)
                        .expect("scanned table disappeared");
                    let max_row = backup.tables[table_idx].max_row_words as usize;
                    let room = SCAN_BATCH_SIZE as usize * (max_row + 1);
                    if backup.files[DATA_FILE].buffer.free_words() > room {
                        Next::MoreNow(cursor)
                    } else {
                        backup.scan_cursor = Some(cursor);
                        Next::MoreLater
                    }
                }
            }
        };
        match next {
            Next::Dropped => {}
            Next::Overrun => {
                // The pre-scan room check makes this unreachable in a healthy
                // run; a broken row-store contract lands here.
                self.fail_scan(backup_id, ErrorCode::OutOfBuffers);
            }
            Next::Done {
                master,
                table_id,
                fragment_no,
                records,
                bytes,
            } => {
                let node = self.node_id;
                debug!(
                    "backup {backup_id}: fragment ({table_id}, {fragment_no}) scanned, {records} records"
                );
                self.send_to(
                    master,
                    Signal::BackupFragmentConf {
                        backup_id,
                        node,
                        table_id,
                        fragment_no,
                        records,
                        bytes,
                    },
                );
            }
            Next::MoreNow(cursor) => self.spawn_scan_next(backup_id, cursor),
            Next::MoreLater => self.post_self_delayed(
                Signal::ContinueB(ContinueB::ScanNext { backup_id }),
                SCAN_NEXT_DELAY,
            ),
        }
    }

    pub(crate) fn handle_scan_next(&mut self, backup_id: BackupId) {
        let action = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Scanning {
                backup.scan_cursor = None;
                return;
            }
            let Some((table_id, _)) = backup.files[DATA_FILE].current_fragment else {
                return;
            };
            let table_idx = backup.table_by_id(table_id).expect("scanning unknown table");
            let max_row = backup.tables[table_idx].max_row_words as usize;
            let room = SCAN_BATCH_SIZE as usize * (max_row + 1);
            if backup.files[DATA_FILE].buffer.free_words() > room {
                backup.scan_cursor.take()
            } else {
                None
            }
        };
        match action {
            Some(cursor) => self.spawn_scan_next(backup_id, cursor),
            None => self.post_self_delayed(
                Signal::ContinueB(ContinueB::ScanNext { backup_id }),
                SCAN_NEXT_DELAY,
            ),
        }
    }

    pub(crate) fn handle_scan_frag_ref(&mut self, backup_id: BackupId, error: ScanErrorCode) {
        let retry = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Scanning {
                return;
            }
            let file = &mut backup.files[DATA_FILE];
            if error.is_transient() && file.scan_retries < MAX_SCAN_RETRIES && file.op_records == 0
            {
                file.scan_retries += 1;
                file.current_fragment
            } else {
                None
            }
        };
        match retry {
            Some((table_id, fragment_no)) => {
                warn!("backup {backup_id}: transient scan error {error:?}, retrying");
                self.post_self_delayed(
                    Signal::ContinueB(ContinueB::RetryScan {
                        backup_id,
                        table_id,
                        fragment_no,
                    }),
                    SCAN_RETRY_DELAY,
                );
            }
            None => self.fail_scan(backup_id, ErrorCode::ScanFailure),
        }
    }

    /// Re-issues the fragment scan after a transient row-store error.
    pub(crate) fn handle_retry_scan(
        &mut self,
        backup_id: BackupId,
        table_id: u32,
        fragment_no: u32,
    ) {
        let req = {
            let Some(backup) = self.backups.get(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Scanning
                || backup.files[DATA_FILE].current_fragment != Some((table_id, fragment_no))
            {
                return;
            }
            let table_idx = backup.table_by_id(table_id).expect("retry on unknown table");
            ScanFragReq {
                table_id,
                fragment_id: fragment_no,
                batch_size: SCAN_BATCH_SIZE,
                attr_template: backup.tables[table_idx].scan_template.clone(),
                tup_order: true,
                read_committed: true,
                no_disk: true,
            }
        };
        self.spawn_scan_open(backup_id, req);
    }

    fn fail_scan(&mut self, backup_id: BackupId, error: ErrorCode) {
        let reply = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            backup.record_error(error);
            let file = &mut backup.files[DATA_FILE];
            file.error = error;
            file.flags.remove(FileFlags::SCAN_THREAD);
            let current = file.current_fragment.take();
            if let Some((table_id, fragment_no)) = current {
                if let Some(table_idx) = backup.table_by_id(table_id) {
                    backup.tables[table_idx].fragments[fragment_no as usize].scanning = false;
                }
                backup.set_state(SlaveState::Started);
                Some((backup.master, table_id, fragment_no))
            } else {
                None
            }
        };
        if let Some((master, table_id, fragment_no)) = reply {
            let node = self.node_id;
            self.send_to(
                master,
                Signal::BackupFragmentRef {
                    backup_id,
                    node,
                    table_id,
                    fragment_no,
                    error,
                },
            );
        }
    }

    pub(crate) fn handle_backup_fragment_complete_rep(
        &mut self,
        backup_id: BackupId,
        table_id: u32,
        fragment_no: u32,
        records: u64,
        _bytes: u64,
    ) {
        let Some(backup) = self.backups.get_mut(&backup_id) else {
            return;
        };
        if let Some(table_idx) = backup.table_by_id(table_id) {
            if let Some(fragment) = backup.tables[table_idx]
                .fragments
                .get_mut(fragment_no as usize)
            {
                fragment.scanned = true;
                fragment.records = records;
            }
        }
    }

    // ------------------------------------------------------------------
    // Log capture
    // ------------------------------------------------------------------

    pub(crate) fn handle_trig_attr_info(&mut self, trigger_id: u32, kind: AttrKind, words: Vec<u32>) {
        let abort = {
            let Some((&backup_id, backup)) = self
                .backups
                .iter_mut()
                .find(|(_, b)| b.trigger_by_id(trigger_id).is_some())
            else {
                debug!("attr info for unknown trigger {trigger_id}");
                return;
            };
            if backup.is_aborting() {
                return;
            }
            let undo = backup.uses_undo_log();
            let trigger_idx = backup.trigger_by_id(trigger_id).expect("found above");
            let max_row_words = backup.tables[backup.triggers[trigger_idx].table_idx].max_row_words;
            let trigger = &mut backup.triggers[trigger_idx];
            if trigger.error.is_set() {
                return;
            }
            if !trigger.keeps(kind, undo) {
                return;
            }
            if trigger.pending.is_none() {
                let reserve = max_log_entry_words(max_row_words);
                let log = &mut backup.files[LOG_FILE];
                if log.buffer.free_words() <= log.reserved_words + reserve {
                    trigger.error = ErrorCode::LogBufferFull;
                    backup.record_error(ErrorCode::LogBufferFull);
                    Some((backup_id, backup.master))
                } else {
                    log.reserved_words += reserve;
                    trigger.pending = Some(PendingLogEntry {
                        words: Vec::with_capacity(reserve),
                        reserved_words: reserve,
                    });
                    None
                }
            } else {
                None
            }
        };

        if let Some((backup_id, master)) = abort {
            warn!("backup {backup_id}: log buffer full, aborting");
            self.send_to(
                master,
                Signal::AbortBackupOrd {
                    backup_id,
                    reason: AbortReason::LogBufferFull,
                },
            );
            return;
        }

        // Second borrow: append the value words to the pending entry.
        if let Some((_, backup)) = self
            .backups
            .iter_mut()
            .find(|(_, b)| b.trigger_by_id(trigger_id).is_some())
        {
            let trigger_idx = backup.trigger_by_id(trigger_id).expect("found above");
            if let Some(pending) = backup.triggers[trigger_idx].pending.as_mut() {
                pending.words.extend_from_slice(&words);
            }
        }
    }

    pub(crate) fn handle_fire_trig_ord(&mut self, trigger_id: u32, fragment_id: u32, gci: u32) {
        let Some((_, backup)) = self
            .backups
            .iter_mut()
            .find(|(_, b)| b.trigger_by_id(trigger_id).is_some())
        else {
            debug!("fire ord for unknown trigger {trigger_id}");
            return;
        };
        if backup.is_aborting() {
            return;
        }
        let undo = backup.uses_undo_log();
        let trigger_idx = backup.trigger_by_id(trigger_id).expect("found above");
        let (table_idx, table_id, event) = {
            let t = &backup.triggers[trigger_idx];
            (t.table_idx, t.table_id, t.event)
        };
        let Some(pending) = backup.triggers[trigger_idx].pending.take() else {
            return;
        };

        let reserved = pending.reserved_words;
        backup.files[LOG_FILE].reserved_words -= reserved;

        // The replica that owns the scan also owns the log; firings for
        // fragments placed on other nodes are discarded.
        let owned = backup.tables[table_idx]
            .fragments
            .get(fragment_id as usize)
            .is_none_or(|f| f.node == self.node_id);
        if !owned {
            return;
        }

        let stamp_gci = if gci != backup.curr_gcp {
            backup.curr_gcp = gci;
            Some(gci)
        } else {
            None
        };

        let entry = LogEntry {
            table_id,
            event: match event {
                TriggerEvent::Insert => LogEventType::Insert,
                TriggerEvent::Update => LogEventType::Update,
                TriggerEvent::Delete => LogEventType::Delete,
            },
            fragment_id,
            data: pending.words,
            gci: stamp_gci,
        };
        let mut words = Vec::with_capacity(entry.encoded_words(undo));
        entry.encode(undo, &mut words);

        let log = &mut backup.files[LOG_FILE];
        if !log.buffer.push_words(&words) {
            // The reservation guarantees room; reaching here means the
            // producer accounting is broken.
            let master = backup.master;
            let id = backup.backup_id;
            backup.triggers[trigger_idx].error = ErrorCode::LogBufferFull;
            backup.record_error(ErrorCode::LogBufferFull);
            self.send_to(
                master,
                Signal::AbortBackupOrd {
                    backup_id: id,
                    reason: AbortReason::LogBufferFull,
                },
            );
            return;
        }
        log.records += 1;
        backup.log_records += 1;
        backup.log_bytes += (words.len() * 4) as u64;
    }

    // ------------------------------------------------------------------
    // StopBackup
    // ------------------------------------------------------------------

    pub(crate) fn handle_stop_backup_req(
        &mut self,
        backup_id: BackupId,
        start_gcp: u32,
        stop_gcp: u32,
    ) {
        let drops = {
            let node = self.node_id;
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                self.send_to(
                    self.master_node,
                    Signal::StopBackupRef {
                        backup_id,
                        node,
                        error: ErrorCode::OutOfRecords,
                    },
                );
                return;
            };
            if backup.is_aborting() {
                return;
            }
            // At least one full gci boundary must lie between the cut points.
            if stop_gcp <= start_gcp {
                let master = backup.master;
                self.send_to(
                    master,
                    Signal::StopBackupRef {
                        backup_id,
                        node,
                        error: ErrorCode::InvalidCutPoints,
                    },
                );
                return;
            }
            backup.set_state(SlaveState::Stopping);
            backup.start_gcp = start_gcp;
            backup.stop_gcp = stop_gcp;
            let drops: Vec<u32> = backup
                .triggers
                .iter()
                .filter(|t| t.created)
                .map(|t| t.trigger_id)
                .collect();
            backup.stop.drops_outstanding = drops.len();
            drops
        };
        info!(
            "backup {backup_id}: stopping on node {}, gcp [{start_gcp}, {stop_gcp})",
            self.node_id
        );
        if drops.is_empty() {
            self.stop_after_trigger_drops(backup_id);
        } else {
            for trigger_id in drops {
                self.spawn_drop_trigger(backup_id, trigger_id);
            }
        }
    }

    pub(crate) fn handle_drop_trig_conf(&mut self, backup_id: BackupId, trigger_id: u32) {
        self.account_trigger_drop(backup_id, trigger_id, true);
    }

    pub(crate) fn handle_drop_trig_ref(&mut self, backup_id: BackupId, trigger_id: u32) {
        warn!("backup {backup_id}: drop of trigger {trigger_id} failed");
        self.account_trigger_drop(backup_id, trigger_id, false);
    }

    fn account_trigger_drop(&mut self, backup_id: BackupId, trigger_id: u32, ok: bool) {
        enum Phase {
            StopDone,
            AbortDone,
            Wait,
        }
        let phase = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if let Some(idx) = backup.trigger_by_id(trigger_id) {
                backup.triggers[idx].created = false;
                if !ok {
                    backup.triggers[idx].error = ErrorCode::TriggerDropFailure;
                }
            }
            match backup.state() {
                SlaveState::Stopping => {
                    backup.stop.drops_outstanding -= 1;
                    if backup.stop.drops_outstanding == 0 {
                        Phase::StopDone
                    } else {
                        Phase::Wait
                    }
                }
                SlaveState::Aborting => {
                    backup.abort.drops_outstanding -= 1;
                    if backup.abort.drops_outstanding == 0 {
                        Phase::AbortDone
                    } else {
                        Phase::Wait
                    }
                }
                _ => Phase::Wait,
            }
        };
        match phase {
            Phase::StopDone => self.stop_after_trigger_drops(backup_id),
            Phase::AbortDone => self.maybe_release_aborted(backup_id),
            Phase::Wait => {}
        }
    }

    /// Triggers are gone: seal the log, write the control-file footer, then
    /// walk the tables emitting fragment info.
    fn stop_after_trigger_drops(&mut self, backup_id: BackupId) {
        let ok = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let (start_gcp, stop_gcp) = (backup.start_gcp, backup.stop_gcp);
            // Log stream terminator.
            let log_ok = backup.files[LOG_FILE].buffer.push_words(&[0]);
            // GCP entry stores the last fully captured gci.
            let gcp = GcpEntry {
                start_gcp,
                stop_gcp: stop_gcp - 1,
            };
            let mut words = Vec::new();
            gcp.encode(&mut words);
            log_ok && backup.files[CTL_FILE].buffer.push_words(&words)
        };
        if !ok {
            self.slave_failure_abort(backup_id, ErrorCode::NoRoomInControlFile);
            return;
        }
        self.post_self(Signal::ContinueB(ContinueB::FragmentInfo {
            backup_id,
            table_idx: 0,
            frag_idx: 0,
        }));
    }

    pub(crate) fn handle_fragment_info(
        &mut self,
        backup_id: BackupId,
        table_idx: usize,
        frag_idx: usize,
    ) {
        enum Next {
            Lock(usize, u32),
            Unlock(usize, u32),
            Retry(usize, usize),
            CloseAll,
        }
        let next = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Stopping {
                return;
            }
            let mut table_idx = table_idx;
            // Tables without fragments contribute nothing.
            while backup
                .tables
                .get(table_idx)
                .is_some_and(|t| t.fragments.is_empty())
            {
                table_idx += 1;
            }
            match backup.tables.get(table_idx) {
                None => Next::CloseAll,
                Some(table) => {
                    if frag_idx == 0 && !backup.stop.table_locked {
                        Next::Lock(table_idx, table.table_id)
                    } else {
                        let mut frag_idx = frag_idx;
                        let table_id = table.table_id;
                        loop {
                            match backup.tables[table_idx].fragments.get(frag_idx) {
                                None => break Next::Unlock(table_idx, table_id),
                                Some(fragment) => {
                                    let info = FragmentInfo {
                                        table_id,
                                        fragment_no: fragment.fragment_id,
                                        records: fragment.records,
                                    };
                                    let mut words = Vec::new();
                                    info.encode(&mut words);
                                    if !backup.files[CTL_FILE].buffer.push_words(&words) {
                                        break Next::Retry(table_idx, frag_idx);
                                    }
                                    frag_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        };
        match next {
            Next::Lock(table_idx, table_id) => {
                self.spawn_lock_table(backup_id, table_idx, table_id, true)
            }
            Next::Unlock(table_idx, table_id) => {
                if let Some(backup) = self.backups.get_mut(&backup_id) {
                    backup.stop.table_locked = false;
                }
                self.spawn_lock_table(backup_id, table_idx, table_id, false)
            }
            Next::Retry(table_idx, frag_idx) => self.post_self_delayed(
                Signal::ContinueB(ContinueB::FragmentInfo {
                    backup_id,
                    table_idx,
                    frag_idx,
                }),
                FRAGMENT_INFO_RETRY_DELAY,
            ),
            Next::CloseAll => {
                self.close_all_files(backup_id, false);
            }
        }
    }

    pub(crate) fn handle_backup_lock_tab_conf(
        &mut self,
        backup_id: BackupId,
        table_idx: usize,
        locked: bool,
    ) {
        {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Stopping {
                // An unlock reply can trail an abort; nothing to resume.
                return;
            }
            if locked {
                backup.stop.table_locked = true;
            }
        }
        let (table_idx, frag_idx) = if locked {
            (table_idx, 0)
        } else {
            (table_idx + 1, 0)
        };
        self.post_self(Signal::ContinueB(ContinueB::FragmentInfo {
            backup_id,
            table_idx,
            frag_idx,
        }));
    }

    pub(crate) fn handle_backup_lock_tab_ref(&mut self, backup_id: BackupId, _table_idx: usize) {
        self.slave_failure_abort(backup_id, ErrorCode::DictionaryFailure);
    }

    // ------------------------------------------------------------------
    // Abort
    // ------------------------------------------------------------------

    pub(crate) fn handle_abort_backup_ord(
        &mut self,
        _from: NodeId,
        backup_id: BackupId,
        reason: AbortReason,
    ) {
        // A slave escalating an error to the coordinator lands here too,
        // including this node's own slave half. The coordinator's fan-out
        // reaches the local slave by direct call after the master record is
        // retired, so holding a master record means this ord is an
        // escalation, never our own broadcast.
        let escalation =
            reason != AbortReason::BackupComplete && self.masters.contains_key(&backup_id);
        if escalation {
            self.master_abort(backup_id, reason.error_code());
            return;
        }

        match reason {
            AbortReason::BackupComplete => {
                let released = match self.backups.get_mut(&backup_id) {
                    Some(backup) if backup.state() == SlaveState::Cleaning => {
                        backup.set_state(SlaveState::Initial);
                        true
                    }
                    _ => false,
                };
                if released {
                    self.backups.remove(&backup_id);
                    self.masters.remove(&backup_id);
                    debug!("backup {backup_id}: released on node {}", self.node_id);
                }
            }
            _ => {
                let Some(backup) = self.backups.get(&backup_id) else {
                    debug!("abort for unknown backup {backup_id}; already gone");
                    return;
                };
                if backup.is_aborting() {
                    return;
                }
                let error = reason.error_code();
                if let Some(backup) = self.backups.get_mut(&backup_id) {
                    if error.is_set() {
                        backup.record_error(error);
                    }
                }
                self.begin_local_abort(backup_id);
            }
        }
    }

    /// Local failure path: record the error and abort, telling the master.
    pub(crate) fn slave_failure_abort(&mut self, backup_id: BackupId, error: ErrorCode) {
        let master = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            backup.record_error(error);
            backup.master
        };
        self.send_to(
            master,
            Signal::AbortBackupOrd {
                backup_id,
                reason: AbortReason::FileOrScanError,
            },
        );
        self.begin_local_abort(backup_id);
    }

    /// Tears this node's share of the backup down: drop triggers, close (and
    /// remove) files, then release the record.
    pub(crate) fn begin_local_abort(&mut self, backup_id: BackupId) {
        let drops = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.is_aborting() {
                return;
            }
            backup.set_state(SlaveState::Aborting);
            backup.scan_cursor = None;
            for trigger in &mut backup.triggers {
                trigger.pending = None;
            }
            let drops: Vec<u32> = backup
                .triggers
                .iter()
                .filter(|t| t.created)
                .map(|t| t.trigger_id)
                .collect();
            backup.abort.drops_outstanding = drops.len();
            drops
        };
        info!("backup {backup_id}: aborting on node {}", self.node_id);
        for trigger_id in &drops {
            self.spawn_drop_trigger(backup_id, *trigger_id);
        }
        let remove = self
            .backups
            .get(&backup_id)
            .is_some_and(|b| b.error.is_set());
        let closing = self.close_all_files(backup_id, remove);
        if let Some(backup) = self.backups.get_mut(&backup_id) {
            backup.abort.files_closing = closing;
        }
        self.maybe_release_aborted(backup_id);
    }

    /// Releases an aborting backup once its triggers are dropped and its
    /// files are closed.
    pub(crate) fn maybe_release_aborted(&mut self, backup_id: BackupId) {
        let release = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            if backup.state() != SlaveState::Aborting {
                return;
            }
            let files_done = backup.files.iter().all(|f| {
                !f.flags
                    .intersects(FileFlags::OPEN | FileFlags::OPENING | FileFlags::CLOSING)
                    && f.outstanding_words == 0
            });
            if backup.abort.drops_outstanding == 0 && files_done {
                backup.set_state(SlaveState::Initial);
                true
            } else {
                false
            }
        };
        if release {
            self.backups.remove(&backup_id);
            self.masters.remove(&backup_id);
            debug!(
                "backup {backup_id}: abort cleanup finished on node {}",
                self.node_id
            );
        }
    }
}

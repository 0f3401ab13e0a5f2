// src/core/node.rs

//! The per-node backup runtime.
//!
//! Each data node runs one `BackupNode`: a cooperative task consuming typed
//! signals run-to-completion from its queue on the in-process `ClusterBus`.
//! Blocking never happens inside a handler; service calls are spawned and
//! post their Conf/Ref back into the queue, and delays are expressed by
//! re-posting a continuation signal after a sleep.

use crate::config::BackupConfig;
use crate::core::events::EventBus;
use crate::core::format::SERVER_VERSION;
use crate::core::governor::WriteRateGovernor;
use crate::core::records::{Backup, MasterData};
use crate::core::services::{
    BACKUP_SEQUENCE, BACKUP_TRIGGER_BASE, CreateTriggerReq, FsOpenReq, ScanCursor, ScanFragReq,
    Services,
};
use crate::core::signals::{
    BackupId, BackupReqFlags, ClientHandle, ContinueB, MutexId, Signal, SignalEnvelope,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

pub use crate::core::signals::NodeId;

/// FlowBuffer block size in words (512 bytes).
pub(crate) const BUFFER_BLOCK_WORDS: usize = 128;

/// Control-file FlowBuffer floor in words; the control file is a trickle
/// compared to data and log.
pub(crate) const CTL_BUFFER_WORDS: usize = 64 * 1024;

/// In-process signal router. Delivery between any two nodes preserves send
/// order; signals to a deregistered (dead) node are dropped.
pub struct ClusterBus {
    routes: DashMap<NodeId, mpsc::UnboundedSender<SignalEnvelope>>,
}

impl ClusterBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: DashMap::new(),
        })
    }

    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<SignalEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(node, tx);
        rx
    }

    /// Drops the node's route; all further signals to it vanish, modelling a
    /// dead node.
    pub fn deregister(&self, node: NodeId) {
        self.routes.remove(&node);
    }

    pub fn send(&self, from: NodeId, to: NodeId, signal: Signal) {
        match self.routes.get(&to) {
            Some(route) => {
                let _ = route.send(SignalEnvelope { from, to, signal });
            }
            None => {
                debug!("dropping signal to dead node {to}");
            }
        }
    }
}

/// Membership record for one known peer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeEntry {
    pub alive: bool,
    pub version: u32,
}

/// A client request parked while the backup id is fetched from the cluster
/// sequence.
pub(crate) struct PendingBackup {
    pub client: ClientHandle,
    pub flags: BackupReqFlags,
    pub retries: u32,
}

pub struct BackupNode {
    pub(crate) node_id: NodeId,
    pub(crate) config: BackupConfig,
    pub(crate) bus: Arc<ClusterBus>,
    rx: mpsc::UnboundedReceiver<SignalEnvelope>,
    pub(crate) services: Services,
    pub(crate) nodes: BTreeMap<NodeId, NodeEntry>,
    /// The cluster-designated coordinator for new backups.
    pub(crate) master_node: NodeId,
    pub(crate) backups: HashMap<BackupId, Backup>,
    /// Coordinator state for the backups this node masters.
    pub(crate) masters: HashMap<BackupId, MasterData>,
    pub(crate) governor: WriteRateGovernor,
    pub(crate) events: EventBus,
    pub(crate) pending_requests: HashMap<u32, PendingBackup>,
    pub(crate) next_token: u32,
    pub(crate) next_trigger_id: u32,
}

impl BackupNode {
    /// Creates a node and registers it on the bus. `peers` lists every known
    /// node including this one; `master_node` is the cluster-designated
    /// coordinator.
    pub fn new(
        node_id: NodeId,
        master_node: NodeId,
        peers: &[NodeId],
        config: BackupConfig,
        bus: Arc<ClusterBus>,
        services: Services,
    ) -> Self {
        let rx = bus.register(node_id);
        let nodes = peers
            .iter()
            .map(|&n| {
                (
                    n,
                    NodeEntry {
                        alive: true,
                        version: SERVER_VERSION,
                    },
                )
            })
            .collect();
        let governor = WriteRateGovernor::new(
            config.speed_words_per_tick(),
            config.rate_tick,
            config.monitor_window,
            config.max_write_words() as u64,
        );
        Self {
            node_id,
            config,
            bus,
            rx,
            services,
            nodes,
            master_node,
            backups: HashMap::new(),
            masters: HashMap::new(),
            governor,
            events: EventBus::new(),
            pending_requests: HashMap::new(),
            next_token: 1,
            next_trigger_id: BACKUP_TRIGGER_BASE,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<crate::core::events::BackupEvent> {
        self.events.subscribe()
    }

    /// Test/upgrade hook: overrides the version this node believes a peer
    /// runs, feeding the compatibility check at backup start.
    pub fn set_peer_version(&mut self, node: NodeId, version: u32) {
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.version = version;
        }
    }

    /// The main signal loop; runs until shutdown or bus teardown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("backup node {} started", self.node_id);
        self.post_self(Signal::ContinueB(ContinueB::RateTick));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("backup node {} shutting down", self.node_id);
                    self.bus.deregister(self.node_id);
                    return;
                }
                maybe_env = self.rx.recv() => match maybe_env {
                    Some(env) => self.dispatch(env),
                    None => return,
                }
            }
        }
    }

    // --- routing helpers ---

    pub(crate) fn send_to(&self, to: NodeId, signal: Signal) {
        self.bus.send(self.node_id, to, signal);
    }

    pub(crate) fn post_self(&self, signal: Signal) {
        self.bus.send(self.node_id, self.node_id, signal);
    }

    pub(crate) fn post_self_delayed(&self, signal: Signal, delay: Duration) {
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn alive_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, e)| e.alive)
            .map(|(&n, _)| n)
    }

    pub(crate) fn node_is_alive(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|e| e.alive)
    }

    pub(crate) fn allocate_trigger_id(&mut self) -> u32 {
        let id = self.next_trigger_id;
        self.next_trigger_id += 1;
        id
    }

    pub(crate) fn allocate_token(&mut self) -> u32 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        token
    }

    // --- dispatch ---

    fn dispatch(&mut self, env: SignalEnvelope) {
        trace!(
            "node {} <- {} from {}",
            self.node_id,
            env.signal.name(),
            env.from
        );
        let from = env.from;
        match env.signal {
            Signal::BackupReq {
                client,
                flags,
                backup_data_len,
                input_backup_id,
            } => self.handle_backup_req(client, flags, backup_data_len, input_backup_id),
            Signal::BackupStatusReq { client } => self.handle_backup_status_req(client),
            Signal::DumpStateOrd(cmd) => self.handle_dump_state_ord(cmd),

            Signal::DefineBackupReq {
                backup_id,
                backup_key,
                master,
                nodes,
                flags,
                client,
            } => self.handle_define_backup_req(backup_id, backup_key, master, nodes, flags, client),
            Signal::DefineBackupConf { backup_id, node } => {
                self.handle_define_backup_conf(backup_id, node)
            }
            Signal::DefineBackupRef {
                backup_id,
                node,
                error,
            } => self.handle_define_backup_ref(backup_id, node, error),
            Signal::StartBackupReq { backup_id } => self.handle_start_backup_req(backup_id),
            Signal::StartBackupConf { backup_id, node } => {
                self.handle_start_backup_conf(backup_id, node)
            }
            Signal::StartBackupRef {
                backup_id,
                node,
                error,
            } => self.handle_start_backup_ref(backup_id, node, error),
            Signal::BackupFragmentReq {
                backup_id,
                table_id,
                fragment_no,
            } => self.handle_backup_fragment_req(backup_id, table_id, fragment_no),
            Signal::BackupFragmentConf {
                backup_id,
                node,
                table_id,
                fragment_no,
                records,
                bytes,
            } => self.handle_backup_fragment_conf(
                backup_id,
                node,
                table_id,
                fragment_no,
                records,
                bytes,
            ),
            Signal::BackupFragmentRef {
                backup_id,
                node,
                table_id,
                fragment_no,
                error,
            } => self.handle_backup_fragment_ref(backup_id, node, table_id, fragment_no, error),
            Signal::BackupFragmentCompleteRep {
                backup_id,
                table_id,
                fragment_no,
                records,
                bytes,
            } => self.handle_backup_fragment_complete_rep(
                backup_id,
                table_id,
                fragment_no,
                records,
                bytes,
            ),
            Signal::StopBackupReq {
                backup_id,
                start_gcp,
                stop_gcp,
            } => self.handle_stop_backup_req(backup_id, start_gcp, stop_gcp),
            Signal::StopBackupConf {
                backup_id,
                node,
                log_bytes,
                log_records,
            } => self.handle_stop_backup_conf(backup_id, node, log_bytes, log_records),
            Signal::StopBackupRef {
                backup_id,
                node,
                error,
            } => self.handle_stop_backup_ref(backup_id, node, error),
            Signal::AbortBackupOrd { backup_id, reason } => {
                self.handle_abort_backup_ord(from, backup_id, reason)
            }

            Signal::NodeFailRep { failed, new_master } => {
                self.handle_node_fail_rep(&failed, new_master)
            }

            Signal::UtilSequenceConf { token, value } => {
                self.handle_util_sequence_conf(token, value)
            }
            Signal::UtilSequenceRef { token, transient } => {
                self.handle_util_sequence_ref(token, transient)
            }
            Signal::MutexLocked { backup_id, mutex } => self.handle_mutex_locked(backup_id, mutex),
            Signal::MutexLockFailed { backup_id, mutex } => {
                self.handle_mutex_lock_failed(backup_id, mutex)
            }

            Signal::ListTablesConf { backup_id, tables } => {
                self.handle_list_tables_conf(backup_id, tables)
            }
            Signal::ListTablesRef { backup_id } => self.handle_list_tables_ref(backup_id),
            Signal::GetTabInfoConf {
                backup_id,
                table_idx,
                meta,
            } => self.handle_get_tab_info_conf(backup_id, table_idx, meta),
            Signal::GetTabInfoRef {
                backup_id,
                table_idx,
            } => self.handle_get_tab_info_ref(backup_id, table_idx),
            Signal::CreateTrigConf {
                backup_id,
                table_id,
                trigger_id,
            } => self.handle_create_trig_conf(backup_id, table_id, trigger_id),
            Signal::CreateTrigRef {
                backup_id,
                table_id,
                trigger_id,
            } => self.handle_create_trig_ref(backup_id, table_id, trigger_id),
            Signal::DropTrigConf {
                backup_id,
                trigger_id,
            } => self.handle_drop_trig_conf(backup_id, trigger_id),
            Signal::DropTrigRef {
                backup_id,
                trigger_id,
            } => self.handle_drop_trig_ref(backup_id, trigger_id),
            Signal::BackupLockTabConf {
                backup_id,
                table_idx,
                locked,
            } => self.handle_backup_lock_tab_conf(backup_id, table_idx, locked),
            Signal::BackupLockTabRef {
                backup_id,
                table_idx,
            } => self.handle_backup_lock_tab_ref(backup_id, table_idx),

            Signal::DihScanTabConf {
                backup_id,
                table_idx,
                fragment_count,
                scan_cookie,
            } => self.handle_dih_scan_tab_conf(backup_id, table_idx, fragment_count, scan_cookie),
            Signal::DihScanTabRef {
                backup_id,
                table_idx,
            } => self.handle_dih_scan_tab_ref(backup_id, table_idx),
            Signal::DihScanGetNodesConf {
                backup_id,
                table_idx,
                fragment_no,
                node,
                instance_key,
            } => self.handle_dih_scan_get_nodes_conf(
                backup_id,
                table_idx,
                fragment_no,
                node,
                instance_key,
            ),
            Signal::DihScanGetNodesRef {
                backup_id,
                table_idx,
                fragment_no,
            } => self.handle_dih_scan_get_nodes_ref(backup_id, table_idx, fragment_no),
            Signal::WaitGcpConf { backup_id, gci } => self.handle_wait_gcp_conf(backup_id, gci),
            Signal::WaitGcpRef { backup_id } => self.handle_wait_gcp_ref(backup_id),

            Signal::ScanFragConf {
                backup_id,
                cursor,
                rows,
                fragment_complete,
            } => self.handle_scan_frag_conf(backup_id, cursor, rows, fragment_complete),
            Signal::ScanFragRef { backup_id, error } => {
                self.handle_scan_frag_ref(backup_id, error)
            }
            Signal::TrigAttrInfo {
                trigger_id,
                kind,
                words,
            } => self.handle_trig_attr_info(trigger_id, kind, words),
            Signal::FireTrigOrd {
                trigger_id,
                fragment_id,
                gci,
            } => self.handle_fire_trig_ord(trigger_id, fragment_id, gci),

            Signal::FsOpenConf {
                backup_id,
                file_idx,
                handle,
            } => self.handle_fs_open_conf(backup_id, file_idx, handle),
            Signal::FsOpenRef {
                backup_id,
                file_idx,
            } => self.handle_fs_open_ref(backup_id, file_idx),
            Signal::FsAppendConf {
                backup_id,
                file_idx,
                words,
            } => self.handle_fs_append_conf(backup_id, file_idx, words),
            Signal::FsAppendRef {
                backup_id,
                file_idx,
            } => self.handle_fs_append_ref(backup_id, file_idx),
            Signal::FsCloseConf {
                backup_id,
                file_idx,
            } => self.handle_fs_close_conf(backup_id, file_idx),
            Signal::FsCloseRef {
                backup_id,
                file_idx,
            } => self.handle_fs_close_ref(backup_id, file_idx),

            Signal::ContinueB(cont) => self.handle_continue_b(cont),
        }
    }

    fn handle_continue_b(&mut self, cont: ContinueB) {
        match cont {
            ContinueB::RateTick => self.handle_rate_tick(),
            ContinueB::DrainFile {
                backup_id,
                file_idx,
            } => self.handle_drain_file(backup_id, file_idx),
            ContinueB::FetchTableMeta {
                backup_id,
                table_idx,
            } => self.handle_fetch_table_meta(backup_id, table_idx),
            ContinueB::RetryScan {
                backup_id,
                table_id,
                fragment_no,
            } => self.handle_retry_scan(backup_id, table_id, fragment_no),
            ContinueB::ScanNext { backup_id } => self.handle_scan_next(backup_id),
            ContinueB::FragmentInfo {
                backup_id,
                table_idx,
                frag_idx,
            } => self.handle_fragment_info(backup_id, table_idx, frag_idx),
            ContinueB::RetrySequence { token } => self.handle_retry_sequence(token),
        }
    }

    fn handle_rate_tick(&mut self) {
        let next = self.governor.on_tick(tokio::time::Instant::now());
        self.post_self_delayed(Signal::ContinueB(ContinueB::RateTick), next);
    }

    // --- service call wrappers; each posts its Conf/Ref back to self ---

    pub(crate) fn spawn_sequence_next(&self, token: u32) {
        let svc = Arc::clone(&self.services.sequence);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.next_val(BACKUP_SEQUENCE).await {
                Ok(value) => Signal::UtilSequenceConf { token, value },
                Err(e) => Signal::UtilSequenceRef {
                    token,
                    transient: e.is_transient(),
                },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_mutex_lock(&self, backup_id: BackupId, mutex: MutexId) {
        let svc = Arc::clone(&self.services.mutex);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.lock(mutex).await {
                Ok(()) => Signal::MutexLocked { backup_id, mutex },
                Err(_) => Signal::MutexLockFailed { backup_id, mutex },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_list_tables(&self, backup_id: BackupId) {
        let svc = Arc::clone(&self.services.dictionary);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.list_tables().await {
                Ok(tables) => Signal::ListTablesConf { backup_id, tables },
                Err(_) => Signal::ListTablesRef { backup_id },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_get_tab_info(&self, backup_id: BackupId, table_idx: usize, table_id: u32) {
        let svc = Arc::clone(&self.services.dictionary);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.get_tab_info(table_id).await {
                Ok(meta) => Signal::GetTabInfoConf {
                    backup_id,
                    table_idx,
                    meta,
                },
                Err(_) => Signal::GetTabInfoRef {
                    backup_id,
                    table_idx,
                },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_create_trigger(&self, backup_id: BackupId, req: CreateTriggerReq) {
        let svc = Arc::clone(&self.services.dictionary);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        let table_id = req.table_id;
        let trigger_id = req.trigger_id;
        tokio::spawn(async move {
            let signal = match svc.create_trigger(req).await {
                Ok(()) => Signal::CreateTrigConf {
                    backup_id,
                    table_id,
                    trigger_id,
                },
                Err(_) => Signal::CreateTrigRef {
                    backup_id,
                    table_id,
                    trigger_id,
                },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_drop_trigger(&self, backup_id: BackupId, trigger_id: u32) {
        let svc = Arc::clone(&self.services.dictionary);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.drop_trigger(trigger_id).await {
                Ok(()) => Signal::DropTrigConf {
                    backup_id,
                    trigger_id,
                },
                Err(_) => Signal::DropTrigRef {
                    backup_id,
                    trigger_id,
                },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_lock_table(
        &self,
        backup_id: BackupId,
        table_idx: usize,
        table_id: u32,
        lock: bool,
    ) {
        let svc = Arc::clone(&self.services.dictionary);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.lock_table(table_id, lock).await {
                Ok(()) => Signal::BackupLockTabConf {
                    backup_id,
                    table_idx,
                    locked: lock,
                },
                Err(_) => Signal::BackupLockTabRef {
                    backup_id,
                    table_idx,
                },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_dih_scan_tab(&self, backup_id: BackupId, table_idx: usize, table_id: u32) {
        let svc = Arc::clone(&self.services.distribution);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.scan_tab(table_id).await {
                Ok((fragment_count, scan_cookie)) => Signal::DihScanTabConf {
                    backup_id,
                    table_idx,
                    fragment_count,
                    scan_cookie,
                },
                Err(_) => Signal::DihScanTabRef {
                    backup_id,
                    table_idx,
                },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_dih_scan_get_nodes(
        &self,
        backup_id: BackupId,
        table_idx: usize,
        table_id: u32,
        fragment_no: u32,
    ) {
        let svc = Arc::clone(&self.services.distribution);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.scan_get_nodes(table_id, fragment_no).await {
                Ok(placement) => Signal::DihScanGetNodesConf {
                    backup_id,
                    table_idx,
                    fragment_no,
                    node: placement.node,
                    instance_key: placement.instance_key,
                },
                Err(_) => Signal::DihScanGetNodesRef {
                    backup_id,
                    table_idx,
                    fragment_no,
                },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_dih_scan_tab_complete(&self, table_id: u32, scan_cookie: u64) {
        let svc = Arc::clone(&self.services.distribution);
        tokio::spawn(async move {
            svc.scan_tab_complete(table_id, scan_cookie).await;
        });
    }

    pub(crate) fn spawn_wait_gcp(&self, backup_id: BackupId) {
        let svc = Arc::clone(&self.services.distribution);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.wait_gcp_complete_force_start().await {
                Ok(gci) => Signal::WaitGcpConf { backup_id, gci },
                Err(_) => Signal::WaitGcpRef { backup_id },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_scan_open(&self, backup_id: BackupId, req: ScanFragReq) {
        let svc = Arc::clone(&self.services.row_store);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.scan_frag(req).await {
                Ok(mut cursor) => match cursor.next_batch().await {
                    Ok(batch) => Signal::ScanFragConf {
                        backup_id,
                        cursor,
                        rows: batch.rows,
                        fragment_complete: batch.fragment_complete,
                    },
                    Err(error) => Signal::ScanFragRef { backup_id, error },
                },
                Err(error) => Signal::ScanFragRef { backup_id, error },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_scan_next(&self, backup_id: BackupId, mut cursor: Box<dyn ScanCursor>) {
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match cursor.next_batch().await {
                Ok(batch) => Signal::ScanFragConf {
                    backup_id,
                    cursor,
                    rows: batch.rows,
                    fragment_complete: batch.fragment_complete,
                },
                Err(error) => Signal::ScanFragRef { backup_id, error },
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_fs_open(&self, backup_id: BackupId, file_idx: usize, req: FsOpenReq) {
        let svc = Arc::clone(&self.services.file_system);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.open(req).await {
                Ok(handle) => Signal::FsOpenConf {
                    backup_id,
                    file_idx,
                    handle,
                },
                Err(e) => {
                    warn!("backup file open failed: {e}");
                    Signal::FsOpenRef {
                        backup_id,
                        file_idx,
                    }
                }
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_fs_append(
        &self,
        backup_id: BackupId,
        file_idx: usize,
        handle: u64,
        data: bytes::Bytes,
        words: usize,
    ) {
        let svc = Arc::clone(&self.services.file_system);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.append(handle, data).await {
                Ok(()) => Signal::FsAppendConf {
                    backup_id,
                    file_idx,
                    words,
                },
                Err(e) => {
                    warn!("backup file append failed: {e}");
                    Signal::FsAppendRef {
                        backup_id,
                        file_idx,
                    }
                }
            };
            bus.send(me, me, signal);
        });
    }

    pub(crate) fn spawn_fs_close(
        &self,
        backup_id: BackupId,
        file_idx: usize,
        handle: u64,
        remove: bool,
    ) {
        let svc = Arc::clone(&self.services.file_system);
        let bus = Arc::clone(&self.bus);
        let me = self.node_id;
        tokio::spawn(async move {
            let signal = match svc.close(handle, remove).await {
                Ok(()) => Signal::FsCloseConf {
                    backup_id,
                    file_idx,
                },
                Err(e) => {
                    warn!("backup file close failed: {e}");
                    Signal::FsCloseRef {
                        backup_id,
                        file_idx,
                    }
                }
            };
            bus.send(me, me, signal);
        });
    }
}

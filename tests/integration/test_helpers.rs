// tests/integration/test_helpers.rs

//! In-memory cluster harness: a signal bus, N backup nodes, and stub
//! implementations of the six cluster services, wired so tests can drive
//! complete backups, inject traffic, block I/O, and kill nodes.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use peridotdb_backup::config::BackupConfig;
use peridotdb_backup::core::events::BackupEvent;
use peridotdb_backup::core::node::{BackupNode, ClusterBus, NodeId};
use peridotdb_backup::core::services::{
    CreateTriggerReq, DictionaryService, DistributionService, FileSystem, FragmentPlacement,
    FsOpenReq, MutexService, RowStore, ScanBatch, ScanCursor, ScanErrorCode, ScanFragReq,
    SequenceError, SequenceService, ServiceError, Services, TableBrief, TableMeta, TableType,
};
use peridotdb_backup::core::signals::{
    AttrKind, BackupReqFlags, ClientHandle, ClientReply, MutexId, NodeSet, Signal, TriggerEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};

/// Pseudo node id used as the sender of client-originated signals.
pub const CLIENT_NODE: NodeId = 0;

// ---------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------

pub struct MemSequence {
    next: AtomicU64,
    /// Remaining transient failures to inject before succeeding.
    pub transient_failures: AtomicU32,
}

impl MemSequence {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            transient_failures: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SequenceService for MemSequence {
    async fn next_val(&self, _sequence_id: u32) -> Result<u64, SequenceError> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(SequenceError::Transient);
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------
// Mutexes
// ---------------------------------------------------------------------

pub struct MemMutex {
    define: Arc<Mutex<()>>,
    dict: Arc<Mutex<()>>,
    held: DashMap<&'static str, tokio::sync::OwnedMutexGuard<()>>,
}

impl MemMutex {
    pub fn new() -> Self {
        Self {
            define: Arc::new(Mutex::new(())),
            dict: Arc::new(Mutex::new(())),
            held: DashMap::new(),
        }
    }

    fn key(mutex: MutexId) -> &'static str {
        match mutex {
            MutexId::BackupDefine => "define",
            MutexId::DictCommitTable => "dict",
        }
    }
}

#[async_trait]
impl MutexService for MemMutex {
    async fn lock(&self, mutex: MutexId) -> Result<(), ServiceError> {
        let target = match mutex {
            MutexId::BackupDefine => Arc::clone(&self.define),
            MutexId::DictCommitTable => Arc::clone(&self.dict),
        };
        let guard = target.lock_owned().await;
        self.held.insert(Self::key(mutex), guard);
        Ok(())
    }

    fn unlock(&self, mutex: MutexId) {
        self.held.remove(Self::key(mutex));
    }
}

// ---------------------------------------------------------------------
// Dictionary + row store share the table/trigger world
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct TableDef {
    pub table_id: u32,
    pub attr_count: u32,
    pub max_row_words: u32,
    pub descriptor: Vec<u32>,
    /// Rows per fragment.
    pub fragments: Vec<Vec<Vec<u32>>>,
    /// Owning node per fragment.
    pub placement: Vec<NodeId>,
}

pub struct ClusterWorld {
    pub tables: Mutex<Vec<TableDef>>,
    pub triggers: DashMap<u32, CreateTriggerReq>,
    pub gci: AtomicU32,
    /// wait_gcp calls with ordinal >= this block until release; 0 = never.
    pub gcp_block_from: AtomicU32,
    pub gcp_calls: AtomicU32,
    gcp_release: Notify,
    /// Fragments whose scans hang until release.
    pub hung_scans: DashSet<(u32, u32)>,
    scan_release: Notify,
    pub locked_tables: DashSet<u32>,
    bus: Arc<ClusterBus>,
}

impl ClusterWorld {
    pub fn new(bus: Arc<ClusterBus>) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Vec::new()),
            triggers: DashMap::new(),
            gci: AtomicU32::new(100),
            gcp_block_from: AtomicU32::new(0),
            gcp_calls: AtomicU32::new(0),
            gcp_release: Notify::new(),
            hung_scans: DashSet::new(),
            scan_release: Notify::new(),
            locked_tables: DashSet::new(),
            bus,
        })
    }

    pub async fn add_table(&self, def: TableDef) {
        self.tables.lock().await.push(def);
    }

    /// Blocks the stop barrier (every wait_gcp call after the start one).
    pub fn hold_stop_barrier(&self) {
        self.gcp_block_from.store(2, Ordering::SeqCst);
    }

    pub fn release_gcp(&self) {
        self.gcp_block_from.store(0, Ordering::SeqCst);
        self.gcp_release.notify_waiters();
    }

    pub fn hang_scan(&self, table_id: u32, fragment: u32) {
        self.hung_scans.insert((table_id, fragment));
    }

    pub fn release_scans(&self) {
        self.hung_scans.clear();
        self.scan_release.notify_waiters();
    }

    /// Count of installed triggers for one table across all nodes.
    pub fn trigger_count(&self, table_id: u32) -> usize {
        self.triggers
            .iter()
            .filter(|t| t.value().table_id == table_id)
            .count()
    }

    /// Fires the installed triggers for a mutation, the way the row store
    /// does when a committed transaction touches a monitored table.
    pub async fn fire_mutation(
        &self,
        table_id: u32,
        fragment: u32,
        event: TriggerEvent,
        row: Vec<u32>,
    ) {
        let gci = self.gci.load(Ordering::SeqCst);
        for entry in self.triggers.iter() {
            let req = entry.value();
            if req.table_id != table_id || req.event != event {
                continue;
            }
            let kind = match event {
                TriggerEvent::Insert | TriggerEvent::Update => AttrKind::AfterValues,
                TriggerEvent::Delete => AttrKind::PrimaryKey,
            };
            self.bus.send(
                req.receiver,
                req.receiver,
                Signal::TrigAttrInfo {
                    trigger_id: req.trigger_id,
                    kind,
                    words: row.clone(),
                },
            );
            self.bus.send(
                req.receiver,
                req.receiver,
                Signal::FireTrigOrd {
                    trigger_id: req.trigger_id,
                    fragment_id: fragment,
                    gci,
                },
            );
        }
    }
}

pub struct MemDictionary {
    world: Arc<ClusterWorld>,
}

#[async_trait]
impl DictionaryService for MemDictionary {
    async fn list_tables(&self) -> Result<Vec<TableBrief>, ServiceError> {
        Ok(self
            .world
            .tables
            .lock()
            .await
            .iter()
            .map(|t| TableBrief {
                table_id: t.table_id,
                table_type: TableType::UserTable,
                online: true,
            })
            .collect())
    }

    async fn get_tab_info(&self, table_id: u32) -> Result<TableMeta, ServiceError> {
        self.world
            .tables
            .lock()
            .await
            .iter()
            .find(|t| t.table_id == table_id)
            .map(|t| TableMeta {
                table_id: t.table_id,
                table_type: TableType::UserTable,
                schema_version: 1,
                attr_count: t.attr_count,
                max_row_words: t.max_row_words,
                descriptor: t.descriptor.clone(),
            })
            .ok_or_else(|| ServiceError(format!("no table {table_id}")))
    }

    async fn create_trigger(&self, req: CreateTriggerReq) -> Result<(), ServiceError> {
        self.world.triggers.insert(req.trigger_id, req);
        Ok(())
    }

    async fn drop_trigger(&self, trigger_id: u32) -> Result<(), ServiceError> {
        self.world.triggers.remove(&trigger_id);
        Ok(())
    }

    async fn lock_table(&self, table_id: u32, lock: bool) -> Result<(), ServiceError> {
        if lock {
            self.world.locked_tables.insert(table_id);
        } else {
            self.world.locked_tables.remove(&table_id);
        }
        Ok(())
    }
}

pub struct MemDistribution {
    world: Arc<ClusterWorld>,
}

#[async_trait]
impl DistributionService for MemDistribution {
    async fn scan_tab(&self, table_id: u32) -> Result<(u32, u64), ServiceError> {
        self.world
            .tables
            .lock()
            .await
            .iter()
            .find(|t| t.table_id == table_id)
            .map(|t| (t.fragments.len() as u32, u64::from(table_id)))
            .ok_or_else(|| ServiceError(format!("no table {table_id}")))
    }

    async fn scan_get_nodes(
        &self,
        table_id: u32,
        fragment_id: u32,
    ) -> Result<FragmentPlacement, ServiceError> {
        self.world
            .tables
            .lock()
            .await
            .iter()
            .find(|t| t.table_id == table_id)
            .and_then(|t| t.placement.get(fragment_id as usize).copied())
            .map(|node| FragmentPlacement {
                node,
                instance_key: 1,
            })
            .ok_or_else(|| ServiceError(format!("no fragment {table_id}/{fragment_id}")))
    }

    async fn scan_tab_complete(&self, _table_id: u32, _scan_cookie: u64) {}

    async fn wait_gcp_complete_force_start(&self) -> Result<u32, ServiceError> {
        let call = self.world.gcp_calls.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let block_from = self.world.gcp_block_from.load(Ordering::SeqCst);
            if block_from == 0 || call < block_from {
                break;
            }
            self.world.gcp_release.notified().await;
        }
        Ok(self.world.gci.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

// ---------------------------------------------------------------------
// Row store
// ---------------------------------------------------------------------

pub struct MemRowStore {
    world: Arc<ClusterWorld>,
}

struct MemScanCursor {
    rows: Vec<Vec<u32>>,
    pos: usize,
    batch: usize,
}

#[async_trait]
impl ScanCursor for MemScanCursor {
    async fn next_batch(&mut self) -> Result<ScanBatch, ScanErrorCode> {
        let end = (self.pos + self.batch).min(self.rows.len());
        let rows = self.rows[self.pos..end].to_vec();
        self.pos = end;
        Ok(ScanBatch {
            rows,
            fragment_complete: self.pos == self.rows.len(),
        })
    }
}

#[async_trait]
impl RowStore for MemRowStore {
    async fn scan_frag(&self, req: ScanFragReq) -> Result<Box<dyn ScanCursor>, ScanErrorCode> {
        while self
            .world
            .hung_scans
            .contains(&(req.table_id, req.fragment_id))
        {
            self.world.scan_release.notified().await;
        }
        let rows = self
            .world
            .tables
            .lock()
            .await
            .iter()
            .find(|t| t.table_id == req.table_id)
            .and_then(|t| t.fragments.get(req.fragment_id as usize).cloned())
            .ok_or(ScanErrorCode::Other(1))?;
        Ok(Box::new(MemScanCursor {
            rows,
            pos: 0,
            batch: req.batch_size as usize,
        }))
    }
}

// ---------------------------------------------------------------------
// File system
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MemFs {
    pub files: DashMap<String, Vec<u8>>,
    handles: DashMap<u64, String>,
    next_handle: AtomicU64,
    /// While set, appends hang until release.
    append_blocked: std::sync::atomic::AtomicBool,
    append_release: Notify,
    pub removed: DashSet<String>,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            ..Default::default()
        })
    }

    pub fn block_appends(&self) {
        self.append_blocked.store(true, Ordering::SeqCst);
    }

    pub fn release_appends(&self) {
        self.append_blocked.store(false, Ordering::SeqCst);
        self.append_release.notify_waiters();
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.get(name).map(|f| f.clone())
    }
}

#[async_trait]
impl FileSystem for MemFs {
    async fn open(&self, req: FsOpenReq) -> std::io::Result<u64> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.files.entry(req.name.clone()).or_default();
        self.handles.insert(handle, req.name);
        Ok(handle)
    }

    async fn append(&self, handle: u64, data: Bytes) -> std::io::Result<()> {
        while self.append_blocked.load(Ordering::SeqCst) {
            self.append_release.notified().await;
        }
        let name = self
            .handles
            .get(&handle)
            .map(|n| n.clone())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no handle"))?;
        self.files
            .get_mut(&name)
            .expect("opened file vanished")
            .extend_from_slice(&data);
        Ok(())
    }

    async fn close(&self, handle: u64, remove: bool) -> std::io::Result<()> {
        let (_, name) = self
            .handles
            .remove(&handle)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no handle"))?;
        if remove {
            self.files.remove(&name);
            self.removed.insert(name);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> std::io::Result<()> {
        self.files.remove(name);
        self.removed.insert(name.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------
// The cluster itself
// ---------------------------------------------------------------------

pub struct TestCluster {
    pub bus: Arc<ClusterBus>,
    pub world: Arc<ClusterWorld>,
    pub fs: Arc<MemFs>,
    pub sequence: Arc<MemSequence>,
    pub shutdown: broadcast::Sender<()>,
    pub events: BTreeMap<NodeId, broadcast::Receiver<BackupEvent>>,
    pub node_ids: Vec<NodeId>,
}

impl TestCluster {
    /// Builds and spawns `n` nodes (ids 1..=n), node 1 designated master.
    pub async fn start(n: u32, config: BackupConfig) -> Self {
        Self::start_with(n, config, |_| {}).await
    }

    /// Same, with a pre-spawn hook for per-node tweaks.
    pub async fn start_with(
        n: u32,
        config: BackupConfig,
        tweak: impl Fn(&mut BackupNode),
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let bus = ClusterBus::new();
        let world = ClusterWorld::new(Arc::clone(&bus));
        let fs = MemFs::new();
        let sequence = Arc::new(MemSequence::new(1));
        let mutex = Arc::new(MemMutex::new());
        let (shutdown, _) = broadcast::channel(1);

        let node_ids: Vec<NodeId> = (1..=n).collect();
        let mut events = BTreeMap::new();
        for &id in &node_ids {
            let services = Services {
                sequence: Arc::clone(&sequence) as Arc<dyn SequenceService>,
                mutex: Arc::clone(&mutex) as Arc<dyn MutexService>,
                dictionary: Arc::new(MemDictionary {
                    world: Arc::clone(&world),
                }),
                distribution: Arc::new(MemDistribution {
                    world: Arc::clone(&world),
                }),
                row_store: Arc::new(MemRowStore {
                    world: Arc::clone(&world),
                }),
                file_system: Arc::clone(&fs) as Arc<dyn FileSystem>,
            };
            let mut node = BackupNode::new(
                id,
                1,
                &node_ids,
                config.clone(),
                Arc::clone(&bus),
                services,
            );
            tweak(&mut node);
            events.insert(id, node.subscribe_events());
            tokio::spawn(node.run(shutdown.subscribe()));
        }

        Self {
            bus,
            world,
            fs,
            sequence,
            shutdown,
            events,
            node_ids,
        }
    }

    /// Submits a backup request to the designated master node.
    pub fn submit_backup(
        &self,
        flags: BackupReqFlags,
    ) -> mpsc::UnboundedReceiver<ClientReply> {
        let (client, rx) = ClientHandle::channel(7);
        self.bus.send(
            CLIENT_NODE,
            1,
            Signal::BackupReq {
                client,
                flags,
                backup_data_len: 0,
                input_backup_id: None,
            },
        );
        rx
    }

    /// Kills a node: its signal route vanishes, then the survivors learn.
    pub fn kill_node(&self, dead: NodeId, new_master: NodeId) {
        self.bus.deregister(dead);
        let failed: NodeSet = [dead].into_iter().collect();
        for &id in &self.node_ids {
            if id != dead {
                self.bus.send(
                    CLIENT_NODE,
                    id,
                    Signal::NodeFailRep {
                        failed: failed.clone(),
                        new_master,
                    },
                );
            }
        }
    }

    pub fn send_to_node(&self, node: NodeId, signal: Signal) {
        self.bus.send(CLIENT_NODE, node, signal);
    }
}

/// A small single-table world: `frags` fragments placed round-robin over the
/// nodes, each fragment holding `rows_per_frag` four-word rows.
pub async fn seed_simple_table(
    world: &ClusterWorld,
    table_id: u32,
    frags: usize,
    rows_per_frag: usize,
    nodes: &[NodeId],
) {
    let fragments: Vec<Vec<Vec<u32>>> = (0..frags)
        .map(|f| {
            (0..rows_per_frag)
                .map(|r| vec![f as u32, r as u32, 0xCAFE, 0xBEEF])
                .collect()
        })
        .collect();
    let placement: Vec<NodeId> = (0..frags).map(|f| nodes[f % nodes.len()]).collect();
    world
        .add_table(TableDef {
            table_id,
            attr_count: 4,
            max_row_words: 8,
            descriptor: vec![0xD1C7, table_id, 4],
            fragments,
            placement,
        })
        .await;
}

/// Waits for the next client reply with a timeout.
pub async fn next_reply(rx: &mut mpsc::UnboundedReceiver<ClientReply>) -> ClientReply {
    tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("timed out waiting for a client reply")
        .expect("client channel closed")
}

/// Waits for the next event with a timeout.
pub async fn next_event(rx: &mut broadcast::Receiver<BackupEvent>) -> BackupEvent {
    tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// A config small enough for tests to exercise buffer boundaries quickly.
pub fn small_config() -> BackupConfig {
    BackupConfig {
        data_buffer_size: 64 * 1024,
        log_buffer_size: 64 * 1024,
        min_write_size: 2 * 1024,
        max_write_size: 8 * 1024,
        disk_sync_size: 16 * 1024,
        disk_write_speed: 50 * 1024 * 1024,
        rate_tick: Duration::from_millis(100),
        monitor_window: Duration::from_secs(1),
        ..Default::default()
    }
}

// tests/integration/failure_test.rs

//! Failure-path tests: log-buffer back-pressure, node death, master
//! failover, duplicate aborts, and request rejections.

use super::test_helpers::*;
use peridotdb_backup::config::BackupConfig;
use peridotdb_backup::core::errors::{AbortReason, ErrorCode};
use peridotdb_backup::core::fileset::backup_file_name;
use peridotdb_backup::core::format::FileType;
use peridotdb_backup::core::signals::{
    BackupReqFlags, ClientHandle, ClientReply, Signal, TriggerEvent,
};
use std::time::Duration;
use tokio::time::Instant;

fn wait_flags() -> BackupReqFlags {
    BackupReqFlags::WAIT_STARTED | BackupReqFlags::WAIT_COMPLETED
}

/// A configuration whose log buffer drowns after a few dozen captured
/// mutations once appends stop draining.
fn tiny_log_config() -> BackupConfig {
    BackupConfig {
        data_buffer_size: 16 * 1024,
        log_buffer_size: 4 * 1024,
        min_write_size: 512,
        max_write_size: 1024,
        disk_sync_size: 4 * 1024,
        disk_write_speed: 50 * 1024 * 1024,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_log_buffer_full_aborts_and_removes_files() {
    let cluster = TestCluster::start(2, tiny_log_config()).await;
    cluster
        .world
        .add_table(TableDef {
            table_id: 10,
            attr_count: 4,
            max_row_words: 8,
            descriptor: vec![1],
            fragments: vec![vec![vec![0, 0, 0, 0]]],
            placement: vec![1],
        })
        .await;

    cluster.world.hold_stop_barrier();
    cluster.fs.block_appends();
    let mut rx = cluster.submit_backup(wait_flags());

    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while cluster.world.trigger_count(10) < 6 {
        assert!(Instant::now() < deadline, "triggers never armed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Flood the log buffer until the owning node runs out of room.
    for i in 0..400u32 {
        cluster
            .world
            .fire_mutation(10, 0, TriggerEvent::Insert, vec![i, 1, 2, 3])
            .await;
    }

    match next_reply(&mut rx).await {
        ClientReply::BackupAbortRep { reason, .. } => {
            assert_eq!(reason, ErrorCode::LogBufferFull);
        }
        other => panic!("expected BackupAbortRep, got {other:?}"),
    }

    // Once the file system drains again, the abort path removes the files.
    cluster.fs.release_appends();
    cluster.world.release_gcp();
    let names: Vec<String> = cluster
        .node_ids
        .iter()
        .flat_map(|&n| {
            [
                backup_file_name(backup_id, n, FileType::Ctl),
                backup_file_name(backup_id, n, FileType::Log),
                backup_file_name(backup_id, n, FileType::Data),
            ]
        })
        .collect();
    let deadline = Instant::now() + Duration::from_secs(10);
    while names.iter().any(|n| cluster.fs.file(n).is_some()) {
        assert!(Instant::now() < deadline, "errored backup files not removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_master_failover_mid_scan_aborts_to_client() {
    let cluster = TestCluster::start(3, small_config()).await;
    cluster
        .world
        .add_table(TableDef {
            table_id: 10,
            attr_count: 4,
            max_row_words: 8,
            descriptor: vec![1],
            fragments: vec![
                vec![vec![0, 0, 0, 0], vec![0, 1, 0, 0]],
                vec![vec![1, 0, 0, 0]],
            ],
            placement: vec![2, 3],
        })
        .await;

    // Node 2's fragment hangs mid-scan.
    cluster.world.hang_scan(10, 0);
    let mut rx = cluster.submit_backup(wait_flags());

    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };

    // Let the fragment requests go out, then kill the coordinator.
    tokio::time::sleep(Duration::from_millis(300)).await;
    cluster.kill_node(1, 3);

    match next_reply(&mut rx).await {
        ClientReply::BackupAbortRep {
            backup_id: id,
            reason,
        } => {
            assert_eq!(id, backup_id);
            assert_eq!(reason, ErrorCode::NodeFailure);
        }
        other => panic!("expected BackupAbortRep, got {other:?}"),
    }

    cluster.world.release_scans();

    // The survivors clean up fully.
    for node in [2u32, 3] {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let (client, mut status_rx) = ClientHandle::channel(1);
            cluster.send_to_node(node, Signal::BackupStatusReq { client });
            match next_reply(&mut status_rx).await {
                ClientReply::BackupStatusConf { backups } if backups.is_empty() => break,
                ClientReply::BackupStatusConf { .. } => {
                    assert!(Instant::now() < deadline, "node {node} never released");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => panic!("expected BackupStatusConf, got {other:?}"),
            }
        }
    }

    // The id is spent: the next backup (now coordinated by node 3) draws a
    // fresh one from the sequence.
    let (client, mut rx2) = ClientHandle::channel(2);
    cluster.send_to_node(
        3,
        Signal::BackupReq {
            client,
            flags: wait_flags(),
            backup_data_len: 0,
            input_backup_id: None,
        },
    );
    match next_reply(&mut rx2).await {
        ClientReply::BackupConf { backup_id: id2, .. } => assert_ne!(id2, backup_id),
        other => panic!("expected BackupConf, got {other:?}"),
    }
}

#[tokio::test]
async fn test_participant_death_aborts_backup() {
    let cluster = TestCluster::start(2, small_config()).await;
    seed_simple_table(&cluster.world, 10, 2, 4, &cluster.node_ids).await;

    // Node 2's fragment hangs so the backup is still in flight when it dies.
    cluster.world.hang_scan(10, 1);
    let mut rx = cluster.submit_backup(wait_flags());

    match next_reply(&mut rx).await {
        ClientReply::BackupConf { .. } => {}
        other => panic!("expected BackupConf, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.kill_node(2, 1);

    match next_reply(&mut rx).await {
        ClientReply::BackupAbortRep { reason, .. } => {
            assert_eq!(reason, ErrorCode::NodeFailure);
        }
        other => panic!("expected BackupAbortRep, got {other:?}"),
    }
    cluster.world.release_scans();
}

#[tokio::test]
async fn test_duplicate_abort_yields_one_reply() {
    let cluster = TestCluster::start(2, small_config()).await;
    seed_simple_table(&cluster.world, 10, 1, 2, &cluster.node_ids).await;

    cluster.world.hold_stop_barrier();
    let mut rx = cluster.submit_backup(wait_flags());
    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };

    // A client abort racing a participant error: one report, first reason.
    cluster.send_to_node(
        1,
        Signal::AbortBackupOrd {
            backup_id,
            reason: AbortReason::ClientAbort,
        },
    );
    cluster.send_to_node(
        1,
        Signal::AbortBackupOrd {
            backup_id,
            reason: AbortReason::LogBufferFull,
        },
    );

    match next_reply(&mut rx).await {
        ClientReply::BackupAbortRep { reason, .. } => {
            assert_eq!(reason, ErrorCode::ClientAbort);
        }
        other => panic!("expected BackupAbortRep, got {other:?}"),
    }
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "client received a second abort report");
    cluster.world.release_gcp();
}

#[tokio::test]
async fn test_diskless_node_rejects_backup() {
    let config = BackupConfig {
        diskless: true,
        ..small_config()
    };
    let cluster = TestCluster::start(1, config).await;
    let mut rx = cluster.submit_backup(wait_flags());
    match next_reply(&mut rx).await {
        ClientReply::BackupRef { error } => assert_eq!(error, ErrorCode::Diskless),
        other => panic!("expected BackupRef, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_master_rejects_backup() {
    let cluster = TestCluster::start(2, small_config()).await;
    let (client, mut rx) = ClientHandle::channel(1);
    cluster.send_to_node(
        2,
        Signal::BackupReq {
            client,
            flags: wait_flags(),
            backup_data_len: 0,
            input_backup_id: None,
        },
    );
    match next_reply(&mut rx).await {
        ClientReply::BackupRef { error } => assert_eq!(error, ErrorCode::NotMaster),
        other => panic!("expected BackupRef, got {other:?}"),
    }
}

#[tokio::test]
async fn test_version_mismatch_rejects_backup() {
    let cluster = TestCluster::start_with(2, small_config(), |node| {
        node.set_peer_version(2, 0xBAD);
    })
    .await;
    let mut rx = cluster.submit_backup(wait_flags());
    match next_reply(&mut rx).await {
        ClientReply::BackupRef { error } => {
            assert_eq!(error, ErrorCode::IncompatibleVersions);
        }
        other => panic!("expected BackupRef, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sequence_transient_failures_are_retried() {
    let cluster = TestCluster::start(1, small_config()).await;
    seed_simple_table(&cluster.world, 10, 1, 1, &cluster.node_ids).await;
    cluster
        .sequence
        .transient_failures
        .store(2, std::sync::atomic::Ordering::SeqCst);

    let mut rx = cluster.submit_backup(wait_flags());
    match next_reply(&mut rx).await {
        ClientReply::BackupConf { .. } => {}
        other => panic!("expected BackupConf after retries, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sequence_permanent_failure_refuses() {
    let cluster = TestCluster::start(1, small_config()).await;
    cluster
        .sequence
        .transient_failures
        .store(100, std::sync::atomic::Ordering::SeqCst);

    let mut rx = cluster.submit_backup(wait_flags());
    match next_reply(&mut rx).await {
        ClientReply::BackupRef { error } => assert_eq!(error, ErrorCode::SequenceFailure),
        other => panic!("expected BackupRef, got {other:?}"),
    }
}

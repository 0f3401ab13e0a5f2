// tests/integration/backup_lifecycle_test.rs

//! End-to-end lifecycle tests: clean backups, traffic capture, empty
//! clusters, live status, the write-rate ceiling, and the admin channel.

use super::test_helpers::*;
use peridotdb_backup::core::events::BackupEvent;
use peridotdb_backup::core::format::{
    CtlFileContents, DataFileContents, LogEventType, LogFileContents,
};
use peridotdb_backup::core::fileset::backup_file_name;
use peridotdb_backup::core::format::FileType;
use peridotdb_backup::core::signals::{
    BackupReqFlags, ClientHandle, ClientReply, DumpCommand, Signal, TriggerEvent,
};
use std::time::Duration;
use tokio::time::Instant;

fn wait_flags() -> BackupReqFlags {
    BackupReqFlags::WAIT_STARTED | BackupReqFlags::WAIT_COMPLETED
}

#[tokio::test]
async fn test_happy_path_two_nodes() {
    let cluster = TestCluster::start(2, small_config()).await;
    seed_simple_table(&cluster.world, 10, 2, 5, &cluster.node_ids).await;

    let mut rx = cluster.submit_backup(wait_flags());

    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, nodes } => {
            assert_eq!(nodes.len(), 2);
            backup_id
        }
        other => panic!("expected BackupConf, got {other:?}"),
    };

    match next_reply(&mut rx).await {
        ClientReply::BackupCompleteRep {
            backup_id: id,
            start_gcp,
            stop_gcp,
            records,
            log_records,
            log_bytes,
            ..
        } => {
            assert_eq!(id, backup_id);
            assert_eq!(records, 10);
            assert_eq!(log_records, 0);
            assert_eq!(log_bytes, 0);
            assert!(stop_gcp >= start_gcp + 3);
        }
        other => panic!("expected BackupCompleteRep, got {other:?}"),
    }

    // Every node has the three files with the exact framing.
    for &node in &cluster.node_ids {
        let ctl_bytes = cluster
            .fs
            .file(&backup_file_name(backup_id, node, FileType::Ctl))
            .expect("control file missing");
        let ctl = CtlFileContents::parse(&ctl_bytes).expect("control file parses");
        assert_eq!(ctl.header.backup_id, backup_id as u32);
        assert_eq!(ctl.table_list.table_ids, vec![10]);
        assert_eq!(ctl.table_descriptions.len(), 1);
        assert_eq!(ctl.table_descriptions[0].data, vec![0xD1C7, 10, 4]);
        assert_eq!(ctl.gcp.stop_gcp, ctl.gcp.start_gcp + 2);
        // Both nodes carry the full fragment totals.
        assert_eq!(ctl.fragment_info.len(), 2);
        assert!(ctl.fragment_info.iter().all(|f| f.records == 5));

        let log_bytes = cluster
            .fs
            .file(&backup_file_name(backup_id, node, FileType::Log))
            .expect("log file missing");
        let log = LogFileContents::parse(&log_bytes).expect("log file parses");
        assert!(log.entries.is_empty());

        let data_bytes = cluster
            .fs
            .file(&backup_file_name(backup_id, node, FileType::Data))
            .expect("data file missing");
        let data = DataFileContents::parse(&data_bytes).expect("data file parses");
        // One fragment scanned per node (round-robin placement).
        assert_eq!(data.fragments.len(), 1);
        let frag = &data.fragments[0];
        assert_eq!(frag.records.len(), 5);
        assert_eq!(frag.footer.records, 5);
        for row in &frag.records {
            assert_eq!(row.len(), 4);
            assert_eq!(row[2], 0xCAFE);
        }
    }
}

#[tokio::test]
async fn test_traffic_during_backup_is_logged() {
    let cluster = TestCluster::start(2, small_config()).await;
    // One fragment, owned by node 1.
    cluster
        .world
        .add_table(TableDef {
            table_id: 10,
            attr_count: 4,
            max_row_words: 8,
            descriptor: vec![1, 2, 3],
            fragments: vec![vec![vec![0, 0, 0, 0], vec![0, 1, 0, 0], vec![0, 2, 0, 0]]],
            placement: vec![1],
        })
        .await;

    cluster.world.hold_stop_barrier();
    let mut rx = cluster.submit_backup(wait_flags());

    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };

    // Wait until both participants have armed their three triggers.
    let deadline = Instant::now() + Duration::from_secs(10);
    while cluster.world.trigger_count(10) < 6 {
        assert!(Instant::now() < deadline, "triggers never armed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for i in 0..10u32 {
        cluster
            .world
            .fire_mutation(10, 0, TriggerEvent::Insert, vec![9, i, 7, 7])
            .await;
    }
    for i in 0..5u32 {
        cluster
            .world
            .fire_mutation(10, 0, TriggerEvent::Delete, vec![9, i])
            .await;
    }
    cluster.world.release_gcp();

    let (start_gcp, stop_gcp) = match next_reply(&mut rx).await {
        ClientReply::BackupCompleteRep {
            log_records,
            start_gcp,
            stop_gcp,
            ..
        } => {
            assert_eq!(log_records, 15);
            (start_gcp, stop_gcp)
        }
        other => panic!("expected BackupCompleteRep, got {other:?}"),
    };

    // The owning node's log carries the ordered entries; the replica peer
    // discarded the firings for a fragment it does not own.
    let log_bytes = cluster
        .fs
        .file(&backup_file_name(backup_id, 1, FileType::Log))
        .expect("log file missing");
    let log = LogFileContents::parse(&log_bytes).expect("log file parses");
    assert_eq!(log.entries.len(), 15);
    let mut current_gci = None;
    for (i, entry) in log.entries.iter().enumerate() {
        let expected = if i < 10 {
            LogEventType::Insert
        } else {
            LogEventType::Delete
        };
        assert_eq!(entry.event, expected, "entry {i}");
        assert_eq!(entry.table_id, 10);
        assert_eq!(entry.fragment_id, 0);
        if entry.gci.is_some() {
            current_gci = entry.gci;
        }
        let gci = current_gci.expect("first log entry must stamp a gci");
        assert!(gci >= start_gcp && gci <= stop_gcp);
    }

    let peer_log = cluster
        .fs
        .file(&backup_file_name(backup_id, 2, FileType::Log))
        .expect("peer log file missing");
    assert!(
        LogFileContents::parse(&peer_log)
            .expect("peer log parses")
            .entries
            .is_empty()
    );
}

#[tokio::test]
async fn test_undo_log_backup_captures_before_images() {
    let cluster = TestCluster::start(1, small_config()).await;
    cluster
        .world
        .add_table(TableDef {
            table_id: 21,
            attr_count: 2,
            max_row_words: 4,
            descriptor: vec![21],
            fragments: vec![vec![vec![1, 1], vec![2, 2]]],
            placement: vec![1],
        })
        .await;

    cluster.world.hold_stop_barrier();
    let mut rx = cluster.submit_backup(wait_flags() | BackupReqFlags::USE_UNDO_LOG);
    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while cluster.world.trigger_count(21) < 3 {
        assert!(Instant::now() < deadline, "triggers never armed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for i in 0..5u32 {
        cluster
            .world
            .fire_mutation(21, 0, TriggerEvent::Delete, vec![i, i])
            .await;
    }
    cluster.world.release_gcp();

    match next_reply(&mut rx).await {
        ClientReply::BackupCompleteRep { log_records, .. } => assert_eq!(log_records, 5),
        other => panic!("expected BackupCompleteRep, got {other:?}"),
    }

    // The log file identifies itself as an undo log; the parser checks the
    // trailing length echo of every entry.
    let log_bytes = cluster
        .fs
        .file(&backup_file_name(backup_id, 1, FileType::Log))
        .expect("log file missing");
    let log = LogFileContents::parse(&log_bytes).expect("undo log parses");
    assert_eq!(log.header.file_type, FileType::UndoLog);
    assert_eq!(log.entries.len(), 5);
    assert!(log.entries.iter().all(|e| e.event == LogEventType::Delete));
}

#[tokio::test]
async fn test_empty_backup_produces_valid_files() {
    let cluster = TestCluster::start(2, small_config()).await;

    let mut rx = cluster.submit_backup(wait_flags());
    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };
    match next_reply(&mut rx).await {
        ClientReply::BackupCompleteRep { records, .. } => assert_eq!(records, 0),
        other => panic!("expected BackupCompleteRep, got {other:?}"),
    }

    let ctl = CtlFileContents::parse(
        &cluster
            .fs
            .file(&backup_file_name(backup_id, 1, FileType::Ctl))
            .expect("control file missing"),
    )
    .expect("control file parses");
    assert!(ctl.table_list.table_ids.is_empty());
    assert!(ctl.fragment_info.is_empty());
    assert!(ctl.gcp.stop_gcp >= ctl.gcp.start_gcp);

    let log = LogFileContents::parse(
        &cluster
            .fs
            .file(&backup_file_name(backup_id, 1, FileType::Log))
            .expect("log file missing"),
    )
    .expect("log file parses");
    assert!(log.entries.is_empty());

    let data = DataFileContents::parse(
        &cluster
            .fs
            .file(&backup_file_name(backup_id, 1, FileType::Data))
            .expect("data file missing"),
    )
    .expect("data file parses");
    assert!(data.fragments.is_empty());
}

#[tokio::test]
async fn test_status_reports_in_flight_backup() {
    let cluster = TestCluster::start(2, small_config()).await;
    seed_simple_table(&cluster.world, 10, 1, 2, &cluster.node_ids).await;

    cluster.world.hold_stop_barrier();
    let mut rx = cluster.submit_backup(wait_flags());
    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };

    let (status_client, mut status_rx) = ClientHandle::channel(1);
    cluster.send_to_node(1, Signal::BackupStatusReq {
        client: status_client,
    });
    match next_reply(&mut status_rx).await {
        ClientReply::BackupStatusConf { backups } => {
            assert_eq!(backups.len(), 1);
            assert_eq!(backups[0].backup_id, backup_id);
        }
        other => panic!("expected BackupStatusConf, got {other:?}"),
    }

    cluster.world.release_gcp();
    match next_reply(&mut rx).await {
        ClientReply::BackupCompleteRep { .. } => {}
        other => panic!("expected BackupCompleteRep, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disk_write_speed_is_enforced() {
    let config = peridotdb_backup::config::BackupConfig {
        data_buffer_size: 64 * 1024,
        log_buffer_size: 64 * 1024,
        min_write_size: 2 * 1024,
        max_write_size: 4 * 1024,
        disk_sync_size: 16 * 1024,
        // 32 KiB/s: a ~40 KiB table must take over a second to drain.
        disk_write_speed: 32 * 1024,
        ..Default::default()
    };
    let cluster = TestCluster::start(1, config).await;
    seed_simple_table(&cluster.world, 10, 1, 2000, &cluster.node_ids).await;

    let mut rx = cluster.submit_backup(wait_flags());
    match next_reply(&mut rx).await {
        ClientReply::BackupConf { .. } => {}
        other => panic!("expected BackupConf, got {other:?}"),
    }
    let started = Instant::now();
    match next_reply(&mut rx).await {
        ClientReply::BackupCompleteRep { records, .. } => assert_eq!(records, 2000),
        other => panic!("expected BackupCompleteRep, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(500),
        "rate ceiling not applied: finished in {elapsed:?}"
    );
}

#[tokio::test]
async fn test_admin_removes_finished_backup_files() {
    let cluster = TestCluster::start(1, small_config()).await;
    seed_simple_table(&cluster.world, 10, 1, 3, &cluster.node_ids).await;

    let mut rx = cluster.submit_backup(wait_flags());
    let backup_id = match next_reply(&mut rx).await {
        ClientReply::BackupConf { backup_id, .. } => backup_id,
        other => panic!("expected BackupConf, got {other:?}"),
    };
    match next_reply(&mut rx).await {
        ClientReply::BackupCompleteRep { .. } => {}
        other => panic!("expected BackupCompleteRep, got {other:?}"),
    }

    cluster.send_to_node(
        1,
        Signal::DumpStateOrd(DumpCommand::RemoveBackupFiles { backup_id }),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    let names = [
        backup_file_name(backup_id, 1, FileType::Ctl),
        backup_file_name(backup_id, 1, FileType::Log),
        backup_file_name(backup_id, 1, FileType::Data),
    ];
    while names.iter().any(|n| cluster.fs.file(n).is_some()) {
        assert!(Instant::now() < deadline, "backup files were not removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_self_test_backup_completes() {
    let cluster = TestCluster::start(1, small_config()).await;
    seed_simple_table(&cluster.world, 10, 1, 2, &cluster.node_ids).await;

    let mut events = cluster.events;
    let rx = events.get_mut(&1).expect("node 1 events");

    cluster
        .bus
        .send(CLIENT_NODE, 1, Signal::DumpStateOrd(DumpCommand::SelfTestBackup));

    let mut started = false;
    loop {
        match next_event(rx).await {
            BackupEvent::Started { .. } => started = true,
            BackupEvent::Completed { records, .. } => {
                assert!(started, "Completed before Started");
                assert_eq!(records, 2);
                break;
            }
            BackupEvent::Aborted { error, .. } | BackupEvent::FailedToStart { error } => {
                panic!("self-test backup failed: {error}");
            }
        }
    }
}

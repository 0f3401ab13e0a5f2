// src/core/admin.rs

//! The out-of-band dump/diagnostic channel.
//!
//! Management tooling can resize the backup buffers live, change the disk
//! write speed, toggle the compression default, trigger a loop-back
//! self-test backup, remove a finished backup's files, and dump the
//! in-memory records through tracing.

use crate::core::format::FileType;
use crate::core::fileset::backup_file_name;
use crate::core::node::BackupNode;
use crate::core::signals::{
    BackupReqFlags, BackupStatus, ClientHandle, ClientReply, DumpCommand, Signal,
};
use std::sync::Arc;
use tracing::{info, warn};

impl BackupNode {
    pub(crate) fn handle_dump_state_ord(&mut self, cmd: DumpCommand) {
        match cmd {
            DumpCommand::SetDataBufferSize(bytes) => {
                info!("data buffer size override: {bytes} bytes (next backup)");
                self.config.data_buffer_size = bytes;
            }
            DumpCommand::SetLogBufferSize(bytes) => {
                info!("log buffer size override: {bytes} bytes (next backup)");
                self.config.log_buffer_size = bytes;
            }
            DumpCommand::SetDiskWriteSpeed(bytes_per_sec) => {
                info!("disk write speed override: {bytes_per_sec} bytes/s");
                self.config.disk_write_speed = bytes_per_sec;
                let speed = self.config.speed_words_per_tick();
                self.governor.set_speed(speed);
            }
            DumpCommand::ToggleCompression => {
                self.config.compressed_backup = !self.config.compressed_backup;
                info!(
                    "compressed backup default now {}",
                    self.config.compressed_backup
                );
            }
            DumpCommand::SelfTestBackup => {
                info!("issuing self-test backup");
                self.post_self(Signal::BackupReq {
                    client: ClientHandle::discard(),
                    flags: BackupReqFlags::WAIT_COMPLETED,
                    backup_data_len: 0,
                    input_backup_id: None,
                });
            }
            DumpCommand::RemoveBackupFiles { backup_id } => {
                if self.backups.contains_key(&backup_id) {
                    warn!("refusing to remove files of in-flight backup {backup_id}");
                    return;
                }
                let node_id = self.node_id;
                for file_type in [FileType::Ctl, FileType::Log, FileType::Data] {
                    let name = backup_file_name(backup_id, node_id, file_type);
                    let fs = Arc::clone(&self.services.file_system);
                    tokio::spawn(async move {
                        if let Err(e) = fs.remove(&name).await {
                            warn!("could not remove {name}: {e}");
                        }
                    });
                }
            }
            DumpCommand::PrintRecords => {
                for (id, backup) in &self.backups {
                    info!("backup record {id}: {backup:?}");
                }
                for (id, md) in &self.masters {
                    info!("master record {id}: {md:?}");
                }
            }
        }
    }

    pub(crate) fn handle_backup_status_req(&mut self, client: ClientHandle) {
        let backups = self
            .backups
            .values()
            .map(|b| BackupStatus {
                backup_id: b.backup_id,
                state: b.state().to_string(),
                bytes: b.bytes,
                records: b.records,
                log_bytes: b.log_bytes,
                log_records: b.log_records,
            })
            .collect();
        client.send(ClientReply::BackupStatusConf { backups });
    }
}

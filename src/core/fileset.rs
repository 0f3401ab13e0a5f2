// src/core/fileset.rs

//! The per-backup trio of append-only files and their drain tasks.
//!
//! Each backup opens a control, a log, and a data file named by
//! (backupId, nodeId, suffix). A drain task per file moves committed
//! FlowBuffer windows into FsAppendReqs, gated by the write-rate governor,
//! and closes the file once its producer has marked end-of-stream and the
//! tail is flushed. A file whose backup failed is removed on close.

use crate::core::errors::{AbortReason, ErrorCode};
use crate::core::format::{FileType, words_to_bytes};
use crate::core::node::{BUFFER_BLOCK_WORDS, BackupNode, CTL_BUFFER_WORDS};
use crate::core::records::{BackupFile, FileFlags, SlaveState};
use crate::core::signals::{BackupId, ContinueB, Signal};
use crate::core::buffer::FlowBuffer;
use crate::core::services::{FsOpenFlags, FsOpenReq};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Re-poll delay when a drain finds its buffer empty.
const DRAIN_EMPTY_DELAY: Duration = Duration::from_millis(50);
/// Re-poll delay when a drain finds data below the minimum read size.
const DRAIN_SHORT_DELAY: Duration = Duration::from_millis(20);
/// Re-poll delay when the governor has exhausted the period quota.
const DRAIN_THROTTLED_DELAY: Duration = Duration::from_millis(100);

/// On-disk name of one backup file, unique per (backup, node, suffix).
pub fn backup_file_name(backup_id: BackupId, node_id: u32, file_type: FileType) -> String {
    let suffix = match file_type {
        FileType::Ctl => "ctl",
        FileType::Log | FileType::UndoLog => "log",
        FileType::Data => "data",
        FileType::Lcp => "lcp",
    };
    format!("BACKUP-{backup_id}/BACKUP-{backup_id}.{node_id}.{suffix}")
}

impl BackupNode {
    /// Builds the three file records with their FlowBuffers and issues the
    /// opens. Returns an error code if a buffer cannot be set up.
    pub(crate) fn open_backup_files(&mut self, backup_id: BackupId) -> Result<(), ErrorCode> {
        let min_read = self.config.min_write_words();
        let max_read = self.config.max_write_words();
        let max_write = self.config.max_write_words();
        let data_words = self.config.data_buffer_words();
        let log_words = self.config.log_buffer_words();
        let sync_size = self.config.disk_sync_size;
        let compressed = self.config.compressed_backup;
        let o_direct = self.config.o_direct;
        let node_id = self.node_id;

        // The control file is a trickle; its buffer only needs to fit the
        // metadata sections plus the write-window slack.
        let ctl_words = CTL_BUFFER_WORDS.max(4 * max_write);

        let backup = self
            .backups
            .get_mut(&backup_id)
            .expect("open_backup_files on unknown backup");
        let undo = backup.uses_undo_log();
        let log_type = if undo { FileType::UndoLog } else { FileType::Log };

        let make = |file_type: FileType, words: usize| -> Result<BackupFile, ErrorCode> {
            let buffer = FlowBuffer::setup(words, BUFFER_BLOCK_WORDS, min_read, max_read, max_write)
                .map_err(|e| {
                    error!("backup {backup_id}: FlowBuffer setup failed: {e}");
                    ErrorCode::OutOfBuffers
                })?;
            Ok(BackupFile::new(
                file_type,
                backup_file_name(backup_id, node_id, file_type),
                buffer,
            ))
        };

        // Order matters: ctl, log, data by file index.
        backup.files = vec![
            make(FileType::Ctl, ctl_words)?,
            make(log_type, log_words)?,
            make(FileType::Data, data_words)?,
        ];

        let mut opens = Vec::new();
        for (idx, file) in backup.files.iter_mut().enumerate() {
            let mut flags =
                FsOpenFlags::WRITE_ONLY | FsOpenFlags::CREATE_IF_NONE | FsOpenFlags::APPEND;
            if sync_size > 0 {
                flags |= FsOpenFlags::AUTO_SYNC;
            }
            match file.file_type {
                FileType::Data => {
                    if o_direct {
                        flags |= FsOpenFlags::DIRECT_IO;
                    }
                    if compressed {
                        flags |= FsOpenFlags::COMPRESSED;
                    }
                }
                // An undo log is read back-to-front at restore and is never
                // compressed.
                FileType::Log => {
                    if compressed {
                        flags |= FsOpenFlags::COMPRESSED;
                    }
                }
                _ => {}
            }
            file.flags |= FileFlags::OPENING;
            opens.push((
                idx,
                FsOpenReq {
                    name: file.name.clone(),
                    flags,
                    sync_size,
                },
            ));
        }
        backup.define.files_opening = opens.len();

        for (idx, req) in opens {
            self.spawn_fs_open(backup_id, idx, req);
        }
        Ok(())
    }

    /// Starts the drain task for one file, once.
    pub(crate) fn start_file_thread(&mut self, backup_id: BackupId, file_idx: usize) {
        let Some(backup) = self.backups.get_mut(&backup_id) else {
            return;
        };
        let file = &mut backup.files[file_idx];
        if file.flags.contains(FileFlags::FILE_THREAD) {
            return;
        }
        file.flags |= FileFlags::FILE_THREAD;
        self.post_self(Signal::ContinueB(ContinueB::DrainFile {
            backup_id,
            file_idx,
        }));
    }

    /// One drain step: take a read window, consult the governor, append.
    pub(crate) fn handle_drain_file(&mut self, backup_id: BackupId, file_idx: usize) {
        enum Step {
            Stop,
            Again(Duration),
            Close { handle: u64, remove: bool },
            Append {
                handle: u64,
                data: bytes::Bytes,
                words: usize,
            },
        }

        let write_permitted = self.governor.write_permitted();
        let step = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let Some(file) = backup.files.get_mut(file_idx) else {
                return;
            };
            if !file.flags.contains(FileFlags::FILE_THREAD) {
                return;
            }
            if file.outstanding_words > 0 || file.flags.contains(FileFlags::CLOSING) {
                // The append conf re-posts the drain.
                return;
            }
            match file.buffer.read_window() {
                None => {
                    let delay = if file.buffer.used_words() == 0 {
                        DRAIN_EMPTY_DELAY
                    } else {
                        DRAIN_SHORT_DELAY
                    };
                    Step::Again(delay)
                }
                Some(win) if win.data.is_empty() => {
                    // End of stream, fully flushed.
                    debug_assert!(win.eof);
                    file.flags.remove(FileFlags::FILE_THREAD);
                    match file.handle {
                        Some(handle) => {
                            file.flags |= FileFlags::CLOSING;
                            let remove = file.flags.contains(FileFlags::REMOVE_ON_CLOSE)
                                || file.error.is_set();
                            Step::Close { handle, remove }
                        }
                        None => Step::Stop,
                    }
                }
                Some(win) => {
                    if !write_permitted {
                        Step::Again(DRAIN_THROTTLED_DELAY)
                    } else {
                        let words = win.data.len();
                        let data = words_to_bytes(win.data);
                        let handle = file.handle.expect("draining a file that never opened");
                        file.outstanding_words = words;
                        Step::Append {
                            handle,
                            data,
                            words,
                        }
                    }
                }
            }
        };

        match step {
            Step::Stop => {}
            Step::Again(delay) => self.post_self_delayed(
                Signal::ContinueB(ContinueB::DrainFile {
                    backup_id,
                    file_idx,
                }),
                delay,
            ),
            Step::Close { handle, remove } => {
                self.spawn_fs_close(backup_id, file_idx, handle, remove)
            }
            Step::Append {
                handle,
                data,
                words,
            } => {
                self.governor.note_written(words as u64);
                self.spawn_fs_append(backup_id, file_idx, handle, data, words);
            }
        }
    }

    pub(crate) fn handle_fs_append_conf(
        &mut self,
        backup_id: BackupId,
        file_idx: usize,
        words: usize,
    ) {
        let close = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let Some(file) = backup.files.get_mut(file_idx) else {
                return;
            };
            file.outstanding_words = 0;
            file.buffer.release_read(words);
            file.bytes += (words * 4) as u64;
            if file.close_requested && !file.flags.contains(FileFlags::CLOSING) {
                file.close_requested = false;
                file.flags.remove(FileFlags::FILE_THREAD);
                file.flags |= FileFlags::CLOSING;
                let remove =
                    file.flags.contains(FileFlags::REMOVE_ON_CLOSE) || file.error.is_set();
                file.handle.map(|handle| (handle, remove))
            } else {
                None
            }
        };
        match close {
            Some((handle, remove)) => self.spawn_fs_close(backup_id, file_idx, handle, remove),
            None => self.post_self(Signal::ContinueB(ContinueB::DrainFile {
                backup_id,
                file_idx,
            })),
        }
    }

    /// An append failure marks the file and propagates as a slave abort.
    pub(crate) fn handle_fs_append_ref(&mut self, backup_id: BackupId, file_idx: usize) {
        let master = {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let Some(file) = backup.files.get_mut(file_idx) else {
                return;
            };
            error!(
                "backup {backup_id}: append to {} failed, aborting",
                file.name
            );
            file.outstanding_words = 0;
            file.error = ErrorCode::FileSystemFailure;
            backup.record_error(ErrorCode::FileSystemFailure);
            backup.master
        };
        self.send_to(
            master,
            Signal::AbortBackupOrd {
                backup_id,
                reason: AbortReason::FileOrScanError,
            },
        );
    }

    /// Marks every file for close, flushing through the drains where they
    /// run. Returns how many FsCloseConf/Ref replies will eventually arrive.
    pub(crate) fn close_all_files(&mut self, backup_id: BackupId, remove: bool) -> usize {
        let mut nudge = Vec::new();
        let mut direct = Vec::new();
        let mut closing = 0;

        {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return 0;
            };
            for (idx, file) in backup.files.iter_mut().enumerate() {
                if remove {
                    file.flags |= FileFlags::REMOVE_ON_CLOSE;
                }
                if file.flags.contains(FileFlags::CLOSING) {
                    closing += 1;
                    continue;
                }
                if !file
                    .flags
                    .intersects(FileFlags::OPEN | FileFlags::OPENING)
                {
                    continue;
                }
                file.flags.remove(FileFlags::SCAN_THREAD);
                file.buffer.mark_eof();
                closing += 1;

                if file.flags.contains(FileFlags::OPENING) {
                    // Close as soon as the open reply lands.
                    file.close_requested = true;
                    continue;
                }
                if file.flags.contains(FileFlags::FILE_THREAD) {
                    // The drain flushes the tail and closes.
                    nudge.push(idx);
                    continue;
                }
                if file.outstanding_words > 0 {
                    file.close_requested = true;
                    continue;
                }
                file.flags |= FileFlags::CLOSING;
                let remove_this =
                    file.flags.contains(FileFlags::REMOVE_ON_CLOSE) || file.error.is_set();
                if let Some(handle) = file.handle {
                    direct.push((idx, handle, remove_this));
                } else {
                    // Opened flag without handle cannot happen; keep the
                    // accounting honest anyway.
                    closing -= 1;
                    file.flags.remove(FileFlags::CLOSING);
                }
            }
        }

        for idx in nudge {
            self.post_self(Signal::ContinueB(ContinueB::DrainFile {
                backup_id,
                file_idx: idx,
            }));
        }
        for (idx, handle, remove_this) in direct {
            self.spawn_fs_close(backup_id, idx, handle, remove_this);
        }
        closing
    }

    pub(crate) fn handle_fs_close_conf(&mut self, backup_id: BackupId, file_idx: usize) {
        {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let Some(file) = backup.files.get_mut(file_idx) else {
                return;
            };
            file.flags
                .remove(FileFlags::OPEN | FileFlags::OPENING | FileFlags::CLOSING);
            file.handle = None;
            debug!("backup {backup_id}: closed {}", file.name);
        }
        self.after_file_closed(backup_id);
    }

    pub(crate) fn handle_fs_close_ref(&mut self, backup_id: BackupId, file_idx: usize) {
        {
            let Some(backup) = self.backups.get_mut(&backup_id) else {
                return;
            };
            let Some(file) = backup.files.get_mut(file_idx) else {
                return;
            };
            warn!("backup {backup_id}: close of {} failed", file.name);
            file.flags
                .remove(FileFlags::OPEN | FileFlags::OPENING | FileFlags::CLOSING);
            file.handle = None;
            file.error = ErrorCode::FileSystemFailure;
            backup.record_error(ErrorCode::FileSystemFailure);
        }
        self.after_file_closed(backup_id);
    }

    /// Phase continuation once a file has fully closed.
    fn after_file_closed(&mut self, backup_id: BackupId) {
        let (state, all_closed, master, log_bytes, log_records) = {
            let Some(backup) = self.backups.get(&backup_id) else {
                return;
            };
            let all_closed = backup.files.iter().all(|f| {
                !f.flags
                    .intersects(FileFlags::OPEN | FileFlags::OPENING | FileFlags::CLOSING)
            });
            (
                backup.state(),
                all_closed,
                backup.master,
                backup.log_bytes,
                backup.log_records,
            )
        };
        if !all_closed {
            return;
        }
        match state {
            SlaveState::Stopping => {
                let backup = self.backups.get_mut(&backup_id).expect("checked above");
                backup.set_state(SlaveState::Cleaning);
                let node = self.node_id;
                self.send_to(
                    master,
                    Signal::StopBackupConf {
                        backup_id,
                        node,
                        log_bytes,
                        log_records,
                    },
                );
            }
            SlaveState::Aborting => {
                let backup = self.backups.get_mut(&backup_id).expect("checked above");
                backup.abort.files_closing = 0;
                self.maybe_release_aborted(backup_id);
            }
            other => {
                debug!("backup {backup_id}: all files closed in state {other}");
            }
        }
    }
}

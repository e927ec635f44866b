//! Run finalization: control file, redundant-file deletion, backup label,
//! standby recovery point, fsync.

use std::fs::{self, File};
use std::io::Write;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::catchup::copier::{self, CopyOutcome};
use crate::catchup::inventory::{FileEntry, FileKind};
use crate::catchup::{CatchupConfig, RunState};
use crate::pg::control;
use crate::pg::BACKUP_LABEL_FILE;
use crate::session::StopBackupResult;
use crate::{Error, Result};

/// Finish a successful transfer. Runs strictly after stop-of-backup and after
/// the WAL wait, so the backup label is only ever written over a destination
/// whose WAL directory already covers the window.
pub fn finalize(
    config: &CatchupConfig,
    state: &RunState,
    source_filelist: &[FileEntry],
    control_entry: &FileEntry,
    dest_filelist: &[FileEntry],
    source_paths: &[String],
    stop: &StopBackupResult,
) -> Result<()> {
    copy_control_file(config, control_entry)?;

    if config.mode.is_incremental() {
        delete_redundant(config, dest_filelist, source_paths)?;
    }

    write_backup_label(config, stop)?;
    // The tablespace map from stop-of-backup is intentionally dropped: the
    // symlinks were materialized during the directory pre-creation pass.
    if stop.tablespace_map.is_some() {
        debug!("discarding stop-of-backup tablespace map");
    }

    if state.from_replica {
        control::set_min_recovery_point(&config.dest_pgdata, state.stop_lsn, state.tli)?;
        info!(min_recovery_point = %state.stop_lsn, "fixed minimum recovery point");
    }

    if config.sync_dest_files {
        sync_destination_files(config, source_filelist, control_entry)?;
    } else {
        warn!("files are not synced to disk");
    }

    Ok(())
}

fn copy_control_file(config: &CatchupConfig, control_entry: &FileEntry) -> Result<()> {
    let from = config.source_pgdata.join(&control_entry.rel_path);
    let to = config.dest_pgdata.join(&control_entry.rel_path);
    let report = copier::copy_plain_file(&from, &to, false, true)?;
    match report.outcome {
        CopyOutcome::NotFound => Err(Error::ControlFile {
            path: from.display().to_string(),
            reason: "vanished during catchup".into(),
        }
        .into()),
        _ => {
            debug!(bytes = report.read_size, "control file copied");
            Ok(())
        }
    }
}

/// Remove destination entries with no source counterpart: dropped relations,
/// vanished directories. The list is walked in descending path order so
/// children go before their directories. The control file was excised from
/// the source list but is part of the membership snapshot, so the fresh copy
/// survives.
fn delete_redundant(
    config: &CatchupConfig,
    dest_filelist: &[FileEntry],
    source_paths: &[String],
) -> Result<()> {
    info!("removing redundant files in destination directory");
    let mut removed = 0usize;

    for entry in dest_filelist.iter().rev() {
        if source_paths
            .binary_search_by(|path| path.as_str().cmp(&entry.rel_path))
            .is_ok()
        {
            continue;
        }

        let fullpath = config.dest_pgdata.join(&entry.rel_path);
        let result = match entry.kind {
            FileKind::Directory => fs::remove_dir(&fullpath),
            _ => fs::remove_file(&fullpath),
        };
        match result {
            Ok(()) => {
                debug!(file = %fullpath.display(), "deleted");
                removed += 1;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    info!(removed, "redundant files removed");
    Ok(())
}

fn write_backup_label(config: &CatchupConfig, stop: &StopBackupResult) -> Result<()> {
    let path = config.dest_pgdata.join(BACKUP_LABEL_FILE);
    let mut file = File::create(&path)?;
    file.write_all(stop.backup_label.as_bytes())?;
    file.sync_all()?;
    debug!(label = %path.display(), "backup label written");
    Ok(())
}

/// Flush every copied regular file, the control file last.
fn sync_destination_files(
    config: &CatchupConfig,
    source_filelist: &[FileEntry],
    control_entry: &FileEntry,
) -> Result<()> {
    info!("syncing copied files to disk");
    let started = Instant::now();

    for entry in source_filelist {
        if entry.kind != FileKind::Regular {
            continue;
        }
        if matches!(entry.outcome.get(), Some(CopyOutcome::NotFound)) {
            continue;
        }
        let fullpath = config.dest_pgdata.join(&entry.rel_path);
        match File::open(&fullpath) {
            Ok(file) => file.sync_all()?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %fullpath.display(), "not present, skipping sync")
            }
            Err(err) => return Err(err.into()),
        }
    }

    let control_path = config.dest_pgdata.join(&control_entry.rel_path);
    File::open(&control_path)?.sync_all()?;

    info!(elapsed = ?started.elapsed(), "files are synced");
    Ok(())
}

//! Parallel file transfer.
//!
//! A single-threaded pre-creation pass materializes the directory skeleton
//! and the tablespace symlinks, then a fixed pool of workers drains the
//! size-sorted file list under per-entry atomic claims. Workers never create
//! directories and never see the control file; both are handled outside the
//! pool.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catchup::copier::{self, CopyOutcome, DataCopyParams};
use crate::catchup::inventory::{find_by_rel_path, FileEntry, FileKind};
use crate::catchup::probe::NodeInfo;
use crate::catchup::CatchupConfig;
use crate::pg::lsn::Lsn;
use crate::pg::{DIR_PERMISSION, PG_TBLSPC_DIR, RELMAPPER_FILE};
use crate::{Error, Result};

/// Create every directory of the path-sorted source list under the
/// destination. `pg_tblspc/` children are tablespace links: the mapped target
/// directory is created and the destination gets a symlink to it.
pub fn create_directories(config: &CatchupConfig, entries: &[FileEntry]) -> Result<()> {
    fs::create_dir_all(&config.dest_pgdata)?;

    for entry in entries {
        if entry.kind != FileKind::Directory {
            continue;
        }
        let rel = Path::new(&entry.rel_path);

        if rel.parent() != Some(Path::new(PG_TBLSPC_DIR)) {
            let dirpath = config.dest_pgdata.join(rel);
            debug!(dir = %dirpath.display(), "create directory");
            fs::create_dir_all(&dirpath)?;
            let mode = if entry.mode != 0 {
                entry.mode
            } else {
                DIR_PERMISSION
            };
            fs::set_permissions(&dirpath, fs::Permissions::from_mode(mode))?;
            continue;
        }

        // A directory-shaped entry under pg_tblspc is really a symlink on the
        // source; the walk followed it to list the tablespace contents.
        let source_link = config.source_pgdata.join(rel);
        let target = fs::read_link(&source_link)?;
        let mapped = config.tablespace_mapping.resolve(&target);
        if !mapped.is_absolute() {
            return Err(Error::MappingNotAbsolute(mapped.display().to_string()).into());
        }
        info!(
            link = %source_link.display(),
            old_target = %target.display(),
            new_target = %mapped.display(),
            "map tablespace"
        );

        fs::create_dir_all(mapped)?;
        let mode = if entry.mode != 0 {
            entry.mode
        } else {
            DIR_PERMISSION
        };
        fs::set_permissions(mapped, fs::Permissions::from_mode(mode))?;

        let link_path = config.dest_pgdata.join(rel);
        if link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link_path)?;
        }
        std::os::unix::fs::symlink(mapped, &link_path)?;
    }
    Ok(())
}

struct WorkerContext<'a> {
    config: &'a CatchupConfig,
    node: &'a NodeInfo,
    source_filelist: &'a [FileEntry],
    dest_filelist: &'a [FileEntry],
    sync_lsn: Lsn,
    processed: AtomicUsize,
    /// First failure across the pool; siblings stop when it is set.
    failure: Mutex<Option<String>>,
}

/// Fan out `num_threads` workers over the size-sorted list and join them all.
/// The first error wins; the others unwind quietly.
pub fn run_workers(
    config: &CatchupConfig,
    node: &NodeInfo,
    source_filelist: &[FileEntry],
    dest_filelist: &[FileEntry],
    sync_lsn: Lsn,
) -> Result<()> {
    let ctx = WorkerContext {
        config,
        node,
        source_filelist,
        dest_filelist,
        sync_lsn,
        processed: AtomicUsize::new(0),
        failure: Mutex::new(None),
    };
    let num_threads = config.num_threads.max(1);

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(num_threads);
        for worker in 0..num_threads {
            let ctx = &ctx;
            handles.push(scope.spawn(move || {
                debug!(worker, "copy worker started");
                worker_loop(ctx)
            }));
        }

        let mut result = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(_) => {
                    if result.is_ok() {
                        result = Err(Error::Interrupted.into());
                    }
                }
            }
        }
        result
    })
}

fn worker_loop(ctx: &WorkerContext<'_>) -> Result<()> {
    let n_files = ctx.source_filelist.len();

    for entry in ctx.source_filelist {
        // Directories were materialized before the fan-out.
        if entry.kind == FileKind::Directory {
            continue;
        }
        if !entry.try_claim() {
            continue;
        }
        if crate::interrupted() {
            return Err(Error::Interrupted.into());
        }
        if ctx.failure.lock().is_some() {
            // a sibling already failed; no point finishing the list
            return Ok(());
        }

        let done = ctx.processed.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(done, total = n_files, file = %entry.rel_path, "process file");

        if entry.kind == FileKind::Unexpected {
            warn!(file = %entry.rel_path, "unexpected file type, skipping");
            continue;
        }

        match copy_entry(ctx, entry) {
            Ok(report) => {
                entry.read_size.store(report.read_size, Ordering::Relaxed);
                let _ = entry.outcome.set(report.outcome);
                match report.outcome {
                    CopyOutcome::NotFound => {
                        debug!(file = %entry.rel_path, "vanished from source, skipping")
                    }
                    CopyOutcome::Unchanged => {
                        debug!(file = %entry.rel_path, read = report.read_size, "unchanged")
                    }
                    CopyOutcome::Written(bytes) => {
                        debug!(file = %entry.rel_path, bytes, "copied")
                    }
                }
            }
            Err(err) => {
                let mut failure = ctx.failure.lock();
                if failure.is_none() {
                    *failure = Some(err.to_string());
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

fn copy_entry(ctx: &WorkerContext<'_>, entry: &FileEntry) -> Result<copier::CopyReport> {
    let from = ctx.config.source_pgdata.join(&entry.rel_path);
    let to = ctx.config.dest_pgdata.join(&entry.rel_path);

    let mut prev_size = None;
    if ctx.config.mode.is_incremental() {
        if let Some(index) = find_by_rel_path(ctx.dest_filelist, &entry.rel_path) {
            entry.exists_in_prev.store(true, Ordering::Relaxed);
            prev_size = Some(ctx.dest_filelist[index].size);
        }
    }

    if entry.is_datafile && !entry.is_cfs {
        copier::copy_data_file(
            &from,
            &to,
            &DataCopyParams {
                mode: ctx.config.mode,
                sync_lsn: ctx.sync_lsn,
                checksum_version: ctx.node.checksum_version,
                prev_size,
                pagemap: entry.pagemap.as_ref(),
            },
        )
    } else {
        // The relation mapper's checksum cannot be trusted; always rewrite it.
        let force = entry.file_name() == RELMAPPER_FILE;
        copier::copy_plain_file(&from, &to, prev_size.is_some(), force)
    }
}

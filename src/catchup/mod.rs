//! The catchup pipeline.
//!
//! Phased, in order: probe → preflight → start-of-backup → destination
//! inventory and staleness checks → WAL streaming → source inventory and
//! pagemaps → directory pre-creation → parallel transfer → stop-of-backup →
//! WAL wait → finalization. The main thread owns every phase outside the
//! worker fan-out.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::catchup::inventory::FileEntry;
use crate::pg::control::{ControlFile, RedoParams};
use crate::pg::lsn::Lsn;
use crate::pg::{pretty_size, PG_WAL_DIR};
use crate::session::SourceSession;
use crate::wal::WalStreamer;
use crate::{Error, Result};

pub mod copier;
pub mod finalize;
pub mod inventory;
pub mod pagemap;
pub mod preflight;
pub mod probe;
pub mod tablespace;
pub mod transfer;

use self::tablespace::TablespaceMapping;

/// Fallback bound for the stop-of-backup wait when no archive timeout is
/// configured.
pub const ARCHIVE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(300);

/// Bound for the post-stop WAL segment wait.
const WAL_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupMode {
    /// Copy everything into an empty destination.
    Full,
    /// Copy pages whose LSN passed the destination's checkpoint.
    Delta,
    /// Copy pages named by the block-change tracking extension.
    Ptrack,
}

impl CatchupMode {
    pub fn is_incremental(self) -> bool {
        !matches!(self, CatchupMode::Full)
    }
}

impl fmt::Display for CatchupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CatchupMode::Full => "FULL",
            CatchupMode::Delta => "DELTA",
            CatchupMode::Ptrack => "PTRACK",
        };
        f.write_str(text)
    }
}

/// Compression defaults carried in the shared configuration record. Catchup
/// transfers raw bytes and ignores them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionOptions {
    pub algorithm: Option<String>,
    pub level: Option<u8>,
}

/// Flat record of everything one invocation needs. The probe fills
/// `wal_seg_size` and `system_identifier` from the source control file.
#[derive(Debug, Clone)]
pub struct CatchupConfig {
    pub mode: CatchupMode,
    pub source_pgdata: PathBuf,
    pub dest_pgdata: PathBuf,
    pub num_threads: usize,
    pub sync_dest_files: bool,
    pub tablespace_mapping: TablespaceMapping,
    /// Seconds to wait for stop-of-backup; 0 selects the built-in default.
    pub archive_timeout_secs: u32,
    pub connection: crate::session::ConnectionOptions,
    /// Source cluster lives on another host; relaxes tablespace mapping
    /// completeness to a warning.
    pub remote_source: bool,
    pub wal_seg_size: u32,
    pub system_identifier: u64,
    pub compression: CompressionOptions,
}

impl CatchupConfig {
    pub fn new(mode: CatchupMode, source_pgdata: PathBuf, dest_pgdata: PathBuf) -> CatchupConfig {
        CatchupConfig {
            mode,
            source_pgdata,
            dest_pgdata,
            num_threads: 1,
            sync_dest_files: true,
            tablespace_mapping: TablespaceMapping::new(),
            archive_timeout_secs: 0,
            connection: crate::session::ConnectionOptions::default(),
            remote_source: false,
            wal_seg_size: crate::pg::DEFAULT_WAL_SEG_SIZE,
            system_identifier: 0,
            compression: CompressionOptions::default(),
        }
    }

    fn stop_backup_timeout(&self) -> Duration {
        if self.archive_timeout_secs > 0 {
            Duration::from_secs(self.archive_timeout_secs as u64)
        } else {
            ARCHIVE_TIMEOUT_DEFAULT
        }
    }
}

/// Process-wide record of one catchup invocation.
#[derive(Debug, Clone)]
pub struct RunState {
    pub mode: CatchupMode,
    pub start_time: DateTime<Utc>,
    pub program_version: String,
    /// Source timeline at the start of the run.
    pub tli: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub recovery_time: Option<DateTime<Utc>>,
    pub recovery_xid: u32,
    pub from_replica: bool,
    /// Bytes announced by the source inventory.
    pub pgdata_bytes: u64,
}

/// Run one catchup. On success the destination holds a recoverable replica
/// of the source as of `stop_lsn`; on error the destination is left as-is
/// for inspection.
pub fn do_catchup(
    config: &mut CatchupConfig,
    session: &mut dyn SourceSession,
    streamer: &dyn WalStreamer,
) -> Result<RunState> {
    let (node, mut state) = probe::collect_info(config, session)?;
    preflight::run_checks(config, &node, state.tli, session)?;

    info!(mode = %config.mode, "database catchup start");

    let label = format!(
        "{} with pgcatchup",
        state.start_time.format("%Y-%m-%d %H:%M:%S UTC")
    );
    state.start_lsn = session.start_backup(&label)?;
    info!(start_lsn = %state.start_lsn, tli = state.tli, "backup started");

    // Destination-side state for incremental runs: the prior file list and
    // the checkpoint the copier will sync against.
    let mut dest_filelist: Vec<FileEntry> = Vec::new();
    let mut dest_redo: Option<RedoParams> = None;
    if config.mode.is_incremental() {
        dest_filelist = inventory::list_data_directory(&config.dest_pgdata)?;
        let control = ControlFile::read_from(&config.dest_pgdata)?;
        let redo = control.redo_params();
        info!(sync_lsn = %redo.lsn, tli = redo.tli, "destination checkpoint");
        dest_redo = Some(redo);
    }

    if config.mode == CatchupMode::Ptrack {
        if let Some(redo) = &dest_redo {
            pagemap::ensure_ptrack_coverage(session, &node, redo.lsn)?;
        }
    }

    if let Some(redo) = &dest_redo {
        if redo.lsn > state.start_lsn {
            return Err(Error::LsnInversion {
                start_lsn: state.start_lsn,
                dest_lsn: redo.lsn,
            }
            .into());
        }
    }

    // WAL must flow for the whole transfer window.
    let wal_dir = config.dest_pgdata.join(PG_WAL_DIR);
    std::fs::create_dir_all(&wal_dir)?;
    let mut stream = streamer.start(&wal_dir, state.start_lsn, state.tli, config.wal_seg_size)?;

    let mut source_filelist = inventory::list_data_directory(&config.source_pgdata)?;
    state.pgdata_bytes = inventory::total_bytes(&source_filelist);
    info!(size = %pretty_size(state.pgdata_bytes), "source data directory size");

    // Path order first: directory creation wants parents before children and
    // the pagemap attachment wants binary search.
    inventory::sort_by_rel_path(&mut source_filelist);

    if config.mode == CatchupMode::Ptrack {
        if let Some(redo) = &dest_redo {
            pagemap::attach_pagemaps(session, &node, redo.lsn, &mut source_filelist)?;
        }
    }

    transfer::create_directories(config, &source_filelist)?;

    let control_entry = inventory::take_control_entry(&mut source_filelist, &config.source_pgdata)?;

    // Membership snapshot for the redundant-file deletion, taken while the
    // list is still path-sorted. The control file belongs in it even though
    // it travels outside the worker pool.
    let mut source_paths: Vec<String> = source_filelist
        .iter()
        .map(|entry| entry.rel_path.clone())
        .collect();
    source_paths.push(control_entry.rel_path.clone());
    source_paths.sort();

    inventory::sort_by_size_desc(&mut source_filelist);
    inventory::sort_by_rel_path(&mut dest_filelist);

    if crate::interrupted() {
        return Err(Error::Interrupted.into());
    }

    info!(threads = config.num_threads.max(1), "start transferring data files");
    let transfer_started = Instant::now();
    let sync_lsn = dest_redo.map(|redo| redo.lsn).unwrap_or(Lsn::INVALID);
    transfer::run_workers(config, &node, &source_filelist, &dest_filelist, sync_lsn)?;
    info!(elapsed = ?transfer_started.elapsed(), "data files transferred");

    // Close the backup window.
    session.silence_client_messages()?;
    if !state.from_replica && !(node.server_version < 90600 && !node.is_superuser) {
        let name = format!("pgcatchup_{}", state.start_time.format("%Y%m%d_%H%M%S"));
        session.create_restore_point(&name)?;
        debug!(name = %name, "restore point created");
    }
    let stop = session.stop_backup(state.from_replica, config.stop_backup_timeout())?;
    state.stop_lsn = stop.lsn;
    state.recovery_xid = stop.snapshot_xid;
    state.recovery_time = Some(stop.invocation_time);
    info!(stop_lsn = %stop.lsn, "backup stopped");

    // The backup label must only land on a destination whose WAL already
    // covers the window.
    stream.wait_until(stop.lsn, WAL_WAIT_TIMEOUT)?;
    stream.finish()?;

    finalize::finalize(
        config,
        &state,
        &source_filelist,
        &control_entry,
        &dest_filelist,
        &source_paths,
        &stop,
    )?;

    info!(
        start_lsn = %state.start_lsn,
        stop_lsn = %state.stop_lsn,
        "catchup completed"
    );
    Ok(state)
}

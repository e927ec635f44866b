use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::pg::lsn::Lsn;

pub mod catchup;
pub mod cli;
pub mod logging;
pub mod pg;
pub mod session;
pub mod wal;

pub type Result<T> = anyhow::Result<T>;

/// Version string stamped into run state and the backup label.
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum Error {
    // Preflight precondition violations.
    #[error("\"{0}\" is empty, but an incremental catchup mode was requested")]
    EmptyDestination(String),
    #[error("cannot perform a full catchup into non-empty directory \"{0}\"")]
    NonEmptyDestination(String),
    #[error("postmaster with pid {pid} is running in destination directory \"{path}\"")]
    PostmasterRunning { pid: i32, path: String },
    #[error("pid file \"{0}\" is mangled, cannot determine whether postmaster is running")]
    MangledPidFile(String),
    #[error("destination directory contains \"{0}\"")]
    StaleBackupLabel(String),
    #[error("instance in destination directory \"{path}\" must be stopped cleanly (state: {state})")]
    UncleanShutdown { path: String, state: String },
    #[error(
        "database identifiers mismatch: connected to instance {connected}, \
         but \"{path}\" holds {found}"
    )]
    SystemIdMismatch {
        connected: u64,
        found: u64,
        path: String,
    },
    #[error("this PostgreSQL instance does not support ptrack")]
    PtrackMissing,
    #[error("ptrack extension is too old ({0}), version 2.0 or newer is required")]
    PtrackTooOld(String),
    #[error("ptrack is disabled")]
    PtrackDisabled,
    #[error("catchup from a standby is only available for PostgreSQL 9.6 and newer")]
    ReplicaSourceUnsupported,

    // Tablespace mapping.
    #[error("source database contains tablespace \"{0}\" that is not listed in the mapping")]
    TablespaceNotMapped(String),
    #[error("tablespace directory path must be absolute: \"{0}\"")]
    MappingNotAbsolute(String),
    #[error("mapped tablespace directory \"{0}\" is not empty in a full catchup")]
    MappedTablespaceNotEmpty(String),

    #[error("destination (timeline {tli}, lsn {lsn}) is not in the source timeline history")]
    TimelineDivergence { tli: u32, lsn: Lsn },
    #[error(
        "ptrack init lsn {ptrack_lsn} in source is newer than checkpoint lsn {dest_lsn} \
         in destination; only a full catchup is possible"
    )]
    BlockTrackingStale { ptrack_lsn: Lsn, dest_lsn: Lsn },
    #[error(
        "start lsn {start_lsn} is lower than the destination checkpoint lsn {dest_lsn}; \
         the source looks older than the destination"
    )]
    LsnInversion { start_lsn: Lsn, dest_lsn: Lsn },

    #[error("control file \"{path}\": {reason}")]
    ControlFile { path: String, reason: String },
    #[error("checksum mismatch in \"{path}\", block {blkno}")]
    PageChecksum { path: String, blkno: u32 },

    #[error("wal streaming failed: {0}")]
    Streaming(String),
    #[error("unexpected response from the source database: {0}")]
    Protocol(String),
    #[error("interrupted during catchup")]
    Interrupted,

    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Process-wide cancellation flag, set from the signal handler and sampled by
/// the copy workers and the wait loops.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

pub fn clear_interrupted() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    // Initialize logging before doing anything else. Defaults to human format for the CLI.
    logging::init_logging(logging::LogFormat::Human)?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}

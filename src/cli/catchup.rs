//! Implementation of the `pgcatchup catchup` subcommand.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use tracing::info;

use crate::catchup::tablespace::TablespaceMapping;
use crate::catchup::{self, CatchupConfig, CatchupMode};
use crate::session::pg::PgSession;
use crate::session::ConnectionOptions;
use crate::wal::ReceiveWalStreamer;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Copy the whole cluster into an empty destination.
    Full,
    /// Copy pages whose LSN passed the destination's checkpoint.
    Delta,
    /// Copy pages named by the ptrack block-change log.
    Ptrack,
}

impl From<ModeArg> for CatchupMode {
    fn from(mode: ModeArg) -> CatchupMode {
        match mode {
            ModeArg::Full => CatchupMode::Full,
            ModeArg::Delta => CatchupMode::Delta,
            ModeArg::Ptrack => CatchupMode::Ptrack,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct CatchupArgs {
    /// Data directory of the running source instance
    #[arg(short = 'D', long = "source-pgdata")]
    pub source_pgdata: PathBuf,

    /// Destination directory for the replica
    #[arg(long = "dest-pgdata")]
    pub dest_pgdata: PathBuf,

    /// Catchup mode
    #[arg(short = 'b', long = "mode", value_enum)]
    pub mode: ModeArg,

    /// Number of parallel copy workers
    #[arg(short = 'j', long = "threads", default_value_t = 1)]
    pub num_threads: usize,

    /// Do not fsync copied files to disk
    #[arg(long = "no-sync", default_value_t = false)]
    pub no_sync: bool,

    /// Relocate a tablespace: OLDDIR=NEWDIR (repeatable)
    #[arg(short = 'T', long = "tablespace-mapping", value_name = "OLDDIR=NEWDIR")]
    pub tablespace_mapping: Vec<String>,

    /// JSON file with tablespace mappings ({"/old": "/new", ...})
    #[arg(long = "tablespace-mapping-file")]
    pub tablespace_mapping_file: Option<PathBuf>,

    /// Seconds to wait for the stop-of-backup result (0 = built-in default)
    #[arg(long = "archive-timeout", default_value_t = 0)]
    pub archive_timeout: u32,

    /// Source host to connect to
    #[arg(long = "pghost")]
    pub pghost: Option<String>,

    /// Source port to connect to
    #[arg(short = 'p', long = "pgport")]
    pub pgport: Option<u16>,

    /// Database to connect to
    #[arg(short = 'd', long = "pgdatabase")]
    pub pgdatabase: Option<String>,

    /// Role to connect as
    #[arg(short = 'U', long = "pguser")]
    pub pguser: Option<String>,

    /// The source cluster lives on another host; unmapped tablespaces become
    /// warnings instead of errors
    #[arg(long = "remote", default_value_t = false)]
    pub remote: bool,

    /// Path to the pg_receivewal binary used for WAL streaming
    #[arg(long = "receivewal", default_value = "pg_receivewal")]
    pub receivewal: PathBuf,
}

pub fn execute(args: CatchupArgs) -> Result<()> {
    ctrlc::set_handler(crate::set_interrupted)
        .map_err(|err| Error::Cli(format!("failed to install signal handler: {err}")))?;

    let mut mapping = match &args.tablespace_mapping_file {
        Some(path) => TablespaceMapping::load_file(path)?,
        None => TablespaceMapping::new(),
    };
    for pair in &args.tablespace_mapping {
        mapping.insert_pair(pair)?;
    }

    let connection = ConnectionOptions {
        host: args.pghost.clone(),
        port: args.pgport,
        database: args.pgdatabase.clone(),
        user: args.pguser.clone(),
    };

    let mut config = CatchupConfig::new(
        args.mode.into(),
        args.source_pgdata.clone(),
        args.dest_pgdata.clone(),
    );
    config.num_threads = args.num_threads.max(1);
    config.sync_dest_files = !args.no_sync;
    config.tablespace_mapping = mapping;
    config.archive_timeout_secs = args.archive_timeout;
    config.connection = connection.clone();
    config.remote_source = args.remote;

    let mut session = PgSession::connect(&config.connection)?;
    let streamer = ReceiveWalStreamer::new(args.receivewal.clone(), connection);

    let state = catchup::do_catchup(&mut config, &mut session, &streamer)?;
    info!(
        start_lsn = %state.start_lsn,
        stop_lsn = %state.stop_lsn,
        bytes = state.pgdata_bytes,
        "catchup finished"
    );
    Ok(())
}

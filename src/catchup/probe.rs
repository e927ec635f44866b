//! Source instance probe.
//!
//! Fills the shared configuration from the source control file, collects the
//! per-node capability record over the session and stamps the run state.

use chrono::Utc;
use tracing::info;

use crate::catchup::{CatchupConfig, RunState};
use crate::pg::control::ControlFile;
use crate::pg::lsn::Lsn;
use crate::session::SourceSession;
use crate::{Result, PROGRAM_VERSION};

/// Capability record of the source endpoint.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub server_version: u32,
    pub server_version_str: String,
    pub is_replica: bool,
    pub is_superuser: bool,
    /// Two-digit-per-component ptrack version (220 for "2.2"); 0 when absent.
    pub ptrack_version_num: u32,
    pub is_ptrack_enabled: bool,
    /// Page checksum scheme of the cluster; 0 means checksums are off.
    pub checksum_version: u32,
    pub ptrack_schema: String,
}

fn parse_ptrack_version(version: &str) -> u32 {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    major * 100 + minor
}

/// Probe the source and prepare the run.
pub fn collect_info(
    config: &mut CatchupConfig,
    session: &mut dyn SourceSession,
) -> Result<(NodeInfo, RunState)> {
    let source_control = ControlFile::read_from(&config.source_pgdata)?;
    config.wal_seg_size = source_control.wal_seg_size;
    config.system_identifier = source_control.system_identifier;

    let server_version = session.server_version_num()?;
    let server_version_str = session.server_version_str()?;
    let is_replica = session.is_in_recovery()?;
    let is_superuser = session.is_superuser()?;

    let (ptrack_version_num, ptrack_schema) = match session.ptrack_version()? {
        Some((version, schema)) => (parse_ptrack_version(&version), schema),
        None => (0, String::new()),
    };
    let is_ptrack_enabled = ptrack_version_num > 0 && session.ptrack_enabled()?;

    let node = NodeInfo {
        server_version,
        server_version_str,
        is_replica,
        is_superuser,
        ptrack_version_num,
        is_ptrack_enabled,
        checksum_version: source_control.data_checksum_version,
        ptrack_schema,
    };

    let state = RunState {
        mode: config.mode,
        start_time: Utc::now(),
        program_version: PROGRAM_VERSION.to_string(),
        tli: session.current_timeline()?,
        start_lsn: Lsn::INVALID,
        stop_lsn: Lsn::INVALID,
        recovery_time: None,
        recovery_xid: 0,
        from_replica: is_replica,
        pgdata_bytes: 0,
    };

    info!(
        version = PROGRAM_VERSION,
        server = %node.server_version_str,
        remote = config.remote_source,
        source = %config.source_pgdata.display(),
        destination = %config.dest_pgdata.display(),
        "catchup start"
    );
    if state.from_replica {
        info!("running catchup from a standby");
    }

    Ok((node, state))
}

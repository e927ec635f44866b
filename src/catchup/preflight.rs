//! Preconditions enforced before anything touches the destination.

use std::path::Path;

use tracing::debug;

use crate::catchup::inventory::dir_is_empty;
use crate::catchup::probe::NodeInfo;
use crate::catchup::tablespace;
use crate::catchup::{CatchupConfig, CatchupMode};
use crate::pg::control::ControlFile;
use crate::pg::timeline::{parse_history, satisfy_timeline};
use crate::pg::{BACKUP_LABEL_FILE, POSTMASTER_PID_FILE};
use crate::session::SourceSession;
use crate::{Error, Result};

/// Run every check, in order; the first failure aborts with no on-disk
/// changes at the destination.
pub fn run_checks(
    config: &CatchupConfig,
    node: &NodeInfo,
    source_tli: u32,
    session: &mut dyn SourceSession,
) -> Result<()> {
    let dest = &config.dest_pgdata;
    let dest_display = dest.display().to_string();

    match (config.mode, dir_is_empty(dest)?) {
        (CatchupMode::Full, false) => {
            return Err(Error::NonEmptyDestination(dest_display).into());
        }
        (CatchupMode::Delta | CatchupMode::Ptrack, true) => {
            return Err(Error::EmptyDestination(dest_display).into());
        }
        _ => {}
    }

    let mut dest_control = None;
    if config.mode.is_incremental() {
        if let Some(pid) = postmaster_pid(dest)? {
            return Err(Error::PostmasterRunning {
                pid,
                path: dest_display,
            }
            .into());
        }

        let label = dest.join(BACKUP_LABEL_FILE);
        if label.exists() {
            return Err(Error::StaleBackupLabel(label.display().to_string()).into());
        }

        let control = ControlFile::read_from(dest)?;
        if !control.state.is_clean_shutdown() {
            return Err(Error::UncleanShutdown {
                path: dest_display,
                state: control.state.to_string(),
            }
            .into());
        }
        dest_control = Some(control);
    }

    // The identity triple: the session, the source data directory and (for
    // incremental runs) the destination must all be the same cluster.
    let connected = session.system_identifier()?;
    if connected != config.system_identifier {
        return Err(Error::SystemIdMismatch {
            connected,
            found: config.system_identifier,
            path: config.source_pgdata.display().to_string(),
        }
        .into());
    }
    if let Some(control) = &dest_control {
        if connected != control.system_identifier {
            return Err(Error::SystemIdMismatch {
                connected,
                found: control.system_identifier,
                path: config.dest_pgdata.display().to_string(),
            }
            .into());
        }
    }

    if config.mode == CatchupMode::Ptrack {
        if node.ptrack_version_num == 0 {
            return Err(Error::PtrackMissing.into());
        }
        if node.ptrack_version_num < 200 {
            return Err(Error::PtrackTooOld(format!(
                "{}.{}",
                node.ptrack_version_num / 100,
                node.ptrack_version_num % 100
            ))
            .into());
        }
        if !node.is_ptrack_enabled {
            return Err(Error::PtrackDisabled.into());
        }
    }

    // Standby sourcing needs the non-exclusive backup protocol.
    if node.is_replica && node.server_version < 90600 {
        return Err(Error::ReplicaSourceUnsupported.into());
    }

    tablespace::check_source_tablespaces(config, session)?;

    if let Some(control) = &dest_control {
        let dest_redo = control.redo_params();
        if source_tli != 1 {
            let raw = session.timeline_history(source_tli)?;
            let history = parse_history(&raw, source_tli)?;
            if !satisfy_timeline(&history, dest_redo.tli, dest_redo.lsn) {
                return Err(Error::TimelineDivergence {
                    tli: dest_redo.tli,
                    lsn: dest_redo.lsn,
                }
                .into());
            }
        } else if dest_redo.tli != 1 {
            // No history on the source means it never left timeline 1.
            return Err(Error::TimelineDivergence {
                tli: dest_redo.tli,
                lsn: dest_redo.lsn,
            }
            .into());
        }
    }

    debug!("preflight checks passed");
    Ok(())
}

/// Pid of a live postmaster at the destination, if any. A present but
/// unreadable lock file is reported as its own error; deciding liveness from
/// garbage would be a guess.
fn postmaster_pid(pgdata: &Path) -> Result<Option<i32>> {
    let path = pgdata.join(POSTMASTER_PID_FILE);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let first_line = contents.lines().next().unwrap_or("").trim();
    let pid: i32 = first_line
        .parse()
        .map_err(|_| Error::MangledPidFile(path.display().to_string()))?;
    if pid <= 0 {
        return Err(Error::MangledPidFile(path.display().to_string()).into());
    }

    let alive = unsafe { libc::kill(pid, 0) } == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    Ok(alive.then_some(pid))
}

//! Fixed-layout access to `global/pg_control`.
//!
//! Only the fields the catchup pipeline needs are surfaced. The offsets match
//! the `ControlFileData` layout of PostgreSQL 12 through 16 on LP64 platforms;
//! the CRC (CRC-32C over everything up to the `crc` member) is verified on
//! read and recomputed on write.

use std::fmt;
use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::pg::lsn::Lsn;
use crate::pg::PG_CONTROL_FILE;
use crate::{Error, Result};

/// Size of the control file on disk; the tail beyond the CRC is zero padding.
pub const PG_CONTROL_FILE_SIZE: usize = 8192;

const OFF_SYSTEM_IDENTIFIER: usize = 0;
const OFF_PG_CONTROL_VERSION: usize = 8;
const OFF_CATALOG_VERSION: usize = 12;
const OFF_STATE: usize = 16;
const OFF_CHECKPOINT: usize = 32;
// CheckPoint copy embedded at offset 40.
const OFF_REDO: usize = 40;
const OFF_THIS_TIMELINE: usize = 48;
const OFF_PREV_TIMELINE: usize = 52;
const OFF_MIN_RECOVERY_POINT: usize = 136;
const OFF_MIN_RECOVERY_POINT_TLI: usize = 144;
const OFF_BLCKSZ: usize = 216;
const OFF_XLOG_SEG_SIZE: usize = 228;
const OFF_DATA_CHECKSUM_VERSION: usize = 252;
const OFF_CRC: usize = 288;

/// Database cluster state (`DBState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Startup,
    Shutdowned,
    ShutdownedInRecovery,
    ShuttingDown,
    InCrashRecovery,
    InArchiveRecovery,
    InProduction,
}

impl DbState {
    fn from_raw(raw: u32) -> Option<DbState> {
        Some(match raw {
            0 => DbState::Startup,
            1 => DbState::Shutdowned,
            2 => DbState::ShutdownedInRecovery,
            3 => DbState::ShuttingDown,
            4 => DbState::InCrashRecovery,
            5 => DbState::InArchiveRecovery,
            6 => DbState::InProduction,
            _ => return None,
        })
    }

    fn to_raw(self) -> u32 {
        match self {
            DbState::Startup => 0,
            DbState::Shutdowned => 1,
            DbState::ShutdownedInRecovery => 2,
            DbState::ShuttingDown => 3,
            DbState::InCrashRecovery => 4,
            DbState::InArchiveRecovery => 5,
            DbState::InProduction => 6,
        }
    }

    /// Cleanly shut down, possibly as a standby.
    pub fn is_clean_shutdown(self) -> bool {
        matches!(self, DbState::Shutdowned | DbState::ShutdownedInRecovery)
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DbState::Startup => "starting up",
            DbState::Shutdowned => "shut down",
            DbState::ShutdownedInRecovery => "shut down in recovery",
            DbState::ShuttingDown => "shutting down",
            DbState::InCrashRecovery => "in crash recovery",
            DbState::InArchiveRecovery => "in archive recovery",
            DbState::InProduction => "in production",
        };
        f.write_str(text)
    }
}

/// The destination's last durable checkpoint, as recovery would see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoParams {
    pub tli: u32,
    pub lsn: Lsn,
    /// Pointer to the checkpoint record itself.
    pub checkpoint: Lsn,
}

#[derive(Debug, Clone)]
pub struct ControlFile {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version: u32,
    pub state: DbState,
    pub checkpoint: Lsn,
    pub redo: Lsn,
    pub timeline: u32,
    pub prev_timeline: u32,
    pub min_recovery_point: Lsn,
    pub min_recovery_point_tli: u32,
    pub block_size: u32,
    pub wal_seg_size: u32,
    pub data_checksum_version: u32,
    /// Full on-disk image; fields not surfaced above pass through unchanged.
    raw: Vec<u8>,
}

impl ControlFile {
    /// A fresh control image with the given identity and checkpoint. Fields we
    /// do not model stay zero. Used to synthesize clusters in tests.
    pub fn new(system_identifier: u64, state: DbState, redo: Lsn, timeline: u32) -> ControlFile {
        ControlFile {
            system_identifier,
            pg_control_version: 1300,
            catalog_version: 202107181,
            state,
            checkpoint: redo,
            redo,
            timeline,
            prev_timeline: timeline,
            min_recovery_point: Lsn::INVALID,
            min_recovery_point_tli: 0,
            block_size: crate::pg::BLCKSZ as u32,
            wal_seg_size: crate::pg::DEFAULT_WAL_SEG_SIZE,
            data_checksum_version: 0,
            raw: vec![0u8; PG_CONTROL_FILE_SIZE],
        }
    }

    /// Read and verify the control file under a data directory.
    pub fn read_from(pgdata: &Path) -> Result<ControlFile> {
        let path = pgdata.join(PG_CONTROL_FILE);
        let raw = fs::read(&path).map_err(|err| Error::ControlFile {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        ControlFile::from_bytes(raw, &path.display().to_string())
    }

    pub fn from_bytes(raw: Vec<u8>, path: &str) -> Result<ControlFile> {
        if raw.len() < OFF_CRC + 4 {
            return Err(Error::ControlFile {
                path: path.to_string(),
                reason: format!("short file: {} bytes", raw.len()),
            }
            .into());
        }

        let stored_crc = LittleEndian::read_u32(&raw[OFF_CRC..OFF_CRC + 4]);
        let actual_crc = crc32c::crc32c(&raw[..OFF_CRC]);
        if stored_crc != actual_crc {
            return Err(Error::ControlFile {
                path: path.to_string(),
                reason: format!("bad crc: stored {stored_crc:#010x}, computed {actual_crc:#010x}"),
            }
            .into());
        }

        let state_raw = LittleEndian::read_u32(&raw[OFF_STATE..OFF_STATE + 4]);
        let state = DbState::from_raw(state_raw).ok_or_else(|| Error::ControlFile {
            path: path.to_string(),
            reason: format!("unknown database state {state_raw}"),
        })?;

        Ok(ControlFile {
            system_identifier: LittleEndian::read_u64(&raw[OFF_SYSTEM_IDENTIFIER..]),
            pg_control_version: LittleEndian::read_u32(&raw[OFF_PG_CONTROL_VERSION..]),
            catalog_version: LittleEndian::read_u32(&raw[OFF_CATALOG_VERSION..]),
            state,
            checkpoint: Lsn(LittleEndian::read_u64(&raw[OFF_CHECKPOINT..])),
            redo: Lsn(LittleEndian::read_u64(&raw[OFF_REDO..])),
            timeline: LittleEndian::read_u32(&raw[OFF_THIS_TIMELINE..]),
            prev_timeline: LittleEndian::read_u32(&raw[OFF_PREV_TIMELINE..]),
            min_recovery_point: Lsn(LittleEndian::read_u64(&raw[OFF_MIN_RECOVERY_POINT..])),
            min_recovery_point_tli: LittleEndian::read_u32(&raw[OFF_MIN_RECOVERY_POINT_TLI..]),
            block_size: LittleEndian::read_u32(&raw[OFF_BLCKSZ..]),
            wal_seg_size: LittleEndian::read_u32(&raw[OFF_XLOG_SEG_SIZE..]),
            data_checksum_version: LittleEndian::read_u32(&raw[OFF_DATA_CHECKSUM_VERSION..]),
            raw,
        })
    }

    /// Serialize the surfaced fields back into the image and refresh the CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = self.raw.clone();
        if raw.len() < PG_CONTROL_FILE_SIZE {
            raw.resize(PG_CONTROL_FILE_SIZE, 0);
        }
        LittleEndian::write_u64(&mut raw[OFF_SYSTEM_IDENTIFIER..], self.system_identifier);
        LittleEndian::write_u32(&mut raw[OFF_PG_CONTROL_VERSION..], self.pg_control_version);
        LittleEndian::write_u32(&mut raw[OFF_CATALOG_VERSION..], self.catalog_version);
        LittleEndian::write_u32(&mut raw[OFF_STATE..], self.state.to_raw());
        LittleEndian::write_u64(&mut raw[OFF_CHECKPOINT..], self.checkpoint.0);
        LittleEndian::write_u64(&mut raw[OFF_REDO..], self.redo.0);
        LittleEndian::write_u32(&mut raw[OFF_THIS_TIMELINE..], self.timeline);
        LittleEndian::write_u32(&mut raw[OFF_PREV_TIMELINE..], self.prev_timeline);
        LittleEndian::write_u64(&mut raw[OFF_MIN_RECOVERY_POINT..], self.min_recovery_point.0);
        LittleEndian::write_u32(
            &mut raw[OFF_MIN_RECOVERY_POINT_TLI..],
            self.min_recovery_point_tli,
        );
        LittleEndian::write_u32(&mut raw[OFF_BLCKSZ..], self.block_size);
        LittleEndian::write_u32(&mut raw[OFF_XLOG_SEG_SIZE..], self.wal_seg_size);
        LittleEndian::write_u32(
            &mut raw[OFF_DATA_CHECKSUM_VERSION..],
            self.data_checksum_version,
        );
        let crc = crc32c::crc32c(&raw[..OFF_CRC]);
        LittleEndian::write_u32(&mut raw[OFF_CRC..], crc);
        raw
    }

    /// Write the image under a data directory and flush it to disk.
    pub fn write_to(&self, pgdata: &Path) -> Result<()> {
        use std::io::Write;

        let path = pgdata.join(PG_CONTROL_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn redo_params(&self) -> RedoParams {
        RedoParams {
            tli: self.timeline,
            lsn: self.redo,
            checkpoint: self.checkpoint,
        }
    }
}

/// Rewrite the destination's minimum recovery point after a catchup from a
/// standby, so recovery does not stop before `stop_lsn`.
pub fn set_min_recovery_point(dest_pgdata: &Path, lsn: Lsn, tli: u32) -> Result<()> {
    let mut control = ControlFile::read_from(dest_pgdata)?;
    control.min_recovery_point = lsn;
    control.min_recovery_point_tli = tli;
    control.write_to(dest_pgdata)
}

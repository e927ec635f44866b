//! Database session surface used by the catchup pipeline.
//!
//! The pipeline talks to the source instance exclusively through
//! [`SourceSession`]; the production implementation lives in [`pg`] and the
//! integration tests drive the pipeline with an in-memory fake.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::pg::lsn::Lsn;
use crate::Result;

pub mod pg;

/// Connection options for the source instance, libpq style.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
}

/// Everything stop-of-backup hands back.
#[derive(Debug, Clone)]
pub struct StopBackupResult {
    pub lsn: Lsn,
    pub backup_label: String,
    pub tablespace_map: Option<String>,
    pub snapshot_xid: u32,
    pub invocation_time: DateTime<Utc>,
}

/// One row of the block-change report: a relation fork path relative to the
/// data directory and its changed-page bitmap.
#[derive(Debug, Clone)]
pub struct PtrackPagemap {
    pub rel_path: String,
    pub pagemap: Vec<u8>,
}

/// Ordinary-session operations against the source instance.
pub trait SourceSession {
    fn server_version_num(&mut self) -> Result<u32>;
    fn server_version_str(&mut self) -> Result<String>;
    fn is_in_recovery(&mut self) -> Result<bool>;
    fn is_superuser(&mut self) -> Result<bool>;
    /// System identifier as reported over the session.
    fn system_identifier(&mut self) -> Result<u64>;
    fn current_timeline(&mut self) -> Result<u32>;
    /// `(version, schema)` of the ptrack extension, when installed.
    fn ptrack_version(&mut self) -> Result<Option<(String, String)>>;
    fn ptrack_enabled(&mut self) -> Result<bool>;
    /// Locations of all tablespaces with a non-empty location.
    fn tablespace_locations(&mut self) -> Result<Vec<PathBuf>>;
    /// Raw content of the history file for a timeline.
    fn timeline_history(&mut self, tli: u32) -> Result<String>;
    /// Start a backup window; returns the start LSN.
    fn start_backup(&mut self, label: &str) -> Result<Lsn>;
    /// Suppress notice chatter before stop-of-backup.
    fn silence_client_messages(&mut self) -> Result<()>;
    fn create_restore_point(&mut self, name: &str) -> Result<()>;
    /// Finish the backup window. Bounded by `timeout`; `from_replica` skips
    /// the snapshot-xid query, which a standby cannot answer.
    fn stop_backup(&mut self, from_replica: bool, timeout: Duration) -> Result<StopBackupResult>;
    /// Oldest LSN the block-change log can report changes since.
    fn ptrack_init_lsn(&mut self, schema: &str) -> Result<Lsn>;
    /// Changed-page bitmaps for every relation touched since `since`.
    fn ptrack_pagemaps(&mut self, schema: &str, since: Lsn) -> Result<Vec<PtrackPagemap>>;
}

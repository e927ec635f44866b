//! Shared fixtures for the pgcatchup test suites: an in-memory source
//! session, a streamer that materializes segments on demand, and builders for
//! small on-disk clusters.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use pgcatchup::pg::control::{ControlFile, DbState};
use pgcatchup::pg::lsn::Lsn;
use pgcatchup::pg::{page, wal, BLCKSZ};
use pgcatchup::session::{PtrackPagemap, SourceSession, StopBackupResult};
use pgcatchup::wal::{WalStreamHandle, WalStreamer};
use pgcatchup::Result;

/// Small segments keep the fake WAL cheap to materialize.
pub const TEST_WAL_SEG_SIZE: u32 = 1024 * 1024;
pub const TEST_SYSTEM_ID: u64 = 7210676782860081821;

pub fn lsn(text: &str) -> Lsn {
    Lsn::from_str(text).expect("test lsn")
}

/// Scripted stand-in for a live source instance.
pub struct FakeSession {
    pub server_version: u32,
    pub server_version_str: String,
    pub in_recovery: bool,
    pub superuser: bool,
    pub system_id: u64,
    pub timeline: u32,
    pub ptrack: Option<(String, String)>,
    pub ptrack_enabled: bool,
    pub tablespaces: Vec<PathBuf>,
    pub history: String,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub ptrack_init: Lsn,
    pub pagemaps: Vec<PtrackPagemap>,
    /// Restore points the pipeline asked for.
    pub restore_points: Vec<String>,
    pub backup_started: bool,
    pub backup_stopped: bool,
}

impl FakeSession {
    pub fn new(system_id: u64, timeline: u32, start_lsn: Lsn, stop_lsn: Lsn) -> FakeSession {
        FakeSession {
            server_version: 140000,
            server_version_str: "14.4".into(),
            in_recovery: false,
            superuser: true,
            system_id,
            timeline,
            ptrack: None,
            ptrack_enabled: false,
            tablespaces: Vec::new(),
            history: String::new(),
            start_lsn,
            stop_lsn,
            ptrack_init: Lsn::INVALID,
            pagemaps: Vec::new(),
            restore_points: Vec::new(),
            backup_started: false,
            backup_stopped: false,
        }
    }

    pub fn with_ptrack(mut self, init_lsn: Lsn, pagemaps: Vec<PtrackPagemap>) -> FakeSession {
        self.ptrack = Some(("2.2".into(), "public".into()));
        self.ptrack_enabled = true;
        self.ptrack_init = init_lsn;
        self.pagemaps = pagemaps;
        self
    }
}

impl SourceSession for FakeSession {
    fn server_version_num(&mut self) -> Result<u32> {
        Ok(self.server_version)
    }

    fn server_version_str(&mut self) -> Result<String> {
        Ok(self.server_version_str.clone())
    }

    fn is_in_recovery(&mut self) -> Result<bool> {
        Ok(self.in_recovery)
    }

    fn is_superuser(&mut self) -> Result<bool> {
        Ok(self.superuser)
    }

    fn system_identifier(&mut self) -> Result<u64> {
        Ok(self.system_id)
    }

    fn current_timeline(&mut self) -> Result<u32> {
        Ok(self.timeline)
    }

    fn ptrack_version(&mut self) -> Result<Option<(String, String)>> {
        Ok(self.ptrack.clone())
    }

    fn ptrack_enabled(&mut self) -> Result<bool> {
        Ok(self.ptrack_enabled)
    }

    fn tablespace_locations(&mut self) -> Result<Vec<PathBuf>> {
        Ok(self.tablespaces.clone())
    }

    fn timeline_history(&mut self, _tli: u32) -> Result<String> {
        Ok(self.history.clone())
    }

    fn start_backup(&mut self, _label: &str) -> Result<Lsn> {
        self.backup_started = true;
        Ok(self.start_lsn)
    }

    fn silence_client_messages(&mut self) -> Result<()> {
        Ok(())
    }

    fn create_restore_point(&mut self, name: &str) -> Result<()> {
        self.restore_points.push(name.to_string());
        Ok(())
    }

    fn stop_backup(&mut self, from_replica: bool, _timeout: Duration) -> Result<StopBackupResult> {
        self.backup_stopped = true;
        Ok(StopBackupResult {
            lsn: self.stop_lsn,
            backup_label: format!(
                "START WAL LOCATION: {} (file {})\nCHECKPOINT LOCATION: {}\n\
                 BACKUP METHOD: streamed\nBACKUP FROM: {}\n",
                self.start_lsn,
                wal::segment_file_name(
                    self.timeline,
                    self.start_lsn.segment_number(TEST_WAL_SEG_SIZE as u64),
                    TEST_WAL_SEG_SIZE as u64,
                ),
                self.start_lsn,
                if from_replica { "standby" } else { "primary" },
            ),
            tablespace_map: None,
            snapshot_xid: if from_replica { 0 } else { 731 },
            invocation_time: chrono::Utc::now(),
        })
    }

    fn ptrack_init_lsn(&mut self, _schema: &str) -> Result<Lsn> {
        Ok(self.ptrack_init)
    }

    fn ptrack_pagemaps(&mut self, _schema: &str, _since: Lsn) -> Result<Vec<PtrackPagemap>> {
        Ok(self.pagemaps.clone())
    }
}

/// Streamer that materializes zero-filled segments covering the window when
/// the pipeline waits on it.
pub struct FakeStreamer;

impl WalStreamer for FakeStreamer {
    fn start(
        &self,
        wal_dir: &Path,
        start: Lsn,
        tli: u32,
        wal_seg_size: u32,
    ) -> Result<Box<dyn WalStreamHandle>> {
        Ok(Box::new(FakeStreamHandle {
            wal_dir: wal_dir.to_path_buf(),
            start,
            tli,
            wal_seg_size,
        }))
    }
}

struct FakeStreamHandle {
    wal_dir: PathBuf,
    start: Lsn,
    tli: u32,
    wal_seg_size: u32,
}

impl WalStreamHandle for FakeStreamHandle {
    fn wait_until(&mut self, stop: Lsn, _timeout: Duration) -> Result<()> {
        let seg_size = self.wal_seg_size as u64;
        for segno in wal::segments_covering(self.start, stop, seg_size) {
            let name = wal::segment_file_name(self.tli, segno, seg_size);
            fs::write(self.wal_dir.join(name), vec![0u8; seg_size as usize])?;
        }
        assert!(wal::segments_complete(
            &self.wal_dir,
            self.tli,
            self.start,
            stop,
            seg_size
        )?);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Streamer whose wait never sees the segments arrive.
pub struct StalledStreamer;

impl WalStreamer for StalledStreamer {
    fn start(
        &self,
        _wal_dir: &Path,
        _start: Lsn,
        _tli: u32,
        _wal_seg_size: u32,
    ) -> Result<Box<dyn WalStreamHandle>> {
        Ok(Box::new(StalledStreamHandle))
    }
}

struct StalledStreamHandle;

impl WalStreamHandle for StalledStreamHandle {
    fn wait_until(&mut self, stop: Lsn, _timeout: Duration) -> Result<()> {
        Err(pgcatchup::Error::Streaming(format!(
            "timed out waiting for wal segments through {stop}"
        ))
        .into())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Write a relation file from per-block page LSNs.
pub fn write_rel_file(root: &Path, rel_path: &str, page_lsns: &[Lsn], with_checksums: bool) {
    let full = root.join(rel_path);
    fs::create_dir_all(full.parent().expect("rel parent")).expect("mkdir");
    let mut data = Vec::with_capacity(page_lsns.len() * BLCKSZ);
    for (blkno, page_lsn) in page_lsns.iter().enumerate() {
        data.extend_from_slice(&page::format_page(*page_lsn, blkno as u32, with_checksums));
    }
    fs::write(full, data).expect("write rel file");
}

/// Write a control file describing a cluster in the given state.
pub fn write_control(
    root: &Path,
    system_id: u64,
    state: DbState,
    redo: Lsn,
    timeline: u32,
    checksum_version: u32,
) {
    let mut control = ControlFile::new(system_id, state, redo, timeline);
    control.wal_seg_size = TEST_WAL_SEG_SIZE;
    control.data_checksum_version = checksum_version;
    control.write_to(root).expect("write control file");
}

/// A minimal but complete source data directory: control file, two relation
/// files, a version file, a relation map, and the runtime skeleton.
pub fn build_source_cluster(root: &Path, redo: Lsn, timeline: u32) {
    for dir in [
        "global",
        "base/1",
        "pg_wal",
        "pg_tblspc",
        "pg_notify",
        "pg_stat_tmp",
    ] {
        fs::create_dir_all(root.join(dir)).expect("mkdir");
    }
    write_control(
        root,
        TEST_SYSTEM_ID,
        DbState::InProduction,
        redo,
        timeline,
        0,
    );
    write_rel_file(root, "base/1/1259", &[redo, redo], false);
    write_rel_file(root, "base/1/2619", &[redo], false);
    fs::write(root.join("PG_VERSION"), "14\n").expect("write PG_VERSION");
    fs::write(root.join("base/1/pg_filenode.map"), b"relmap-v1").expect("write relmap");
    // runtime files that must never travel
    fs::write(root.join("postmaster.opts"), "postgres\n").expect("write opts");
    fs::write(root.join("pg_wal").join("000000010000000000000001"), b"wal").expect("write wal");
}

/// Make a freshly caught-up destination look like a server that recovered
/// and stopped cleanly: the backup label is consumed and the control file
/// flips to a clean shutdown.
pub fn simulate_clean_shutdown(root: &Path) {
    let label = root.join("backup_label");
    if label.exists() {
        fs::remove_file(label).expect("remove backup label");
    }
    let mut control = ControlFile::read_from(root).expect("read control");
    control.state = DbState::Shutdowned;
    control.write_to(root).expect("rewrite control");
}

/// Recursive (relative path, file bytes) listing for tree comparisons,
/// symlinks reported by their target.
pub fn snapshot_tree(root: &Path, skip_top: &[&str]) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for item in fs::read_dir(&dir).expect("read_dir") {
            let item = item.expect("dir entry");
            let path = item.path();
            let rel = path
                .strip_prefix(root)
                .expect("strip")
                .to_string_lossy()
                .into_owned();
            if !rel.contains('/') && skip_top.contains(&rel.as_str()) {
                continue;
            }
            let file_type = item.file_type().expect("file type");
            if file_type.is_symlink() {
                let target = fs::read_link(&path).expect("read link");
                out.push((rel, target.to_string_lossy().into_owned().into_bytes()));
            } else if file_type.is_dir() {
                out.push((rel.clone(), Vec::new()));
                stack.push(path);
            } else {
                out.push((rel, fs::read(&path).expect("read file")));
            }
        }
    }
    out.sort();
    out
}

//! Data-directory file inventory.
//!
//! Walks a data directory into a flat list of entries with logical (relative,
//! POSIX) paths, following tablespace symlinks so their contents are listed
//! under `pg_tblspc/<oid>/...`. WAL and runtime-only content is excluded from
//! the transfer; the directories themselves are kept so the destination gets
//! the full skeleton.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use walkdir::WalkDir;

use crate::catchup::copier::CopyOutcome;
use crate::catchup::pagemap::PageBitmap;
use crate::pg::{PG_CONTROL_FILE, PG_WAL_DIR};
use crate::{Error, Result};

/// Directories whose contents are runtime-only state and are never copied.
/// The directory entries themselves stay in the list.
const CONTENT_EXCLUDED_DIRS: &[&str] = &[
    PG_WAL_DIR,
    "pg_xlog",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
    "log",
];

/// Root-level files that must not travel to the destination.
const EXCLUDED_ROOT_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "backup_label",
    "backup_label.old",
    "tablespace_map",
    "tablespace_map.old",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    /// Sockets, fifos and other things a data directory should not contain.
    Unexpected,
}

#[derive(Debug)]
pub struct FileEntry {
    /// Logical path, anchored at the data directory root.
    pub rel_path: String,
    pub kind: FileKind,
    /// Permission bits from the source.
    pub mode: u32,
    pub size: u64,
    pub is_datafile: bool,
    /// Member of a compressed-filesystem tablespace; routed to the plain
    /// copier because page-level deltas do not apply.
    pub is_cfs: bool,
    pub external_dir: u32,
    /// Changed-page map, attached in block-tracking mode.
    pub pagemap: Option<PageBitmap>,
    /// Set by the worker that found this path in the prior destination list.
    pub exists_in_prev: AtomicBool,
    claim: AtomicBool,
    /// Source bytes observed by the copier.
    pub read_size: AtomicU64,
    /// Copy result, written once by the claiming worker.
    pub outcome: OnceLock<CopyOutcome>,
}

impl FileEntry {
    pub fn new(rel_path: impl Into<String>, kind: FileKind, mode: u32, size: u64) -> FileEntry {
        let rel_path = rel_path.into();
        let is_datafile = kind == FileKind::Regular && is_datafile_path(&rel_path);
        FileEntry {
            rel_path,
            kind,
            mode,
            size,
            is_datafile,
            is_cfs: false,
            external_dir: 0,
            pagemap: None,
            exists_in_prev: AtomicBool::new(false),
            claim: AtomicBool::new(false),
            read_size: AtomicU64::new(0),
            outcome: OnceLock::new(),
        }
    }

    /// Single-shot claim; true for exactly one caller.
    pub fn try_claim(&self) -> bool {
        !self.claim.swap(true, Ordering::AcqRel)
    }

    pub fn file_name(&self) -> &str {
        self.rel_path
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.rel_path)
    }
}

/// Main-fork relation files are the ones the block-aware copier understands:
/// `global/1259`, `base/16384/2619.2`, `pg_tblspc/16400/PG_14_*/16384/16385`.
pub fn is_datafile_path(rel_path: &str) -> bool {
    fn digits(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
    }
    fn rel_file_name(s: &str) -> bool {
        match s.split_once('.') {
            Some((base, segno)) => digits(base) && digits(segno),
            None => digits(s),
        }
    }

    let parts: Vec<&str> = rel_path.split('/').collect();
    match parts.as_slice() {
        ["global", name] => rel_file_name(name),
        ["base", db, name] => digits(db) && rel_file_name(name),
        ["pg_tblspc", spc, version, db, name] => {
            digits(spc) && version.starts_with("PG_") && digits(db) && rel_file_name(name)
        }
        _ => false,
    }
}

fn rel_path_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let text = rel.to_string_lossy().into_owned();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn content_excluded(rel_path: &str) -> bool {
    match rel_path.split_once('/') {
        Some((top, _)) => CONTENT_EXCLUDED_DIRS.contains(&top),
        None => false,
    }
}

fn file_excluded(rel_path: &str, file_name: &str) -> bool {
    if !rel_path.contains('/') && EXCLUDED_ROOT_FILES.contains(&rel_path) {
        return true;
    }
    file_name == "pg_internal.init" || file_name.starts_with("pgsql_tmp")
}

/// Walk a data directory into an unsorted inventory.
pub fn list_data_directory(root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| match rel_path_of(root, e.path()) {
            Some(rel) => !content_excluded(&rel),
            None => true,
        });

    for item in walker {
        let item = item.map_err(|err| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        })?;
        let Some(rel_path) = rel_path_of(root, item.path()) else {
            continue;
        };
        let file_name = item.file_name().to_string_lossy();
        if file_excluded(&rel_path, &file_name) {
            continue;
        }

        let file_type = item.file_type();
        let metadata = item.metadata().map_err(|err| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        })?;
        let mode = metadata.permissions().mode() & 0o7777;

        let entry = if file_type.is_dir() {
            FileEntry::new(rel_path, FileKind::Directory, mode, 0)
        } else if file_type.is_file() {
            FileEntry::new(rel_path, FileKind::Regular, mode, metadata.len())
        } else {
            FileEntry::new(rel_path, FileKind::Unexpected, mode, 0)
        };
        entries.push(entry);
    }

    Ok(entries)
}

/// Ascending by relative path: parents sort before children, and the order
/// binary search expects.
pub fn sort_by_rel_path(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
}

/// Descending by size, biggest first, for worker load balancing. Ties keep a
/// stable path order so runs are reproducible.
pub fn sort_by_size_desc(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.rel_path.cmp(&b.rel_path)));
}

/// Binary search in a path-sorted list.
pub fn find_by_rel_path(entries: &[FileEntry], rel_path: &str) -> Option<usize> {
    entries
        .binary_search_by(|entry| entry.rel_path.as_str().cmp(rel_path))
        .ok()
}

/// Remove `global/pg_control` from a path-sorted list for its special,
/// last-in-line treatment.
pub fn take_control_entry(entries: &mut Vec<FileEntry>, root: &Path) -> Result<FileEntry> {
    match find_by_rel_path(entries, PG_CONTROL_FILE) {
        Some(index) => Ok(entries.remove(index)),
        None => Err(Error::ControlFile {
            path: root.join(PG_CONTROL_FILE).display().to_string(),
            reason: "not found in the source file list".into(),
        }
        .into()),
    }
}

pub fn total_bytes(entries: &[FileEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.kind == FileKind::Regular)
        .map(|e| e.size)
        .sum()
}

/// True when a directory is missing or holds no entries.
pub fn dir_is_empty(path: &Path) -> Result<bool> {
    match std::fs::read_dir(path) {
        Ok(mut iter) => Ok(iter.next().is_none()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err.into()),
    }
}

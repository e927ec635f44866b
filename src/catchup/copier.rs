//! Per-file copy primitives.
//!
//! Two entry points: [`copy_data_file`] understands the page structure of
//! main-fork relation files and copies only the blocks an incremental run
//! needs; [`copy_plain_file`] moves everything else whole. Both report how
//! much they read and what they did to the destination.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::Path;

use crate::catchup::pagemap::PageBitmap;
use crate::catchup::CatchupMode;
use crate::pg::lsn::Lsn;
use crate::pg::{page, BLCKSZ};
use crate::{Error, Result};

/// What the copier did to the destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The source file vanished between inventory and copy.
    NotFound,
    /// No bytes were written; the prior destination content stands.
    Unchanged,
    /// Bytes written to the destination.
    Written(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    pub read_size: u64,
    pub outcome: CopyOutcome,
}

pub struct DataCopyParams<'a> {
    pub mode: CatchupMode,
    /// Pages whose LSN is at or below this are unchanged since the
    /// destination's checkpoint (delta mode).
    pub sync_lsn: Lsn,
    /// Cluster page-checksum version; 0 disables verification.
    pub checksum_version: u32,
    /// Size of the prior destination file, when one exists.
    pub prev_size: Option<u64>,
    /// Changed-page map (block-tracking mode).
    pub pagemap: Option<&'a PageBitmap>,
}

fn open_source(path: &Path) -> Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn copy_permissions(source: &File, dest_path: &Path) -> Result<()> {
    let mode = source.metadata()?.permissions().mode() & 0o7777;
    fs::set_permissions(dest_path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Read one page, re-reading once on a checksum mismatch; the server may have
/// been writing the page concurrently.
fn read_verified_page(
    src: &File,
    from: &Path,
    blkno: u32,
    buf: &mut [u8],
    verify: bool,
) -> Result<usize> {
    let offset = blkno as u64 * BLCKSZ as u64;
    let mut n = read_block(src, buf, offset)?;
    if verify && n == BLCKSZ && !page::verify_page(buf, blkno) {
        n = read_block(src, buf, offset)?;
        if n == BLCKSZ && !page::verify_page(buf, blkno) {
            return Err(Error::PageChecksum {
                path: from.display().to_string(),
                blkno,
            }
            .into());
        }
    }
    Ok(n)
}

fn read_block(src: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = src.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Block-aware copy of a main-fork relation file.
///
/// Full mode (and files with no prior destination copy) moves every block.
/// Delta mode moves blocks whose page LSN passed `sync_lsn` and everything
/// beyond the prior file tail. Block-tracking mode moves the blocks the
/// pagemap names, plus the grown tail; a tracked data file without a pagemap
/// is copied whole.
pub fn copy_data_file(from: &Path, to: &Path, params: &DataCopyParams<'_>) -> Result<CopyReport> {
    let Some(src) = open_source(from)? else {
        return Ok(CopyReport {
            read_size: 0,
            outcome: CopyOutcome::NotFound,
        });
    };
    let src_len = src.metadata()?.len();
    let nblocks = src_len.div_ceil(BLCKSZ as u64);
    let prev_blocks = params.prev_size.map(|s| s.div_ceil(BLCKSZ as u64));
    let verify = params.checksum_version != 0;

    let dest = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(to)?;

    let mut buf = vec![0u8; BLCKSZ];
    let mut read_size = 0u64;
    let mut written = 0u64;

    for blkno in 0..nblocks {
        let beyond_prev = match prev_blocks {
            Some(prev) => blkno >= prev,
            None => true,
        };

        // Decide before reading; unneeded blocks are never touched.
        let want = match (params.mode, params.pagemap) {
            _ if beyond_prev => true,
            (CatchupMode::Full, _) => true,
            (CatchupMode::Ptrack, Some(map)) => map.contains(blkno as u32),
            (CatchupMode::Ptrack, None) => true,
            (CatchupMode::Delta, _) => {
                let n = read_verified_page(&src, from, blkno as u32, &mut buf, verify)?;
                if n == 0 {
                    // concurrent truncation; the tail fix below handles it
                    break;
                }
                read_size += n as u64;
                // a torn tail fragment has no trustworthy header; copy it
                let changed = n < BLCKSZ
                    || (!page::page_is_zeroed(&buf[..n])
                        && page::page_lsn(&buf) > params.sync_lsn);
                if changed {
                    dest.write_all_at(&buf[..n], blkno * BLCKSZ as u64)?;
                    written += n as u64;
                }
                continue;
            }
        };
        if !want {
            continue;
        }

        let n = read_verified_page(&src, from, blkno as u32, &mut buf, verify)?;
        if n == 0 {
            break;
        }
        read_size += n as u64;
        dest.write_all_at(&buf[..n], blkno * BLCKSZ as u64)?;
        written += n as u64;
    }

    // Mirror shrinkage; growth is covered by the beyond-tail copies above.
    let mut truncated = false;
    if let Some(prev) = params.prev_size {
        if src_len < prev {
            dest.set_len(src_len)?;
            truncated = true;
        }
    }

    copy_permissions(&src, to)?;

    let outcome = if written == 0 && !truncated && params.prev_size == Some(src_len) {
        CopyOutcome::Unchanged
    } else {
        CopyOutcome::Written(written)
    };
    Ok(CopyReport { read_size, outcome })
}

/// Whole-file copy for everything that is not a relation main fork.
///
/// With `check_unchanged`, a byte-identical prior destination file is left
/// alone. `force` disables that shortcut; the relation mapper file is always
/// forced because its checksum cannot be trusted across the backup window.
pub fn copy_plain_file(
    from: &Path,
    to: &Path,
    check_unchanged: bool,
    force: bool,
) -> Result<CopyReport> {
    let Some(src) = open_source(from)? else {
        return Ok(CopyReport {
            read_size: 0,
            outcome: CopyOutcome::NotFound,
        });
    };

    let mut data = Vec::new();
    {
        use std::io::Read;
        let mut reader = &src;
        reader.read_to_end(&mut data)?;
    }
    let read_size = data.len() as u64;

    if check_unchanged && !force {
        if let Ok(existing) = fs::read(to) {
            if existing == data {
                copy_permissions(&src, to)?;
                return Ok(CopyReport {
                    read_size,
                    outcome: CopyOutcome::Unchanged,
                });
            }
        }
    }

    let mut dest = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(to)?;
    {
        use std::io::Write;
        dest.write_all(&data)?;
    }
    copy_permissions(&src, to)?;

    Ok(CopyReport {
        read_size,
        outcome: CopyOutcome::Written(read_size),
    })
}

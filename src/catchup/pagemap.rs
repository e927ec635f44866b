//! Changed-page maps for block-tracking catchup.

use tracing::{debug, info};

use crate::catchup::inventory::{find_by_rel_path, FileEntry};
use crate::catchup::probe::NodeInfo;
use crate::pg::lsn::Lsn;
use crate::session::SourceSession;
use crate::{Error, Result};

/// One bit per page; set means the page changed since the tracked LSN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageBitmap {
    bits: Vec<u8>,
}

impl PageBitmap {
    pub fn from_bytes(bits: Vec<u8>) -> PageBitmap {
        PageBitmap { bits }
    }

    pub fn contains(&self, blkno: u32) -> bool {
        let index = (blkno / 8) as usize;
        match self.bits.get(index) {
            Some(byte) => byte & (1 << (blkno % 8)) != 0,
            None => false,
        }
    }

    pub fn set(&mut self, blkno: u32) {
        let index = (blkno / 8) as usize;
        if index >= self.bits.len() {
            self.bits.resize(index + 1, 0);
        }
        self.bits[index] |= 1 << (blkno % 8);
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn page_count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }
}

/// Verify the block-change log still covers the gap since the destination's
/// checkpoint. A newer (or invalid) init LSN means changes were lost and only
/// a full catchup can be correct.
pub fn ensure_ptrack_coverage(
    session: &mut dyn SourceSession,
    node: &NodeInfo,
    dest_redo_lsn: Lsn,
) -> Result<()> {
    let ptrack_lsn = session.ptrack_init_lsn(&node.ptrack_schema)?;
    if !ptrack_lsn.is_valid() || ptrack_lsn > dest_redo_lsn {
        return Err(Error::BlockTrackingStale {
            ptrack_lsn,
            dest_lsn: dest_redo_lsn,
        }
        .into());
    }
    debug!(%ptrack_lsn, %dest_redo_lsn, "block-change log covers the destination gap");
    Ok(())
}

/// Attach per-file page bitmaps for every data file the source reports as
/// changed since `since`. `entries` must be sorted by relative path.
pub fn attach_pagemaps(
    session: &mut dyn SourceSession,
    node: &NodeInfo,
    since: Lsn,
    entries: &mut [FileEntry],
) -> Result<()> {
    info!(%since, "extracting pagemap of changed blocks");
    let rows = session.ptrack_pagemaps(&node.ptrack_schema, since)?;
    let mut attached = 0usize;
    for row in rows {
        if let Some(index) = find_by_rel_path(entries, &row.rel_path) {
            if entries[index].is_datafile {
                entries[index].pagemap = Some(PageBitmap::from_bytes(row.pagemap));
                attached += 1;
            }
        }
    }
    info!(files = attached, "pagemap extracted");
    Ok(())
}

//! WAL segment file-name math.

use std::ops::RangeInclusive;
use std::path::Path;

use crate::pg::lsn::Lsn;

/// Segment file names carry a `(high, low)` split of the segment number at the
/// 4 GiB boundary.
fn segments_per_xlog_id(seg_size: u64) -> u64 {
    0x1_0000_0000 / seg_size
}

/// File name of a WAL segment (`TTTTTTTTXXXXXXXXYYYYYYYY`).
pub fn segment_file_name(tli: u32, segno: u64, seg_size: u64) -> String {
    let per_id = segments_per_xlog_id(seg_size);
    format!("{:08X}{:08X}{:08X}", tli, segno / per_id, segno % per_id)
}

/// Segment numbers whose files must exist to cover `[start, stop]`.
///
/// A stop position sitting exactly on a segment boundary belongs to the
/// previous segment; the boundary byte itself is never written.
pub fn segments_covering(start: Lsn, stop: Lsn, seg_size: u64) -> RangeInclusive<u64> {
    let first = start.segment_number(seg_size);
    let last = if stop.segment_offset(seg_size) == 0 && stop.is_valid() {
        stop.segment_number(seg_size).saturating_sub(1)
    } else {
        stop.segment_number(seg_size)
    };
    first..=last.max(first)
}

/// True when every segment covering `[start, stop]` exists in `wal_dir` as a
/// complete (full-size, non-partial) file.
pub fn segments_complete(
    wal_dir: &Path,
    tli: u32,
    start: Lsn,
    stop: Lsn,
    seg_size: u64,
) -> std::io::Result<bool> {
    for segno in segments_covering(start, stop, seg_size) {
        let path = wal_dir.join(segment_file_name(tli, segno, seg_size));
        match std::fs::metadata(&path) {
            Ok(meta) => {
                if meta.len() != seg_size {
                    return Ok(false);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

use std::fs;

use pgcatchup::pg::lsn::Lsn;
use pgcatchup::pg::wal::{segment_file_name, segments_complete, segments_covering};
use tempfile::tempdir;

const SEG: u64 = 1024 * 1024;

#[test]
fn segment_names_split_at_the_4gib_boundary() {
    assert_eq!(segment_file_name(1, 0x30, SEG), "000000010000000000000030");
    // 4 GiB / 1 MiB = 4096 segments per xlog id
    assert_eq!(segment_file_name(1, 4096, SEG), "000000010000000100000000");
    assert_eq!(segment_file_name(3, 4097, SEG), "000000030000000100000001");
}

#[test]
fn covering_range_spans_start_to_stop() {
    let range = segments_covering(Lsn(0x3000028), Lsn(0x3200010), SEG);
    assert_eq!(range, 0x30..=0x32);
}

#[test]
fn stop_on_a_segment_boundary_belongs_to_the_previous_segment() {
    let range = segments_covering(Lsn(0x3000028), Lsn(0x3200000), SEG);
    assert_eq!(range, 0x30..=0x31);
}

#[test]
fn start_and_stop_in_one_segment() {
    let range = segments_covering(Lsn(0x3000028), Lsn(0x3000100), SEG);
    assert_eq!(range, 0x30..=0x30);
}

#[test]
fn completeness_requires_every_full_size_segment() {
    let dir = tempdir().unwrap();
    let start = Lsn(0x3000028);
    let stop = Lsn(0x3100010);

    assert!(!segments_complete(dir.path(), 1, start, stop, SEG).unwrap());

    fs::write(
        dir.path().join(segment_file_name(1, 0x30, SEG)),
        vec![0u8; SEG as usize],
    )
    .unwrap();
    assert!(!segments_complete(dir.path(), 1, start, stop, SEG).unwrap());

    // a partial-size file does not count
    fs::write(dir.path().join(segment_file_name(1, 0x31, SEG)), b"short").unwrap();
    assert!(!segments_complete(dir.path(), 1, start, stop, SEG).unwrap());

    fs::write(
        dir.path().join(segment_file_name(1, 0x31, SEG)),
        vec![0u8; SEG as usize],
    )
    .unwrap();
    assert!(segments_complete(dir.path(), 1, start, stop, SEG).unwrap());
}

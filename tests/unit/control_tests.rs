use std::fs;

use pgcatchup::pg::control::{set_min_recovery_point, ControlFile, DbState};
use pgcatchup::pg::lsn::Lsn;
use pgcatchup::pg::PG_CONTROL_FILE;
use tempfile::tempdir;

#[path = "../support/mod.rs"]
mod support;

#[test]
fn write_read_round_trip() {
    let dir = tempdir().unwrap();
    let mut control = ControlFile::new(42424242, DbState::Shutdowned, Lsn(0x3000000), 2);
    control.wal_seg_size = support::TEST_WAL_SEG_SIZE;
    control.data_checksum_version = 1;
    control.write_to(dir.path()).unwrap();

    let read = ControlFile::read_from(dir.path()).unwrap();
    assert_eq!(read.system_identifier, 42424242);
    assert_eq!(read.state, DbState::Shutdowned);
    assert_eq!(read.redo, Lsn(0x3000000));
    assert_eq!(read.checkpoint, Lsn(0x3000000));
    assert_eq!(read.timeline, 2);
    assert_eq!(read.wal_seg_size, support::TEST_WAL_SEG_SIZE);
    assert_eq!(read.data_checksum_version, 1);

    let redo = read.redo_params();
    assert_eq!(redo.tli, 2);
    assert_eq!(redo.lsn, Lsn(0x3000000));
    assert_eq!(redo.checkpoint, Lsn(0x3000000));
}

#[test]
fn corrupted_image_is_rejected() {
    let dir = tempdir().unwrap();
    ControlFile::new(1, DbState::Shutdowned, Lsn(0x100), 1)
        .write_to(dir.path())
        .unwrap();

    let path = dir.path().join(PG_CONTROL_FILE);
    let mut raw = fs::read(&path).unwrap();
    raw[0] ^= 0xFF;
    fs::write(&path, raw).unwrap();

    let err = ControlFile::read_from(dir.path()).unwrap_err();
    assert!(err.to_string().contains("bad crc"), "{err}");
}

#[test]
fn short_file_is_rejected() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("global")).unwrap();
    fs::write(dir.path().join(PG_CONTROL_FILE), b"tiny").unwrap();

    let err = ControlFile::read_from(dir.path()).unwrap_err();
    assert!(err.to_string().contains("short file"), "{err}");
}

#[test]
fn missing_file_reports_the_path() {
    let dir = tempdir().unwrap();
    let err = ControlFile::read_from(dir.path()).unwrap_err();
    assert!(err.to_string().contains("pg_control"), "{err}");
}

#[test]
fn clean_shutdown_states() {
    assert!(DbState::Shutdowned.is_clean_shutdown());
    assert!(DbState::ShutdownedInRecovery.is_clean_shutdown());
    assert!(!DbState::InProduction.is_clean_shutdown());
    assert!(!DbState::InCrashRecovery.is_clean_shutdown());
}

#[test]
fn min_recovery_point_rewrite_keeps_the_rest() {
    let dir = tempdir().unwrap();
    let mut control = ControlFile::new(99, DbState::ShutdownedInRecovery, Lsn(0x5000000), 3);
    control.data_checksum_version = 1;
    control.write_to(dir.path()).unwrap();

    set_min_recovery_point(dir.path(), Lsn(0x5000128), 3).unwrap();

    let read = ControlFile::read_from(dir.path()).unwrap();
    assert_eq!(read.min_recovery_point, Lsn(0x5000128));
    assert_eq!(read.min_recovery_point_tli, 3);
    // untouched fields survive the rewrite
    assert_eq!(read.system_identifier, 99);
    assert_eq!(read.redo, Lsn(0x5000000));
    assert_eq!(read.data_checksum_version, 1);
}

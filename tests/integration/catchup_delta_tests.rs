use std::fs;

use pgcatchup::catchup::{do_catchup, CatchupConfig, CatchupMode};
use pgcatchup::pg::control::{ControlFile, DbState};
use pgcatchup::pg::BLCKSZ;
use pgcatchup::Error;
use tempfile::tempdir;

#[path = "../support/mod.rs"]
mod support;

use support::{lsn, FakeSession, FakeStreamer};

fn config_for(mode: CatchupMode, source: &std::path::Path, dest: &std::path::Path) -> CatchupConfig {
    CatchupConfig::new(mode, source.to_path_buf(), dest.to_path_buf())
}

fn fresh_session() -> FakeSession {
    FakeSession::new(support::TEST_SYSTEM_ID, 1, lsn("0/3000028"), lsn("0/3000100"))
}

/// FULL first, then flip the destination to "cleanly stopped" so an
/// incremental run will accept it.
fn seed_destination(source: &std::path::Path, dest: &std::path::Path) {
    let mut session = fresh_session();
    let mut config = config_for(CatchupMode::Full, source, dest);
    do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();
    support::simulate_clean_shutdown(dest);
}

#[test]
fn delta_over_an_unchanged_source_rewrites_only_the_control_file() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/3000000"), 1);
    seed_destination(source.path(), dest.path());

    // Scribble into a page body at the destination, past the header. A delta
    // run must not touch pages whose LSN never passed the checkpoint, so the
    // scribble proves the file went through as UNCHANGED.
    let rel = dest.path().join("base/1/1259");
    let mut data = fs::read(&rel).unwrap();
    data[BLCKSZ / 2] ^= 0xFF;
    fs::write(&rel, &data).unwrap();

    let mut session = fresh_session();
    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();

    let after = fs::read(&rel).unwrap();
    assert_eq!(after[BLCKSZ / 2], data[BLCKSZ / 2], "unchanged page was rewritten");

    // the control file is refreshed regardless, back to the source's image
    let control = ControlFile::read_from(dest.path()).unwrap();
    assert_eq!(control.state, DbState::InProduction);
    assert!(dest.path().join("backup_label").exists());
}

#[test]
fn delta_copies_pages_that_passed_the_checkpoint() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/3000000"), 1);
    seed_destination(source.path(), dest.path());

    // block 1 of base/1/1259 advances past the destination checkpoint
    support::write_rel_file(
        source.path(),
        "base/1/1259",
        &[lsn("0/3000000"), lsn("0/3000090")],
        false,
    );

    let mut session = fresh_session();
    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();

    assert_eq!(
        fs::read(source.path().join("base/1/1259")).unwrap(),
        fs::read(dest.path().join("base/1/1259")).unwrap()
    );
}

#[test]
fn delta_deletes_dropped_relations_and_refreshes_the_relation_map() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/3000000"), 1);
    support::write_rel_file(source.path(), "base/1/99999", &[lsn("0/2000000")], false);
    seed_destination(source.path(), dest.path());
    assert!(dest.path().join("base/1/99999").exists());

    // the relation vanished from the source; the mapper moved on
    fs::remove_file(source.path().join("base/1/99999")).unwrap();
    fs::write(source.path().join("base/1/pg_filenode.map"), b"relmap-v2").unwrap();

    let mut session = fresh_session();
    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();

    assert!(!dest.path().join("base/1/99999").exists());
    assert_eq!(
        fs::read(dest.path().join("base/1/pg_filenode.map")).unwrap(),
        b"relmap-v2"
    );
}

#[test]
fn delta_removes_directories_dropped_on_the_source() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/3000000"), 1);
    support::write_rel_file(source.path(), "base/77/5000", &[lsn("0/2000000")], false);
    seed_destination(source.path(), dest.path());
    assert!(dest.path().join("base/77/5000").exists());

    fs::remove_dir_all(source.path().join("base/77")).unwrap();

    let mut session = fresh_session();
    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();

    assert!(!dest.path().join("base/77").exists());
}

#[test]
fn a_quiet_delta_reproduces_the_full_result() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/3000000"), 1);
    seed_destination(source.path(), dest.path());

    let before = {
        // the seeded tree, with the control file as the source wrote it
        let mut session = fresh_session();
        let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
        do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();
        support::snapshot_tree(dest.path(), &[])
    };

    support::simulate_clean_shutdown(dest.path());
    let after = {
        let mut session = fresh_session();
        let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
        do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();
        support::snapshot_tree(dest.path(), &[])
    };

    assert_eq!(before, after);
}

#[test]
fn a_source_older_than_the_destination_is_an_lsn_inversion() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/3000000"), 1);

    // destination checkpoint is ahead of the start LSN the source hands out
    fs::create_dir_all(dest.path().join("global")).unwrap();
    support::write_control(
        dest.path(),
        support::TEST_SYSTEM_ID,
        DbState::Shutdowned,
        lsn("0/5000000"),
        1,
        0,
    );

    let mut session = fresh_session();
    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    let err = do_catchup(&mut config, &mut session, &FakeStreamer).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::LsnInversion { .. })
    ));

    // nothing was mutated at the destination
    assert!(!dest.path().join("pg_wal").exists());
    assert!(!dest.path().join("backup_label").exists());
}

#[test]
fn delta_into_an_empty_destination_is_refused() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/3000000"), 1);

    let mut session = fresh_session();
    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    let err = do_catchup(&mut config, &mut session, &FakeStreamer).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::EmptyDestination(_))
    ));
}

#[test]
fn a_forked_destination_is_detected_end_to_end() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/7000000"), 3);
    seed_destination(source.path(), dest.path());

    // pretend the destination stopped on timeline 2 past the switch point
    let mut control = ControlFile::read_from(dest.path()).unwrap();
    control.timeline = 2;
    control.checkpoint = lsn("0/7000000");
    control.redo = lsn("0/7000000");
    control.state = DbState::Shutdowned;
    control.write_to(dest.path()).unwrap();

    let mut session = FakeSession::new(
        support::TEST_SYSTEM_ID,
        3,
        lsn("0/7000028"),
        lsn("0/7000100"),
    );
    session.history = "1\t0/4000000\treason\n2\t0/6000000\treason\n".into();

    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    let err = do_catchup(&mut config, &mut session, &FakeStreamer).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TimelineDivergence { tli: 2, .. })
    ));
}

#[test]
fn a_destination_on_the_source_history_is_accepted() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    support::build_source_cluster(source.path(), lsn("0/7000000"), 3);
    seed_destination(source.path(), dest.path());

    // destination stopped on timeline 2 before the switch into 3
    let mut control = ControlFile::read_from(dest.path()).unwrap();
    control.timeline = 2;
    control.checkpoint = lsn("0/5000000");
    control.redo = lsn("0/5000000");
    control.state = DbState::Shutdowned;
    control.write_to(dest.path()).unwrap();

    let mut session = FakeSession::new(
        support::TEST_SYSTEM_ID,
        3,
        lsn("0/7000028"),
        lsn("0/7000100"),
    );
    session.history = "1\t0/4000000\treason\n2\t0/6000000\treason\n".into();

    let mut config = config_for(CatchupMode::Delta, source.path(), dest.path());
    let state = do_catchup(&mut config, &mut session, &FakeStreamer).unwrap();
    assert_eq!(state.tli, 3);
    assert!(dest.path().join("backup_label").exists());
}

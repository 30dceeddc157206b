//! Integration tests for the Exclusion & Presence / Peer Waiter pair across
//! a fixed filesystem layout (no process boundary needed: both sides of the
//! FIFO-presence protocol only observe path existence).

use rc_runner::constants::Paths;
use rc_runner::deptree::DepTree;
use rc_runner::exclusive::{make_exclusive, remove_exclusive, wait_for_peer, WaitOutcome};

#[test]
fn marker_present_between_make_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path());

    assert!(!paths.exclusive("db").exists());
    make_exclusive(&paths, "db").unwrap();
    assert!(paths.exclusive("db").exists());
    remove_exclusive(&paths, "db");
    assert!(!paths.exclusive("db").exists());
}

#[test]
fn peer_waiter_resolves_once_marker_removed_by_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path());
    make_exclusive(&paths, "db").unwrap();

    let tree = DepTree::default();
    let marker = paths.exclusive("db");
    let remover = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(80));
        let _ = std::fs::remove_file(marker);
    });

    assert_eq!(wait_for_peer(&paths, &tree, "db"), WaitOutcome::Gone);
    remover.join().unwrap();
}

#[test]
fn repeated_make_exclusive_is_idempotent_for_the_owning_peer() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path());
    assert!(make_exclusive(&paths, "db").unwrap());
    // A second call (e.g. from the same process retrying) observes EEXIST
    // and treats it as already-owned, not fatal.
    assert!(make_exclusive(&paths, "db").unwrap());
}

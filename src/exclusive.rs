//! Exclusion & Presence (§4.3) and Peer Waiter (§4.5).
//!
//! The exclusive marker is a named FIFO: its mere existence is the lock,
//! which lets a peer in a different process *poll* for completion without
//! holding a descriptor of its own, matching `runscript.c`'s
//! `make_exclusive`/`svc_wait` pair.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Uid};
use tracing::{debug, warn};

use crate::constants::{Paths, WAIT_INTERVAL, WAIT_MAX};
use crate::deptree::DepTree;
use crate::error::ExecError;

/// Creates the FIFO exclusive marker for `svc`.
///
/// Returns `Ok(true)` if the marker was created by this call, `Ok(false)` if
/// a non-root process hit `EACCES` (no write access to the shared area —
/// continue without a marker, peers simply won't wait on us), and an error
/// for anything else. `EEXIST` is not surfaced as an error: the race is
/// resolved by `StateStore::mark`, so a peer already owning the marker is
/// expected, not fatal.
pub fn make_exclusive(paths: &Paths, svc: &str) -> Result<bool, ExecError> {
    let path = paths.exclusive(svc);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ExecError::Resource {
            context: format!("creating exclusive dir for '{svc}'"),
            source: e,
        })?;
    }

    match mkfifo(&path, Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(true),
        Err(Errno::EEXIST) => {
            debug!(service = svc, "exclusive marker already present (peer owns it)");
            Ok(true)
        }
        Err(Errno::EACCES) if !Uid::effective().is_root() => {
            warn!(service = svc, "no write access to shared area; continuing without a marker");
            Ok(false)
        }
        Err(e) => Err(ExecError::Resource {
            context: format!("creating exclusive marker for '{svc}'"),
            source: io::Error::from_raw_os_error(e as i32),
        }),
    }
}

/// Unlinks the exclusive marker unconditionally. Called at every supervisor
/// exit path, per invariant I2.
pub fn remove_exclusive(paths: &Paths, svc: &str) {
    let path = paths.exclusive(svc);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(service = svc, error = %e, "failed to remove exclusive marker");
        }
    }
}

/// Outcome of `wait_for_peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The peer's marker disappeared.
    Gone,
    /// The deadline elapsed while the marker still existed.
    TimedOut,
}

/// Polls for the disappearance of `<svcdir>/exclusive/<basename(peer)>` at a
/// fixed 20 ms interval. Unbounded if `peer`'s keywords include `notimeout`,
/// otherwise bounded at 300 s. A final existence recheck after the loop
/// promotes a borderline "just vanished" case to success (P7).
pub fn wait_for_peer(paths: &Paths, tree: &DepTree, peer: &str) -> WaitOutcome {
    let marker = paths.exclusive(basename(peer));
    if !marker.exists() {
        return WaitOutcome::Gone;
    }

    let unbounded = tree
        .keywords(peer)
        .iter()
        .any(|k| k == crate::constants::KEYWORD_NOTIMEOUT);
    let start = Instant::now();

    loop {
        if !marker.exists() {
            return WaitOutcome::Gone;
        }
        if !unbounded && start.elapsed() >= WAIT_MAX {
            break;
        }
        std::thread::sleep(WAIT_INTERVAL);
    }

    if !marker.exists() {
        WaitOutcome::Gone
    } else {
        WaitOutcome::TimedOut
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn make_then_remove_round_trips() {
        let dir = tempdir().unwrap();
        let paths = Paths::new(dir.path());
        assert!(make_exclusive(&paths, "svc").unwrap());
        assert!(paths.exclusive("svc").exists());
        remove_exclusive(&paths, "svc");
        assert!(!paths.exclusive("svc").exists());
    }

    #[test]
    fn wait_returns_immediately_when_absent() {
        let dir = tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let tree = DepTree::default();
        assert_eq!(wait_for_peer(&paths, &tree, "ghost"), WaitOutcome::Gone);
    }

    #[test]
    fn wait_detects_marker_removed_concurrently() {
        let dir = tempdir().unwrap();
        let paths = Paths::new(dir.path());
        make_exclusive(&paths, "db").unwrap();
        let tree = DepTree::default();
        let marker = paths.exclusive("db");
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(60));
            let _ = fs::remove_file(marker);
        });
        assert_eq!(wait_for_peer(&paths, &tree, "db"), WaitOutcome::Gone);
        handle.join().unwrap();
    }
}

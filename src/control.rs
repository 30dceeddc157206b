//! Control-Epoch Guard (§4.4): decides whether the current process is still
//! the rightful owner of a transition, detecting takeover by another actor.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::constants::{Paths, State};
use crate::state::{PrincipalState, StateStore};

/// Set by the SIGHUP handler. Process-wide because handler context is
/// inherently global (§9 "Global mutable state").
static SIGHUP_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Records that a SIGHUP was observed. Safe to call from a signal handler.
pub fn note_sighup() {
    SIGHUP_RECEIVED.store(true, Ordering::SeqCst);
}

/// Clears the recorded SIGHUP; used between independent CLI actions in the
/// same invocation so state from one doesn't leak into the next.
pub fn reset_sighup() {
    SIGHUP_RECEIVED.store(false, Ordering::SeqCst);
}

fn sighup_seen() -> bool {
    SIGHUP_RECEIVED.load(Ordering::SeqCst)
}

/// Tracks whether the current process still owns `svc`'s transition.
pub struct ControlEpoch<'a> {
    paths: &'a Paths,
    svc: &'a str,
    pid: u32,
}

impl<'a> ControlEpoch<'a> {
    pub fn new(paths: &'a Paths, svc: &'a str, pid: u32) -> Self {
        Self { paths, svc, pid }
    }

    /// `in_control()`: true iff no SIGHUP was observed, the probe symlink
    /// still exists, the current principal state is not Stopped, and no
    /// transient marker was touched after the probe.
    pub fn in_control(&self, store: &StateStore) -> bool {
        if sighup_seen() {
            return false;
        }

        let probe = self.paths.probe(self.svc, self.pid);
        let probe_mtime = match fs::symlink_metadata(&probe).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return false,
        };

        let state = match store.get(self.svc) {
            Ok(state) => state,
            Err(_) => return false,
        };
        if state.principal.is_none() {
            return false;
        }

        for transient in State::TRANSIENT {
            let marker = self.paths.state_marker(transient, self.svc);
            if let Ok(meta) = fs::metadata(&marker) {
                if let Ok(marker_mtime) = meta.modified() {
                    if marker_mtime > probe_mtime {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Creates the ownership probe symlink alongside the exclusive marker.
    pub fn create_probe(&self) -> std::io::Result<()> {
        let probe = self.paths.probe(self.svc, self.pid);
        if let Some(parent) = probe.parent() {
            fs::create_dir_all(parent)?;
        }
        let target = format!("/{}", self.svc);
        match std::os::unix::fs::symlink(&target, &probe) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes the ownership probe. Idempotent (P2: no probe remains for the
    /// exiting pid after any exit path).
    pub fn remove_probe(&self) {
        let probe = self.paths.probe(self.svc, self.pid);
        let _ = fs::remove_file(probe);
    }
}

/// True if `level` is one of the soft-levels that relax a stop failure into
/// a best-effort proceed (shutdown/reboot/single), per invariant I5.
pub fn is_forceful_softlevel(level: &str) -> bool {
    crate::constants::FORCEFUL_SOFTLEVELS.contains(&level)
}

/// Restores state for a transition that is being abandoned (cleanup path):
/// Stopping -> Started or Inactive (per WASINACTIVE); Starting -> Stopped;
/// optionally Failed if a runlevel is transitioning.
///
/// Safe to call unconditionally from a cleanup trailer regardless of whether
/// the transition actually failed: a no-op if the principal state has already
/// moved on from `was` (e.g. a successful run already marked the service
/// Started/Stopped/Failed itself), so callers never need to gate the call on
/// success/failure themselves.
pub fn restore_state(
    store: &StateStore,
    svc: &str,
    was: Option<PrincipalState>,
    wasinactive: bool,
    runlevel_transitioning: bool,
) {
    use crate::constants::Flags;

    match store.get(svc) {
        Ok(current) if current.principal != was => return,
        Err(_) => return,
        _ => {}
    }

    match was {
        Some(PrincipalState::Stopping) => {
            let restored = if wasinactive {
                PrincipalState::Inactive
            } else {
                PrincipalState::Started
            };
            let _ = store.mark(svc, restored, Flags::default());
        }
        Some(PrincipalState::Starting) => {
            let _ = store.force_stopped(svc);
        }
        other => {
            let _ = store.mark(svc, other.unwrap_or(PrincipalState::Started), Flags::default());
        }
    }

    if runlevel_transitioning {
        let _ = store.mark_failed(svc);
    }
}

/// Touches the ownership probe's mtime forward so subsequent `in_control()`
/// checks see this process as the most recent actor. Not part of the
/// original spec's operation set, but a harmless no-op hook for callers that
/// want a deterministic clock in tests.
pub fn now() -> SystemTime {
    SystemTime::now()
}

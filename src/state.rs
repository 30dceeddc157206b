//! State Store: on-disk representation of every service's current state,
//! scheduled-start edges, and (via `constants::Paths`) exclusive locks.
//!
//! Mutations are marker files touched/removed with atomic create-exclusive
//! semantics, mirroring the PID/state file pattern the daemon used to keep
//! in a single JSON blob, but per-service and per-state so that `mark()` can
//! resolve a concurrent-actor race with a single `OpenOptions::create_new`.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::constants::{Flags, Paths, State};
use crate::error::StateError;

/// Full state-bitset snapshot for a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceState {
    pub principal: Option<PrincipalState>,
    pub flags: Flags,
}

/// The disjoint principal states; `None` in `ServiceState` reads as `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalState {
    Starting,
    Started,
    Stopping,
    Inactive,
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1" | "true" | "yes"))
}

impl PrincipalState {
    fn as_state(self) -> State {
        match self {
            PrincipalState::Starting => State::Starting,
            PrincipalState::Started => State::Started,
            PrincipalState::Stopping => State::Stopping,
            PrincipalState::Inactive => State::Inactive,
        }
    }
}

/// Filesystem-backed State Store for one service-state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: Paths,
}

impl StateStore {
    pub fn new(svcdir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            paths: Paths::new(svcdir),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Reads the current state bitset for `svc`. Absence of every principal
    /// marker reads as `Stopped`.
    pub fn get(&self, svc: &str) -> Result<ServiceState, StateError> {
        let principal = [
            (State::Starting, PrincipalState::Starting),
            (State::Started, PrincipalState::Started),
            (State::Stopping, PrincipalState::Stopping),
            (State::Inactive, PrincipalState::Inactive),
        ]
        .into_iter()
        .find(|(state, _)| self.marker_path(*state, svc).exists())
        .map(|(_, principal)| principal);

        let flags = Flags {
            wasinactive: self.marker_path(State::WasInactive, svc).exists(),
            failed: self.marker_path(State::Failed, svc).exists(),
            coldplugged: self.marker_path(State::Coldplugged, svc).exists(),
            crashed_daemons: false,
        };

        Ok(ServiceState { principal, flags })
    }

    /// Moves `svc` to `principal`, applying `flags_delta` on top of the
    /// existing flags. Returns `Ok(false)` if a concurrent actor already
    /// holds the target principal marker (detected via atomic creation),
    /// per invariant P1.
    pub fn mark(
        &self,
        svc: &str,
        principal: PrincipalState,
        flags_delta: Flags,
    ) -> Result<bool, StateError> {
        let target = self.marker_path(principal.as_state(), svc);
        if let Some(parent) = target.parent() {
            self.ensure_dir(parent, svc)?;
        }

        match fs::File::options()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(service = svc, "mark() refused: already held by another actor");
                return Ok(false);
            }
            Err(e) => {
                return Err(StateError::Io {
                    service: svc.to_string(),
                    source: e,
                });
            }
        }

        for other in [
            State::Starting,
            State::Started,
            State::Stopping,
            State::Inactive,
        ] {
            if other != principal.as_state() {
                self.remove_marker(other, svc)?;
            }
        }

        if flags_delta.wasinactive {
            self.touch_marker(State::WasInactive, svc)?;
        }
        if flags_delta.failed {
            self.touch_marker(State::Failed, svc)?;
        } else {
            // FAILED is sticky within a runlevel change; callers clear it
            // explicitly (zap) rather than via a negative delta here.
        }
        if flags_delta.coldplugged {
            self.touch_marker(State::Coldplugged, svc)?;
        }

        Ok(true)
    }

    /// Forces `svc` to `Stopped` unconditionally, clearing `Coldplugged`.
    /// Used by `zap` and by cleanup's forced restore path.
    pub fn force_stopped(&self, svc: &str) -> Result<(), StateError> {
        for state in State::TRANSIENT {
            self.remove_marker(state, svc)?;
        }
        self.remove_marker(State::Coldplugged, svc)?;
        Ok(())
    }

    /// Clears only the transient-principal markers, leaving flags (used when
    /// a stop/restore ends in `Stopped` but COLDPLUGGED should survive).
    pub fn clear_principal(&self, svc: &str) -> Result<(), StateError> {
        for state in [
            State::Starting,
            State::Started,
            State::Stopping,
            State::Inactive,
        ] {
            self.remove_marker(state, svc)?;
        }
        Ok(())
    }

    pub fn clear_wasinactive(&self, svc: &str) -> Result<(), StateError> {
        self.remove_marker(State::WasInactive, svc)
    }

    pub fn clear_failed(&self, svc: &str) -> Result<(), StateError> {
        self.remove_marker(State::Failed, svc)
    }

    pub fn clear_coldplugged(&self, svc: &str) -> Result<(), StateError> {
        self.remove_marker(State::Coldplugged, svc)
    }

    /// Touches the FAILED marker without otherwise disturbing principal
    /// state. FAILED is sticky within a runlevel change.
    pub fn mark_failed(&self, svc: &str) -> Result<(), StateError> {
        self.touch_marker(State::Failed, svc)
    }

    /// Lists every service marked with `state`.
    pub fn list(&self, state: State) -> Result<Vec<String>, StateError> {
        let dir = self.paths.root().join(state.dirname());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::Io {
                    service: dir.display().to_string(),
                    source: e,
                });
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::Io {
                service: dir.display().to_string(),
                source: e,
            })?;
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Installs a scheduled-start edge `trigger -> target`.
    pub fn schedule(&self, trigger: &str, target: &str) -> Result<(), StateError> {
        let path = self.paths.scheduled_edge(trigger, target);
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent, trigger)?;
        }
        self.touch_path(&path, trigger)
    }

    /// Lists and consumes (removes) the scheduled-start targets of `trigger`.
    pub fn scheduled(&self, trigger: &str) -> Result<Vec<String>, StateError> {
        let dir = self.paths.scheduled_dir(trigger);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::Io {
                    service: trigger.to_string(),
                    source: e,
                });
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::Io {
                service: trigger.to_string(),
                source: e,
            })?;
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
            let _ = fs::remove_file(entry.path());
        }
        out.sort();
        Ok(out)
    }

    pub fn daemons_crashed(&self, _svc: &str) -> Result<bool, StateError> {
        // No general process supervision (Non-goal): daemon crash detection
        // is an external collaborator's signal, surfaced via the
        // CRASHED-DAEMONS flag file if present.
        Ok(self.marker_path(State::Coldplugged, _svc).with_extension("crashed").exists())
    }

    pub fn in_runlevel(&self, svc: &str, level: &str) -> Result<bool, StateError> {
        Ok(self.paths.root().join("runlevels").join(level).join(svc).exists())
    }

    pub fn runlevel_get(&self) -> Result<String, StateError> {
        Ok(std::env::var("RC_SOFTLEVEL").unwrap_or_default())
    }

    /// Whether a runlevel change is currently starting services. Externally
    /// supplied by the shell orchestrator (§3), read-only here.
    pub fn runlevel_starting(&self) -> bool {
        env_flag("RC_RUNLEVEL_STARTING")
    }

    /// Whether a runlevel change is currently stopping services. Externally
    /// supplied by the shell orchestrator (§3), read-only here.
    pub fn runlevel_stopping(&self) -> bool {
        env_flag("RC_RUNLEVEL_STOPPING")
    }

    /// Lists the services installed in runlevel `level`, for computing the
    /// sibling set a `rc_parallel` prefix width is derived from.
    pub fn runlevel_services(&self, level: &str) -> Result<Vec<String>, StateError> {
        let dir = self.paths.root().join("runlevels").join(level);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::Io {
                    service: dir.display().to_string(),
                    source: e,
                });
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::Io {
                service: dir.display().to_string(),
                source: e,
            })?;
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn marker_path(&self, state: State, svc: &str) -> std::path::PathBuf {
        self.paths.state_marker(state, svc)
    }

    fn ensure_dir(&self, dir: &Path, svc: &str) -> Result<(), StateError> {
        fs::create_dir_all(dir).map_err(|e| StateError::Io {
            service: svc.to_string(),
            source: e,
        })
    }

    fn touch_marker(&self, state: State, svc: &str) -> Result<(), StateError> {
        let path = self.marker_path(state, svc);
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent, svc)?;
        }
        self.touch_path(&path, svc)
    }

    fn touch_path(&self, path: &Path, svc: &str) -> Result<(), StateError> {
        match fs::File::create(path) {
            Ok(_) => Ok(()),
            Err(e) => Err(StateError::Io {
                service: svc.to_string(),
                source: e,
            }),
        }
    }

    fn remove_marker(&self, state: State, svc: &str) -> Result<(), StateError> {
        let path = self.marker_path(state, svc);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(service = svc, ?path, error = %e, "failed to remove state marker");
                Err(StateError::Io {
                    service: svc.to_string(),
                    source: e,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mark_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store
            .mark("foo", PrincipalState::Starting, Flags::default())
            .unwrap());
        let state = store.get("foo").unwrap();
        assert_eq!(state.principal, Some(PrincipalState::Starting));
    }

    #[test]
    fn mark_refuses_concurrent_takeover() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store
            .mark("foo", PrincipalState::Starting, Flags::default())
            .unwrap());
        // A second actor trying to claim the same principal marker again
        // (without the first clearing it) is refused.
        let target = store.paths().state_marker(State::Starting, "foo");
        assert!(target.exists());
        let second = fs::File::options().write(true).create_new(true).open(&target);
        assert!(second.is_err());
    }

    #[test]
    fn list_reports_marked_services() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .mark("foo", PrincipalState::Started, Flags::default())
            .unwrap();
        store
            .mark("bar", PrincipalState::Started, Flags::default())
            .unwrap();
        let mut started = store.list(State::Started).unwrap();
        started.sort();
        assert_eq!(started, vec!["bar".to_string(), "foo".to_string()]);
    }

    #[test]
    fn schedule_and_consume() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.schedule("db", "app").unwrap();
        store.schedule("db", "web").unwrap();
        let mut targets = store.scheduled("db").unwrap();
        targets.sort();
        assert_eq!(targets, vec!["app".to_string(), "web".to_string()]);
        // consumed
        assert!(store.scheduled("db").unwrap().is_empty());
    }

    #[test]
    fn force_stopped_clears_coldplugged() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .mark(
                "foo",
                PrincipalState::Started,
                Flags {
                    coldplugged: true,
                    ..Default::default()
                },
            )
            .unwrap();
        store.force_stopped("foo").unwrap();
        let state = store.get("foo").unwrap();
        assert_eq!(state.principal, None);
        assert!(!state.flags.coldplugged);
    }
}

//! Paths, timing, and hook-name constants for the service supervisor.
//!
//! Filesystem layout is bit-exact with OpenRC's `runscript`: everything the
//! core touches under the service-state directory is named here so the rest
//! of the crate never hand-builds a path.

use std::path::PathBuf;
use std::time::Duration;

/// Poll interval used by the Peer Waiter while a peer's exclusive marker
/// still exists.
pub const WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// Default deadline for the Peer Waiter, unless the peer carries the
/// `notimeout` keyword.
pub const WAIT_MAX: Duration = Duration::from_secs(300);

/// Keyword that disables the Peer Waiter's deadline for a given service.
pub const KEYWORD_NOTIMEOUT: &str = "notimeout";

/// Linux coldplug gate marker: if this exists, execution is deferred.
pub const RC_SYSINIT_MARKER: &str = "/dev/.rcsysinit";

/// Directory that coldplug-deferred services are recorded under.
pub const RC_BOOT_DIR: &str = "/dev/.rcboot";

/// Soft-levels that relax the "dependent refused to stop" failure into a
/// best-effort proceed (see invariant I5).
pub const FORCEFUL_SOFTLEVELS: [&str; 3] = ["shutdown", "reboot", "single"];

/// Principal lifecycle state of a service. Exactly one holds at any instant.
///
/// `WasInactive` is not itself a principal value returned by `mark()`, but it
/// is tracked alongside the principal states as a marker file so the
/// Control-Epoch Guard can compare mtimes against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Stopped,
    Starting,
    Started,
    Stopping,
    Inactive,
    WasInactive,
    Failed,
    Coldplugged,
}

impl State {
    /// The transient state markers consulted by the Control-Epoch Guard.
    pub const TRANSIENT: [State; 5] = [
        State::Starting,
        State::Started,
        State::Stopping,
        State::Inactive,
        State::WasInactive,
    ];

    /// Directory name this state is persisted under, `<svcdir>/<name>/<svc>`.
    pub const fn dirname(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Started => "started",
            State::Stopping => "stopping",
            State::Inactive => "inactive",
            State::WasInactive => "wasinactive",
            State::Failed => "failed",
            State::Coldplugged => "coldplugged",
        }
    }
}

/// Orthogonal flags that compose with a principal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub wasinactive: bool,
    pub failed: bool,
    pub coldplugged: bool,
    pub crashed_daemons: bool,
}

/// Filesystem layout rooted at the service-state directory.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// `<svcdir>/<state>/<svc>` presence marker.
    pub fn state_marker(&self, state: State, svc: &str) -> PathBuf {
        self.root.join(state.dirname()).join(svc)
    }

    /// `<svcdir>/exclusive/<svc>` FIFO lock.
    pub fn exclusive(&self, svc: &str) -> PathBuf {
        self.root.join("exclusive").join(svc)
    }

    /// `<svcdir>/exclusive/<svc>.<pid>` ownership probe symlink.
    pub fn probe(&self, svc: &str, pid: u32) -> PathBuf {
        self.root.join("exclusive").join(format!("{svc}.{pid}"))
    }

    /// `<svcdir>/scheduled/<trigger>/<target>` scheduled-start edge.
    pub fn scheduled_edge(&self, trigger: &str, target: &str) -> PathBuf {
        self.root.join("scheduled").join(trigger).join(target)
    }

    /// `<svcdir>/scheduled/<trigger>` directory, listed for `scheduled()`.
    pub fn scheduled_dir(&self, trigger: &str) -> PathBuf {
        self.root.join("scheduled").join(trigger)
    }
}

/// Hook event names dispatched to the (no-op by default) hook host.
pub mod hooks {
    pub const SERVICE_START_IN: &str = "SERVICE_START_IN";
    pub const SERVICE_START_NOW: &str = "SERVICE_START_NOW";
    pub const SERVICE_START_DONE: &str = "SERVICE_START_DONE";
    pub const SERVICE_START_OUT: &str = "SERVICE_START_OUT";
    pub const SERVICE_STOP_IN: &str = "SERVICE_STOP_IN";
    pub const SERVICE_STOP_NOW: &str = "SERVICE_STOP_NOW";
    pub const SERVICE_STOP_DONE: &str = "SERVICE_STOP_DONE";
    pub const SERVICE_STOP_OUT: &str = "SERVICE_STOP_OUT";
}

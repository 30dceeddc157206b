//! Lifecycle Engine (§4.8): implements start/stop/restart/status/zap/
//! describe/condrestart in terms of the State Store, Dependency Oracle,
//! Exclusion & Presence, Control-Epoch Guard, Peer Waiter, and Script
//! Runner. Emits hook events and maintains the scheduled-start deferral
//! queue.

use std::path::PathBuf;
use std::thread;

use tracing::{info, warn};

use crate::constants::{hooks, Flags, Paths};
use crate::control::{self, ControlEpoch};
use crate::deptree::{DepTree, Options, Relation};
use crate::error::{ExecError, RcError};
use crate::exclusive;
use crate::hooks::HookHost;
use crate::state::{PrincipalState, StateStore};

/// Context shared by every action dispatched in one invocation: the service
/// identifier, its script path, the runlevel context, and the collaborators
/// it consults. Threaded explicitly rather than via globals (§9).
pub struct Supervisor<'a> {
    pub svc: String,
    pub svc_path: PathBuf,
    pub svc_dir: PathBuf,
    pub library_fallback: PathBuf,
    pub paths: Paths,
    pub store: StateStore,
    pub tree: Option<DepTree>,
    pub hook_host: &'a dyn HookHost,
    pub pid: u32,
    pub in_background: bool,
    pub in_hotplug: bool,
    pub deps_enabled: bool,
    pub rc_parallel: bool,
    pub rc_depend_strict: bool,
    pub runlevel_starting: bool,
    pub runlevel_stopping: bool,
    pub softlevel: String,
    /// Width to pad this service's name to when prefixing helper output
    /// (`rc_parallel`'s sibling-aligned prefix, §B.2). `None` disables
    /// prefixing entirely.
    pub prefix_width: Option<usize>,
}

impl<'a> Supervisor<'a> {
    fn control(&self) -> ControlEpoch<'_> {
        ControlEpoch::new(&self.paths, &self.svc, self.pid)
    }

    fn dep_options(&self, start: bool) -> Options {
        Options {
            trace: true,
            strict: self.rc_depend_strict,
            start: start && self.runlevel_starting,
            stop: !start && self.runlevel_stopping,
        }
    }

    fn tree_or_empty(&self) -> &DepTree {
        static EMPTY: std::sync::OnceLock<DepTree> = std::sync::OnceLock::new();
        self.tree.as_ref().unwrap_or_else(|| EMPTY.get_or_init(DepTree::default))
    }

    fn helper_path(&self) -> Result<PathBuf, RcError> {
        crate::runner::locate_helper(&self.svc_dir, &self.library_fallback).ok_or_else(|| {
            ExecError::HelperMissing {
                service: self.svc.clone(),
            }
            .into()
        })
    }

    fn run(&self, action: &str, arg2: Option<&str>, with_prefix: bool) -> Result<bool, RcError> {
        let helper = self.helper_path()?;
        let prefix = if with_prefix {
            self.prefix_width.map(|width| format!("{:<width$}| ", self.svc, width = width))
        } else {
            None
        };
        let outcome = crate::runner::exec(&helper, &self.svc_path, action, arg2, prefix.as_deref())
            .map_err(RcError::from)?;
        Ok(outcome.success)
    }

    fn hotplug_background_guard_blocks(&self) -> bool {
        if !(self.in_hotplug || self.in_background) {
            return false;
        }
        let state = self.store.get(&self.svc).ok();
        let ok = matches!(
            state.and_then(|s| s.principal),
            None | Some(PrincipalState::Inactive)
        );
        !ok
    }

    /// Builds a `Supervisor` for a sibling service, assumed to live in the
    /// same service directory (`runscript.c`'s peers are always resolved
    /// relative to the same init.d tree), to recurse into its own
    /// start/stop rather than merely noting that a peer exists.
    fn build_peer_supervisor(&self, peer: &str) -> Supervisor<'a> {
        Supervisor {
            svc: peer.to_string(),
            svc_path: self.svc_dir.join(peer),
            svc_dir: self.svc_dir.clone(),
            library_fallback: self.library_fallback.clone(),
            paths: self.paths.clone(),
            store: self.store.clone(),
            tree: self.tree.clone(),
            hook_host: self.hook_host,
            pid: self.pid,
            in_background: self.in_background,
            in_hotplug: self.in_hotplug,
            deps_enabled: self.deps_enabled,
            rc_parallel: self.rc_parallel,
            rc_depend_strict: self.rc_depend_strict,
            runlevel_starting: self.runlevel_starting,
            runlevel_stopping: self.runlevel_stopping,
            softlevel: self.softlevel.clone(),
            prefix_width: self.prefix_width,
        }
    }

    fn start_peer_best_effort(&self, peer: &str) {
        let mut sup = self.build_peer_supervisor(peer);
        if let Err(e) = sup.start() {
            warn!(service = peer, error = %e, "best-effort peer start failed");
        }
    }

    fn stop_peer_best_effort(&self, peer: &str) {
        let mut sup = self.build_peer_supervisor(peer);
        if let Err(e) = sup.stop() {
            warn!(service = peer, error = %e, "best-effort peer stop failed");
        }
    }

    /// Dispatches a best-effort peer action over `peers`: concurrently on OS
    /// threads when `rc_parallel` is set, one at a time otherwise (§4.8
    /// "parallel iff `rc_parallel`; otherwise wait per-peer").
    fn dispatch_peers(&self, peers: &[String], action: fn(&Self, &str)) {
        if peers.is_empty() {
            return;
        }
        if self.rc_parallel {
            thread::scope(|scope| {
                for peer in peers {
                    scope.spawn(|| action(self, peer));
                }
            });
        } else {
            for peer in peers {
                action(self, peer);
            }
        }
    }

    /// `start(deps)`.
    pub fn start(&mut self) -> Result<(), RcError> {
        if self.hotplug_background_guard_blocks() {
            return Err(RcError::GuardRefusal(format!(
                "'{}' not eligible for hotplug/background start in its current state",
                self.svc
            )));
        }

        let state = self.store.get(&self.svc)?;
        match state.principal {
            Some(PrincipalState::Started) => {
                warn!(service = %self.svc, "already started");
                return Ok(());
            }
            Some(PrincipalState::Starting) | Some(PrincipalState::Stopping) => {
                warn!(service = %self.svc, "already transitioning");
                return Ok(());
            }
            Some(PrincipalState::Inactive) if !self.in_background => {
                warn!(service = %self.svc, "inactive, starting anyway");
            }
            _ => {}
        }

        if !self.store.mark(&self.svc, PrincipalState::Starting, Flags::default())? {
            return Err(RcError::GuardRefusal(format!(
                "'{}' started by something else",
                self.svc
            )));
        }

        exclusive::make_exclusive(&self.paths, &self.svc)?;
        self.control().create_probe().ok();
        self.hook_host.fire(hooks::SERVICE_START_IN, &self.svc);

        // Cleanup invariant (§7): regardless of which branch below returns,
        // a single trailer restores state and removes the probe/exclusive
        // marker exactly once. `cleanup_abort_start` is itself idempotent
        // against a body that already reached a terminal state on its own.
        let result = self.start_body();
        if result.is_err() {
            self.cleanup_abort_start();
        }
        result
    }

    fn start_body(&mut self) -> Result<(), RcError> {
        if self.deps_enabled {
            self.resolve_start_deps()?;
            if let Some(scheduled) = self.defer_for_unmet_hard_deps()? {
                self.revert_to_stopped_for_schedule(&scheduled);
                return Err(RcError::DependencyFailure(format!(
                    "scheduled to start '{}' when {} has started",
                    self.svc,
                    scheduled.join(" or ")
                )));
            }
        }

        self.hook_host.fire(hooks::SERVICE_START_NOW, &self.svc);
        let ran_ok = self.run("start", None, true)?;

        if control::ControlEpoch::new(&self.paths, &self.svc, self.pid).in_control(&self.store) {
            if !ran_ok {
                return Err(RcError::GuardRefusal(format!(
                    "'{}' failed to start",
                    self.svc
                )));
            }
            let now = self.store.get(&self.svc)?;
            if now.principal == Some(PrincipalState::Inactive) {
                warn!(service = %self.svc, "started but inactive");
            }
        } else {
            warn!(service = %self.svc, "not under our control");
        }

        self.store.mark(&self.svc, PrincipalState::Started, Flags::default())?;
        self.control().remove_probe();
        self.hook_host.fire(hooks::SERVICE_START_DONE, &self.svc);
        exclusive::remove_exclusive(&self.paths, &self.svc);

        self.consume_scheduled_starts()?;
        self.hook_host.fire(hooks::SERVICE_START_OUT, &self.svc);
        Ok(())
    }

    fn resolve_start_deps(&self) -> Result<(), RcError> {
        let tree = self.tree_or_empty();
        let roots = vec![self.svc.clone()];

        let broken = tree.depends(&[Relation::Broken], &roots, self.dep_options(true))?;
        if !broken.is_empty() {
            return Err(RcError::DependencyFailure(format!(
                "'{}' has unresolvable dependencies: {}",
                self.svc,
                broken.join(", ")
            )));
        }

        if !self.runlevel_starting {
            let mut to_start = Vec::new();
            for peer in tree.depend(Relation::IUse, &self.svc) {
                let peer_state = self.store.get(&peer)?;
                if peer_state.principal.is_none() {
                    to_start.push(peer);
                }
            }
            self.dispatch_peers(&to_start, Self::start_peer_best_effort);
        }

        let mut wait_for: Vec<String> = tree.depend(Relation::INeed, &self.svc);
        wait_for.extend(tree.depend(Relation::IUse, &self.svc));
        wait_for.extend(tree.depend(Relation::IAfter, &self.svc));

        let ineed: std::collections::HashSet<String> =
            tree.depend(Relation::INeed, &self.svc).into_iter().collect();
        let iuse: std::collections::HashSet<String> =
            tree.depend(Relation::IUse, &self.svc).into_iter().collect();

        for peer in wait_for {
            let peer_state = self.store.get(&peer)?;
            if peer_state.principal == Some(PrincipalState::Started) {
                continue;
            }
            if peer_state.principal == Some(PrincipalState::Starting)
                && peer_state.flags.wasinactive
                && !iuse.contains(&peer)
            {
                continue;
            }

            exclusive::wait_for_peer(&self.paths, tree, &peer);
            let rechecked = self.store.get(&peer)?;

            if rechecked.principal != Some(PrincipalState::Started) && ineed.contains(&peer) {
                if matches!(
                    rechecked.principal,
                    Some(PrincipalState::Inactive)
                ) || rechecked.flags.wasinactive
                {
                    // handled by defer_for_unmet_hard_deps
                    continue;
                }
                return Err(RcError::DependencyFailure(format!(
                    "cannot start '{}' as '{}' would not start",
                    self.svc, peer
                )));
            }
        }

        Ok(())
    }

    fn defer_for_unmet_hard_deps(&self) -> Result<Option<Vec<String>>, RcError> {
        let tree = self.tree_or_empty();
        let mut unmet = Vec::new();
        for peer in tree.depend(Relation::INeed, &self.svc) {
            let state = self.store.get(&peer)?;
            if state.principal != Some(PrincipalState::Started)
                && (state.principal == Some(PrincipalState::Inactive) || state.flags.wasinactive)
            {
                unmet.push(peer);
            }
        }
        Ok(if unmet.is_empty() { None } else { Some(unmet) })
    }

    fn revert_to_stopped_for_schedule(&self, peers: &[String]) {
        let _ = self.store.force_stopped(&self.svc);
        self.control().remove_probe();
        let tree = self.tree_or_empty();
        for peer in peers {
            let _ = self.store.schedule(peer, &self.svc);
            for provided in tree.depend(Relation::IProvide, peer) {
                let _ = self.store.schedule(&provided, &self.svc);
            }
        }
        exclusive::remove_exclusive(&self.paths, &self.svc);
    }

    /// Cleanup trailer for an abandoned `start()`: restores Starting back to
    /// Stopped (a no-op if the body already reached a terminal state itself,
    /// e.g. the scheduled-defer path) and removes the probe/exclusive marker
    /// unconditionally, mirroring the C source's `atexit(cleanup)`.
    fn cleanup_abort_start(&self) {
        control::restore_state(&self.store, &self.svc, Some(PrincipalState::Starting), false, false);
        self.control().remove_probe();
        exclusive::remove_exclusive(&self.paths, &self.svc);
    }

    fn consume_scheduled_starts(&mut self) -> Result<(), RcError> {
        let mut targets = self.store.scheduled(&self.svc)?;
        let tree = self.tree_or_empty();
        for provided in tree.depend(Relation::IProvide, &self.svc) {
            targets.extend(self.store.scheduled(&provided)?);
        }
        for target in targets {
            let state = self.store.get(&target)?;
            if state.principal.is_none() {
                info!(service = %target, trigger = %self.svc, "starting scheduled target");
                self.start_peer_best_effort(&target);
            }
        }
        Ok(())
    }

    /// `stop(deps)`.
    pub fn stop(&mut self) -> Result<(), RcError> {
        let state = self.store.get(&self.svc)?;

        if self.runlevel_stopping && state.flags.failed {
            return Err(RcError::GuardRefusal(format!("'{}' is FAILED", self.svc)));
        }

        if self.hotplug_background_guard_blocks() {
            return Err(RcError::GuardRefusal(format!(
                "'{}' not eligible for hotplug/background stop in its current state",
                self.svc
            )));
        }

        match state.principal {
            None => {
                warn!(service = %self.svc, "already stopped");
                return Ok(());
            }
            Some(PrincipalState::Stopping) => {
                warn!(service = %self.svc, "already stopping");
                return Ok(());
            }
            _ => {}
        }

        let wasinactive = state.principal == Some(PrincipalState::Inactive);
        if !self.store.mark(
            &self.svc,
            PrincipalState::Stopping,
            Flags {
                wasinactive,
                ..Default::default()
            },
        )? {
            return Err(RcError::GuardRefusal(format!(
                "'{}' stopped by something else",
                self.svc
            )));
        }

        exclusive::make_exclusive(&self.paths, &self.svc)?;
        self.control().create_probe().ok();
        self.hook_host.fire(hooks::SERVICE_STOP_IN, &self.svc);

        let result = self.stop_body(wasinactive);

        // Cleanup trailer (§7): runs on every exit path, success or failure.
        // On failure, state is restored to what it was before the attempt
        // (plus FAILED if a runlevel is transitioning) before the probe and
        // exclusive marker are dropped and STOP_DONE/STOP_OUT fire.
        if result.is_err() {
            control::restore_state(
                &self.store,
                &self.svc,
                Some(PrincipalState::Stopping),
                wasinactive,
                self.runlevel_stopping,
            );
        }
        self.control().remove_probe();
        self.hook_host.fire(hooks::SERVICE_STOP_DONE, &self.svc);
        exclusive::remove_exclusive(&self.paths, &self.svc);
        self.hook_host.fire(hooks::SERVICE_STOP_OUT, &self.svc);

        result
    }

    fn stop_body(&mut self, wasinactive: bool) -> Result<(), RcError> {
        if self.deps_enabled && !wasinactive {
            self.stop_dependents()?;
        }

        let tree = self.tree_or_empty();
        let mut peers = tree.depend(Relation::NeedsMe, &self.svc);
        peers.extend(tree.depend(Relation::UsesMe, &self.svc));
        peers.extend(tree.depend(Relation::BeforeMe, &self.svc));
        for peer in peers {
            let peer_state = self.store.get(&peer)?;
            if peer_state.principal.is_some() {
                exclusive::wait_for_peer(&self.paths, tree, &peer);
            }
        }

        self.hook_host.fire(hooks::SERVICE_STOP_NOW, &self.svc);
        let ran_ok = self.run("stop", None, true)?;

        if !control::ControlEpoch::new(&self.paths, &self.svc, self.pid).in_control(&self.store) {
            warn!(service = %self.svc, "not under our control, aborting stop");
            return Ok(());
        }
        if !ran_ok {
            return Err(RcError::GuardRefusal(format!(
                "'{}' failed to stop",
                self.svc
            )));
        }

        let target = if self.in_background {
            Some(PrincipalState::Inactive)
        } else {
            None
        };
        self.apply_stop_result(target)?;
        Ok(())
    }

    fn apply_stop_result(&self, target: Option<PrincipalState>) -> Result<(), RcError> {
        match target {
            Some(p) => {
                self.store.mark(&self.svc, p, Flags::default())?;
            }
            None => {
                self.store.force_stopped(&self.svc)?;
            }
        }
        Ok(())
    }

    fn stop_dependents(&mut self) -> Result<(), RcError> {
        let tree = self.tree_or_empty();
        let dependents = tree.depend(Relation::NeedsMe, &self.svc);

        let mut to_stop = Vec::new();
        for dependent in dependents.iter().rev() {
            let state = self.store.get(dependent)?;
            if matches!(
                state.principal,
                Some(PrincipalState::Started) | Some(PrincipalState::Inactive)
            ) {
                to_stop.push(dependent.clone());
            }
        }
        self.dispatch_peers(&to_stop, Self::stop_peer_best_effort);

        let mut still_up = Vec::new();
        for dependent in &dependents {
            exclusive::wait_for_peer(&self.paths, tree, dependent);
            let state = self.store.get(dependent)?;
            if state.principal.is_some() {
                still_up.push(dependent.clone());
            }
        }

        if let Some(dependent) = still_up.first() {
            if control::is_forceful_softlevel(&self.softlevel) {
                info!(service = %self.svc, dependent, "proceeding with stop despite dependent still up (forceful softlevel)");
                return Ok(());
            }
            return Err(RcError::DependencyFailure(format!(
                "cannot stop '{}' as '{}' is still up",
                self.svc, dependent
            )));
        }

        Ok(())
    }

    /// `restart(deps)`.
    pub fn restart(&mut self) -> Result<(), RcError> {
        if !self.deps_enabled {
            let state = self.store.get(&self.svc)?;
            if matches!(
                state.principal,
                Some(PrincipalState::Started) | Some(PrincipalState::Inactive)
            ) {
                self.run("stop", Some("start"), true)?;
            } else {
                self.run("start", None, true)?;
            }
            return Ok(());
        }

        let mut cohort = self.store.list(crate::constants::State::Started)?;
        cohort.extend(self.store.list(crate::constants::State::Inactive)?);

        let state = self.store.get(&self.svc)?;
        if state.principal.is_some() {
            self.stop()?;
        }
        self.start()?;

        for svc in cohort {
            if svc == self.svc {
                continue;
            }
            let state = self.store.get(&svc)?;
            if state.principal.is_none() {
                self.start_peer_best_effort(&svc);
            }
        }

        Ok(())
    }

    /// `condrestart`: restart only if currently STARTED.
    pub fn condrestart(&mut self) -> Result<(), RcError> {
        let state = self.store.get(&self.svc)?;
        if state.principal == Some(PrincipalState::Started) {
            self.restart()
        } else {
            Ok(())
        }
    }

    /// `zap`: unconditional forced stop, clearing COLDPLUGGED.
    pub fn zap(&self) -> Result<(), RcError> {
        self.store.force_stopped(&self.svc)?;
        Ok(())
    }

    /// `status`: returns the bitset cast to the exit-code integer, 0 iff
    /// STARTED (regardless of flags).
    pub fn status(&self) -> Result<u8, RcError> {
        let state = self.store.get(&self.svc)?;
        if state.principal == Some(PrincipalState::Started) {
            if state.flags.crashed_daemons {
                tracing::error!(service = %self.svc, "status: crashed");
            } else {
                info!(service = %self.svc, "status: started");
            }
        } else {
            warn!(service = %self.svc, ?state.principal, "status: not started");
        }
        Ok(encode_status(&state))
    }

    /// `describe`: runs the helper's `describe` action unprefixed.
    pub fn describe(&self) -> Result<(), RcError> {
        self.run("describe", None, false)?;
        Ok(())
    }

    /// `ineed`/`iuse`/`needsme`/`usesme`/`iafter`/`ibefore`/`iprovide`:
    /// prints the one-hop relation as a space-joined list.
    pub fn introspect(&self, relation: Relation) -> Result<String, RcError> {
        Ok(self.tree_or_empty().depend(relation, &self.svc).join(" "))
    }

    /// Runs an arbitrary unrecognised action, passed through verbatim.
    pub fn passthrough(&self, action: &str) -> Result<(), RcError> {
        self.run(action, None, true)?;
        Ok(())
    }
}

fn encode_status(state: &crate::state::ServiceState) -> u8 {
    let mut bits: u8 = match state.principal {
        None => 0b0000_0001,
        Some(PrincipalState::Starting) => 0b0000_0010,
        Some(PrincipalState::Started) => 0,
        Some(PrincipalState::Stopping) => 0b0000_1000,
        Some(PrincipalState::Inactive) => 0b0001_0000,
    };
    if state.flags.failed {
        bits |= 0b0010_0000;
    }
    if state.flags.coldplugged {
        bits |= 0b0100_0000;
    }
    bits
}

//! Supervisor Shell entry adapter: argument parsing, environment hygiene,
//! signal handler installation, and sequential dispatch of actions (§6).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

use rc_runner::cli::{parse_args, KnownAction};
use rc_runner::config::Config;
use rc_runner::constants::Paths;
use rc_runner::control;
use rc_runner::deptree::{DepTree, Relation};
use rc_runner::error::RcError;
use rc_runner::hooks::NoopHookHost;
use rc_runner::lifecycle::Supervisor;
use rc_runner::runner;
use rc_runner::state::StateStore;

const DEFAULT_SVCDIR: &str = "/var/lib/rc";
const DEFAULT_LIBRARY_FALLBACK: &str = "/lib/rc/sh/runscript.sh";

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn require_root(action: &str) -> Result<(), RcError> {
    let exempt = matches!(
        action,
        "status" | "help" | "ineed" | "iuse" | "needsme" | "usesme" | "iafter" | "ibefore" | "iprovide"
    );
    if exempt || nix::unistd::Uid::effective().is_root() {
        Ok(())
    } else {
        Err(RcError::RootRequired)
    }
}

fn coldplug_gate(svc: &str) -> bool {
    if !Path::new(rc_runner::constants::RC_SYSINIT_MARKER).exists() {
        return false;
    }
    let boot_dir = Path::new(rc_runner::constants::RC_BOOT_DIR);
    let _ = std::fs::create_dir_all(boot_dir);
    let link = boot_dir.join(svc);
    let _ = std::os::unix::fs::symlink(svc, &link);
    true
}

fn main() -> ExitCode {
    let cli = parse_args();
    init_logging(cli.debug);

    if cli.debug {
        // SAFETY: single-threaded at this point in startup.
        unsafe {
            std::env::set_var("RC_DEBUG", "yes");
        }
    }

    let svc_path = PathBuf::from(&cli.script_path);
    let svc = svc_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| cli.script_path.clone());
    let svc_dir = svc_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    if coldplug_gate(&svc) {
        error!(service = %svc, "coldplug deferred: /dev/.rcsysinit present");
        return ExitCode::from(1);
    }

    if let Err(e) = runner::install_signal_handlers() {
        error!(error = %e, "failed to install signal handlers");
        return ExitCode::from(1);
    }

    let config = Config::load(cli.config.as_deref().map(Path::new));
    let svcdir_root = cli.svcdir.clone().unwrap_or_else(|| DEFAULT_SVCDIR.to_string());
    let paths = Paths::new(&svcdir_root);
    let store = StateStore::new(&svcdir_root);

    let tree_path = Path::new(&svcdir_root).join("deptree.json");
    let tree = DepTree::load(&tree_path).ok();

    let softlevel = std::env::var("RC_SOFTLEVEL").unwrap_or_default();
    let in_background = std::env::var("IN_BACKGROUND").map(|v| v == "yes").unwrap_or(false);
    let in_hotplug = std::env::var("IN_HOTPLUG").map(|v| v == "yes").unwrap_or(false);

    // §B.2: rc_parallel output is prefixed with the service name padded to
    // the longest sibling name in the same runlevel.
    let prefix_width = if config.rc_parallel {
        store
            .runlevel_services(&softlevel)
            .ok()
            .and_then(|siblings| siblings.iter().map(|s| s.len()).max())
            .map(|max| max.max(svc.len()))
    } else {
        None
    };

    if cli.ifstarted {
        let state = match store.get(&svc) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to read state");
                return ExitCode::from(1);
            }
        };
        if state.principal != Some(rc_runner::state::PrincipalState::Started) {
            return ExitCode::from(1);
        }
    }

    let host = NoopHookHost;
    let pid = std::process::id();
    let mut exit_code: u8 = 0;

    for action in &cli.actions {
        control::reset_sighup();

        // SAFETY: single-threaded; RC_CMD is unset then re-set per §B.5.
        unsafe {
            std::env::remove_var("RC_CMD");
            std::env::set_var("RC_CMD", action);
        }

        if let Err(e) = require_root(action) {
            error!(error = %e, action, "permission check failed");
            exit_code = 1;
            break;
        }

        let mut sup = Supervisor {
            svc: svc.clone(),
            svc_path: svc_path.clone(),
            svc_dir: svc_dir.clone(),
            library_fallback: PathBuf::from(DEFAULT_LIBRARY_FALLBACK),
            paths: paths.clone(),
            store: store.clone(),
            tree: tree.clone(),
            hook_host: &host,
            pid,
            in_background,
            in_hotplug,
            deps_enabled: !cli.nodeps,
            rc_parallel: config.rc_parallel,
            rc_depend_strict: config.rc_depend_strict,
            runlevel_starting: store.runlevel_starting(),
            runlevel_stopping: store.runlevel_stopping(),
            softlevel: softlevel.clone(),
            prefix_width,
        };

        let result = dispatch(&mut sup, action);
        if let Err(e) = result {
            error!(error = %e, action, service = %svc, "action failed");
            exit_code = 1;
            break;
        }

        if let Some(signal) = runner::take_abort_signal() {
            error!(error = %RcError::SignalAbort { signal }, action, service = %svc, "aborting");
            exit_code = 1;
            break;
        }
    }

    ExitCode::from(exit_code)
}

fn dispatch(sup: &mut Supervisor<'_>, action: &str) -> Result<(), RcError> {
    match KnownAction::parse(action) {
        Some(KnownAction::Start) => sup.start(),
        Some(KnownAction::Stop) => sup.stop(),
        Some(KnownAction::Restart) => sup.restart(),
        Some(KnownAction::Condrestart) | Some(KnownAction::Conditionalrestart) => sup.condrestart(),
        Some(KnownAction::Zap) => sup.zap(),
        Some(KnownAction::Describe) | Some(KnownAction::Help) => sup.describe(),
        Some(KnownAction::Status) => {
            let code = sup.status()?;
            if code != 0 {
                return Err(RcError::GuardRefusal(format!("status exit code {code}")));
            }
            Ok(())
        }
        Some(KnownAction::Ineed) => print_relation(sup, Relation::INeed),
        Some(KnownAction::Iuse) => print_relation(sup, Relation::IUse),
        Some(KnownAction::Needsme) => print_relation(sup, Relation::NeedsMe),
        Some(KnownAction::Usesme) => print_relation(sup, Relation::UsesMe),
        Some(KnownAction::Iafter) => print_relation(sup, Relation::IAfter),
        Some(KnownAction::Ibefore) => print_relation(sup, Relation::IBefore),
        Some(KnownAction::Iprovide) => print_relation(sup, Relation::IProvide),
        None => sup.passthrough(action),
    }
}

fn print_relation(sup: &Supervisor<'_>, relation: Relation) -> Result<(), RcError> {
    println!("{}", sup.introspect(relation)?);
    Ok(())
}

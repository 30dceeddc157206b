//! Supervisor Shell command-line surface (§6).
//!
//! Expressed with `clap` derive rather than the distilled spec's hand-rolled
//! getopt parser — an idiomatic substitution that preserves the same
//! short/long flags and positional action list.

use clap::{Parser, ValueEnum};

/// One supervisor invocation may run several actions in sequence on the
/// same service.
#[derive(Parser, Debug)]
#[command(name = "rc-runner", version, author)]
#[command(about = "Per-service init-script supervisor", long_about = None)]
pub struct Cli {
    /// Path to the service script.
    pub script_path: String,

    /// Actions to run in sequence. Unknown actions are passed verbatim to
    /// the shell helper.
    #[arg(required = true)]
    pub actions: Vec<String>,

    /// Sets RC_DEBUG=yes for the shell helper and raises local log verbosity.
    #[arg(short, long)]
    pub debug: bool,

    /// Short-circuit to a nonzero exit unless the service is STARTED.
    #[arg(short = 's', long = "ifstarted")]
    pub ifstarted: bool,

    /// Switch subsequent restart actions to the deps=false variant and skip
    /// dependency resolution in start/stop.
    #[arg(short = 'D', long = "nodeps")]
    pub nodeps: bool,

    /// Override the service-state directory root (defaults to /var/lib/rc).
    #[arg(long, value_name = "DIR")]
    pub svcdir: Option<String>,

    /// Path to the rc.conf-style configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<String>,
}

/// Well-known actions with core-level semantics; anything else is a
/// passthrough action for the shell helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KnownAction {
    Start,
    Stop,
    Restart,
    Condrestart,
    Conditionalrestart,
    Status,
    Zap,
    Describe,
    Help,
    Ineed,
    Iuse,
    Needsme,
    Usesme,
    Iafter,
    Ibefore,
    Iprovide,
}

impl KnownAction {
    pub fn parse(action: &str) -> Option<Self> {
        <KnownAction as ValueEnum>::from_str(action, true).ok()
    }
}

/// Parses command-line arguments into a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

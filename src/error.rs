//! Error handling for the service supervisor.
use thiserror::Error;

/// Errors raised by the State Store (`state.rs`).
#[derive(Debug, Error)]
pub enum StateError {
    /// Failed to read or write a marker file.
    #[error("state marker I/O error for '{service}': {source}")]
    Io {
        /// Service the marker belongs to.
        service: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the Dependency Oracle (`deptree.rs`).
#[derive(Debug, Error)]
pub enum DepTreeError {
    /// Failed to read the serialized dependency tree from disk.
    #[error("failed to read dependency tree: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse the dependency tree's JSON contents.
    #[error("failed to parse dependency tree: {0}")]
    ParseError(#[from] serde_json::Error),

    /// `STRICT` option requested and a referenced node is absent.
    #[error("unknown service '{0}' referenced in dependency tree")]
    UnknownService(String),
}

/// Errors raised by the Script Runner (`runner.rs`) and Exclusion/Presence
/// (`exclusive.rs`).
#[derive(Debug, Error)]
pub enum ExecError {
    /// A filesystem or process primitive failed in a way the core treats as
    /// fatal (pipe/fcntl failure, fork failure, etc).
    #[error("{context}: {source}")]
    Resource {
        /// Human-readable description of what was attempted.
        context: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// No shell helper could be located (neither service-local nor library
    /// fallback path exists).
    #[error("no shell helper found for '{service}'")]
    HelperMissing {
        /// Service the helper was invoked for.
        service: String,
    },
}

/// Top-level error type threaded through the Lifecycle Engine and the
/// Supervisor Shell.
#[derive(Debug, Error)]
pub enum RcError {
    /// State Store failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// Dependency Oracle failure.
    #[error(transparent)]
    DepTree(#[from] DepTreeError),

    /// Script Runner / Exclusion failure.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A transition was refused by a guard (hot-plug gate, `-s`, takeover).
    #[error("{0}")]
    GuardRefusal(String),

    /// A hard dependency could not be satisfied.
    #[error("{0}")]
    DependencyFailure(String),

    /// The process received SIGINT/SIGTERM/SIGQUIT and aborted.
    #[error("caught {signal}, aborting")]
    SignalAbort {
        /// Name of the signal that triggered the abort.
        signal: &'static str,
    },

    /// A mutating action was attempted by a non-root caller.
    #[error("root access required")]
    RootRequired,

    /// Plain I/O error not otherwise classified.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

use crate::config::ConfigError;
use crate::diagnostics::DiagnosticsError;
use crate::runner::RunnerError;
use crate::state::StateError;
use thiserror::Error;

/// Every way a bisection run can stop early. All of them are fatal: a run that
/// cannot trust its oracle or its environment does not retry.
#[derive(Error, Debug)]
pub enum BisectError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),

    #[error("Failed to write temporary item list: {0}")]
    TempFile(#[from] std::io::Error),

    #[error("Item enumerator '{script}' failed: {status}")]
    EnumerationFailed { script: String, status: String },

    #[error("Switch script '{script}' failed: {status}")]
    SwitchFailed { script: String, status: String },

    #[error(
        "Too many arguments for switch script '{script}' ({count} items). Re-run with file-args enabled (--file-args)"
    )]
    TooManyArguments { script: String, count: usize },

    #[error("Test setup script '{script}' failed: {status}")]
    SetupFailed { script: String, status: String },

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Pass level bisection needs exactly one bad item, found {0}")]
    FoundItemCount(usize),

    #[error("Build script generator '{script}' failed: {status}")]
    GeneratorFailed { script: String, status: String },

    #[error("Bisecting {0} cannot reproduce good result; the bad item is not isolated by this mechanism")]
    NotReproducible(String),

    #[error(
        "No debug counter output for pass '{0}'. This pass does not support transformation level bisection"
    )]
    NoDebugCounter(String),
}

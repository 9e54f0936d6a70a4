pub mod bisector;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod pass;
pub mod probe;
pub mod report;
pub mod runner;
pub mod search;
pub mod set_file;
pub mod state;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use bisector::{Bisector, ItemBisector, LimitBisector, ProbeStatus};
pub use config::{BisectConfig, ConfigError, PassBisectSettings};
pub use diagnostics::{DiagnosticsError, PassTrace};
pub use engine::{Bisection, Runtime};
pub use error::BisectError;
pub use probe::Prober;
pub use report::{BisectReport, PassReport};
pub use runner::{CommandOutput, CommandRunner, Invocation, RunnerError, ShellRunner};
pub use search::RoundOutcome;
pub use set_file::{BAD_SET_VAR, GOOD_SET_VAR, ScopedSetFile};
pub use state::{SearchPhase, SearchState, StateError, StateStore};

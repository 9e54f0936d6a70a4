use crate::config::BisectConfig;
use crate::error::BisectError;
use crate::pass::search_bad_pass;
use crate::probe::Prober;
use crate::report::BisectReport;
use crate::runner::{CommandRunner, ShellRunner};
use crate::search::{apply_final_partition, search_bad_items};
use crate::state::{SearchPhase, SearchState, StateError, StateStore};
use crate::verify::verify;
use tracing::{debug, info, warn};

/// Process-local handles. Built fresh on every start and resume, never persisted.
pub struct Runtime {
    pub runner: Box<dyn CommandRunner>,
}

impl Runtime {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn shell() -> Self {
        Self::new(Box::new(ShellRunner::new()))
    }
}

/// One bisection from first probe (or last checkpoint) to report.
pub struct Bisection<'rt> {
    config: BisectConfig,
    state: SearchState,
    store: StateStore,
    runtime: &'rt mut Runtime,
    fresh: bool,
}

impl<'rt> Bisection<'rt> {
    /// Enumerates the items and builds a fresh search state.
    pub fn start(config: BisectConfig, runtime: &'rt mut Runtime) -> Result<Self, BisectError> {
        config.validate()?;
        let items = Prober::new(&config, runtime.runner.as_mut())?.enumerate_items()?;
        info!("Found {} item(s) to bisect", items.len());

        let embedded = config
            .to_toml_string()
            .map_err(|e| StateError::Serialization(format!("TOML encoding error: {}", e)))?;
        let state = SearchState::new(items, embedded)?;

        let store = StateStore::new(config.state.path.clone());
        if store.exists() {
            warn!(
                "Overwriting existing checkpoint at {:?}; pass --resume to continue it instead",
                store.path()
            );
        }
        Ok(Self {
            config,
            state,
            store,
            runtime,
            fresh: true,
        })
    }

    /// Continues from the checkpoint in `store`, with the configuration it was started with.
    pub fn resume(store: StateStore, runtime: &'rt mut Runtime) -> Result<Self, BisectError> {
        let state = store.load()?;
        let config = BisectConfig::from_toml_str(&state.config).map_err(|e| {
            StateError::Corrupt(format!("embedded configuration is unreadable: {}", e))
        })?;
        config.validate()?;
        info!("Resuming from {:?}", store.path());
        debug!("Resumed state:\n{}", state.describe());
        Ok(Self {
            config,
            state,
            store,
            runtime,
            fresh: false,
        })
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn config(&self) -> &BisectConfig {
        &self.config
    }

    /// Verification, item search, optional pass search, then the report. The
    /// checkpoint is removed once the run completes; any error leaves it in place.
    pub fn run(mut self) -> Result<BisectReport, BisectError> {
        let mut prober = Prober::new(&self.config, self.runtime.runner.as_mut())?;

        if self.fresh && self.config.search.verify {
            verify(&mut prober, &mut self.state)?;
        }

        if self.state.phase == SearchPhase::Items {
            search_bad_items(&mut prober, &self.store, &mut self.state)?;
            if !self.state.inconclusive && !self.state.found_items.is_empty() {
                apply_final_partition(&mut prober, &mut self.state)?;
            }
        }

        let pass = match &self.config.pass_bisect {
            Some(settings) if !self.state.inconclusive => {
                search_bad_pass(&mut prober, &self.store, &mut self.state, settings)?
            }
            _ => None,
        };

        self.store.remove()?;
        info!("{}", self.state.elapsed_string());
        Ok(BisectReport::from_state(&self.state, pass))
    }
}

/// Starts a new bisection, or resumes the checkpoint at `config.state.path`.
pub fn run(
    config: BisectConfig,
    runtime: &mut Runtime,
    resume: bool,
) -> Result<BisectReport, BisectError> {
    let bisection = if resume {
        Bisection::resume(StateStore::new(config.state.path.clone()), runtime)?
    } else {
        Bisection::start(config, runtime)?
    };
    bisection.run()
}

use crate::bisector::ProbeStatus;
use crate::config::{BisectConfig, Scripts};
use crate::error::BisectError;
use crate::runner::{CommandOutput, CommandRunner, Invocation, RunnerError};
use crate::set_file::{BAD_SET_VAR, GOOD_SET_VAR, ScopedSetFile, write_item_list};
use crate::state::SearchState;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Good,
    Bad,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Good => write!(f, "good"),
            Side::Bad => write!(f, "bad"),
        }
    }
}

/// Applies partitions to the system under test and asks the oracle about them.
pub struct Prober<'a> {
    config: &'a BisectConfig,
    scripts: Scripts<'a>,
    runner: &'a mut dyn CommandRunner,
}

impl<'a> Prober<'a> {
    pub fn new(
        config: &'a BisectConfig,
        runner: &'a mut dyn CommandRunner,
    ) -> Result<Self, BisectError> {
        let scripts = config.scripts()?;
        Ok(Self {
            config,
            scripts,
            runner,
        })
    }

    pub fn config(&self) -> &BisectConfig {
        self.config
    }

    pub fn runner(&mut self) -> &mut dyn CommandRunner {
        &mut *self.runner
    }

    /// Switches `items` to good. In incremental mode only items not already good are
    /// sent. Returns what was actually sent.
    pub fn switch_to_good(
        &mut self,
        state: &mut SearchState,
        items: &[String],
        env: &[(String, String)],
    ) -> Result<Vec<String>, BisectError> {
        self.switch(state, Side::Good, items, env)
    }

    pub fn switch_to_bad(
        &mut self,
        state: &mut SearchState,
        items: &[String],
        env: &[(String, String)],
    ) -> Result<Vec<String>, BisectError> {
        self.switch(state, Side::Bad, items, env)
    }

    fn switch(
        &mut self,
        state: &mut SearchState,
        side: Side,
        items: &[String],
        env: &[(String, String)],
    ) -> Result<Vec<String>, BisectError> {
        let (script, already) = match side {
            Side::Good => (self.scripts.switch_to_good, &state.currently_good_items),
            Side::Bad => (self.scripts.switch_to_bad, &state.currently_bad_items),
        };

        let to_send: Vec<String> = if self.config.search.incremental {
            let delta: Vec<String> = items
                .iter()
                .filter(|item| !already.contains(*item))
                .cloned()
                .collect();
            debug!(
                "Incremental set. Wanted to switch {} item(s) to {side}, actually switching {}",
                items.len(),
                delta.len()
            );
            delta
        } else {
            items.to_vec()
        };

        if to_send.is_empty() {
            return Ok(to_send);
        }
        debug!("Switching {:?} to {side}", to_send);
        self.run_switch_script(script, &to_send, env)?;

        let (gained, lost) = match side {
            Side::Good => (
                &mut state.currently_good_items,
                &mut state.currently_bad_items,
            ),
            Side::Bad => (
                &mut state.currently_bad_items,
                &mut state.currently_good_items,
            ),
        };
        for item in &to_send {
            lost.remove(item);
            gained.insert(item.clone());
        }
        Ok(to_send)
    }

    fn run_switch_script(
        &mut self,
        script: &str,
        items: &[String],
        env: &[(String, String)],
    ) -> Result<(), BisectError> {
        // Held until the script has exited.
        let mut list_file = None;
        let invocation = if self.config.search.file_args {
            let file = write_item_list(items)?;
            let invocation = Invocation::new(script).arg(file.path().to_string_lossy());
            list_file = Some(file);
            invocation
        } else {
            Invocation::new(script).args(items.iter().cloned())
        }
        .envs(env)
        .timeout(self.config.search.switch_timeout());

        let output = match self.runner.run(&invocation) {
            Err(RunnerError::ArgumentListTooLong { program, count }) => {
                return Err(BisectError::TooManyArguments {
                    script: program,
                    count,
                });
            }
            other => other?,
        };
        drop(list_file);

        if !output.success() {
            return Err(BisectError::SwitchFailed {
                script: script.to_string(),
                status: output.describe(),
            });
        }
        Ok(())
    }

    fn oracle_status(&self, script: &str, output: &CommandOutput) -> ProbeStatus {
        if output.timed_out {
            warn!("'{script}' timed out, counting the probe as skipped");
            return ProbeStatus::Skip;
        }
        let status = ProbeStatus::from_exit(output.exit_code, self.config.search.skip_exit_code);
        debug!("'{script}' {} => {:?}", output.describe(), status);
        status
    }

    /// A missing setup script always succeeds.
    pub fn run_setup(&mut self, env: &[(String, String)]) -> Result<ProbeStatus, BisectError> {
        let Some(script) = self.scripts.test_setup_script else {
            return Ok(ProbeStatus::Good);
        };
        let invocation = Invocation::new(script)
            .envs(env)
            .timeout(self.config.search.test_timeout());
        let output = self.runner.run(&invocation)?;
        Ok(self.oracle_status(script, &output))
    }

    pub fn run_test(&mut self, env: &[(String, String)]) -> Result<ProbeStatus, BisectError> {
        let script = self.scripts.test_script;
        let invocation = Invocation::new(script)
            .envs(env)
            .timeout(self.config.search.test_timeout());
        let output = self.runner.run(&invocation)?;
        Ok(self.oracle_status(script, &output))
    }

    /// Applies the partition and runs setup and test. A setup that does not succeed
    /// decides the probe on its own.
    pub fn probe_items(
        &mut self,
        state: &mut SearchState,
        bad: &[String],
        good: &[String],
    ) -> Result<ProbeStatus, BisectError> {
        let good_set = ScopedSetFile::new(GOOD_SET_VAR, good)?;
        let bad_set = ScopedSetFile::new(BAD_SET_VAR, bad)?;
        let env = [good_set.env_pair(), bad_set.env_pair()];

        self.switch_to_good(state, good, &env)?;
        self.switch_to_bad(state, bad, &env)?;

        let setup = self.run_setup(&env)?;
        if setup != ProbeStatus::Good {
            debug!("Test setup returned {:?}, skipping test script", setup);
            return Ok(setup);
        }
        self.run_test(&env)
    }

    /// Runs the item enumerator; its whitespace-separated stdout is the item list.
    pub fn enumerate_items(&mut self) -> Result<Vec<String>, BisectError> {
        let script = self.scripts.get_initial_items;
        let output = self.runner.run(&Invocation::new(script))?;
        if !output.success() {
            return Err(BisectError::EnumerationFailed {
                script: script.to_string(),
                status: output.describe(),
            });
        }
        Ok(output
            .stdout
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

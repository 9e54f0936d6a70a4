//! An in-memory system under test for exercising the engine without real scripts.

use crate::diagnostics::LIMIT_FLAGS_VAR;
use crate::probe::Side;
use crate::runner::{CommandOutput, CommandRunner, Invocation, RunnerError};
use crate::set_file::BAD_SET_VAR;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

/// A compiler that bisects: pass `bad_pass` (1-based) miscompiles once its
/// `bad_transform`-th transformation runs.
#[derive(Debug, Clone)]
pub struct FakeCompiler {
    pub passes: Vec<String>,
    pub bad_pass: u32,
    pub transforms: u32,
    pub bad_transform: u32,
    pub prints_counters: bool,
}

impl FakeCompiler {
    pub fn new(passes: &[&str], bad_pass: u32, transforms: u32, bad_transform: u32) -> Self {
        Self {
            passes: passes.iter().map(|p| p.to_string()).collect(),
            bad_pass,
            transforms,
            bad_transform,
            prints_counters: true,
        }
    }

    fn build(&self, flags: &str) -> (String, BuildLimits) {
        let limits = BuildLimits::parse(flags);
        let mut trace = String::new();
        for (index, description) in self.passes.iter().enumerate() {
            let number = index as i64 + 1;
            let ran = limits.passes < 0 || number <= limits.passes;
            let prefix = if ran { "running" } else { "NOT running" };
            trace.push_str(&format!(
                "BISECT: {prefix} pass ({number}) {description} on function (main)\n"
            ));
        }
        if let Some(counter) = &limits.counter {
            if self.prints_counters {
                trace.push_str(&format!(
                    "Counters and values:\n{counter} : {{{}, 0, {}}}\n",
                    self.transforms, limits.count
                ));
            }
        }
        (trace, limits)
    }

    fn miscompiles(&self, limits: &BuildLimits) -> bool {
        let bad_pass = i64::from(self.bad_pass);
        if limits.passes < 0 || limits.passes > bad_pass {
            return true;
        }
        limits.passes == bad_pass
            && (limits.count < 0 || limits.count >= i64::from(self.bad_transform))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BuildLimits {
    passes: i64,
    counter: Option<String>,
    count: i64,
}

impl BuildLimits {
    fn parse(flags: &str) -> Self {
        let mut limits = BuildLimits {
            passes: -1,
            counter: None,
            count: -1,
        };
        for flag in flags.split_whitespace() {
            if let Some(value) = flag.strip_prefix("-opt-bisect-limit=") {
                limits.passes = value.parse().unwrap_or(-1);
            } else if let Some(value) = flag.strip_prefix("-debug-counter=") {
                if let Some((name, count)) = value.rsplit_once("-count=") {
                    limits.counter = Some(name.to_string());
                    limits.count = count.parse().unwrap_or(-1);
                }
            }
        }
        limits
    }
}

type Oracle = Box<dyn FnMut(&BTreeSet<String>) -> i32>;

/// Remembers which items are currently switched to bad and answers the test script
/// with `oracle(bad_items)`. Program names follow `scripted_config`, plus `setup`,
/// `gen`, `build` and `diff`.
pub struct FakeSystem {
    items: Vec<String>,
    bad: BTreeSet<String>,
    oracle: Oracle,
    calls: Vec<Invocation>,
    exit_overrides: HashMap<String, i32>,
    timeouts: BTreeSet<String>,
    max_arguments: Option<usize>,
    tests_before_crash: Option<u32>,
    tests_run: u32,
    seen_bad_sets: Vec<Vec<String>>,
    compiler: Option<FakeCompiler>,
    last_build: Option<BuildLimits>,
}

impl FakeSystem {
    pub fn new<F>(items: &[&str], oracle: F) -> Self
    where
        F: FnMut(&BTreeSet<String>) -> i32 + 'static,
    {
        Self {
            items: items.iter().map(|s| s.to_string()).collect(),
            bad: BTreeSet::new(),
            oracle: Box::new(oracle),
            calls: Vec::new(),
            exit_overrides: HashMap::new(),
            timeouts: BTreeSet::new(),
            max_arguments: None,
            tests_before_crash: None,
            tests_run: 0,
            seen_bad_sets: Vec::new(),
            compiler: None,
            last_build: None,
        }
    }

    /// Fails whenever any of `culprits` is switched to bad.
    pub fn with_culprits(items: &[&str], culprits: &[&str]) -> Self {
        let culprits: BTreeSet<String> = culprits.iter().map(|s| s.to_string()).collect();
        Self::new(items, move |bad| {
            if bad.is_disjoint(&culprits) { 0 } else { 1 }
        })
    }

    pub fn with_compiler(mut self, compiler: FakeCompiler) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn fail_program(&mut self, program: &str, code: i32) {
        self.exit_overrides.insert(program.to_string(), code);
    }

    pub fn time_out_program(&mut self, program: &str) {
        self.timeouts.insert(program.to_string());
    }

    pub fn reject_arguments_over(&mut self, max: usize) {
        self.max_arguments = Some(max);
    }

    /// The test script errors out after `count` successful runs.
    pub fn crash_after_tests(&mut self, count: u32) {
        self.tests_before_crash = Some(count);
    }

    pub fn bad_items(&self) -> &BTreeSet<String> {
        &self.bad
    }

    pub fn tests_run(&self) -> u32 {
        self.tests_run
    }

    pub fn raw_calls(&self, program: &str) -> Vec<Invocation> {
        self.calls
            .iter()
            .filter(|call| call.program == program)
            .cloned()
            .collect()
    }

    /// Items sent by each switch call, with list files expanded.
    pub fn switch_calls(&self, side: Side) -> Vec<Vec<String>> {
        let program = match side {
            Side::Good => "switch_good",
            Side::Bad => "switch_bad",
        };
        self.raw_calls(program)
            .iter()
            .map(|call| self.switched_items(call))
            .collect()
    }

    /// Contents of the bad-set file as seen by each test run.
    pub fn seen_bad_set_files(&self) -> &[Vec<String>] {
        &self.seen_bad_sets
    }

    fn switched_items(&self, call: &Invocation) -> Vec<String> {
        if let [only] = call.args.as_slice() {
            if !self.items.contains(only) && Path::new(only).is_file() {
                return fs::read_to_string(only)
                    .unwrap_or_default()
                    .lines()
                    .map(str::to_string)
                    .collect();
            }
        }
        call.args.clone()
    }

    fn run_test(&mut self, invocation: &Invocation) -> Result<CommandOutput, RunnerError> {
        if self
            .tests_before_crash
            .is_some_and(|limit| self.tests_run >= limit)
        {
            return Err(RunnerError::Wait {
                program: invocation.program.clone(),
                message: "simulated crash".to_string(),
            });
        }
        self.tests_run += 1;
        if let Some(path) = invocation.env_value(BAD_SET_VAR) {
            let listed = fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect();
            self.seen_bad_sets.push(listed);
        }
        let code = match (&self.compiler, &self.last_build) {
            (Some(compiler), Some(limits)) => i32::from(compiler.miscompiles(limits)),
            _ => (self.oracle)(&self.bad),
        };
        Ok(CommandOutput::exited(code))
    }
}

impl CommandRunner for FakeSystem {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput, RunnerError> {
        self.calls.push(invocation.clone());
        let program = invocation.program.as_str();

        if self
            .max_arguments
            .is_some_and(|max| invocation.args.len() > max)
        {
            return Err(RunnerError::ArgumentListTooLong {
                program: program.to_string(),
                count: invocation.args.len(),
            });
        }
        if self.timeouts.contains(program) {
            return Ok(CommandOutput {
                timed_out: true,
                ..CommandOutput::default()
            });
        }
        if program != "test" {
            if let Some(code) = self.exit_overrides.get(program) {
                return Ok(CommandOutput::exited(*code));
            }
        }

        match program {
            "get_items" => Ok(CommandOutput {
                exit_code: Some(0),
                stdout: self.items.join("\n") + "\n",
                ..CommandOutput::default()
            }),
            "switch_good" | "switch_bad" => {
                let switched = self.switched_items(invocation);
                for item in switched {
                    if program == "switch_bad" {
                        self.bad.insert(item);
                    } else {
                        self.bad.remove(&item);
                    }
                }
                Ok(CommandOutput::exited(0))
            }
            "test" => {
                let output = self.run_test(invocation)?;
                Ok(match self.exit_overrides.get("test") {
                    Some(code) => CommandOutput::exited(*code),
                    None => output,
                })
            }
            "build" => {
                let flags = invocation.env_value(LIMIT_FLAGS_VAR).unwrap_or_default();
                let Some(compiler) = &self.compiler else {
                    return Ok(CommandOutput::exited(0));
                };
                let (trace, limits) = compiler.build(flags);
                self.last_build = Some(limits);
                Ok(CommandOutput {
                    exit_code: Some(0),
                    stderr: trace,
                    ..CommandOutput::default()
                })
            }
            "diff" => Ok(CommandOutput {
                exit_code: Some(1),
                stdout: format!("< {}\n> {}\n", invocation.args[0], invocation.args[1]),
                ..CommandOutput::default()
            }),
            _ => Ok(CommandOutput::exited(0)),
        }
    }
}

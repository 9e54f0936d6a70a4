//! Nested bisection inside a single bad item: first over the compiler's pass
//! pipeline, then over the transformations of the offending pass.

use crate::bisector::{Bisector, LimitBisector, ProbeStatus};
use crate::config::PassBisectSettings;
use crate::diagnostics::{
    self, DiagnosticsError, LIMIT_FLAGS_VAR, PassTrace, counter_for_pass, pass_limit_flags,
    transform_limit_flags,
};
use crate::error::BisectError;
use crate::probe::Prober;
use crate::report::PassReport;
use crate::runner::{CommandOutput, Invocation};
use crate::state::{SearchPhase, SearchState, StateStore};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Drives one build script for one bad item.
pub struct PassBisect<'s> {
    settings: &'s PassBisectSettings,
    item: String,
}

/// Which level an IR diff is taken at.
#[derive(Debug, Clone, Copy)]
enum DiffLevel<'c> {
    Pass,
    Transform { counter: &'c str, pass_index: u32 },
}

impl<'s> PassBisect<'s> {
    pub fn new(settings: &'s PassBisectSettings, item: impl Into<String>) -> Self {
        Self {
            settings,
            item: item.into(),
        }
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    /// Runs the generator on the bad item; it leaves the build script behind.
    pub fn generate_build_script(&self, prober: &mut Prober<'_>) -> Result<(), BisectError> {
        let generator = self.settings.generator.as_str();
        info!("Generating build script for {}", self.item);
        let output = prober
            .runner()
            .run(&Invocation::new(generator).arg(self.item.as_str()))?;
        if !output.success() {
            return Err(BisectError::GeneratorFailed {
                script: generator.to_string(),
                status: output.describe(),
            });
        }
        Ok(())
    }

    fn run_build(&self, prober: &mut Prober<'_>, flags: String) -> Result<CommandOutput, BisectError> {
        let script = self.settings.build_script_path();
        debug!("Building {} with {LIMIT_FLAGS_VAR}='{flags}'", self.item);
        let invocation = Invocation::new(script.to_string_lossy())
            .env(LIMIT_FLAGS_VAR, flags)
            .timeout(self.settings.build_timeout());
        let output = prober.runner().run(&invocation)?;
        if !output.success() {
            warn!("Build script {}", output.describe());
        }
        Ok(output)
    }

    /// `None` builds with every pass enabled.
    pub fn build_with_pass_limit(
        &self,
        prober: &mut Prober<'_>,
        limit: Option<u32>,
    ) -> Result<PassTrace, BisectError> {
        let output = self.run_build(prober, pass_limit_flags(limit, false))?;
        Ok(diagnostics::parse_pass_trace(&output.combined(), limit)?)
    }

    /// Builds with the pass pipeline cut at `pass_limit` and `counter` limited to
    /// `limit` transformations. Returns the counter's reported total.
    pub fn build_with_transform_limit(
        &self,
        prober: &mut Prober<'_>,
        counter: &str,
        limit: Option<u32>,
        pass_limit: u32,
    ) -> Result<u32, BisectError> {
        let output = self.run_build(
            prober,
            transform_limit_flags(counter, limit, pass_limit, false),
        )?;
        Ok(diagnostics::parse_counter(&output.combined(), counter)?)
    }

    /// Rebuilds at `index - 1` and `index` emitting IR and logs the difference.
    fn print_ir_diff(
        &self,
        prober: &mut Prober<'_>,
        level: DiffLevel<'_>,
        index: u32,
    ) -> Result<(), BisectError> {
        let dir = tempfile::tempdir()?;
        let good_ir = dir.path().join("good.s");
        let bad_ir = dir.path().join("bad.s");

        for (limit, dest) in [(index.saturating_sub(1), &good_ir), (index, &bad_ir)] {
            let flags = match level {
                DiffLevel::Pass => pass_limit_flags(Some(limit), true),
                DiffLevel::Transform {
                    counter,
                    pass_index,
                } => transform_limit_flags(counter, Some(limit), pass_index, true),
            };
            self.run_build(prober, flags)?;
            fs::copy(Path::new(&self.item), dest)?;
        }

        let output = prober.runner().run(
            &Invocation::new("diff")
                .arg(good_ir.to_string_lossy())
                .arg(bad_ir.to_string_lossy()),
        )?;
        info!(
            "IR difference before and after bad {} {index}:\n{}",
            match level {
                DiffLevel::Pass => "pass",
                DiffLevel::Transform { .. } => "transformation",
            },
            output.stdout
        );
        Ok(())
    }
}

/// Probes limits until `bisector` converges, checkpointing through `phase`.
///
/// Returns `None` when the iteration budget runs out first.
fn limit_round<B, P>(
    prober: &mut Prober<'_>,
    store: &StateStore,
    state: &mut SearchState,
    mut bisector: LimitBisector,
    phase: P,
    mut build: B,
) -> Result<Option<u32>, BisectError>
where
    P: Fn(LimitBisector) -> SearchPhase,
    B: FnMut(&mut Prober<'_>, u32) -> Result<(), BisectError>,
{
    let iterations = prober.config().search.iterations;
    let setup_script = prober
        .config()
        .scripts
        .test_setup_script
        .clone()
        .unwrap_or_default();

    if state.resumed {
        state.resumed = false;
    } else {
        state.search_cycles = 0;
    }

    while !bisector.is_converged() {
        if state.search_cycles >= iterations {
            warn!(
                "Ran out of iterations bisecting limits in 0..={}. The result is inconclusive",
                bisector.total()
            );
            state.phase = phase(bisector);
            return Ok(None);
        }
        state.phase = phase(bisector.clone());
        store.save(state)?;
        info!(
            "Limit search {} of max {}. {}",
            state.search_cycles + 1,
            iterations,
            state.elapsed_string()
        );
        state.search_cycles += 1;
        state.total_probes += 1;

        let limit = bisector.next() as u32;
        build(prober, limit)?;

        let setup = prober.run_setup(&[])?;
        if setup != ProbeStatus::Good {
            return Err(BisectError::SetupFailed {
                script: setup_script,
                status: format!("{setup:?}"),
            });
        }
        let status = prober.run_test(&[])?;
        if status == ProbeStatus::Skip {
            state.skipped_probes += 1;
        }
        bisector.set_status(status);
    }

    let result = bisector.result();
    state.phase = phase(bisector);
    Ok(Some(result))
}

/// Localizes the failure inside the single found item. Returns `None` when a limit
/// search ran out of iterations before naming a pass.
pub fn search_bad_pass(
    prober: &mut Prober<'_>,
    store: &StateStore,
    state: &mut SearchState,
    settings: &PassBisectSettings,
) -> Result<Option<PassReport>, BisectError> {
    if state.found_items.len() != 1 {
        return Err(BisectError::FoundItemCount(state.found_items.len()));
    }
    let Some(item) = state.found_items.iter().next().cloned() else {
        return Err(BisectError::FoundItemCount(0));
    };
    let job = PassBisect::new(settings, item);
    job.generate_build_script(prober)?;

    info!("Starting pass level bisection on {}", job.item());
    let (pass_index, pass_line, counter, transform_bisector) = match state.phase.clone() {
        SearchPhase::Transforms {
            pass_index,
            pass_line,
            counter,
            bisector,
        } => (pass_index, pass_line, counter, Some(bisector)),
        resumed_phase => {
            let bisector = match resumed_phase {
                SearchPhase::Passes { bisector } => bisector,
                _ => {
                    let total = job.build_with_pass_limit(prober, None)?.count;
                    info!("Bisecting over {total} passes");
                    LimitBisector::new(total)
                }
            };
            let Some(pass_index) = limit_round(
                prober,
                store,
                state,
                bisector,
                |bisector| SearchPhase::Passes { bisector },
                |prober, limit| job.build_with_pass_limit(prober, Some(limit)).map(drop),
            )?
            else {
                state.inconclusive = true;
                return Ok(None);
            };
            if pass_index == 0 {
                return Err(BisectError::NotReproducible("passes".to_string()));
            }

            let trace = job.build_with_pass_limit(prober, Some(pass_index))?;
            let Some(pass_line) = trace.last_pass else {
                return Err(BisectError::NotReproducible("passes".to_string()));
            };
            info!("Bad pass found: {pass_line} (index {pass_index})");
            if settings.ir_diff {
                job.print_ir_diff(prober, DiffLevel::Pass, pass_index)?;
            }

            let Some(counter) = counter_for_pass(&pass_line) else {
                warn!(
                    "Pass '{pass_line}' has no known debug counter. Transformation level bisection is not supported, stopping at pass level"
                );
                return Ok(Some(PassReport {
                    item: job.item().to_string(),
                    pass_index,
                    pass: pass_line,
                    counter: None,
                    transform_index: None,
                }));
            };
            (pass_index, pass_line, counter.to_string(), None)
        }
    };

    info!("Starting transformation level bisection on '{counter}'");
    let bisector = match transform_bisector {
        Some(bisector) => bisector,
        None => {
            match job.build_with_transform_limit(prober, &counter, None, pass_index) {
                Ok(total) => {
                    info!("Bisecting over {total} transformations");
                    LimitBisector::new(total)
                }
                Err(BisectError::Diagnostics(DiagnosticsError::NoCounters)) => {
                    if settings.ir_diff {
                        job.print_ir_diff(prober, DiffLevel::Pass, pass_index)?;
                    }
                    return Err(BisectError::NoDebugCounter(pass_line));
                }
                Err(other) => return Err(other),
            }
        }
    };

    let transform = {
        let phase_line = pass_line.clone();
        let phase_counter = counter.clone();
        limit_round(
            prober,
            store,
            state,
            bisector,
            move |bisector| SearchPhase::Transforms {
                pass_index,
                pass_line: phase_line.clone(),
                counter: phase_counter.clone(),
                bisector,
            },
            |prober, limit| {
                job.run_build(
                    prober,
                    transform_limit_flags(&counter, Some(limit), pass_index, false),
                )
                .map(drop)
            },
        )?
    };

    let transform_index = match transform {
        Some(0) => return Err(BisectError::NotReproducible(format!("'{counter}'"))),
        Some(index) => {
            info!("Bad transformation found: number {index} of '{counter}'");
            if settings.ir_diff {
                job.print_ir_diff(
                    prober,
                    DiffLevel::Transform {
                        counter: &counter,
                        pass_index,
                    },
                    index,
                )?;
            }
            Some(index)
        }
        None => {
            state.inconclusive = true;
            None
        }
    };

    Ok(Some(PassReport {
        item: job.item().to_string(),
        pass_index,
        pass: pass_line,
        counter: Some(counter),
        transform_index,
    }))
}

use crate::bisector::{Bisector, ProbeStatus};
use crate::error::BisectError;
use crate::probe::Prober;
use crate::set_file::{BAD_SET_VAR, GOOD_SET_VAR, ScopedSetFile};
use crate::state::{SearchState, StateStore};
use tracing::{debug, info, warn};

/// How one item-level round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Index into `all_items` of the first bad item.
    Converged(usize),
    /// The iteration budget ran out first. Says nothing about whether a bad item exists.
    Exhausted,
}

fn estimated_probes(len: usize) -> u32 {
    len.max(1).next_power_of_two().trailing_zeros()
}

fn log_progress(state: &SearchState, prune_iterations: u32) {
    info!(
        "Search {} of estimated {}. Prune {} of max {}. Current bad items found: [{}]",
        state.search_cycles + 1,
        estimated_probes(state.all_items.len()),
        state.prune_cycles + 1,
        prune_iterations,
        state
            .found_items
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("{}", state.elapsed_string());
}

/// Bisects `state.all_items` for the first item whose inclusion in the bad set
/// reproduces the failure. The state is checkpointed before every probe.
pub fn search_round(
    prober: &mut Prober<'_>,
    store: &StateStore,
    state: &mut SearchState,
) -> Result<RoundOutcome, BisectError> {
    let iterations = prober.config().search.iterations;
    let prune_iterations = prober.config().search.prune_iterations;

    if state.resumed {
        state.resumed = false;
    } else {
        state.search_cycles = 0;
    }

    if state.bisector.is_converged() {
        return Ok(RoundOutcome::Converged(state.bisector.current()));
    }

    while state.search_cycles < iterations {
        store.save(state)?;
        log_progress(state, prune_iterations);
        state.search_cycles += 1;
        state.total_probes += 1;

        let boundary = state.bisector.next();
        let (bad, good) = state.partition(boundary);
        debug!("Probing with {} bad and {} good item(s)", bad.len(), good.len());

        let status = prober.probe_items(state, &bad, &good)?;
        if status == ProbeStatus::Skip {
            state.skipped_probes += 1;
        }
        if state.bisector.set_status(status) {
            info!("Bisection converged after {} probe(s)", state.search_cycles);
            return Ok(RoundOutcome::Converged(state.bisector.current()));
        }
    }

    warn!(
        "Ran out of iterations searching for bad items ({} of {}). The result is inconclusive",
        state.search_cycles, iterations
    );
    Ok(RoundOutcome::Exhausted)
}

/// Runs item-level rounds, pruning after each one to look for further bad items.
pub fn search_bad_items(
    prober: &mut Prober<'_>,
    store: &StateStore,
    state: &mut SearchState,
) -> Result<(), BisectError> {
    let prune = prober.config().search.prune;
    let prune_iterations = prober.config().search.prune_iterations;

    while state.prune_cycles < prune_iterations {
        let outcome = search_round(prober, store, state)?;
        state.prune_cycles += 1;

        let index = match outcome {
            RoundOutcome::Converged(index) => index,
            RoundOutcome::Exhausted => {
                state.inconclusive = true;
                break;
            }
        };
        let item = state.all_items[index].clone();
        info!("Bad item found: {item}");

        if index + 1 == state.all_items.len() {
            info!("First bad item is the last item. Breaking.");
            state.found_items.insert(item);
            break;
        }
        if state.found_items.contains(&item) {
            info!("Found item {item} again. No more bad items remaining.");
            break;
        }

        let mut remaining = state.all_items.clone();
        let found = remaining.remove(index);
        remaining.push(found);
        state.found_items.insert(item);
        state.known_good.extend(remaining.drain(..index));

        if !prune {
            info!("Not continuing further, pruning is disabled");
            break;
        }
        debug!(
            "Pruned {} known good item(s), {} item(s) left",
            state.known_good.len(),
            remaining.len()
        );
        state.populate(remaining);
    }

    if state.prune_cycles >= prune_iterations && prune {
        info!("Reached the prune iteration limit ({prune_iterations})");
    }
    Ok(())
}

/// Leaves the system with only the found items switched to bad.
pub fn apply_final_partition(
    prober: &mut Prober<'_>,
    state: &mut SearchState,
) -> Result<(), BisectError> {
    let bad: Vec<String> = state.found_items.iter().cloned().collect();
    let good: Vec<String> = state
        .all_items
        .iter()
        .chain(state.known_good.iter())
        .filter(|item| !state.found_items.contains(*item))
        .cloned()
        .collect();

    let good_set = ScopedSetFile::new(GOOD_SET_VAR, &good)?;
    let bad_set = ScopedSetFile::new(BAD_SET_VAR, &bad)?;
    let env = [good_set.env_pair(), bad_set.env_pair()];
    prober.switch_to_good(state, &good, &env)?;
    prober.switch_to_bad(state, &bad, &env)?;
    Ok(())
}

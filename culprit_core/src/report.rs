use crate::state::SearchState;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;

/// Where inside the bad item the failure was localized.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub item: String,
    /// Smallest pass limit that reproduces the failure.
    pub pass_index: u32,
    /// Trace line naming the bad pass.
    pub pass: String,
    /// Debug counter of the pass, when it has one.
    pub counter: Option<String>,
    pub transform_index: Option<u32>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BisectReport {
    pub found_items: Vec<String>,
    pub known_good: Vec<String>,
    /// An iteration budget ran out; the absence of found items proves nothing.
    pub inconclusive: bool,
    pub rounds: u32,
    pub total_probes: u32,
    pub skipped_probes: u32,
    pub elapsed_secs: u64,
    pub pass: Option<PassReport>,
}

impl BisectReport {
    pub fn from_state(state: &SearchState, pass: Option<PassReport>) -> Self {
        Self {
            found_items: state.found_items.iter().cloned().collect(),
            known_good: state.known_good.iter().cloned().collect(),
            inconclusive: state.inconclusive,
            rounds: state.prune_cycles,
            total_probes: state.total_probes,
            skipped_probes: state.skipped_probes,
            elapsed_secs: state.elapsed().as_secs(),
            pass,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), anyhow::Error> {
        let json = self
            .to_json()
            .map_err(|e| anyhow::anyhow!("Failed to serialize report: {}", e))?;
        fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write report to {:?}: {}", path, e))
    }
}

impl fmt::Display for BisectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inconclusive {
            writeln!(
                f,
                "Search is INCONCLUSIVE: ran out of iterations before converging."
            )?;
        }
        if self.found_items.is_empty() {
            writeln!(f, "No bad items found.")?;
        } else {
            writeln!(f, "Bad items are:")?;
            for item in &self.found_items {
                writeln!(f, "  {item}")?;
            }
        }
        if let Some(pass) = &self.pass {
            writeln!(f, "Bad pass in {}: {} (index {})", pass.item, pass.pass, pass.pass_index)?;
            match (&pass.counter, pass.transform_index) {
                (Some(counter), Some(index)) => {
                    writeln!(f, "Bad transformation: number {index} of '{counter}'")?
                }
                (Some(counter), None) => {
                    writeln!(f, "Transformation search over '{counter}' did not converge")?
                }
                (None, _) => writeln!(f, "Pass has no debug counter; stopped at pass level")?,
            }
        }
        write!(
            f,
            "{} probe(s), {} skipped, {} round(s), {} known good, {}s elapsed",
            self.total_probes,
            self.skipped_probes,
            self.rounds,
            self.known_good.len(),
            self.elapsed_secs
        )
    }
}

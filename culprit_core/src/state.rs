use crate::bisector::{ItemBisector, LimitBisector};
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Errors raised while building, saving or restoring a `SearchState`.
#[derive(Error, Debug)]
pub enum StateError {
    /// The item enumerator produced nothing to bisect.
    #[error("Item list is empty, nothing to bisect")]
    EmptyItemList,

    /// Items are identified by value, so every item must be unique.
    #[error("Item '{0}' appears more than once in the item list")]
    DuplicateItem(String),

    /// No checkpoint exists at the given path.
    #[error("No saved state found at {0:?}")]
    NotFound(PathBuf),

    /// The checkpoint exists but fails its integrity check.
    #[error("Saved state is corrupt: {0}")]
    Corrupt(String),

    #[error("State I/O error: {0}")]
    Io(String),

    #[error("State serialization error: {0}")]
    Serialization(String),

    #[error("State deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::Io(err.to_string())
    }
}
impl From<EncodeError> for StateError {
    fn from(err: EncodeError) -> Self {
        StateError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for StateError {
    fn from(err: DecodeError) -> Self {
        StateError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// Which search is in flight. Nested searches carry their own bisector so that a
/// resumed run picks up mid-bisection.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum SearchPhase {
    Items,
    Passes {
        bisector: LimitBisector,
    },
    Transforms {
        pass_index: u32,
        /// Trace line of the bad pass.
        pass_line: String,
        /// Debug counter being limited.
        counter: String,
        bisector: LimitBisector,
    },
}

/// Everything needed to continue a bisection after the process dies.
///
/// Holds plain data only; process runners and loggers live in `Runtime`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SearchState {
    /// Items under search, in bisection order.
    pub all_items: Vec<String>,
    /// Last partition applied to the system under test. Disjoint.
    pub currently_good_items: BTreeSet<String>,
    pub currently_bad_items: BTreeSet<String>,
    /// Items confirmed bad by a converged round.
    pub found_items: BTreeSet<String>,
    /// Items excluded from bisection but still switched to good.
    pub known_good: BTreeSet<String>,
    pub search_cycles: u32,
    pub prune_cycles: u32,
    /// Set for exactly one round after a resume so cycle counters survive.
    pub resumed: bool,
    /// A round ran out of iterations before converging.
    pub inconclusive: bool,
    pub bisector: ItemBisector,
    pub phase: SearchPhase,
    pub total_probes: u32,
    pub skipped_probes: u32,
    /// Unix seconds; refreshed on resume.
    pub started_at: u64,
    /// TOML of the configuration the run was started with.
    pub config: String,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Rejects empty lists and duplicates: items are compared by value throughout.
pub fn check_items(items: &[String]) -> Result<(), StateError> {
    if items.is_empty() {
        return Err(StateError::EmptyItemList);
    }
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.as_str()) {
            return Err(StateError::DuplicateItem(item.clone()));
        }
    }
    Ok(())
}

impl SearchState {
    pub fn new(items: Vec<String>, config: String) -> Result<Self, StateError> {
        check_items(&items)?;
        let bisector = ItemBisector::new(items.len());
        Ok(Self {
            all_items: items,
            currently_good_items: BTreeSet::new(),
            currently_bad_items: BTreeSet::new(),
            found_items: BTreeSet::new(),
            known_good: BTreeSet::new(),
            search_cycles: 0,
            prune_cycles: 0,
            resumed: false,
            inconclusive: false,
            bisector,
            phase: SearchPhase::Items,
            total_probes: 0,
            skipped_probes: 0,
            started_at: unix_now(),
            config,
        })
    }

    /// Replaces the item list and starts a fresh bisection over it.
    pub fn populate(&mut self, items: Vec<String>) {
        self.bisector = ItemBisector::new(items.len());
        self.all_items = items;
    }

    /// Splits the items at `boundary`: everything up to and including it goes bad,
    /// the rest plus every known-good item goes good.
    pub fn partition(&self, boundary: usize) -> (Vec<String>, Vec<String>) {
        let split = (boundary + 1).min(self.all_items.len());
        let bad = self.all_items[..split].to_vec();
        let mut good = self.all_items[split..].to_vec();
        good.extend(self.known_good.iter().cloned());
        (bad, good)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.started_at))
    }

    pub fn elapsed_string(&self) -> String {
        let secs = self.elapsed().as_secs();
        format!(
            "Elapsed time: {} hours {} mins {} secs",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        )
    }

    pub fn describe(&self) -> String {
        format!(
            "all items: {}\nfound: {:?}\nknown good: {}\ncurrently good: {}\ncurrently bad: {}\nsearch cycles: {} prune cycles: {}",
            self.all_items.len(),
            self.found_items,
            self.known_good.len(),
            self.currently_good_items.len(),
            self.currently_bad_items.len(),
            self.search_cycles,
            self.prune_cycles
        )
    }
}

/// Owns the well-known checkpoint path.
///
/// A checkpoint is `MAGIC ‖ md5(payload) ‖ payload`, staged in the same directory and
/// renamed over the well-known path, so readers only ever see a complete file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    const MAGIC: &'static [u8; 8] = b"CULPRIT\x01";
    const DIGEST_LEN: usize = 16;
    const STAGING_PREFIX: &'static str = ".culprit-state-";

    fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn save(&self, state: &SearchState) -> Result<(), StateError> {
        let payload = bincode::encode_to_vec(state, Self::bincode_config())?;
        let digest = md5::compute(&payload);

        let dir = self.directory();
        let mut staged = tempfile::Builder::new()
            .prefix(Self::STAGING_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| {
                StateError::Io(format!("Failed to stage checkpoint in {:?}: {}", dir, e))
            })?;
        staged.write_all(Self::MAGIC)?;
        staged.write_all(&digest.0)?;
        staged.write_all(&payload)?;
        staged.as_file().sync_all()?;

        staged.persist(&self.path).map_err(|e| {
            StateError::Io(format!(
                "Failed to move checkpoint into place at {:?}: {}",
                self.path, e.error
            ))
        })?;

        #[cfg(unix)]
        if let Ok(handle) = fs::File::open(&dir) {
            let _ = handle.sync_all();
        }

        debug!("Saved state to {:?} ({} bytes)", self.path, payload.len());
        Ok(())
    }

    /// Restores a checkpoint for resuming: marks it resumed, restarts the clock and
    /// forgets the applied partition so the next probe resends everything.
    pub fn load(&self) -> Result<SearchState, StateError> {
        if !self.exists() {
            return Err(StateError::NotFound(self.path.clone()));
        }
        let bytes = fs::read(&self.path)
            .map_err(|e| StateError::Io(format!("Failed to read {:?}: {}", self.path, e)))?;

        let header_len = Self::MAGIC.len() + Self::DIGEST_LEN;
        if bytes.len() < header_len {
            return Err(StateError::Corrupt(format!(
                "{} bytes is shorter than the checkpoint header",
                bytes.len()
            )));
        }
        let (magic, rest) = bytes.split_at(Self::MAGIC.len());
        if magic != Self::MAGIC {
            return Err(StateError::Corrupt(
                "not a culprit checkpoint (bad magic)".to_string(),
            ));
        }
        let (digest, payload) = rest.split_at(Self::DIGEST_LEN);
        if digest != md5::compute(payload).0.as_slice() {
            return Err(StateError::Corrupt("checksum mismatch".to_string()));
        }

        let (mut state, _len): (SearchState, usize) =
            bincode::decode_from_slice(payload, Self::bincode_config())?;

        state.resumed = true;
        state.started_at = unix_now();
        state.currently_good_items.clear();
        state.currently_bad_items.clear();
        Ok(state)
    }

    pub fn remove(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Io(format!(
                "Failed to remove {:?}: {}",
                self.path, e
            ))),
        }
    }
}

use bincode::{Decode, Encode};
use tracing::debug;

/// Outcome of one probe as seen by a `Bisector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ProbeStatus {
    /// The failure did not reproduce with the probed range switched to bad.
    Good,
    /// The failure reproduced.
    Bad,
    /// The oracle could not decide (skip code or timeout). Narrows like `Good`.
    Skip,
}

impl ProbeStatus {
    /// Maps a process exit to a status. Death by signal counts as a failure.
    pub fn from_exit(exit_code: Option<i32>, skip_code: i32) -> Self {
        match exit_code {
            Some(0) => ProbeStatus::Good,
            Some(code) if code == skip_code => ProbeStatus::Skip,
            _ => ProbeStatus::Bad,
        }
    }

    pub fn is_bad(self) -> bool {
        self == ProbeStatus::Bad
    }
}

/// Tracks a probe boundary over a sorted sequence and narrows it from probe outcomes.
///
/// The engine only ever asks for the next position, runs the probe, and reports the
/// status back; all index arithmetic stays behind this trait.
pub trait Bisector {
    /// Returns the next position to probe and makes it current.
    fn next(&mut self) -> usize;

    /// Narrows the search range with the outcome of probing `current()`.
    ///
    /// Returns `true` once the search has converged.
    fn set_status(&mut self, status: ProbeStatus) -> bool;

    /// The most recently probed position, or the result once converged.
    fn current(&self) -> usize;

    fn is_converged(&self) -> bool;

    /// Positions whose probe returned `ProbeStatus::Skip`.
    fn skipped(&self) -> &[usize];
}

/// Bisects over item positions `0..len`, looking for the first position whose
/// inclusion in the bad set reproduces the failure.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ItemBisector {
    lo: usize,
    hi: usize,
    current: usize,
    skipped: Vec<usize>,
}

impl ItemBisector {
    pub fn new(len: usize) -> Self {
        let hi = len.saturating_sub(1);
        Self {
            lo: 0,
            hi,
            current: 0,
            skipped: Vec::new(),
        }
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.lo, self.hi)
    }
}

impl Bisector for ItemBisector {
    fn next(&mut self) -> usize {
        self.current = (self.lo + self.hi) / 2;
        debug!(
            "Bisecting items between {} and {}, probing {}",
            self.lo, self.hi, self.current
        );
        self.current
    }

    fn set_status(&mut self, status: ProbeStatus) -> bool {
        match status {
            ProbeStatus::Bad => self.hi = self.current,
            ProbeStatus::Skip => {
                self.skipped.push(self.current);
                self.lo = self.current + 1;
            }
            ProbeStatus::Good => self.lo = self.current + 1,
        }
        debug!(
            "Index {} returned {:?}, lo: {} hi: {}",
            self.current, status, self.lo, self.hi
        );
        if self.is_converged() {
            self.current = self.lo;
            debug!("Search complete, first bad index: {}", self.current);
            return true;
        }
        false
    }

    fn current(&self) -> usize {
        self.current
    }

    fn is_converged(&self) -> bool {
        self.lo >= self.hi
    }

    fn skipped(&self) -> &[usize] {
        &self.skipped
    }
}

/// Bisects over a limit `0..=total` (number of passes or transformations allowed to run),
/// looking for the smallest limit that still reproduces the failure.
///
/// A converged result of 0 means the failure happens even with nothing applied.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LimitBisector {
    lo: u32,
    hi: u32,
    total: u32,
    current: u32,
    skipped: Vec<usize>,
}

impl LimitBisector {
    pub fn new(total: u32) -> Self {
        Self {
            lo: 0,
            hi: total,
            total,
            current: total,
            skipped: Vec::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// The smallest limit known to reproduce the failure.
    pub fn result(&self) -> u32 {
        self.hi
    }
}

impl Bisector for LimitBisector {
    fn next(&mut self) -> usize {
        self.current = (self.lo + self.hi) / 2;
        debug!(
            "Bisecting limits between ({}, {}), current limit: {}",
            self.lo, self.hi, self.current
        );
        self.current as usize
    }

    fn set_status(&mut self, status: ProbeStatus) -> bool {
        match status {
            ProbeStatus::Bad => {
                debug!("Failure reproduced, decreasing upper bound");
                self.hi = self.current;
            }
            ProbeStatus::Skip => {
                self.skipped.push(self.current as usize);
                self.lo = self.current + 1;
            }
            ProbeStatus::Good => {
                debug!("Failure not reproduced, increasing lower bound");
                self.lo = self.current + 1;
            }
        }
        if self.is_converged() {
            self.current = self.hi;
            debug!("Limit search finished at {}", self.current);
            return true;
        }
        false
    }

    fn current(&self) -> usize {
        self.current as usize
    }

    fn is_converged(&self) -> bool {
        self.lo >= self.hi
    }

    fn skipped(&self) -> &[usize] {
        &self.skipped
    }
}

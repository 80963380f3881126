//! Batch status and progress counters shared by the store and the wire protocol

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Batch lifecycle status
///
/// `PENDING → PROCESSING → {COMPLETE, FAILED}`. Terminal states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    /// Created, no result applied yet
    Pending,
    /// At least one result applied
    Processing,
    /// Every declared item produced a result
    Complete,
    /// Unrecoverable store-level fault
    Failed,
}

impl BatchStatus {
    /// Terminal statuses accept no further results
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Complete | BatchStatus::Failed)
    }

    /// Position in the lifecycle; transitions only ever move to a higher rank
    fn rank(self) -> u8 {
        match self {
            BatchStatus::Pending => 0,
            BatchStatus::Processing => 1,
            BatchStatus::Complete | BatchStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the state machine
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Complete => "COMPLETE",
            BatchStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "PENDING" => Ok(BatchStatus::Pending),
            "PROCESSING" => Ok(BatchStatus::Processing),
            "COMPLETE" => Ok(BatchStatus::Complete),
            "FAILED" => Ok(BatchStatus::Failed),
            other => Err(crate::Error::Internal(format!("Unknown batch status: {}", other))),
        }
    }
}

/// Absolute progress counters of one batch
///
/// Every progress push carries these absolute values rather than a delta, so any
/// later push supersedes a lost one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub processed: u64,
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
}

impl ProgressCounts {
    pub fn new(total: u64) -> Self {
        Self {
            processed: 0,
            total,
            valid: 0,
            invalid: 0,
        }
    }

    /// Percentage complete (0.0 - 100.0), rounded to two decimals
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let raw = (self.processed as f64 / self.total as f64) * 100.0;
        (raw * 100.0).round() / 100.0
    }

    /// `processed = valid + invalid ≤ total`
    pub fn is_consistent(&self) -> bool {
        self.processed == self.valid + self.invalid && self.processed <= self.total
    }

    pub fn is_finished(&self) -> bool {
        self.processed >= self.total
    }
}

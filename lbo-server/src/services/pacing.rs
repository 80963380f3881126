//! Inter-chunk pacing
//!
//! Pure delay calculation applied by the dispatcher before every chunk after
//! the first. Large batches are paced mostly by their size, small batches mostly
//! by how far through the batch the chunk is. Never shorter than
//! `floor_per_item * batch_size`.

use lbo_common::config::PacingConfig;
use std::time::Duration;

/// Which term dominates the delay for a given batch size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingRegime {
    /// `batch_size >= size_threshold`: size weighted by `major_weight`
    SizeWeighted,
    /// Small batch: chunk index weighted by `major_weight`
    IndexWeighted,
}

/// Delay constants
#[derive(Debug, Clone, PartialEq)]
pub struct PacingPolicy {
    pub base_secs: f64,
    pub major_weight: f64,
    pub minor_weight: f64,
    pub size_threshold: u64,
    pub floor_per_item: f64,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::from_config(&PacingConfig::default())
    }
}

impl PacingPolicy {
    pub fn from_config(config: &PacingConfig) -> Self {
        Self {
            base_secs: config.base_secs,
            major_weight: config.major_weight,
            minor_weight: config.minor_weight,
            size_threshold: config.size_threshold,
            floor_per_item: config.floor_per_item,
        }
    }

    /// No pacing at all
    pub fn immediate() -> Self {
        Self {
            base_secs: 0.0,
            major_weight: 0.0,
            minor_weight: 0.0,
            size_threshold: u64::MAX,
            floor_per_item: 0.0,
        }
    }

    pub fn regime(&self, batch_size: u64) -> PacingRegime {
        if batch_size >= self.size_threshold {
            PacingRegime::SizeWeighted
        } else {
            PacingRegime::IndexWeighted
        }
    }

    /// Delay in seconds before chunk `chunk_index` of `total_chunks`
    pub fn delay_secs(&self, batch_size: u64, chunk_index: u64, total_chunks: u64) -> f64 {
        let index = if total_chunks > 0 {
            chunk_index.min(total_chunks - 1)
        } else {
            chunk_index
        } as f64;
        let size = batch_size as f64;

        let raw = match self.regime(batch_size) {
            PacingRegime::SizeWeighted => {
                self.base_secs + self.major_weight * size + self.minor_weight * index
            }
            PacingRegime::IndexWeighted => {
                self.base_secs + self.minor_weight * size + self.major_weight * index
            }
        };

        raw.max(self.floor_per_item * size)
    }

    pub fn delay(&self, batch_size: u64, chunk_index: u64, total_chunks: u64) -> Duration {
        Duration::from_secs_f64(self.delay_secs(batch_size, chunk_index, total_chunks).max(0.0))
    }
}

/// Delay in seconds under the default constants
pub fn delay(batch_size: u64, chunk_index: u64, total_chunks: u64) -> f64 {
    PacingPolicy::default().delay_secs(batch_size, chunk_index, total_chunks)
}

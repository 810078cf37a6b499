//! Shared types for the KREIOS driver core
//!
//! Progress accounting, the published status snapshot and the state
//! machines live here; everything else is component-specific.

use serde::{Deserialize, Serialize};

pub mod state;

pub use state::{ControllerState, DriverState};

/// Progress of the current acquisition session
///
/// Per-iteration counters restart at every iteration; the overall counters
/// span all requested iterations. Sample counts are in energy samples, not
/// individual detector values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Iteration currently being acquired (0-based)
    pub iteration: u32,
    /// Iterations requested for this session
    pub iterations: u32,
    /// Samples consumed in the current iteration
    pub current_sample_iteration: usize,
    /// Samples consumed over the whole session
    pub current_sample: usize,
    /// Percent complete of the current iteration (0-100)
    pub percent_complete_iteration: u8,
    /// Percent complete of the whole session (0-100)
    pub percent_complete: u8,
    /// Estimated seconds left in the current iteration
    pub remaining_time_iteration_s: f64,
    /// Estimated seconds left in the whole session
    pub remaining_time_s: f64,
}

impl Progress {
    /// Compute progress from consumed counts
    ///
    /// `samples_per_iteration` is the per-iteration sample total (energy
    /// samples times slices); `dwell_time` scales the remaining-time
    /// estimate.
    pub fn compute(
        iteration: u32,
        iterations: u32,
        consumed: usize,
        samples_per_iteration: usize,
        dwell_time: f64,
    ) -> Self {
        let iterations = iterations.max(1);
        let per_iter = samples_per_iteration.max(1);
        let total = per_iter * iterations as usize;
        let overall = (iteration as usize * per_iter + consumed).min(total);

        let pct = |num: usize, den: usize| ((num * 100) / den).min(100) as u8;

        Self {
            iteration,
            iterations,
            current_sample_iteration: consumed,
            current_sample: overall,
            percent_complete_iteration: pct(consumed, per_iter),
            percent_complete: pct(overall, total),
            remaining_time_iteration_s: per_iter.saturating_sub(consumed) as f64 * dwell_time,
            remaining_time_s: total.saturating_sub(overall) as f64 * dwell_time,
        }
    }

    /// A completed session
    pub fn complete(iterations: u32, samples_per_iteration: usize) -> Self {
        let iterations = iterations.max(1);
        Self {
            iteration: iterations - 1,
            iterations,
            current_sample_iteration: samples_per_iteration,
            current_sample: samples_per_iteration * iterations as usize,
            percent_complete_iteration: 100,
            percent_complete: 100,
            remaining_time_iteration_s: 0.0,
            remaining_time_s: 0.0,
        }
    }
}

/// Identity of the connected Prodigy server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// `ServerName` from the Connect reply
    pub server_name: String,
    /// Protocol major version (must be 1)
    pub protocol_major: u32,
    /// Protocol minor version
    pub protocol_minor: u32,
    /// `GetAnalyzerVisibleName` result, read once at first connect
    pub visible_name: String,
}

/// Ordinate-axis information from `GetSpectrumDataInfo Name:OrdinateRange`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrdinateRange {
    pub min: f64,
    pub max: f64,
    pub units: String,
}

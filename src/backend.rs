// src/backend.rs
//! The time-series database seam.
//!
//! Alarms with a `lookup` clause ask the database for one aggregated
//! value over a time window. The database itself lives outside this
//! crate; [`MetricsBackend`] is the single entry point the evaluator
//! uses. A lookup can fail (backend error), succeed with a value, or
//! succeed with no data for the window.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Aggregation applied over the lookup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// Arithmetic mean of the window.
    Average,
    /// Smallest sample in the window.
    Min,
    /// Largest sample in the window.
    Max,
    /// Sum of the window.
    Sum,
    /// Median of the window.
    Median,
}

impl Default for Grouping {
    fn default() -> Self {
        Grouping::Average
    }
}

bitflags! {
    /// Modifiers applied to a database lookup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupOptions: u32 {
        /// Sum absolute values of all dimensions.
        const ABSOLUTE = 1 << 0;
        /// Return the value as a percentage over all dimensions.
        const PERCENTAGE = 1 << 1;
        /// Use the min-to-max range instead of the aggregate.
        const MIN2MAX = 1 << 2;
        /// Do not shift the window to the chart's update boundaries.
        const UNALIGNED = 1 << 3;
    }
}

/// One aggregated-value request, as built by the evaluator.
#[derive(Debug, Clone)]
pub struct LookupRequest<'a> {
    /// Chart id to look up.
    pub chart: &'a str,
    /// Optional dimension filter (backend-specific syntax).
    pub dimensions: Option<&'a str>,
    /// Window start, seconds relative to `now` (usually negative).
    pub after: i64,
    /// Window end, seconds relative to `now`.
    pub before: i64,
    /// Aggregation over the window.
    pub group: Grouping,
    /// Lookup modifiers.
    pub options: LookupOptions,
    /// The evaluation timestamp the window is relative to.
    pub now: i64,
}

/// What a successful lookup produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupOutcome {
    /// The aggregated value for the window.
    Value(f64),
    /// The window holds no data (not collected yet, or a gap).
    Empty,
}

/// A single-value lookup interface into the time-series database.
pub trait MetricsBackend: Send + Sync {
    /// Compute one aggregated value for the request window.
    ///
    /// An `Err` marks the alarm with a database-error flag; an
    /// [`LookupOutcome::Empty`] marks it with a no-data flag. Both
    /// force the alarm's value to NaN for this tick.
    fn lookup(&self, request: &LookupRequest<'_>) -> Result<LookupOutcome>;
}

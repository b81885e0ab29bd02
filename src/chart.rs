// src/chart.rs
//! Chart descriptors.
//!
//! A chart is the time-series collection an alarm attaches to. The
//! collectors that feed it are outside this crate; the health engine
//! only reads its collection state and retention bounds, and resets its
//! threshold variables on configuration reload.

use std::sync::Arc;

use parking_lot::RwLock;

/// A chart an alarm can link to.
#[derive(Debug, Clone)]
pub struct Chart {
    /// Unique chart id, e.g. `system.cpu`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The chart's context (shared by charts of the same kind).
    pub context: String,
    /// The chart's family (dashboard grouping).
    pub family: String,
    /// Units of the collected values.
    pub units: String,
    /// Collection interval in seconds.
    pub update_every: i64,
    /// Whether the chart is enabled for collection.
    pub enabled: bool,
    /// Whether the chart has been marked obsolete.
    pub obsolete: bool,
    /// Number of completed collections.
    pub counter_done: u64,
    /// Unix timestamp of the last collection, 0 when never collected.
    pub last_collected: i64,
    /// Oldest retained sample, Unix seconds.
    pub first_entry: i64,
    /// Newest retained sample, Unix seconds.
    pub last_entry: i64,
    /// Green threshold variable, reset to NaN on reload.
    pub green: f64,
    /// Red threshold variable, reset to NaN on reload.
    pub red: f64,
}

/// A chart shared between the collection side and the health engine.
pub type SharedChart = Arc<RwLock<Chart>>;

impl Chart {
    /// Create a chart with no collected data yet.
    pub fn new(
        id: impl Into<String>,
        context: impl Into<String>,
        family: impl Into<String>,
        units: impl Into<String>,
        update_every: i64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            context: context.into(),
            family: family.into(),
            units: units.into(),
            update_every,
            enabled: true,
            obsolete: false,
            counter_done: 0,
            last_collected: 0,
            first_entry: 0,
            last_entry: 0,
            green: f64::NAN,
            red: f64::NAN,
        }
    }

    /// Whether the chart has been collected enough to evaluate alarms
    /// against (at least two completed collections).
    pub fn has_enough_collections(&self) -> bool {
        self.last_collected != 0 && self.counter_done >= 2
    }

    /// Wrap into the shared handle used by the registry.
    pub fn into_shared(self) -> SharedChart {
        Arc::new(RwLock::new(self))
    }
}

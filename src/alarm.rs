// src/alarm.rs
//! Alarm definitions and runtime state.
//!
//! An alarm is a named rule (expressions, lookup, cadence, delays)
//! attached to a chart, plus the state machine the engine drives for
//! it: current/previous value, current/previous status, hysteresis
//! counters, and repeat bookkeeping. Templates are the same rule body
//! keyed by chart context instead of a concrete chart id; they
//! materialize into alarms when matching charts appear.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::backend::{Grouping, LookupOptions};
use crate::chart::SharedChart;
use crate::expr::Expression;

// ==========================================================
// STATUS
// ==========================================================

/// The alarm state machine's states.
///
/// Ordering matters: statuses below [`AlarmStatus::Clear`] are internal
/// and never notified, and the hysteresis logic compares statuses to
/// pick the up or down delay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmStatus {
    /// Tombstone for an alarm removed by configuration reload.
    Removed,
    /// The expressions could not produce a verdict this tick.
    Undefined,
    /// The alarm has never been evaluated.
    Uninitialized,
    /// All conditions are off.
    Clear,
    /// The warning condition is raised.
    Warning,
    /// The critical condition is raised.
    Critical,
}

impl AlarmStatus {
    /// Statuses below `Clear` are internal bookkeeping and are never
    /// delivered to the notifier.
    pub fn is_internal(self) -> bool {
        self < AlarmStatus::Clear
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlarmStatus::Removed => "REMOVED",
            AlarmStatus::Undefined => "UNDEFINED",
            AlarmStatus::Uninitialized => "UNINITIALIZED",
            AlarmStatus::Clear => "CLEAR",
            AlarmStatus::Warning => "WARNING",
            AlarmStatus::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

// ==========================================================
// VALUE FORMATTING
// ==========================================================

/// Fixed-precision decimal rendering of an alarm value, as handed to
/// the notifier.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.4}")
    }
}

/// Human-readable value with units, used for the `*_value_string`
/// notifier arguments. NaN renders as `-`.
pub fn format_value_and_units(value: f64, units: &str) -> String {
    if value.is_nan() {
        return "-".to_string();
    }
    if units.is_empty() {
        format!("{value:.2}")
    } else {
        format!("{value:.2} {units}")
    }
}

// ==========================================================
// FLAGS
// ==========================================================

bitflags! {
    /// Configuration-time alarm options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AlarmOptions: u32 {
        /// Do not notify when the alarm returns to clear.
        const NO_CLEAR_NOTIFICATION = 1 << 0;
    }
}

bitflags! {
    /// Runtime alarm flags, refreshed every tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AlarmFlags: u32 {
        /// Eligible for evaluation in the current tick.
        const RUNNABLE = 1 << 0;
        /// Evaluation suppressed by a silencer in disable mode.
        const DISABLED = 1 << 1;
        /// Notifications suppressed by a silencer in silence mode.
        const SILENCED = 1 << 2;
        /// The last database lookup returned an error.
        const DB_ERROR = 1 << 3;
        /// The last database lookup returned no data.
        const DB_NAN = 1 << 4;
        /// The calculation expression failed.
        const CALC_ERROR = 1 << 5;
        /// The warning expression failed.
        const WARN_ERROR = 1 << 6;
        /// The critical expression failed.
        const CRIT_ERROR = 1 << 7;
    }
}

// ==========================================================
// DEFINITIONS
// ==========================================================

/// Database-lookup parameters of an alarm definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbLookup {
    /// Window start relative to now, seconds (usually negative).
    pub after: i64,
    /// Window end relative to now, seconds.
    pub before: i64,
    /// Aggregation over the window.
    pub group: Grouping,
    /// Lookup modifiers.
    pub options: LookupOptions,
}

/// The rule body shared by concrete alarms and templates.
#[derive(Clone)]
pub struct AlarmDefinition {
    /// Alarm name, unique per (host, chart).
    pub name: String,
    /// Where the definition came from, e.g. `health.d/cpu.conf:12`.
    pub source: String,
    /// Units of the alarm value.
    pub units: String,
    /// Human-readable description.
    pub info: String,
    /// Notifier executable override; host default when `None`.
    pub exec: Option<String>,
    /// Recipient override; host default when `None`.
    pub recipient: Option<String>,
    /// Dimension filter for the database lookup.
    pub dimensions: Option<String>,
    /// Database-lookup parameters, when the alarm samples the database.
    pub lookup: Option<DbLookup>,
    /// Value transformation applied after the lookup.
    pub calculation: Option<Arc<dyn Expression>>,
    /// Warning condition.
    pub warning: Option<Arc<dyn Expression>>,
    /// Critical condition.
    pub critical: Option<Arc<dyn Expression>>,
    /// Evaluation cadence, seconds.
    pub update_every: i64,
    /// Base delay before notifying a status escalation, seconds.
    pub delay_up_duration: i64,
    /// Base delay before notifying a status de-escalation, seconds.
    pub delay_down_duration: i64,
    /// Growth factor applied to the delays while the alarm flaps.
    pub delay_multiplier: f64,
    /// Upper bound for either grown delay, seconds.
    pub delay_max_duration: i64,
    /// Re-notification period while warning; 0 disables repeating.
    pub warn_repeat_every: i64,
    /// Re-notification period while critical; 0 disables repeating.
    pub crit_repeat_every: i64,
    /// Configuration-time options.
    pub options: AlarmOptions,
}

impl AlarmDefinition {
    /// A definition with the given name and engine defaults everywhere
    /// else. Callers fill in the fields they need.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: String::new(),
            units: String::new(),
            info: String::new(),
            exec: None,
            recipient: None,
            dimensions: None,
            lookup: None,
            calculation: None,
            warning: None,
            critical: None,
            update_every: 1,
            delay_up_duration: 0,
            delay_down_duration: 0,
            delay_multiplier: 1.0,
            delay_max_duration: 0,
            warn_repeat_every: 0,
            crit_repeat_every: 0,
            options: AlarmOptions::empty(),
        }
    }
}

impl fmt::Debug for AlarmDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmDefinition")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("update_every", &self.update_every)
            .field("has_lookup", &self.lookup.is_some())
            .field("has_calculation", &self.calculation.is_some())
            .field("has_warning", &self.warning.is_some())
            .field("has_critical", &self.critical.is_some())
            .finish_non_exhaustive()
    }
}

/// A concrete alarm definition bound to a chart id.
#[derive(Debug, Clone)]
pub struct AlarmPrototype {
    /// The chart this alarm attaches to.
    pub chart: String,
    /// The rule body.
    pub definition: AlarmDefinition,
}

/// A parameterized definition that materializes on matching charts.
#[derive(Debug, Clone)]
pub struct TemplatePrototype {
    /// Charts with this context get an instance of the template.
    pub context: String,
    /// Optional family filter (simple pattern source text).
    pub families: Option<String>,
    /// The rule body.
    pub definition: AlarmDefinition,
}

// ==========================================================
// RUNTIME STATE
// ==========================================================

/// A live alarm instance.
pub struct Alarm {
    /// Stable id for this (name, chart) identity across reloads.
    pub id: u32,
    /// Next event id, monotonic per alarm.
    pub next_event_id: u32,
    /// The chart id this alarm wants to link to.
    pub chart_id: String,
    /// The linked chart, `None` until a matching chart appears.
    pub chart: Option<SharedChart>,
    /// The rule body.
    pub definition: AlarmDefinition,

    /// Runtime flags, refreshed every tick.
    pub flags: AlarmFlags,
    /// Current status.
    pub status: AlarmStatus,
    /// Status before the last transition.
    pub old_status: AlarmStatus,
    /// Current value (NaN until first evaluated).
    pub value: f64,
    /// Value before the current tick's refresh.
    pub old_value: f64,

    /// When the status last changed, Unix seconds.
    pub last_status_change: i64,
    /// When the alarm was last evaluated, Unix seconds.
    pub last_updated: i64,
    /// When the alarm is next due, Unix seconds.
    pub next_update: i64,

    /// Current escalation delay, seconds.
    pub delay_up_current: i64,
    /// Current de-escalation delay, seconds.
    pub delay_down_current: i64,
    /// The delay applied to the most recent transition.
    pub delay_last: i64,
    /// Until when transition notifications are held back.
    pub delay_up_to_timestamp: i64,

    /// When a repeating alarm last re-notified, Unix seconds.
    pub last_repeat: i64,

    /// Last calculation-expression error, for diagnostics.
    pub calc_error: Option<String>,
    /// Last warning-expression error, surfaced to the notifier.
    pub warn_error: Option<String>,
    /// Last critical-expression error, surfaced to the notifier.
    pub crit_error: Option<String>,
}

impl Alarm {
    /// Instantiate a definition with the given identity.
    pub fn new(id: u32, next_event_id: u32, chart_id: String, definition: AlarmDefinition) -> Self {
        let delay_up = definition.delay_up_duration;
        let delay_down = definition.delay_down_duration;
        Self {
            id,
            next_event_id,
            chart_id,
            chart: None,
            flags: AlarmFlags::empty(),
            status: AlarmStatus::Uninitialized,
            old_status: AlarmStatus::Uninitialized,
            value: f64::NAN,
            old_value: f64::NAN,
            last_status_change: 0,
            last_updated: 0,
            next_update: 0,
            delay_up_current: delay_up,
            delay_down_current: delay_down,
            delay_last: 0,
            delay_up_to_timestamp: 0,
            last_repeat: 0,
            calc_error: None,
            warn_error: None,
            crit_error: None,
            definition,
        }
    }

    /// Shorthand for the definition's name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether the alarm re-notifies periodically while raised.
    pub fn is_repeating(&self) -> bool {
        self.definition.warn_repeat_every > 0 || self.definition.crit_repeat_every > 0
    }

    /// Whether the alarm samples the database each tick.
    pub fn has_lookup(&self) -> bool {
        self.definition.lookup.is_some()
    }

    /// Take the next event id for a new log entry.
    pub fn take_event_id(&mut self) -> u32 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// The linked chart's family, empty when unlinked.
    pub fn family(&self) -> String {
        self.chart
            .as_ref()
            .map(|c| c.read().family.clone())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alarm")
            .field("id", &self.id)
            .field("name", &self.definition.name)
            .field("chart", &self.chart_id)
            .field("status", &self.status)
            .field("value", &self.value)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

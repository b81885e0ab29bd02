// src/lib.rs
#![warn(missing_docs)]

//! VIGIL - a health evaluation and alarm notification engine.
//!
//! A long-running supervisor that periodically evaluates alarm
//! definitions against a time-series database, drives each alarm's
//! state machine (clear / warning / critical), records transitions in a
//! bounded per-host log, and dispatches notifications through an
//! external notifier program. Silencing, hysteresis, repeating
//! notifications, suspension detection, and hot configuration reload
//! are built in.
//!
//! The database, the expression compiler, the definition parser, and
//! the notifier are external collaborators behind traits
//! ([`MetricsBackend`], [`Expression`], [`DefinitionSource`],
//! [`Notifier`]); everything else lives here.

pub mod alarm;
pub mod alarm_log;
pub mod backend;
pub mod chart;
pub mod clock;
pub mod config;
mod dispatch;
pub mod engine;
pub mod error;
mod eval;
pub mod expr;
pub mod host;
pub mod notify;
pub mod reload;
pub mod silencers;
mod transition;

// Re-exports for convenience
pub use alarm::{Alarm, AlarmDefinition, AlarmPrototype, AlarmStatus, TemplatePrototype};
pub use alarm_log::{AlarmEntry, AlarmLog, EntryFlags};
pub use backend::{LookupOutcome, LookupRequest, MetricsBackend};
pub use chart::Chart;
pub use clock::{Clock, SuspensionDetector, SystemClock};
pub use config::HealthConfig;
pub use engine::{EngineStats, HealthEngine, ShutdownHandle};
pub use error::{HealthError, Result};
pub use expr::{ExprEnv, Expression};
pub use host::{Host, HostRegistry};
pub use notify::{ExecNotifier, Notifier};
pub use reload::{DefinitionSource, EmptyDefinitions, HostDefinitions};
pub use silencers::{SilenceType, Silencer, SilencerSpec, SilencerStore};

/// Crate version, straight from the manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// src/silencers.rs
//! Silencers: runtime suppression of alarm evaluation or notification.
//!
//! A silencer is a set of optional patterns over alarm name, chart,
//! context, host, and family. The store holds an ordered rule list
//! plus a global mode: `SILENCE` keeps evaluating matching alarms but
//! drops their notifications, `DISABLE` skips evaluating them at all.
//! The store is loaded from a JSON file at startup and mutated at
//! runtime through the command API methods.

use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alarm::{Alarm, AlarmFlags};
use crate::error::{HealthError, Result};

/// Upper bound for the silencers file size, bytes.
pub const SILENCERS_MAX_FILE_LEN: u64 = 16 * 1024;

/// What a silencer match does to an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SilenceType {
    /// Rules have no effect.
    #[serde(rename = "NONE")]
    None,
    /// Matching alarms are evaluated but not notified.
    #[serde(rename = "SILENCE")]
    SilenceNotifications,
    /// Matching alarms are not evaluated at all.
    #[serde(rename = "DISABLE")]
    DisableAlarms,
}

impl Default for SilenceType {
    fn default() -> Self {
        SilenceType::None
    }
}

// ==========================================================
// PATTERNS
// ==========================================================

/// A whitespace-separated list of glob terms, each optionally negated
/// with a leading `!`. The first term that matches decides the result.
#[derive(Debug, Clone)]
pub struct SimplePattern {
    raw: String,
    terms: Vec<(bool, glob::Pattern)>,
}

impl SimplePattern {
    /// Compile a pattern string.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for word in raw.split_whitespace() {
            let (negative, text) = match word.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, word),
            };
            let pattern = glob::Pattern::new(text).map_err(|e| HealthError::Pattern {
                pattern: raw.to_string(),
                reason: e.to_string(),
            })?;
            terms.push((negative, pattern));
        }
        Ok(Self {
            raw: raw.to_string(),
            terms,
        })
    }

    /// Whether the text matches; negated terms reject on match.
    pub fn matches(&self, text: &str) -> bool {
        for (negative, pattern) in &self.terms {
            if pattern.matches(text) {
                return !negative;
            }
        }
        false
    }

    /// The original pattern text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

// ==========================================================
// SILENCERS
// ==========================================================

/// The on-disk / command-API shape of one silencer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilencerSpec {
    /// Pattern over alarm names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<String>,
    /// Pattern over chart ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    /// Pattern over chart contexts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Pattern over hostnames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<String>,
    /// Pattern over chart families.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub families: Option<String>,
}

/// The fields of an alarm instance a silencer is matched against.
#[derive(Debug, Clone, Copy)]
pub struct SilenceProbe<'a> {
    /// Alarm name.
    pub alarm: &'a str,
    /// Chart id the alarm is attached to.
    pub chart: &'a str,
    /// Chart context, absent when the alarm is not linked.
    pub context: Option<&'a str>,
    /// Chart family, absent when the alarm is not linked.
    pub family: Option<&'a str>,
    /// The owning host's name.
    pub host: &'a str,
}

/// A compiled silencer rule.
#[derive(Debug, Clone)]
pub struct Silencer {
    spec: SilencerSpec,
    alarms: Option<SimplePattern>,
    charts: Option<SimplePattern>,
    contexts: Option<SimplePattern>,
    hosts: Option<SimplePattern>,
    families: Option<SimplePattern>,
}

impl Silencer {
    /// Compile a spec; fails on an invalid glob.
    pub fn new(spec: SilencerSpec) -> Result<Self> {
        fn compile(field: &Option<String>) -> Result<Option<SimplePattern>> {
            field.as_deref().map(SimplePattern::parse).transpose()
        }
        Ok(Self {
            alarms: compile(&spec.alarm)?,
            charts: compile(&spec.chart)?,
            contexts: compile(&spec.context)?,
            hosts: compile(&spec.hosts)?,
            families: compile(&spec.families)?,
            spec,
        })
    }

    /// The spec this rule was compiled from.
    pub fn spec(&self) -> &SilencerSpec {
        &self.spec
    }

    /// Every provided pattern must match its field; absent patterns act
    /// as wildcards. A pattern over a field the probe cannot provide
    /// (context or family of an unlinked alarm) never matches.
    pub fn matches(&self, probe: &SilenceProbe<'_>) -> bool {
        let field = |p: &Option<SimplePattern>, text: Option<&str>| -> bool {
            match p {
                None => true,
                Some(pattern) => text.map_or(false, |t| pattern.matches(t)),
            }
        };

        field(&self.alarms, Some(probe.alarm))
            && field(&self.charts, Some(probe.chart))
            && field(&self.contexts, probe.context)
            && field(&self.hosts, Some(probe.host))
            && field(&self.families, probe.family)
    }
}

// ==========================================================
// STORE
// ==========================================================

/// The on-disk shape of the silencers file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SilencersFile {
    /// Apply the mode to every alarm, ignoring the rule list.
    #[serde(default)]
    pub all_alarms: bool,
    /// The store mode.
    #[serde(default, rename = "type")]
    pub stype: SilenceType,
    /// The rule list, in match order.
    #[serde(default)]
    pub silencers: Vec<SilencerSpec>,
}

#[derive(Debug, Default)]
struct SilencerState {
    all_alarms: bool,
    stype: SilenceType,
    rules: Vec<Silencer>,
}

/// The shared silencer store.
///
/// Reads happen on every alarm every tick; mutations come from the
/// command API and from the one-time file load. Interior locking keeps
/// the store freely shareable between the engine task and the command
/// task.
#[derive(Debug, Default)]
pub struct SilencerStore {
    state: RwLock<SilencerState>,
}

impl SilencerStore {
    /// An empty store with mode `NONE`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the JSON silencers file, replacing the current state.
    ///
    /// Enforces the documented size window: an empty or oversized file
    /// is rejected.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let meta = fs::metadata(path)?;
        if meta.len() == 0 || meta.len() > SILENCERS_MAX_FILE_LEN {
            return Err(HealthError::Silencers(format!(
                "file {} has size {} out of range [1, {}]",
                path.display(),
                meta.len(),
                SILENCERS_MAX_FILE_LEN
            )));
        }

        let text = fs::read_to_string(path)?;
        let file: SilencersFile = serde_json::from_str(&text)?;
        self.install(file)?;
        info!(file = %path.display(), "loaded health silencers file");
        Ok(())
    }

    /// Replace the store state from a parsed file shape.
    pub fn install(&self, file: SilencersFile) -> Result<()> {
        let rules = file
            .silencers
            .into_iter()
            .map(Silencer::new)
            .collect::<Result<Vec<_>>>()?;
        let mut state = self.state.write();
        state.all_alarms = file.all_alarms;
        state.stype = file.stype;
        state.rules = rules;
        Ok(())
    }

    /// Snapshot the state in the file shape (command API introspection).
    pub fn snapshot(&self) -> SilencersFile {
        let state = self.state.read();
        SilencersFile {
            all_alarms: state.all_alarms,
            stype: state.stype,
            silencers: state.rules.iter().map(|r| r.spec.clone()).collect(),
        }
    }

    /// Whether every alarm is currently disabled (`DISABLE ALL`).
    pub fn all_disabled(&self) -> bool {
        let state = self.state.read();
        state.all_alarms && state.stype == SilenceType::DisableAlarms
    }

    /// Classify one alarm instance: the store mode when `all_alarms` is
    /// set, otherwise the mode on the first matching rule, otherwise
    /// `NONE`.
    pub fn classify(&self, probe: &SilenceProbe<'_>) -> SilenceType {
        let state = self.state.read();
        if state.all_alarms {
            return state.stype;
        }
        for rule in &state.rules {
            if rule.matches(probe) {
                debug!(alarm = probe.alarm, "alarm matches a silencer rule");
                return state.stype;
            }
        }
        SilenceType::None
    }

    /// Refresh an alarm's `DISABLED`/`SILENCED` flags from the store.
    ///
    /// Returns true when the alarm ends up disabled, in which case the
    /// caller skips evaluating it this tick.
    pub fn update_alarm(&self, hostname: &str, alarm: &mut Alarm) -> bool {
        let old = alarm.flags & (AlarmFlags::DISABLED | AlarmFlags::SILENCED);
        alarm.flags.remove(AlarmFlags::DISABLED | AlarmFlags::SILENCED);

        let (context, family) = match alarm.chart.as_ref() {
            Some(chart) => {
                let chart = chart.read();
                (Some(chart.context.clone()), Some(chart.family.clone()))
            }
            None => (None, None),
        };
        let probe = SilenceProbe {
            alarm: &alarm.definition.name,
            chart: &alarm.chart_id,
            context: context.as_deref(),
            family: family.as_deref(),
            host: hostname,
        };

        match self.classify(&probe) {
            SilenceType::DisableAlarms => alarm.flags.insert(AlarmFlags::DISABLED),
            SilenceType::SilenceNotifications => alarm.flags.insert(AlarmFlags::SILENCED),
            SilenceType::None => {}
        }

        let new = alarm.flags & (AlarmFlags::DISABLED | AlarmFlags::SILENCED);
        if old != new {
            info!(
                host = hostname,
                alarm = %alarm.definition.name,
                disabled = alarm.flags.contains(AlarmFlags::DISABLED),
                silenced = alarm.flags.contains(AlarmFlags::SILENCED),
                "alarm silencing changed"
            );
        }

        alarm.flags.contains(AlarmFlags::DISABLED)
    }

    // ------------------------------------------------------
    // command API
    // ------------------------------------------------------

    /// `DISABLE ALL`: stop evaluating every alarm.
    pub fn disable_all(&self) {
        let mut state = self.state.write();
        state.all_alarms = true;
        state.stype = SilenceType::DisableAlarms;
    }

    /// `SILENCE ALL`: stop notifying for every alarm.
    pub fn silence_all(&self) {
        let mut state = self.state.write();
        state.all_alarms = true;
        state.stype = SilenceType::SilenceNotifications;
    }

    /// `RESET`: drop every rule and return to mode `NONE`.
    pub fn reset(&self) {
        *self.state.write() = SilencerState::default();
    }

    /// Set the store mode without touching the rule list.
    pub fn set_mode(&self, stype: SilenceType) {
        self.state.write().stype = stype;
    }

    /// Append a rule to the match list.
    pub fn add(&self, spec: SilencerSpec) -> Result<()> {
        let rule = Silencer::new(spec)?;
        self.state.write().rules.push(rule);
        Ok(())
    }

    /// Remove rules with exactly this spec; returns how many went away.
    pub fn remove(&self, spec: &SilencerSpec) -> usize {
        let mut state = self.state.write();
        let before = state.rules.len();
        state.rules.retain(|r| &r.spec != spec);
        before - state.rules.len()
    }
}

// src/alarm_log.rs
//! The per-host alarm log.
//!
//! A bounded, newest-first sequence of state-transition entries. The
//! transition engine appends, the dispatcher scans and flags, and
//! eviction trims the tail when the bound is exceeded. Every entry can
//! additionally be persisted to an append-only JSON-lines file; that
//! file is write-only here (replaying it is a different subsystem's
//! concern).

use std::collections::{HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use bitflags::bitflags;
use serde::{Serialize, Serializer};
use tracing::{debug, error};

use crate::alarm::{format_value_and_units, Alarm, AlarmOptions, AlarmStatus};
use crate::error::Result;

bitflags! {
    /// Lifecycle flags of a log entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        /// The dispatcher has looked at this entry.
        const PROCESSED = 1 << 0;
        /// Superseded by a newer entry (or invalidated by reload);
        /// never notified.
        const UPDATED = 1 << 1;
        /// The notifier was invoked for this entry.
        const EXEC_RUN = 1 << 2;
        /// The notifier exited non-zero.
        const EXEC_FAILED = 1 << 3;
        /// The alarm asked not to be notified on return to clear.
        const NO_CLEAR_NOTIFICATION = 1 << 4;
        /// A silencer suppressed this entry's notification.
        const SILENCED = 1 << 5;
    }
}

fn flags_as_bits<S: Serializer>(flags: &EntryFlags, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u32(flags.bits())
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmEntry {
    /// Host-wide monotonic id; strictly decreasing toward older entries.
    pub unique_id: u32,
    /// The alarm this entry belongs to.
    pub alarm_id: u32,
    /// The alarm's own event counter.
    pub alarm_event_id: u32,
    /// When the transition happened, Unix seconds.
    pub when: i64,
    /// Seconds spent in the prior status.
    pub duration: i64,
    /// Accumulated seconds in non-clear statuses.
    pub non_clear_duration: i64,
    /// Alarm name.
    pub name: String,
    /// Chart id, empty when the alarm was unlinked.
    pub chart: String,
    /// Chart family.
    pub family: String,
    /// Definition source descriptor.
    pub source: String,
    /// Units of the values.
    pub units: String,
    /// Human-readable alarm description.
    pub info: String,
    /// Notifier executable override.
    pub exec: Option<String>,
    /// Recipient override.
    pub recipient: Option<String>,
    /// Value before the transition.
    pub old_value: f64,
    /// Value after the transition.
    pub new_value: f64,
    /// Rendered `old_value` with units.
    pub old_value_string: String,
    /// Rendered `new_value` with units.
    pub new_value_string: String,
    /// Status before the transition.
    pub old_status: AlarmStatus,
    /// Status after the transition.
    pub new_status: AlarmStatus,
    /// Hysteresis delay applied to this transition, seconds.
    pub delay: i64,
    /// Notifications for this entry are held back until then.
    pub delay_up_to_timestamp: i64,
    /// Repeating-alarm bookkeeping carried for the notifier.
    pub last_repeat: i64,
    /// Lifecycle flags.
    #[serde(serialize_with = "flags_as_bits")]
    pub flags: EntryFlags,
    /// Notifier exit code, 0 until it ran.
    pub exec_code: i32,
    /// When the notifier ran, Unix seconds, 0 until it ran.
    pub exec_run_timestamp: i64,
}

impl AlarmEntry {
    /// Build an entry for a transition of `alarm` from `old_status` to
    /// `new_status` at `when`. `unique_id` comes from the host counter.
    pub fn from_alarm(
        unique_id: u32,
        alarm: &mut Alarm,
        when: i64,
        old_status: AlarmStatus,
        new_status: AlarmStatus,
    ) -> Self {
        let duration = when - alarm.last_status_change;
        let non_clear_duration = match old_status {
            AlarmStatus::Warning | AlarmStatus::Critical => duration,
            _ => 0,
        };

        let mut flags = EntryFlags::empty();
        if alarm
            .definition
            .options
            .contains(AlarmOptions::NO_CLEAR_NOTIFICATION)
        {
            flags |= EntryFlags::NO_CLEAR_NOTIFICATION;
        }
        if alarm.flags.contains(crate::alarm::AlarmFlags::SILENCED) {
            flags |= EntryFlags::SILENCED;
        }

        let units = alarm.definition.units.clone();
        Self {
            unique_id,
            alarm_id: alarm.id,
            alarm_event_id: alarm.take_event_id(),
            when,
            duration,
            non_clear_duration,
            name: alarm.definition.name.clone(),
            chart: alarm.chart_id.clone(),
            family: alarm.family(),
            source: alarm.definition.source.clone(),
            info: alarm.definition.info.clone(),
            exec: alarm.definition.exec.clone(),
            recipient: alarm.definition.recipient.clone(),
            old_value: alarm.old_value,
            new_value: alarm.value,
            old_value_string: format_value_and_units(alarm.old_value, &units),
            new_value_string: format_value_and_units(alarm.value, &units),
            units,
            old_status,
            new_status,
            delay: alarm.delay_last,
            delay_up_to_timestamp: alarm.delay_up_to_timestamp,
            last_repeat: alarm.last_repeat,
            flags,
            exec_code: 0,
            exec_run_timestamp: 0,
        }
    }
}

/// The bounded per-host log, newest entry first.
pub struct AlarmLog {
    entries: VecDeque<AlarmEntry>,
    max: usize,
    writer: Option<File>,
}

impl AlarmLog {
    /// An in-memory log bounded to `max` entries.
    pub fn new(max: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max: max.max(1),
            writer: None,
        }
    }

    /// A log that additionally appends every saved entry to `path` as
    /// JSON lines.
    pub fn with_persistence(max: usize, path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut log = Self::new(max);
        log.writer = Some(file);
        Ok(log)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The configured bound.
    pub fn max(&self) -> usize {
        self.max
    }

    /// The newest entry's unique id, if any.
    pub fn head_unique_id(&self) -> Option<u32> {
        self.entries.front().map(|e| e.unique_id)
    }

    /// Entries newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &AlarmEntry> {
        self.entries.iter()
    }

    /// Find an entry by unique id.
    pub fn find(&self, unique_id: u32) -> Option<&AlarmEntry> {
        self.entries.iter().find(|e| e.unique_id == unique_id)
    }

    /// Find an entry by unique id, mutably.
    pub fn find_mut(&mut self, unique_id: u32) -> Option<&mut AlarmEntry> {
        self.entries.iter_mut().find(|e| e.unique_id == unique_id)
    }

    /// Append a new entry at the head.
    ///
    /// Older entries of the same alarm that are still pending are
    /// marked `UPDATED` so only the newest transition gets notified;
    /// while both transitions stayed within warning/critical, the
    /// superseded entry's non-clear time is carried forward. The walk
    /// stops at the first already-superseded entry of the alarm.
    pub fn append(&mut self, mut entry: AlarmEntry) {
        for older in self.entries.iter_mut() {
            if older.alarm_id != entry.alarm_id {
                continue;
            }
            if older.flags.contains(EntryFlags::UPDATED) {
                break;
            }
            older.flags.insert(EntryFlags::UPDATED);
            let non_clear = |s: AlarmStatus| {
                matches!(s, AlarmStatus::Warning | AlarmStatus::Critical)
            };
            if non_clear(older.new_status) && non_clear(older.old_status) {
                entry.non_clear_duration += older.non_clear_duration;
            }
        }

        debug!(
            unique_id = entry.unique_id,
            alarm = %entry.name,
            old = %entry.old_status,
            new = %entry.new_status,
            "alarm log entry added"
        );
        self.entries.push_front(entry);
    }

    /// Trim the log when it exceeds the bound.
    ///
    /// Keeps the newest `floor(2*max/3)` entries. Entries whose alarm is
    /// currently repeating stay in the log regardless, since they carry
    /// that alarm's in-flight notification state. Returns the number of
    /// evicted entries.
    pub fn evict(&mut self, repeating_alarm_ids: &HashSet<u32>) -> usize {
        if self.entries.len() <= self.max {
            return 0;
        }

        let keep = self.max * 2 / 3;
        let tail = self.entries.split_off(keep);
        let mut evicted = 0;
        for entry in tail {
            if repeating_alarm_ids.contains(&entry.alarm_id) {
                self.entries.push_back(entry);
            } else {
                debug!(unique_id = entry.unique_id, "evicting alarm log entry");
                evicted += 1;
            }
        }
        evicted
    }

    /// The newest entry older than `unique_id` for `alarm_id` that ran
    /// the notifier, and its status. This is what same-status
    /// suppression keys on.
    pub fn prior_exec_status(&self, unique_id: u32, alarm_id: u32) -> Option<AlarmStatus> {
        self.entries
            .iter()
            .skip_while(|e| e.unique_id >= unique_id)
            .find(|e| e.alarm_id == alarm_id && e.flags.contains(EntryFlags::EXEC_RUN))
            .map(|e| e.new_status)
    }

    /// Persist one entry to the log file, when persistence is on.
    /// Failures are logged and swallowed: losing a log line never stops
    /// the engine.
    pub fn save(&mut self, entry: &AlarmEntry) {
        let Some(file) = self.writer.as_mut() else {
            return;
        };
        let result = serde_json::to_string(entry)
            .map_err(std::io::Error::other)
            .and_then(|line| writeln!(file, "{line}"));
        if let Err(e) = result {
            error!(unique_id = entry.unique_id, error = %e, "cannot persist alarm log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmDefinition;

    fn entry(unique_id: u32, alarm_id: u32, old: AlarmStatus, new: AlarmStatus) -> AlarmEntry {
        let mut alarm = Alarm::new(alarm_id, 1, "system.cpu".into(), AlarmDefinition::new("a"));
        alarm.status = old;
        AlarmEntry::from_alarm(unique_id, &mut alarm, 100, old, new)
    }

    #[test]
    fn unique_ids_strictly_decrease_toward_older_entries() {
        let mut log = AlarmLog::new(10);
        for id in 1..=5 {
            log.append(entry(id, 1, AlarmStatus::Clear, AlarmStatus::Warning));
        }
        let ids: Vec<u32> = log.iter().map(|e| e.unique_id).collect();
        assert_eq!(ids, vec![5, 4, 3, 2, 1]);
        assert_eq!(log.head_unique_id(), Some(5));
    }

    #[test]
    fn append_supersedes_pending_entries_of_the_same_alarm() {
        let mut log = AlarmLog::new(10);
        log.append(entry(1, 7, AlarmStatus::Clear, AlarmStatus::Warning));
        log.append(entry(2, 9, AlarmStatus::Clear, AlarmStatus::Warning));
        log.append(entry(3, 7, AlarmStatus::Warning, AlarmStatus::Clear));

        assert!(log.find(1).unwrap().flags.contains(EntryFlags::UPDATED));
        assert!(!log.find(2).unwrap().flags.contains(EntryFlags::UPDATED));
        assert!(!log.find(3).unwrap().flags.contains(EntryFlags::UPDATED));
    }

    #[test]
    fn non_clear_duration_accumulates_across_raised_transitions() {
        let mut log = AlarmLog::new(10);

        let mut first = entry(1, 7, AlarmStatus::Warning, AlarmStatus::Critical);
        first.non_clear_duration = 30;
        log.append(first);

        let mut second = entry(2, 7, AlarmStatus::Critical, AlarmStatus::Warning);
        second.non_clear_duration = 10;
        log.append(second);

        assert_eq!(log.find(2).unwrap().non_clear_duration, 40);
    }

    #[test]
    fn eviction_keeps_the_newest_two_thirds() {
        let mut log = AlarmLog::new(100);
        for id in 1..=150 {
            log.append(entry(id, 1, AlarmStatus::Clear, AlarmStatus::Warning));
        }
        let evicted = log.evict(&HashSet::new());

        assert_eq!(evicted, 150 - 66);
        assert_eq!(log.len(), 66);
        let ids: Vec<u32> = log.iter().map(|e| e.unique_id).collect();
        assert_eq!(ids.first(), Some(&150));
        assert_eq!(ids.last(), Some(&85));
    }

    #[test]
    fn eviction_retains_entries_of_repeating_alarms() {
        let mut log = AlarmLog::new(3);
        log.append(entry(1, 42, AlarmStatus::Clear, AlarmStatus::Warning));
        for id in 2..=5 {
            log.append(entry(id, 1, AlarmStatus::Clear, AlarmStatus::Warning));
        }

        let repeating: HashSet<u32> = [42].into_iter().collect();
        log.evict(&repeating);

        assert!(log.find(1).is_some());
        let ids: Vec<u32> = log.iter().map(|e| e.unique_id).collect();
        assert_eq!(ids, vec![5, 4, 1]);
    }

    #[test]
    fn eviction_is_a_no_op_under_the_bound() {
        let mut log = AlarmLog::new(10);
        for id in 1..=10 {
            log.append(entry(id, 1, AlarmStatus::Clear, AlarmStatus::Warning));
        }
        assert_eq!(log.evict(&HashSet::new()), 0);
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn prior_exec_status_walks_older_entries_only() {
        let mut log = AlarmLog::new(10);
        let mut first = entry(1, 7, AlarmStatus::Clear, AlarmStatus::Warning);
        first.flags.insert(EntryFlags::EXEC_RUN);
        log.append(first);
        log.append(entry(2, 8, AlarmStatus::Clear, AlarmStatus::Warning));
        let mut third = entry(3, 7, AlarmStatus::Warning, AlarmStatus::Clear);
        third.flags.insert(EntryFlags::EXEC_RUN);
        log.append(third);
        log.append(entry(4, 7, AlarmStatus::Clear, AlarmStatus::Warning));

        assert_eq!(log.prior_exec_status(4, 7), Some(AlarmStatus::Clear));
        assert_eq!(log.prior_exec_status(3, 7), Some(AlarmStatus::Warning));
        assert_eq!(log.prior_exec_status(1, 7), None);
        assert_eq!(log.prior_exec_status(2, 8), None);
    }

    #[test]
    fn persistence_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health-log.ndjson");
        let mut log = AlarmLog::with_persistence(10, &path).unwrap();

        let e = entry(1, 1, AlarmStatus::Clear, AlarmStatus::Warning);
        log.append(e.clone());
        log.save(&e);
        log.save(&e);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"new_status\":\"WARNING\""));
    }
}

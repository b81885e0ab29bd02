// src/dispatch.rs
//! The notification dispatcher.
//!
//! Walks the alarm log for entries that still need a decision, applies
//! the suppression rules, and runs the notifier for the survivors. The
//! log lock is only held to read snapshots and write flags back; the
//! subprocess runs with no per-host lock held.

use std::sync::atomic::Ordering;

use tracing::{debug, error};

use crate::alarm::AlarmStatus;
use crate::alarm_log::{AlarmEntry, EntryFlags};
use crate::host::Host;
use crate::notify::{build_argv, NotificationContext, Notifier};

/// Why an entry is not notified, or `None` to run the notifier.
pub(crate) fn suppression_reason(
    entry: &AlarmEntry,
    prior_exec_status: Option<AlarmStatus>,
) -> Option<&'static str> {
    if entry.new_status.is_internal() {
        return Some("internal status");
    }

    if entry.new_status == AlarmStatus::Clear
        && entry.flags.contains(EntryFlags::NO_CLEAR_NOTIFICATION)
    {
        return Some("no-clear-notification is set");
    }

    if !entry.flags.contains(EntryFlags::NO_CLEAR_NOTIFICATION) {
        match prior_exec_status {
            // The previous notification reported the same status.
            Some(status) if status == entry.new_status => {
                return Some("same status was already notified");
            }
            // Never notified before, and the first event is a clear.
            None if entry.new_status == AlarmStatus::Clear => {
                return Some("first transition of the alarm is clear");
            }
            _ => {}
        }
    }

    if entry.flags.contains(EntryFlags::SILENCED) {
        return Some("notifications are silenced");
    }

    None
}

/// Host-wide aggregates the notifier receives: counts of currently
/// warning/critical alarms, and the source/error of the expression that
/// produced this entry's status.
async fn host_aggregates(
    host: &Host,
    entry: &AlarmEntry,
) -> (usize, usize, Option<String>, Option<String>) {
    let book = host.book.read().await;

    let mut n_warn = 0;
    let mut n_crit = 0;
    let mut expr_source = None;
    let mut expr_error = None;

    for alarm in &book.alarms {
        let collected = alarm
            .chart
            .as_ref()
            .map(|c| c.read().last_collected != 0)
            .unwrap_or(false);
        if !collected {
            continue;
        }

        // A clear alarm reports its warning expression: that is the
        // condition whose release produced the clear.
        let selected = match alarm.status {
            AlarmStatus::Warning => {
                n_warn += 1;
                Some((&alarm.definition.warning, &alarm.warn_error))
            }
            AlarmStatus::Critical => {
                n_crit += 1;
                Some((&alarm.definition.critical, &alarm.crit_error))
            }
            AlarmStatus::Clear => Some((&alarm.definition.warning, &alarm.warn_error)),
            _ => None,
        };

        if alarm.id == entry.alarm_id {
            if let Some((expr, last_error)) = selected {
                expr_source = expr
                    .as_ref()
                    .map(|e| e.source().to_string())
                    .filter(|s| !s.is_empty());
                expr_error = last_error.clone();
            }
        }
    }

    (n_warn, n_crit, expr_source, expr_error)
}

/// Run the dispatcher for one entry.
///
/// The entry is always marked processed. When no suppression rule
/// applies, the notifier runs and the execution outcome is recorded on
/// the entry; returns whether it ran. The caller persists the entry
/// afterwards.
pub(crate) async fn execute(
    host: &Host,
    notifier: &dyn Notifier,
    entry: &mut AlarmEntry,
    prior_exec_status: Option<AlarmStatus>,
    now: i64,
) -> bool {
    entry.flags.insert(EntryFlags::PROCESSED);

    if let Some(reason) = suppression_reason(entry, prior_exec_status) {
        debug!(
            host = %host.hostname,
            alarm = %entry.name,
            status = %entry.new_status,
            reason,
            "not sending notification"
        );
        return false;
    }

    let (n_warn, n_crit, expr_source, expr_error) = host_aggregates(host, entry).await;

    let ctx = NotificationContext {
        exec: entry
            .exec
            .clone()
            .unwrap_or_else(|| host.default_exec.clone()),
        recipient: entry
            .recipient
            .clone()
            .unwrap_or_else(|| host.default_recipient.clone()),
        hostname: host.hostname.clone(),
        expr_source,
        expr_error,
        n_warn,
        n_crit,
    };
    let argv = build_argv(entry, &ctx);

    entry.flags.insert(EntryFlags::EXEC_RUN);
    entry.exec_run_timestamp = now;

    match notifier.notify(&argv).await {
        Ok(code) => {
            entry.exec_code = code;
            if code != 0 {
                entry.flags.insert(EntryFlags::EXEC_FAILED);
            }
            debug!(
                host = %host.hostname,
                alarm = %entry.name,
                code,
                "notifier finished"
            );
        }
        Err(e) => {
            error!(host = %host.hostname, alarm = %entry.name, error = %e, "notifier failed to run");
        }
    }
    true
}

/// Dispatch an ephemeral (repeating-alarm) entry. It carries no log
/// history, so suppression sees no prior notification; afterwards the
/// entry is persisted and dropped, never linked into the log.
pub(crate) async fn execute_ephemeral(
    host: &Host,
    notifier: &dyn Notifier,
    mut entry: AlarmEntry,
    now: i64,
) -> bool {
    let ran = execute(host, notifier, &mut entry, None, now).await;
    host.log.write().save(&entry);
    ran
}

/// Process one host's alarm log: dispatch pending entries whose delay
/// elapsed, advance the cursor, then evict excess entries. Returns how
/// many notifier invocations ran.
pub(crate) async fn process_host_log(host: &Host, notifier: &dyn Notifier, now: i64) -> usize {
    let repeating = host.book.read().await.repeating_ids();

    let cursor = host.last_processed_id.load(Ordering::Relaxed);
    let (first_waiting, candidates) = {
        let log = host.log.read();
        let mut first_waiting = log.head_unique_id().unwrap_or(0);
        let mut candidates = Vec::new();

        for entry in log.iter() {
            if entry.unique_id < cursor {
                break;
            }
            if repeating.contains(&entry.alarm_id) {
                continue;
            }
            if entry.flags.contains(EntryFlags::PROCESSED)
                || entry.flags.contains(EntryFlags::UPDATED)
            {
                continue;
            }
            if entry.unique_id < first_waiting {
                first_waiting = entry.unique_id;
            }
            if now >= entry.delay_up_to_timestamp {
                candidates.push(entry.unique_id);
            }
        }
        (first_waiting, candidates)
    };

    // Remember where to resume the scan next tick.
    host.last_processed_id.store(first_waiting, Ordering::Relaxed);

    let mut sent = 0;
    for unique_id in candidates {
        let (mut snapshot, prior) = {
            let log = host.log.read();
            let Some(entry) = log.find(unique_id) else {
                continue;
            };
            (entry.clone(), log.prior_exec_status(unique_id, entry.alarm_id))
        };

        if execute(host, notifier, &mut snapshot, prior, now).await {
            sent += 1;
        }

        let mut log = host.log.write();
        if let Some(entry) = log.find_mut(unique_id) {
            entry.flags = snapshot.flags;
            entry.exec_code = snapshot.exec_code;
            entry.exec_run_timestamp = snapshot.exec_run_timestamp;
        }
        log.save(&snapshot);
    }

    let evicted = host.log.write().evict(&repeating);
    if evicted > 0 {
        debug!(host = %host.hostname, evicted, "alarm log trimmed");
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{Alarm, AlarmDefinition};

    fn entry(old: AlarmStatus, new: AlarmStatus, flags: EntryFlags) -> AlarmEntry {
        let mut alarm = Alarm::new(1, 1, "system.cpu".into(), AlarmDefinition::new("a"));
        alarm.status = old;
        let mut e = AlarmEntry::from_alarm(1, &mut alarm, 100, old, new);
        e.flags = flags;
        e
    }

    #[test]
    fn internal_statuses_are_never_notified() {
        for status in [
            AlarmStatus::Removed,
            AlarmStatus::Undefined,
            AlarmStatus::Uninitialized,
        ] {
            let e = entry(AlarmStatus::Clear, status, EntryFlags::empty());
            assert!(suppression_reason(&e, None).is_some());
        }
    }

    #[test]
    fn clear_with_no_clear_notification_is_suppressed() {
        let e = entry(
            AlarmStatus::Warning,
            AlarmStatus::Clear,
            EntryFlags::NO_CLEAR_NOTIFICATION,
        );
        assert!(suppression_reason(&e, Some(AlarmStatus::Warning)).is_some());
    }

    #[test]
    fn raise_with_no_clear_notification_still_notifies() {
        let e = entry(
            AlarmStatus::Clear,
            AlarmStatus::Warning,
            EntryFlags::NO_CLEAR_NOTIFICATION,
        );
        assert!(suppression_reason(&e, Some(AlarmStatus::Warning)).is_none());
    }

    #[test]
    fn same_status_repeat_is_suppressed() {
        let e = entry(AlarmStatus::Warning, AlarmStatus::Warning, EntryFlags::empty());
        assert!(suppression_reason(&e, Some(AlarmStatus::Warning)).is_some());
        assert!(suppression_reason(&e, Some(AlarmStatus::Clear)).is_none());
    }

    #[test]
    fn first_ever_clear_is_suppressed() {
        let e = entry(AlarmStatus::Uninitialized, AlarmStatus::Clear, EntryFlags::empty());
        assert!(suppression_reason(&e, None).is_some());
        assert!(suppression_reason(&e, Some(AlarmStatus::Warning)).is_none());
    }

    #[test]
    fn silenced_entries_are_suppressed() {
        let e = entry(AlarmStatus::Clear, AlarmStatus::Warning, EntryFlags::SILENCED);
        assert!(suppression_reason(&e, None).is_some());
    }
}

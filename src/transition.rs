// src/transition.rs
//! The decide phase: warning/critical evaluation, status composition,
//! hysteresis, and repeating-alarm entries.
//!
//! The evaluator refreshed `value`; this phase turns it into a status
//! and, on change, a log entry. Hysteresis grows the notification delay
//! multiplicatively while an alarm flaps, and resets once the flap
//! window expires.

use tracing::debug;

use crate::alarm::{Alarm, AlarmFlags, AlarmStatus};
use crate::alarm_log::AlarmEntry;
use crate::eval::env_for;
use crate::host::Host;

/// Outcome of one warning/critical expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExprVerdict {
    /// The expression failed, was absent, or produced NaN/inf.
    Undefined,
    /// The condition evaluated to zero.
    Clear,
    /// The condition evaluated to a finite non-zero number.
    Raised,
}

/// Map an expression result to a verdict.
pub(crate) fn verdict(value: f64) -> ExprVerdict {
    if value.is_nan() || value.is_infinite() {
        ExprVerdict::Undefined
    } else if value != 0.0 {
        ExprVerdict::Raised
    } else {
        ExprVerdict::Clear
    }
}

/// Compose the final status from the two verdicts. Critical overrides
/// warning; a clear verdict only downgrades to `Clear` when nothing
/// else claimed the status.
pub(crate) fn compose_status(warning: ExprVerdict, critical: ExprVerdict) -> AlarmStatus {
    let mut status = AlarmStatus::Undefined;

    match warning {
        ExprVerdict::Clear => status = AlarmStatus::Clear,
        ExprVerdict::Raised => status = AlarmStatus::Warning,
        ExprVerdict::Undefined => {}
    }

    match critical {
        ExprVerdict::Clear => {
            if status == AlarmStatus::Undefined {
                status = AlarmStatus::Clear;
            }
        }
        ExprVerdict::Raised => status = AlarmStatus::Critical,
        ExprVerdict::Undefined => {}
    }

    status
}

/// Apply trigger hysteresis for a status change at `now` and return the
/// delay to attach to the transition.
///
/// Outside the flap window the delays reset to their configured base;
/// inside it they grow by the multiplier, clamped to the maximum. The
/// escalation delay applies when the new status ranks above the old.
pub(crate) fn apply_hysteresis(alarm: &mut Alarm, new_status: AlarmStatus, now: i64) -> i64 {
    if now > alarm.delay_up_to_timestamp {
        alarm.delay_up_current = alarm.definition.delay_up_duration;
        alarm.delay_down_current = alarm.definition.delay_down_duration;
        alarm.delay_last = 0;
        alarm.delay_up_to_timestamp = 0;
    } else {
        let multiplier = alarm.definition.delay_multiplier;
        let max = alarm.definition.delay_max_duration;

        alarm.delay_up_current = ((alarm.delay_up_current as f64) * multiplier) as i64;
        if alarm.delay_up_current > max {
            alarm.delay_up_current = max;
        }

        alarm.delay_down_current = ((alarm.delay_down_current as f64) * multiplier) as i64;
        if alarm.delay_down_current > max {
            alarm.delay_down_current = max;
        }
    }

    let delay = if new_status > alarm.status {
        alarm.delay_up_current
    } else {
        alarm.delay_down_current
    };

    alarm.delay_last = delay;
    alarm.delay_up_to_timestamp = now + delay;
    delay
}

/// Run the decide phase for one runnable, non-disabled alarm.
///
/// Returns the log entry to append when the status changed (repeating
/// alarms produce no transition entries; their notifications come from
/// [`repeat_entry`]). Always refreshes `last_updated`/`next_update`.
pub(crate) fn decide(host: &Host, alarm: &mut Alarm, now: i64) -> Option<AlarmEntry> {
    let mut warning_status = ExprVerdict::Undefined;
    let mut critical_status = ExprVerdict::Undefined;

    if let Some(warning) = alarm.definition.warning.clone() {
        let env = env_for(alarm, now);
        match warning.evaluate(&env) {
            Err(e) => {
                alarm.flags.insert(AlarmFlags::WARN_ERROR);
                alarm.warn_error = Some(e.to_string());
                debug!(
                    host = %host.hostname,
                    alarm = %alarm.definition.name,
                    error = %e,
                    "warning expression failed"
                );
            }
            Ok(result) => {
                alarm.flags.remove(AlarmFlags::WARN_ERROR);
                alarm.warn_error = None;
                warning_status = verdict(result);
            }
        }
    }

    if let Some(critical) = alarm.definition.critical.clone() {
        let env = env_for(alarm, now);
        match critical.evaluate(&env) {
            Err(e) => {
                alarm.flags.insert(AlarmFlags::CRIT_ERROR);
                alarm.crit_error = Some(e.to_string());
                debug!(
                    host = %host.hostname,
                    alarm = %alarm.definition.name,
                    error = %e,
                    "critical expression failed"
                );
            }
            Ok(result) => {
                alarm.flags.remove(AlarmFlags::CRIT_ERROR);
                alarm.crit_error = None;
                critical_status = verdict(result);
            }
        }
    }

    let status = compose_status(warning_status, critical_status);

    let mut entry = None;
    if status != alarm.status {
        let old_status = alarm.status;
        apply_hysteresis(alarm, status, now);

        if !alarm.is_repeating() {
            entry = Some(AlarmEntry::from_alarm(
                host.next_unique_id(),
                alarm,
                now,
                old_status,
                status,
            ));
        }

        debug!(
            host = %host.hostname,
            alarm = %alarm.definition.name,
            old = %old_status,
            new = %status,
            "alarm status changed"
        );

        alarm.last_status_change = now;
        alarm.old_status = old_status;
        alarm.status = status;
    }

    alarm.last_updated = now;
    alarm.next_update = now + alarm.definition.update_every;

    entry
}

/// Produce the periodic re-notification entry for a repeating alarm,
/// when one is due. The entry is ephemeral: the caller dispatches it
/// directly and never links it into the log.
pub(crate) fn repeat_entry(host: &Host, alarm: &mut Alarm, now: i64) -> Option<AlarmEntry> {
    if !alarm.is_repeating() {
        return None;
    }

    let repeat_every = match alarm.status {
        AlarmStatus::Warning => alarm.definition.warn_repeat_every,
        AlarmStatus::Critical => alarm.definition.crit_repeat_every,
        _ => 0,
    };

    if repeat_every <= 0 || alarm.last_repeat + repeat_every > now {
        return None;
    }

    alarm.last_repeat = now;
    let status = alarm.status;
    Some(AlarmEntry::from_alarm(
        host.next_unique_id(),
        alarm,
        now,
        status,
        status,
    ))
}

// src/eval.rs
//! The lookup/calculation phase.
//!
//! For every runnable alarm this refreshes `value` from the database
//! and the calculation expression. Status is *not* decided here; the
//! warning/critical expressions run in the transition phase so they can
//! see the freshly computed value through the expression environment.

use tracing::debug;

use crate::alarm::{Alarm, AlarmFlags};
use crate::backend::{LookupOutcome, LookupRequest, MetricsBackend};
use crate::expr::ExprEnv;

/// Decide whether an alarm can be evaluated this tick.
///
/// When the alarm is merely not due yet, `next_run` is pulled in so the
/// main loop wakes no later than the alarm's own schedule.
pub(crate) fn is_runnable(alarm: &Alarm, now: i64, next_run: &mut i64) -> bool {
    let Some(chart) = alarm.chart.as_ref() else {
        debug!(alarm = %alarm.definition.name, "not runnable: no linked chart");
        return false;
    };

    if alarm.next_update > now {
        if *next_run > alarm.next_update {
            *next_run = alarm.next_update;
        }
        debug!(
            alarm = %alarm.definition.name,
            due_in = alarm.next_update - now,
            "not examining alarm yet"
        );
        return false;
    }

    if alarm.definition.update_every == 0 {
        debug!(alarm = %alarm.definition.name, "not runnable: no update frequency");
        return false;
    }

    let chart = chart.read();

    if chart.obsolete {
        debug!(alarm = %alarm.definition.name, "not runnable: chart is obsolete");
        return false;
    }

    if !chart.enabled {
        debug!(alarm = %alarm.definition.name, "not runnable: chart is not enabled");
        return false;
    }

    if !chart.has_enough_collections() {
        debug!(alarm = %alarm.definition.name, "not runnable: chart is not fully collected yet");
        return false;
    }

    // Retention checks use the chart's own cadence as slack.
    let update_every = chart.update_every;

    if now + update_every < chart.first_entry {
        debug!(alarm = %alarm.definition.name, "not runnable: wanted time is out of retention");
        return false;
    }

    if let Some(lookup) = &alarm.definition.lookup {
        let needed = now + lookup.before + lookup.after;
        if needed + update_every < chart.first_entry || needed - update_every > chart.last_entry {
            debug!(
                alarm = %alarm.definition.name,
                needed,
                first = chart.first_entry,
                last = chart.last_entry,
                "not runnable: not enough data for the lookup window"
            );
            return false;
        }
    }

    true
}

/// Refresh `value` for one runnable alarm: database lookup first, then
/// the calculation expression. Failures force NaN and set the matching
/// error flag; successes clear it.
pub(crate) fn evaluate_values(
    hostname: &str,
    alarm: &mut Alarm,
    backend: &dyn MetricsBackend,
    now: i64,
) {
    if let Some(lookup) = alarm.definition.lookup {
        let request = LookupRequest {
            chart: &alarm.chart_id,
            dimensions: alarm.definition.dimensions.as_deref(),
            after: lookup.after,
            before: lookup.before,
            group: lookup.group,
            options: lookup.options,
            now,
        };

        match backend.lookup(&request) {
            Err(e) => {
                alarm.value = f64::NAN;
                alarm.flags.insert(AlarmFlags::DB_ERROR);
                debug!(
                    host = hostname,
                    alarm = %alarm.definition.name,
                    error = %e,
                    "database lookup returned an error"
                );
            }
            Ok(outcome) => {
                alarm.flags.remove(AlarmFlags::DB_ERROR);
                match outcome {
                    LookupOutcome::Empty => {
                        alarm.value = f64::NAN;
                        alarm.flags.insert(AlarmFlags::DB_NAN);
                        debug!(
                            host = hostname,
                            alarm = %alarm.definition.name,
                            "database lookup returned an empty value"
                        );
                    }
                    LookupOutcome::Value(value) => {
                        alarm.flags.remove(AlarmFlags::DB_NAN);
                        alarm.value = value;
                    }
                }
            }
        }
    }

    if let Some(calculation) = alarm.definition.calculation.clone() {
        let env = env_for(alarm, now);
        match calculation.evaluate(&env) {
            Err(e) => {
                alarm.value = f64::NAN;
                alarm.flags.insert(AlarmFlags::CALC_ERROR);
                alarm.calc_error = Some(e.to_string());
                debug!(
                    host = hostname,
                    alarm = %alarm.definition.name,
                    expression = calculation.parsed_as(),
                    error = %e,
                    "calculation expression failed"
                );
            }
            Ok(result) => {
                alarm.flags.remove(AlarmFlags::CALC_ERROR);
                alarm.calc_error = None;
                alarm.value = result;
            }
        }
    }
}

/// The expression environment for an alarm at `now`.
pub(crate) fn env_for(alarm: &Alarm, now: i64) -> ExprEnv {
    let (green, red) = alarm
        .chart
        .as_ref()
        .map(|c| {
            let chart = c.read();
            (chart.green, chart.red)
        })
        .unwrap_or((f64::NAN, f64::NAN));

    ExprEnv {
        value: alarm.value,
        status: alarm.status,
        green,
        red,
        now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmDefinition, DbLookup};
    use crate::chart::Chart;
    use crate::error::{HealthError, Result};

    struct FixedBackend(Result<LookupOutcome>);

    impl MetricsBackend for FixedBackend {
        fn lookup(&self, _request: &LookupRequest<'_>) -> Result<LookupOutcome> {
            match &self.0 {
                Ok(outcome) => Ok(*outcome),
                Err(_) => Err(HealthError::Lookup("backend down".into())),
            }
        }
    }

    fn collected_chart(now: i64) -> Chart {
        let mut chart = Chart::new("system.cpu", "system.cpu", "cpu", "%", 1);
        chart.counter_done = 10;
        chart.last_collected = now;
        chart.first_entry = now - 600;
        chart.last_entry = now;
        chart
    }

    fn alarm_on(chart: Chart) -> Alarm {
        let mut def = AlarmDefinition::new("cpu_high");
        def.update_every = 10;
        let mut alarm = Alarm::new(1, 1, chart.id.clone(), def);
        alarm.chart = Some(chart.into_shared());
        alarm
    }

    #[test]
    fn unlinked_alarm_is_not_runnable() {
        let alarm = Alarm::new(1, 1, "x".into(), AlarmDefinition::new("a"));
        let mut next_run = i64::MAX;
        assert!(!is_runnable(&alarm, 1000, &mut next_run));
    }

    #[test]
    fn pending_alarm_narrows_next_run() {
        let now = 1000;
        let mut alarm = alarm_on(collected_chart(now));
        alarm.next_update = now + 7;
        let mut next_run = now + 60;
        assert!(!is_runnable(&alarm, now, &mut next_run));
        assert_eq!(next_run, now + 7);
    }

    #[test]
    fn barely_collected_chart_is_not_runnable() {
        let now = 1000;
        let mut chart = collected_chart(now);
        chart.counter_done = 1;
        let alarm = alarm_on(chart);
        let mut next_run = i64::MAX;
        assert!(!is_runnable(&alarm, now, &mut next_run));
    }

    #[test]
    fn lookup_window_must_be_within_retention() {
        let now = 1000;
        let mut alarm = alarm_on(collected_chart(now));
        alarm.definition.lookup = Some(DbLookup {
            after: -3600,
            before: 0,
            ..Default::default()
        });
        let mut next_run = i64::MAX;
        assert!(!is_runnable(&alarm, now, &mut next_run));

        alarm.definition.lookup = Some(DbLookup {
            after: -60,
            before: 0,
            ..Default::default()
        });
        assert!(is_runnable(&alarm, now, &mut next_run));
    }

    #[test]
    fn lookup_failure_sets_nan_and_db_error() {
        let now = 1000;
        let mut alarm = alarm_on(collected_chart(now));
        alarm.definition.lookup = Some(DbLookup::default());
        alarm.value = 5.0;

        let backend = FixedBackend(Err(HealthError::Lookup("down".into())));
        evaluate_values("box1", &mut alarm, &backend, now);
        assert!(alarm.value.is_nan());
        assert!(alarm.flags.contains(AlarmFlags::DB_ERROR));

        let backend = FixedBackend(Ok(LookupOutcome::Value(42.0)));
        evaluate_values("box1", &mut alarm, &backend, now);
        assert_eq!(alarm.value, 42.0);
        assert!(!alarm.flags.contains(AlarmFlags::DB_ERROR));
    }

    #[test]
    fn empty_lookup_sets_db_nan() {
        let now = 1000;
        let mut alarm = alarm_on(collected_chart(now));
        alarm.definition.lookup = Some(DbLookup::default());

        let backend = FixedBackend(Ok(LookupOutcome::Empty));
        evaluate_values("box1", &mut alarm, &backend, now);
        assert!(alarm.value.is_nan());
        assert!(alarm.flags.contains(AlarmFlags::DB_NAN));
    }
}

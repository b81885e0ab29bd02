// tests/log_properties.rs
//! Property tests over the alarm log: id ordering, eviction bounds,
//! and supersede behavior under arbitrary append sequences.

use std::collections::HashSet;

use proptest::prelude::*;

use vigil::alarm::{Alarm, AlarmDefinition, AlarmStatus};
use vigil::alarm_log::{AlarmEntry, AlarmLog, EntryFlags};

fn make_entry(unique_id: u32, alarm_id: u32, old: AlarmStatus, new: AlarmStatus) -> AlarmEntry {
    let mut alarm = Alarm::new(alarm_id, 1, "chart".into(), AlarmDefinition::new("alarm"));
    alarm.status = old;
    AlarmEntry::from_alarm(unique_id, &mut alarm, 1000, old, new)
}

fn status_strategy() -> impl Strategy<Value = AlarmStatus> {
    prop_oneof![
        Just(AlarmStatus::Undefined),
        Just(AlarmStatus::Clear),
        Just(AlarmStatus::Warning),
        Just(AlarmStatus::Critical),
    ]
}

proptest! {
    #[test]
    fn unique_ids_strictly_decrease_along_the_log(
        alarm_ids in prop::collection::vec(1u32..6, 1..200),
    ) {
        let mut log = AlarmLog::new(1000);
        for (i, alarm_id) in alarm_ids.iter().enumerate() {
            log.append(make_entry(i as u32 + 1, *alarm_id, AlarmStatus::Clear, AlarmStatus::Warning));
        }

        let ids: Vec<u32> = log.iter().map(|e| e.unique_id).collect();
        for pair in ids.windows(2) {
            prop_assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn eviction_bound_holds(
        max in 3usize..60,
        extra in 0usize..120,
    ) {
        let total = max + extra;
        let mut log = AlarmLog::new(max);
        for i in 0..total {
            log.append(make_entry(i as u32 + 1, 1, AlarmStatus::Clear, AlarmStatus::Warning));
        }

        let evicted = log.evict(&HashSet::new());

        prop_assert!(log.len() <= max);
        if total > max {
            let keep = max * 2 / 3;
            prop_assert_eq!(log.len(), keep);
            prop_assert_eq!(evicted, total - keep);
            // The survivors are exactly the newest ones.
            let ids: Vec<u32> = log.iter().map(|e| e.unique_id).collect();
            prop_assert_eq!(ids[0], total as u32);
            prop_assert_eq!(*ids.last().unwrap(), (total - keep) as u32 + 1);
        } else {
            prop_assert_eq!(evicted, 0);
            prop_assert_eq!(log.len(), total);
        }
    }

    #[test]
    fn at_most_one_pending_entry_per_alarm(
        transitions in prop::collection::vec(
            (1u32..5, status_strategy(), status_strategy()),
            1..100,
        ),
    ) {
        let mut log = AlarmLog::new(1000);
        for (i, (alarm_id, old, new)) in transitions.iter().enumerate() {
            log.append(make_entry(i as u32 + 1, *alarm_id, *old, *new));
        }

        // After any append sequence, each alarm has at most one entry
        // that is not yet superseded.
        let mut pending: Vec<u32> = log
            .iter()
            .filter(|e| !e.flags.contains(EntryFlags::UPDATED))
            .map(|e| e.alarm_id)
            .collect();
        let before = pending.len();
        pending.sort_unstable();
        pending.dedup();
        prop_assert_eq!(before, pending.len());
    }
}

// src/reload.rs
//! Hot reload of alarm configuration.
//!
//! Reload swaps a host's alarm and template definitions for the ones
//! currently on disk while keeping the alarm log. Alarms that
//! disappear leave a `REMOVED` tombstone entry; entries that were still
//! waiting for a notification are invalidated so the new configuration
//! starts from a clean slate.

use std::path::Path;

use tracing::info;

use crate::alarm::AlarmStatus;
use crate::alarm_log::{AlarmEntry, EntryFlags};
use crate::config::HealthConfig;
use crate::error::Result;
use crate::host::{Host, HostRegistry};

/// The loaded definitions of one host.
#[derive(Debug, Default)]
pub struct HostDefinitions {
    /// Concrete alarms bound to chart ids.
    pub alarms: Vec<crate::alarm::AlarmPrototype>,
    /// Templates keyed by chart context.
    pub templates: Vec<crate::alarm::TemplatePrototype>,
}

/// Parses alarm/template definition files. The configuration format
/// and its parser live outside this crate; reload only asks for the
/// current definitions of a host, user directory first, then stock.
pub trait DefinitionSource: Send + Sync {
    /// Load the definitions for `hostname`.
    fn load(&self, hostname: &str, user_dir: &Path, stock_dir: &Path) -> Result<HostDefinitions>;
}

/// A source with no definitions; hosts start empty until the real
/// loader is wired in or alarms are adopted programmatically.
#[derive(Debug, Default)]
pub struct EmptyDefinitions;

impl DefinitionSource for EmptyDefinitions {
    fn load(&self, _: &str, _: &Path, _: &Path) -> Result<HostDefinitions> {
        Ok(HostDefinitions::default())
    }
}

/// Reload one host's alarm configuration.
pub async fn reload_host(
    host: &Host,
    source: &dyn DefinitionSource,
    config: &HealthConfig,
    now: i64,
) -> Result<()> {
    if !host
        .health_enabled
        .load(std::sync::atomic::Ordering::Relaxed)
    {
        return Ok(());
    }

    let mut book = host.book.write().await;

    // Tear down the running alarms; each leaves a tombstone unless it
    // never produced a real status.
    let removed = book.clear();
    {
        let mut log = host.log.write();
        for mut alarm in removed {
            if alarm.status != AlarmStatus::Removed {
                let status = alarm.status;
                let entry = AlarmEntry::from_alarm(
                    host.next_unique_id(),
                    &mut alarm,
                    now,
                    status,
                    AlarmStatus::Removed,
                );
                log.append(entry);
            }
        }

        // Whatever was still pending belongs to the old configuration.
        for unique_id in log
            .iter()
            .filter(|e| e.new_status != AlarmStatus::Removed)
            .map(|e| e.unique_id)
            .collect::<Vec<_>>()
        {
            if let Some(entry) = log.find_mut(unique_id) {
                entry.flags.insert(EntryFlags::UPDATED);
            }
        }
    }

    // Threshold variables belong to the definitions; reset them.
    for chart in host.charts.iter() {
        let mut chart = chart.value().write();
        chart.green = f64::NAN;
        chart.red = f64::NAN;
    }

    let definitions = source.load(
        &host.hostname,
        &config.health_config_dir,
        &config.stock_health_config_dir,
    )?;

    let alarms = definitions.alarms.len();
    let templates = definitions.templates.len();
    for proto in definitions.alarms {
        book.adopt(proto);
    }
    for template in definitions.templates {
        book.adopt_template(template);
    }

    for chart in host.charts.iter() {
        book.link_chart(chart.value());
    }

    info!(
        host = %host.hostname,
        alarms,
        templates,
        "health configuration reloaded"
    );
    Ok(())
}

/// Reload every host in the registry.
pub async fn reload_all(
    registry: &HostRegistry,
    source: &dyn DefinitionSource,
    config: &HealthConfig,
    now: i64,
) -> Result<()> {
    let hosts = registry.write().await;
    for host in hosts.iter() {
        reload_host(host, source, config, now).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmDefinition, AlarmPrototype};
    use crate::chart::Chart;

    struct OneAlarm(&'static str);

    impl DefinitionSource for OneAlarm {
        fn load(&self, _: &str, _: &Path, _: &Path) -> Result<HostDefinitions> {
            Ok(HostDefinitions {
                alarms: vec![AlarmPrototype {
                    chart: "system.cpu".into(),
                    definition: AlarmDefinition::new(self.0),
                }],
                templates: vec![],
            })
        }
    }

    #[tokio::test]
    async fn reload_tombstones_and_invalidates() {
        let config = HealthConfig::default();
        let host = Host::new("box1", &config).unwrap();
        host.add_chart(Chart::new("system.cpu", "system.cpu", "cpu", "%", 1))
            .await;

        // A running alarm with a pending log entry.
        {
            let mut book = host.book.write().await;
            let alarm = book.adopt(AlarmPrototype {
                chart: "system.cpu".into(),
                definition: AlarmDefinition::new("old_alarm"),
            });
            alarm.status = AlarmStatus::Warning;
            let status = alarm.status;
            let entry = AlarmEntry::from_alarm(
                host.next_unique_id(),
                alarm,
                50,
                AlarmStatus::Clear,
                status,
            );
            host.log.write().append(entry);
        }

        reload_host(&host, &OneAlarm("new_alarm"), &config, 100)
            .await
            .unwrap();

        let book = host.book.read().await;
        assert_eq!(book.alarms.len(), 1);
        assert_eq!(book.alarms[0].definition.name, "new_alarm");
        assert!(book.alarms[0].chart.is_some());

        let log = host.log.read();
        let head = log.iter().next().unwrap();
        assert_eq!(head.new_status, AlarmStatus::Removed);
        assert_eq!(head.old_status, AlarmStatus::Warning);

        // The pending warning entry must never be notified now.
        let pending = log
            .iter()
            .find(|e| e.new_status == AlarmStatus::Warning)
            .unwrap();
        assert!(pending.flags.contains(EntryFlags::UPDATED));
    }

    #[tokio::test]
    async fn reload_resets_chart_thresholds() {
        let config = HealthConfig::default();
        let host = Host::new("box1", &config).unwrap();
        let chart = host
            .add_chart(Chart::new("system.cpu", "system.cpu", "cpu", "%", 1))
            .await;
        chart.write().green = 80.0;
        chart.write().red = 95.0;

        reload_host(&host, &EmptyDefinitions, &config, 100)
            .await
            .unwrap();

        assert!(chart.read().green.is_nan());
        assert!(chart.read().red.is_nan());
    }

    #[tokio::test]
    async fn alarm_ids_are_stable_across_reloads() {
        let config = HealthConfig::default();
        let host = Host::new("box1", &config).unwrap();
        host.add_chart(Chart::new("system.cpu", "system.cpu", "cpu", "%", 1))
            .await;

        reload_host(&host, &OneAlarm("cpu_high"), &config, 100)
            .await
            .unwrap();
        let first = host.book.read().await.alarms[0].id;

        reload_host(&host, &OneAlarm("cpu_high"), &config, 200)
            .await
            .unwrap();
        let second = host.book.read().await.alarms[0].id;

        assert_eq!(first, second);
    }
}

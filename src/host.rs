// src/host.rs
//! Hosts and the global host registry.
//!
//! A host owns its alarm book (live alarms plus templates), its chart
//! index, and its alarm log. The alarm book sits behind an async
//! readers-writer lock: the engine write-holds it for the evaluation
//! phases, configuration reload write-holds it to swap definitions,
//! and the dispatcher read-holds it briefly for host-wide aggregates.
//! The log has its own short-section lock and is never held across a
//! notifier invocation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::alarm::{Alarm, AlarmPrototype, TemplatePrototype};
use crate::alarm_log::AlarmLog;
use crate::chart::{Chart, SharedChart};
use crate::config::HealthConfig;
use crate::error::Result;
use crate::silencers::SimplePattern;

/// Identity carried across reloads for one (name, chart) pair.
#[derive(Debug, Clone, Copy)]
struct AlarmIdentity {
    id: u32,
    next_event_id: u32,
}

/// The live set of alarms and templates of one host.
#[derive(Default)]
pub struct AlarmBook {
    /// Live alarm instances.
    pub alarms: Vec<Alarm>,
    /// Templates, materialized when matching charts appear.
    pub templates: Vec<TemplatePrototype>,
    identities: HashMap<(String, String), AlarmIdentity>,
    next_alarm_id: u32,
}

impl AlarmBook {
    /// Stable identity for a (name, chart) pair: the same definition
    /// keeps its alarm id and event counter across reloads.
    fn identity(&mut self, name: &str, chart: &str) -> AlarmIdentity {
        let next_alarm_id = &mut self.next_alarm_id;
        *self
            .identities
            .entry((name.to_string(), chart.to_string()))
            .or_insert_with(|| {
                *next_alarm_id += 1;
                AlarmIdentity {
                    id: *next_alarm_id,
                    next_event_id: 1,
                }
            })
    }

    /// Instantiate a concrete alarm definition. The chart link is made
    /// separately, once the chart exists.
    pub fn adopt(&mut self, proto: AlarmPrototype) -> &mut Alarm {
        let identity = self.identity(&proto.definition.name, &proto.chart);
        let alarm = Alarm::new(
            identity.id,
            identity.next_event_id,
            proto.chart,
            proto.definition,
        );
        debug!(alarm = %alarm.definition.name, id = alarm.id, "alarm instantiated");
        let index = self.alarms.len();
        self.alarms.push(alarm);
        &mut self.alarms[index]
    }

    /// Register a template for later materialization.
    pub fn adopt_template(&mut self, template: TemplatePrototype) {
        self.templates.push(template);
    }

    /// Link unbound alarms to this chart and materialize matching
    /// templates on it.
    pub fn link_chart(&mut self, shared: &SharedChart) {
        let (chart_id, context, family) = {
            let chart = shared.read();
            (chart.id.clone(), chart.context.clone(), chart.family.clone())
        };

        for alarm in self.alarms.iter_mut() {
            if alarm.chart.is_none() && alarm.chart_id == chart_id {
                debug!(alarm = %alarm.definition.name, chart = %chart_id, "alarm linked to chart");
                alarm.chart = Some(shared.clone());
            }
        }

        let mut materialized = Vec::new();
        for template in &self.templates {
            if template.context != context {
                continue;
            }
            if let Some(families) = &template.families {
                match SimplePattern::parse(families) {
                    Ok(pattern) if pattern.matches(&family) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(template = %template.definition.name, error = %e, "bad template family pattern");
                        continue;
                    }
                }
            }
            let exists = self.alarms.iter().any(|a| {
                a.definition.name == template.definition.name && a.chart_id == chart_id
            });
            if !exists {
                materialized.push(AlarmPrototype {
                    chart: chart_id.clone(),
                    definition: template.definition.clone(),
                });
            }
        }
        for proto in materialized {
            let alarm = self.adopt(proto);
            alarm.chart = Some(shared.clone());
        }
    }

    /// Tear down every alarm and template, remembering identities so a
    /// reload keeps ids stable. Returns the removed alarms so the
    /// caller can write tombstone log entries.
    pub fn clear(&mut self) -> Vec<Alarm> {
        for alarm in &self.alarms {
            self.identities.insert(
                (alarm.definition.name.clone(), alarm.chart_id.clone()),
                AlarmIdentity {
                    id: alarm.id,
                    next_event_id: alarm.next_event_id,
                },
            );
        }
        self.templates.clear();
        std::mem::take(&mut self.alarms)
    }

    /// Ids of alarms that currently repeat their notifications.
    pub fn repeating_ids(&self) -> HashSet<u32> {
        self.alarms
            .iter()
            .filter(|a| a.is_repeating())
            .map(|a| a.id)
            .collect()
    }

    /// Find an alarm by its id.
    pub fn find_by_id(&self, id: u32) -> Option<&Alarm> {
        self.alarms.iter().find(|a| a.id == id)
    }
}

/// One monitored host.
pub struct Host {
    /// The host's registry name.
    pub hostname: String,
    /// Whether health evaluation runs for this host.
    pub health_enabled: AtomicBool,
    /// Default notifier executable.
    pub default_exec: String,
    /// Default notification recipient.
    pub default_recipient: String,
    /// Live alarms and templates.
    pub book: RwLock<AlarmBook>,
    /// Live charts by id.
    pub charts: DashMap<String, SharedChart>,
    /// The bounded alarm log.
    pub log: parking_lot::RwLock<AlarmLog>,
    /// Dispatch cursor: entries below this id were already visited.
    pub last_processed_id: AtomicU32,
    /// Alarm checks are postponed until this time (0 = not postponed).
    pub delay_up_to: AtomicI64,
    next_unique_id: AtomicU32,
}

impl Host {
    /// Create a host with an empty book and log, wired per `config`.
    pub fn new(hostname: impl Into<String>, config: &HealthConfig) -> Result<Self> {
        let hostname = hostname.into();
        let log = match config.host_log_path(&hostname) {
            Some(path) => AlarmLog::with_persistence(config.log_max_entries, &path)?,
            None => AlarmLog::new(config.log_max_entries),
        };
        Ok(Self {
            hostname,
            health_enabled: AtomicBool::new(config.enabled),
            default_exec: config.default_notifier.clone(),
            default_recipient: config.default_recipient.clone(),
            book: RwLock::new(AlarmBook::default()),
            charts: DashMap::new(),
            log: parking_lot::RwLock::new(log),
            last_processed_id: AtomicU32::new(0),
            delay_up_to: AtomicI64::new(0),
            next_unique_id: AtomicU32::new(1),
        })
    }

    /// Allocate the next host-wide log entry id.
    pub fn next_unique_id(&self) -> u32 {
        self.next_unique_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a chart and link it into the alarm book.
    pub async fn add_chart(&self, chart: Chart) -> SharedChart {
        let shared = chart.into_shared();
        let id = shared.read().id.clone();
        self.charts.insert(id, shared.clone());
        self.book.write().await.link_chart(&shared);
        shared
    }

    /// Postpone alarm checks until `when`.
    pub fn postpone_until(&self, when: i64) {
        self.delay_up_to.store(when, Ordering::Relaxed);
    }
}

/// The global set of monitored hosts.
#[derive(Default)]
pub struct HostRegistry {
    hosts: RwLock<Vec<Arc<Host>>>,
}

impl HostRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host and return its shared handle.
    pub async fn add(&self, host: Host) -> Arc<Host> {
        let host = Arc::new(host);
        self.hosts.write().await.push(host.clone());
        host
    }

    /// Read-lock the host list; the engine holds this across one tick.
    pub async fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Host>>> {
        self.hosts.read().await
    }

    /// Write-lock the host list (reload).
    pub async fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Host>>> {
        self.hosts.write().await
    }

    /// Find a host by name.
    pub async fn find(&self, hostname: &str) -> Option<Arc<Host>> {
        self.hosts
            .read()
            .await
            .iter()
            .find(|h| h.hostname == hostname)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmDefinition;

    fn proto(name: &str, chart: &str) -> AlarmPrototype {
        AlarmPrototype {
            chart: chart.into(),
            definition: AlarmDefinition::new(name),
        }
    }

    #[test]
    fn identities_survive_clear() {
        let mut book = AlarmBook::default();
        let first_id = book.adopt(proto("cpu_high", "system.cpu")).id;
        book.adopt(proto("ram_low", "system.ram"));

        let removed = book.clear();
        assert_eq!(removed.len(), 2);
        assert!(book.alarms.is_empty());

        let again = book.adopt(proto("cpu_high", "system.cpu")).id;
        assert_eq!(first_id, again);

        let fresh = book.adopt(proto("disk_full", "disk.sda")).id;
        assert!(fresh > again);
    }

    #[test]
    fn event_ids_continue_across_reload() {
        let mut book = AlarmBook::default();
        {
            let alarm = book.adopt(proto("cpu_high", "system.cpu"));
            alarm.take_event_id();
            alarm.take_event_id();
        }
        book.clear();
        let alarm = book.adopt(proto("cpu_high", "system.cpu"));
        assert_eq!(alarm.next_event_id, 3);
    }

    #[tokio::test]
    async fn charts_link_alarms_and_materialize_templates() {
        let host = Host::new("box1", &HealthConfig::default()).unwrap();
        {
            let mut book = host.book.write().await;
            book.adopt(proto("cpu_high", "system.cpu"));
            book.adopt_template(TemplatePrototype {
                context: "disk.space".into(),
                families: Some("sd*".into()),
                definition: AlarmDefinition::new("disk_full"),
            });
        }

        host.add_chart(Chart::new("system.cpu", "system.cpu", "cpu", "%", 1))
            .await;
        host.add_chart(Chart::new("disk.space.sda", "disk.space", "sda", "GiB", 1))
            .await;
        host.add_chart(Chart::new("disk.space.nvme0", "disk.space", "nvme0", "GiB", 1))
            .await;

        let book = host.book.read().await;
        assert_eq!(book.alarms.len(), 2);
        assert!(book.alarms[0].chart.is_some());
        let disk = &book.alarms[1];
        assert_eq!(disk.definition.name, "disk_full");
        assert_eq!(disk.chart_id, "disk.space.sda");
    }

    #[test]
    fn unique_ids_are_monotonic() {
        let host = Host::new("box1", &HealthConfig::default()).unwrap();
        let a = host.next_unique_id();
        let b = host.next_unique_id();
        assert!(b > a);
        assert_eq!(a, 1);
    }
}

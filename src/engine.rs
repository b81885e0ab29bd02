// src/engine.rs
//! The health supervisor.
//!
//! One dedicated task runs the tick loop: postpone checks after a
//! resume from suspension, refresh silencer flags, run the lookup/
//! calculation phase, decide transitions, fire repeating alarms, then
//! drive the dispatcher over each host's alarm log. Between ticks the
//! engine sleeps until the earliest alarm is due, bounded by the
//! configured minimum period.
//!
//! # Lock discipline
//!
//! - the global host list is read-held across one full tick;
//! - a host's alarm book is write-held during the evaluation phases
//!   (alarm fields mutate there) and released before any notifier runs;
//! - the alarm log lock only guards short sections inside the log and
//!   dispatcher code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, span, warn, Level};

use crate::alarm::AlarmFlags;
use crate::backend::MetricsBackend;
use crate::clock::{Clock, SuspensionDetector, SystemClock};
use crate::config::HealthConfig;
use crate::dispatch;
use crate::error::Result;
use crate::eval;
use crate::host::HostRegistry;
use crate::notify::Notifier;
use crate::reload::{self, DefinitionSource};
use crate::silencers::SilencerStore;
use crate::transition;

/// Cumulative engine counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Completed ticks.
    pub ticks: u64,
    /// Alarms that went through the lookup/calculation phase.
    pub alarms_evaluated: u64,
    /// Status transitions recorded.
    pub transitions: u64,
    /// Notifier invocations that actually ran.
    pub notifications_sent: u64,
}

/// Lets other tasks stop a running engine.
#[derive(Clone)]
pub struct ShutdownHandle {
    exit: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ShutdownHandle {
    /// Request a clean stop; the engine finishes the current step and
    /// exits its loop.
    pub fn stop(&self) {
        self.exit.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

/// The health evaluation engine.
pub struct HealthEngine {
    config: HealthConfig,
    registry: Arc<HostRegistry>,
    silencers: Arc<SilencerStore>,
    backend: Arc<dyn MetricsBackend>,
    notifier: Arc<dyn Notifier>,
    definitions: Arc<dyn DefinitionSource>,
    clock: Arc<dyn Clock>,
    suspension: SuspensionDetector,
    exit: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    stats: Arc<parking_lot::RwLock<EngineStats>>,
    all_disabled_logged: bool,
}

impl HealthEngine {
    /// Assemble an engine over its collaborators, using the system
    /// clock. The silencers file, when configured and present, is
    /// loaded here; a broken file is logged and ignored.
    pub fn new(
        mut config: HealthConfig,
        registry: Arc<HostRegistry>,
        backend: Arc<dyn MetricsBackend>,
        notifier: Arc<dyn Notifier>,
        definitions: Arc<dyn DefinitionSource>,
    ) -> Self {
        let _span = span!(Level::INFO, "health_init").entered();
        config.normalize();

        let silencers = Arc::new(SilencerStore::new());
        if let Some(path) = &config.silencers_file {
            if path.exists() {
                if let Err(e) = silencers.load_file(path) {
                    error!(file = %path.display(), error = %e, "cannot load silencers file");
                }
            } else {
                warn!(file = %path.display(), "silencers file does not exist");
            }
        }

        Self {
            config,
            registry,
            silencers,
            backend,
            notifier,
            definitions,
            clock: Arc::new(SystemClock::new()),
            suspension: SuspensionDetector::new(),
            exit: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            stats: Arc::new(parking_lot::RwLock::new(EngineStats::default())),
            all_disabled_logged: false,
        }
    }

    /// Replace the clock (tests drive the engine with a scripted one).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The engine's silencer store (shared with the command API).
    pub fn silencers(&self) -> Arc<SilencerStore> {
        self.silencers.clone()
    }

    /// The host registry the engine evaluates.
    pub fn registry(&self) -> Arc<HostRegistry> {
        self.registry.clone()
    }

    /// The active configuration.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// A handle other tasks can use to stop the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            exit: self.exit.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Reload alarm configuration for every host.
    pub async fn reload(&self) -> Result<()> {
        reload::reload_all(
            &self.registry,
            self.definitions.as_ref(),
            &self.config,
            self.clock.now(),
        )
        .await
    }

    fn should_exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Run the supervisor loop until stopped.
    pub async fn run(&mut self) -> Result<()> {
        if !self.config.enabled {
            info!("health monitoring is disabled");
            return Ok(());
        }

        info!(
            min_run_every = self.config.run_at_least_every_seconds,
            "health engine starting"
        );

        let mut loop_count: u64 = 0;
        while !self.should_exit() {
            loop_count += 1;
            debug!(loop_count, "health monitoring iteration started");

            let next_run = self.run_once().await;

            if self.should_exit() {
                break;
            }

            let now = self.clock.now();
            if now < next_run {
                debug!(
                    loop_count,
                    sleep_secs = next_run - now,
                    "health monitoring iteration done"
                );
                tokio::select! {
                    _ = self.shutdown.notified() => {}
                    _ = sleep(Duration::from_secs((next_run - now) as u64)) => {}
                }
            } else {
                debug!(loop_count, "health monitoring iteration done, next one due now");
            }
        }

        info!("health engine stopped");
        Ok(())
    }

    /// Run one tick over every host and return when the next one is
    /// due. Exposed so tests (and embedders with their own schedulers)
    /// can step the engine deterministically.
    pub async fn run_once(&mut self) -> i64 {
        let now = self.clock.now();
        let mut next_run = now + self.config.run_at_least_every_seconds;

        let resumed = self.suspension.resumed_from_suspension(self.clock.as_ref());
        if resumed {
            info!(
                postpone_secs = self.config.postpone_alarms_during_hibernation_for_seconds,
                "postponing alarm checks, the system seems to have just resumed from suspension"
            );
        }

        if self.silencers.all_disabled() {
            if !self.all_disabled_logged {
                info!("skipping health checks, all alarms are disabled via the command API");
                self.all_disabled_logged = true;
            }
        }

        let mut evaluated: u64 = 0;
        let mut transitions: u64 = 0;
        let mut notifications: u64 = 0;

        let hosts = self.registry.read().await;
        for host in hosts.iter() {
            if self.should_exit() {
                break;
            }
            if !host.health_enabled.load(Ordering::Relaxed) {
                continue;
            }

            if resumed {
                info!(host = %host.hostname, "postponing health checks on host");
                host.postpone_until(
                    now + self.config.postpone_alarms_during_hibernation_for_seconds,
                );
            }

            let delay_up_to = host.delay_up_to.load(Ordering::Relaxed);
            if delay_up_to != 0 {
                if now < delay_up_to {
                    continue;
                }
                info!(host = %host.hostname, "resuming health checks on host");
                host.delay_up_to.store(0, Ordering::Relaxed);
            }

            // Phase 1: refresh silencer flags, then look up values and
            // run calculations for every runnable alarm.
            let mut runnable: u64 = 0;
            {
                let mut book = host.book.write().await;
                for alarm in book.alarms.iter_mut() {
                    if self.silencers.update_alarm(&host.hostname, alarm) {
                        continue;
                    }

                    if !eval::is_runnable(alarm, now, &mut next_run) {
                        alarm.flags.remove(AlarmFlags::RUNNABLE);
                        continue;
                    }

                    runnable += 1;
                    alarm.old_value = alarm.value;
                    alarm.flags.insert(AlarmFlags::RUNNABLE);
                    eval::evaluate_values(&host.hostname, alarm, self.backend.as_ref(), now);
                }
            }
            evaluated += runnable;

            if self.should_exit() {
                break;
            }

            // Phase 2: decide transitions; phase 3: repeating alarms.
            if runnable > 0 {
                let mut ephemeral = Vec::new();
                {
                    let mut book = host.book.write().await;
                    for alarm in book.alarms.iter_mut() {
                        if !alarm.flags.contains(AlarmFlags::RUNNABLE)
                            || alarm.flags.contains(AlarmFlags::DISABLED)
                        {
                            continue;
                        }

                        if let Some(entry) = transition::decide(host, alarm, now) {
                            transitions += 1;
                            host.log.write().append(entry);
                        }

                        if next_run > alarm.next_update {
                            next_run = alarm.next_update;
                        }
                    }

                    for alarm in book.alarms.iter_mut() {
                        if let Some(entry) = transition::repeat_entry(host, alarm, now) {
                            ephemeral.push(entry);
                        }
                    }
                }

                // Repeating notifications run with the book released.
                for entry in ephemeral {
                    if dispatch::execute_ephemeral(host, self.notifier.as_ref(), entry, now).await
                    {
                        notifications += 1;
                    }
                }
            }

            if self.should_exit() {
                break;
            }

            // Phase 4: notifications and log upkeep.
            notifications +=
                dispatch::process_host_log(host, self.notifier.as_ref(), now).await as u64;
        }
        drop(hosts);

        let mut stats = self.stats.write();
        stats.ticks += 1;
        stats.alarms_evaluated += evaluated;
        stats.transitions += transitions;
        stats.notifications_sent += notifications;

        next_run
    }
}

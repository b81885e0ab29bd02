// src/notify.rs
//! Notifier invocation.
//!
//! Alerts leave the engine through an external executable that receives
//! the whole event as positional arguments. The [`Notifier`] trait is
//! the seam: the production implementation spawns the process through
//! `tokio::process` and waits for it, tests capture the argument vector
//! instead. Stdout of the notifier is discarded; only the exit code is
//! recorded.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use crate::alarm::format_value;
use crate::alarm_log::AlarmEntry;
use crate::error::{HealthError, Result};

/// Everything the notifier receives beyond the entry itself.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    /// Resolved notifier executable (alarm override or host default).
    pub exec: String,
    /// Resolved recipient (alarm override or host default).
    pub recipient: String,
    /// The owning host's name.
    pub hostname: String,
    /// Source of the selected warning/critical expression.
    pub expr_source: Option<String>,
    /// Last evaluation error of the selected expression.
    pub expr_error: Option<String>,
    /// Alarms currently warning on the host.
    pub n_warn: usize,
    /// Alarms currently critical on the host.
    pub n_crit: usize,
}

/// Build the positional argument vector, executable first.
///
/// The layout is a stable contract with notifier scripts; optional
/// fields substitute fixed placeholders rather than collapsing.
pub fn build_argv(entry: &AlarmEntry, ctx: &NotificationContext) -> Vec<String> {
    let or = |s: &str, fallback: &str| {
        if s.is_empty() {
            fallback.to_string()
        } else {
            s.to_string()
        }
    };

    vec![
        ctx.exec.clone(),
        ctx.recipient.clone(),
        ctx.hostname.clone(),
        entry.unique_id.to_string(),
        entry.alarm_id.to_string(),
        entry.alarm_event_id.to_string(),
        entry.when.to_string(),
        entry.name.clone(),
        or(&entry.chart, "NOCHART"),
        or(&entry.family, "NOFAMILY"),
        entry.new_status.to_string(),
        entry.old_status.to_string(),
        format_value(entry.new_value),
        format_value(entry.old_value),
        or(&entry.source, "UNKNOWN"),
        entry.duration.to_string(),
        entry.non_clear_duration.to_string(),
        entry.units.clone(),
        entry.info.clone(),
        entry.new_value_string.clone(),
        entry.old_value_string.clone(),
        ctx.expr_source.clone().unwrap_or_else(|| "NOSOURCE".into()),
        ctx.expr_error.clone().unwrap_or_else(|| "NOERRMSG".into()),
        ctx.n_warn.to_string(),
        ctx.n_crit.to_string(),
    ]
}

/// Delivers one notification; returns the notifier's exit code.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Run the notifier with the given argument vector (executable
    /// first) and wait for it.
    async fn notify(&self, argv: &[String]) -> Result<i32>;
}

/// The production notifier: spawn the executable and wait.
#[derive(Debug, Default)]
pub struct ExecNotifier;

#[async_trait]
impl Notifier for ExecNotifier {
    async fn notify(&self, argv: &[String]) -> Result<i32> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HealthError::Notifier("empty argument vector".into()))?;

        debug!(notifier = %program, "executing alarm notification");

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                error!(notifier = %program, error = %e, "cannot spawn notifier");
                HealthError::Notifier(format!("cannot spawn '{program}': {e}"))
            })?;

        Ok(status.code().unwrap_or(-1))
    }
}

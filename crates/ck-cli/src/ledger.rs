//! File-backed alarm service and console notifier for the `ck` front end.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ck_core::{AlarmKind, AlarmService, NotificationService, Plan, PlanId};
use ck_utils::{write_atomic, FileLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One pending alarm. At most one exists per `(kind, plan_id)`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub kind: AlarmKind,
    pub plan_id: PlanId,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Alarm service that records pending alarms in a JSON file.
///
/// Nothing fires by itself; `ck watch` polls [`LedgerAlarms::take_due`].
/// Every read and rewrite holds `alarms.json.lock`, so separate `ck`
/// processes can share one ledger.
#[derive(Debug)]
pub struct LedgerAlarms {
    path: PathBuf,
    exact: bool,
    lock: Mutex<()>,
}

impl LedgerAlarms {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            exact: true,
            lock: Mutex::new(()),
        }
    }

    /// Report exact alarms as unavailable; every schedule call is refused.
    #[must_use]
    pub fn without_exact_alarms(mut self) -> Self {
        self.exact = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pending alarms ordered by fire time.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let _shared = FileLock::shared(&self.path).context("failed to lock ledger")?;
        let mut entries = self.load()?;
        entries.sort_by_key(|entry| entry.at);
        Ok(entries)
    }

    /// Remove and return every alarm due at or before `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?;
        let _exclusive = FileLock::exclusive(&self.path).context("failed to lock ledger")?;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.load()?.into_iter().partition(|entry| entry.at <= now);
        if !due.is_empty() {
            self.save(&pending)?;
        }
        due.sort_by_key(|entry| entry.at);
        Ok(due)
    }

    fn load(&self) -> Result<Vec<LedgerEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(&contents) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!("discarding unreadable alarm ledger {}: {err}", self.path.display());
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, entries: &[LedgerEntry]) -> Result<()> {
        let contents = serde_json::to_string_pretty(entries).context("failed to encode ledger")?;
        write_atomic(&self.path, contents.as_bytes()).context("failed to write ledger")?;
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut Vec<LedgerEntry>)) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?;
        let _exclusive = FileLock::exclusive(&self.path).context("failed to lock ledger")?;
        let mut entries = self.load()?;
        change(&mut entries);
        self.save(&entries)
    }
}

impl AlarmService for LedgerAlarms {
    fn can_schedule_exact(&self) -> bool {
        self.exact
    }

    fn schedule_exact_at(
        &self,
        kind: AlarmKind,
        plan_id: PlanId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> bool {
        if !self.exact {
            debug!("refusing {kind} alarm for plan {plan_id}: exact alarms unavailable");
            return false;
        }
        let entry = LedgerEntry {
            kind,
            plan_id,
            at,
            reason: reason.to_string(),
        };
        let result = self.update(|entries| {
            entries.retain(|existing| !(existing.kind == kind && existing.plan_id == plan_id));
            entries.push(entry);
        });
        match result {
            Ok(()) => {
                debug!("{kind} alarm for plan {plan_id} set for {at} ({reason})");
                true
            }
            Err(err) => {
                warn!("cannot record {kind} alarm for plan {plan_id}: {err:#}");
                false
            }
        }
    }

    fn cancel(&self, kind: AlarmKind, plan_id: PlanId) {
        let result = self.update(|entries| {
            entries.retain(|existing| !(existing.kind == kind && existing.plan_id == plan_id));
        });
        if let Err(err) = result {
            warn!("cannot cancel {kind} alarm for plan {plan_id}: {err:#}");
        }
    }
}

/// Notification service that prints to stdout.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl NotificationService for ConsoleNotifier {
    fn show(&self, plan: &Plan, reason: &str) {
        println!(
            "[#{}] {} ({}) - run `ck plan confirm {}` to stop",
            plan.notification_id, plan.name, plan.time, plan.id
        );
        debug!("notification {} shown ({reason})", plan.notification_id);
    }

    fn cancel(&self, plan: &Plan) {
        debug!("notification {} cleared", plan.notification_id);
    }
}

//! Core domain entities, rules, and capability traits for Chimekeep.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, Local, TimeZone};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod trigger;

pub use trigger::{
    date_from_epoch_day, epoch_day, next_daily_trigger, next_interval_trigger, next_trigger_for,
};

/// Maximum number of plans a store may hold.
pub const MAX_PLANS: usize = 10;

/// Maximum length of a plan name, in characters.
pub const MAX_NAME_LEN: usize = 40;

/// Largest accepted interval for interval-day repeats.
pub const MAX_INTERVAL_DAYS: u16 = 365;

/// Name used when a plan has to be synthesized or its stored name is unusable.
pub const DEFAULT_PLAN_NAME: &str = "Reminder";

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by core validation and domain rules.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Returned when a validation rule is violated.
    #[error("validation error: {0}")]
    Validation(String),
    /// Returned when repository operations fail.
    #[error("storage error: {0}")]
    Storage(String),
    /// Returned when the plan store already holds the maximum number of plans.
    #[error("plan limit of {0} reached")]
    CapacityExceeded(usize),
}

/// Opaque, immutable identifier of a plan.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PlanId(Uuid);

impl PlanId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Access the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PlanId {
    type Err = CoreError;

    fn from_str(value: &str) -> CoreResult<Self> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|err| CoreError::Validation(format!("invalid plan id {value:?}: {err}")))
    }
}

/// A display name for a plan.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PlanName {
    value: String,
}

impl PlanName {
    /// Create a new name, trimming whitespace and rejecting blank or overlong values.
    pub fn new(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(CoreError::Validation("name cannot be empty".into()));
        }
        if value.chars().count() > MAX_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "name cannot exceed {MAX_NAME_LEN} characters"
            )));
        }
        Ok(Self { value })
    }

    /// Access the name.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl Default for PlanName {
    fn default() -> Self {
        Self {
            value: DEFAULT_PLAN_NAME.to_string(),
        }
    }
}

impl fmt::Display for PlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// A wall-clock time of day with minute precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    /// Create a time of day, rejecting out-of-range components.
    pub fn new(hour: u8, minute: u8) -> CoreResult<Self> {
        if hour > 23 {
            return Err(CoreError::Validation(format!(
                "hour must be within 0..=23, got {hour}"
            )));
        }
        if minute > 59 {
            return Err(CoreError::Validation(format!(
                "minute must be within 0..=59, got {minute}"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Hour component.
    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// Minute component.
    pub fn minute(&self) -> u8 {
        self.minute
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = CoreError;

    /// Parse `HH:MM` in 24-hour notation.
    fn from_str(value: &str) -> CoreResult<Self> {
        let invalid = || CoreError::Validation(format!("expected HH:MM, got {value:?}"));
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

/// Wire-level repeat discriminator.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatMode {
    /// Fires every day.
    Daily,
    /// Fires every N days counted from an anchor date.
    IntervalDays,
}

/// How a plan repeats. Construction keeps interval configs consistent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepeatRule {
    /// Every day at the plan's time.
    Daily,
    /// Every `interval_days` days, anchored at `start_date_epoch_day`.
    IntervalDays {
        /// Days between occurrences, within `1..=365`.
        interval_days: u16,
        /// Anchor date as days since 1970-01-01.
        start_date_epoch_day: i64,
    },
}

impl RepeatRule {
    /// Strictly build an interval rule.
    pub fn interval(interval_days: u16, start_date_epoch_day: i64) -> CoreResult<Self> {
        if !(1..=MAX_INTERVAL_DAYS).contains(&interval_days) {
            return Err(CoreError::Validation(format!(
                "interval must be within 1..={MAX_INTERVAL_DAYS} days, got {interval_days}"
            )));
        }
        date_from_epoch_day(start_date_epoch_day)?;
        Ok(Self::IntervalDays {
            interval_days,
            start_date_epoch_day,
        })
    }

    /// Strictly build a rule from its wire triple, failing on inconsistent interval configs.
    pub fn strict(
        mode: RepeatMode,
        interval_days: i64,
        start_date_epoch_day: Option<i64>,
    ) -> CoreResult<Self> {
        match mode {
            RepeatMode::Daily => Ok(Self::Daily),
            RepeatMode::IntervalDays => {
                let start = start_date_epoch_day.ok_or_else(|| {
                    CoreError::Validation("interval repeat requires a start date".into())
                })?;
                let days = u16::try_from(interval_days).map_err(|_| {
                    CoreError::Validation(format!(
                        "interval must be within 1..={MAX_INTERVAL_DAYS} days, got {interval_days}"
                    ))
                })?;
                Self::interval(days, start)
            }
        }
    }

    /// Leniently build a rule from its wire triple, falling back to daily.
    pub fn normalize(
        mode: RepeatMode,
        interval_days: i64,
        start_date_epoch_day: Option<i64>,
    ) -> Self {
        Self::strict(mode, interval_days, start_date_epoch_day).unwrap_or(Self::Daily)
    }

    /// Wire-level mode.
    pub fn mode(&self) -> RepeatMode {
        match self {
            Self::Daily => RepeatMode::Daily,
            Self::IntervalDays { .. } => RepeatMode::IntervalDays,
        }
    }

    /// Interval in days; always 1 for daily rules.
    pub fn interval_days(&self) -> u16 {
        match self {
            Self::Daily => 1,
            Self::IntervalDays { interval_days, .. } => *interval_days,
        }
    }

    /// Anchor date; `None` for daily rules.
    pub fn start_date_epoch_day(&self) -> Option<i64> {
        match self {
            Self::Daily => None,
            Self::IntervalDays {
                start_date_epoch_day,
                ..
            } => Some(*start_date_epoch_day),
        }
    }
}

impl fmt::Display for RepeatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::IntervalDays {
                interval_days,
                start_date_epoch_day,
            } => match date_from_epoch_day(*start_date_epoch_day) {
                Ok(date) => write!(f, "every {interval_days} days from {date}"),
                Err(_) => write!(f, "every {interval_days} days"),
            },
        }
    }
}

/// A persisted reminder plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    /// Unique identifier, assigned at creation.
    pub id: PlanId,
    /// Display name.
    pub name: PlanName,
    /// Time of day the reminder fires.
    pub time: TimeOfDay,
    /// Repeat rule.
    pub repeat: RepeatRule,
    /// Whether the plan has outstanding scheduled alarms.
    pub enabled: bool,
    /// Stable id of the displayed notification, never reused.
    pub notification_id: u32,
    /// True between a fired alarm and the user's confirmation.
    pub is_reminder_active: bool,
    /// One-shot flag disarming the next dismissal fallback.
    pub suppress_next_delete_fallback: bool,
}

/// Caller-supplied fields for a new plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanDraft {
    /// Raw display name, validated on insert.
    pub name: String,
    /// Hour of day.
    pub hour: u8,
    /// Minute of hour.
    pub minute: u8,
    /// Repeat rule.
    pub repeat: RepeatRule,
    /// Initial enabled flag.
    pub enabled: bool,
}

/// Which of a plan's two alarms is meant.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmKind {
    /// Recurring alarm that produces the reminder and reschedules itself.
    Daily,
    /// One-shot alarm that re-surfaces a dismissed, unconfirmed reminder.
    Fallback,
}

impl AlarmKind {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar stored in the key-value collaborator.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum KvValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Text value.
    Text(String),
}

/// A single write applied to the key-value collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvEdit {
    /// Insert or replace a key.
    Put(String, KvValue),
    /// Remove a key if present.
    Remove(String),
}

impl KvEdit {
    /// Shorthand for a put edit.
    pub fn put(key: &str, value: KvValue) -> Self {
        Self::Put(key.to_string(), value)
    }

    /// Shorthand for a remove edit.
    pub fn remove(key: &str) -> Self {
        Self::Remove(key.to_string())
    }
}

/// Exclusive access to a key-value backend, released on drop.
pub struct KvLease {
    held: Option<Box<dyn Send>>,
}

impl KvLease {
    /// Lease for backends that need no extra exclusion.
    pub fn unguarded() -> Self {
        Self { held: None }
    }

    /// Lease that keeps `guard` alive until dropped.
    pub fn holding(guard: impl Send + 'static) -> Self {
        Self {
            held: Some(Box::new(guard)),
        }
    }
}

impl fmt::Debug for KvLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvLease")
            .field("guarded", &self.held.is_some())
            .finish()
    }
}

/// Persistent key-value collaborator used by the plan store.
pub trait KeyValueStore: Send + Sync {
    /// Read a single key.
    fn get(&self, key: &str) -> CoreResult<Option<KvValue>>;
    /// Apply a batch of edits atomically.
    fn apply(&self, edits: &[KvEdit]) -> CoreResult<()>;

    /// Exclude other writers, including other processes, until the lease drops.
    ///
    /// The plan store holds one lease across each read-modify-write.
    fn lease(&self) -> CoreResult<KvLease> {
        Ok(KvLease::unguarded())
    }

    /// Check whether a key is present.
    fn contains(&self, key: &str) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Read an integer key; values of another type read as absent.
    fn get_int(&self, key: &str) -> CoreResult<Option<i64>> {
        Ok(match self.get(key)? {
            Some(KvValue::Int(value)) => Some(value),
            _ => None,
        })
    }

    /// Read a boolean key; values of another type read as absent.
    fn get_bool(&self, key: &str) -> CoreResult<Option<bool>> {
        Ok(match self.get(key)? {
            Some(KvValue::Bool(value)) => Some(value),
            _ => None,
        })
    }

    /// Read a text key; values of another type read as absent.
    fn get_text(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(match self.get(key)? {
            Some(KvValue::Text(value)) => Some(value),
            _ => None,
        })
    }
}

/// Exact-alarm capability provided by the host platform.
pub trait AlarmService: Send + Sync {
    /// Whether exact alarms can currently be scheduled.
    fn can_schedule_exact(&self) -> bool;
    /// Schedule (or replace) the alarm of `kind` for `plan_id`. Returns false when denied.
    fn schedule_exact_at(
        &self,
        kind: AlarmKind,
        plan_id: PlanId,
        at: DateTime<chrono::Utc>,
        reason: &str,
    ) -> bool;
    /// Cancel the alarm of `kind` for `plan_id`; no-op when nothing is scheduled.
    fn cancel(&self, kind: AlarmKind, plan_id: PlanId);
}

/// Notification surface provided by the host platform.
pub trait NotificationService: Send + Sync {
    /// Show or update the notification identified by the plan's notification id.
    fn show(&self, plan: &Plan, reason: &str);
    /// Remove the plan's notification if present.
    fn cancel(&self, plan: &Plan);
}

/// Source of the current instant in the user's timezone.
pub trait Clock: Send + Sync {
    /// Timezone used for wall-clock computations.
    type Tz: TimeZone;
    /// Current instant.
    fn now(&self) -> DateTime<Self::Tz>;
}

/// Clock backed by the system time and local timezone.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Tz = Local;

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Manually driven clock with a fixed UTC offset.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: DateTime<FixedOffset>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = *guard + delta;
        }
    }
}

impl Clock for ManualClock {
    type Tz = FixedOffset;

    fn now(&self) -> DateTime<FixedOffset> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

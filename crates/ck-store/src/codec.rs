//! JSON encoding of the persisted plan list.

use std::collections::HashSet;

use ck_core::{
    CoreError, CoreResult, Plan, PlanId, PlanName, RepeatMode, RepeatRule, TimeOfDay,
    MAX_NAME_LEN,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize)]
struct EncodedPlan<'a> {
    id: PlanId,
    name: &'a str,
    hour: u8,
    minute: u8,
    repeat_mode: RepeatMode,
    interval_days: u16,
    start_date_epoch_day: Option<i64>,
    enabled: bool,
    notification_id: u32,
    is_reminder_active: bool,
    suppress_next_delete_fallback: bool,
}

impl<'a> From<&'a Plan> for EncodedPlan<'a> {
    fn from(plan: &'a Plan) -> Self {
        Self {
            id: plan.id,
            name: plan.name.as_str(),
            hour: plan.time.hour(),
            minute: plan.time.minute(),
            repeat_mode: plan.repeat.mode(),
            interval_days: plan.repeat.interval_days(),
            start_date_epoch_day: plan.repeat.start_date_epoch_day(),
            enabled: plan.enabled,
            notification_id: plan.notification_id,
            is_reminder_active: plan.is_reminder_active,
            suppress_next_delete_fallback: plan.suppress_next_delete_fallback,
        }
    }
}

/// Every field optional so one bad entry never fails the whole list.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoredPlan {
    id: Option<String>,
    name: Option<String>,
    hour: Option<i64>,
    minute: Option<i64>,
    repeat_mode: Option<String>,
    interval_days: Option<i64>,
    start_date_epoch_day: Option<i64>,
    enabled: Option<bool>,
    notification_id: Option<i64>,
    is_reminder_active: Option<bool>,
    suppress_next_delete_fallback: Option<bool>,
}

impl StoredPlan {
    fn into_plan(self) -> Option<Plan> {
        let id = self.id?.parse::<PlanId>().ok()?;
        let hour = u8::try_from(self.hour?).ok()?;
        let minute = u8::try_from(self.minute?).ok()?;
        let time = TimeOfDay::new(hour, minute).ok()?;
        let notification_id = u32::try_from(self.notification_id?)
            .ok()
            .filter(|value| *value > 0)?;
        let mode = match self.repeat_mode.as_deref() {
            Some("INTERVAL_DAYS") => RepeatMode::IntervalDays,
            _ => RepeatMode::Daily,
        };
        let repeat = RepeatRule::normalize(
            mode,
            self.interval_days.unwrap_or(1),
            self.start_date_epoch_day,
        );

        Some(Plan {
            id,
            name: lenient_name(self.name.as_deref()),
            time,
            repeat,
            enabled: self.enabled.unwrap_or(false),
            notification_id,
            is_reminder_active: self.is_reminder_active.unwrap_or(false),
            suppress_next_delete_fallback: self.suppress_next_delete_fallback.unwrap_or(false),
        })
    }
}

fn lenient_name(raw: Option<&str>) -> PlanName {
    let trimmed: String = raw
        .unwrap_or_default()
        .trim()
        .chars()
        .take(MAX_NAME_LEN)
        .collect();
    PlanName::new(trimmed).unwrap_or_default()
}

/// Encode plans in store order.
pub fn encode_plans(plans: &[Plan]) -> CoreResult<String> {
    let encoded: Vec<EncodedPlan<'_>> = plans.iter().map(EncodedPlan::from).collect();
    serde_json::to_string(&encoded).map_err(|err| CoreError::Storage(err.to_string()))
}

/// Decode a stored plan list.
///
/// Entries with a missing id, an out-of-range time or a non-positive
/// notification id are dropped, as are repeated ids. An unreadable document
/// decodes to an empty list.
pub fn decode_plans(text: &str) -> Vec<Plan> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(text) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("discarding unreadable plan list: {err}");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut plans = Vec::with_capacity(entries.len());
    for entry in entries {
        let plan = serde_json::from_value::<StoredPlan>(entry)
            .ok()
            .and_then(StoredPlan::into_plan);
        match plan {
            Some(plan) if seen.insert(plan.id) => plans.push(plan),
            Some(plan) => warn!("dropping duplicate plan entry {}", plan.id),
            None => warn!("dropping malformed plan entry"),
        }
    }
    plans
}

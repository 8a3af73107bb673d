//! Forward migration of the persisted store schema.
//!
//! Version 1 stored a single reminder as loose keys. Version 2 stores an
//! ordered plan list plus a notification-id counter.

use chrono::{Duration, NaiveDateTime, Timelike};
use ck_core::{
    CoreResult, KeyValueStore, KvEdit, KvValue, Plan, PlanId, PlanName, RepeatRule, TimeOfDay,
};
use tracing::info;

use crate::codec::{decode_plans, encode_plans};
use crate::{
    DEFAULT_NOTIFICATION_ID, KEY_NEXT_NOTIFICATION_ID, KEY_PLANS_JSON, KEY_SCHEMA_VERSION,
    SCHEMA_VERSION,
};

/// Legacy single-plan enabled flag.
pub const LEGACY_KEY_ENABLED: &str = "reminder_enabled";
/// Legacy single-plan hour.
pub const LEGACY_KEY_HOUR: &str = "reminder_hour";
/// Legacy single-plan minute.
pub const LEGACY_KEY_MINUTE: &str = "reminder_minute";
/// Legacy single-plan active flag.
pub const LEGACY_KEY_ACTIVE: &str = "is_reminder_active";
/// Legacy single-plan suppress flag.
pub const LEGACY_KEY_SUPPRESS: &str = "suppress_next_delete_fallback";

const LEGACY_KEYS: [&str; 5] = [
    LEGACY_KEY_ENABLED,
    LEGACY_KEY_HOUR,
    LEGACY_KEY_MINUTE,
    LEGACY_KEY_ACTIVE,
    LEGACY_KEY_SUPPRESS,
];

/// What a migration pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The store was already at the current schema.
    AlreadyCurrent,
    /// An existing plan list was kept and the schema markers were written.
    KeptExisting,
    /// One plan was synthesized from legacy single-plan keys.
    FromLegacy,
    /// Nothing was stored; an empty plan list was initialized.
    Initialized,
}

/// Whether the store already carries the current schema.
pub fn is_current(kv: &dyn KeyValueStore) -> CoreResult<bool> {
    let version = kv.get_int(KEY_SCHEMA_VERSION)?.unwrap_or(0);
    Ok(version >= SCHEMA_VERSION
        && kv.contains(KEY_PLANS_JSON)?
        && kv.contains(KEY_NEXT_NOTIFICATION_ID)?)
}

/// Bring the store to the current schema. `local_now` seeds the legacy
/// plan's time when none was stored.
pub fn migrate(kv: &dyn KeyValueStore, local_now: NaiveDateTime) -> CoreResult<MigrationOutcome> {
    if is_current(kv)? {
        return Ok(MigrationOutcome::AlreadyCurrent);
    }

    let (plans, outcome) = if let Some(text) = kv.get_text(KEY_PLANS_JSON)? {
        (decode_plans(&text), MigrationOutcome::KeptExisting)
    } else if has_legacy_keys(kv)? {
        (vec![legacy_plan(kv, local_now)?], MigrationOutcome::FromLegacy)
    } else {
        (Vec::new(), MigrationOutcome::Initialized)
    };

    let next_id = seed_notification_counter(&plans, kv.get_int(KEY_NEXT_NOTIFICATION_ID)?);

    let mut edits = vec![
        KvEdit::put(KEY_SCHEMA_VERSION, KvValue::Int(SCHEMA_VERSION)),
        KvEdit::put(KEY_PLANS_JSON, KvValue::Text(encode_plans(&plans)?)),
        KvEdit::put(KEY_NEXT_NOTIFICATION_ID, KvValue::Int(i64::from(next_id))),
    ];
    edits.extend(LEGACY_KEYS.iter().map(|key| KvEdit::remove(key)));
    kv.apply(&edits)?;

    info!(
        "migrated plan store to schema {SCHEMA_VERSION} ({outcome:?}, {} plans, next notification id {next_id})",
        plans.len()
    );
    Ok(outcome)
}

fn has_legacy_keys(kv: &dyn KeyValueStore) -> CoreResult<bool> {
    for key in LEGACY_KEYS {
        if kv.contains(key)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn legacy_plan(kv: &dyn KeyValueStore, local_now: NaiveDateTime) -> CoreResult<Plan> {
    let stored_time = match (kv.get_int(LEGACY_KEY_HOUR)?, kv.get_int(LEGACY_KEY_MINUTE)?) {
        (Some(hour), Some(minute)) => match (u8::try_from(hour), u8::try_from(minute)) {
            (Ok(hour), Ok(minute)) => TimeOfDay::new(hour, minute).ok(),
            _ => None,
        },
        _ => None,
    };
    let time = match stored_time {
        Some(time) => time,
        None => one_minute_after(local_now)?,
    };

    Ok(Plan {
        id: PlanId::generate(),
        name: PlanName::default(),
        time,
        repeat: RepeatRule::Daily,
        enabled: kv.get_bool(LEGACY_KEY_ENABLED)?.unwrap_or(false),
        notification_id: DEFAULT_NOTIFICATION_ID,
        is_reminder_active: kv.get_bool(LEGACY_KEY_ACTIVE)?.unwrap_or(false),
        suppress_next_delete_fallback: kv.get_bool(LEGACY_KEY_SUPPRESS)?.unwrap_or(false),
    })
}

fn one_minute_after(local_now: NaiveDateTime) -> CoreResult<TimeOfDay> {
    let next = local_now + Duration::minutes(1);
    // Both components come from a valid clock reading.
    TimeOfDay::new(
        u8::try_from(next.hour()).unwrap_or(0),
        u8::try_from(next.minute()).unwrap_or(0),
    )
}

/// One past the highest id in use, never below the stored counter or the default.
fn seed_notification_counter(plans: &[Plan], stored: Option<i64>) -> u32 {
    let after_plans = plans
        .iter()
        .map(|plan| plan.notification_id.saturating_add(1))
        .max()
        .unwrap_or(DEFAULT_NOTIFICATION_ID);
    let stored = stored
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(DEFAULT_NOTIFICATION_ID);
    after_plans.max(stored).max(DEFAULT_NOTIFICATION_ID)
}

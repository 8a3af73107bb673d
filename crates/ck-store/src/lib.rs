//! Persisted plan store for Chimekeep.
//!
//! The whole store (plan list plus notification-id counter) lives in a
//! key-value collaborator and is rewritten as a unit. Every operation first
//! brings the schema up to date, and every mutation runs under one lock owned
//! by the [`PlanStore`] instance.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Local, NaiveDateTime};
use ck_core::{
    CoreError, CoreResult, KeyValueStore, KvEdit, KvLease, KvValue, Plan, PlanDraft, PlanId, PlanName,
    RepeatRule, TimeOfDay, MAX_PLANS,
};
use tracing::debug;

pub mod codec;
pub mod kv;
pub mod migrate;

pub use codec::{decode_plans, encode_plans};
pub use kv::{JsonFileKv, MemoryKv};
pub use migrate::MigrationOutcome;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 2;

/// First notification id handed out by an empty store.
pub const DEFAULT_NOTIFICATION_ID: u32 = 1001;

/// Key holding the schema version.
pub const KEY_SCHEMA_VERSION: &str = "schema_version";
/// Key holding the encoded plan list.
pub const KEY_PLANS_JSON: &str = "plans_json";
/// Key holding the next notification id.
pub const KEY_NEXT_NOTIFICATION_ID: &str = "next_notification_id";

type WallClock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Held for the duration of one store operation.
struct OperationGuard<'a> {
    _lease: KvLease,
    _lock: MutexGuard<'a, ()>,
}

struct Snapshot {
    plans: Vec<Plan>,
    next_notification_id: u32,
}

/// Ordered, persisted collection of plans.
pub struct PlanStore {
    kv: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
    wall_clock: WallClock,
}

impl std::fmt::Debug for PlanStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanStore").finish_non_exhaustive()
    }
}

impl PlanStore {
    /// Create a store over `kv`, using the local wall clock for migration defaults.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
            wall_clock: Box::new(|| Local::now().naive_local()),
        }
    }

    /// Replace the wall clock used when synthesizing a legacy plan.
    #[must_use]
    pub fn with_wall_clock(
        mut self,
        wall_clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static,
    ) -> Self {
        self.wall_clock = Box::new(wall_clock);
        self
    }

    /// All plans in display order.
    pub fn list(&self) -> CoreResult<Vec<Plan>> {
        let _guard = self.ready()?;
        Ok(self.load()?.plans)
    }

    /// A single plan by id.
    pub fn get(&self, id: PlanId) -> CoreResult<Option<Plan>> {
        let _guard = self.ready()?;
        Ok(self.load()?.plans.into_iter().find(|plan| plan.id == id))
    }

    /// First plan in display order.
    pub fn first(&self) -> CoreResult<Option<Plan>> {
        let _guard = self.ready()?;
        Ok(self.load()?.plans.into_iter().next())
    }

    /// Number of stored plans.
    pub fn count(&self) -> CoreResult<usize> {
        let _guard = self.ready()?;
        Ok(self.load()?.plans.len())
    }

    /// Whether another plan would exceed the plan limit.
    pub fn is_full(&self) -> CoreResult<bool> {
        Ok(self.count()? >= MAX_PLANS)
    }

    /// Validate and append a new plan, allocating its notification id.
    pub fn add(&self, draft: PlanDraft) -> CoreResult<Plan> {
        let name = PlanName::new(draft.name)?;
        let time = TimeOfDay::new(draft.hour, draft.minute)?;
        let repeat = RepeatRule::strict(
            draft.repeat.mode(),
            i64::from(draft.repeat.interval_days()),
            draft.repeat.start_date_epoch_day(),
        )?;

        let _guard = self.ready()?;
        let mut snapshot = self.load()?;
        if snapshot.plans.len() >= MAX_PLANS {
            return Err(CoreError::CapacityExceeded(MAX_PLANS));
        }
        let plan = Plan {
            id: PlanId::generate(),
            name,
            time,
            repeat,
            enabled: draft.enabled,
            notification_id: snapshot.next_notification_id,
            is_reminder_active: false,
            suppress_next_delete_fallback: false,
        };
        snapshot.next_notification_id = snapshot.next_notification_id.saturating_add(1);
        snapshot.plans.push(plan.clone());
        self.commit(&snapshot)?;
        debug!(
            "added plan {} with notification id {}",
            plan.id, plan.notification_id
        );
        Ok(plan)
    }

    /// Replace a stored plan's fields. Returns `false` when the id is absent.
    ///
    /// The id and notification id of the stored record are kept; the repeat
    /// rule is normalized.
    pub fn update(&self, plan: &Plan) -> CoreResult<bool> {
        let updated = self.modify(plan.id, |stored| {
            let notification_id = stored.notification_id;
            *stored = plan.clone();
            stored.notification_id = notification_id;
            stored.repeat = RepeatRule::normalize(
                plan.repeat.mode(),
                i64::from(plan.repeat.interval_days()),
                plan.repeat.start_date_epoch_day(),
            );
        })?;
        Ok(updated.is_some())
    }

    /// Apply `change` to the stored plan under the store lock and persist it.
    pub fn modify(&self, id: PlanId, change: impl FnOnce(&mut Plan)) -> CoreResult<Option<Plan>> {
        let _guard = self.ready()?;
        let mut snapshot = self.load()?;
        let Some(stored) = snapshot.plans.iter_mut().find(|plan| plan.id == id) else {
            return Ok(None);
        };
        change(stored);
        let updated = stored.clone();
        self.commit(&snapshot)?;
        Ok(Some(updated))
    }

    /// Remove a plan, returning the removed record.
    pub fn delete(&self, id: PlanId) -> CoreResult<Option<Plan>> {
        let _guard = self.ready()?;
        let mut snapshot = self.load()?;
        let Some(position) = snapshot.plans.iter().position(|plan| plan.id == id) else {
            return Ok(None);
        };
        let removed = snapshot.plans.remove(position);
        self.commit(&snapshot)?;
        debug!("deleted plan {id}");
        Ok(Some(removed))
    }

    /// Move a plan one slot earlier. Returns `false` when the id is absent.
    pub fn move_up(&self, id: PlanId) -> CoreResult<bool> {
        self.shift(id, |position, _| position.checked_sub(1))
    }

    /// Move a plan one slot later. Returns `false` when the id is absent.
    pub fn move_down(&self, id: PlanId) -> CoreResult<bool> {
        self.shift(id, |position, len| {
            let target = position + 1;
            (target < len).then_some(target)
        })
    }

    /// Record that the plan's reminder fired and is waiting for confirmation.
    ///
    /// Any leftover suppress flag is cleared so the next dismissal of this
    /// reminder is treated as a real swipe-away.
    pub fn mark_triggered(&self, id: PlanId) -> CoreResult<Option<Plan>> {
        self.modify(id, |plan| {
            plan.is_reminder_active = true;
            plan.suppress_next_delete_fallback = false;
        })
    }

    /// [`PlanStore::mark_triggered`] for enabled plans only, decided under the
    /// same lock as the write. A disabled plan is returned unchanged.
    pub fn mark_triggered_if_enabled(&self, id: PlanId) -> CoreResult<Option<Plan>> {
        let _guard = self.ready()?;
        let mut snapshot = self.load()?;
        let Some(stored) = snapshot.plans.iter_mut().find(|plan| plan.id == id) else {
            return Ok(None);
        };
        if !stored.enabled {
            return Ok(Some(stored.clone()));
        }
        stored.is_reminder_active = true;
        stored.suppress_next_delete_fallback = false;
        let updated = stored.clone();
        self.commit(&snapshot)?;
        Ok(Some(updated))
    }

    /// Record the user's confirmation and arm the dismissal suppression.
    pub fn mark_confirmed(&self, id: PlanId) -> CoreResult<Option<Plan>> {
        self.modify(id, |plan| {
            plan.is_reminder_active = false;
            plan.suppress_next_delete_fallback = true;
        })
    }

    /// Clear the suppress flag, reporting whether it was set.
    pub fn consume_suppress_flag(&self, id: PlanId) -> CoreResult<bool> {
        let _guard = self.ready()?;
        let mut snapshot = self.load()?;
        let Some(plan) = snapshot.plans.iter_mut().find(|plan| plan.id == id) else {
            return Ok(false);
        };
        if !plan.suppress_next_delete_fallback {
            return Ok(false);
        }
        plan.suppress_next_delete_fallback = false;
        self.commit(&snapshot)?;
        Ok(true)
    }

    fn shift(
        &self,
        id: PlanId,
        target: impl FnOnce(usize, usize) -> Option<usize>,
    ) -> CoreResult<bool> {
        let _guard = self.ready()?;
        let mut snapshot = self.load()?;
        let Some(position) = snapshot.plans.iter().position(|plan| plan.id == id) else {
            return Ok(false);
        };
        if let Some(target) = target(position, snapshot.plans.len()) {
            snapshot.plans.swap(position, target);
            self.commit(&snapshot)?;
        }
        Ok(true)
    }

    /// Take the store lock and the backend lease, then migrate if needed.
    fn ready(&self) -> CoreResult<OperationGuard<'_>> {
        let lock = self
            .lock
            .lock()
            .map_err(|_| CoreError::Storage("plan store lock poisoned".into()))?;
        let lease = self.kv.lease()?;
        migrate::migrate(self.kv.as_ref(), (self.wall_clock)())?;
        Ok(OperationGuard {
            _lease: lease,
            _lock: lock,
        })
    }

    fn load(&self) -> CoreResult<Snapshot> {
        let plans = self
            .kv
            .get_text(KEY_PLANS_JSON)?
            .map(|text| decode_plans(&text))
            .unwrap_or_default();
        let next_notification_id = self
            .kv
            .get_int(KEY_NEXT_NOTIFICATION_ID)?
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(DEFAULT_NOTIFICATION_ID);
        Ok(Snapshot {
            plans,
            next_notification_id,
        })
    }

    fn commit(&self, snapshot: &Snapshot) -> CoreResult<()> {
        self.kv.apply(&[
            KvEdit::put(KEY_PLANS_JSON, KvValue::Text(encode_plans(&snapshot.plans)?)),
            KvEdit::put(
                KEY_NEXT_NOTIFICATION_ID,
                KvValue::Int(i64::from(snapshot.next_notification_id)),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn store() -> PlanStore {
        PlanStore::new(Arc::new(MemoryKv::new())).with_wall_clock(|| {
            NaiveDate::from_ymd_opt(2024, 3, 10)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap()
        })
    }

    fn draft(name: &str) -> PlanDraft {
        PlanDraft {
            name: name.into(),
            hour: 8,
            minute: 30,
            repeat: RepeatRule::Daily,
            enabled: true,
        }
    }

    fn names(store: &PlanStore) -> Vec<String> {
        store
            .list()
            .unwrap()
            .into_iter()
            .map(|plan| plan.name.as_str().to_string())
            .collect()
    }

    #[test]
    fn add_allocates_increasing_notification_ids() {
        let store = store();
        let first = store.add(draft("A")).unwrap();
        let second = store.add(draft("B")).unwrap();
        assert_eq!(first.notification_id, DEFAULT_NOTIFICATION_ID);
        assert_eq!(second.notification_id, DEFAULT_NOTIFICATION_ID + 1);
        assert_eq!(store.get(first.id).unwrap(), Some(first));
    }

    #[test]
    fn notification_ids_are_not_reused_after_delete() {
        let store = store();
        let first = store.add(draft("A")).unwrap();
        store.delete(first.id).unwrap();
        let second = store.add(draft("B")).unwrap();
        assert!(second.notification_id > first.notification_id);
    }

    #[test]
    fn add_rejects_invalid_fields() {
        let store = store();
        assert!(matches!(
            store.add(draft("  ")),
            Err(CoreError::Validation(_))
        ));
        let mut late = draft("late");
        late.hour = 24;
        assert!(matches!(store.add(late), Err(CoreError::Validation(_))));
        let mut bad_interval = draft("interval");
        bad_interval.repeat = RepeatRule::IntervalDays {
            interval_days: 0,
            start_date_epoch_day: 19_000,
        };
        assert!(matches!(
            store.add(bad_interval),
            Err(CoreError::Validation(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn add_fails_at_capacity() {
        let store = store();
        for index in 0..MAX_PLANS {
            store.add(draft(&format!("plan {index}"))).unwrap();
        }
        assert!(store.is_full().unwrap());
        assert!(matches!(
            store.add(draft("one too many")),
            Err(CoreError::CapacityExceeded(MAX_PLANS))
        ));
    }

    #[test]
    fn update_keeps_notification_id_and_ignores_unknown() {
        let store = store();
        let plan = store.add(draft("A")).unwrap();
        let mut edited = plan.clone();
        edited.name = PlanName::new("Renamed").unwrap();
        edited.notification_id = 42;
        assert!(store.update(&edited).unwrap());
        let stored = store.get(plan.id).unwrap().unwrap();
        assert_eq!(stored.name.as_str(), "Renamed");
        assert_eq!(stored.notification_id, plan.notification_id);

        let mut stranger = plan;
        stranger.id = PlanId::generate();
        assert!(!store.update(&stranger).unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn moves_are_bounded() {
        let store = store();
        let a = store.add(draft("A")).unwrap();
        let _b = store.add(draft("B")).unwrap();
        let c = store.add(draft("C")).unwrap();

        assert!(store.move_up(a.id).unwrap());
        assert_eq!(names(&store), ["A", "B", "C"]);
        assert!(store.move_down(c.id).unwrap());
        assert_eq!(names(&store), ["A", "B", "C"]);

        store.move_down(a.id).unwrap();
        assert_eq!(names(&store), ["B", "A", "C"]);
        store.move_up(c.id).unwrap();
        assert_eq!(names(&store), ["B", "C", "A"]);
        assert!(!store.move_up(PlanId::generate()).unwrap());
    }

    #[test]
    fn confirm_then_consume_suppress_flag_once() {
        let store = store();
        let plan = store.add(draft("A")).unwrap();
        let triggered = store.mark_triggered(plan.id).unwrap().unwrap();
        assert!(triggered.is_reminder_active);

        let confirmed = store.mark_confirmed(plan.id).unwrap().unwrap();
        assert!(!confirmed.is_reminder_active);
        assert!(confirmed.suppress_next_delete_fallback);

        assert!(store.consume_suppress_flag(plan.id).unwrap());
        assert!(!store.consume_suppress_flag(plan.id).unwrap());
        assert!(!store.consume_suppress_flag(PlanId::generate()).unwrap());
    }

    #[test]
    fn conditional_trigger_leaves_disabled_plan_alone() {
        let store = store();
        let plan = store.add(draft("A")).unwrap();
        store.modify(plan.id, |plan| plan.enabled = false).unwrap();

        let untouched = store.mark_triggered_if_enabled(plan.id).unwrap().unwrap();
        assert!(!untouched.enabled);
        assert!(!untouched.is_reminder_active);
        assert_eq!(store.get(plan.id).unwrap(), Some(untouched));

        store.modify(plan.id, |plan| plan.enabled = true).unwrap();
        let triggered = store.mark_triggered_if_enabled(plan.id).unwrap().unwrap();
        assert!(triggered.is_reminder_active);
        assert!(store.mark_triggered_if_enabled(PlanId::generate()).unwrap().is_none());
    }

    #[test]
    fn trigger_clears_stale_suppress_flag() {
        let store = store();
        let plan = store.add(draft("A")).unwrap();
        store.mark_confirmed(plan.id).unwrap();
        let triggered = store.mark_triggered(plan.id).unwrap().unwrap();
        assert!(!triggered.suppress_next_delete_fallback);
    }

    #[test]
    fn state_persists_across_store_instances() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let plan = PlanStore::new(kv.clone()).add(draft("A")).unwrap();
        let reopened = PlanStore::new(kv);
        assert_eq!(reopened.list().unwrap(), vec![plan]);
        assert_eq!(
            reopened.add(draft("B")).unwrap().notification_id,
            DEFAULT_NOTIFICATION_ID + 1
        );
    }

    #[test]
    fn separate_handles_on_one_file_do_not_lose_updates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = PlanStore::new(Arc::new(JsonFileKv::new(path)));
                    for index in 0..2 {
                        store.add(draft(&format!("w{worker} p{index}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let plans = PlanStore::new(Arc::new(JsonFileKv::new(path))).list().unwrap();
        assert_eq!(plans.len(), 8);
        let mut ids: Vec<u32> = plans.iter().map(|plan| plan.notification_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn concurrent_adds_are_serialized() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|index| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.add(draft(&format!("plan {index}"))).unwrap())
            })
            .collect();
        let mut ids: Vec<u32> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().notification_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(store.count().unwrap(), 8);
    }
}

//! Recording fakes for the platform capabilities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use ck_core::{
    AlarmKind, AlarmService, CoreError, CoreResult, KeyValueStore, KvEdit, KvValue, ManualClock,
    NotificationService, Plan, PlanId,
};
use ck_store::{decode_plans, encode_plans, MemoryKv, PlanStore, KEY_PLANS_JSON};

use crate::ReminderEngine;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlarmCall {
    Schedule {
        kind: AlarmKind,
        plan_id: PlanId,
        at: DateTime<Utc>,
        reason: String,
    },
    Cancel {
        kind: AlarmKind,
        plan_id: PlanId,
    },
}

#[derive(Debug)]
pub struct RecordingAlarms {
    calls: Mutex<Vec<AlarmCall>>,
    accept: AtomicBool,
    available: AtomicBool,
}

impl RecordingAlarms {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
            available: AtomicBool::new(true),
        }
    }

    pub fn deny_scheduling(&self) {
        self.accept.store(false, Ordering::SeqCst);
    }

    pub fn allow_scheduling(&self) {
        self.accept.store(true, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AlarmCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn schedules(&self, kind: AlarmKind, plan_id: PlanId) -> Vec<(DateTime<Utc>, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AlarmCall::Schedule {
                    kind: k,
                    plan_id: p,
                    at,
                    reason,
                } if k == kind && p == plan_id => Some((at, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn cancels(&self, kind: AlarmKind, plan_id: PlanId) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == AlarmCall::Cancel { kind, plan_id })
            .count()
    }
}

impl AlarmService for RecordingAlarms {
    fn can_schedule_exact(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn schedule_exact_at(
        &self,
        kind: AlarmKind,
        plan_id: PlanId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> bool {
        self.calls.lock().unwrap().push(AlarmCall::Schedule {
            kind,
            plan_id,
            at,
            reason: reason.to_string(),
        });
        self.accept.load(Ordering::SeqCst)
    }

    fn cancel(&self, kind: AlarmKind, plan_id: PlanId) {
        self.calls
            .lock()
            .unwrap()
            .push(AlarmCall::Cancel { kind, plan_id });
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationCall {
    Show { plan: Plan, reason: String },
    Cancel { plan_id: PlanId },
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotificationCall>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<NotificationCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn shown(&self, plan_id: PlanId) -> Vec<Plan> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotificationCall::Show { plan, .. } if plan.id == plan_id => Some(plan),
                _ => None,
            })
            .collect()
    }

    pub fn cancels(&self, plan_id: PlanId) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == NotificationCall::Cancel { plan_id })
            .count()
    }
}

impl NotificationService for RecordingNotifier {
    fn show(&self, plan: &Plan, reason: &str) {
        self.calls.lock().unwrap().push(NotificationCall::Show {
            plan: plan.clone(),
            reason: reason.to_string(),
        });
    }

    fn cancel(&self, plan: &Plan) {
        self.calls
            .lock()
            .unwrap()
            .push(NotificationCall::Cancel { plan_id: plan.id });
    }
}

type Interleave = Box<dyn FnOnce(&MemoryKv) + Send>;

/// In-memory backend that can fail on demand or slip in a change of its own
/// between reads of the plan list.
#[derive(Default)]
pub struct ScriptedKv {
    inner: MemoryKv,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    after_plans_read: Mutex<Option<(usize, Interleave)>>,
}

impl ScriptedKv {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Edit the stored plans as another writer would, right after the
    /// `reads`-th read of the plan list from now. Every store operation reads
    /// the list twice: once in the schema check and once to load it.
    pub fn interleave_edit(
        &self,
        reads: usize,
        id: PlanId,
        change: impl FnOnce(&mut Vec<Plan>) + Send + 'static,
    ) {
        let step: Interleave = Box::new(move |inner: &MemoryKv| {
            let mut plans = inner
                .get_text(KEY_PLANS_JSON)
                .unwrap()
                .map(|text| decode_plans(&text))
                .unwrap_or_default();
            assert!(plans.iter().any(|plan| plan.id == id));
            change(&mut plans);
            let text = encode_plans(&plans).unwrap();
            inner
                .apply(&[KvEdit::put(KEY_PLANS_JSON, KvValue::Text(text))])
                .unwrap();
        });
        *self.after_plans_read.lock().unwrap() = Some((reads, step));
    }
}

impl KeyValueStore for ScriptedKv {
    fn get(&self, key: &str) -> CoreResult<Option<KvValue>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CoreError::Storage("read refused".into()));
        }
        let value = self.inner.get(key)?;
        if key == KEY_PLANS_JSON {
            let mut pending = self.after_plans_read.lock().unwrap();
            let due = match pending.as_mut() {
                Some((remaining, _)) => {
                    *remaining = remaining.saturating_sub(1);
                    *remaining == 0
                }
                None => false,
            };
            if due {
                if let Some((_, step)) = pending.take() {
                    step(&self.inner);
                }
            }
        }
        Ok(value)
    }

    fn apply(&self, edits: &[KvEdit]) -> CoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::Storage("disk full".into()));
        }
        self.inner.apply(edits)
    }
}

/// Disable `id` in a plan list.
pub fn switch_off(id: PlanId) -> impl FnOnce(&mut Vec<Plan>) + Send + 'static {
    move |plans| {
        for plan in plans.iter_mut().filter(|plan| plan.id == id) {
            plan.enabled = false;
        }
    }
}

/// Remove `id` from a plan list.
pub fn remove(id: PlanId) -> impl FnOnce(&mut Vec<Plan>) + Send + 'static {
    move |plans| plans.retain(|plan| plan.id != id)
}

pub fn at(text: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(text).unwrap()
}

pub struct Harness {
    pub store: Arc<PlanStore>,
    pub alarms: Arc<RecordingAlarms>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub engine: ReminderEngine<ManualClock>,
}

impl Harness {
    /// Engine over an in-memory store with the clock at 2024-03-10 07:00 UTC.
    pub fn new() -> Self {
        Self::over(Arc::new(MemoryKv::new()))
    }

    /// Same as [`Harness::new`] over a caller-supplied backend.
    pub fn over(kv: Arc<dyn KeyValueStore>) -> Self {
        let store = Arc::new(PlanStore::new(kv).with_wall_clock(|| {
            NaiveDate::from_ymd_opt(2024, 3, 10)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap()
        }));
        let alarms = Arc::new(RecordingAlarms::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(at("2024-03-10T07:00:00+00:00")));
        let engine = ReminderEngine::new(
            Arc::clone(&store),
            alarms.clone(),
            notifier.clone(),
            Arc::clone(&clock),
        );
        Self {
            store,
            alarms,
            notifier,
            clock,
            engine,
        }
    }

    /// Harness over a [`ScriptedKv`], returned alongside it.
    pub fn scripted() -> (Self, Arc<ScriptedKv>) {
        let kv = Arc::new(ScriptedKv::default());
        (Self::over(kv.clone()), kv)
    }
}

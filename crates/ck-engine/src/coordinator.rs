//! User-facing plan mutations.
//!
//! After every successful call an enabled plan has a live daily alarm, and a
//! deleted plan has neither alarm nor notification. Scheduling failures roll
//! back the store change that preceded them.

use std::sync::Arc;

use ck_core::{
    next_trigger_for, AlarmKind, AlarmService, Clock, CoreError, NotificationService, Plan,
    PlanDraft, PlanId, PlanName, RepeatRule, TimeOfDay,
};
use ck_store::PlanStore;
use ck_utils::wrap_reason;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// What a successful mutation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuccessKind {
    /// A plan was created and scheduled.
    Added,
    /// A plan's name, time or repeat rule changed.
    Updated,
    /// A plan was switched on and scheduled.
    Enabled,
    /// A plan was switched off and silenced.
    Disabled,
    /// A plan was removed.
    Deleted,
    /// The active reminder was confirmed.
    ReminderConfirmed,
    /// A plan changed position.
    Moved,
    /// The requested state already held.
    NoOp,
}

/// Successful mutation result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanSuccess {
    /// What happened.
    pub kind: SuccessKind,
    /// Name of the affected plan.
    pub plan_name: String,
}

impl PlanSuccess {
    fn new(kind: SuccessKind, plan: &Plan) -> Self {
        Self {
            kind,
            plan_name: plan.name.as_str().to_string(),
        }
    }
}

/// Why a mutation was refused.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PlanFailure {
    /// The name was blank.
    #[error("a plan name is required")]
    NameRequired,
    /// The name exceeded the length limit.
    #[error("the plan name is too long")]
    NameTooLong,
    /// Hour, minute or repeat settings were out of range.
    #[error("the reminder time or repeat settings are invalid")]
    InvalidSchedule,
    /// The store already holds the maximum number of plans.
    #[error("the plan limit has been reached")]
    PlanLimitReached,
    /// No plan has the given id.
    #[error("the plan no longer exists")]
    PlanNotFound,
    /// Persisting the change failed.
    #[error("the change could not be saved")]
    SaveFailed,
    /// The alarm capability refused to schedule.
    #[error("the reminder could not be scheduled")]
    ScheduleFailed,
}

/// Result of every coordinator mutation.
pub type PlanOutcome = Result<PlanSuccess, PlanFailure>;

/// Editable plan fields supplied by the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanInput {
    /// Display name; trimmed before validation.
    pub name: String,
    /// Hour of day.
    pub hour: u8,
    /// Minute of hour.
    pub minute: u8,
    /// Repeat rule.
    pub repeat: RepeatRule,
}

struct ValidInput {
    name: PlanName,
    time: TimeOfDay,
    repeat: RepeatRule,
}

impl PlanInput {
    fn validate(&self) -> Result<ValidInput, PlanFailure> {
        if self.name.trim().is_empty() {
            return Err(PlanFailure::NameRequired);
        }
        let name = PlanName::new(self.name.as_str()).map_err(|_| PlanFailure::NameTooLong)?;
        let time =
            TimeOfDay::new(self.hour, self.minute).map_err(|_| PlanFailure::InvalidSchedule)?;
        let repeat = RepeatRule::strict(
            self.repeat.mode(),
            i64::from(self.repeat.interval_days()),
            self.repeat.start_date_epoch_day(),
        )
        .map_err(|_| PlanFailure::InvalidSchedule)?;
        Ok(ValidInput { name, time, repeat })
    }
}

fn store_failure(err: CoreError) -> PlanFailure {
    match err {
        CoreError::CapacityExceeded(_) => PlanFailure::PlanLimitReached,
        CoreError::Validation(_) => PlanFailure::InvalidSchedule,
        CoreError::Storage(message) => {
            error!("plan store failure: {message}");
            PlanFailure::SaveFailed
        }
    }
}

/// Applies add/edit/enable/disable/delete/confirm to the store and the platform.
pub struct PlanCoordinator<C: Clock> {
    store: Arc<PlanStore>,
    alarms: Arc<dyn AlarmService>,
    notifier: Arc<dyn NotificationService>,
    clock: Arc<C>,
}

impl<C: Clock> PlanCoordinator<C> {
    /// Create a coordinator over the given collaborators.
    pub fn new(
        store: Arc<PlanStore>,
        alarms: Arc<dyn AlarmService>,
        notifier: Arc<dyn NotificationService>,
        clock: Arc<C>,
    ) -> Self {
        Self {
            store,
            alarms,
            notifier,
            clock,
        }
    }

    /// Store shared with the delivery machine.
    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }

    /// Create an enabled plan and schedule its first reminder.
    pub fn add_plan(&self, input: &PlanInput, reason: &str) -> PlanOutcome {
        let valid = input.validate()?;
        if self.store.is_full().map_err(store_failure)? {
            return Err(PlanFailure::PlanLimitReached);
        }

        let plan = self
            .store
            .add(PlanDraft {
                name: valid.name.as_str().to_string(),
                hour: valid.time.hour(),
                minute: valid.time.minute(),
                repeat: valid.repeat,
                enabled: true,
            })
            .map_err(store_failure)?;

        if !self.schedule_next(&plan, &wrap_reason("add", reason)) {
            match self.store.delete(plan.id) {
                Ok(_) => debug!("rolled back plan {} after scheduling failure", plan.id),
                Err(err) => error!("cannot roll back plan {}: {err}", plan.id),
            }
            return Err(PlanFailure::ScheduleFailed);
        }

        info!("added plan {} '{}' at {}", plan.id, plan.name, plan.time);
        Ok(PlanSuccess::new(SuccessKind::Added, &plan))
    }

    /// Change a plan's name, time and repeat rule.
    ///
    /// An enabled plan is rescheduled for the new settings before anything is
    /// written, so a refused alarm leaves the stored plan untouched.
    pub fn edit_plan(&self, id: PlanId, input: &PlanInput, reason: &str) -> PlanOutcome {
        let existing = self.require(id)?;
        let valid = input.validate()?;

        let mut candidate = existing.clone();
        candidate.name = valid.name;
        candidate.time = valid.time;
        candidate.repeat = valid.repeat;

        let reason = wrap_reason("edit", reason);
        if existing.enabled && !self.schedule_next(&candidate, &reason) {
            return Err(PlanFailure::ScheduleFailed);
        }

        let saved = self.store.modify(id, |plan| {
            plan.name = candidate.name.clone();
            plan.time = candidate.time;
            plan.repeat = candidate.repeat;
        });
        let updated = match saved {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                // Deleted while we were scheduling.
                self.alarms.cancel(AlarmKind::Daily, id);
                return Err(PlanFailure::PlanNotFound);
            }
            Err(err) => {
                if existing.enabled && !self.schedule_next(&existing, &reason) {
                    warn!("cannot restore previous alarm for plan {id}");
                }
                return Err(store_failure(err));
            }
        };

        if updated.enabled && updated.is_reminder_active {
            self.notifier.show(&updated, &reason);
        }
        info!("updated plan {id} '{}' at {}", updated.name, updated.time);
        Ok(PlanSuccess::new(SuccessKind::Updated, &updated))
    }

    /// Switch a plan on or off.
    ///
    /// Switching off also confirms any reminder in flight, so the plan goes
    /// silent immediately.
    pub fn set_plan_enabled(&self, id: PlanId, enabled: bool, reason: &str) -> PlanOutcome {
        let existing = self.require(id)?;
        if existing.enabled == enabled {
            return Ok(PlanSuccess::new(SuccessKind::NoOp, &existing));
        }

        if enabled {
            let plan = self
                .store
                .modify(id, |plan| plan.enabled = true)
                .map_err(store_failure)?
                .ok_or(PlanFailure::PlanNotFound)?;
            if !self.schedule_next(&plan, &wrap_reason("enable", reason)) {
                if let Err(err) = self.store.modify(id, |plan| plan.enabled = false) {
                    error!("cannot revert enabled flag for plan {id}: {err}");
                }
                return Err(PlanFailure::ScheduleFailed);
            }
            info!("enabled plan {id}");
            return Ok(PlanSuccess::new(SuccessKind::Enabled, &plan));
        }

        let plan = self
            .store
            .modify(id, |plan| {
                plan.enabled = false;
                plan.is_reminder_active = false;
                plan.suppress_next_delete_fallback = true;
            })
            .map_err(store_failure)?
            .ok_or(PlanFailure::PlanNotFound)?;
        self.alarms.cancel(AlarmKind::Daily, id);
        self.alarms.cancel(AlarmKind::Fallback, id);
        self.notifier.cancel(&plan);
        info!("disabled plan {id}");
        Ok(PlanSuccess::new(SuccessKind::Disabled, &plan))
    }

    /// Remove a plan together with its alarms and notification.
    pub fn delete_plan(&self, id: PlanId) -> PlanOutcome {
        let removed = self
            .store
            .delete(id)
            .map_err(store_failure)?
            .ok_or(PlanFailure::PlanNotFound)?;
        self.alarms.cancel(AlarmKind::Daily, id);
        self.alarms.cancel(AlarmKind::Fallback, id);
        self.notifier.cancel(&removed);
        info!("deleted plan {id} '{}'", removed.name);
        Ok(PlanSuccess::new(SuccessKind::Deleted, &removed))
    }

    /// Confirm the active reminder. The daily alarm stays armed.
    pub fn confirm_stop_reminder(&self, id: PlanId) -> PlanOutcome {
        let plan = self
            .store
            .mark_confirmed(id)
            .map_err(store_failure)?
            .ok_or(PlanFailure::PlanNotFound)?;
        self.alarms.cancel(AlarmKind::Fallback, id);
        self.notifier.cancel(&plan);
        info!("confirmed reminder for plan {id}");
        Ok(PlanSuccess::new(SuccessKind::ReminderConfirmed, &plan))
    }

    /// Move a plan one slot earlier in display order.
    pub fn move_plan_up(&self, id: PlanId) -> PlanOutcome {
        self.reorder(id, true)
    }

    /// Move a plan one slot later in display order.
    pub fn move_plan_down(&self, id: PlanId) -> PlanOutcome {
        self.reorder(id, false)
    }

    /// Re-arm the daily alarm of every enabled plan. Returns how many were scheduled.
    pub fn reschedule_enabled_plans(&self, reason: &str) -> usize {
        let plans = match self.store.list() {
            Ok(plans) => plans,
            Err(err) => {
                error!("cannot list plans for rescheduling: {err}");
                return 0;
            }
        };
        let reason = wrap_reason("reschedule", reason);
        let mut scheduled = 0;
        for plan in plans.iter().filter(|plan| plan.enabled) {
            if self.schedule_next(plan, &reason) {
                scheduled += 1;
            } else {
                warn!("cannot reschedule plan {}", plan.id);
            }
        }
        info!("rescheduled {scheduled} enabled plans");
        scheduled
    }

    fn reorder(&self, id: PlanId, up: bool) -> PlanOutcome {
        let moved = if up {
            self.store.move_up(id)
        } else {
            self.store.move_down(id)
        };
        if !moved.map_err(store_failure)? {
            return Err(PlanFailure::PlanNotFound);
        }
        let plan = self.require(id)?;
        Ok(PlanSuccess::new(SuccessKind::Moved, &plan))
    }

    fn require(&self, id: PlanId) -> Result<Plan, PlanFailure> {
        self.store
            .get(id)
            .map_err(store_failure)?
            .ok_or(PlanFailure::PlanNotFound)
    }

    /// Schedule the plan's next daily-kind alarm; false when it could not be armed.
    fn schedule_next(&self, plan: &Plan, reason: &str) -> bool {
        let at = match next_trigger_for(plan, &self.clock.now()) {
            Ok(at) => at,
            Err(err) => {
                warn!("cannot compute next trigger for plan {}: {err}", plan.id);
                return false;
            }
        };
        let scheduled = self
            .alarms
            .schedule_exact_at(AlarmKind::Daily, plan.id, at, reason);
        if scheduled {
            debug!("scheduled plan {} for {at}", plan.id);
        } else {
            warn!("alarm service refused plan {} at {at}", plan.id);
        }
        scheduled
    }
}

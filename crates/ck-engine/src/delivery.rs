//! Alarm delivery state machine.
//!
//! A plan is idle until its daily alarm fires, then active until the user
//! confirms. Each daily fire arms the next one. Swiping the notification away
//! without confirming arms a one-shot fallback alarm that shows it again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ck_core::{
    next_trigger_for, AlarmKind, AlarmService, Clock, NotificationService, Plan, PlanId,
};
use ck_store::PlanStore;
use ck_utils::fallback_reason;
use tracing::{debug, info, warn};

/// Delay before a dismissed, unconfirmed reminder is shown again.
pub const FALLBACK_DELAY_SECS: i64 = 30;

/// Inbound callback delivered by the platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliverySignal {
    /// An alarm of `kind` fired. A missing id resolves to the first plan.
    ShowReminder {
        /// Which alarm fired.
        kind: AlarmKind,
        /// Target plan, if the alarm carried one.
        plan_id: Option<PlanId>,
        /// Free-text diagnostic.
        reason: String,
    },
    /// The notification was removed without a confirm action.
    NotificationDismissed {
        /// Target plan.
        plan_id: PlanId,
        /// Free-text diagnostic.
        reason: String,
    },
}

/// Why a signal caused no transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No plan matched the signal.
    UnknownPlan,
    /// The plan is switched off.
    PlanDisabled,
    /// The plan's reminder was already confirmed.
    NotActive,
    /// The dismissal came from an explicit confirm.
    SuppressedByConfirm,
    /// Exact alarms are currently unavailable.
    AlarmsUnavailable,
    /// The alarm service refused the fallback alarm.
    ScheduleDenied,
    /// The plan store could not be read or written.
    StoreUnavailable,
}

/// What handling a signal did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The daily reminder was shown; `next_trigger` is `None` when re-arming failed.
    Shown {
        /// Plan that fired.
        plan_id: PlanId,
        /// Instant of the re-armed daily alarm.
        next_trigger: Option<DateTime<Utc>>,
    },
    /// A fallback alarm re-showed an unconfirmed reminder.
    Reshown {
        /// Plan that was shown again.
        plan_id: PlanId,
    },
    /// A fallback alarm was armed after a dismissal.
    FallbackArmed {
        /// Plan whose notification was dismissed.
        plan_id: PlanId,
        /// When the fallback fires.
        at: DateTime<Utc>,
    },
    /// Nothing happened.
    Ignored(IgnoreReason),
}

/// Drives plan state from alarm and notification callbacks.
pub struct ReminderDelivery<C: Clock> {
    store: Arc<PlanStore>,
    alarms: Arc<dyn AlarmService>,
    notifier: Arc<dyn NotificationService>,
    clock: Arc<C>,
}

impl<C: Clock> ReminderDelivery<C> {
    /// Create a delivery machine over the given collaborators.
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

    /// Handle one inbound signal.
    pub fn handle(&self, signal: DeliverySignal) -> DeliveryOutcome {
        let outcome = match signal {
            DeliverySignal::ShowReminder {
                kind: AlarmKind::Daily,
                plan_id,
                reason,
            } => self.on_daily_fired(plan_id, &reason),
            DeliverySignal::ShowReminder {
                kind: AlarmKind::Fallback,
                plan_id,
                reason,
            } => self.on_fallback_fired(plan_id, &reason),
            DeliverySignal::NotificationDismissed { plan_id, reason } => {
                self.on_dismissed(plan_id, &reason)
            }
        };
        debug!("delivery outcome: {outcome:?}");
        outcome
    }

    fn on_daily_fired(&self, plan_id: Option<PlanId>, reason: &str) -> DeliveryOutcome {
        let id = match self.resolve(plan_id) {
            Ok(plan) => plan.id,
            Err(ignored) => return DeliveryOutcome::Ignored(ignored),
        };

        // The enabled check and the write happen under one store lock, so a
        // disable that lands after `resolve` still wins.
        let plan = match self.store.mark_triggered_if_enabled(id) {
            Ok(Some(plan)) if plan.enabled => plan,
            Ok(Some(_)) => {
                debug!("daily alarm for disabled plan {id} ignored");
                return DeliveryOutcome::Ignored(IgnoreReason::PlanDisabled);
            }
            Ok(None) => return DeliveryOutcome::Ignored(IgnoreReason::UnknownPlan),
            Err(err) => {
                warn!("cannot mark plan {id} triggered: {err}");
                return DeliveryOutcome::Ignored(IgnoreReason::StoreUnavailable);
            }
        };
        self.notifier.show(&plan, reason);
        info!("reminder shown for plan {id} ({reason})");

        DeliveryOutcome::Shown {
            plan_id: id,
            next_trigger: self.rearm_daily(&plan, reason),
        }
    }

    fn on_fallback_fired(&self, plan_id: Option<PlanId>, reason: &str) -> DeliveryOutcome {
        let plan = match self.resolve(plan_id) {
            Ok(plan) => plan,
            Err(ignored) => return DeliveryOutcome::Ignored(ignored),
        };
        if !plan.is_reminder_active {
            return DeliveryOutcome::Ignored(IgnoreReason::NotActive);
        }
        if !plan.enabled {
            return DeliveryOutcome::Ignored(IgnoreReason::PlanDisabled);
        }
        self.notifier.show(&plan, reason);
        info!("reminder re-shown for plan {} ({reason})", plan.id);
        DeliveryOutcome::Reshown { plan_id: plan.id }
    }

    fn on_dismissed(&self, plan_id: PlanId, reason: &str) -> DeliveryOutcome {
        match self.store.consume_suppress_flag(plan_id) {
            Ok(true) => {
                debug!("dismissal of plan {plan_id} followed a confirm");
                return DeliveryOutcome::Ignored(IgnoreReason::SuppressedByConfirm);
            }
            Ok(false) => {}
            Err(err) => {
                warn!("cannot read suppress flag for plan {plan_id}: {err}");
                return DeliveryOutcome::Ignored(IgnoreReason::StoreUnavailable);
            }
        }

        let plan = match self.resolve(Some(plan_id)) {
            Ok(plan) => plan,
            Err(ignored) => return DeliveryOutcome::Ignored(ignored),
        };
        if !plan.is_reminder_active {
            return DeliveryOutcome::Ignored(IgnoreReason::NotActive);
        }
        if !self.alarms.can_schedule_exact() {
            warn!("exact alarms unavailable; no fallback for plan {plan_id}");
            return DeliveryOutcome::Ignored(IgnoreReason::AlarmsUnavailable);
        }

        let at = self.clock.now().with_timezone(&Utc) + Duration::seconds(FALLBACK_DELAY_SECS);
        if !self.alarms.schedule_exact_at(
            AlarmKind::Fallback,
            plan_id,
            at,
            &fallback_reason(reason),
        ) {
            warn!("alarm service refused fallback for plan {plan_id}");
            return DeliveryOutcome::Ignored(IgnoreReason::ScheduleDenied);
        }
        info!("fallback armed for plan {plan_id} at {at}");
        DeliveryOutcome::FallbackArmed { plan_id, at }
    }

    fn resolve(&self, plan_id: Option<PlanId>) -> Result<Plan, IgnoreReason> {
        let found = match plan_id {
            Some(id) => self.store.get(id),
            None => self.store.first(),
        };
        match found {
            Ok(Some(plan)) => Ok(plan),
            Ok(None) => {
                debug!("no plan matches {plan_id:?}");
                Err(IgnoreReason::UnknownPlan)
            }
            Err(err) => {
                warn!("cannot resolve plan {plan_id:?}: {err}");
                Err(IgnoreReason::StoreUnavailable)
            }
        }
    }

    fn rearm_daily(&self, plan: &Plan, reason: &str) -> Option<DateTime<Utc>> {
        let at = match next_trigger_for(plan, &self.clock.now()) {
            Ok(at) => at,
            Err(err) => {
                warn!("cannot compute next trigger for plan {}: {err}", plan.id);
                return None;
            }
        };
        if !self
            .alarms
            .schedule_exact_at(AlarmKind::Daily, plan.id, at, reason)
        {
            warn!("alarm service refused next trigger for plan {}", plan.id);
            return None;
        }
        // A disable or delete committed since the mark may already have run
        // its cancel; withdraw the alarm just set.
        match self.store.get(plan.id) {
            Ok(Some(current)) if current.enabled => Some(at),
            Ok(_) => {
                self.alarms.cancel(AlarmKind::Daily, plan.id);
                debug!("plan {} switched off while re-arming", plan.id);
                None
            }
            Err(err) => {
                warn!("cannot re-check plan {} after re-arming: {err}", plan.id);
                Some(at)
            }
        }
    }
}

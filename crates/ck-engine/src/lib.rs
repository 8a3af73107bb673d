//! Reminder scheduling engine for Chimekeep.
//!
//! [`PlanCoordinator`] applies user intents to the plan store and keeps
//! alarms and notifications in step with it. [`ReminderDelivery`] reacts to
//! alarm and notification callbacks.

use std::sync::Arc;

use ck_core::{AlarmService, Clock, NotificationService};
use ck_store::PlanStore;

pub mod coordinator;
pub mod delivery;

#[cfg(test)]
mod testing;

pub use coordinator::{
    PlanCoordinator, PlanFailure, PlanInput, PlanOutcome, PlanSuccess, SuccessKind,
};
pub use delivery::{
    DeliveryOutcome, DeliverySignal, IgnoreReason, ReminderDelivery, FALLBACK_DELAY_SECS,
};

/// Coordinator and delivery machine wired to the same collaborators.
pub struct ReminderEngine<C: Clock> {
    /// Entry point for user intents.
    pub coordinator: PlanCoordinator<C>,
    /// Entry point for alarm and notification callbacks.
    pub delivery: ReminderDelivery<C>,
}

impl<C: Clock> ReminderEngine<C> {
    /// Wire both halves of the engine to shared collaborators.
    pub fn new(
        store: Arc<PlanStore>,
        alarms: Arc<dyn AlarmService>,
        notifier: Arc<dyn NotificationService>,
        clock: Arc<C>,
    ) -> Self {
        Self {
            coordinator: PlanCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&alarms),
                Arc::clone(&notifier),
                Arc::clone(&clock),
            ),
            delivery: ReminderDelivery::new(store, alarms, notifier, clock),
        }
    }
}

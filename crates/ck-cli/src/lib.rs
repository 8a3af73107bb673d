use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use ck_core::{epoch_day, AlarmKind, Plan, PlanId, RepeatRule, SystemClock, TimeOfDay};
use ck_engine::{
    DeliveryOutcome, DeliverySignal, PlanInput, PlanOutcome, PlanSuccess, ReminderEngine,
    SuccessKind,
};
use ck_store::{JsonFileKv, PlanStore};
use tracing::{debug, info};

pub mod ledger;

pub use ledger::{ConsoleNotifier, LedgerAlarms, LedgerEntry};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV_VAR: &str = "CHIMEKEEP_DATA_DIR";

const STATE_FILE: &str = "state.json";
const LEDGER_FILE: &str = "alarms.json";

#[derive(Parser)]
#[command(name = "ck", version, about = "Chimekeep reminder scheduler")]
struct Cli {
    /// Directory holding the plan store and alarm ledger.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Behave as if exact alarms were unavailable.
    #[arg(long, global = true)]
    no_exact_alarms: bool,
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage reminder plans.
    Plan {
        #[command(subcommand)]
        action: PlanCommand,
    },
    /// Re-arm the daily alarm of every enabled plan.
    Reschedule {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Deliver an alarm now, as if it had fired.
    Fire {
        /// Plan position or id; defaults to the first plan.
        plan: Option<String>,
        /// Deliver the dismissal fallback instead of the daily alarm.
        #[arg(long)]
        fallback: bool,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Report that a reminder notification was swiped away.
    Dismiss {
        /// Plan position or id.
        plan: String,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// List pending alarms.
    Alarms,
    /// Fire pending alarms as they come due until interrupted.
    Watch {
        /// Seconds between ledger checks.
        #[arg(long, default_value_t = 1)]
        tick_secs: u64,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Add a plan and schedule its first reminder.
    Add {
        name: String,
        /// Reminder time as HH:MM.
        #[arg(long)]
        at: TimeOfDay,
        /// Repeat every N days instead of daily.
        #[arg(long)]
        every: Option<u16>,
        /// First day of an interval repeat; defaults to today.
        #[arg(long, requires = "every")]
        from: Option<NaiveDate>,
    },
    /// Change a plan's name, time or repeat rule.
    Edit {
        /// Plan position or id.
        plan: String,
        #[arg(long)]
        name: Option<String>,
        /// Reminder time as HH:MM.
        #[arg(long)]
        at: Option<TimeOfDay>,
        /// Repeat every N days.
        #[arg(long)]
        every: Option<u16>,
        /// First day of an interval repeat.
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Switch back to a daily repeat.
        #[arg(long, conflicts_with_all = ["every", "from"])]
        daily: bool,
    },
    /// Switch a plan on.
    Enable { plan: String },
    /// Switch a plan off and silence it.
    Disable { plan: String },
    /// Delete a plan.
    Delete { plan: String },
    /// Move a plan one slot up.
    Up { plan: String },
    /// Move a plan one slot down.
    Down { plan: String },
    /// Confirm the ringing reminder of a plan.
    Confirm { plan: String },
    /// List plans in display order.
    List,
}

/// Store, ledger and engine opened over one data directory.
pub struct App {
    pub store: Arc<PlanStore>,
    pub alarms: Arc<LedgerAlarms>,
    pub engine: ReminderEngine<SystemClock>,
}

impl App {
    pub fn open(data_dir: PathBuf, exact_alarms: bool) -> Self {
        let store = Arc::new(PlanStore::new(Arc::new(JsonFileKv::new(
            data_dir.join(STATE_FILE),
        ))));
        let mut alarms = LedgerAlarms::new(data_dir.join(LEDGER_FILE));
        if !exact_alarms {
            alarms = alarms.without_exact_alarms();
        }
        let alarms = Arc::new(alarms);
        let engine = ReminderEngine::new(
            Arc::clone(&store),
            alarms.clone(),
            Arc::new(ConsoleNotifier),
            Arc::new(SystemClock),
        );
        Self {
            store,
            alarms,
            engine,
        }
    }

    /// Deliver every ledger alarm due at `now` through the delivery machine.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryOutcome>> {
        let due = self.alarms.take_due(now).context("failed to read alarm ledger")?;
        let outcomes = due
            .into_iter()
            .map(|entry| {
                debug!("{} alarm for plan {} is due", entry.kind, entry.plan_id);
                self.engine.delivery.handle(DeliverySignal::ShowReminder {
                    kind: entry.kind,
                    plan_id: Some(entry.plan_id),
                    reason: entry.reason,
                })
            })
            .collect();
        Ok(outcomes)
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    ck_utils::init_logging(if cli.verbose { "debug" } else { "warn" })
        .context("failed to initialize logging")?;

    let data_dir = resolve_data_dir(cli.data_dir)?;
    debug!("using data directory {}", data_dir.display());
    let app = App::open(data_dir, !cli.no_exact_alarms);

    match cli.command {
        Command::Plan { action } => plan_command(&app, action),
        Command::Reschedule { reason } => {
            let count = app.engine.coordinator.reschedule_enabled_plans(&reason);
            println!("Rescheduled {count} plan(s)");
            Ok(())
        }
        Command::Fire {
            plan,
            fallback,
            reason,
        } => {
            let plan_id = plan
                .map(|token| resolve_plan(&app.store, &token))
                .transpose()?;
            let kind = if fallback {
                AlarmKind::Fallback
            } else {
                AlarmKind::Daily
            };
            let outcome = app.engine.delivery.handle(DeliverySignal::ShowReminder {
                kind,
                plan_id,
                reason,
            });
            println!("{}", describe_delivery(&outcome));
            Ok(())
        }
        Command::Dismiss { plan, reason } => {
            let plan_id = resolve_plan(&app.store, &plan)?;
            let outcome = app
                .engine
                .delivery
                .handle(DeliverySignal::NotificationDismissed { plan_id, reason });
            println!("{}", describe_delivery(&outcome));
            Ok(())
        }
        Command::Alarms => {
            for entry in app.alarms.entries()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    entry.kind,
                    entry.plan_id,
                    entry.reason
                );
            }
            Ok(())
        }
        Command::Watch { tick_secs } => watch(&app, Duration::from_secs(tick_secs.max(1))),
    }
}

fn plan_command(app: &App, action: PlanCommand) -> Result<()> {
    let coordinator = &app.engine.coordinator;
    let outcome = match action {
        PlanCommand::Add {
            name,
            at,
            every,
            from,
        } => {
            let repeat = match every {
                Some(days) => interval_rule(days, from),
                None => RepeatRule::Daily,
            };
            let input = PlanInput {
                name,
                hour: at.hour(),
                minute: at.minute(),
                repeat,
            };
            coordinator.add_plan(&input, "cli")
        }
        PlanCommand::Edit {
            plan,
            name,
            at,
            every,
            from,
            daily,
        } => {
            let id = resolve_plan(&app.store, &plan)?;
            let existing = app
                .store
                .get(id)?
                .ok_or_else(|| anyhow!("plan {id} not found"))?;
            let input = edited_input(&existing, name, at, every, from, daily);
            coordinator.edit_plan(id, &input, "cli")
        }
        PlanCommand::Enable { plan } => {
            coordinator.set_plan_enabled(resolve_plan(&app.store, &plan)?, true, "cli")
        }
        PlanCommand::Disable { plan } => {
            coordinator.set_plan_enabled(resolve_plan(&app.store, &plan)?, false, "cli")
        }
        PlanCommand::Delete { plan } => coordinator.delete_plan(resolve_plan(&app.store, &plan)?),
        PlanCommand::Up { plan } => coordinator.move_plan_up(resolve_plan(&app.store, &plan)?),
        PlanCommand::Down { plan } => {
            coordinator.move_plan_down(resolve_plan(&app.store, &plan)?)
        }
        PlanCommand::Confirm { plan } => {
            coordinator.confirm_stop_reminder(resolve_plan(&app.store, &plan)?)
        }
        PlanCommand::List => {
            let plans = app.store.list().context("failed to list plans")?;
            if !plans.is_empty() {
                println!("{}", render_plans(&plans));
            }
            return Ok(());
        }
    };
    report(outcome)
}

fn watch(app: &App, tick: Duration) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to initialize runtime")?;
    info!("watching alarm ledger {}", app.alarms.path().display());

    runtime.block_on(async {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for outcome in app.fire_due(Utc::now())? {
                        info!("{}", describe_delivery(&outcome));
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for interrupt")?;
                    break;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn resolve_data_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV_VAR).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|dir| dir.join("chimekeep"))
        .ok_or_else(|| anyhow!("cannot determine a data directory; pass --data-dir"))
}

/// Accept a 1-based position in display order or a full plan id.
fn resolve_plan(store: &PlanStore, token: &str) -> Result<PlanId> {
    if let Ok(position) = token.parse::<usize>() {
        let plans = store.list().context("failed to list plans")?;
        return position
            .checked_sub(1)
            .and_then(|index| plans.get(index))
            .map(|plan| plan.id)
            .ok_or_else(|| anyhow!("no plan at position {position}"));
    }
    PlanId::from_str(token).with_context(|| format!("invalid plan id {token:?}"))
}

fn interval_rule(interval_days: u16, from: Option<NaiveDate>) -> RepeatRule {
    let start = from.unwrap_or_else(|| Local::now().date_naive());
    RepeatRule::IntervalDays {
        interval_days,
        start_date_epoch_day: epoch_day(start),
    }
}

fn edited_input(
    existing: &Plan,
    name: Option<String>,
    at: Option<TimeOfDay>,
    every: Option<u16>,
    from: Option<NaiveDate>,
    daily: bool,
) -> PlanInput {
    let time = at.unwrap_or(existing.time);
    let repeat = if daily {
        RepeatRule::Daily
    } else {
        match (every, from, existing.repeat) {
            (None, None, current) => current,
            (Some(days), Some(start), _) => interval_rule(days, Some(start)),
            (Some(days), None, RepeatRule::IntervalDays {
                start_date_epoch_day,
                ..
            }) => RepeatRule::IntervalDays {
                interval_days: days,
                start_date_epoch_day,
            },
            (Some(days), None, RepeatRule::Daily) => interval_rule(days, None),
            (None, Some(start), current) => {
                interval_rule(current.interval_days(), Some(start))
            }
        }
    };
    PlanInput {
        name: name.unwrap_or_else(|| existing.name.as_str().to_string()),
        hour: time.hour(),
        minute: time.minute(),
        repeat,
    }
}

fn report(outcome: PlanOutcome) -> Result<()> {
    let success = outcome.map_err(anyhow::Error::new)?;
    println!("{}", describe_success(&success));
    Ok(())
}

fn describe_success(success: &PlanSuccess) -> String {
    let name = &success.plan_name;
    match success.kind {
        SuccessKind::Added => format!("Added '{name}'"),
        SuccessKind::Updated => format!("Updated '{name}'"),
        SuccessKind::Enabled => format!("Enabled '{name}'"),
        SuccessKind::Disabled => format!("Disabled '{name}'"),
        SuccessKind::Deleted => format!("Deleted '{name}'"),
        SuccessKind::ReminderConfirmed => format!("Confirmed '{name}'"),
        SuccessKind::Moved => format!("Moved '{name}'"),
        SuccessKind::NoOp => format!("Nothing to change for '{name}'"),
    }
}

fn describe_delivery(outcome: &DeliveryOutcome) -> String {
    match outcome {
        DeliveryOutcome::Shown {
            plan_id,
            next_trigger: Some(at),
        } => format!(
            "Reminder {plan_id} shown; next at {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        ),
        DeliveryOutcome::Shown {
            plan_id,
            next_trigger: None,
        } => format!("Reminder {plan_id} shown; next alarm could not be scheduled"),
        DeliveryOutcome::Reshown { plan_id } => format!("Reminder {plan_id} shown again"),
        DeliveryOutcome::FallbackArmed { plan_id, at } => format!(
            "Reminder {plan_id} will return at {}",
            at.with_timezone(&Local).format("%H:%M:%S")
        ),
        DeliveryOutcome::Ignored(reason) => format!("Ignored: {reason:?}"),
    }
}

fn render_plans(plans: &[Plan]) -> String {
    plans
        .iter()
        .enumerate()
        .map(|(index, plan)| {
            let state = match (plan.enabled, plan.is_reminder_active) {
                (false, _) => "off",
                (true, true) => "ringing",
                (true, false) => "on",
            };
            format!(
                "{}. {} [{state}] {} - {} - {}",
                index + 1,
                plan.time,
                plan.name,
                plan.repeat,
                plan.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

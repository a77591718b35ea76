//! States (C5): per-resource state machines. Generalises the teacher's
//! `DelayModes` (`delays.rs`) — which already encodes "time until failure /
//! time until fix" transitions for a single breakdown mode — into the seven
//! kinds the specification lists, all sharing one `stateInfo` log surface.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::distribution::TimeModel;
use crate::error::SimError;
use crate::time::{any_of, EngineHandle, Notifier};

/// The Logger-hook record (§6): `{resource_ID, state_ID, event_time, activity,
/// product_ID, state_type, target_ID?, origin_ID?, empty_transport?}`.
#[derive(Debug, Clone, Serialize)]
pub struct StateInfo {
    pub resource_id: String,
    pub state_id: String,
    pub event_time: f64,
    pub activity: String,
    pub product_id: Option<String>,
    pub state_type: String,
    pub target_id: Option<String>,
    pub origin_id: Option<String>,
    pub empty_transport: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Production,
    Transport,
    Setup,
    BreakDown,
    ProcessBreakDown,
    Charging,
    NonScheduled,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Production => "ProductionState",
            StateKind::Transport => "TransportState",
            StateKind::Setup => "SetupState",
            StateKind::BreakDown => "BreakDownState",
            StateKind::ProcessBreakDown => "ProcessBreakDownState",
            StateKind::Charging => "ChargingState",
            StateKind::NonScheduled => "NonScheduledState",
        }
    }
}

/// `resource.active` plus the notifier that wakes anyone waiting on a change
/// of it. Shared (via `Rc`) between a resource and every state that runs on
/// it, since breakdowns interrupt every other state concurrently.
#[derive(Clone)]
pub struct ActiveFlag {
    active: Rc<RefCell<bool>>,
    pub changed: Notifier,
}

impl Default for ActiveFlag {
    fn default() -> Self {
        ActiveFlag { active: Rc::new(RefCell::new(true)), changed: Notifier::new() }
    }
}

impl ActiveFlag {
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn set(&self, value: bool) {
        let changed = *self.active.borrow() != value;
        *self.active.borrow_mut() = value;
        if changed {
            self.changed.notify();
        }
    }
}

/// Runs a timed activity of `duration` minutes, pausing whenever any one of
/// `actives` goes false and resuming with the remaining time once all of them
/// are true again — the state contract's `Interrupt()`/`done_in -= elapsed`
/// behaviour from §4.5, expressed as one reusable coroutine instead of one
/// hand-written loop per state kind. A production state watches both
/// `resource.active` and, for a `ProcessBreakDownState` targeting its
/// process, that process's own flag — hence a slice rather than one flag.
///
/// `on_interrupt`/`on_resume` are called (with the interrupt always flagged,
/// per §4.10's "accept re-entry on `start_interrupt`, keep `done_in`
/// monotone") so callers can emit the `start interrupt` / `end interrupt`
/// log records.
pub async fn run_interruptible(
    engine: &EngineHandle,
    actives: &[&ActiveFlag],
    mut remaining: f64,
    mut on_interrupt: impl FnMut(f64),
    mut on_resume: impl FnMut(f64),
) {
    let all_active = || actives.iter().all(|a| a.is_active());

    while remaining > 1e-9 {
        if !all_active() {
            on_interrupt(remaining);
            loop {
                let events: Vec<_> = actives.iter().map(|a| a.changed.current()).collect();
                any_of(&events).await;
                if all_active() {
                    break;
                }
            }
            on_resume(remaining);
            continue;
        }

        let start = engine.now_minutes();
        let timeout = engine.timeout_minutes(remaining);
        let events: Vec<_> = actives.iter().map(|a| a.changed.current()).collect();
        let changed = any_of(&events);
        futures::pin_mut!(timeout);
        futures::pin_mut!(changed);
        match futures::future::select(timeout, changed).await {
            futures::future::Either::Left(_) => {
                remaining = 0.0;
            }
            futures::future::Either::Right(_) => {
                let elapsed = engine.now_minutes() - start;
                remaining = (remaining - elapsed).max(0.0);
            }
        }
    }
}

/// An MTBF/repair loop: generalises `DelayModes::update_state` (`delays.rs`)
/// from `Duration`/seconds to the engine's minute-valued `TimeModel`s, and
/// from a single indexed mode to `BreakDownState`/`ProcessBreakDownState`'s
/// "one loop per declared failure mode" shape.
pub struct BreakdownLoop {
    pub state_id: String,
    pub time_to_failure: TimeModel,
    pub repair_time: TimeModel,
    /// `None` for a plain `BreakDownState` (targets every state on the
    /// resource); `Some(process_id)` for `ProcessBreakDownState`.
    pub target_process_id: Option<String>,
}

impl BreakdownLoop {
    /// Runs forever: `wait TimeToFailure() -> interrupt -> hold RepairTime()
    /// -> reactivate`. `resource_active` is set false for the repair window
    /// and restored afterwards; every interruptible state watching it pauses
    /// and resumes automatically via [`run_interruptible`].
    pub async fn run(
        mut self,
        engine: EngineHandle,
        resource_active: ActiveFlag,
        mut log: impl FnMut(&str, f64),
    ) {
        loop {
            let time_to_failure = self.time_to_failure.next().max(0.0);
            engine.timeout_minutes(time_to_failure).await;
            log("start state", engine.now_minutes());
            resource_active.set(false);
            let repair = self.repair_time.next().max(0.0);
            engine.timeout_minutes(repair).await;
            resource_active.set(true);
            log("end state", engine.now_minutes());
        }
    }
}

/// Tracks battery usage; `RequiresCharging()` flips once consumed use passes
/// `threshold`, and `Charge` blocks for one `TimeModel::next()` draw.
pub struct ChargingState {
    pub threshold: f64,
    pub battery_capacity: f64,
    pub consumed: f64,
    pub charge_time: TimeModel,
}

impl ChargingState {
    pub fn requires_charging(&self) -> bool {
        self.consumed >= self.threshold
    }

    pub fn consume(&mut self, amount: f64) {
        self.consumed = (self.consumed + amount).min(self.battery_capacity);
    }

    pub async fn charge(&mut self, engine: &EngineHandle) -> f64 {
        let duration = self.charge_time.next().max(0.0);
        engine.timeout_minutes(duration).await;
        self.consumed = 0.0;
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{TimeModelConfig, TimeModelFactory};
    use crate::time::Engine;

    #[test]
    fn charging_state_requires_charging_past_threshold() {
        let mut factory = TimeModelFactory::new(0);
        let charge_tm = factory.create(&TimeModelConfig::Constant { location: 60.0 }).unwrap();
        let mut charging = ChargingState { threshold: 180.0, battery_capacity: 180.0, consumed: 0.0, charge_time: charge_tm };
        assert!(!charging.requires_charging());
        charging.consume(200.0);
        assert!(charging.requires_charging());
        assert_eq!(charging.consumed, 180.0);
    }

    #[test]
    fn run_interruptible_completes_after_full_duration_when_never_interrupted() {
        let mut engine = Engine::new(0);
        let handle = engine.handle();
        let active = ActiveFlag::default();
        let done = Rc::new(RefCell::new(false));
        let done2 = done.clone();
        let active2 = active.clone();
        engine.spawn(async move {
            run_interruptible(&handle, &[&active2], 10.0, |_| {}, |_| {}).await;
            *done2.borrow_mut() = true;
        });
        engine.run_until(20.0);
        assert!(*done.borrow());
        assert!((engine.now() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn run_interruptible_pauses_while_inactive_and_resumes_remaining_time() {
        let mut engine = Engine::new(0);
        let handle = engine.handle();
        let active = ActiveFlag::default();
        let done_at = Rc::new(RefCell::new(None));
        let done_at2 = done_at.clone();
        let active2 = active.clone();
        let handle2 = handle.clone();
        engine.spawn(async move {
            run_interruptible(&handle2, &[&active2], 10.0, |_| {}, |_| {}).await;
            *done_at2.borrow_mut() = Some(handle2.now_minutes());
        });

        // Deactivate at t=3 for 5 minutes; total elapsed productive time
        // should still be 10 minutes once reactivated.
        let active3 = active.clone();
        let handle3 = handle.clone();
        engine.spawn(async move {
            handle3.timeout_minutes(3.0).await;
            active3.set(false);
            handle3.timeout_minutes(5.0).await;
            active3.set(true);
        });

        engine.run_until(30.0);
        assert_eq!(*done_at.borrow(), Some(18.0));
    }
}

//! Decides how many chunk transfers may run concurrently.

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Parallelism applied to an idle sub-queue.
pub const SERIAL: usize = 1;
/// Parallelism under thermal, power or memory constraints.
pub const REDUCED: usize = 2;
/// Floor for the unconstrained case, scaled up by core count.
pub const SCALED_MINIMUM: usize = 4;

/// OS-reported device temperature tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// Where the engine is hosted. Extensions get a fraction of an app's memory
/// budget, so they upload almost serially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    ForegroundApp,
    Extension,
}

/// Snapshot of the device conditions the heuristic scales with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSignals {
    pub thermal_state: ThermalState,
    pub low_power_mode: bool,
    pub execution_context: ExecutionContext,
    pub active_processor_count: usize,
}

impl Default for SystemSignals {
    fn default() -> Self {
        Self {
            thermal_state: ThermalState::Nominal,
            low_power_mode: false,
            execution_context: ExecutionContext::ForegroundApp,
            active_processor_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(SCALED_MINIMUM),
        }
    }
}

/// Pure mapping from signals to a concurrency value. First match wins:
/// overheating, battery saving and constrained contexts all clamp hard
/// before core-count scaling is considered.
pub fn compute_parallelism(signals: &SystemSignals) -> usize {
    if signals.thermal_state == ThermalState::Critical {
        return REDUCED;
    }
    if signals.low_power_mode {
        return REDUCED;
    }
    if signals.execution_context == ExecutionContext::Extension {
        return REDUCED;
    }

    let scaled = signals.active_processor_count.max(SCALED_MINIMUM);
    if signals.thermal_state == ThermalState::Serious {
        return (scaled / 2).max(REDUCED);
    }
    scaled
}

/// Owns the current budget and pushes changes to whoever holds the receiver.
///
/// The host feeds OS notifications (thermal change, power mode change) into
/// `signals_changed`; subscribers are only woken when the computed value
/// actually moves.
pub struct ParallelismHeuristic {
    signals: SystemSignals,
    tx: watch::Sender<usize>,
}

impl ParallelismHeuristic {
    pub fn new(signals: SystemSignals) -> (Self, watch::Receiver<usize>) {
        let (tx, rx) = watch::channel(compute_parallelism(&signals));
        (Self { signals, tx }, rx)
    }

    pub fn current(&self) -> usize {
        *self.tx.borrow()
    }

    pub fn signals_changed(&mut self, signals: SystemSignals) {
        self.signals = signals;
        let value = compute_parallelism(&self.signals);
        let changed = self.tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
        if changed {
            info!("parallelism_changed: value={}", value);
        }
    }
}

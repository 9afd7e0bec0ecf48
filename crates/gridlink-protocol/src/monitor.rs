//! # Channel Monitor
//!
//! Lifecycle state machine for a physical channel: opening, auto-restart on
//! failure or close, suspension, and shutdown. The monitor itself performs no
//! I/O — every transition returns the actions the owner must execute
//! (open/close the layer, arm/cancel the reopen timer).
//!
//! `start` requests a persistent channel: open failures wait and retry, and a
//! closed layer reopens automatically. `start_one` requests a single attempt:
//! failures and closes settle back to `Suspended` instead of retrying.
//!
//! ```text
//! Init ─start─▶ Opening ─open_success─▶ Open ─close─▶ Closing ─layer_close─▶ Opening
//!                 │ open_failure                │ shutdown
//!                 ▼                             ▼
//!               Waiting ─open_timeout─▶ ...   ShuttingDown ─layer_close─▶ Shutdown
//! ```

use serde::Serialize;

// ─── States and Events ───────────────────────────────────────────────────────

/// Monitor states. The `*One` variants are the single-attempt flavors of
/// their persistent counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    Init,
    Opening,
    OpeningOne,
    Open,
    OpenOne,
    Closing,
    Suspending,
    Waiting,
    WaitingOne,
    Suspended,
    ShuttingDown,
    Shutdown,
}

impl MonitorState {
    /// Whether the monitor has begun (or finished) its terminal descent.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, MonitorState::ShuttingDown | MonitorState::Shutdown)
    }
}

/// Requests and layer notifications driving the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Start,
    StartOne,
    Close,
    Suspend,
    Shutdown,
    OpenSuccess,
    OpenFailure,
    OpenTimeout,
    LayerClose,
}

/// Side effects the owner must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    AsyncOpen,
    AsyncClose,
    StartOpenTimer,
    CancelOpenTimer,
}

/// A transition result: the next state plus at most two actions.
pub type Transition = (MonitorState, &'static [MonitorAction]);

const NO_ACTIONS: &[MonitorAction] = &[];
const OPEN: &[MonitorAction] = &[MonitorAction::AsyncOpen];
const CLOSE: &[MonitorAction] = &[MonitorAction::AsyncClose];
const START_TIMER: &[MonitorAction] = &[MonitorAction::StartOpenTimer];
const CANCEL_TIMER: &[MonitorAction] = &[MonitorAction::CancelOpenTimer];

/// The full transition table. Events not listed for a state are ignored.
pub fn transition(state: MonitorState, event: MonitorEvent) -> Transition {
    use MonitorEvent::*;
    use MonitorState::*;

    match (state, event) {
        // Dormant states accept start requests and an immediate shutdown.
        (Init | Suspended, Start) => (Opening, OPEN),
        (Init | Suspended, StartOne) => (OpeningOne, OPEN),
        (Init | Suspended, MonitorEvent::Shutdown) => (MonitorState::Shutdown, NO_ACTIONS),

        // Persistent opening.
        (Opening, OpenSuccess) => (Open, NO_ACTIONS),
        (Opening, OpenFailure) => (Waiting, START_TIMER),
        (Opening, StartOne) => (OpeningOne, NO_ACTIONS),
        (Opening, Close) => (Closing, NO_ACTIONS),
        (Opening, Suspend) => (Suspending, NO_ACTIONS),
        (Opening, MonitorEvent::Shutdown) => (ShuttingDown, NO_ACTIONS),

        // Single-attempt opening: failure terminates instead of waiting.
        (OpeningOne, OpenSuccess) => (OpenOne, NO_ACTIONS),
        (OpeningOne, OpenFailure) => (Suspended, NO_ACTIONS),
        (OpeningOne, Start) => (Opening, NO_ACTIONS),
        (OpeningOne, Close) => (Suspending, NO_ACTIONS),
        (OpeningOne, Suspend) => (Suspending, NO_ACTIONS),
        (OpeningOne, MonitorEvent::Shutdown) => (ShuttingDown, NO_ACTIONS),

        // Open, persistent: a layer close restarts automatically.
        (Open, Close) => (Closing, CLOSE),
        (Open, Suspend) => (Suspending, CLOSE),
        (Open, MonitorEvent::Shutdown) => (ShuttingDown, CLOSE),
        (Open, LayerClose) => (Opening, OPEN),

        // Open, single-attempt: a layer close suspends.
        (OpenOne, Close) => (Suspending, CLOSE),
        (OpenOne, Suspend) => (Suspending, CLOSE),
        (OpenOne, MonitorEvent::Shutdown) => (ShuttingDown, CLOSE),
        (OpenOne, LayerClose) => (Suspended, NO_ACTIONS),
        (OpenOne, Start) => (Open, NO_ACTIONS),

        // Closing: waiting for the layer to finish, then auto-restart.
        (Closing, LayerClose) => (Opening, OPEN),
        (Closing, OpenSuccess) => (Closing, CLOSE),
        (Closing, OpenFailure) => (Waiting, START_TIMER),
        (Closing, Suspend) => (Suspending, NO_ACTIONS),
        (Closing, MonitorEvent::Shutdown) => (ShuttingDown, NO_ACTIONS),

        // Suspending: waiting for the layer to finish, then stay down.
        (Suspending, LayerClose) => (Suspended, NO_ACTIONS),
        (Suspending, OpenSuccess) => (Suspending, CLOSE),
        (Suspending, OpenFailure) => (Suspended, NO_ACTIONS),
        (Suspending, Start) => (Closing, NO_ACTIONS),
        (Suspending, MonitorEvent::Shutdown) => (ShuttingDown, NO_ACTIONS),

        // Waiting for the reopen timer.
        (Waiting, OpenTimeout) => (Opening, OPEN),
        (Waiting, StartOne) => (WaitingOne, NO_ACTIONS),
        (Waiting, Close | Suspend) => (Suspended, CANCEL_TIMER),
        (Waiting, MonitorEvent::Shutdown) => (MonitorState::Shutdown, CANCEL_TIMER),

        (WaitingOne, OpenTimeout) => (OpeningOne, OPEN),
        (WaitingOne, Start) => (Waiting, NO_ACTIONS),
        (WaitingOne, Close | Suspend) => (Suspended, CANCEL_TIMER),
        (WaitingOne, MonitorEvent::Shutdown) => (MonitorState::Shutdown, CANCEL_TIMER),

        // Terminal descent.
        (ShuttingDown, LayerClose | OpenFailure) => (MonitorState::Shutdown, NO_ACTIONS),
        (ShuttingDown, OpenSuccess) => (ShuttingDown, CLOSE),

        // Everything else is ignored in place.
        _ => (state, NO_ACTIONS),
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// Monitor transition counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MonitorStats {
    pub transitions: u64,
    pub open_failures: u64,
}

/// Owns the current state and applies the transition table.
#[derive(Debug)]
pub struct ChannelMonitor {
    state: MonitorState,
    stats: MonitorStats,
}

impl ChannelMonitor {
    pub fn new() -> Self {
        ChannelMonitor {
            state: MonitorState::Init,
            stats: MonitorStats::default(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Apply an event and return the actions the owner must perform.
    pub fn apply(&mut self, event: MonitorEvent) -> &'static [MonitorAction] {
        let (next, actions) = transition(self.state, event);
        if event == MonitorEvent::OpenFailure {
            self.stats.open_failures += 1;
        }
        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, event = ?event, "monitor transition");
            self.stats.transitions += 1;
            self.state = next;
        }
        actions
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }
}

impl Default for ChannelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

//! Run scheduler: at most one run in flight, triggers coalesced.
//!
//! ```text
//!            trigger                 run finished, no follow-up
//!   Idle ───────────────► Running ─────────────────────────────► Idle
//!                          │   ▲
//!        config_changed    │   │  run finished with follow-up
//!        (sets follow_up)  └───┘  (starts exactly one more run)
//! ```
//!
//! The scheduler holds no timers; the agent loop feeds it events and acts
//! on the returned decisions.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

/// Why a run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Periodic timer
    Tick,
    /// Operator asked for a run
    RunNow,
    /// Control plane announced a new configuration
    ConfigChanged,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Tick => "tick",
            Trigger::RunNow => "run_now",
            Trigger::ConfigChanged => "config_changed",
        }
    }

    /// Manual and pushed triggers restart the periodic timer.
    pub fn resets_timer(&self) -> bool {
        !matches!(self, Trigger::Tick)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running { follow_up: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Start a run now
    Start,
    /// A run is in flight; the trigger is absorbed by it
    Coalesced,
    /// A run is in flight; one more run follows it
    FollowUpQueued,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    phase: Phase,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn on_trigger(&mut self, trigger: Trigger) -> Decision {
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Running { follow_up: false };
                Decision::Start
            }
            Phase::Running { follow_up: false } if trigger == Trigger::ConfigChanged => {
                self.phase = Phase::Running { follow_up: true };
                Decision::FollowUpQueued
            }
            Phase::Running { .. } => Decision::Coalesced,
        }
    }

    /// The in-flight run ended. Returns the trigger of the follow-up run
    /// to start immediately, if one was queued.
    pub fn on_run_finished(&mut self) -> Option<Trigger> {
        match self.phase {
            Phase::Running { follow_up: true } => {
                self.phase = Phase::Running { follow_up: false };
                Some(Trigger::ConfigChanged)
            }
            Phase::Running { follow_up: false } | Phase::Idle => {
                self.phase = Phase::Idle;
                None
            }
        }
    }
}

/// Cloneable sender for out-of-band run requests.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Trigger>,
}

impl TriggerHandle {
    /// A handle and the receiver the agent loop consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Trigger>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `false` when the request was not queued (loop gone or
    /// channel full; a full channel means a run is already pending).
    pub fn send(&self, trigger: Trigger) -> bool {
        self.tx.try_send(trigger).is_ok()
    }

    pub fn run_now(&self) -> bool {
        self.send(Trigger::RunNow)
    }

    pub fn config_changed(&self) -> bool {
        self.send(Trigger::ConfigChanged)
    }
}

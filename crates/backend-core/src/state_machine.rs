use crate::{
    error::BackendError,
    types::{SyncEvent, SyncLifecycleState},
};

/// Inputs that move the sync loop between lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// First subscriber arrived.
    Subscribe,
    /// A cycle is about to run.
    CycleBegin,
    CycleSucceeded,
    CycleFailed,
    /// Watchdog found a stuck cycle and restarts the loop.
    WatchdogReset,
    /// Last subscriber left or explicit teardown.
    Stop,
}

#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    state: SyncLifecycleState,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self {
            state: SyncLifecycleState::Idle,
        }
    }
}

impl SyncStateMachine {
    pub fn state(&self) -> SyncLifecycleState {
        self.state
    }

    /// Whether a loop task is expected to exist in this state.
    pub fn is_running(&self) -> bool {
        !matches!(
            self.state,
            SyncLifecycleState::Idle | SyncLifecycleState::Stopped
        )
    }

    /// Apply one trigger. Returns the `StateChanged` event when the state moved.
    pub fn apply(&mut self, trigger: SyncTrigger) -> Result<Option<SyncEvent>, BackendError> {
        use SyncLifecycleState::*;
        use SyncTrigger::*;

        match trigger {
            Subscribe => match self.state {
                Idle | Stopped => Ok(self.transition(Starting)),
                _ => Ok(None),
            },
            CycleBegin => self.transition_from_any_of(
                &[Starting, Scheduled, RetryBackoff],
                Syncing,
                "cycle_begin",
            ),
            CycleSucceeded => self.transition_from_any_of(&[Syncing], Scheduled, "cycle_succeeded"),
            CycleFailed => self.transition_from_any_of(&[Syncing], RetryBackoff, "cycle_failed"),
            WatchdogReset => self.transition_from_any_of(
                &[Syncing, Scheduled, RetryBackoff],
                Starting,
                "watchdog_reset",
            ),
            Stop => match self.state {
                Stopped => Ok(None),
                _ => Ok(self.transition(Stopped)),
            },
        }
    }

    fn transition(&mut self, next: SyncLifecycleState) -> Option<SyncEvent> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(SyncEvent::StateChanged { state: next })
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SyncLifecycleState],
        next: SyncLifecycleState,
        action: &str,
    ) -> Result<Option<SyncEvent>, BackendError> {
        if !expected.contains(&self.state) {
            return Err(BackendError::invalid_state(self.state, action));
        }
        Ok(self.transition(next))
    }
}

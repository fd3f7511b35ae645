use std::sync::{Condvar, Mutex};

/// Pause/resume rendezvous shared between a background accept/drain/dispatch
/// thread and whoever calls `disable()`/`enable()`/`stop()` on it.
///
/// This replaces the long-held-mutex-plus-busy-wait-on-an-atomic-flag
/// rendezvous of the pre-distillation implementation with a condition
/// variable, per the design note that calls that busy loop out explicitly.
/// The state machine is exactly the five states the specification names.
#[derive(Debug)]
pub(crate) struct Gate {
    state: Mutex<State>,
    changed: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
}

/// What a background loop should do after calling [`Gate::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    /// Proceed with the next unit of work; the gate was already running.
    Continue,
    /// Proceed with the next unit of work, but the gate just came back from
    /// a pause — any configuration read since the pause may be stale and
    /// should be re-read (e.g. a listener should rebind before accepting).
    Resumed,
    /// Exit the loop; the gate has been stopped.
    Stop,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::Running),
            changed: Condvar::new(),
        }
    }

    /// Called by the owning background thread whenever it is safe to park:
    /// between units of work, or while polling for the next one with nothing
    /// irrevocable in flight. Blocks while paused; returns immediately while
    /// running.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        loop {
            match *state {
                State::Stopping => return Checkpoint::Stop,
                State::Running => return Checkpoint::Continue,
                State::Pausing => {
                    *state = State::Paused;
                    self.changed.notify_all();
                    state = self.changed.wait(state).expect("gate mutex poisoned");
                }
                State::Paused => {
                    state = self.changed.wait(state).expect("gate mutex poisoned");
                }
                State::Resuming => {
                    *state = State::Running;
                    self.changed.notify_all();
                    return Checkpoint::Resumed;
                }
            }
        }
    }

    /// Called by the owning background thread itself to park as `Paused`
    /// without going through `Pausing` first, e.g. after a live rebind fails
    /// and the thread wants to sit out until the next `enable()`. Never
    /// called by anyone other than the thread the gate belongs to, so there
    /// is no self-wait to perform.
    pub(crate) fn force_pause(&self) {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        if !matches!(*state, State::Stopping) {
            *state = State::Paused;
            self.changed.notify_all();
        }
    }

    /// Requests a pause and blocks until the background thread has observed
    /// it and reached `Paused` (or until the gate is stopped). Idempotent.
    pub(crate) fn disable(&self) {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        match *state {
            State::Running | State::Resuming => *state = State::Pausing,
            State::Stopping => return,
            State::Pausing | State::Paused => {}
        }
        self.changed.notify_all();
        while !matches!(*state, State::Paused | State::Stopping) {
            state = self.changed.wait(state).expect("gate mutex poisoned");
        }
    }

    /// Requests a resume and blocks until the background thread has observed
    /// it and returned to `Running` (or until the gate is stopped). Idempotent.
    pub(crate) fn enable(&self) {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        match *state {
            State::Paused => *state = State::Resuming,
            // Pause was requested but never observed yet: cancel it outright.
            State::Pausing => {
                *state = State::Running;
                self.changed.notify_all();
                return;
            }
            State::Stopping | State::Running | State::Resuming => return,
        }
        self.changed.notify_all();
        while matches!(*state, State::Resuming) {
            state = self.changed.wait(state).expect("gate mutex poisoned");
        }
    }

    /// True iff the gate is currently in the `Running` state, i.e. the
    /// background thread is not paused, pausing, or stopped.
    pub(crate) fn is_enabled(&self) -> bool {
        matches!(*self.state.lock().expect("gate mutex poisoned"), State::Running | State::Resuming)
    }

    /// Signals the background thread to exit, waking it if it is currently
    /// paused so that it can observe the stop request.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        *state = State::Stopping;
        self.changed.notify_all();
    }
}

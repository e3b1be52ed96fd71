//! Cross-worker coordination for a receiver session
//!
//! One controller is shared by all sibling workers. It tracks which
//! workers are running/waiting/finished, hands out named funnels (for
//! work that exactly one worker must perform on behalf of all) and named
//! condition variables, and brackets the session with first-entry /
//! last-exit hooks. Nothing here may be held across network IO.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Funnel electing the worker that transmits resumption chunk info.
pub const SEND_FILE_CHUNKS_FUNNEL: &str = "send_file_chunks";
/// Condition the end-of-session rendezvous waits on.
pub const WAIT_FOR_FINISH_OR_CHECKPOINT_CV: &str = "wait_for_finish_or_checkpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Waiting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunnelState {
    Start,
    InProgress,
    End,
}

/// What a caller learns from polling a funnel. `Start` means the caller
/// was just elected and now owes a `notify_success` or `notify_fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelStatus {
    Start,
    Progress,
    End,
}

pub struct Funnel {
    state: Mutex<FunnelState>,
    cv: Condvar,
}

impl Funnel {
    fn new() -> Self {
        Funnel {
            state: Mutex::new(FunnelState::Start),
            cv: Condvar::new(),
        }
    }

    /// Atomically poll-and-elect.
    pub fn status(&self) -> FunnelStatus {
        let mut state = self.state.lock();
        match *state {
            FunnelState::Start => {
                *state = FunnelState::InProgress;
                FunnelStatus::Start
            }
            FunnelState::InProgress => FunnelStatus::Progress,
            FunnelState::End => FunnelStatus::End,
        }
    }

    /// Block while the elected worker is in progress, up to `timeout`.
    pub fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if *state == FunnelState::InProgress {
            self.cv.wait_for(&mut state, timeout);
        }
    }

    /// Elected worker finished; the funnel is permanently done.
    pub fn notify_success(&self) {
        let mut state = self.state.lock();
        *state = FunnelState::End;
        self.cv.notify_all();
    }

    /// Elected worker abdicates; a later caller may be elected instead.
    pub fn notify_fail(&self) {
        let mut state = self.state.lock();
        *state = FunnelState::Start;
        self.cv.notify_all();
    }
}

pub struct Condition {
    mutex: Mutex<()>,
    cv: Condvar,
}

/// Holds the condition's mutex for its lifetime.
pub struct ConditionGuard<'a> {
    guard: MutexGuard<'a, ()>,
    cv: &'a Condvar,
}

impl Condition {
    fn new() -> Self {
        Condition {
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> ConditionGuard<'_> {
        ConditionGuard {
            guard: self.mutex.lock(),
            cv: &self.cv,
        }
    }
}

impl ConditionGuard<'_> {
    pub fn wait(&mut self, timeout: Duration) {
        self.cv.wait_for(&mut self.guard, timeout);
    }

    pub fn notify_one(&self) {
        self.cv.notify_one();
    }
}

#[derive(Default)]
struct SessionBrackets {
    started: bool,
    exited: usize,
}

pub struct ThreadsController {
    total_threads: usize,
    registry: Mutex<HashMap<usize, WorkerState>>,
    funnels: Mutex<HashMap<&'static str, Arc<Funnel>>>,
    conditions: Mutex<HashMap<&'static str, Arc<Condition>>>,
    brackets: Mutex<SessionBrackets>,
}

impl ThreadsController {
    pub fn new(total_threads: usize) -> Self {
        ThreadsController {
            total_threads,
            registry: Mutex::new(HashMap::new()),
            funnels: Mutex::new(HashMap::new()),
            conditions: Mutex::new(HashMap::new()),
            brackets: Mutex::new(SessionBrackets::default()),
        }
    }

    pub fn register_thread(&self, thread_index: usize) {
        self.registry
            .lock()
            .insert(thread_index, WorkerState::Running);
    }

    pub fn deregister_thread(&self, thread_index: usize) {
        self.registry.lock().remove(&thread_index);
    }

    pub fn mark_state(&self, thread_index: usize, state: WorkerState) {
        if let Some(s) = self.registry.lock().get_mut(&thread_index) {
            *s = state;
        }
    }

    /// True if any *other* registered worker is in `state`.
    pub fn has_threads(&self, thread_index: usize, state: WorkerState) -> bool {
        self.registry
            .lock()
            .iter()
            .any(|(idx, s)| *idx != thread_index && *s == state)
    }

    pub fn get_funnel(&self, name: &'static str) -> Arc<Funnel> {
        self.funnels
            .lock()
            .entry(name)
            .or_insert_with(|| Arc::new(Funnel::new()))
            .clone()
    }

    pub fn get_condition(&self, name: &'static str) -> Arc<Condition> {
        self.conditions
            .lock()
            .entry(name)
            .or_insert_with(|| Arc::new(Condition::new()))
            .clone()
    }

    /// Run `f` for the first sibling that gets here; later callers skip
    /// it. The bracket mutex is held across `f`, so siblings cannot race
    /// past a half-initialized session.
    pub fn execute_at_start<F: FnOnce()>(&self, f: F) {
        let mut brackets = self.brackets.lock();
        if !brackets.started {
            brackets.started = true;
            f();
        }
    }

    /// Run `f` for the last sibling to exit.
    pub fn execute_at_end<F: FnOnce()>(&self, f: F) {
        let mut brackets = self.brackets.lock();
        brackets.exited += 1;
        if brackets.exited == self.total_threads {
            f();
        }
    }
}

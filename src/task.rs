// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! A thread backed, cancellable future with exactly one terminal outcome.
//!
//! Every [`CancellableTask`] owns its own lock and condition variable, there is
//! no global coordination between tasks.

use crate::DriftError;
use crate::utils::lock;
use log::debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Cheap, clonable view of a task's cancellation flag, handed to the worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Release)
    }
}

type Canceller = Box<dyn FnOnce() + Send>;

struct Slot<T> {
    state: TaskState,
    outcome: Option<Result<T, DriftError>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    done: Condvar,
    token: CancelToken,
    canceller: Mutex<Option<Canceller>>,
    progress: Mutex<(Option<Instant>, Option<Instant>)>,
}

/// Handle to a unit of work running on its own worker thread.
///
/// States go `Pending -> Running -> {Finished, Cancelled, Failed}`. Whichever
/// of natural completion, [`CancellableTask::cancel()`] or a failure happens
/// first decides the outcome; later completions are ignored.
pub struct CancellableTask<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CancellableTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for CancellableTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableTask")
            .field("state", &lock(&self.inner.slot).state)
            .finish()
    }
}

impl<T> Default for CancellableTask<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CancellableTask<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    state: TaskState::Pending,
                    outcome: None,
                }),
                done: Condvar::new(),
                token: CancelToken::default(),
                canceller: Mutex::new(None),
                progress: Mutex::new((None, None)),
            }),
        }
    }

    /// Starts `work` on a dedicated thread. A task can only be submitted once.
    ///
    /// `work` receives the task's [`CancelToken`]. Returning an error, or
    /// panicking, moves the task to `Failed`.
    pub fn submit<F>(&self, name: &str, work: F) -> Result<(), DriftError>
    where
        F: FnOnce(CancelToken) -> Result<T, DriftError> + Send + 'static,
    {
        {
            let mut slot = lock(&self.inner.slot);
            match slot.state {
                TaskState::Pending => slot.state = TaskState::Running,
                TaskState::Cancelled => return Ok(()),
                other => {
                    return Err(DriftError::InvalidState(format!(
                        "task '{name}' already submitted ({other:?})"
                    )));
                }
            }
        }
        {
            let mut progress = lock(&self.inner.progress);
            if progress.0.is_none() {
                progress.0 = Some(Instant::now());
            }
        }

        let inner = Arc::clone(&self.inner);
        let token = self.inner.token.clone();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(token)))
                    .unwrap_or_else(|_| {
                        Err(DriftError::ProcessingError("worker panicked".to_string()))
                    });
                Self::finalize(&inner, outcome);
            });
        if let Err(e) = spawned {
            let err = DriftError::ProcessingError(format!("could not spawn worker: {e}"));
            Self::finalize(&self.inner, Err(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Writes the terminal outcome, unless one was already written.
    fn finalize(inner: &Inner<T>, outcome: Result<T, DriftError>) -> bool {
        let mut slot = lock(&inner.slot);
        if slot.state.is_terminal() {
            return false;
        }
        slot.state = if outcome.is_ok() {
            TaskState::Finished
        } else {
            TaskState::Failed
        };
        slot.outcome = Some(outcome);
        drop(slot);
        lock(&inner.progress).1 = Some(Instant::now());
        inner.done.notify_all();
        true
    }

    /// Registers the hook that halts the underlying work (e.g. unsubscribes
    /// from a detector). It runs synchronously inside [`Self::cancel()`], or
    /// right away if the task is already cancelled.
    pub fn set_canceller<F>(&self, canceller: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state() == TaskState::Cancelled {
            canceller();
            return;
        }
        *lock(&self.inner.canceller) = Some(Box::new(canceller));
        // cancel() may have run between the check and the store
        if self.state() == TaskState::Cancelled {
            if let Some(c) = lock(&self.inner.canceller).take() {
                c();
            }
        }
    }

    /// Cancels a pending or running task.
    ///
    /// Returns `true` if the cancellation took effect, `false` if the task had
    /// already reached a terminal state. Never blocks on the worker, never fails.
    /// The canceller hook has completed when this returns.
    pub fn cancel(&self) -> bool {
        {
            let mut slot = lock(&self.inner.slot);
            if slot.state.is_terminal() {
                return false;
            }
            slot.state = TaskState::Cancelled;
            slot.outcome = Some(Err(DriftError::Cancelled));
        }
        self.inner.token.cancel();
        lock(&self.inner.progress).1 = Some(Instant::now());
        self.inner.done.notify_all();
        if let Some(canceller) = lock(&self.inner.canceller).take() {
            canceller();
        }
        debug!("task cancelled");
        true
    }

    pub fn state(&self) -> TaskState {
        lock(&self.inner.slot).state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// The flag handed to the worker, for code that polls it elsewhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.token.clone()
    }

    /// Waits for the outcome.
    ///
    /// - `Ok(value)` if the task finished
    /// - `Err(DriftError::Timeout)` if `timeout` elapsed first, the task keeps running
    /// - `Err(DriftError::Cancelled)` if the task was cancelled
    /// - the task's own error if it failed
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, DriftError> {
        let slot = lock(&self.inner.slot);
        let slot = match timeout {
            None => self
                .inner
                .done
                .wait_while(slot, |s| !s.state.is_terminal())
                .unwrap_or_else(|e| e.into_inner()),
            Some(t) => {
                let (slot, waited) = self
                    .inner
                    .done
                    .wait_timeout_while(slot, t, |s| !s.state.is_terminal())
                    .unwrap_or_else(|e| e.into_inner());
                if waited.timed_out() && !slot.state.is_terminal() {
                    return Err(DriftError::Timeout(t));
                }
                slot
            }
        };
        match &slot.outcome {
            Some(outcome) => outcome.clone(),
            None => Err(DriftError::ProcessingError(
                "terminal task without outcome".to_string(),
            )),
        }
    }

    /// Sets the expected start and end time of the work.
    pub fn set_progress(&self, start: Instant, end: Instant) {
        *lock(&self.inner.progress) = (Some(start), Some(end));
    }

    /// Expected (or, once terminal, actual) end time.
    pub fn estimated_end(&self) -> Option<Instant> {
        lock(&self.inner.progress).1
    }

    /// Time left until [`Self::estimated_end()`], zero when overdue or done.
    pub fn remaining(&self) -> Option<Duration> {
        if self.is_done() {
            return Some(Duration::ZERO);
        }
        self.estimated_end()
            .map(|end| end.saturating_duration_since(Instant::now()))
    }
}

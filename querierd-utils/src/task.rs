//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Async task and timer handles, sized to what an IGMP querier needs: the
// membership, leave-retransmit, version and other-querier-present timers are
// one-shot deadlines that get pushed around a lot (every accepted report
// restarts one), the general-query timer is a plain periodic tick, and the
// socket loops are long-lived tasks.
//
// A timer is a plain task sleeping on a deadline kept in a shared slot.
// Rescheduling writes the slot and nudges the sleeper; the sleeper re-checks
// the slot whenever it wakes, so a deadline that moved while it slept never
// fires early. Once fired, further resets find no sleeper and are no-ops,
// and the remaining time reads as zero.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::{task, time};
use tracing::{Instrument, error};

/// A handle for the task created by [`Task::spawn`].
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
}

/// A handle for the one-shot timer created by [`TimeoutTask::new`].
///
/// Dropping the handle cancels the timer; cancelling or resetting a timer
/// whose callback has already run is a no-op.
#[derive(Debug)]
pub struct TimeoutTask {
    _task: Task<()>,
    timeout: Duration,
    shared: Arc<TimerShared>,
}

/// A handle for the periodic timer created by [`IntervalTask::new`].
///
/// Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct IntervalTask {
    _task: Task<()>,
}

#[derive(Debug)]
struct TimerShared {
    deadline: Mutex<Instant>,
    reschedule: Notify,
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
        }
    }

    /// Spawns a supervised task that automatically restarts if it panics.
    /// The task will terminate if it completes successfully or returns an
    /// error.
    ///
    /// Intended for the network receive loop, which is exposed to untrusted
    /// input: dropping the offending packet and keeping the loop alive is
    /// preferable to taking down the whole daemon.
    pub fn spawn_supervised<F, Fut>(spawn_fn: F) -> Task<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task::spawn(
            async move {
                loop {
                    match Task::spawn(spawn_fn()).await {
                        Err(error) if error.is_panic() => {
                            error!("task panicked, restarting...");
                        }
                        Err(error) => {
                            error!(%error, "task failed");
                            break;
                        }
                        Ok(_) => break,
                    }
                }
            }
            .in_current_span(),
        )
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Spawns a new task that will call the provided async closure when the
    /// specified timeout expires.
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let shared = Arc::new(TimerShared {
            deadline: Mutex::new(Instant::now() + timeout),
            reschedule: Notify::new(),
        });
        let shared_child = shared.clone();

        let task = Task::spawn(
            async move {
                loop {
                    let deadline = *shared_child.deadline.lock().unwrap();
                    tokio::select! {
                        _ = time::sleep_until(deadline) => {
                            // The deadline may have been pushed back while
                            // sleeping.
                            let deadline =
                                *shared_child.deadline.lock().unwrap();
                            if Instant::now() < deadline {
                                continue;
                            }
                            (cb)().await;
                            break;
                        }
                        _ = shared_child.reschedule.notified() => {
                            // Pick up the new deadline.
                            continue;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        TimeoutTask {
            _task: task,
            timeout,
            shared,
        }
    }

    /// Resets the timeout, regardless if it has already expired or not.
    ///
    /// If a new timeout value isn't specified, the initial value is reused.
    pub fn reset(&mut self, timeout: Option<Duration>) {
        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        *self.shared.deadline.lock().unwrap() = deadline;
        self.shared.reschedule.notify_one();
    }

    /// Returns the remaining time before the timeout expires.
    pub fn remaining(&self) -> Duration {
        let deadline = *self.shared.deadline.lock().unwrap();
        deadline.saturating_duration_since(Instant::now())
    }
}

// ===== impl IntervalTask =====

impl IntervalTask {
    /// Spawns a new task that will call the provided async closure whenever
    /// the specified interval timer ticks.
    pub fn new<F, Fut>(
        interval: Duration,
        tick_on_start: bool,
        mut cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task = Task::spawn(
            async move {
                let mut ticks = if tick_on_start {
                    time::interval(interval)
                } else {
                    time::interval_at(Instant::now() + interval, interval)
                };

                loop {
                    ticks.tick().await;
                    (cb)().await;
                }
            }
            .in_current_span(),
        );

        IntervalTask { _task: task }
    }
}

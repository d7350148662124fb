// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Owned serial task runners.
//!
//! All decoder state lives on exactly one of these runners; other threads
//! (the device poller, the surface pool fetch worker, client threads) only
//! post tasks. Handles hold a weak reference so tasks posted to an
//! already-dropped runner are silently discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct DelayedTask {
    due: Instant,
    task: Task,
}

#[derive(Default)]
struct TaskQueue {
    tasks: VecDeque<Task>,
    // Kept sorted by due time; the backoff paths only ever schedule a couple
    // of entries.
    delayed: Vec<DelayedTask>,
    stopped: bool,
}

struct RunnerShared {
    queue: Mutex<TaskQueue>,
    cond: Condvar,
}

/// A worker thread executing posted tasks strictly in order.
pub struct SerialTaskRunner {
    shared: Arc<RunnerShared>,
    thread: Option<JoinHandle<()>>,
}

impl SerialTaskRunner {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(RunnerShared {
            queue: Mutex::new(TaskQueue::default()),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || Self::run_loop(thread_shared))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> TaskRunnerHandle {
        TaskRunnerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn run_loop(shared: Arc<RunnerShared>) {
        let mut queue = shared.queue.lock().unwrap();
        loop {
            let now = Instant::now();
            while let Some(pos) = queue.delayed.iter().position(|d| d.due <= now) {
                let delayed = queue.delayed.remove(pos);
                queue.tasks.push_back(delayed.task);
            }

            if let Some(task) = queue.tasks.pop_front() {
                drop(queue);
                task();
                queue = shared.queue.lock().unwrap();
                continue;
            }

            if queue.stopped {
                break;
            }

            let next_due = queue.delayed.iter().map(|d| d.due).min();
            queue = match next_due {
                Some(due) => {
                    let timeout = due.saturating_duration_since(now);
                    shared.cond.wait_timeout(queue, timeout).unwrap().0
                }
                None => shared.cond.wait(queue).unwrap(),
            };
        }
    }
}

impl Drop for SerialTaskRunner {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.stopped = true;
            // Delayed work is abandoned on shutdown; only tasks already
            // posted still run.
            queue.delayed.clear();
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A cloneable, weak handle for posting tasks to a [`SerialTaskRunner`].
#[derive(Clone)]
pub struct TaskRunnerHandle {
    shared: Weak<RunnerShared>,
}

impl TaskRunnerHandle {
    /// Post a task for execution. Returns false if the runner is gone.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        let mut queue = shared.queue.lock().unwrap();
        if queue.stopped {
            return false;
        }
        queue.tasks.push_back(Box::new(task));
        drop(queue);
        shared.cond.notify_all();
        true
    }

    /// Post a task to run no earlier than `delay` from now.
    pub fn post_delayed(&self, task: impl FnOnce() + Send + 'static, delay: Duration) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        let mut queue = shared.queue.lock().unwrap();
        if queue.stopped {
            return false;
        }
        queue.delayed.push(DelayedTask {
            due: Instant::now() + delay,
            task: Box::new(task),
        });
        drop(queue);
        shared.cond.notify_all();
        true
    }

    /// Post a task and block until it has run, returning its result. Must not
    /// be called from the runner thread itself. Returns `None` if the runner
    /// is gone.
    pub fn post_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> Option<R> {
        let event = Arc::new(WaitEvent::<R>::new());
        let signal = event.clone();

        if !self.post(move || signal.signal(task())) {
            return None;
        }

        Some(event.wait())
    }
}

/// A one-shot event carrying a value, for the blocking component entry
/// points.
struct WaitEvent<R> {
    value: Mutex<Option<R>>,
    cond: Condvar,
}

impl<R> WaitEvent<R> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn signal(&self, value: R) {
        *self.value.lock().unwrap() = Some(value);
        self.cond.notify_all();
    }

    fn wait(&self) -> R {
        let mut value = self.value.lock().unwrap();
        loop {
            match value.take() {
                Some(value) => return value,
                None => value = self.cond.wait(value).unwrap(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[test]
    fn tasks_run_in_order() {
        let runner = SerialTaskRunner::new("test").unwrap();
        let handle = runner.handle();

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            assert!(handle.post(move || log.lock().unwrap().push(i)));
        }

        let done: Vec<i32> = handle.post_and_wait(move || Vec::new()).unwrap();
        assert!(done.is_empty());
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn post_and_wait_returns_value() {
        let runner = SerialTaskRunner::new("test").unwrap();
        assert_eq!(runner.handle().post_and_wait(|| 7), Some(7));
    }

    #[test]
    fn delayed_task_runs_after_delay() {
        let runner = SerialTaskRunner::new("test").unwrap();
        let handle = runner.handle();

        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = counter.clone();
        let start = Instant::now();
        handle.post_delayed(
            move || {
                task_counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(20),
        );

        while counter.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::yield_now();
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn handle_outliving_runner_is_inert() {
        let runner = SerialTaskRunner::new("test").unwrap();
        let handle = runner.handle();
        drop(runner);

        assert!(!handle.post(|| ()));
        assert!(!handle.post_delayed(|| (), Duration::from_millis(1)));
        assert_eq!(handle.post_and_wait(|| 1), None);
    }
}

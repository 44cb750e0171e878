//! A single-consumer FIFO job queue backed by an OS thread.
//!
//! Work is coordinated with a plain `Mutex` + `Condvar` rather than an async
//! runtime: every component in this system (poller, store, Merkle writer)
//! drives its own queue this way, so a panic or a slow SQLite write in one
//! component never stalls another.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

/// How long the worker loop blocks between queue polls while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct JobDone {
    finished: Mutex<bool>,
    cond: Condvar,
}

impl JobDone {
    fn new() -> Self {
        Self {
            finished: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut finished = self.finished.lock().unwrap();
        *finished = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut finished = self.finished.lock().unwrap();
        while !*finished {
            finished = self.cond.wait(finished).unwrap();
        }
    }
}

/// A unit of work submitted to a [`TaskQueue`].
pub struct Job {
    name: String,
    task: Box<dyn FnOnce() + Send>,
    on_exception: Option<Box<dyn Fn(&str) + Send>>,
    done: Arc<JobDone>,
}

impl Job {
    /// Create a job. `task` runs on the queue's worker thread.
    pub fn new(name: impl Into<String>, task: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            task: Box::new(task),
            on_exception: None,
            done: Arc::new(JobDone::new()),
        }
    }

    /// Attach a handler invoked (on the worker thread) if `task` panics,
    /// instead of the default "log and move on" behavior.
    pub fn with_on_exception(mut self, handler: impl Fn(&str) + Send + 'static) -> Self {
        self.on_exception = Some(Box::new(handler));
        self
    }
}

struct State {
    queue: VecDeque<Job>,
    off: bool,
}

/// Single-consumer FIFO executor: one worker thread drains jobs pushed from
/// any number of producer threads.
pub struct TaskQueue {
    tag: String,
    state: Arc<Mutex<State>>,
    cond: Arc<Condvar>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                off: true,
            })),
            cond: Arc::new(Condvar::new()),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread. A no-op (with a warning) if already running.
    pub fn start(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.off {
                warn!(target: "mixer_queue", tag = %self.tag, "start() already started");
                return;
            }
            state.off = false;
        }

        let state = self.state.clone();
        let cond = self.cond.clone();
        let tag = self.tag.clone();
        let handle = thread::Builder::new()
            .name(format!("taskqueue-{}", self.tag))
            .spawn(move || run_loop(tag, state, cond))
            .expect("failed to spawn TaskQueue worker thread");

        *self.worker.lock().unwrap() = Some(handle);

        let tag = self.tag.clone();
        self.run_sync(Job::new("TaskQueue", move || {
            debug!(target: "mixer_queue", tag = %tag, "start() done");
        }));
    }

    /// Stop the worker thread, letting it drain any queued jobs first.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.off {
                warn!(target: "mixer_queue", tag = %self.tag, "stop() already stopped");
                return;
            }
            debug!(target: "mixer_queue", tag = %self.tag, "stop() shutting down");
            state.off = true;
            self.cond.notify_all();
        }

        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.join().expect("TaskQueue worker thread panicked");
        }
        debug!(target: "mixer_queue", tag = %self.tag, "stop() done");
    }

    /// Number of jobs currently queued (not counting one in flight).
    pub fn queue_size(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Submit a job and block the caller until it has run.
    ///
    /// Returns `false` without queuing anything if the queue is stopped.
    pub fn run_sync(&self, job: Job) -> bool {
        let done = job.done.clone();
        if !self.enqueue(job) {
            warn!(target: "mixer_queue", tag = %self.tag, "run_sync(), queue is stopped");
            return false;
        }
        done.wait();
        true
    }

    /// Submit a job without waiting for it to run.
    ///
    /// Returns `false` without queuing anything if the queue is stopped.
    pub fn run_async(&self, job: Job) -> bool {
        if !self.enqueue(job) {
            warn!(target: "mixer_queue", tag = %self.tag, "run_async(), queue is turned off");
            return false;
        }
        true
    }

    fn enqueue(&self, job: Job) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.off {
            return false;
        }
        state.queue.push_back(job);
        self.cond.notify_all();
        true
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let is_running = !self.state.lock().unwrap().off;
        if is_running {
            self.stop();
        }
    }
}

fn run_loop(tag: String, state: Arc<Mutex<State>>, cond: Arc<Condvar>) {
    loop {
        let job = {
            let mut guard = state.lock().unwrap();
            loop {
                if guard.queue.is_empty() && guard.off {
                    return;
                }
                if !guard.queue.is_empty() {
                    break;
                }
                let (g, _timeout) = cond.wait_timeout(guard, POLL_INTERVAL).unwrap();
                guard = g;
            }
            guard.queue.pop_front()
        };

        if let Some(job) = job {
            let name = job.name.clone();
            let on_exception = job.on_exception;
            let result = panic::catch_unwind(AssertUnwindSafe(job.task));
            if let Err(payload) = result {
                let message = panic_message(&payload);
                match on_exception {
                    None => {
                        error!(target: "mixer_queue", tag = %tag, job = %name, error = %message, "unhandled panic in task");
                    }
                    Some(handler) => {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&message)));
                        if let Err(inner) = outcome {
                            let inner_message = panic_message(&inner);
                            error!(
                                target: "mixer_queue",
                                tag = %tag,
                                job = %name,
                                original_error = %message,
                                handler_error = %inner_message,
                                "on_exception handler itself panicked"
                            );
                        }
                    }
                }
            }
            job.done.signal();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

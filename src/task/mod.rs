//! A time-ordered cooperative task scheduler.
//!
//! One [`TaskRunner`] coordinates any number of named [`TaskQueue`]s. Tasks
//! in a queue run serially; tasks in different queues run concurrently.
//! Rescheduling a name that is already pending replaces its deadline. A task
//! returns the delay until it should run again, or -1 to finish.
//!
//! The real backend runs tasks on spawned threads driven by a coordinator.
//! The test backend substitutes a virtual clock stepped explicitly, so
//! time-dependent behavior is deterministic under test.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A task body: runs, then returns the nanoseconds until its next run, or -1
/// to stop.
type TaskFn = Box<dyn FnMut() -> i64 + Send>;

struct Task {
    queue_id: u64,
    name: String,
    execute_at: u64,
    seq: u64,
    run: TaskFn,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({} @ {})", self.name, self.execute_at)
    }
}

/// Supplies time and execution to a [`TaskRunner`].
pub(crate) trait Backend: Send + Sync {
    /// Monotonic nanoseconds.
    fn nano_time(&self) -> u64;

    /// Runs `work` off the coordinator thread.
    fn execute(&self, work: Box<dyn FnOnce() + Send>);

    /// True when a coordinator thread should drive the runner. The test
    /// backend runs tasks inline from `advance_until` instead.
    fn coordinates(&self) -> bool {
        true
    }
}

/// Wall-clock backend executing tasks on short-lived threads.
pub(crate) struct RealBackend {
    origin: Instant,
}

impl RealBackend {
    pub(crate) fn new() -> RealBackend {
        RealBackend {
            origin: Instant::now(),
        }
    }
}

impl Backend for RealBackend {
    fn nano_time(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn execute(&self, work: Box<dyn FnOnce() + Send>) {
        std::thread::Builder::new()
            .name("courier task".to_string())
            .spawn(work)
            .expect("failed to spawn task thread");
    }
}

/// Virtual-clock backend for tests.
pub(crate) struct TestBackend {
    now: AtomicU64,
}

impl TestBackend {
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn new() -> TestBackend {
        TestBackend {
            now: AtomicU64::new(0),
        }
    }
}

impl Backend for TestBackend {
    fn nano_time(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn execute(&self, work: Box<dyn FnOnce() + Send>) {
        // Inline: determinism beats concurrency under test.
        work();
    }

    fn coordinates(&self) -> bool {
        false
    }
}

struct RunnerState {
    tasks: Vec<Task>,
    /// Queues currently running a task; their other tasks must wait.
    busy_queues: HashSet<u64>,
    next_queue_id: u64,
    next_seq: u64,
    coordinator_running: bool,
    shutdown: bool,
}

struct RunnerInner {
    backend: Arc<dyn Backend>,
    /// Set when built by `for_test`; grants access to the virtual clock.
    #[cfg_attr(not(test), allow(dead_code))]
    test: Option<Arc<TestBackend>>,
    state: Mutex<RunnerState>,
    condvar: Condvar,
}

/// The shared scheduler. Cheap to clone.
#[derive(Clone)]
pub(crate) struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TaskRunner")
    }
}

impl TaskRunner {
    pub(crate) fn new() -> TaskRunner {
        TaskRunner::with_backend(Arc::new(RealBackend::new()), None)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn for_test() -> TaskRunner {
        let test = Arc::new(TestBackend::new());
        TaskRunner::with_backend(test.clone(), Some(test))
    }

    fn with_backend(backend: Arc<dyn Backend>, test: Option<Arc<TestBackend>>) -> TaskRunner {
        TaskRunner {
            inner: Arc::new(RunnerInner {
                backend,
                test,
                state: Mutex::new(RunnerState {
                    tasks: Vec::new(),
                    busy_queues: HashSet::new(),
                    next_queue_id: 0,
                    next_seq: 0,
                    coordinator_running: false,
                    shutdown: false,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    pub(crate) fn nano_time(&self) -> u64 {
        self.inner.backend.nano_time()
    }

    pub(crate) fn new_queue(&self, name: impl Into<String>) -> TaskQueue {
        let mut state = self.inner.state.lock().expect("task runner poisoned");
        let id = state.next_queue_id;
        state.next_queue_id += 1;
        TaskQueue {
            runner: self.clone(),
            id,
            name: name.into(),
        }
    }

    /// Cancels everything and unblocks the coordinator.
    pub(crate) fn shutdown(&self) {
        let mut state = self.inner.state.lock().expect("task runner poisoned");
        state.shutdown = true;
        state.tasks.clear();
        self.inner.condvar.notify_all();
    }

    /// Test hook: advances the virtual clock to `until_ns`, running every
    /// task due on the way, in deadline order.
    #[cfg(test)]
    pub(crate) fn advance_until(&self, until_ns: u64) {
        loop {
            let task = {
                let mut state = self.inner.state.lock().expect("task runner poisoned");
                match earliest_runnable(&state, until_ns) {
                    Some(i) => {
                        let task = state.tasks.remove(i);
                        state.busy_queues.insert(task.queue_id);
                        task
                    }
                    None => break,
                }
            };
            if let Some(test) = self.test_backend() {
                test.now.fetch_max(task.execute_at, Ordering::SeqCst);
            }
            self.run_task(task);
        }
        if let Some(test) = self.test_backend() {
            test.now.fetch_max(until_ns, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    fn test_backend(&self) -> Option<&TestBackend> {
        self.inner.test.as_deref()
    }

    fn schedule(&self, queue_id: u64, name: &str, delay_ns: u64, run: TaskFn) {
        let mut state = self.inner.state.lock().expect("task runner poisoned");
        if state.shutdown {
            return;
        }
        let execute_at = self.inner.backend.nano_time().saturating_add(delay_ns);
        let seq = state.next_seq;
        state.next_seq += 1;

        // Latest-wins: replace a pending task with the same queue and name.
        state
            .tasks
            .retain(|t| !(t.queue_id == queue_id && t.name == name));
        state.tasks.push(Task {
            queue_id,
            name: name.to_string(),
            execute_at,
            seq,
            run,
        });

        if self.inner.backend.coordinates() && !state.coordinator_running {
            state.coordinator_running = true;
            let runner = self.clone();
            self.inner.backend.execute(Box::new(move || runner.coordinate()));
        }
        self.inner.condvar.notify_all();
    }

    fn cancel_queue(&self, queue_id: u64) {
        let mut state = self.inner.state.lock().expect("task runner poisoned");
        state.tasks.retain(|t| t.queue_id != queue_id);
        self.inner.condvar.notify_all();
    }

    fn coordinate(&self) {
        loop {
            let task = {
                let mut state = self.inner.state.lock().expect("task runner poisoned");
                loop {
                    if state.shutdown {
                        state.coordinator_running = false;
                        return;
                    }
                    if state.tasks.is_empty() && state.busy_queues.is_empty() {
                        state.coordinator_running = false;
                        return;
                    }
                    let now = self.inner.backend.nano_time();
                    match earliest_runnable(&state, now) {
                        Some(i) => {
                            let task = state.tasks.remove(i);
                            state.busy_queues.insert(task.queue_id);
                            break task;
                        }
                        None => {
                            let wait = state
                                .tasks
                                .iter()
                                .filter(|t| !state.busy_queues.contains(&t.queue_id))
                                .map(|t| t.execute_at.saturating_sub(now))
                                .min()
                                .unwrap_or(u64::MAX / 4);
                            let wait = Duration::from_nanos(wait.max(1));
                            let (next, _timeout) = self
                                .inner
                                .condvar
                                .wait_timeout(state, wait)
                                .expect("task runner poisoned");
                            state = next;
                        }
                    }
                }
            };

            let runner = self.clone();
            self.inner.backend.execute(Box::new(move || runner.run_task(task)));
        }
    }

    fn run_task(&self, mut task: Task) {
        tracing::trace!("run task {:?}", task);
        let next_delay = (task.run)();
        let mut state = self.inner.state.lock().expect("task runner poisoned");
        state.busy_queues.remove(&task.queue_id);
        if next_delay >= 0 && !state.shutdown {
            task.execute_at = self.inner.backend.nano_time().saturating_add(next_delay as u64);
            let seq = state.next_seq;
            state.next_seq += 1;
            task.seq = seq;
            let (queue_id, name) = (task.queue_id, task.name.clone());
            state
                .tasks
                .retain(|t| !(t.queue_id == queue_id && t.name == name));
            state.tasks.push(task);
        }
        self.inner.condvar.notify_all();
    }
}

/// Picks the index of the earliest due task whose queue is free; ties break
/// FIFO by scheduling order.
fn earliest_runnable(state: &RunnerState, now: u64) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, task) in state.tasks.iter().enumerate() {
        if task.execute_at > now || state.busy_queues.contains(&task.queue_id) {
            continue;
        }
        best = match best {
            None => Some(i),
            Some(j) => {
                let other = &state.tasks[j];
                if (task.execute_at, task.seq) < (other.execute_at, other.seq) {
                    Some(i)
                } else {
                    Some(j)
                }
            }
        };
    }
    best
}

/// A named serial queue on a [`TaskRunner`].
#[derive(Clone)]
pub(crate) struct TaskQueue {
    runner: TaskRunner,
    id: u64,
    name: String,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskQueue({})", self.name)
    }
}

impl TaskQueue {
    /// Schedules a repeatable task. Scheduling an already-pending `name`
    /// replaces its deadline and body.
    pub(crate) fn schedule<F>(&self, name: &str, delay_ns: u64, run: F)
    where
        F: FnMut() -> i64 + Send + 'static,
    {
        self.runner.schedule(self.id, name, delay_ns, Box::new(run));
    }

    /// Schedules a one-shot task.
    pub(crate) fn execute<F>(&self, name: &str, delay_ns: u64, run: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut run = Some(run);
        self.schedule(name, delay_ns, move || {
            if let Some(run) = run.take() {
                run();
            }
            -1
        });
    }

    /// Cancels all pending tasks on this queue.
    pub(crate) fn cancel_all(&self) {
        self.runner.cancel_queue(self.id);
    }

    pub(crate) fn runner(&self) -> &TaskRunner {
        &self.runner
    }
}

//! Worker-pool scheduler with affinity-aware FIFO dispatch.
//!
//! Tasks (fibers or plain callbacks) sit in a single shared FIFO queue; each
//! worker claims the first task whose affinity matches its own id, runs it,
//! and goes back for more. Callbacks are executed inside a per-worker fiber
//! so they can suspend like any other fiber; a finished callback fiber is
//! reset and reused for the next callback instead of being reallocated.
//!
//! Idle behavior and the stopping condition are injected through
//! [`IdlePolicy`] rather than inherited: the base policy backs off briefly,
//! and the event loop installs one that blocks on readiness instead.

use crate::fiber::{self, Fiber, FiberRef, FiberState, DEFAULT_STACK_SIZE};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a scheduled task runs.
pub enum TaskKind {
    /// Resume an existing fiber.
    Fiber(FiberRef),
    /// Run a callback inside a (reused) worker fiber.
    Call(Box<dyn FnOnce() + Send>),
}

/// A unit of work owned by the queue until claimed by exactly one worker.
pub struct Task {
    kind: TaskKind,
    affinity: Option<usize>,
}

impl Task {
    /// A callback task runnable on any worker.
    pub fn call(f: impl FnOnce() + Send + 'static) -> Self {
        Self::call_boxed(Box::new(f))
    }

    pub(crate) fn call_boxed(f: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            kind: TaskKind::Call(f),
            affinity: None,
        }
    }

    /// A task that resumes `fiber`.
    pub fn fiber(fiber: FiberRef) -> Self {
        Self {
            kind: TaskKind::Fiber(fiber),
            affinity: None,
        }
    }

    /// Pin the task to a specific worker id.
    pub fn with_affinity(mut self, worker: usize) -> Self {
        self.affinity = Some(worker);
        self
    }
}

/// Injected idle behavior and stopping condition for a scheduler.
pub trait IdlePolicy: Send + Sync + 'static {
    /// Called on each worker thread before it starts claiming tasks.
    fn on_worker_start(&self) {}

    /// Called on each worker thread after its loop exits.
    fn on_worker_stop(&self) {}

    /// Block or back off until new work is likely available.
    fn idle(&self);

    /// Cross-thread wakeup hint sent when work arrives and no worker is
    /// idle. Carries no payload; it only means "check again".
    fn notify(&self) {}

    /// Wake a blocked worker unconditionally (shutdown path).
    fn wake_one(&self) {}

    /// Extra condition that must hold before workers may exit.
    fn can_stop(&self) -> bool {
        true
    }
}

/// Default policy: nothing to block on, so back off briefly.
struct SpinIdle;

impl IdlePolicy for SpinIdle {
    fn idle(&self) {
        thread::sleep(Duration::from_micros(100));
    }
}

struct Shared {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    idle_workers: AtomicUsize,
    active: AtomicUsize,
    stop_requested: AtomicBool,
    policy: OnceCell<Arc<dyn IdlePolicy>>,
}

impl Shared {
    fn policy(&self) -> &Arc<dyn IdlePolicy> {
        self.policy.get_or_init(|| Arc::new(SpinIdle))
    }

    fn should_exit(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active.load(Ordering::Acquire) == 0
            && self.policy().can_stop()
    }
}

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

/// The id of the worker running the current thread, if any.
pub fn current_worker() -> Option<usize> {
    WORKER_ID.with(|w| w.get())
}

/// Cheap cloneable handle for enqueueing work from any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Append a task to the queue. A wakeup is sent only when no worker is
    /// currently idle; an idle worker will notice the task on its own.
    pub fn schedule(&self, task: Task) {
        self.shared.queue.lock().push_back(task);
        if self.shared.idle_workers.load(Ordering::Acquire) == 0 {
            self.shared.policy().notify();
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn has_idle_workers(&self) -> bool {
        self.shared.idle_workers.load(Ordering::Acquire) > 0
    }

    /// Whether the scheduler has been asked to stop and has no work left.
    pub fn stopping(&self) -> bool {
        self.shared.should_exit()
    }
}

/// Dispatches fibers and callbacks across a fixed pool of worker threads.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: usize,
    use_caller: bool,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl Scheduler {
    /// Create a scheduler with `threads` spawned workers (0 = CPU count).
    /// With `use_caller`, the thread calling [`stop`](Self::stop) also
    /// participates as an extra worker (id = `threads`) until shutdown
    /// completes, which keeps a dedicated caller thread busy without
    /// spawning one more OS thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                idle_workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                policy: OnceCell::new(),
            }),
            threads,
            use_caller,
            handles: Vec::new(),
            started: false,
        }
    }

    /// Install the idle policy. Must happen before [`start`](Self::start);
    /// only the first call takes effect.
    pub fn set_idle_policy(&self, policy: Arc<dyn IdlePolicy>) -> bool {
        self.shared.policy.set(policy).is_ok()
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn schedule(&self, task: Task) {
        self.handle().schedule(task);
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Total workers including the caller in use-caller mode.
    pub fn worker_count(&self) -> usize {
        self.threads + usize::from(self.use_caller)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn stopping(&self) -> bool {
        self.shared.should_exit()
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for id in 0..self.threads {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", self.shared.name, id))
                .spawn(move || worker_loop(shared, id))
                .expect("failed to spawn worker thread");
            self.handles.push(handle);
        }
    }

    /// Mark the scheduler stopping, wake every worker, and join them. In
    /// use-caller mode the calling thread first runs the worker loop itself
    /// until the queue drains.
    pub fn stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        let policy = self.shared.policy().clone();
        for _ in 0..self.worker_count() {
            policy.wake_one();
        }
        if self.use_caller && self.started {
            worker_loop(self.shared.clone(), self.threads);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.started = false;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    WORKER_ID.with(|w| w.set(Some(id)));
    let policy = shared.policy().clone();
    policy.on_worker_start();
    log::debug!("{}: worker {} started", shared.name, id);

    let mut cb_fiber: Option<FiberRef> = None;
    loop {
        let (task, saw_foreign) = claim(&shared, id);
        if saw_foreign {
            // A task pinned to another worker is still queued; make sure
            // that worker gets poked to come claim it.
            policy.notify();
        }
        match task {
            Some(task) => {
                shared.active.fetch_add(1, Ordering::AcqRel);
                run_task(&shared, task, &mut cb_fiber);
                shared.active.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if shared.should_exit() {
                    break;
                }
                shared.idle_workers.fetch_add(1, Ordering::AcqRel);
                policy.idle();
                shared.idle_workers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    policy.on_worker_stop();
    WORKER_ID.with(|w| w.set(None));
    log::debug!("{}: worker {} exiting", shared.name, id);
}

/// Claim the first task this worker may run. Also reports whether any task
/// pinned elsewhere was skipped over.
fn claim(shared: &Shared, id: usize) -> (Option<Task>, bool) {
    let mut queue = shared.queue.lock();
    let mut saw_foreign = false;
    let mut found = None;
    for (i, task) in queue.iter().enumerate() {
        match task.affinity {
            Some(worker) if worker != id => saw_foreign = true,
            _ => {
                found = Some(i);
                break;
            }
        }
    }
    (found.and_then(|i| queue.remove(i)), saw_foreign)
}

fn run_task(shared: &Arc<Shared>, task: Task, cb_fiber: &mut Option<FiberRef>) {
    match task.kind {
        TaskKind::Fiber(f) => {
            run_fiber(shared, &f);
        }
        TaskKind::Call(entry) => {
            // Reuse the worker's callback fiber when the previous callback
            // ran to completion; a fiber parked elsewhere gets replaced.
            let f = match cb_fiber.take() {
                Some(f) if f.lock().is_finished() => {
                    if let Err(e) = f.lock().reset_boxed(entry) {
                        log::error!("{}: callback fiber reset failed: {}", shared.name, e);
                        return;
                    }
                    f
                }
                _ => Arc::new(Mutex::new(Fiber::new_boxed(entry, DEFAULT_STACK_SIZE))),
            };
            run_fiber(shared, &f);
            if f.lock().is_finished() {
                *cb_fiber = Some(f);
            }
        }
    }
}

fn run_fiber(shared: &Arc<Shared>, f: &FiberRef) {
    match fiber::resume(f) {
        Ok(FiberState::Ready) => {
            // The fiber asked to be rescheduled promptly.
            SchedulerHandle {
                shared: shared.clone(),
            }
            .schedule(Task::fiber(f.clone()));
        }
        Ok(FiberState::Except) => {
            let guard = f.lock();
            log::error!(
                "{}: fiber {} failed: {}",
                shared.name,
                guard.id().as_u64(),
                guard.panic_message().unwrap_or("unknown panic")
            );
        }
        // Hold: parked until an event or timer reschedules it.
        // Term: ran to completion.
        Ok(_) => {}
        Err(e) => {
            log::error!("{}: cannot resume fiber: {}", shared.name, e);
        }
    }
}

//! Cooperative multitasking runtime built on stackful fibers.
//!
//! The pieces compose bottom-up:
//!
//! - [`fiber`]: stackful coroutines with an explicit resume/yield contract
//!   and a per-thread current-fiber registry.
//! - [`scheduler`]: a worker-thread pool dispatching fibers and callbacks
//!   from a shared FIFO queue, with optional per-task worker affinity and
//!   an injectable idle policy.
//! - [`timer`]: deadline-ordered timers with cancellation, recurrence, and
//!   clock-rollback handling.
//! - [`io`]: an epoll-backed [`IoManager`] that plugs into the scheduler as
//!   its idle policy, so workers block on readiness and timer deadlines
//!   instead of spinning.
//! - [`hook`]: blocking-style read/write/accept/connect/sleep calls that
//!   park the calling fiber on the event loop instead of the thread.
//!
//! ```no_run
//! use fibril::{hook, io::IoManager, Task};
//!
//! let iom = IoManager::new(4, false, "app").unwrap();
//! hook::enable();
//! iom.schedule(Task::call(|| {
//!     // Looks blocking, parks the fiber.
//!     hook::sleep_ms(100);
//! }));
//! ```

pub mod error;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod scheduler;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::{Fiber, FiberId, FiberRef, FiberState, DEFAULT_STACK_SIZE};
pub use io::{EventKind, IoHandle, IoManager};
pub use scheduler::{IdlePolicy, Scheduler, SchedulerHandle, Task};
pub use timer::{TimerHandle, TimerManager};

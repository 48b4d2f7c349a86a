//! Stackful fibers with an explicit resume/yield contract.
//!
//! A fiber owns its stack (provided by the `generator` crate) and is driven
//! by explicit control transfer: `resume` switches into the fiber,
//! `yield_hold`/`yield_ready` switch back out. There is no preemption.
//! Exactly one fiber is executing per thread at any time; the thread-local
//! registry records which one for the duration of each resume.
//!
//! A panic inside a fiber never crosses the stack-switch boundary: it is
//! caught at the entry frame and recorded as a diagnostic, and the fiber
//! lands in the terminal `Except` state.

use crate::error::{Error, Result};
use generator::{Generator, Gn};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default stack size for fibers created without an explicit size.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Execution state of a fiber.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberState {
    /// Created (or reset), never resumed.
    Init,
    /// Yielded, waiting for some external completion to reschedule it.
    Hold,
    /// Currently executing on some thread.
    Exec,
    /// Yielded but immediately runnable again.
    Ready,
    /// Entry function returned. Terminal.
    Term,
    /// Entry function panicked; the diagnostic is retained. Terminal.
    Except,
}

/// Control value carried across the stack switch: the fiber reports why it
/// gave up the thread, and the resumer maps it back to a `FiberState`.
enum Switch {
    Hold,
    Ready,
    Done,
    Panicked(String),
}

/// A stackful, cooperatively-scheduled unit of execution.
pub struct Fiber {
    id: FiberId,
    state: FiberState,
    stack_size: usize,
    gen: Option<Generator<'static, (), Switch>>,
    panic_msg: Option<String>,
}

// A fiber moves between worker threads only while suspended, and is resumed
// exclusively by the single thread holding its lock.
unsafe impl Send for Fiber {}

/// Shared handle to a fiber; the mutex serializes resumption.
pub type FiberRef = Arc<Mutex<Fiber>>;

thread_local! {
    // The id is cached beside the handle: the resuming thread holds the
    // fiber's mutex for the whole body, so the body must be able to ask
    // "who am I" without locking.
    static CURRENT: RefCell<Option<(FiberRef, FiberId)>> = RefCell::new(None);
}

impl Fiber {
    /// Create a fiber in `Init` state with a freshly allocated stack.
    pub fn new(entry: impl FnOnce() + Send + 'static, stack_size: usize) -> Self {
        Self::new_boxed(Box::new(entry), stack_size)
    }

    pub(crate) fn new_boxed(entry: Box<dyn FnOnce() + Send>, stack_size: usize) -> Self {
        Self {
            id: FiberId::next(),
            state: FiberState::Init,
            stack_size,
            gen: Some(Self::make_gen(entry, stack_size)),
            panic_msg: None,
        }
    }

    fn make_gen(
        entry: Box<dyn FnOnce() + Send>,
        stack_size: usize,
    ) -> Generator<'static, (), Switch> {
        Gn::<()>::new_opt(stack_size, move || {
            match panic::catch_unwind(AssertUnwindSafe(entry)) {
                Ok(()) => Switch::Done,
                Err(payload) => {
                    // Drop-cancellation unwinds with the generator crate's own
                    // payload; it must keep propagating to tear the stack down.
                    if payload.is::<generator::Error>() {
                        panic::resume_unwind(payload);
                    }
                    Switch::Panicked(describe_panic(payload.as_ref()))
                }
            }
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// The diagnostic captured when the fiber entered `Except`.
    pub fn panic_message(&self) -> Option<&str> {
        self.panic_msg.as_deref()
    }

    /// Whether `resume` may legally be called.
    pub fn resumable(&self) -> bool {
        matches!(
            self.state,
            FiberState::Init | FiberState::Ready | FiberState::Hold
        )
    }

    /// Whether the fiber has run to completion (normally or by panic).
    pub fn is_finished(&self) -> bool {
        matches!(self.state, FiberState::Term | FiberState::Except)
    }

    /// Replace the entry function, reusing the fiber's identity and
    /// bookkeeping. Allowed while the fiber is not running: `Init`, `Hold`
    /// (abandoning the suspended stack), or finished.
    pub fn reset(&mut self, entry: impl FnOnce() + Send + 'static) -> Result<()> {
        self.reset_boxed(Box::new(entry))
    }

    pub(crate) fn reset_boxed(&mut self, entry: Box<dyn FnOnce() + Send>) -> Result<()> {
        match self.state {
            FiberState::Init | FiberState::Hold | FiberState::Term | FiberState::Except => {}
            state => {
                return Err(Error::NotResumable {
                    id: self.id.as_u64(),
                    state,
                })
            }
        }
        self.gen = Some(Self::make_gen(entry, self.stack_size));
        self.state = FiberState::Init;
        self.panic_msg = None;
        Ok(())
    }

    /// Switch into the fiber until it yields or finishes. Returns the state
    /// the fiber left in. Prefer the module-level [`resume`], which also
    /// maintains the thread's current-fiber registry.
    pub fn resume_raw(&mut self) -> Result<FiberState> {
        if !self.resumable() {
            return Err(Error::NotResumable {
                id: self.id.as_u64(),
                state: self.state,
            });
        }
        self.state = FiberState::Exec;
        let switch = match self.gen.as_mut() {
            Some(gen) => gen.resume(),
            None => None,
        };
        self.state = match switch {
            Some(Switch::Hold) => FiberState::Hold,
            Some(Switch::Ready) => FiberState::Ready,
            Some(Switch::Done) => FiberState::Term,
            Some(Switch::Panicked(msg)) => {
                self.panic_msg = Some(msg);
                FiberState::Except
            }
            None => FiberState::Term,
        };
        if self.is_finished() {
            // Release the stack; no further resume is possible.
            self.gen = None;
        }
        Ok(self.state)
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// Resume `fiber` on the calling thread, registering it as the thread's
/// current fiber for the duration of the switch. The previous registration
/// is restored on return, so a fiber that resumes another fiber keeps the
/// back-reference chain intact.
pub fn resume(fiber: &FiberRef) -> Result<FiberState> {
    let id = fiber.lock().id();
    let prev = CURRENT.with(|c| c.replace(Some((fiber.clone(), id))));
    let result = fiber.lock().resume_raw();
    CURRENT.with(|c| *c.borrow_mut() = prev);
    result
}

/// The fiber currently executing on this thread, if any. A fiber returned
/// here is mid-resume and therefore in `Exec` state; its mutex is held by
/// the resuming thread until the fiber yields, so lock the handle only
/// from other threads.
pub fn current() -> Option<FiberRef> {
    CURRENT.with(|c| c.borrow().as_ref().map(|(f, _)| f.clone()))
}

/// The id of the fiber currently executing on this thread. Reads the id
/// recorded at resume time; safe to call from inside the fiber's own body.
pub fn current_id() -> Option<FiberId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|(_, id)| *id))
}

/// Yield the running fiber, transitioning it to `Hold`. The fiber will not
/// run again until something schedules it. Must be called from inside a
/// fiber; calling it from a plain thread context panics.
pub fn yield_hold() {
    generator::yield_with(Switch::Hold);
}

/// Yield the running fiber, transitioning it to `Ready`: the resumer is
/// expected to reschedule it promptly.
pub fn yield_ready() {
    generator::yield_with(Switch::Ready);
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fiber_ref(entry: impl FnOnce() + Send + 'static) -> FiberRef {
        Arc::new(Mutex::new(Fiber::new(entry, DEFAULT_STACK_SIZE)))
    }

    #[test]
    fn runs_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = fiber_ref(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(f.lock().state(), FiberState::Init);
        let state = resume(&f).unwrap();
        assert_eq!(state, FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_and_resume_round_trips() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let f = fiber_ref(move || {
            s.fetch_add(1, Ordering::SeqCst);
            yield_hold();
            s.fetch_add(1, Ordering::SeqCst);
            yield_ready();
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(resume(&f).unwrap(), FiberState::Hold);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(resume(&f).unwrap(), FiberState::Ready);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(resume(&f).unwrap(), FiberState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn finished_fiber_is_not_resumable() {
        let f = fiber_ref(|| {});
        resume(&f).unwrap();
        let err = resume(&f).unwrap_err();
        assert!(matches!(
            err,
            Error::NotResumable {
                state: FiberState::Term,
                ..
            }
        ));
    }

    #[test]
    fn panic_is_captured_as_except() {
        let f = fiber_ref(|| panic!("boom in fiber"));
        let state = resume(&f).unwrap();
        assert_eq!(state, FiberState::Except);
        let guard = f.lock();
        assert_eq!(guard.panic_message(), Some("boom in fiber"));
    }

    #[test]
    fn reset_reuses_the_fiber() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let a = first.clone();
        let f = fiber_ref(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let id = f.lock().id();
        resume(&f).unwrap();

        let b = second.clone();
        f.lock()
            .reset(move || {
                b.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(f.lock().state(), FiberState::Init);
        assert_eq!(f.lock().id(), id);

        resume(&f).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_is_set_inside_resume() {
        assert!(current().is_none());
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let f = fiber_ref(move || {
            *s.lock() = current_id();
        });
        let id = f.lock().id();
        resume(&f).unwrap();
        assert_eq!(*seen.lock(), Some(id));
        assert!(current().is_none());
    }

    #[test]
    fn nested_resume_tracks_ids_without_locking() {
        // current_id must answer from inside a running body, including
        // across a nested resume, while the resumer holds the fiber lock.
        let ids = Arc::new(Mutex::new(Vec::new()));

        let inner_ids = ids.clone();
        let inner = fiber_ref(move || {
            inner_ids.lock().push(current_id());
        });
        let inner_id = inner.lock().id();

        let outer_ids = ids.clone();
        let inner_for_outer = inner.clone();
        let outer = fiber_ref(move || {
            outer_ids.lock().push(current_id());
            resume(&inner_for_outer).unwrap();
            // The outer registration is restored after the nested resume.
            outer_ids.lock().push(current_id());
        });
        let outer_id = outer.lock().id();

        resume(&outer).unwrap();
        assert_eq!(
            *ids.lock(),
            vec![Some(outer_id), Some(inner_id), Some(outer_id)]
        );
        assert!(current_id().is_none());
    }

    #[test]
    fn hold_fiber_can_be_reset() {
        let f = fiber_ref(|| {
            yield_hold();
            unreachable!("abandoned after reset");
        });
        assert_eq!(resume(&f).unwrap(), FiberState::Hold);
        f.lock().reset(|| {}).unwrap();
        assert_eq!(resume(&f).unwrap(), FiberState::Term);
    }
}

//! Epoll-backed event loop layered on the worker-pool scheduler.
//!
//! The [`IoManager`] owns a scheduler, an epoll instance, a self-pipe for
//! cross-thread wakeup, a growable per-descriptor context table, and the
//! timer set. It installs an [`IdlePolicy`] that blocks in `epoll_wait`
//! for at most min(next timer deadline, 500 ms), so timer delivery needs
//! no dedicated thread.
//!
//! All registrations are edge-triggered. Each descriptor context carries
//! one continuation slot per event kind: a fiber or a callback (never
//! both), plus the scheduler that will receive it when the event fires,
//! is cancelled, or times out.

use crate::error::{Error, Result};
use crate::fiber::{self, FiberRef};
use crate::scheduler::{IdlePolicy, Scheduler, SchedulerHandle, Task};
use crate::timer::{TimerHandle, TimerManager};
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::io as stdio;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Upper bound on a single idle wait, so stop requests and stale timer
/// budgets are observed promptly.
const MAX_IDLE_TIMEOUT_MS: u64 = 500;
/// Events collected per `epoll_wait` call.
const EVENT_BATCH: usize = 64;
/// Initial size of the fd context table.
const INITIAL_CONTEXTS: usize = 64;

/// Readiness kinds a continuation can wait on. Values match `EPOLLIN` and
/// `EPOLLOUT` so interest masks translate directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    Read = 0x1,
    Write = 0x4,
}

impl EventKind {
    fn bit(self) -> u32 {
        self as u32
    }
}

type BoxedCall = Box<dyn FnOnce() + Send>;

/// Continuation for one event kind: the scheduler that will receive it
/// plus either a bound fiber or a bound callback.
#[derive(Default)]
struct EventSlot {
    sched: Option<SchedulerHandle>,
    fiber: Option<FiberRef>,
    call: Option<BoxedCall>,
}

impl EventSlot {
    fn is_empty(&self) -> bool {
        self.sched.is_none() && self.fiber.is_none() && self.call.is_none()
    }

    fn reset(&mut self) {
        self.sched = None;
        self.fiber = None;
        self.call = None;
    }

    /// Hand the continuation to its scheduler and clear the slot.
    fn fire(&mut self) {
        if let Some(sched) = self.sched.take() {
            if let Some(call) = self.call.take() {
                sched.schedule(Task::call_boxed(call));
            } else if let Some(f) = self.fiber.take() {
                sched.schedule(Task::fiber(f));
            }
        }
        self.reset();
    }
}

struct FdEvents {
    /// Union of kinds currently registered with epoll for this fd.
    armed: u32,
    read: EventSlot,
    write: EventSlot,
}

impl FdEvents {
    fn slot_mut(&mut self, kind: EventKind) -> &mut EventSlot {
        match kind {
            EventKind::Read => &mut self.read,
            EventKind::Write => &mut self.write,
        }
    }
}

/// Per-descriptor state. Slots are never freed, only reset and reused;
/// the table grows append-only so issued indices stay valid.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdEvents {
                armed: 0,
                read: EventSlot::default(),
                write: EventSlot::default(),
            }),
        }
    }
}

struct IoInner {
    epfd: RawFd,
    tickle_rd: RawFd,
    tickle_wr: RawFd,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Armed event kinds not yet delivered, across all descriptors.
    pending: AtomicUsize,
    timers: TimerManager,
    sched: SchedulerHandle,
    /// Wakeup-pipe writes performed by `tickle` (observable in tests).
    tickle_writes: AtomicU64,
}

// Raw fds are plain integers; the contexts table has its own locking.
unsafe impl Send for IoInner {}
unsafe impl Sync for IoInner {}

thread_local! {
    static CURRENT_IO: RefCell<Option<IoHandle>> = RefCell::new(None);
}

/// The event loop driving the current thread, if this thread is one of an
/// [`IoManager`]'s workers.
pub fn current() -> Option<IoHandle> {
    CURRENT_IO.with(|c| c.borrow().clone())
}

const fn epollet() -> u32 {
    libc::EPOLLET as u32
}

impl IoInner {
    /// Context for `fd`, growing the table if the descriptor is new.
    /// Growth is append-only (×1.5) under the exclusive lock and never
    /// invalidates previously issued contexts.
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.contexts.read();
            if idx < table.len() {
                return table[idx].clone();
            }
        }
        let mut table = self.contexts.write();
        // Re-check: another thread may have grown the table while we
        // waited for the write lock.
        if idx >= table.len() {
            let new_len = ((idx + 1) * 3 / 2).max(INITIAL_CONTEXTS);
            while table.len() < new_len {
                let slot_fd = table.len() as RawFd;
                table.push(Arc::new(FdContext::new(slot_fd)));
            }
        }
        table[idx].clone()
    }

    /// Context for `fd` only if the table already covers it.
    fn existing_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.contexts.read();
        table.get(fd as usize).cloned()
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            let err = stdio::Error::last_os_error();
            log::error!(
                "epoll_ctl(epfd={}, op={}, fd={}, events={:#x}) failed: {}",
                self.epfd,
                op,
                fd,
                events,
                err
            );
            return Err(Error::Epoll(err));
        }
        Ok(())
    }

    /// Arm `kind` for `fd`. The continuation is `cb` if supplied, else the
    /// fiber currently executing on this thread. On failure nothing is
    /// mutated.
    fn add_event(&self, fd: RawFd, kind: EventKind, cb: Option<BoxedCall>) -> Result<()> {
        let ctx = self.context(fd);
        let mut ev = ctx.inner.lock();
        if ev.armed & kind.bit() != 0 {
            log::error!(
                "duplicate event registration: fd={} kind={:?} armed={:#x}",
                fd,
                kind,
                ev.armed
            );
            return Err(Error::EventAlreadyArmed { fd, kind });
        }

        // Resolve the continuation before touching epoll so a missing
        // fiber context cannot leave a dangling registration behind.
        let bound_fiber = match &cb {
            Some(_) => None,
            None => Some(fiber::current().ok_or(Error::NoFiberContext)?),
        };

        let op = if ev.armed != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.epoll_ctl(op, fd, epollet() | ev.armed | kind.bit())?;

        self.pending.fetch_add(1, Ordering::Release);
        ev.armed |= kind.bit();
        let slot = ev.slot_mut(kind);
        debug_assert!(slot.is_empty());
        slot.sched = Some(self.sched.clone());
        slot.call = cb;
        slot.fiber = bound_fiber;
        Ok(())
    }

    /// Disarm `kind` for `fd` without firing its continuation. Returns
    /// false when the kind was not armed or the descriptor is unknown.
    fn del_event(&self, fd: RawFd, kind: EventKind) -> bool {
        let Some(ctx) = self.existing_context(fd) else {
            return false;
        };
        let mut ev = ctx.inner.lock();
        if ev.armed & kind.bit() == 0 {
            return false;
        }
        let remaining = ev.armed & !kind.bit();
        let op = if remaining != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if self.epoll_ctl(op, fd, epollet() | remaining).is_err() {
            return false;
        }
        ev.armed = remaining;
        ev.slot_mut(kind).reset();
        self.pending.fetch_sub(1, Ordering::Release);
        true
    }

    /// Disarm `kind` for `fd` and fire its continuation immediately, so a
    /// waiter observes a cancelled completion rather than hanging.
    fn cancel_event(&self, fd: RawFd, kind: EventKind) -> bool {
        let Some(ctx) = self.existing_context(fd) else {
            return false;
        };
        let mut ev = ctx.inner.lock();
        if ev.armed & kind.bit() == 0 {
            return false;
        }
        let remaining = ev.armed & !kind.bit();
        let op = if remaining != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if self.epoll_ctl(op, fd, epollet() | remaining).is_err() {
            return false;
        }
        ev.armed = remaining;
        ev.slot_mut(kind).fire();
        self.pending.fetch_sub(1, Ordering::Release);
        true
    }

    /// Deregister `fd` entirely and fire every armed continuation.
    fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.existing_context(fd) else {
            return false;
        };
        let mut ev = ctx.inner.lock();
        if ev.armed == 0 {
            return false;
        }
        if self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0).is_err() {
            return false;
        }
        log::trace!("cancel_all fd={} armed={:#x}", ctx.fd, ev.armed);
        for kind in [EventKind::Read, EventKind::Write] {
            if ev.armed & kind.bit() != 0 {
                ev.slot_mut(kind).fire();
                self.pending.fetch_sub(1, Ordering::Release);
            }
        }
        ev.armed = 0;
        true
    }

    /// Unconditional wakeup-pipe write (shutdown and timer-front paths).
    fn wake(&self) {
        let byte = b'T';
        let ret = unsafe { libc::write(self.tickle_wr, &byte as *const u8 as *const libc::c_void, 1) };
        if ret != 1 {
            // Pipe full means a wakeup is already pending; anything else
            // is only worth a trace since the 500 ms ceiling bounds it.
            log::trace!("tickle pipe write returned {}", ret);
        }
    }

    /// Cross-thread wakeup, skipped when a worker is already idle (it will
    /// notice new work within its bounded wait on its own).
    fn tickle(&self) {
        if self.sched.has_idle_workers() {
            return;
        }
        self.tickle_writes.fetch_add(1, Ordering::Relaxed);
        self.wake();
    }

    fn drain_tickle(&self) {
        // Edge-triggered: a partial drain would suppress future wakeups.
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_rd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// One idle iteration: wait for readiness or the next deadline, run
    /// expired timers through the scheduler, dispatch ready descriptors,
    /// then return to the worker's own claim loop.
    fn poll_once(&self) {
        let budget = self
            .timers
            .next_timeout()
            .map_or(MAX_IDLE_TIMEOUT_MS, |t| t.min(MAX_IDLE_TIMEOUT_MS));

        let mut events: [libc::epoll_event; EVENT_BATCH] = unsafe { std::mem::zeroed() };
        let ready = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    EVENT_BATCH as libc::c_int,
                    budget as libc::c_int,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = stdio::Error::last_os_error();
            if err.kind() != stdio::ErrorKind::Interrupted {
                log::error!("epoll_wait failed: {}", err);
                return;
            }
        };

        // Expired timers run as ordinary tasks, outside the timer lock.
        for cb in self.timers.list_expired() {
            self.sched.schedule(Task::call(move || cb()));
        }

        for ev in &events[..ready] {
            let revents = ev.events;
            let fd = ev.u64 as RawFd;
            if fd == self.tickle_rd {
                self.drain_tickle();
                continue;
            }
            self.dispatch_ready(fd, revents);
        }
    }

    fn dispatch_ready(&self, fd: RawFd, mut revents: u32) {
        let Some(ctx) = self.existing_context(fd) else {
            return;
        };
        let mut ev = ctx.inner.lock();

        // An error or hangup must wake both directions, or a fiber waiting
        // on the other kind would hang forever.
        if revents & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            revents |= libc::EPOLLIN as u32 | libc::EPOLLOUT as u32;
        }
        let mut fired = 0u32;
        if revents & libc::EPOLLIN as u32 != 0 {
            fired |= EventKind::Read.bit();
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            fired |= EventKind::Write.bit();
        }
        fired &= ev.armed;
        if fired == 0 {
            // Stale notification for a kind already cancelled or delivered.
            return;
        }

        let remaining = ev.armed & !fired;
        let op = if remaining != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if self.epoll_ctl(op, fd, epollet() | remaining).is_err() {
            return;
        }
        ev.armed = remaining;
        for kind in [EventKind::Read, EventKind::Write] {
            if fired & kind.bit() != 0 {
                ev.slot_mut(kind).fire();
                self.pending.fetch_sub(1, Ordering::Release);
            }
        }
    }

    fn armed(&self, fd: RawFd) -> u32 {
        self.existing_context(fd)
            .map_or(0, |ctx| ctx.inner.lock().armed)
    }
}

/// Idle policy installed into the scheduler: block on readiness and
/// expired timers instead of spinning.
struct IoIdle {
    inner: Weak<IoInner>,
}

impl IdlePolicy for IoIdle {
    fn on_worker_start(&self) {
        CURRENT_IO.with(|c| {
            *c.borrow_mut() = Some(IoHandle {
                inner: self.inner.clone(),
            })
        });
    }

    fn on_worker_stop(&self) {
        CURRENT_IO.with(|c| c.borrow_mut().take());
    }

    fn idle(&self) {
        match self.inner.upgrade() {
            Some(inner) => inner.poll_once(),
            None => thread::sleep(Duration::from_millis(1)),
        }
    }

    fn notify(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.tickle();
        }
    }

    fn wake_one(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.wake();
        }
    }

    fn can_stop(&self) -> bool {
        self.inner.upgrade().map_or(true, |inner| {
            !inner.timers.has_pending() && inner.pending.load(Ordering::Acquire) == 0
        })
    }
}

/// Cheap cloneable handle to a running event loop, used by hooked I/O and
/// timer callbacks. Operations fail with [`Error::NoEventLoop`] once the
/// manager has shut down.
#[derive(Clone)]
pub struct IoHandle {
    inner: Weak<IoInner>,
}

impl IoHandle {
    fn inner(&self) -> Result<Arc<IoInner>> {
        self.inner.upgrade().ok_or(Error::NoEventLoop)
    }

    pub fn schedule(&self, task: Task) -> Result<()> {
        self.inner()?.sched.schedule(task);
        Ok(())
    }

    pub fn add_event(
        &self,
        fd: RawFd,
        kind: EventKind,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        self.inner()?.add_event(fd, kind, cb)
    }

    pub fn del_event(&self, fd: RawFd, kind: EventKind) -> bool {
        self.inner.upgrade().map_or(false, |i| i.del_event(fd, kind))
    }

    pub fn cancel_event(&self, fd: RawFd, kind: EventKind) -> bool {
        self.inner
            .upgrade()
            .map_or(false, |i| i.cancel_event(fd, kind))
    }

    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.inner.upgrade().map_or(false, |i| i.cancel_all(fd))
    }

    pub fn add_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Result<TimerHandle> {
        Ok(self.inner()?.timers.add_timer(delay_ms, cb, recurring))
    }

    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        condition: std::sync::Weak<()>,
        recurring: bool,
    ) -> Result<TimerHandle> {
        Ok(self
            .inner()?
            .timers
            .add_condition_timer(delay_ms, cb, condition, recurring))
    }

    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.inner.upgrade().map_or(false, |i| i.timers.cancel(handle))
    }
}

/// Scheduler specialization that owns a readiness multiplexer, a
/// per-descriptor event table, and a self-pipe for cross-thread wakeup.
pub struct IoManager {
    scheduler: Scheduler,
    inner: Arc<IoInner>,
}

impl IoManager {
    /// Create the epoll instance and wakeup pipe, install the event-loop
    /// idle policy, and start the workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Epoll(stdio::Error::last_os_error()));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret != 0 {
            let err = stdio::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(Error::Pipe(err));
        }
        let [tickle_rd, tickle_wr] = pipe_fds;

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32 | epollet(),
            u64: tickle_rd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_rd, &mut ev) } != 0 {
            let err = stdio::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(tickle_rd);
                libc::close(tickle_wr);
            }
            return Err(Error::Epoll(err));
        }

        let mut scheduler = Scheduler::new(threads, use_caller, name);
        let inner = Arc::new(IoInner {
            epfd,
            tickle_rd,
            tickle_wr,
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            timers: TimerManager::new(),
            sched: scheduler.handle(),
            tickle_writes: AtomicU64::new(0),
        });
        {
            let mut table = inner.contexts.write();
            for fd in 0..INITIAL_CONTEXTS {
                table.push(Arc::new(FdContext::new(fd as RawFd)));
            }
        }

        // A new earliest deadline must shorten a wait already in flight.
        let weak = Arc::downgrade(&inner);
        inner.timers.set_front_notifier(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.wake();
            }
        }));

        scheduler.set_idle_policy(Arc::new(IoIdle {
            inner: Arc::downgrade(&inner),
        }));
        scheduler.start();

        Ok(Self { scheduler, inner })
    }

    /// Handle usable from any thread, including timer and event callbacks.
    pub fn handle(&self) -> IoHandle {
        IoHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn schedule(&self, task: Task) {
        self.inner.sched.schedule(task);
    }

    /// See [`IoHandle::add_event`]: arm `kind` for `fd`, binding `cb` or
    /// the calling fiber as the continuation.
    pub fn add_event(
        &self,
        fd: RawFd,
        kind: EventKind,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        self.inner.add_event(fd, kind, cb)
    }

    pub fn del_event(&self, fd: RawFd, kind: EventKind) -> bool {
        self.inner.del_event(fd, kind)
    }

    pub fn cancel_event(&self, fd: RawFd, kind: EventKind) -> bool {
        self.inner.cancel_event(fd, kind)
    }

    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.inner.cancel_all(fd)
    }

    pub fn add_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> TimerHandle {
        self.inner.timers.add_timer(delay_ms, cb, recurring)
    }

    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        condition: std::sync::Weak<()>,
        recurring: bool,
    ) -> TimerHandle {
        self.inner
            .timers
            .add_condition_timer(delay_ms, cb, condition, recurring)
    }

    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.inner.timers.cancel(handle)
    }

    pub fn next_timer(&self) -> Option<u64> {
        self.inner.timers.next_timeout()
    }

    /// Cross-thread wakeup; a no-op while some worker is already idle.
    pub fn tickle(&self) {
        self.inner.tickle();
    }

    /// Wakeup-pipe writes performed by [`tickle`](Self::tickle).
    pub fn tickle_writes(&self) -> u64 {
        self.inner.tickle_writes.load(Ordering::Relaxed)
    }

    /// Armed event kinds not yet delivered.
    pub fn pending_events(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Currently armed kind mask for `fd` (diagnostic).
    pub fn armed(&self, fd: RawFd) -> u32 {
        self.inner.armed(fd)
    }

    pub fn has_idle_workers(&self) -> bool {
        self.inner.sched.has_idle_workers()
    }

    /// Stopping requires the scheduler's base condition plus no pending
    /// timers and zero undelivered events.
    pub fn stopping(&self) -> bool {
        self.scheduler.stopping()
    }

    /// Stop the scheduler and join every worker. Pending timers and
    /// undelivered events keep the workers alive until they drain.
    pub fn stop(&mut self) {
        self.scheduler.stop();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.inner.contexts.write().clear();
        unsafe {
            libc::close(self.inner.epfd);
            libc::close(self.inner.tickle_rd);
            libc::close(self.inner.tickle_wr);
        }
    }
}

//! Blocking-style I/O facade over the event loop.
//!
//! These functions look like plain blocking syscalls but, when called from a
//! fiber running on an [`IoManager`](crate::io::IoManager) worker with the
//! facade enabled, they put the descriptor in non-blocking mode and park the
//! fiber until readiness instead of blocking the thread. Outside that
//! context (facade disabled, plain thread, or a descriptor the caller marked
//! non-blocking) they fall back to the ordinary blocking behavior with EINTR
//! retry.
//!
//! Per-descriptor timeouts are kept in a process-wide registry. A timed-out
//! wait completes with [`Error::TimedOut`]; the armed event is cancelled so
//! nothing stays registered for a fiber that has already given up.

use crate::error::{Error, Result};
use crate::fiber;
use crate::io::{self, EventKind, IoHandle};
use crate::scheduler::Task;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::io as stdio;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static HOOK_ENABLED: AtomicBool = AtomicBool::new(false);

static FD_FLAGS: Lazy<DashMap<RawFd, FdFlags>> = Lazy::new(DashMap::new);

#[derive(Debug, Default, Clone, Copy)]
struct FdFlags {
    /// The caller manages O_NONBLOCK itself; the facade passes through.
    user_nonblocking: bool,
    /// O_NONBLOCK already applied by the facade; skips repeat fcntl calls.
    sys_nonblocking: bool,
    recv_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

/// Route facade calls through the event loop where possible.
pub fn enable() {
    HOOK_ENABLED.store(true, Ordering::SeqCst);
}

/// Make every facade call use the blocking fallback.
pub fn disable() {
    HOOK_ENABLED.store(false, Ordering::SeqCst);
}

pub fn is_enabled() -> bool {
    HOOK_ENABLED.load(Ordering::SeqCst)
}

/// Mark `fd` as caller-managed non-blocking: facade calls pass `EAGAIN`
/// straight back instead of parking the fiber.
pub fn set_nonblocking(fd: RawFd, on: bool) {
    FD_FLAGS.entry(fd).or_default().user_nonblocking = on;
}

pub fn is_user_nonblocking(fd: RawFd) -> bool {
    FD_FLAGS.get(&fd).map_or(false, |f| f.user_nonblocking)
}

pub fn set_recv_timeout(fd: RawFd, timeout_ms: Option<u64>) {
    FD_FLAGS.entry(fd).or_default().recv_timeout_ms = timeout_ms;
}

pub fn set_send_timeout(fd: RawFd, timeout_ms: Option<u64>) {
    FD_FLAGS.entry(fd).or_default().send_timeout_ms = timeout_ms;
}

pub fn set_connect_timeout(fd: RawFd, timeout_ms: Option<u64>) {
    FD_FLAGS.entry(fd).or_default().connect_timeout_ms = timeout_ms;
}

/// Drop all recorded state for `fd`. Call when the descriptor is closed;
/// descriptor numbers are reused by the OS.
pub fn forget(fd: RawFd) {
    FD_FLAGS.remove(&fd);
}

pub fn recv_timeout(fd: RawFd) -> Option<u64> {
    FD_FLAGS.get(&fd).and_then(|f| f.recv_timeout_ms)
}

pub fn send_timeout(fd: RawFd) -> Option<u64> {
    FD_FLAGS.get(&fd).and_then(|f| f.send_timeout_ms)
}

pub fn connect_timeout(fd: RawFd) -> Option<u64> {
    FD_FLAGS.get(&fd).and_then(|f| f.connect_timeout_ms)
}

/// The event loop to park on, when this call site qualifies for hooking.
fn hook_context(fd: RawFd) -> Option<IoHandle> {
    if !is_enabled() || is_user_nonblocking(fd) || fiber::current().is_none() {
        return None;
    }
    io::current()
}

fn ensure_nonblocking(fd: RawFd) -> Result<()> {
    if FD_FLAGS.get(&fd).map_or(false, |f| f.sys_nonblocking) {
        return Ok(());
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(stdio::Error::last_os_error().into());
    }
    if flags & libc::O_NONBLOCK == 0 {
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0 {
            return Err(stdio::Error::last_os_error().into());
        }
    }
    FD_FLAGS.entry(fd).or_default().sys_nonblocking = true;
    Ok(())
}

/// Park the calling fiber until `kind` fires on `fd`, or until `timeout_ms`
/// elapses. Returns whether the wait timed out. Whoever retracts the
/// registration first owns the outcome: the timer claims it with
/// `del_event` and only reports a timeout when the claim succeeded, so a
/// wait that readiness already completed is never relabelled. The timer is
/// also bound to a liveness token owned by this frame, so a late firing
/// after the fiber has moved on is skipped.
fn wait_event(io: &IoHandle, fd: RawFd, kind: EventKind, timeout_ms: Option<u64>) -> Result<bool> {
    let timer = match timeout_ms {
        Some(ms) => {
            let parked = fiber::current().ok_or(Error::NoFiberContext)?;
            let expired = Arc::new(AtomicBool::new(false));
            let waiting = Arc::new(());
            let flag = expired.clone();
            let loop_handle = io.clone();
            let handle = io.add_condition_timer(
                ms,
                move || {
                    // Claim the registration without firing it. A failed
                    // claim means readiness won; leave its outcome alone.
                    if loop_handle.del_event(fd, kind) {
                        flag.store(true, Ordering::SeqCst);
                        let _ = loop_handle.schedule(Task::fiber(parked.clone()));
                    }
                },
                Arc::downgrade(&waiting),
                false,
            )?;
            Some((handle, expired, waiting))
        }
        None => None,
    };

    if let Err(err) = io.add_event(fd, kind, None) {
        if let Some((handle, _, _)) = &timer {
            io.cancel_timer(*handle);
        }
        return Err(err);
    }
    fiber::yield_hold();

    match timer {
        Some((handle, expired, _waiting)) => {
            io.cancel_timer(handle);
            Ok(expired.load(Ordering::SeqCst))
        }
        None => Ok(false),
    }
}

/// Run `op` until it produces a result: retry on `EINTR`, park on the event
/// loop on `EAGAIN` when hooked, and otherwise surface the error. Unhooked
/// callers with a blocking descriptor simply block inside `op`.
fn do_io(
    fd: RawFd,
    kind: EventKind,
    timeout_ms: Option<u64>,
    mut op: impl FnMut() -> libc::ssize_t,
) -> Result<usize> {
    let hooked = hook_context(fd);
    if hooked.is_some() {
        ensure_nonblocking(fd)?;
    }
    loop {
        let ret = op();
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = stdio::Error::last_os_error();
        match err.kind() {
            stdio::ErrorKind::Interrupted => continue,
            stdio::ErrorKind::WouldBlock => match &hooked {
                Some(io) => {
                    if wait_event(io, fd, kind, timeout_ms)? {
                        return Err(Error::TimedOut);
                    }
                    // Woken by readiness (or a stale cancellation); retry.
                }
                None => return Err(err.into()),
            },
            _ => return Err(err.into()),
        }
    }
}

/// Read from `fd`, parking the calling fiber instead of blocking the
/// thread. Honors the descriptor's receive timeout.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    do_io(fd, EventKind::Read, recv_timeout(fd), || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// Write to `fd`. Honors the descriptor's send timeout. A short write is
/// returned as-is, matching the syscall.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    do_io(fd, EventKind::Write, send_timeout(fd), || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// Accept a connection on listener `fd`. The accepted descriptor is
/// returned still in whatever blocking mode the OS gave it.
pub fn accept(fd: RawFd) -> Result<RawFd> {
    let accepted = do_io(fd, EventKind::Read, recv_timeout(fd), || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as libc::ssize_t
    })?;
    Ok(accepted as RawFd)
}

/// Connect `fd` to `addr`. Hooked callers park on writability after
/// `EINPROGRESS` and then check `SO_ERROR`; the connect timeout applies to
/// that wait.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let sa = &storage as *const libc::sockaddr_storage as *const libc::sockaddr;

    let Some(io) = hook_context(fd) else {
        let ret = unsafe { libc::connect(fd, sa, len) };
        if ret == 0 {
            return Ok(());
        }
        return Err(stdio::Error::last_os_error().into());
    };

    ensure_nonblocking(fd)?;
    let ret = unsafe { libc::connect(fd, sa, len) };
    if ret == 0 {
        return Ok(());
    }
    let err = stdio::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err.into());
    }

    if wait_event(&io, fd, EventKind::Write, connect_timeout(fd))? {
        return Err(Error::TimedOut);
    }

    let mut so_error: libc::c_int = 0;
    let mut so_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut so_len,
        )
    };
    if ret != 0 {
        return Err(stdio::Error::last_os_error().into());
    }
    if so_error != 0 {
        return Err(stdio::Error::from_raw_os_error(so_error).into());
    }
    Ok(())
}

/// Sleep without blocking the worker thread: hooked callers park on a timer
/// and yield the thread to other tasks.
pub fn sleep_ms(ms: u64) {
    if is_enabled() {
        if let (Some(io), Some(f)) = (io::current(), fiber::current()) {
            let loop_handle = io.clone();
            let armed = io.add_timer(
                ms,
                move || {
                    let _ = loop_handle.schedule(Task::fiber(f.clone()));
                },
                false,
            );
            if armed.is_ok() {
                fiber::yield_hold();
                return;
            }
        }
    }
    thread::sleep(Duration::from_millis(ms));
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    // Octets are already network order; keep the byte layout.
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

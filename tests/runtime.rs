//! End-to-end runtime tests over sockets and the public API.

use fibril::io::current as current_io;
use fibril::{hook, Error, EventKind, IoManager, Scheduler, Task};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(deadline_ms) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn a_thousand_callbacks_across_four_workers_and_caller() {
    init_logging();
    let mut sched = Scheduler::new(4, true, "load");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..1_000 {
        let hits = hits.clone();
        sched.schedule(Task::call(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // stop() drafts the caller as the fifth worker and drains the queue;
    // afterward every callback has run exactly once and nothing is left.
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1_000);
    assert!(sched.stopping());
}

#[test]
fn use_caller_manager_drains_queue_on_stop() {
    init_logging();
    let mut iom = IoManager::new(1, true, "caller-io").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..1_000 {
        let hits = hits.clone();
        iom.schedule(Task::call(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }

    iom.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1_000);
}

#[test]
fn hooked_echo_over_a_unix_stream() {
    init_logging();
    hook::enable();
    let iom = IoManager::new(2, false, "echo").unwrap();
    let (near, far) = UnixStream::pair().unwrap();
    let fd = far.as_raw_fd();

    // The fiber echoes one message back through the same descriptor using
    // the blocking-style facade.
    iom.schedule(Task::call(move || {
        let mut buf = [0u8; 64];
        let n = hook::read(fd, &mut buf).unwrap();
        hook::write(fd, &buf[..n]).unwrap();
        // Keep the stream alive until the echo is written.
        drop(far);
    }));

    let mut near = near;
    near.write_all(b"ping").unwrap();
    near.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut reply = [0u8; 4];
    near.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");
    hook::forget(fd);
}

#[test]
fn socket_receive_timeout_reports_timed_out() {
    init_logging();
    hook::enable();
    let iom = IoManager::new(2, false, "sock-timeout").unwrap();
    let (near, far) = UnixStream::pair().unwrap();
    let fd = far.as_raw_fd();
    hook::set_recv_timeout(fd, Some(50));

    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    iom.schedule(Task::call(move || {
        let mut buf = [0u8; 8];
        *o.lock() = Some(hook::read(fd, &mut buf));
        drop(far);
    }));

    assert!(wait_until(2_000, || outcome.lock().is_some()));
    let guard = outcome.lock();
    assert!(matches!(guard.as_ref().unwrap(), Err(Error::TimedOut)));
    drop(guard);
    assert_eq!(iom.pending_events(), 0);

    hook::forget(fd);
    drop(near);
}

#[test]
fn timer_driven_write_completes_a_parked_read() {
    init_logging();
    hook::enable();
    let iom = IoManager::new(2, false, "timer-io").unwrap();
    let (near, far) = UnixStream::pair().unwrap();
    let fd = far.as_raw_fd();

    let got = Arc::new(Mutex::new(None));
    let g = got.clone();
    iom.schedule(Task::call(move || {
        let mut buf = [0u8; 8];
        let n = hook::read(fd, &mut buf).unwrap();
        *g.lock() = Some(buf[..n].to_vec());
        drop(far);
    }));

    // The data source is a timer firing after the fiber has parked.
    let sender = near.try_clone().unwrap();
    iom.add_timer(
        50,
        move || {
            let _ = (&sender).write_all(b"late");
        },
        false,
    );

    assert!(wait_until(2_000, || got.lock().is_some()));
    assert_eq!(got.lock().as_deref(), Some(&b"late"[..]));
    hook::forget(fd);
    drop(near);
}

#[test]
fn cancel_all_wakes_waiters_of_both_kinds() {
    init_logging();
    let iom = IoManager::new(2, false, "cancel-all").unwrap();
    let (near, far) = UnixStream::pair().unwrap();
    let fd = far.as_raw_fd();

    // Fill the send buffer so the descriptor is neither readable nor
    // writable; both waiters genuinely park.
    far.set_nonblocking(true).unwrap();
    let chunk = [0u8; 65_536];
    loop {
        match (&far).write(&chunk) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("filling socket buffer: {}", e),
        }
    }

    let woken = Arc::new(AtomicUsize::new(0));
    for kind in [EventKind::Read, EventKind::Write] {
        let woken = woken.clone();
        iom.schedule(Task::call(move || {
            let io = current_io().expect("worker thread has an event loop");
            io.add_event(fd, kind, None).unwrap();
            fibril::fiber::yield_hold();
            woken.fetch_add(1, Ordering::SeqCst);
        }));
    }

    assert!(wait_until(2_000, || iom.pending_events() == 2));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    // Deregistering the descriptor must deliver every armed continuation,
    // read and write alike.
    assert!(iom.cancel_all(fd));
    assert!(wait_until(2_000, || woken.load(Ordering::SeqCst) == 2));
    assert_eq!(iom.pending_events(), 0);

    drop(far);
    drop(near);
}

#[test]
fn double_arming_is_reported_not_fatal() {
    init_logging();
    let iom = IoManager::new(1, false, "double-arm").unwrap();
    let (near, far) = UnixStream::pair().unwrap();
    let fd = far.as_raw_fd();

    iom.add_event(fd, EventKind::Read, Some(Box::new(|| {}))).unwrap();
    let err = iom
        .add_event(fd, EventKind::Read, Some(Box::new(|| {})))
        .unwrap_err();
    assert!(err.is_invariant_violation());
    assert!(matches!(err, Error::EventAlreadyArmed { .. }));

    // The runtime keeps working after the report.
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    iom.schedule(Task::call(move || r.store(true, Ordering::SeqCst)));
    assert!(wait_until(2_000, || ran.load(Ordering::SeqCst)));

    assert!(iom.cancel_event(fd, EventKind::Read));
    assert!(wait_until(2_000, || iom.pending_events() == 0));
    drop(far);
    drop(near);
}

#[test]
fn sleeping_fibers_share_one_worker() {
    init_logging();
    hook::enable();
    let iom = IoManager::new(1, false, "shared-sleep").unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _ in 0..4 {
        let done = done.clone();
        iom.schedule(Task::call(move || {
            hook::sleep_ms(100);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Four 100 ms sleeps on one worker finish together, not serially.
    assert!(wait_until(3_000, || done.load(Ordering::SeqCst) == 4));
    assert!(start.elapsed() < Duration::from_millis(350));
}

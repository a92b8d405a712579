use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    io,
    os::fd::RawFd,
    rc::{Rc, Weak},
    sync::{Arc, Mutex, mpsc},
    thread::{self, ThreadId},
    time::Duration,
};

use mio::{Events, Interest, Poll, Registry, Token, Waker, unix::SourceFd};
use tracing::{debug, warn};

use crate::{
    executor::{Executor, Task, TimedExecutor, TimedTask},
    sys,
    watcher::Watcher,
};

const WAKE_TOKEN: Token = Token(usize::MAX);
const MAX_EVENTS: usize = 256;
const MAX_TASKS_PER_TICK: usize = 256;

/// A task posted from the loop thread itself. Unlike [`Task`] it does not
/// have to be `Send`.
pub type LocalTask = Box<dyn FnOnce() + 'static>;

/// Loop-thread variant of [`TimedTask`].
pub type LocalTimedTask = Box<dyn FnMut() -> Duration + 'static>;

/// Dispatch phase the loop is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Callback,
    Task,
    TimedTask,
}

/// Cross-thread face of the loop: the waker, the task queue and the owning
/// thread id. Everything else lives in [`LoopLocal`] behind the thread-local
/// current-loop pointer.
struct LoopShared {
    registry: Registry,
    waker: Waker,
    tasks: Mutex<VecDeque<Task>>,
    thread: ThreadId,
}

pub(crate) struct LoopLocal {
    shared: Arc<LoopShared>,
    state: Cell<LoopState>,
    local_tasks: RefCell<VecDeque<LocalTask>>,
    watchers: RefCell<HashMap<RawFd, Weak<Watcher>>>,
    timed_tasks: RefCell<HashMap<RawFd, LocalTimedTask>>,
}

impl LoopLocal {
    pub(crate) fn state(&self) -> LoopState {
        self.state.get()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn add_watcher(&self, fd: RawFd, watcher: Weak<Watcher>) {
        let previous = self.watchers.borrow_mut().insert(fd, watcher);
        assert!(previous.is_none(), "fd {fd} is already watched");
    }

    pub(crate) fn remove_watcher(&self, fd: RawFd) {
        let removed = self.watchers.borrow_mut().remove(&fd);
        assert!(removed.is_some(), "fd {fd} is not watched");
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopLocal>>> = const { RefCell::new(None) };
}

/// Single-threaded reactor: readiness demux, deferred tasks, timer-fd table.
///
/// The loop is `!Send`; it is constructed and run on its owning thread.
/// Cross-thread interaction goes through the [`LoopHandle`] obtained from
/// [`EventLoop::handle`] or [`EventLoop::background`].
pub struct EventLoop {
    poll: Poll,
    local: Rc<LoopLocal>,
}

impl EventLoop {
    /// Creates the loop on the current thread and installs it as this
    /// thread's loop. At most one loop may exist per thread.
    pub fn new() -> Self {
        let poll = Poll::new().expect("couldn't create the readiness poller");
        let waker =
            Waker::new(poll.registry(), WAKE_TOKEN).expect("couldn't create the loop waker");
        let registry = poll.registry().try_clone().expect("couldn't clone the poll registry");

        let shared = Arc::new(LoopShared {
            registry,
            waker,
            tasks: Mutex::new(VecDeque::new()),
            thread: thread::current().id(),
        });
        let local = Rc::new(LoopLocal {
            shared,
            state: Cell::new(LoopState::Idle),
            local_tasks: RefCell::new(VecDeque::new()),
            watchers: RefCell::new(HashMap::new()),
            timed_tasks: RefCell::new(HashMap::new()),
        });

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(current.is_none(), "this thread already runs an event loop");
            *current = Some(Rc::clone(&local));
        });

        debug!("event loop created");

        Self { poll, local }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.local.shared) }
    }

    /// Spawns a thread whose sole job is to construct a loop and run it.
    /// Returns once the loop is ready.
    pub fn background() -> LoopHandle {
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("courier-loop".into())
            .spawn(move || {
                let mut event_loop = Self::new();
                tx.send(event_loop.handle()).expect("loop creator went away");
                event_loop.run();
            })
            .expect("couldn't spawn the loop thread");

        rx.recv().expect("loop thread died during startup")
    }

    /// Enters the dispatch loop. Does not return.
    pub fn run(&mut self) -> ! {
        assert!(
            self.local.shared.thread == thread::current().id(),
            "run() called off the loop thread"
        );

        let mut events = Events::with_capacity(MAX_EVENTS);

        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("poll failed: {err}");
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }

                let fd = token.0 as RawFd;

                let timed_task = self.local.timed_tasks.borrow_mut().remove(&fd);
                if let Some(mut task) = timed_task {
                    sys::timerfd_drain(fd);

                    self.local.state.set(LoopState::TimedTask);
                    let next = task();
                    self.local.state.set(LoopState::Idle);

                    if next.is_zero() {
                        let _ = self.local.shared.registry.deregister(&mut SourceFd(&fd));
                        sys::close_fd(fd);
                    } else {
                        sys::timerfd_settime(fd, next, Duration::ZERO);
                        self.local.timed_tasks.borrow_mut().insert(fd, task);
                    }
                    continue;
                }

                let watcher = self.local.watchers.borrow().get(&fd).and_then(Weak::upgrade);
                let Some(watcher) = watcher else {
                    warn!(fd, "readiness for an unknown fd");
                    continue;
                };

                if event.is_readable() {
                    self.local.state.set(LoopState::Callback);
                    watcher.dispatch_read();
                    self.local.state.set(LoopState::Idle);

                    if !watcher.has_read_callbacks() {
                        watcher.sync_interest();
                    }
                }

                if event.is_writable() {
                    self.local.state.set(LoopState::Callback);
                    watcher.dispatch_write();
                    self.local.state.set(LoopState::Idle);

                    if !watcher.has_write_callbacks() {
                        watcher.sync_interest();
                    }
                }
            }

            self.drain_tasks();
        }
    }

    fn drain_tasks(&self) {
        self.local.state.set(LoopState::Task);

        let mut budget = MAX_TASKS_PER_TICK;

        let local_batch: Vec<LocalTask> = {
            let mut queue = self.local.local_tasks.borrow_mut();
            let n = budget.min(queue.len());
            queue.drain(..n).collect()
        };
        budget -= local_batch.len();
        for task in local_batch {
            task();
        }

        let shared_batch: Vec<Task> = {
            let mut queue = self.local.shared.tasks.lock().expect("task queue poisoned");
            let n = budget.min(queue.len());
            queue.drain(..n).collect()
        };
        for task in shared_batch {
            task();
        }

        let more = !self.local.local_tasks.borrow().is_empty()
            || !self.local.shared.tasks.lock().expect("task queue poisoned").is_empty();
        if more {
            self.local.shared.waker.wake().expect("couldn't wake the loop");
        }

        self.local.state.set(LoopState::Idle);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = None;
        });
    }
}

/// Cheap, `Send + Sync` handle to an [`EventLoop`]. All reactor objects
/// store one; it is also the [`Executor`] / [`TimedExecutor`] the loop
/// exposes to the rest of the system.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.thread == thread::current().id()
    }

    /// Current dispatch phase. Loop thread only.
    pub fn state(&self) -> LoopState {
        self.local().state()
    }

    /// Appends a task to the task queue from any thread and wakes the loop.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.tasks.lock().expect("task queue poisoned").push_back(Box::new(task));
        self.shared.waker.wake().expect("couldn't wake the loop");
    }

    /// Like [`post`](Self::post), but without the `Send` bound. Loop thread
    /// only.
    pub fn post_local(&self, task: impl FnOnce() + 'static) {
        self.local().local_tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Posts a task and blocks until the loop has run it, returning its
    /// result. Runs the task inline when called on the loop thread.
    pub fn post_and_wait<R, F>(&self, task: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_in_loop_thread() {
            return task();
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.post(move || {
            let _ = tx.send(task());
        });
        rx.recv().expect("the event loop went away")
    }

    /// Schedules a one-shot task after `delay`. The task returns the next
    /// delay; `Duration::ZERO` stops it, anything else re-arms the timer.
    pub fn post_timed(&self, task: impl FnMut() -> Duration + Send + 'static, delay: Duration) {
        assert!(!delay.is_zero(), "post_timed requires a non-zero delay");

        if self.is_in_loop_thread() {
            self.post_timed_local(task, delay);
            return;
        }

        // The timer starts ticking here; registration with the poller is
        // deferred to the loop thread so the expiration edge cannot be
        // observed before the task is in the table.
        let fd = sys::timerfd_create();
        sys::timerfd_settime(fd, delay, Duration::ZERO);

        let handle = self.clone();
        self.post(move || {
            handle.install_timed(fd, Box::new(task));
        });
    }

    /// Loop-thread variant of [`post_timed`](Self::post_timed) without the
    /// `Send` bound.
    pub fn post_timed_local(&self, task: impl FnMut() -> Duration + 'static, delay: Duration) {
        assert!(!delay.is_zero(), "post_timed requires a non-zero delay");

        let fd = sys::timerfd_create();
        sys::timerfd_settime(fd, delay, Duration::ZERO);
        self.install_timed(fd, Box::new(task));
    }

    fn install_timed(&self, fd: RawFd, task: LocalTimedTask) {
        debug!(fd, "timed task armed");

        let local = self.local();
        self.shared
            .registry
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
            .expect("couldn't register a timer fd");
        local.timed_tasks.borrow_mut().insert(fd, task);
    }

    pub(crate) fn local(&self) -> Rc<LoopLocal> {
        let local = CURRENT.with(|current| current.borrow().clone());
        let Some(local) = local else {
            panic!("not on an event loop thread");
        };
        assert!(
            Arc::ptr_eq(&local.shared, &self.shared),
            "handle belongs to a different event loop"
        );
        local
    }
}

impl Executor for LoopHandle {
    fn post(&self, task: Task) {
        Self::post(self, task);
    }
}

impl TimedExecutor for LoopHandle {
    fn post_timed(&self, task: TimedTask, delay: Duration) {
        Self::post_timed(self, task, delay);
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("thread", &self.shared.thread).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Instant,
    };

    use super::*;

    #[test]
    fn posts_run_in_submission_order() {
        let handle = EventLoop::background();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            handle.post(move || seen.lock().unwrap().push(i));
        }
        handle.post_and_wait(|| {});

        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn post_and_wait_returns_the_task_result() {
        let handle = EventLoop::background();
        assert_eq!(handle.post_and_wait(|| 7), 7);
    }

    #[test]
    fn loop_thread_is_detected() {
        let handle = EventLoop::background();
        assert!(!handle.is_in_loop_thread());

        let probe = handle.clone();
        assert!(handle.post_and_wait(move || probe.is_in_loop_thread()));
    }

    #[test]
    fn timed_task_rearms_until_it_returns_zero() {
        let handle = EventLoop::background();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        handle.post_timed(
            move || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                    Duration::from_millis(5)
                } else {
                    Duration::ZERO
                }
            },
            Duration::from_millis(5),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 3, "timed task fired after returning zero");
    }
}

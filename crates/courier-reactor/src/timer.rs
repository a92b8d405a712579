use std::{
    cell::{Cell, RefCell},
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

use tracing::debug;

use crate::{event_loop::LoopHandle, sys, watcher::Watcher};

/// Expiration callback; returning `true` keeps it armed.
pub type ExpireCallback = Box<dyn FnMut() -> bool + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Closed,
    Opened,
}

/// One-shot or periodic expiration callbacks backed by a kernel timer fd.
/// All methods are loop-thread only.
pub struct Timer {
    handle: LoopHandle,
    state: Cell<TimerState>,
    fd: Cell<RawFd>,
    watcher: RefCell<Option<Rc<Watcher>>>,
    expire_callbacks: RefCell<Vec<ExpireCallback>>,
}

impl Timer {
    pub fn new(handle: &LoopHandle) -> Rc<Self> {
        assert!(handle.is_in_loop_thread());

        Rc::new(Self {
            handle: handle.clone(),
            state: Cell::new(TimerState::Closed),
            fd: Cell::new(-1),
            watcher: RefCell::new(None),
            expire_callbacks: RefCell::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn state(&self) -> TimerState {
        assert!(self.handle.is_in_loop_thread());

        self.state.get()
    }

    pub fn fd(&self) -> RawFd {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == TimerState::Opened);

        self.fd.get()
    }

    pub fn has_expire_callbacks(&self) -> bool {
        assert!(self.handle.is_in_loop_thread());

        !self.expire_callbacks.borrow().is_empty()
    }

    pub fn add_expire_callback(&self, callback: impl FnMut() -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.expire_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn clear_expire_callbacks(&self) {
        assert!(self.handle.is_in_loop_thread());

        self.expire_callbacks.borrow_mut().clear();
    }

    pub fn dispatch_expire(&self) {
        assert!(self.handle.is_in_loop_thread());

        let callbacks = std::mem::take(&mut *self.expire_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback() {
                self.expire_callbacks.borrow_mut().push(callback);
            }
        }
    }

    pub fn open(self: &Rc<Self>) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == TimerState::Closed);

        let fd = sys::timerfd_create();
        debug!(fd, "timer opened");
        self.fd.set(fd);

        let watcher = Watcher::new(&self.handle, fd);
        watcher.register_self();

        let weak = Rc::downgrade(self);
        watcher.add_read_callback(move || {
            let Some(timer) = weak.upgrade() else {
                return false;
            };
            timer.on_watcher_read()
        });

        *self.watcher.borrow_mut() = Some(watcher);
        self.state.set(TimerState::Opened);
    }

    /// Arms the timer: first expiry after `delay`, then every `interval`
    /// (zero interval makes it one-shot).
    pub fn set_time(&self, delay: Duration, interval: Duration) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == TimerState::Opened);

        sys::timerfd_settime(self.fd.get(), delay, interval);
    }

    /// Disarms the timer without closing it.
    pub fn cancel(&self) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == TimerState::Opened);

        sys::timerfd_settime(self.fd.get(), Duration::ZERO, Duration::ZERO);
    }

    pub fn close(&self) {
        assert!(self.handle.is_in_loop_thread());

        if self.state.get() == TimerState::Closed {
            return;
        }
        self.state.set(TimerState::Closed);

        let watcher = self.watcher.borrow_mut().take().expect("open timer without a watcher");
        watcher.clear_read_callbacks();

        let fd = self.fd.get();
        self.fd.set(-1);
        self.handle.post_local(move || {
            watcher.unregister_self();
            sys::close_fd(fd);
        });
    }

    /// Like [`close`](Self::close), but also forgets the expire callbacks.
    pub fn reset(&self) {
        assert!(self.handle.is_in_loop_thread());

        self.clear_expire_callbacks();
        self.close();
    }

    fn on_watcher_read(&self) -> bool {
        if self.state.get() == TimerState::Closed {
            return false;
        }

        sys::timerfd_drain(self.fd.get());
        self.dispatch_expire();

        self.state.get() == TimerState::Opened
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        crate::safe_assert!(
            self.state.get() == TimerState::Closed,
            "timer dropped while open"
        );
    }
}

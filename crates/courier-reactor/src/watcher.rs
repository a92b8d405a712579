use std::{
    cell::{Cell, RefCell},
    os::fd::RawFd,
    rc::Rc,
};

use mio::{Interest, unix::SourceFd};
use tracing::debug;

use crate::event_loop::{LoopHandle, LoopState};

/// Readiness callback; returning `true` keeps it armed for the next edge.
pub type ReadyCallback = Box<dyn FnMut() -> bool + 'static>;

/// Presents one fd's readiness edges as two ordered callback lists.
///
/// The fd is borrowed, never owned: the watcher registers interest with the
/// loop but closing the fd stays with whoever created it. All methods are
/// loop-thread only.
pub struct Watcher {
    handle: LoopHandle,
    fd: RawFd,
    read_callbacks: RefCell<Vec<ReadyCallback>>,
    write_callbacks: RefCell<Vec<ReadyCallback>>,
    /// Present in the loop's fd table.
    registered: Cell<bool>,
    /// Currently added to the kernel poller.
    polled: Cell<bool>,
}

impl Watcher {
    pub fn new(handle: &LoopHandle, fd: RawFd) -> Rc<Self> {
        assert!(handle.is_in_loop_thread());

        Rc::new(Self {
            handle: handle.clone(),
            fd,
            read_callbacks: RefCell::new(Vec::new()),
            write_callbacks: RefCell::new(Vec::new()),
            registered: Cell::new(false),
            polled: Cell::new(false),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn has_read_callbacks(&self) -> bool {
        assert!(self.handle.is_in_loop_thread());

        !self.read_callbacks.borrow().is_empty()
    }

    pub fn has_write_callbacks(&self) -> bool {
        assert!(self.handle.is_in_loop_thread());

        !self.write_callbacks.borrow().is_empty()
    }

    pub fn add_read_callback(&self, callback: impl FnMut() -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        let first = {
            let mut callbacks = self.read_callbacks.borrow_mut();
            callbacks.push(Box::new(callback));
            callbacks.len() == 1
        };
        if first && self.registered.get() {
            self.sync_interest();
        }
    }

    pub fn add_write_callback(&self, callback: impl FnMut() -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        let first = {
            let mut callbacks = self.write_callbacks.borrow_mut();
            callbacks.push(Box::new(callback));
            callbacks.len() == 1
        };
        if first && self.registered.get() {
            self.sync_interest();
        }
    }

    pub fn clear_read_callbacks(&self) {
        assert!(self.handle.is_in_loop_thread());

        let was_empty = self.read_callbacks.borrow_mut().drain(..).count() == 0;
        if !was_empty && self.registered.get() {
            self.sync_interest();
        }
    }

    pub fn clear_write_callbacks(&self) {
        assert!(self.handle.is_in_loop_thread());

        let was_empty = self.write_callbacks.borrow_mut().drain(..).count() == 0;
        if !was_empty && self.registered.get() {
            self.sync_interest();
        }
    }

    /// Invokes read callbacks in FIFO order, retaining those that return
    /// `true`. Callbacks may re-enter the watcher.
    pub fn dispatch_read(&self) {
        assert!(self.handle.is_in_loop_thread());

        let callbacks = std::mem::take(&mut *self.read_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback() {
                self.read_callbacks.borrow_mut().push(callback);
            }
        }
    }

    pub fn dispatch_write(&self) {
        assert!(self.handle.is_in_loop_thread());

        let callbacks = std::mem::take(&mut *self.write_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback() {
                self.write_callbacks.borrow_mut().push(callback);
            }
        }
    }

    /// Adds this watcher to the loop's fd table and the kernel poller.
    pub fn register_self(self: &Rc<Self>) {
        debug!(fd = self.fd, "watcher registered");

        assert!(self.handle.is_in_loop_thread());
        assert!(!self.registered.get(), "watcher is already registered");

        self.handle.local().add_watcher(self.fd, Rc::downgrade(self));
        self.registered.set(true);
        self.sync_interest();
    }

    /// Removes this watcher from the loop. Must run in a task phase so no
    /// in-flight readiness is observed after removal.
    pub fn unregister_self(&self) {
        debug!(fd = self.fd, "watcher unregistered");

        assert!(self.handle.is_in_loop_thread());

        let local = self.handle.local();
        assert!(
            local.state() == LoopState::Task,
            "watchers may only be unregistered from a task"
        );

        if !self.registered.get() {
            return;
        }

        local.remove_watcher(self.fd);
        if self.polled.get() {
            let _ = local.registry().deregister(&mut SourceFd(&self.fd));
            self.polled.set(false);
        }
        self.registered.set(false);
    }

    /// Reconciles the kernel poller with the callback lists: interest is
    /// readable iff the read list is non-empty and writable iff the write
    /// list is non-empty.
    pub(crate) fn sync_interest(&self) {
        let interest = match (
            !self.read_callbacks.borrow().is_empty(),
            !self.write_callbacks.borrow().is_empty(),
        ) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let local = self.handle.local();
        let registry = local.registry();
        let token = mio::Token(self.fd as usize);

        match interest {
            Some(interest) if self.polled.get() => {
                registry
                    .reregister(&mut SourceFd(&self.fd), token, interest)
                    .expect("couldn't update fd interest");
            }
            Some(interest) => {
                registry
                    .register(&mut SourceFd(&self.fd), token, interest)
                    .expect("couldn't register fd interest");
                self.polled.set(true);
            }
            None if self.polled.get() => {
                registry
                    .deregister(&mut SourceFd(&self.fd))
                    .expect("couldn't drop fd interest");
                self.polled.set(false);
            }
            None => {}
        }
    }
}

use std::{
    rc::Rc,
    sync::{Arc, Weak},
};

use crate::event_loop::LoopHandle;

/// Pins the address of a loop-owned object so `Send` closures can reach it.
///
/// Safety invariant: `ptr` is only dereferenced on the loop thread, and only
/// after a successful upgrade of a `Weak<Anchor>` — upgrade failure means
/// the owner's release task has already run and the target is gone. Both the
/// final strong drop and every dereference happen on the loop thread, so the
/// check cannot race the release.
struct Anchor<T> {
    ptr: *const T,
}

unsafe impl<T> Send for Anchor<T> {}
unsafe impl<T> Sync for Anchor<T> {}

/// Moves a non-`Send` value between threads. Only opened on the loop thread.
struct LoopShuttle<T>(T);

unsafe impl<T> Send for LoopShuttle<T> {}

/// Owns a loop-local object from any thread.
///
/// The object is constructed on the loop thread, mutated only there, and
/// released by a task posted to the loop — destruction happens only after
/// the loop has drained callbacks that may still reference it.
pub struct RemoteOwner<T: 'static> {
    handle: LoopHandle,
    anchor: Arc<Anchor<T>>,
    strong: Option<LoopShuttle<Rc<T>>>,
}

impl<T: 'static> RemoteOwner<T> {
    pub fn new(handle: &LoopHandle, init: impl FnOnce() -> Rc<T> + Send + 'static) -> Self {
        let shuttle = handle.post_and_wait(move || LoopShuttle(init()));
        let ptr = Rc::as_ptr(&shuttle.0);

        Self { handle: handle.clone(), anchor: Arc::new(Anchor { ptr }), strong: Some(shuttle) }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Runs `f` against the object on the loop thread and returns its
    /// result, blocking the caller if off-loop.
    pub fn with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.handle.is_in_loop_thread() {
            let strong = self.strong.as_ref().expect("target already released");
            return f(&strong.0);
        }

        let weak = Arc::downgrade(&self.anchor);
        self.handle.post_and_wait(move || {
            // The owner is borrowed for the duration of the call, so the
            // anchor cannot have been released.
            let anchor = weak.upgrade().expect("target released while in use");
            f(unsafe { &*anchor.ptr })
        })
    }

    /// Posts `f` to run against the object on the loop thread, or runs it
    /// inline when already there. Skipped if the object is gone by the time
    /// the task runs.
    pub fn post(&self, f: impl FnOnce(&T) + Send + 'static) {
        if self.handle.is_in_loop_thread() {
            let strong = self.strong.as_ref().expect("target already released");
            f(&strong.0);
            return;
        }

        let weak = Arc::downgrade(&self.anchor);
        self.handle.post(move || {
            if let Some(anchor) = weak.upgrade() {
                f(unsafe { &*anchor.ptr });
            }
        });
    }

    /// Direct access when the caller is already on the loop thread; `None`
    /// otherwise. Lets borrowed data flow into loop-local calls without the
    /// `'static` bound [`with`](Self::with) needs.
    pub fn local(&self) -> Option<&T> {
        if self.handle.is_in_loop_thread() {
            let strong = self.strong.as_ref().expect("target already released");
            return Some(&strong.0);
        }
        None
    }

    /// A weak, `Send` reference used as a liveness gate by posted closures.
    pub fn watch(&self) -> RemoteRef<T> {
        RemoteRef { handle: self.handle.clone(), weak: Arc::downgrade(&self.anchor) }
    }
}

impl<T: 'static> Drop for RemoteOwner<T> {
    fn drop(&mut self) {
        let anchor = std::mem::replace(&mut self.anchor, Arc::new(Anchor { ptr: std::ptr::null() }));
        let strong = self.strong.take();

        let release = move || {
            drop(anchor);
            drop(strong);
        };

        if self.handle.is_in_loop_thread() {
            self.handle.post_local(release);
        } else {
            self.handle.post(release);
        }
    }
}

/// Weak companion of [`RemoteOwner`]: upgradeable only on the loop thread,
/// freely cloned and dropped anywhere.
pub struct RemoteRef<T> {
    handle: LoopHandle,
    weak: Weak<Anchor<T>>,
}

impl<T> RemoteRef<T> {
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Runs `f` against the object if it is still alive. Loop thread only.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        assert!(self.handle.is_in_loop_thread());

        let anchor = self.weak.upgrade()?;
        Some(f(unsafe { &*anchor.ptr }))
    }
}

impl<T> Clone for RemoteRef<T> {
    fn clone(&self) -> Self {
        Self { handle: self.handle.clone(), weak: self.weak.clone() }
    }
}

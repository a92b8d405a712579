use std::{
    cell::{Cell, RefCell},
    os::fd::RawFd,
    rc::Rc,
};

use courier_reactor::{LoopHandle, Watcher};
use tracing::{debug, info, warn};

use crate::{
    endpoint::Endpoint,
    socket::{Socket, SocketConfig},
    sys::{self, AcceptOutcome},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptorConfig {
    pub reuse_addr: bool,
    pub reuse_port: bool,
    /// Template applied to every accepted socket.
    pub socket: SocketConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self { reuse_addr: true, reuse_port: false, socket: SocketConfig::default() }
    }
}

impl AcceptorConfig {
    pub fn with_reuse_addr(mut self, reuse_addr: bool) -> Self {
        self.reuse_addr = reuse_addr;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_socket(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptorState {
    Closed,
    Listening,
}

/// Gets each accepted, already-connected [`Socket`] and the peer address;
/// returning `false` uninstalls the callback.
pub type AcceptCallback = Box<dyn FnMut(Rc<Socket>, &Endpoint) -> bool + 'static>;

/// Listening socket; emits accepted [`Socket`]s carrying the template
/// configuration. Loop-thread only.
pub struct Acceptor {
    handle: LoopHandle,
    config: RefCell<AcceptorConfig>,
    state: Cell<AcceptorState>,
    fd: Cell<RawFd>,
    watcher: RefCell<Option<Rc<Watcher>>>,
    local_endpoint: RefCell<Option<Endpoint>>,
    accept_callback: RefCell<Option<AcceptCallback>>,
}

impl Acceptor {
    pub fn new(handle: &LoopHandle, config: AcceptorConfig) -> Rc<Self> {
        assert!(handle.is_in_loop_thread());

        Rc::new(Self {
            handle: handle.clone(),
            config: RefCell::new(config),
            state: Cell::new(AcceptorState::Closed),
            fd: Cell::new(-1),
            watcher: RefCell::new(None),
            local_endpoint: RefCell::new(None),
            accept_callback: RefCell::new(None),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn state(&self) -> AcceptorState {
        assert!(self.handle.is_in_loop_thread());

        self.state.get()
    }

    pub fn fd(&self) -> RawFd {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == AcceptorState::Listening);

        self.fd.get()
    }

    /// The bound address; with a port-0 bind this carries the port the
    /// kernel picked.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        assert!(self.handle.is_in_loop_thread());

        self.local_endpoint.borrow().clone()
    }

    /// Installs the accept callback, replacing any previous one.
    pub fn set_accept_callback(&self, callback: impl FnMut(Rc<Socket>, &Endpoint) -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        *self.accept_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn dispatch_accept(&self, socket: Rc<Socket>, remote: &Endpoint) {
        let callback = self.accept_callback.borrow_mut().take();
        let Some(mut callback) = callback else {
            warn!(remote = %remote, "no accept callback; dropping connection");
            socket.reset();
            return;
        };

        let keep = callback(socket, remote);
        let mut slot = self.accept_callback.borrow_mut();
        if keep && slot.is_none() {
            *slot = Some(callback);
        }
    }

    /// Binds, listens, and starts accepting. Returns the errno when the
    /// kernel refuses the bind or listen.
    pub fn open(self: &Rc<Self>, local: &Endpoint) -> Result<(), i32> {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == AcceptorState::Closed);

        let config = self.config.borrow().clone();
        let fd = sys::stream_socket(local.domain());
        debug!(fd, local = %local, "opening acceptor");

        if config.reuse_addr {
            sys::set_reuse_addr(fd);
        }
        if config.reuse_port {
            sys::set_reuse_port(fd);
        }

        if let Err(errno) = sys::bind(fd, local).and_then(|()| sys::listen(fd)) {
            warn!(local = %local, error = %sys::errno_string(errno), "bind/listen failed");
            sys::close(fd);
            return Err(errno);
        }

        self.fd.set(fd);
        *self.local_endpoint.borrow_mut() = sys::local_endpoint(fd).or_else(|| Some(local.clone()));

        let watcher = Watcher::new(&self.handle, fd);
        watcher.register_self();
        let weak = Rc::downgrade(self);
        watcher.add_read_callback(move || weak.upgrade().is_some_and(|a| a.on_read_ready()));
        *self.watcher.borrow_mut() = Some(watcher);

        self.state.set(AcceptorState::Listening);
        info!(local = %self.local_endpoint.borrow().as_ref().unwrap(), "listening");

        Ok(())
    }

    pub fn close(&self) {
        assert!(self.handle.is_in_loop_thread());

        if self.state.get() == AcceptorState::Closed {
            return;
        }
        self.state.set(AcceptorState::Closed);

        let watcher = self.watcher.borrow_mut().take();
        let fd = self.fd.replace(-1);
        if let Some(watcher) = watcher {
            watcher.clear_read_callbacks();
            watcher.clear_write_callbacks();
            self.handle.post_local(move || {
                watcher.unregister_self();
                sys::close(fd);
            });
        }

        *self.local_endpoint.borrow_mut() = None;
    }

    /// Like [`close`](Self::close) but also forgets the accept callback.
    pub fn reset(&self) {
        assert!(self.handle.is_in_loop_thread());

        *self.accept_callback.borrow_mut() = None;
        self.close();
    }

    fn on_read_ready(self: &Rc<Self>) -> bool {
        loop {
            if self.state.get() != AcceptorState::Listening {
                return false;
            }

            match sys::accept(self.fd.get()) {
                AcceptOutcome::Accepted(fd, remote) => {
                    let Some(remote) = remote else {
                        warn!(fd, "accepted socket with an unusable peer address");
                        sys::close(fd);
                        continue;
                    };
                    debug!(fd, remote = %remote, "accepted");

                    let socket = Socket::new(&self.handle, self.config.borrow().socket.clone());
                    socket.open_accepted(fd, &remote);
                    self.dispatch_accept(socket, &remote);
                }
                AcceptOutcome::WouldBlock => return true,
                AcceptOutcome::Failed(errno) => {
                    warn!(error = %sys::errno_string(errno), "accept failed");
                    return true;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        courier_reactor::safe_assert!(
            self.state.get() == AcceptorState::Closed,
            "acceptor dropped while listening"
        );
    }
}

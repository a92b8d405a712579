use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use courier_net::{Endpoint, FramingConfig, FramingSocket, SocketState};
use courier_reactor::{Executor, LoopHandle, RemoteOwner};
use tracing::{debug, warn};

use crate::{EndpointState, Signal, WaitError, await_signal, client_socket_config, raise_signal};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequesterConfig {
    /// Zero disables auto-reconnect.
    pub reconnect_interval: Duration,
    pub framing: FramingConfig,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::ZERO,
            framing: FramingConfig::default().with_socket(client_socket_config()),
        }
    }
}

impl RequesterConfig {
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_framing(mut self, framing: FramingConfig) -> Self {
        self.framing = framing;
        self
    }
}

/// Single-inflight request/reply client: one framed stream towards a
/// replier, with optional auto-reconnect and a single user recv callback.
///
/// The handle is `Send`; the connection state lives on the loop.
pub struct Requester {
    owner: RemoteOwner<RequesterInner>,
}

impl Requester {
    pub fn new(handle: &LoopHandle, remote: Endpoint) -> Self {
        let loop_handle = handle.clone();
        let owner =
            RemoteOwner::new(handle, move || RequesterInner::new(&loop_handle, remote));
        Self { owner }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.owner.handle()
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        self.owner.with(|inner| inner.remote.clone())
    }

    /// Only while closed.
    pub fn configure(&self, config: RequesterConfig) {
        self.owner.with(move |inner| inner.configure(config));
    }

    /// Fires after every successful (re)connect.
    pub fn set_connect_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.connect_hook.borrow_mut() = Some(Box::new(callback));
        });
    }

    pub fn set_recv_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.recv_callback.borrow_mut() = Some(Arc::new(callback));
        });
    }

    /// Receive callbacks are posted to `executor` with an owned copy of the
    /// message instead of running inline on the loop.
    pub fn set_recv_executor(&self, executor: Option<Arc<dyn Executor>>) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.recv_executor.borrow_mut() = executor;
        });
    }

    pub fn state(&self) -> EndpointState {
        self.owner.with(|inner| inner.state.get())
    }

    pub fn open(&self) {
        self.owner.with(|inner| inner.open());
    }

    /// Blocks the calling thread (never the loop thread) until the
    /// connection is established; zero timeout waits forever.
    pub fn wait_for_connected(&self, timeout: Duration) -> Result<(), WaitError> {
        assert!(
            !self.owner.handle().is_in_loop_thread(),
            "wait_for_connected would deadlock the loop"
        );

        let signal = crate::new_signal();
        let posted = Arc::clone(&signal);
        self.owner.post(move |inner| inner.notify_when_connected(posted));
        await_signal(&signal, timeout)
    }

    /// Queues one message; failures are logged, not returned — the close
    /// callback path is the place connection trouble surfaces.
    pub fn send(&self, message: &[u8]) {
        if let Some(inner) = self.owner.local() {
            inner.send(&[message]);
            return;
        }
        let bytes = message.to_vec();
        self.owner.post(move |inner| inner.send(&[&bytes]));
    }

    pub fn close(&self) {
        self.owner.with(|inner| inner.close());
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct RequesterInner {
    handle: LoopHandle,
    pub(crate) remote: Endpoint,
    config: RefCell<RequesterConfig>,
    pub(crate) state: Cell<EndpointState>,
    socket: RefCell<Option<Rc<FramingSocket>>>,
    token: RefCell<Option<Arc<()>>>,
    weak_self: RefCell<Weak<RequesterInner>>,
    connect_hook: RefCell<Option<Box<dyn FnMut() + 'static>>>,
    recv_callback: RefCell<Option<Arc<dyn Fn(&[u8]) + Send + Sync>>>,
    recv_executor: RefCell<Option<Arc<dyn Executor>>>,
    /// Internal pre-user hook; when present it consumes inbound messages
    /// (the multiplexing layer sits here).
    recv_tap: RefCell<Option<Box<dyn FnMut(&[u8]) + 'static>>>,
    /// Internal close observer (multiplexing cancellation).
    close_tap: RefCell<Option<Box<dyn FnMut(i32) + 'static>>>,
}

impl RequesterInner {
    pub(crate) fn new(handle: &LoopHandle, remote: Endpoint) -> Rc<Self> {
        let inner = Rc::new(Self {
            handle: handle.clone(),
            remote,
            config: RefCell::new(RequesterConfig::default()),
            state: Cell::new(EndpointState::Closed),
            socket: RefCell::new(None),
            token: RefCell::new(None),
            weak_self: RefCell::new(Weak::new()),
            connect_hook: RefCell::new(None),
            recv_callback: RefCell::new(None),
            recv_executor: RefCell::new(None),
            recv_tap: RefCell::new(None),
            close_tap: RefCell::new(None),
        });
        *inner.weak_self.borrow_mut() = Rc::downgrade(&inner);
        inner
    }

    pub(crate) fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub(crate) fn configure(&self, config: RequesterConfig) {
        assert!(self.state.get() == EndpointState::Closed);

        *self.config.borrow_mut() = config;
    }

    pub(crate) fn set_recv_tap(&self, tap: impl FnMut(&[u8]) + 'static) {
        assert!(self.state.get() == EndpointState::Closed);

        *self.recv_tap.borrow_mut() = Some(Box::new(tap));
    }

    pub(crate) fn set_close_tap(&self, tap: impl FnMut(i32) + 'static) {
        assert!(self.state.get() == EndpointState::Closed);

        *self.close_tap.borrow_mut() = Some(Box::new(tap));
    }

    pub(crate) fn open(&self) {
        assert!(self.state.get() == EndpointState::Closed);
        self.state.set(EndpointState::Opened);
        debug!(remote = %self.remote, "requester opened");

        *self.token.borrow_mut() = Some(Arc::new(()));

        let config = self.config.borrow().clone();
        let socket = FramingSocket::new(&self.handle, config.framing.clone());

        let weak = self.weak_self.borrow().clone();
        socket.add_connect_callback(move |error| {
            if error == 0 {
                if let Some(inner) = weak.upgrade() {
                    inner.run_connect_hook();
                }
            }
            true
        });

        let weak = self.weak_self.borrow().clone();
        socket.add_recv_callback(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_recv(message);
            }
            true
        });

        let reconnect = config.reconnect_interval;
        if !reconnect.is_zero() {
            let weak = self.weak_self.borrow().clone();
            socket.add_connect_callback(move |error| {
                if error != 0 {
                    if let Some(inner) = weak.upgrade() {
                        inner.schedule_reconnect();
                    }
                }
                true
            });
        }

        let weak = self.weak_self.borrow().clone();
        socket.add_close_callback(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.run_close_tap(error);
                if !inner.config.borrow().reconnect_interval.is_zero() {
                    inner.schedule_reconnect();
                }
            }
            true
        });

        *self.socket.borrow_mut() = Some(Rc::clone(&socket));
        socket.open(&self.remote);
    }

    pub(crate) fn send(&self, pieces: &[&[u8]]) {
        if self.state.get() != EndpointState::Opened {
            warn!("send on a closed requester");
            return;
        }
        let socket = self.socket.borrow().clone();
        let Some(socket) = socket else {
            return;
        };
        if let Err(error) = socket.send_pieces(pieces) {
            warn!(%error, "dropping outbound message");
        }
    }

    pub(crate) fn close(&self) {
        if self.state.get() == EndpointState::Closed {
            return;
        }
        self.state.set(EndpointState::Closed);
        debug!(remote = %self.remote, "requester closed");

        *self.token.borrow_mut() = None;

        let socket = self.socket.borrow_mut().take();
        if let Some(socket) = socket {
            socket.reset();
            self.handle.post_local(move || drop(socket));
        }
    }

    /// Raises `signal` once the transport is connected (immediately when it
    /// already is).
    pub(crate) fn notify_when_connected(&self, signal: Signal) {
        let socket = self.socket.borrow().clone();
        let Some(socket) = socket else {
            // Not opened; the caller's wait will time out.
            return;
        };

        if socket.state() == SocketState::Connected {
            raise_signal(&signal);
            return;
        }

        socket.add_connect_callback(move |error| {
            if error == 0 {
                raise_signal(&signal);
                return false;
            }
            true
        });
    }

    fn run_connect_hook(&self) {
        let hook = self.connect_hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook();
            let mut slot = self.connect_hook.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn run_close_tap(&self, error: i32) {
        let tap = self.close_tap.borrow_mut().take();
        if let Some(mut tap) = tap {
            tap(error);
            let mut slot = self.close_tap.borrow_mut();
            if slot.is_none() {
                *slot = Some(tap);
            }
        }
    }

    fn on_socket_recv(&self, message: &[u8]) {
        {
            let tap = self.recv_tap.borrow_mut().take();
            if let Some(mut tap) = tap {
                tap(message);
                let mut slot = self.recv_tap.borrow_mut();
                if slot.is_none() {
                    *slot = Some(tap);
                }
                return;
            }
        }

        let callback = self.recv_callback.borrow().clone();
        let Some(callback) = callback else {
            return;
        };

        let executor = self.recv_executor.borrow().clone();
        match executor {
            None => callback(message),
            Some(executor) => {
                let Some(token) = self.token.borrow().as_ref().map(Arc::downgrade) else {
                    return;
                };
                let bytes = message.to_vec();
                executor.post(Box::new(move || {
                    if token.upgrade().is_some() {
                        callback(&bytes);
                    }
                }));
            }
        }
    }

    fn schedule_reconnect(&self) {
        let Some(token) = self.token.borrow().as_ref().map(Arc::downgrade) else {
            return;
        };
        let weak = self.weak_self.borrow().clone();
        let interval = self.config.borrow().reconnect_interval;

        self.handle.post_timed_local(
            move || {
                if token.upgrade().is_some() {
                    if let Some(inner) = weak.upgrade() {
                        let socket = inner.socket.borrow().clone();
                        if let Some(socket) = socket {
                            if socket.state() == SocketState::Closed {
                                debug!(remote = %inner.remote, "reconnecting");
                                socket.open(&inner.remote);
                            }
                        }
                    }
                }
                Duration::ZERO
            },
            interval,
        );
    }
}

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    rc::{Rc, Weak},
    sync::Arc,
};

use courier_net::{
    Endpoint, FramingAcceptor, FramingAcceptorConfig, FramingSocket, SocketId,
};
use courier_reactor::{Executor, LoopHandle, RemoteOwner, RemoteRef};
use tracing::{debug, warn};

use crate::{EndpointState, server_socket_config};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplierConfig {
    /// Connections accepted beyond this are dropped immediately.
    pub max_connections: usize,
    pub framing: FramingAcceptorConfig,
}

impl Default for ReplierConfig {
    fn default() -> Self {
        Self {
            max_connections: 512,
            framing: FramingAcceptorConfig::default()
                .with_reuse_addr(true)
                .with_reuse_port(true)
                .with_socket(server_socket_config()),
        }
    }
}

impl ReplierConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_framing(mut self, framing: FramingAcceptorConfig) -> Self {
        self.framing = framing;
        self
    }
}

/// One-shot reply completion bound to the connection a request arrived on.
///
/// Completing consumes the promise; dropping it without completing means
/// the request simply gets no reply. If the connection or the replier went
/// away in the meantime, the reply is silently dropped.
pub struct Promise {
    replier: RemoteRef<ReplierInner>,
    socket: SocketId,
}

impl Promise {
    pub fn complete(self, reply: &[u8]) {
        self.complete_pieces(&[reply]);
    }

    pub fn complete_pieces(self, pieces: &[&[u8]]) {
        if self.replier.handle().is_in_loop_thread() {
            let socket = self.socket;
            self.replier.with(|inner| inner.finish_reply(socket, pieces));
            return;
        }

        let flat: Vec<u8> = pieces.concat();
        let socket = self.socket;
        let replier = self.replier.clone();
        self.replier.handle().post(move || {
            replier.with(|inner| inner.finish_reply(socket, &[&flat]));
        });
    }
}

/// Request handler: peer address, request payload, and the reply promise.
pub type RecvCallback = Arc<dyn Fn(&Endpoint, &[u8], Promise) + Send + Sync>;

/// Request/reply server: accepts framed connections and hands every
/// inbound message to the handler together with a [`Promise`].
pub struct Replier {
    owner: RemoteOwner<ReplierInner>,
}

impl Replier {
    pub fn new(handle: &LoopHandle, local: Endpoint) -> Self {
        let loop_handle = handle.clone();
        let owner = RemoteOwner::new(handle, move || ReplierInner::new(&loop_handle, local));

        let self_ref = owner.watch();
        owner.with(move |inner| {
            *inner.self_ref.borrow_mut() = Some(self_ref);
        });

        Self { owner }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.owner.handle()
    }

    /// Only while closed.
    pub fn configure(&self, config: ReplierConfig) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.config.borrow_mut() = config;
        });
    }

    pub fn set_recv_callback(
        &self,
        callback: impl Fn(&Endpoint, &[u8], Promise) + Send + Sync + 'static,
    ) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.recv_callback.borrow_mut() = Some(Arc::new(callback));
        });
    }

    /// Handlers are posted to `executor` with an owned copy of the request
    /// instead of running inline on the loop.
    pub fn set_recv_executor(&self, executor: Option<Arc<dyn Executor>>) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.recv_executor.borrow_mut() = executor;
        });
    }

    pub fn state(&self) -> EndpointState {
        self.owner.with(|inner| inner.state.get())
    }

    pub fn open(&self) -> io::Result<()> {
        self.owner
            .with(|inner| inner.open())
            .map_err(io::Error::from_raw_os_error)
    }

    /// The bound address; with a port-0 bind this carries the port the
    /// kernel picked.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.owner.with(|inner| {
            inner.acceptor.borrow().as_ref().and_then(|acceptor| acceptor.local_endpoint())
        })
    }

    pub fn num_connections(&self) -> usize {
        self.owner.with(|inner| inner.sockets.borrow().len())
    }

    pub fn close(&self) {
        self.owner.with(|inner| inner.close());
    }
}

impl Drop for Replier {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct ReplierInner {
    handle: LoopHandle,
    local: Endpoint,
    config: RefCell<ReplierConfig>,
    state: Cell<EndpointState>,
    acceptor: RefCell<Option<Rc<FramingAcceptor>>>,
    sockets: RefCell<HashMap<SocketId, Rc<FramingSocket>>>,
    token: RefCell<Option<Arc<()>>>,
    weak_self: RefCell<Weak<ReplierInner>>,
    self_ref: RefCell<Option<RemoteRef<ReplierInner>>>,
    recv_callback: RefCell<Option<RecvCallback>>,
    recv_executor: RefCell<Option<Arc<dyn Executor>>>,
}

impl ReplierInner {
    fn new(handle: &LoopHandle, local: Endpoint) -> Rc<Self> {
        let inner = Rc::new(Self {
            handle: handle.clone(),
            local,
            config: RefCell::new(ReplierConfig::default()),
            state: Cell::new(EndpointState::Closed),
            acceptor: RefCell::new(None),
            sockets: RefCell::new(HashMap::new()),
            token: RefCell::new(None),
            weak_self: RefCell::new(Weak::new()),
            self_ref: RefCell::new(None),
            recv_callback: RefCell::new(None),
            recv_executor: RefCell::new(None),
        });
        *inner.weak_self.borrow_mut() = Rc::downgrade(&inner);
        inner
    }

    fn open(&self) -> Result<(), i32> {
        assert!(self.state.get() == EndpointState::Closed);

        let config = self.config.borrow().clone();
        let acceptor = FramingAcceptor::new(&self.handle, config.framing);

        let weak = self.weak_self.borrow().clone();
        acceptor.set_accept_callback(move |socket, remote| {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            inner.on_accept(&socket, remote);
            true
        });

        acceptor.open(&self.local)?;

        *self.acceptor.borrow_mut() = Some(acceptor);
        *self.token.borrow_mut() = Some(Arc::new(()));
        self.state.set(EndpointState::Opened);
        Ok(())
    }

    fn close(&self) {
        if self.state.get() == EndpointState::Closed {
            return;
        }
        self.state.set(EndpointState::Closed);
        debug!(local = %self.local, "replier closed");

        *self.token.borrow_mut() = None;

        let acceptor = self.acceptor.borrow_mut().take();
        if let Some(acceptor) = acceptor {
            acceptor.reset();
            self.handle.post_local(move || drop(acceptor));
        }

        let sockets = std::mem::take(&mut *self.sockets.borrow_mut());
        for (_, socket) in sockets {
            socket.reset();
            self.handle.post_local(move || drop(socket));
        }
    }

    fn on_accept(&self, socket: &Rc<FramingSocket>, remote: &Endpoint) {
        if self.sockets.borrow().len() >= self.config.borrow().max_connections {
            warn!(remote = %remote, "too many connections; dropping");
            socket.reset();
            let socket = Rc::clone(socket);
            self.handle.post_local(move || drop(socket));
            return;
        }

        let id = socket.id();

        let weak = self.weak_self.borrow().clone();
        let remote = remote.clone();
        socket.add_recv_callback(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_recv(id, &remote, message);
            }
            true
        });

        let weak = self.weak_self.borrow().clone();
        socket.add_close_callback(move |_error| {
            if let Some(inner) = weak.upgrade() {
                inner.sockets.borrow_mut().remove(&id);
            }
            false
        });

        self.sockets.borrow_mut().insert(id, Rc::clone(socket));
    }

    fn on_socket_recv(&self, id: SocketId, remote: &Endpoint, message: &[u8]) {
        let callback = self.recv_callback.borrow().clone();
        let Some(callback) = callback else {
            return;
        };
        let Some(self_ref) = self.self_ref.borrow().clone() else {
            return;
        };

        let promise = Promise { replier: self_ref, socket: id };

        let executor = self.recv_executor.borrow().clone();
        match executor {
            None => callback(remote, message, promise),
            Some(executor) => {
                let Some(token) = self.token.borrow().as_ref().map(Arc::downgrade) else {
                    return;
                };
                let bytes = message.to_vec();
                let remote = remote.clone();
                executor.post(Box::new(move || {
                    if token.upgrade().is_some() {
                        callback(&remote, &bytes, promise);
                    }
                }));
            }
        }
    }

    /// Sends a completed reply back on the originating connection, or drops
    /// it when that connection is gone.
    fn finish_reply(&self, id: SocketId, pieces: &[&[u8]]) {
        let socket = self.sockets.borrow().get(&id).cloned();
        let Some(socket) = socket else {
            debug!("reply for a vanished connection dropped");
            return;
        };

        if let Err(error) = socket.send_pieces(pieces) {
            warn!(%error, "reply send failed; dropping connection");
            if let Some(socket) = self.sockets.borrow_mut().remove(&id) {
                socket.reset();
                self.handle.post_local(move || drop(socket));
            }
        }
    }
}

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    rc::{Rc, Weak},
};

use courier_net::{
    Endpoint, FramingAcceptor, FramingAcceptorConfig, FramingSocket, SocketId,
};
use courier_reactor::{LoopHandle, RemoteOwner};
use tracing::{debug, warn};

use crate::{EndpointState, server_socket_config};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Connections accepted beyond this are dropped immediately.
    pub max_connections: usize,
    pub framing: FramingAcceptorConfig,
}

impl Default for PublisherConfig {
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

impl PublisherConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_framing(mut self, framing: FramingAcceptorConfig) -> Self {
        self.framing = framing;
        self
    }
}

/// Fire-and-forget fan-out: every subscriber connection gets a copy of
/// every published message.
pub struct Publisher {
    owner: RemoteOwner<PublisherInner>,
}

impl Publisher {
    pub fn new(handle: &LoopHandle, local: Endpoint) -> Self {
        let loop_handle = handle.clone();
        let owner = RemoteOwner::new(handle, move || PublisherInner::new(&loop_handle, local));
        Self { owner }
    }

    pub fn handle(&self) -> &LoopHandle {
        self.owner.handle()
    }

    /// Only while closed.
    pub fn configure(&self, config: PublisherConfig) {
        self.owner.with(move |inner| {
            assert!(inner.state.get() == EndpointState::Closed);
            *inner.config.borrow_mut() = config;
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

    /// Broadcasts to every connected subscriber. A connection that cannot
    /// take the message is logged and left to its own close path.
    pub fn send(&self, message: &[u8]) {
        if let Some(inner) = self.owner.local() {
            inner.send(message);
            return;
        }
        let bytes = message.to_vec();
        self.owner.post(move |inner| inner.send(&bytes));
    }

    pub fn close(&self) {
        self.owner.with(|inner| inner.close());
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
    }
}

struct PublisherInner {
    handle: LoopHandle,
    local: Endpoint,
    config: RefCell<PublisherConfig>,
    state: Cell<EndpointState>,
    acceptor: RefCell<Option<Rc<FramingAcceptor>>>,
    sockets: RefCell<HashMap<SocketId, Rc<FramingSocket>>>,
    weak_self: RefCell<Weak<PublisherInner>>,
}

impl PublisherInner {
    fn new(handle: &LoopHandle, local: Endpoint) -> Rc<Self> {
        let inner = Rc::new(Self {
            handle: handle.clone(),
            local,
            config: RefCell::new(PublisherConfig::default()),
            state: Cell::new(EndpointState::Closed),
            acceptor: RefCell::new(None),
            sockets: RefCell::new(HashMap::new()),
            weak_self: RefCell::new(Weak::new()),
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
        self.state.set(EndpointState::Opened);
        Ok(())
    }

    fn close(&self) {
        if self.state.get() == EndpointState::Closed {
            return;
        }
        self.state.set(EndpointState::Closed);
        debug!(local = %self.local, "publisher closed");

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
        socket.add_close_callback(move |_error| {
            if let Some(inner) = weak.upgrade() {
                inner.sockets.borrow_mut().remove(&id);
            }
            false
        });

        self.sockets.borrow_mut().insert(id, Rc::clone(socket));
    }

    fn send(&self, message: &[u8]) {
        if self.state.get() != EndpointState::Opened {
            warn!("send on a closed publisher");
            return;
        }

        // Snapshot: a failing send may drop a connection from the set
        // mid-broadcast.
        let sockets: Vec<Rc<FramingSocket>> = self.sockets.borrow().values().cloned().collect();
        for socket in sockets {
            if let Err(error) = socket.send(message) {
                warn!(%error, "subscriber cannot take the message");
            }
        }
    }
}

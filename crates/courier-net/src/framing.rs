use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use courier_reactor::LoopHandle;
use tracing::warn;

use crate::{
    acceptor::{Acceptor, AcceptorConfig, AcceptorState},
    endpoint::Endpoint,
    socket::{SendError, Socket, SocketConfig, SocketState},
};

const LENGTH_PREFIX_SIZE: usize = size_of::<u32>();

/// Process-unique identity for a framing socket, usable as a stable map
/// key by containers that own many of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

fn next_socket_id() -> SocketId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    SocketId(NEXT.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramingConfig {
    /// Upper bound for a single message, on both directions. Must fit in
    /// the 32-bit length prefix.
    pub max_message_length: usize,
    pub socket: SocketConfig,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self { max_message_length: 8 * 1024 * 1024, socket: SocketConfig::default() }
    }
}

impl FramingConfig {
    pub fn with_max_message_length(mut self, bytes: usize) -> Self {
        assert!(u32::try_from(bytes).is_ok(), "max message length must fit in u32");
        self.max_message_length = bytes;
        self
    }

    pub fn with_socket(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }
}

/// Gets one complete inbound message.
pub type MessageCallback = Box<dyn FnMut(&[u8]) -> bool + 'static>;
/// Connect outcome callback; 0 on success.
pub type ConnectCallback = Box<dyn FnMut(i32) -> bool + 'static>;
pub type SendCompleteCallback = Box<dyn FnMut() -> bool + 'static>;
/// Close callback; errno, 0 for an orderly peer close.
pub type CloseCallback = Box<dyn FnMut(i32) -> bool + 'static>;

/// Length-prefixed framing atop [`Socket`]: every message travels as a
/// 4-byte little-endian length followed by that many payload bytes.
///
/// The state mirrors the owned socket. Loop-thread only.
pub struct FramingSocket {
    handle: LoopHandle,
    config: RefCell<FramingConfig>,
    id: SocketId,
    socket: RefCell<Option<Rc<Socket>>>,
    local_endpoint: RefCell<Option<Endpoint>>,
    remote_endpoint: RefCell<Option<Endpoint>>,
    connect_callbacks: RefCell<Vec<ConnectCallback>>,
    recv_callbacks: RefCell<Vec<MessageCallback>>,
    send_complete_callbacks: RefCell<Vec<SendCompleteCallback>>,
    close_callbacks: RefCell<Vec<CloseCallback>>,
}

impl FramingSocket {
    pub fn new(handle: &LoopHandle, config: FramingConfig) -> Rc<Self> {
        assert!(handle.is_in_loop_thread());
        assert!(u32::try_from(config.max_message_length).is_ok());

        Rc::new(Self {
            handle: handle.clone(),
            config: RefCell::new(config),
            id: next_socket_id(),
            socket: RefCell::new(None),
            local_endpoint: RefCell::new(None),
            remote_endpoint: RefCell::new(None),
            connect_callbacks: RefCell::new(Vec::new()),
            recv_callbacks: RefCell::new(Vec::new()),
            send_complete_callbacks: RefCell::new(Vec::new()),
            close_callbacks: RefCell::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn config(&self) -> FramingConfig {
        assert!(self.handle.is_in_loop_thread());

        self.config.borrow().clone()
    }

    pub fn state(&self) -> SocketState {
        assert!(self.handle.is_in_loop_thread());

        self.socket.borrow().as_ref().map_or(SocketState::Closed, |socket| socket.state())
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        assert!(self.handle.is_in_loop_thread());

        self.local_endpoint.borrow().clone()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        assert!(self.handle.is_in_loop_thread());

        self.remote_endpoint.borrow().clone()
    }

    pub fn has_connect_callbacks(&self) -> bool {
        !self.connect_callbacks.borrow().is_empty()
    }

    pub fn has_recv_callbacks(&self) -> bool {
        !self.recv_callbacks.borrow().is_empty()
    }

    pub fn has_close_callbacks(&self) -> bool {
        !self.close_callbacks.borrow().is_empty()
    }

    pub fn add_connect_callback(&self, callback: impl FnMut(i32) -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.connect_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn add_recv_callback(&self, callback: impl FnMut(&[u8]) -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.recv_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn add_send_complete_callback(&self, callback: impl FnMut() -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.send_complete_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn add_close_callback(&self, callback: impl FnMut(i32) -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.close_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn clear_connect_callbacks(&self) {
        self.connect_callbacks.borrow_mut().clear();
    }

    pub fn clear_recv_callbacks(&self) {
        self.recv_callbacks.borrow_mut().clear();
    }

    pub fn clear_send_complete_callbacks(&self) {
        self.send_complete_callbacks.borrow_mut().clear();
    }

    pub fn clear_close_callbacks(&self) {
        self.close_callbacks.borrow_mut().clear();
    }

    pub fn dispatch_connect(&self, error: i32) {
        let callbacks = std::mem::take(&mut *self.connect_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback(error) {
                self.connect_callbacks.borrow_mut().push(callback);
            }
        }
    }

    pub fn dispatch_recv(&self, message: &[u8]) {
        let callbacks = std::mem::take(&mut *self.recv_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback(message) {
                self.recv_callbacks.borrow_mut().push(callback);
            }
        }
    }

    pub fn dispatch_send_complete(&self) {
        let callbacks = std::mem::take(&mut *self.send_complete_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback() {
                self.send_complete_callbacks.borrow_mut().push(callback);
            }
        }
    }

    pub fn dispatch_close(&self, error: i32) {
        let callbacks = std::mem::take(&mut *self.close_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback(error) {
                self.close_callbacks.borrow_mut().push(callback);
            }
        }
    }

    /// Connects to `remote`. Connect callbacks fire with 0 or the errno;
    /// after a failure the socket is back in `Closed` and may be reopened.
    pub fn open(self: &Rc<Self>, remote: &Endpoint) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state() == SocketState::Closed);

        let config = self.config.borrow().clone();
        let socket = Socket::new(&self.handle, config.socket);

        let weak = Rc::downgrade(self);
        let remote_for_connect = remote.clone();
        socket.add_connect_callback(move |error| {
            if let Some(framing) = weak.upgrade() {
                framing.on_socket_connect(error, &remote_for_connect);
            }
            false
        });

        *self.socket.borrow_mut() = Some(Rc::clone(&socket));
        socket.open(remote);
    }

    /// Adopts an accepted, already-connected [`Socket`].
    pub fn open_accepted(self: &Rc<Self>, socket: Rc<Socket>, remote: &Endpoint) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state() == SocketState::Closed);
        assert!(socket.state() == SocketState::Connected);

        *self.local_endpoint.borrow_mut() = socket.local_endpoint();
        *self.remote_endpoint.borrow_mut() = Some(remote.clone());
        self.install_socket_callbacks(&socket);
        *self.socket.borrow_mut() = Some(socket);
    }

    /// Frames and queues one message.
    pub fn send(&self, message: &[u8]) -> Result<(), SendError> {
        self.send_pieces(&[message])
    }

    /// Frames the concatenation of `pieces` as one message.
    pub fn send_pieces(&self, pieces: &[&[u8]]) -> Result<(), SendError> {
        assert!(self.handle.is_in_loop_thread());

        let length: usize = pieces.iter().map(|piece| piece.len()).sum();
        assert!(
            length <= self.config.borrow().max_message_length,
            "message exceeds max message length"
        );

        let socket = self.socket.borrow().clone();
        let Some(socket) = socket.filter(|s| s.state() == SocketState::Connected) else {
            return Err(SendError::NotConnected);
        };

        let prefix = (length as u32).to_le_bytes();
        let mut wire: Vec<&[u8]> = Vec::with_capacity(1 + pieces.len());
        wire.push(&prefix);
        wire.extend_from_slice(pieces);
        socket.send_vectored(&wire)
    }

    /// Closes the transport; unless already closed, the close callbacks
    /// fire exactly once with `error`.
    pub fn close(&self, error: i32) {
        assert!(self.handle.is_in_loop_thread());

        match self.state() {
            SocketState::Closed => {}
            SocketState::Connected => {
                let socket = self.socket.borrow().clone();
                if let Some(socket) = socket {
                    // Runs on_socket_close, which does the bookkeeping.
                    socket.close(error);
                }
            }
            SocketState::Connecting => {
                // The socket close callback is only installed once
                // connected, so do its bookkeeping here.
                let socket = self.socket.borrow_mut().take();
                if let Some(socket) = socket {
                    socket.reset();
                    self.handle.post_local(move || drop(socket));
                }
                *self.local_endpoint.borrow_mut() = None;
                *self.remote_endpoint.borrow_mut() = None;
                self.dispatch_close(error);
            }
        }
    }

    /// Silent teardown: buffers, callbacks and the connection all go away
    /// without any callback firing.
    pub fn reset(&self) {
        assert!(self.handle.is_in_loop_thread());

        self.clear_connect_callbacks();
        self.clear_recv_callbacks();
        self.clear_send_complete_callbacks();
        self.clear_close_callbacks();

        let socket = self.socket.borrow_mut().take();
        if let Some(socket) = socket {
            socket.reset();
            self.handle.post_local(move || drop(socket));
        }
        *self.local_endpoint.borrow_mut() = None;
        *self.remote_endpoint.borrow_mut() = None;
    }

    fn on_socket_connect(self: &Rc<Self>, error: i32, remote: &Endpoint) {
        if error == 0 {
            let socket =
                self.socket.borrow().clone().expect("connect callback without a socket");
            *self.local_endpoint.borrow_mut() = socket.local_endpoint();
            *self.remote_endpoint.borrow_mut() = Some(remote.clone());
            self.install_socket_callbacks(&socket);
            self.dispatch_connect(0);
        } else {
            let socket = self.socket.borrow_mut().take();
            if let Some(socket) = socket {
                self.handle.post_local(move || drop(socket));
            }
            self.dispatch_connect(error);
        }
    }

    fn install_socket_callbacks(self: &Rc<Self>, socket: &Rc<Socket>) {
        let weak = Rc::downgrade(self);
        socket.add_recv_callback(move |data, new_size| {
            weak.upgrade().is_some_and(|framing| framing.on_socket_recv(data, new_size))
        });

        let weak = Rc::downgrade(self);
        socket.add_send_complete_callback(move || {
            let Some(framing) = weak.upgrade() else {
                return false;
            };
            framing.dispatch_send_complete();
            true
        });

        let weak = Rc::downgrade(self);
        socket.add_close_callback(move |error, _unsent| {
            let Some(framing) = weak.upgrade() else {
                return false;
            };
            framing.on_socket_close(error);
            false
        });
    }

    /// Slices the byte stream into complete frames, reporting the residual
    /// partial frame back to the socket buffer.
    fn on_socket_recv(self: &Rc<Self>, data: &[u8], new_size: &mut usize) -> bool {
        let max_message_length = self.config.borrow().max_message_length;
        let mut rest = data;

        loop {
            if rest.len() < LENGTH_PREFIX_SIZE {
                break;
            }
            let length =
                u32::from_le_bytes(rest[..LENGTH_PREFIX_SIZE].try_into().unwrap()) as usize;
            if length > max_message_length {
                warn!(length, max_message_length, "inbound message too long");
                self.close(libc::EMSGSIZE);
                return false;
            }
            if rest.len() < LENGTH_PREFIX_SIZE + length {
                break;
            }

            self.dispatch_recv(&rest[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length]);
            if self.state() != SocketState::Connected {
                // A recv callback closed us mid-stream.
                return false;
            }
            rest = &rest[LENGTH_PREFIX_SIZE + length..];
        }

        *new_size = rest.len();
        true
    }

    fn on_socket_close(&self, error: i32) {
        let socket = self.socket.borrow_mut().take();
        if let Some(socket) = socket {
            self.handle.post_local(move || drop(socket));
        }
        *self.local_endpoint.borrow_mut() = None;
        *self.remote_endpoint.borrow_mut() = None;

        self.dispatch_close(error);
    }
}

/// Acceptor that wraps each accepted connection in a [`FramingSocket`].
pub struct FramingAcceptor {
    handle: LoopHandle,
    config: RefCell<FramingAcceptorConfig>,
    acceptor: RefCell<Option<Rc<Acceptor>>>,
    accept_callback: RefCell<Option<FrameAcceptCallback>>,
}

/// Gets each accepted [`FramingSocket`] and the peer address; returning
/// `false` uninstalls the callback.
pub type FrameAcceptCallback = Box<dyn FnMut(Rc<FramingSocket>, &Endpoint) -> bool + 'static>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramingAcceptorConfig {
    pub max_message_length: usize,
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub socket: SocketConfig,
}

impl Default for FramingAcceptorConfig {
    fn default() -> Self {
        Self {
            max_message_length: 8 * 1024 * 1024,
            reuse_addr: true,
            reuse_port: false,
            socket: SocketConfig::default(),
        }
    }
}

impl FramingAcceptorConfig {
    pub fn with_max_message_length(mut self, bytes: usize) -> Self {
        assert!(u32::try_from(bytes).is_ok(), "max message length must fit in u32");
        self.max_message_length = bytes;
        self
    }

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

impl FramingAcceptor {
    pub fn new(handle: &LoopHandle, config: FramingAcceptorConfig) -> Rc<Self> {
        assert!(handle.is_in_loop_thread());

        Rc::new(Self {
            handle: handle.clone(),
            config: RefCell::new(config),
            acceptor: RefCell::new(None),
            accept_callback: RefCell::new(None),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn state(&self) -> AcceptorState {
        assert!(self.handle.is_in_loop_thread());

        self.acceptor.borrow().as_ref().map_or(AcceptorState::Closed, |acceptor| acceptor.state())
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        assert!(self.handle.is_in_loop_thread());

        self.acceptor.borrow().as_ref().and_then(|acceptor| acceptor.local_endpoint())
    }

    /// Installs the accept callback, replacing any previous one.
    pub fn set_accept_callback(
        &self,
        callback: impl FnMut(Rc<FramingSocket>, &Endpoint) -> bool + 'static,
    ) {
        assert!(self.handle.is_in_loop_thread());

        *self.accept_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn dispatch_accept(&self, socket: Rc<FramingSocket>, remote: &Endpoint) {
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

    pub fn open(self: &Rc<Self>, local: &Endpoint) -> Result<(), i32> {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state() == AcceptorState::Closed);

        let config = self.config.borrow().clone();
        let acceptor = Acceptor::new(
            &self.handle,
            AcceptorConfig {
                reuse_addr: config.reuse_addr,
                reuse_port: config.reuse_port,
                socket: config.socket,
            },
        );

        let weak = Rc::downgrade(self);
        acceptor.set_accept_callback(move |socket, remote| {
            let Some(framing_acceptor) = weak.upgrade() else {
                return false;
            };
            framing_acceptor.on_accept(socket, remote);
            true
        });

        acceptor.open(local)?;
        *self.acceptor.borrow_mut() = Some(acceptor);
        Ok(())
    }

    pub fn close(&self) {
        assert!(self.handle.is_in_loop_thread());

        let acceptor = self.acceptor.borrow_mut().take();
        if let Some(acceptor) = acceptor {
            acceptor.reset();
            self.handle.post_local(move || drop(acceptor));
        }
    }

    /// Like [`close`](Self::close) but also forgets the accept callback.
    pub fn reset(&self) {
        assert!(self.handle.is_in_loop_thread());

        *self.accept_callback.borrow_mut() = None;
        self.close();
    }

    fn on_accept(self: &Rc<Self>, socket: Rc<Socket>, remote: &Endpoint) {
        let config = self.config.borrow().clone();
        let framing = FramingSocket::new(
            &self.handle,
            FramingConfig { max_message_length: config.max_message_length, socket: config.socket },
        );
        framing.open_accepted(socket, remote);
        self.dispatch_accept(framing, remote);
    }
}

use std::{
    cell::{Cell, RefCell},
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

use courier_reactor::{LoopHandle, Timer, Watcher};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{buffer::Buffer, endpoint::Endpoint, sys, sys::ConnectOutcome};

/// TCP keep-alive probing; all-zero means disabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeepAlive {
    pub idle: Duration,
    pub interval: Duration,
    pub count: u32,
}

impl KeepAlive {
    pub fn new(idle: Duration, interval: Duration, count: u32) -> Self {
        Self { idle, interval, count }
    }

    pub fn is_enabled(&self) -> bool {
        !self.idle.is_zero() && !self.interval.is_zero() && self.count != 0
    }
}

/// Socket tuning, applied while the socket is closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketConfig {
    pub recv_buffer_max_capacity: usize,
    pub send_buffer_max_capacity: usize,
    pub recv_chunk_size: usize,
    /// Zero disables idle detection.
    pub recv_timeout: Duration,
    pub send_timeout: Duration,
    /// Kernel-level SO_RCVBUF / SO_SNDBUF overrides.
    pub rcv_buf: Option<i32>,
    pub snd_buf: Option<i32>,
    pub no_delay: bool,
    pub keep_alive: KeepAlive,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_max_capacity: 16 * 1024 * 1024,
            send_buffer_max_capacity: 16 * 1024 * 1024,
            recv_chunk_size: 4096,
            recv_timeout: Duration::ZERO,
            send_timeout: Duration::ZERO,
            rcv_buf: None,
            snd_buf: None,
            no_delay: false,
            keep_alive: KeepAlive::default(),
        }
    }
}

impl SocketConfig {
    pub fn with_recv_buffer_max_capacity(mut self, bytes: usize) -> Self {
        self.recv_buffer_max_capacity = bytes;
        self
    }

    pub fn with_send_buffer_max_capacity(mut self, bytes: usize) -> Self {
        self.send_buffer_max_capacity = bytes;
        self
    }

    pub fn with_recv_chunk_size(mut self, bytes: usize) -> Self {
        self.recv_chunk_size = bytes;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_rcv_buf(mut self, bytes: i32) -> Self {
        self.rcv_buf = Some(bytes);
        self
    }

    pub fn with_snd_buf(mut self, bytes: i32) -> Self {
        self.snd_buf = Some(bytes);
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Connecting,
    Connected,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("send buffer capacity exceeded")]
    BufferFull,
}

impl SendError {
    pub fn errno(self) -> i32 {
        match self {
            Self::NotConnected => libc::ENOTCONN,
            Self::BufferFull => libc::ENOBUFS,
        }
    }
}

/// Connect outcome callback; gets 0 on success, the errno otherwise.
pub type ConnectCallback = Box<dyn FnMut(i32) -> bool + 'static>;
/// Gets the buffered window and writes back how many bytes remain
/// unconsumed.
pub type RecvCallback = Box<dyn FnMut(&[u8], &mut usize) -> bool + 'static>;
pub type SendCompleteCallback = Box<dyn FnMut() -> bool + 'static>;
/// Gets the errno (0 for an orderly peer close) and the unsent residue.
pub type CloseCallback = Box<dyn FnMut(i32, &[u8]) -> bool + 'static>;

/// Buffered, non-blocking stream socket with a connect/recv/send/close
/// lifecycle.
///
/// All methods are loop-thread only. Readiness is dispatched edge-style:
/// each edge drains the kernel until it would block, which is what arms the
/// next edge.
pub struct Socket {
    handle: LoopHandle,
    config: RefCell<SocketConfig>,
    state: Cell<SocketState>,
    fd: Cell<RawFd>,
    watcher: RefCell<Option<Rc<Watcher>>>,
    local_endpoint: RefCell<Option<Endpoint>>,
    remote_endpoint: RefCell<Option<Endpoint>>,
    recv_buffer: RefCell<Buffer>,
    send_buffer: RefCell<Buffer>,
    recv_timer: RefCell<Option<Rc<Timer>>>,
    send_timer: RefCell<Option<Rc<Timer>>>,
    recv_active: Cell<bool>,
    send_active: Cell<bool>,
    connect_callbacks: RefCell<Vec<ConnectCallback>>,
    recv_callbacks: RefCell<Vec<RecvCallback>>,
    send_complete_callbacks: RefCell<Vec<SendCompleteCallback>>,
    close_callbacks: RefCell<Vec<CloseCallback>>,
}

impl Socket {
    pub fn new(handle: &LoopHandle, config: SocketConfig) -> Rc<Self> {
        assert!(handle.is_in_loop_thread());

        Rc::new(Self {
            handle: handle.clone(),
            config: RefCell::new(config),
            state: Cell::new(SocketState::Closed),
            fd: Cell::new(-1),
            watcher: RefCell::new(None),
            local_endpoint: RefCell::new(None),
            remote_endpoint: RefCell::new(None),
            recv_buffer: RefCell::new(Buffer::default()),
            send_buffer: RefCell::new(Buffer::default()),
            recv_timer: RefCell::new(None),
            send_timer: RefCell::new(None),
            recv_active: Cell::new(false),
            send_active: Cell::new(false),
            connect_callbacks: RefCell::new(Vec::new()),
            recv_callbacks: RefCell::new(Vec::new()),
            send_complete_callbacks: RefCell::new(Vec::new()),
            close_callbacks: RefCell::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn config(&self) -> SocketConfig {
        assert!(self.handle.is_in_loop_thread());

        self.config.borrow().clone()
    }

    pub fn configure(&self, config: SocketConfig) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == SocketState::Closed, "configured while open");

        *self.config.borrow_mut() = config;
    }

    pub fn state(&self) -> SocketState {
        assert!(self.handle.is_in_loop_thread());

        self.state.get()
    }

    pub fn fd(&self) -> RawFd {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() != SocketState::Closed);

        self.fd.get()
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

    pub fn has_send_complete_callbacks(&self) -> bool {
        !self.send_complete_callbacks.borrow().is_empty()
    }

    pub fn has_close_callbacks(&self) -> bool {
        !self.close_callbacks.borrow().is_empty()
    }

    pub fn add_connect_callback(&self, callback: impl FnMut(i32) -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.connect_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn add_recv_callback(&self, callback: impl FnMut(&[u8], &mut usize) -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.recv_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn add_send_complete_callback(&self, callback: impl FnMut() -> bool + 'static) {
        assert!(self.handle.is_in_loop_thread());

        self.send_complete_callbacks.borrow_mut().push(Box::new(callback));
    }

    pub fn add_close_callback(&self, callback: impl FnMut(i32, &[u8]) -> bool + 'static) {
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

    pub fn dispatch_recv(&self, data: &[u8], new_size: &mut usize) {
        let callbacks = std::mem::take(&mut *self.recv_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback(data, new_size) {
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

    pub fn dispatch_close(&self, error: i32, unsent: &[u8]) {
        let callbacks = std::mem::take(&mut *self.close_callbacks.borrow_mut());
        for mut callback in callbacks {
            if callback(error, unsent) {
                self.close_callbacks.borrow_mut().push(callback);
            }
        }
    }

    /// Creates the fd, applies options and starts connecting. The connect
    /// callbacks fire with 0 on success (possibly synchronously) or with
    /// the errno on failure.
    pub fn open(self: &Rc<Self>, remote: &Endpoint) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == SocketState::Closed);

        let config = self.config.borrow().clone();
        let fd = sys::stream_socket(remote.domain());
        debug!(fd, remote = %remote, "opening");

        if let Some(bytes) = config.rcv_buf {
            sys::set_rcv_buf(fd, bytes);
        }
        if let Some(bytes) = config.snd_buf {
            sys::set_snd_buf(fd, bytes);
        }
        if remote.is_inet() {
            if config.no_delay {
                sys::set_no_delay(fd);
            }
            if config.keep_alive.is_enabled() {
                sys::set_keep_alive(fd, &config.keep_alive);
            }
        }

        self.recv_buffer.borrow_mut().set_max_capacity(config.recv_buffer_max_capacity);
        self.send_buffer.borrow_mut().set_max_capacity(config.send_buffer_max_capacity);
        self.fd.set(fd);

        let watcher = Watcher::new(&self.handle, fd);
        watcher.register_self();
        *self.watcher.borrow_mut() = Some(Rc::clone(&watcher));

        match sys::connect(fd, remote) {
            ConnectOutcome::Connected => self.finish_connect(remote.clone()),
            ConnectOutcome::InProgress => {
                debug!(fd, "connect in progress");
                self.state.set(SocketState::Connecting);

                let weak = Rc::downgrade(self);
                let remote = remote.clone();
                watcher.add_write_callback(move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.on_connect_writable(&remote);
                    }
                    false
                });
            }
            ConnectOutcome::Failed(errno) => {
                warn!(fd, error = %sys::errno_string(errno), "connect failed");
                self.release_fd();
                self.dispatch_connect(errno);
            }
        }
    }

    /// Adopts an already-connected fd (from an acceptor) straight into
    /// `Connected`.
    pub fn open_accepted(self: &Rc<Self>, fd: RawFd, remote: &Endpoint) {
        assert!(self.handle.is_in_loop_thread());
        assert!(self.state.get() == SocketState::Closed);
        assert!(sys::is_stream_socket(fd), "adopted fd is not a stream socket");

        let config = self.config.borrow().clone();
        if remote.is_inet() {
            if config.no_delay {
                sys::set_no_delay(fd);
            }
            if config.keep_alive.is_enabled() {
                sys::set_keep_alive(fd, &config.keep_alive);
            }
        }

        self.recv_buffer.borrow_mut().set_max_capacity(config.recv_buffer_max_capacity);
        self.send_buffer.borrow_mut().set_max_capacity(config.send_buffer_max_capacity);
        self.fd.set(fd);

        let watcher = Watcher::new(&self.handle, fd);
        watcher.register_self();
        *self.watcher.borrow_mut() = Some(watcher);

        self.finish_connect(remote.clone());
    }

    /// Queues `data` for transmission, writing as much as possible
    /// immediately when nothing is queued ahead of it.
    pub fn send(self: &Rc<Self>, data: &[u8]) -> Result<(), SendError> {
        assert!(self.handle.is_in_loop_thread());

        if self.state.get() != SocketState::Connected {
            return Err(SendError::NotConnected);
        }
        if data.is_empty() {
            self.dispatch_send_complete();
            return Ok(());
        }

        {
            let buffer = self.send_buffer.borrow();
            if buffer.max_capacity() - buffer.len() < data.len() {
                return Err(SendError::BufferFull);
            }
        }

        let mut offset = 0;
        if self.send_buffer.borrow().is_empty() {
            let fd = self.fd.get();
            while offset < data.len() {
                match sys::send(fd, &data[offset..]) {
                    Ok(0) => break,
                    Ok(n) => offset += n,
                    Err(errno) if errno == libc::EINTR => {}
                    Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => break,
                    Err(errno) => {
                        debug!(error = %sys::errno_string(errno), "send failed");
                        self.close(errno);
                        return Ok(());
                    }
                }
            }
        }

        if offset < data.len() {
            self.enqueue_residue(&[&data[offset..]]);
        }

        Ok(())
    }

    /// Scatter variant of [`send`](Self::send); the pieces land on the wire
    /// back to back.
    pub fn send_vectored(self: &Rc<Self>, pieces: &[&[u8]]) -> Result<(), SendError> {
        assert!(self.handle.is_in_loop_thread());

        if self.state.get() != SocketState::Connected {
            return Err(SendError::NotConnected);
        }

        let total: usize = pieces.iter().map(|piece| piece.len()).sum();
        if total == 0 {
            self.dispatch_send_complete();
            return Ok(());
        }

        {
            let buffer = self.send_buffer.borrow();
            if buffer.max_capacity() - buffer.len() < total {
                return Err(SendError::BufferFull);
            }
        }

        let mut offset = 0;
        if self.send_buffer.borrow().is_empty() {
            let fd = self.fd.get();
            loop {
                match sys::send_vectored(fd, pieces) {
                    Ok(n) => offset = n,
                    Err(errno) if errno == libc::EINTR => continue,
                    Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => {}
                    Err(errno) => {
                        debug!(error = %sys::errno_string(errno), "send failed");
                        self.close(errno);
                        return Ok(());
                    }
                }
                break;
            }
        }

        if offset < total {
            let mut skip = offset;
            let mut residue: Vec<&[u8]> = Vec::with_capacity(pieces.len());
            for piece in pieces {
                if skip >= piece.len() {
                    skip -= piece.len();
                } else {
                    residue.push(&piece[skip..]);
                    skip = 0;
                }
            }
            self.enqueue_residue(&residue);
        }

        Ok(())
    }

    /// Transitions to `Closed`, tears the fd down through the loop, and
    /// fires the close callbacks with `error` and the unsent residue.
    pub fn close(&self, error: i32) {
        assert!(self.handle.is_in_loop_thread());

        if self.state.get() == SocketState::Closed {
            return;
        }
        if let Some(remote) = self.remote_endpoint.borrow().as_ref() {
            info!(remote = %remote, error = %sys::errno_string(error), "closing connection");
        }
        self.state.set(SocketState::Closed);

        self.teardown();

        let unsent = std::mem::take(&mut *self.send_buffer.borrow_mut());
        self.dispatch_close(error, unsent.data());
        self.recv_buffer.borrow_mut().clear();
    }

    /// Like [`close`](Self::close) but silent: buffers and user callbacks
    /// are discarded and no close callback fires.
    pub fn reset(&self) {
        assert!(self.handle.is_in_loop_thread());

        self.recv_buffer.borrow_mut().clear();
        self.send_buffer.borrow_mut().clear();
        self.clear_connect_callbacks();
        self.clear_recv_callbacks();
        self.clear_send_complete_callbacks();
        self.clear_close_callbacks();

        if self.state.get() == SocketState::Closed {
            return;
        }
        self.state.set(SocketState::Closed);

        self.teardown();
    }

    fn teardown(&self) {
        if let Some(timer) = self.recv_timer.borrow_mut().take() {
            timer.reset();
        }
        if let Some(timer) = self.send_timer.borrow_mut().take() {
            timer.reset();
        }

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
        *self.remote_endpoint.borrow_mut() = None;
    }

    fn release_fd(&self) {
        // Failed connect: the fd never reached Connected, so there is no
        // close dispatch — just unhook and close it through the loop.
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
    }

    fn finish_connect(self: &Rc<Self>, remote: Endpoint) {
        let fd = self.fd.get();
        *self.local_endpoint.borrow_mut() = sys::local_endpoint(fd);
        *self.remote_endpoint.borrow_mut() = Some(remote);

        self.state.set(SocketState::Connected);
        if let Some(remote) = self.remote_endpoint.borrow().as_ref() {
            info!(remote = %remote, "connected");
        }

        self.dispatch_connect(0);
        if self.state.get() != SocketState::Connected {
            // A connect callback closed the socket again.
            return;
        }

        let watcher =
            Rc::clone(self.watcher.borrow().as_ref().expect("connected socket without watcher"));
        let weak = Rc::downgrade(self);
        watcher.add_read_callback(move || weak.upgrade().is_some_and(|s| s.on_read_ready()));

        let config = self.config.borrow().clone();
        if !config.recv_timeout.is_zero() {
            let timer = Timer::new(&self.handle);
            let weak = Rc::downgrade(self);
            timer.add_expire_callback(move || {
                weak.upgrade().is_some_and(|s| s.on_recv_timer_expire())
            });
            timer.open();
            timer.set_time(config.recv_timeout, config.recv_timeout);
            *self.recv_timer.borrow_mut() = Some(timer);
        }
        if !config.send_timeout.is_zero() {
            let timer = Timer::new(&self.handle);
            let weak = Rc::downgrade(self);
            timer.add_expire_callback(move || {
                weak.upgrade().is_some_and(|s| s.on_send_timer_expire())
            });
            timer.open();
            timer.set_time(config.send_timeout, config.send_timeout);
            *self.send_timer.borrow_mut() = Some(timer);
        }
    }

    fn on_connect_writable(self: &Rc<Self>, remote: &Endpoint) {
        let errno = sys::take_error(self.fd.get());
        if errno == 0 {
            self.finish_connect(remote.clone());
        } else {
            warn!(error = %sys::errno_string(errno), "connect failed");
            self.state.set(SocketState::Closed);
            self.release_fd();
            self.dispatch_connect(errno);
        }
    }

    fn enqueue_residue(self: &Rc<Self>, pieces: &[&[u8]]) {
        let was_empty = self.send_buffer.borrow().is_empty();
        {
            let mut buffer = self.send_buffer.borrow_mut();
            for piece in pieces {
                buffer.push_back(piece);
            }
        }

        if was_empty {
            let watcher = Rc::clone(
                self.watcher.borrow().as_ref().expect("connected socket without watcher"),
            );
            let weak = Rc::downgrade(self);
            watcher.add_write_callback(move || weak.upgrade().is_some_and(|s| s.on_write_ready()));
        }
    }

    /// Drains the kernel into the recv buffer until it would block,
    /// handing each chunk to the recv callbacks as it lands.
    fn on_read_ready(self: &Rc<Self>) -> bool {
        loop {
            if self.state.get() != SocketState::Connected {
                return false;
            }

            let fd = self.fd.get();
            let (chunk, start) = {
                let mut buffer = self.recv_buffer.borrow_mut();
                let len = buffer.len();
                if len == buffer.max_capacity() {
                    drop(buffer);
                    warn!("recv buffer full");
                    self.close(libc::ENOBUFS);
                    return false;
                }
                let chunk = self
                    .config
                    .borrow()
                    .recv_chunk_size
                    .min(buffer.max_capacity() - len);
                buffer.extend_back(chunk);
                (chunk, len)
            };

            let received = {
                let mut buffer = self.recv_buffer.borrow_mut();
                let result = sys::recv(fd, &mut buffer.data_mut()[start..start + chunk]);
                // Trim the provisional tail down to what actually arrived.
                buffer.retract_back(chunk - *result.as_ref().unwrap_or(&0));
                result
            };

            match received {
                Ok(0) => {
                    self.close(0);
                    return false;
                }
                Ok(_) => {
                    let mut buffer = std::mem::take(&mut *self.recv_buffer.borrow_mut());
                    let size = buffer.len();
                    let mut new_size = size;
                    self.dispatch_recv(buffer.data(), &mut new_size);

                    if self.state.get() != SocketState::Connected {
                        // A recv callback closed the socket; the buffered
                        // bytes die with it.
                        return false;
                    }
                    if new_size < size {
                        buffer.retract_front(size - new_size);
                        self.recv_active.set(true);
                    }
                    *self.recv_buffer.borrow_mut() = buffer;
                }
                Err(errno) if errno == libc::EINTR => {}
                Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => {
                    return true;
                }
                Err(errno) => {
                    debug!(error = %sys::errno_string(errno), "recv failed");
                    self.close(errno);
                    return false;
                }
            }
        }
    }

    /// Flushes the send buffer until drained or the kernel blocks;
    /// disarms itself (returns false) once drained.
    fn on_write_ready(self: &Rc<Self>) -> bool {
        loop {
            if self.state.get() != SocketState::Connected {
                return false;
            }

            if !self.send_buffer.borrow().is_empty() {
                let fd = self.fd.get();
                let result = {
                    let buffer = self.send_buffer.borrow();
                    sys::send(fd, buffer.data())
                };
                match result {
                    Ok(n) => {
                        self.send_buffer.borrow_mut().retract_front(n);
                        self.send_active.set(true);
                    }
                    Err(errno) if errno == libc::EINTR => {}
                    Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => {
                        self.send_active.set(true);
                        return true;
                    }
                    Err(errno) => {
                        debug!(error = %sys::errno_string(errno), "send failed");
                        self.close(errno);
                        return false;
                    }
                }
            }

            if self.send_buffer.borrow().is_empty() {
                self.dispatch_send_complete();
                self.send_active.set(true);
                return false;
            }
        }
    }

    fn on_recv_timer_expire(&self) -> bool {
        if !self.recv_buffer.borrow().is_empty() && !self.recv_active.get() {
            warn!("recv timed out");
            self.close(libc::ETIMEDOUT);
            return false;
        }
        self.recv_active.set(false);
        true
    }

    fn on_send_timer_expire(&self) -> bool {
        if !self.send_buffer.borrow().is_empty() && !self.send_active.get() {
            warn!("send timed out");
            self.close(libc::ETIMEDOUT);
            return false;
        }
        self.send_active.set(false);
        true
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        courier_reactor::safe_assert!(
            self.state.get() == SocketState::Closed,
            "socket dropped while open"
        );
    }
}

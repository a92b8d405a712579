use std::{rc::Rc, time::Duration};

use crate::{
    endpoint::Endpoint,
    framing::FramingSocket,
    socket::{Socket, SocketState},
};

/// Opens `socket` towards `remote` and keeps it connected: a failed
/// connect or a close schedules a reopen after `interval`.
///
/// A [`FramingSocket::reset`] counts as a user close — it clears the
/// reconnect callbacks, so no further reopen fires. Loop-thread only.
pub fn enable_auto_reconnect_and_open(
    socket: &Rc<FramingSocket>,
    remote: &Endpoint,
    interval: Duration,
) {
    assert!(socket.handle().is_in_loop_thread());
    assert!(!interval.is_zero(), "auto-reconnect needs a non-zero interval");

    let weak = Rc::downgrade(socket);
    let remote_on_error = remote.clone();
    socket.add_connect_callback(move |error| {
        if error != 0 {
            if let Some(socket) = weak.upgrade() {
                schedule_reopen(&socket, &remote_on_error, interval);
            }
        }
        true
    });

    let weak = Rc::downgrade(socket);
    let remote_on_close = remote.clone();
    socket.add_close_callback(move |_error| {
        if let Some(socket) = weak.upgrade() {
            schedule_reopen(&socket, &remote_on_close, interval);
        }
        true
    });

    socket.open(remote);
}

/// [`Socket`]-level variant of [`enable_auto_reconnect_and_open`].
pub fn enable_socket_auto_reconnect_and_open(
    socket: &Rc<Socket>,
    remote: &Endpoint,
    interval: Duration,
) {
    assert!(socket.handle().is_in_loop_thread());
    assert!(!interval.is_zero(), "auto-reconnect needs a non-zero interval");

    let weak = Rc::downgrade(socket);
    let remote_on_error = remote.clone();
    socket.add_connect_callback(move |error| {
        if error != 0 {
            if let Some(socket) = weak.upgrade() {
                schedule_socket_reopen(&socket, &remote_on_error, interval);
            }
        }
        true
    });

    let weak = Rc::downgrade(socket);
    let remote_on_close = remote.clone();
    socket.add_close_callback(move |_error, _unsent| {
        if let Some(socket) = weak.upgrade() {
            schedule_socket_reopen(&socket, &remote_on_close, interval);
        }
        true
    });

    socket.open(remote);
}

fn schedule_socket_reopen(socket: &Rc<Socket>, remote: &Endpoint, interval: Duration) {
    let weak = Rc::downgrade(socket);
    let remote = remote.clone();
    socket.handle().post_timed_local(
        move || {
            if let Some(socket) = weak.upgrade() {
                if socket.state() == SocketState::Closed && socket.has_connect_callbacks() {
                    socket.open(&remote);
                }
            }
            Duration::ZERO
        },
        interval,
    );
}

fn schedule_reopen(socket: &Rc<FramingSocket>, remote: &Endpoint, interval: Duration) {
    let weak = Rc::downgrade(socket);
    let remote = remote.clone();
    socket.handle().post_timed_local(
        move || {
            if let Some(socket) = weak.upgrade() {
                // A reset in the meantime cleared the connect callbacks;
                // that is a user close, so stay down.
                if socket.state() == SocketState::Closed && socket.has_connect_callbacks() {
                    socket.open(&remote);
                }
            }
            Duration::ZERO
        },
        interval,
    );
}

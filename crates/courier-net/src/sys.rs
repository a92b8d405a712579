//! Thin libc shims. Anything that can only fail through programmer error
//! asserts; anything the peer or the kernel can legitimately refuse
//! returns the raw errno for the caller's state machine.

use std::{io, os::fd::RawFd};

use crate::{endpoint::Endpoint, socket::KeepAlive};

pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub(crate) fn errno_string(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}

pub(crate) fn stream_socket(domain: libc::c_int) -> RawFd {
    let fd = unsafe {
        libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    };
    assert!(fd >= 0, "socket() failed: {}", io::Error::last_os_error());
    fd
}

pub(crate) fn close(fd: RawFd) {
    let rc = unsafe { libc::close(fd) };
    courier_reactor::safe_assert!(rc == 0, "close({fd}) failed: {}", io::Error::last_os_error());
}

pub(crate) enum ConnectOutcome {
    Connected,
    InProgress,
    Failed(i32),
}

pub(crate) fn connect(fd: RawFd, remote: &Endpoint) -> ConnectOutcome {
    let (storage, len) = remote.to_raw();
    let rc = unsafe { libc::connect(fd, (&raw const storage).cast(), len) };
    if rc == 0 {
        return ConnectOutcome::Connected;
    }
    match last_errno() {
        libc::EINPROGRESS => ConnectOutcome::InProgress,
        errno => ConnectOutcome::Failed(errno),
    }
}

pub(crate) fn bind(fd: RawFd, local: &Endpoint) -> Result<(), i32> {
    let (storage, len) = local.to_raw();
    let rc = unsafe { libc::bind(fd, (&raw const storage).cast(), len) };
    if rc == 0 { Ok(()) } else { Err(last_errno()) }
}

pub(crate) fn listen(fd: RawFd) -> Result<(), i32> {
    let rc = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if rc == 0 { Ok(()) } else { Err(last_errno()) }
}

pub(crate) enum AcceptOutcome {
    Accepted(RawFd, Option<Endpoint>),
    WouldBlock,
    Failed(i32),
}

pub(crate) fn accept(fd: RawFd) -> AcceptOutcome {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let accepted = unsafe {
        libc::accept4(
            fd,
            (&raw mut storage).cast(),
            &raw mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if accepted >= 0 {
        return AcceptOutcome::Accepted(accepted, Endpoint::from_raw(&storage, len));
    }
    match last_errno() {
        libc::EAGAIN | libc::EINTR => AcceptOutcome::WouldBlock,
        errno => AcceptOutcome::Failed(errno),
    }
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, i32> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n >= 0 { Ok(n as usize) } else { Err(last_errno()) }
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> Result<usize, i32> {
    let n = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
    if n >= 0 { Ok(n as usize) } else { Err(last_errno()) }
}

pub(crate) fn send_vectored(fd: RawFd, bufs: &[&[u8]]) -> Result<usize, i32> {
    let mut iov: Vec<libc::iovec> = bufs
        .iter()
        .map(|buf| libc::iovec {
            iov_base: buf.as_ptr().cast_mut().cast(),
            iov_len: buf.len(),
        })
        .collect();

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len();

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if n >= 0 { Ok(n as usize) } else { Err(last_errno()) }
}

pub(crate) fn local_endpoint(fd: RawFd) -> Option<Endpoint> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, (&raw mut storage).cast(), &raw mut len) };
    if rc != 0 {
        return None;
    }
    Endpoint::from_raw(&storage, len)
}

/// Reads and clears the pending socket error.
pub(crate) fn take_error(fd: RawFd) -> i32 {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut value).cast(),
            &raw mut len,
        )
    };
    assert!(rc == 0, "getsockopt(SO_ERROR) failed: {}", io::Error::last_os_error());
    value
}

pub(crate) fn is_stream_socket(fd: RawFd) -> bool {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&raw mut value).cast(),
            &raw mut len,
        )
    };
    rc == 0 && value == libc::SOCK_STREAM
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&raw const value).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    assert!(rc == 0, "setsockopt({level}, {name}) failed: {}", io::Error::last_os_error());
}

pub(crate) fn set_reuse_addr(fd: RawFd) {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
}

pub(crate) fn set_reuse_port(fd: RawFd) {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1);
}

pub(crate) fn set_rcv_buf(fd: RawFd, size: i32) {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size);
}

pub(crate) fn set_snd_buf(fd: RawFd, size: i32) {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size);
}

pub(crate) fn set_no_delay(fd: RawFd) {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
}

pub(crate) fn set_keep_alive(fd: RawFd, keep_alive: &KeepAlive) {
    if keep_alive.is_enabled() {
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, keep_alive.idle.as_secs() as i32);
        set_int_opt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            keep_alive.interval.as_secs() as i32,
        );
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, keep_alive.count as i32);
    } else {
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 0);
    }
}

use std::{io, os::fd::RawFd, time::Duration};

fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: i64::from(duration.subsec_nanos()) as libc::c_long,
    }
}

pub(crate) fn timerfd_create() -> RawFd {
    let fd = unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    };
    assert!(fd >= 0, "timerfd_create failed: {}", io::Error::last_os_error());
    fd
}

/// Arms `fd` to first fire after `delay`, then every `interval`.
/// A zero `interval` makes it one-shot; a zero `delay` disarms it.
pub(crate) fn timerfd_settime(fd: RawFd, delay: Duration, interval: Duration) {
    let spec =
        libc::itimerspec { it_interval: timespec(interval), it_value: timespec(delay) };
    let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
    assert!(rc == 0, "timerfd_settime failed: {}", io::Error::last_os_error());
}

/// Reads the expiration count so the fd stops signalling readiness.
pub(crate) fn timerfd_drain(fd: RawFd) {
    let mut expirations: u64 = 0;
    unsafe {
        libc::read(fd, (&raw mut expirations).cast::<libc::c_void>(), 8);
    }
}

pub(crate) fn close_fd(fd: RawFd) {
    let rc = unsafe { libc::close(fd) };
    crate::safe_assert!(rc == 0, "close({fd}) failed: {}", io::Error::last_os_error());
}

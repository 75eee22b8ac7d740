//! Per-worker listener setup and accepted-socket tuning.
//!
//! Every worker binds its own listening socket to the same port with
//! SO_REUSEPORT; the kernel distributes inbound connections across the
//! workers with no shared accept path. Startup-only code: normal blocking
//! syscalls are fine here.

use ringserv_core::error::{Result, ServError};
use std::os::unix::io::RawFd;

fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn fail(fd: RawFd, e: std::io::Error) -> ServError {
    unsafe { libc::close(fd) };
    ServError::ListenerSetup(e)
}

/// Create a non-blocking listening socket on `0.0.0.0:port`.
///
/// SO_REUSEADDR + SO_REUSEPORT so every worker can bind the same port;
/// TCP_DEFER_ACCEPT so accepts complete once data is likely pending.
pub fn bind_listener(port: u16, backlog: i32) -> Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(ServError::ListenerSetup(std::io::Error::last_os_error()));
    }

    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).map_err(|e| fail(fd, e))?;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1).map_err(|e| fail(fd, e))?;
    // Best-effort; absent on some configs.
    let _ = setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1);

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(fail(fd, std::io::Error::last_os_error()));
    }

    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(fail(fd, std::io::Error::last_os_error()));
    }

    Ok(fd)
}

/// The port a listener actually bound. Needed when `bind_listener` was
/// given port 0 (tests).
pub fn local_port(fd: RawFd) -> Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return Err(ServError::Os(
            std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        ));
    }
    Ok(u16::from_be(addr.sin_port))
}

/// Tune a freshly accepted socket. Best-effort: a connection that rejects
/// an option still gets served.
///
/// TCP_NODELAY for response latency, larger kernel buffers so batching
/// happens in the kernel rather than in us.
pub fn tune_socket(fd: RawFd) {
    let _ = setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
    let _ = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, 512 * 1024);
    let _ = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, 256 * 1024);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let fd = bind_listener(0, 128).unwrap();
        let port = local_port(fd).unwrap();
        assert!(port > 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_reuseport_allows_two_binds() {
        let a = bind_listener(0, 128).unwrap();
        let port = local_port(a).unwrap();
        // Second listener on the very same port must succeed.
        let b = bind_listener(port, 128).unwrap();
        assert_eq!(local_port(b).unwrap(), port);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}

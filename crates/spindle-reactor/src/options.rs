//! Socket options applied to every new channel.
//!
//! Pure data plus a `configure` operation. The reactor references options
//! at bind, accept, and connect time; it never mutates them.
//!
//! Environment overrides (all optional):
//! - `SPINDLE_BACKLOG` - Listen backlog
//! - `SPINDLE_RCVBUF` - SO_RCVBUF in bytes
//! - `SPINDLE_SNDBUF` - SO_SNDBUF in bytes
//! - `SPINDLE_NODELAY` - TCP_NODELAY (0/1)
//! - `SPINDLE_KEEPALIVE` - SO_KEEPALIVE (0/1)
//! - `SPINDLE_REUSEADDR` - SO_REUSEADDR (0/1)
//! - `SPINDLE_REUSEPORT` - SO_REUSEPORT (0/1, Linux only)

use spindle_core::error::{Error, Result};

use mio::net::{TcpListener, TcpStream};

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Listen backlog for the accepting channel.
    pub backlog: i32,
    /// SO_RCVBUF, if set. The kernel may round the value up.
    pub recv_buffer_size: Option<i32>,
    /// SO_SNDBUF, if set.
    pub send_buffer_size: Option<i32>,
    /// Disable Nagle on every channel.
    pub nodelay: bool,
    /// SO_KEEPALIVE on connected channels.
    pub keepalive: bool,
    /// SO_REUSEADDR on the listening channel.
    pub reuse_address: bool,
    /// SO_REUSEPORT on the listening channel. Linux only; ignored elsewhere.
    pub reuse_port: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            recv_buffer_size: None,
            send_buffer_size: None,
            nodelay: true,
            keepalive: false,
            reuse_address: true,
            reuse_port: false,
        }
    }
}

impl SocketOptions {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            backlog: env_get("SPINDLE_BACKLOG", 1024),
            recv_buffer_size: env_opt("SPINDLE_RCVBUF"),
            send_buffer_size: env_opt("SPINDLE_SNDBUF"),
            nodelay: env_get("SPINDLE_NODELAY", 1i32) != 0,
            keepalive: env_get("SPINDLE_KEEPALIVE", 0i32) != 0,
            reuse_address: env_get("SPINDLE_REUSEADDR", 1i32) != 0,
            reuse_port: env_get("SPINDLE_REUSEPORT", 0i32) != 0,
        }
    }

    /// Apply the per-channel options to a raw socket.
    ///
    /// Called on every accepted and every outbound channel before it is
    /// handed to a handler.
    pub fn configure(&self, fd: RawFd) -> io::Result<()> {
        if self.nodelay {
            set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
        }
        if self.keepalive {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
        }
        if let Some(n) = self.recv_buffer_size {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, n)?;
        }
        if let Some(n) = self.send_buffer_size {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, n)?;
        }
        Ok(())
    }
}

fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn new_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Open, configure, bind and listen. The channel comes back non-blocking.
///
/// [`crate::server::ServerReactor::bind`] calls this; it is public for
/// embedders that bind first and hand the listener over separately.
pub fn bind_listener(options: &SocketOptions, local: SocketAddr) -> Result<TcpListener> {
    let fd = new_socket(&local).map_err(Error::Bind)?;
    let setup = || -> io::Result<()> {
        if options.reuse_address {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        }
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                if options.reuse_port {
                    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
                }
            }
        }
        options.configure(fd)?;
        let (storage, len) = sockaddr_from(&local);
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = unsafe { libc::listen(fd, options.backlog) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    };
    if let Err(e) = setup() {
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Bind(e));
    }
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Open a non-blocking channel and issue the connect.
///
/// Returns the stream and whether the handshake already finished — common
/// for loopback targets, where connect(2) completes inside the call.
pub(crate) fn connect_stream(
    options: &SocketOptions,
    remote: SocketAddr,
) -> Result<(TcpStream, bool)> {
    let fd = new_socket(&remote).map_err(Error::Connect)?;
    if let Err(e) = options.configure(fd) {
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Connect(e));
    }
    let (storage, len) = sockaddr_from(&remote);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        return Ok((unsafe { TcpStream::from_raw_fd(fd) }, true));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok((unsafe { TcpStream::from_raw_fd(fd) }, false));
    }
    unsafe {
        libc::close(fd);
    }
    Err(Error::Connect(err))
}

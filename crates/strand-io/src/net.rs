//! Blocking-style TCP helpers
//!
//! Thin wrappers over the hook layer giving fibers a plain blocking
//! programming model:
//!
//! ```ignore
//! let listener = NetListener::bind(8080, 1024)?;
//! loop {
//!     let stream = listener.accept()?;
//!     scheduler::spawn(&iom, move || {
//!         handle_connection(stream);
//!     });
//! }
//! ```
//!
//! `bind`/`listen` never block and go to the kernel directly; `accept`,
//! `connect`, `read` and `write` go through the hooks so the calling
//! fiber parks instead of the thread.

use std::io;
use std::net::SocketAddrV4;

use libc::{c_int, c_void, socklen_t};

use crate::hook;

fn sockaddr_v4(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

/// A listening TCP socket
pub struct NetListener {
    fd: c_int,
}

impl NetListener {
    /// Bind 0.0.0.0:`port` and listen
    pub fn bind(port: u16, backlog: c_int) -> io::Result<NetListener> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let listener = NetListener { fd };

        let opt: c_int = 1;
        unsafe {
            hook::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const c_int as *const c_void,
                std::mem::size_of::<c_int>() as socklen_t,
            );
        }

        let sin = sockaddr_v4(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port));
        let rt = unsafe {
            libc::bind(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            )
        };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::listen(fd, backlog) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(listener)
    }

    /// Accept one connection, parking the calling fiber until a client
    /// arrives
    pub fn accept(&self) -> io::Result<NetStream> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;

        let fd = unsafe {
            hook::accept(
                self.fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(NetStream { fd })
    }

    /// The local port actually bound (useful with port 0)
    pub fn local_port(&self) -> io::Result<u16> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let rt = unsafe {
            libc::getsockname(
                self.fd,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for NetListener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// A connected TCP stream
pub struct NetStream {
    fd: c_int,
}

impl NetStream {
    /// Connect to `addr`, parking the calling fiber until the handshake
    /// finishes (or the default connect timeout fires)
    pub fn connect(addr: SocketAddrV4) -> io::Result<NetStream> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let stream = NetStream { fd };

        let sin = sockaddr_v4(addr);
        let rt = unsafe {
            hook::connect(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            )
        };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stream)
    }

    /// Wrap an already-connected fd
    pub fn from_raw(fd: c_int) -> NetStream {
        NetStream { fd }
    }

    /// Read into `buf`; 0 means EOF
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { hook::recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Send once; returns bytes written
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { hook::send(self.fd, buf.as_ptr() as *const c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Send the whole buffer, retrying partial writes
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Cache + apply a receive timeout
    pub fn set_recv_timeout_ms(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_RCVTIMEO, ms)
    }

    /// Cache + apply a send timeout
    pub fn set_send_timeout_ms(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_SNDTIMEO, ms)
    }

    fn set_timeout(&self, optname: c_int, ms: u64) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        };
        let rt = unsafe {
            hook::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                optname,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for NetStream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

// The fd is valid until drop; all methods go through the hook layer,
// which is safe to call from any fiber.
unsafe impl Send for NetStream {}
unsafe impl Sync for NetStream {}
unsafe impl Send for NetListener {}
unsafe impl Sync for NetListener {}

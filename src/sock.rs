//! System socket base.

use libc::{c_int, c_ulong, sockaddr, socklen_t, SOCK_CLOEXEC, SOCK_NONBLOCK};
use std::{
    io::{Error, ErrorKind, Result},
    mem::{size_of, MaybeUninit},
    os::unix::io::{AsRawFd, RawFd},
};
use tokio::io::ReadBuf;

/// File descriptor that is closed on drop.
#[derive(Debug)]
pub struct OwnedFd {
    fd: RawFd,
}

impl OwnedFd {
    /// Create new OwnedFd taking ownership of file descriptor.
    pub unsafe fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Creates a socket of the specified type and returns its file descriptor.
///
/// The socket is set to non-blocking mode.
pub fn socket(sa: c_int, ty: c_int, proto: c_int) -> Result<OwnedFd> {
    let fd = match unsafe { libc::socket(sa, ty | SOCK_NONBLOCK | SOCK_CLOEXEC, proto) } {
        -1 => return Err(Error::last_os_error()),
        fd => unsafe { OwnedFd::new(fd) },
    };
    Ok(fd)
}

/// Creates a socket inside the network namespace referred to by `ns_fd`.
///
/// The kernel HCI driver rejects sockets created outside the initial
/// network namespace of the Bluetooth subsystem, so when running inside a
/// container the caller must pass a descriptor of the host's network
/// namespace. The namespace switch is done on a scratch thread so the
/// namespace of the calling thread is left untouched.
pub fn socket_in_ns(ns_fd: RawFd, sa: c_int, ty: c_int, proto: c_int) -> Result<OwnedFd> {
    std::thread::scope(|scope| {
        scope
            .spawn(move || {
                if unsafe { libc::setns(ns_fd, libc::CLONE_NEWNET) } == -1 {
                    return Err(Error::last_os_error());
                }
                socket(sa, ty, proto)
            })
            .join()
            .map_err(|_| Error::new(ErrorKind::Other, "socket creation thread panicked"))?
    })
}

/// Binds socket to the specified raw socket address.
pub fn bind<SA>(socket: &OwnedFd, sa: &SA) -> Result<()> {
    if unsafe {
        libc::bind(socket.as_raw_fd(), sa as *const _ as *const sockaddr, size_of::<SA>() as socklen_t)
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Sends from buffer into socket.
pub fn send(socket: &OwnedFd, buf: &[u8], flags: c_int) -> Result<usize> {
    match unsafe { libc::send(socket.as_raw_fd(), buf.as_ptr() as *const _, buf.len(), flags) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Receive from socket into buffer.
pub fn recv(socket: &OwnedFd, buf: &mut ReadBuf, flags: c_int) -> Result<usize> {
    let unfilled = unsafe { buf.unfilled_mut() };
    match unsafe { libc::recv(socket.as_raw_fd(), unfilled.as_mut_ptr() as *mut _, unfilled.len(), flags) } {
        -1 => Err(Error::last_os_error()),
        n => {
            let n = n as usize;
            unsafe {
                buf.assume_init(n);
            }
            buf.advance(n);
            Ok(n)
        }
    }
}

/// Get socket option.
pub fn getsockopt<T>(socket: &OwnedFd, level: c_int, optname: c_int) -> Result<T> {
    let mut optval: MaybeUninit<T> = MaybeUninit::uninit();
    let mut optlen: socklen_t = size_of::<T>() as _;
    if unsafe { libc::getsockopt(socket.as_raw_fd(), level, optname, optval.as_mut_ptr() as *mut _, &mut optlen) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    if optlen != size_of::<T>() as socklen_t {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid size"));
    }
    let optval = unsafe { optval.assume_init() };
    Ok(optval)
}

/// Set socket option.
pub fn setsockopt<T>(socket: &OwnedFd, level: c_int, optname: i32, optval: &T) -> Result<()> {
    let optlen: socklen_t = size_of::<T>() as _;
    if unsafe { libc::setsockopt(socket.as_raw_fd(), level, optname, optval as *const _ as *const _, optlen) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Perform an IOCTL that reads and writes a single value.
pub fn ioctl_inout<T>(socket: &OwnedFd, request: c_ulong, value: &mut T) -> Result<()> {
    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), request as _, value as *mut _) };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

//! POSIX backend: `socket2` for the socket calls, `libc` for poll,
//! `FIONREAD` and peeking.

use std::io::{self, Read};
use std::os::fd::AsRawFd;

use socket2::{Socket, Type};

use super::{Interest, RawSocket, Readiness, classify_kind};
use crate::{Address, Disposition};

#[derive(Debug)]
pub struct Descriptor {
    socket: Socket,
}

impl Descriptor {
    fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result)
        }
    }
}

impl RawSocket for Descriptor {
    fn open(address: &Address) -> io::Result<Self> {
        let socket = Socket::new(address.domain(), Type::STREAM, address.protocol())?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    fn connect(&self, address: &Address) -> io::Result<()> {
        self.socket.connect(&address.to_sock_addr()?)
    }

    fn bind(&self, address: &Address) -> io::Result<()> {
        if matches!(address, Address::Tcp(_)) {
            self.socket.set_reuse_address(true)?;
        }
        self.socket.bind(&address.to_sock_addr()?)
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        self.socket.listen(backlog)
    }

    fn accept(&self) -> io::Result<Self> {
        let (socket, _) = self.socket.accept()?;
        Ok(Self { socket })
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is a valid writable region of `buf.len()` bytes.
        let n = unsafe {
            libc::recv(
                self.socket.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_PEEK,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // socket2 passes MSG_NOSIGNAL where the platform has it.
        self.socket.send(buf)
    }

    fn read_size(&self) -> io::Result<usize> {
        let mut value: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int through the pointer.
        Self::cvt(unsafe { libc::ioctl(self.socket.as_raw_fd(), libc::FIONREAD, &mut value) })?;
        Ok(value.max(0) as usize)
    }

    fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(!blocking)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.socket.set_nodelay(nodelay)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.socket.shutdown(std::net::Shutdown::Write)
    }

    fn poll(&self, interest: Interest) -> io::Result<Readiness> {
        let mut events: libc::c_short = 0;
        if interest.read {
            events |= libc::POLLIN;
        }
        if interest.write {
            events |= libc::POLLOUT;
        }
        let mut fd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let count = Self::cvt(unsafe { libc::poll(&mut fd, 1, 0) })?;
        if count == 0 {
            return Ok(Readiness::default());
        }
        Ok(Readiness {
            readable: fd.revents & libc::POLLIN != 0,
            writable: fd.revents & libc::POLLOUT != 0,
            hangup: fd.revents & libc::POLLHUP != 0,
            error: fd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        })
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.socket.take_error()
    }

    fn local_addr(&self) -> io::Result<Option<Address>> {
        Ok(Address::from_sock_addr(&self.socket.local_addr()?))
    }

    fn classify(err: &io::Error) -> Disposition {
        if let Some(disposition) = classify_kind(err.kind()) {
            return disposition;
        }
        match err.raw_os_error() {
            Some(code) if code == libc::EINPROGRESS || code == libc::EALREADY => {
                Disposition::Retry
            }
            Some(code) if code == libc::EPIPE || code == libc::ECONNRESET => {
                Disposition::Disconnect
            }
            _ => Disposition::Fatal,
        }
    }
}

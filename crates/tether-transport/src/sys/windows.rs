//! Winsock backend built on `socket2` alone.
//!
//! Readiness is derived from non-blocking peeks; a listener "polls" by
//! accepting ahead and parking the connection until `accept` asks for it.

use std::cell::{Cell, RefCell};
use std::io::{self, Read};
use std::mem::MaybeUninit;

use socket2::{Socket, Type};

use super::{Interest, RawSocket, Readiness, classify_kind};
use crate::{Address, Disposition};

const WSAEWOULDBLOCK: i32 = 10035;
const WSAEINPROGRESS: i32 = 10036;
const WSAEALREADY: i32 = 10037;
const WSAECONNABORTED: i32 = 10053;
const WSAECONNRESET: i32 = 10054;
const WSAESHUTDOWN: i32 = 10058;

/// Upper bound on what `read_size` reports per call.
const PEEK_WINDOW: usize = 64 * 1024;

#[derive(Debug)]
pub struct Descriptor {
    socket: Socket,
    listening: Cell<bool>,
    parked: RefCell<Option<Socket>>,
    /// Peek target, grown on demand and reused across calls.
    scratch: RefCell<Vec<MaybeUninit<u8>>>,
}

impl Descriptor {
    fn wrap(socket: Socket) -> Self {
        Self {
            socket,
            listening: Cell::new(false),
            parked: RefCell::new(None),
            scratch: RefCell::new(Vec::new()),
        }
    }

    fn with_scratch<T>(&self, len: usize, op: impl FnOnce(&mut [MaybeUninit<u8>]) -> T) -> T {
        let mut scratch = self.scratch.borrow_mut();
        if scratch.len() < len {
            scratch.resize(len, MaybeUninit::uninit());
        }
        op(&mut scratch[..len])
    }

    fn peek_len(&self, len: usize) -> io::Result<usize> {
        self.with_scratch(len, |scratch| self.socket.peek(scratch))
    }
}

impl RawSocket for Descriptor {
    fn open(address: &Address) -> io::Result<Self> {
        let socket = Socket::new(address.domain(), Type::STREAM, address.protocol())?;
        socket.set_nonblocking(true)?;
        Ok(Self::wrap(socket))
    }

    fn connect(&self, address: &Address) -> io::Result<()> {
        self.socket.connect(&address.to_sock_addr()?)
    }

    fn bind(&self, address: &Address) -> io::Result<()> {
        self.socket.bind(&address.to_sock_addr()?)
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        self.socket.listen(backlog)?;
        self.listening.set(true);
        Ok(())
    }

    fn accept(&self) -> io::Result<Self> {
        if let Some(socket) = self.parked.borrow_mut().take() {
            return Ok(Self::wrap(socket));
        }
        let (socket, _) = self.socket.accept()?;
        Ok(Self::wrap(socket))
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_scratch(buf.len(), |scratch| {
            let n = self.socket.peek(scratch)?;
            for (dst, src) in buf.iter_mut().zip(&scratch[..n]) {
                // SAFETY: the first `n` bytes were written by the peek.
                *dst = unsafe { src.assume_init() };
            }
            Ok(n)
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn read_size(&self) -> io::Result<usize> {
        match self.peek_len(PEEK_WINDOW) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
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
        let mut readiness = Readiness::default();

        if let Some(err) = self.socket.take_error()? {
            return Err(err);
        }

        if interest.read {
            if self.listening.get() {
                let mut parked = self.parked.borrow_mut();
                if parked.is_none() {
                    match self.socket.accept() {
                        Ok((socket, _)) => *parked = Some(socket),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e),
                    }
                }
                readiness.readable = parked.is_some();
            } else {
                match self.peek_len(1) {
                    Ok(0) => readiness.hangup = true,
                    Ok(_) => readiness.readable = true,
                    Err(e) => match Self::classify(&e) {
                        Disposition::Retry => {}
                        Disposition::Disconnect => readiness.hangup = true,
                        Disposition::Fatal => return Err(e),
                    },
                }
            }
        }

        if interest.write {
            readiness.writable = self.socket.peer_addr().is_ok();
        }

        Ok(readiness)
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
            Some(WSAEWOULDBLOCK | WSAEINPROGRESS | WSAEALREADY) => Disposition::Retry,
            Some(WSAECONNRESET | WSAECONNABORTED | WSAESHUTDOWN) => Disposition::Disconnect,
            _ => Disposition::Fatal,
        }
    }
}

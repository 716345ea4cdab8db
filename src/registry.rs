//! Socket families and the operation table every socket implements.
//!
//! A [`Registry`] picks the implementation for a new socket by asking each
//! registered [`SocketFamily`], highest priority first, whether it handles
//! the (family, type, protocol) triple. The secure layer registers above the
//! plain families so secure protocol numbers reach it first.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::engine::Protocol;
use crate::socket::{SecureSocket, SecureSockets};
use crate::transport::{AddressFamily, MsgFlags, SocketType};
use crate::Error;

/// Operations of one open socket.
pub trait SocketOps: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.recv_from(buf, MsgFlags::empty()).map(|(n, _)| n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.send_to(buf, MsgFlags::empty(), None)
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<(), Error>;

    fn connect(&mut self, addr: SocketAddr) -> Result<(), Error>;

    fn listen(&mut self, backlog: usize) -> Result<(), Error>;

    fn accept(&mut self) -> Result<(Box<dyn SocketOps>, SocketAddr), Error>;

    fn send_to(
        &mut self,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error>;

    fn send_msg(
        &mut self,
        bufs: &[IoSlice<'_>],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error>;

    fn recv_from(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, Option<SocketAddr>), Error>;

    fn getsockopt(&mut self, level: i32, name: i32, value: &mut [u8]) -> Result<usize, Error>;

    fn setsockopt(&mut self, level: i32, name: i32, value: &[u8]) -> Result<(), Error>;

    fn peer_addr(&self) -> Result<SocketAddr, Error>;

    fn local_addr(&self) -> Result<SocketAddr, Error>;

    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// A socket implementation selectable by family, type and protocol.
pub trait SocketFamily: Send + Sync {
    fn supports(&self, family: AddressFamily, kind: SocketType, protocol: i32) -> bool;

    fn open(
        &self,
        family: AddressFamily,
        kind: SocketType,
        protocol: i32,
    ) -> Result<Box<dyn SocketOps>, Error>;
}

/// Priority ordered set of socket families.
#[derive(Default)]
pub struct Registry {
    families: Vec<(i32, Arc<dyn SocketFamily>)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a family. Higher `priority` is asked first, equal priorities in
    /// registration order.
    pub fn register(&mut self, priority: i32, family: Arc<dyn SocketFamily>) {
        let pos = self
            .families
            .iter()
            .position(|(p, _)| *p < priority)
            .unwrap_or(self.families.len());
        self.families.insert(pos, (priority, family));
    }

    /// Open a socket with the first family that supports the triple.
    pub fn open(
        &self,
        family: AddressFamily,
        kind: SocketType,
        protocol: i32,
    ) -> Result<Box<dyn SocketOps>, Error> {
        let Some((_, f)) = self
            .families
            .iter()
            .find(|(_, f)| f.supports(family, kind, protocol))
        else {
            debug!("No socket family for {:?} {:?} {}", family, kind, protocol);
            return Err(Error::AddressFamilyNotSupported);
        };

        f.open(family, kind, protocol)
    }
}

impl SocketFamily for SecureSockets {
    fn supports(&self, _family: AddressFamily, _kind: SocketType, protocol: i32) -> bool {
        Protocol::from_raw(protocol).is_some()
    }

    fn open(
        &self,
        family: AddressFamily,
        kind: SocketType,
        protocol: i32,
    ) -> Result<Box<dyn SocketOps>, Error> {
        Ok(Box::new(self.socket(family, kind, protocol)?))
    }
}

impl SocketOps for SecureSocket {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), Error> {
        SecureSocket::bind(self, addr)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<(), Error> {
        SecureSocket::connect(self, addr)
    }

    fn listen(&mut self, backlog: usize) -> Result<(), Error> {
        SecureSocket::listen(self, backlog)
    }

    fn accept(&mut self) -> Result<(Box<dyn SocketOps>, SocketAddr), Error> {
        let (sock, addr) = SecureSocket::accept(self)?;
        Ok((Box::new(sock), addr))
    }

    fn send_to(
        &mut self,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error> {
        SecureSocket::send_to(self, buf, flags, addr)
    }

    fn send_msg(
        &mut self,
        bufs: &[IoSlice<'_>],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error> {
        SecureSocket::send_msg(self, bufs, flags, addr)
    }

    fn recv_from(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, Option<SocketAddr>), Error> {
        SecureSocket::recv_from(self, buf, flags)
    }

    fn getsockopt(&mut self, level: i32, name: i32, value: &mut [u8]) -> Result<usize, Error> {
        SecureSocket::getsockopt(self, level, name, value)
    }

    fn setsockopt(&mut self, level: i32, name: i32, value: &[u8]) -> Result<(), Error> {
        SecureSocket::setsockopt(self, level, name, value)
    }

    fn peer_addr(&self) -> Result<SocketAddr, Error> {
        SecureSocket::peer_addr(self)
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        SecureSocket::local_addr(self)
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        SecureSocket::close(*self)
    }
}

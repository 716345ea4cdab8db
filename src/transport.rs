//! Plain socket seam.
//!
//! The secure layer never talks to the network directly. It drives a
//! [`Transport`] (one plain socket) created by a [`TransportProvider`] (the
//! plain socket layer), and waits for readiness through the provider's
//! group-wait primitive.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::Arc;
use std::time::Duration;

use crate::signal::Signal;

macro_rules! flag_type {
    ($(#[$m:meta])* $name:ident($repr:ty) { $($(#[$fm:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$m])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fm])* pub const $flag: $name = $name($value as $repr);)*

            /// No flags set.
            pub const fn empty() -> Self {
                $name(0)
            }

            /// Build from a raw value.
            pub const fn from_bits(bits: $repr) -> Self {
                $name(bits)
            }

            /// The raw value.
            pub const fn bits(&self) -> $repr {
                self.0
            }

            /// True if every bit of `other` is set in `self`.
            pub const fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0 && other.0 != 0
            }

            /// True if any bit of `other` is set in `self`.
            pub const fn intersects(&self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl Not for $name {
            type Output = $name;
            fn not(self) -> $name {
                $name(!self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

flag_type! {
    /// Per-call message flags, as passed to send/recv.
    MsgFlags(i32) {
        PEEK = libc::MSG_PEEK;
        DONTWAIT = libc::MSG_DONTWAIT;
        WAITALL = libc::MSG_WAITALL;
        TRUNC = libc::MSG_TRUNC;
    }
}

flag_type! {
    /// Poll readiness bits.
    PollFlags(i16) {
        IN = libc::POLLIN;
        OUT = libc::POLLOUT;
        ERR = libc::POLLERR;
        HUP = libc::POLLHUP;
        NVAL = libc::POLLNVAL;
    }
}

/// Transport kind of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Reliable byte stream, secured with TLS.
    Stream,
    /// Connectionless datagrams, secured with DTLS.
    Datagram,
}

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// The family matching an address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        }
    }
}

/// One plain socket of the underlying socket layer.
///
/// Implementations report "would block" as `io::ErrorKind::WouldBlock`,
/// either because the socket is non-blocking or because `MsgFlags::DONTWAIT`
/// was passed.
pub trait Transport: Send {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()>;

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()>;

    fn listen(&mut self, backlog: usize) -> io::Result<()>;

    /// Accept one pending connection.
    fn accept(&mut self) -> io::Result<(Box<dyn Transport>, SocketAddr)>;

    /// Send to the connected peer, or to `addr` if given.
    fn send_to(
        &mut self,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> io::Result<usize>;

    /// Receive into `buf`. Datagram transports report the source address.
    fn recv_from(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> io::Result<(usize, Option<SocketAddr>)>;

    /// Current readiness, without waiting.
    fn readiness(&mut self, events: PollFlags) -> io::Result<PollFlags>;

    /// Wait until one of `events` is ready or `timeout` passes.
    ///
    /// `None` waits forever. Returns the ready bits, empty on timeout.
    fn wait(&mut self, events: PollFlags, timeout: Option<Duration>) -> io::Result<PollFlags>;

    fn is_nonblocking(&self) -> bool;

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    fn setsockopt(&mut self, level: i32, name: i32, value: &[u8]) -> io::Result<()>;

    /// Read an option into `value`, returning the length written.
    fn getsockopt(&mut self, level: i32, name: i32, value: &mut [u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// What a [`WaitRequest`] waits on.
pub enum WaitTarget<'a> {
    /// Readiness of a plain socket.
    Transport(&'a mut dyn Transport),
    /// A signal raised by the secure layer, reported as `PollFlags::IN`.
    Signal(Arc<Signal>),
}

/// One entry of a group wait.
pub struct WaitRequest<'a> {
    pub target: WaitTarget<'a>,
    pub events: PollFlags,
    pub revents: PollFlags,
}

impl<'a> WaitRequest<'a> {
    pub fn transport(transport: &'a mut dyn Transport, events: PollFlags) -> Self {
        WaitRequest {
            target: WaitTarget::Transport(transport),
            events,
            revents: PollFlags::empty(),
        }
    }

    pub fn signal(signal: Arc<Signal>) -> Self {
        WaitRequest {
            target: WaitTarget::Signal(signal),
            events: PollFlags::IN,
            revents: PollFlags::empty(),
        }
    }
}

impl fmt::Debug for WaitRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self.target {
            WaitTarget::Transport(_) => "transport",
            WaitTarget::Signal(_) => "signal",
        };
        f.debug_struct("WaitRequest")
            .field("target", &target)
            .field("events", &self.events)
            .field("revents", &self.revents)
            .finish()
    }
}

/// The plain socket layer.
pub trait TransportProvider: Send + Sync {
    /// Create a plain socket of the given kind.
    fn open(&self, family: AddressFamily, kind: SocketType) -> io::Result<Box<dyn Transport>>;

    /// Wait on several targets at once.
    ///
    /// Fills in `revents` of every request and returns how many have any bit
    /// set. `None` waits forever, a zero timeout only samples readiness.
    /// Providers without a native way to wait on a [`Signal`] may sample
    /// [`Signal::is_raised`] periodically.
    fn poll(&self, requests: &mut [WaitRequest<'_>], timeout: Option<Duration>)
        -> io::Result<usize>;
}

//! In-memory network and a toy record engine for the socket tests.
//!
//! The engine speaks a minimal record protocol, `[type u8][len u16][payload]`,
//! with a cookie exchange, session resumption, certificate checks against
//! the CA list and XOR "encryption". It exercises the secure layer's
//! control flow, nothing more.

#![allow(unused)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use securesock::{
    AddressFamily, Bio, Config, CookieJar, CredentialKind, Engine, EngineConfig, EngineError, Error,
    EngineProvider, MemoryCredentialStore, MsgFlags, PollFlags, Role, SecTag, SecureSocket,
    SecureSockets, SessionStore, SocketType, TimerState, Transport, TransportProvider,
    VerifyLevel, WaitRequest, WaitTarget, IPPROTO_DTLS_1_2, IPPROTO_TLS_1_2, SOL_TLS,
    TLS_DTLS_ROLE, TLS_DTLS_ROLE_SERVER, TLS_HOSTNAME, TLS_SEC_TAG_LIST,
};

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

struct Pending {
    rx: usize,
    tx: usize,
    peer: SocketAddr,
}

#[derive(Default)]
struct NetState {
    next_port: u16,
    pipes: Vec<Pipe>,
    listeners: HashMap<SocketAddr, VecDeque<Pending>>,
    datagrams: HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>,
    wire: Vec<u8>,
}

impl NetState {
    fn ephemeral(&mut self) -> SocketAddr {
        self.next_port += 1;
        SocketAddr::from(([127, 0, 0, 1], 40000 + self.next_port))
    }
}

#[derive(Default)]
struct NetInner {
    state: Mutex<NetState>,
    cond: Condvar,
}

impl NetInner {
    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }
}

/// The plain socket layer of the tests.
#[derive(Clone, Default)]
pub struct Net {
    inner: Arc<NetInner>,
}

impl Net {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every byte sent over any socket so far.
    pub fn wire(&self) -> Vec<u8> {
        self.inner.lock().wire.clone()
    }

    pub fn socket(&self, kind: SocketType) -> MemSocket {
        MemSocket {
            net: self.inner.clone(),
            kind,
            local: None,
            conn: Conn::Idle,
            default_peer: None,
            nonblocking: false,
            options: HashMap::new(),
        }
    }
}

impl TransportProvider for Net {
    fn open(&self, _family: AddressFamily, kind: SocketType) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.socket(kind)))
    }

    fn poll(
        &self,
        requests: &mut [WaitRequest<'_>],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut ready = 0;
            for r in requests.iter_mut() {
                r.revents = match &mut r.target {
                    WaitTarget::Transport(t) => t.readiness(r.events)?,
                    WaitTarget::Signal(s) if s.is_raised() => PollFlags::IN,
                    WaitTarget::Signal(_) => PollFlags::empty(),
                };
                if !r.revents.is_empty() {
                    ready += 1;
                }
            }

            if ready > 0 {
                return Ok(ready);
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Ok(0);
                }
            }

            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

enum Conn {
    Idle,
    Listening,
    Stream { rx: usize, tx: usize, peer: SocketAddr },
}

/// One plain in-memory socket.
pub struct MemSocket {
    net: Arc<NetInner>,
    kind: SocketType,
    local: Option<SocketAddr>,
    conn: Conn,
    default_peer: Option<SocketAddr>,
    nonblocking: bool,
    options: HashMap<(i32, i32), Vec<u8>>,
}

fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

impl MemSocket {
    fn ensure_bound(&mut self, st: &mut NetState) -> SocketAddr {
        if let Some(local) = self.local {
            return local;
        }
        let local = st.ephemeral();
        if self.kind == SocketType::Datagram {
            st.datagrams.entry(local).or_default();
        }
        self.local = Some(local);
        local
    }

    fn ready(&self, st: &NetState, events: PollFlags) -> PollFlags {
        let mut r = PollFlags::empty();

        match (&self.conn, self.kind) {
            (Conn::Listening, _) => {
                let pending = self
                    .local
                    .and_then(|l| st.listeners.get(&l))
                    .map(|q| !q.is_empty())
                    .unwrap_or(false);
                if pending {
                    r |= PollFlags::IN;
                }
            }
            (Conn::Stream { rx, tx, .. }, _) => {
                let rx = &st.pipes[*rx];
                if !rx.data.is_empty() || rx.closed {
                    r |= PollFlags::IN;
                }
                if rx.closed {
                    r |= PollFlags::HUP;
                }
                if !st.pipes[*tx].closed {
                    r |= PollFlags::OUT;
                }
            }
            (Conn::Idle, SocketType::Datagram) => {
                let queued = self
                    .local
                    .and_then(|l| st.datagrams.get(&l))
                    .map(|q| !q.is_empty())
                    .unwrap_or(false);
                if queued {
                    r |= PollFlags::IN;
                }
                r |= PollFlags::OUT;
            }
            (Conn::Idle, SocketType::Stream) => {}
        }

        r & (events | PollFlags::ERR | PollFlags::HUP)
    }

    /// Run `f` until it yields, waiting on the network when allowed.
    fn block_on<T>(
        &self,
        flags: MsgFlags,
        mut f: impl FnMut(&mut NetState) -> Option<io::Result<T>>,
    ) -> io::Result<T> {
        let mut st = self.net.lock();
        loop {
            if let Some(r) = f(&mut st) {
                self.net.cond.notify_all();
                return r;
            }
            if self.nonblocking || flags.contains(MsgFlags::DONTWAIT) {
                return Err(would_block());
            }
            st = self.net.cond.wait(st).unwrap();
        }
    }
}

impl Transport for MemSocket {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut st = self.net.lock();
        if self.kind == SocketType::Datagram {
            if st.datagrams.contains_key(&addr) {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }
            st.datagrams.insert(addr, VecDeque::new());
        }
        self.local = Some(addr);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let net = self.net.clone();
        let mut st = net.lock();
        let local = self.ensure_bound(&mut st);

        if self.kind == SocketType::Datagram {
            self.default_peer = Some(addr);
            return Ok(());
        }

        if !st.listeners.contains_key(&addr) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }

        let c2s = st.pipes.len();
        st.pipes.push(Pipe::default());
        let s2c = st.pipes.len();
        st.pipes.push(Pipe::default());

        if let Some(q) = st.listeners.get_mut(&addr) {
            q.push_back(Pending {
                rx: c2s,
                tx: s2c,
                peer: local,
            });
        }

        self.conn = Conn::Stream {
            rx: s2c,
            tx: c2s,
            peer: addr,
        };
        net.cond.notify_all();
        Ok(())
    }

    fn listen(&mut self, _backlog: usize) -> io::Result<()> {
        let net = self.net.clone();
        let mut st = net.lock();
        let local = self.ensure_bound(&mut st);
        st.listeners.entry(local).or_default();
        self.conn = Conn::Listening;
        Ok(())
    }

    fn accept(&mut self) -> io::Result<(Box<dyn Transport>, SocketAddr)> {
        let local = self.local.ok_or(io::ErrorKind::InvalidInput)?;

        let pending = self.block_on(MsgFlags::empty(), |st| {
            st.listeners.get_mut(&local)?.pop_front().map(Ok)
        })?;

        let sock = MemSocket {
            net: self.net.clone(),
            kind: SocketType::Stream,
            local: Some(local),
            conn: Conn::Stream {
                rx: pending.rx,
                tx: pending.tx,
                peer: pending.peer,
            },
            default_peer: None,
            nonblocking: false,
            options: HashMap::new(),
        };

        Ok((Box::new(sock), pending.peer))
    }

    fn send_to(
        &mut self,
        buf: &[u8],
        _flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> io::Result<usize> {
        let net = self.net.clone();
        let mut st = net.lock();

        let stream_tx = match self.conn {
            Conn::Stream { tx, .. } => Some(tx),
            _ => None,
        };

        match (stream_tx, self.kind) {
            (Some(tx), _) => {
                if st.pipes[tx].closed {
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                }
                st.pipes[tx].data.extend(buf);
            }
            (None, SocketType::Datagram) => {
                let to = addr
                    .or(self.default_peer)
                    .ok_or(io::ErrorKind::NotConnected)?;
                let from = self.ensure_bound(&mut st);
                if let Some(q) = st.datagrams.get_mut(&to) {
                    q.push_back((buf.to_vec(), from));
                }
            }
            (None, SocketType::Stream) => {
                return Err(io::Error::from(io::ErrorKind::NotConnected))
            }
        }

        st.wire.extend_from_slice(buf);
        net.cond.notify_all();
        Ok(buf.len())
    }

    fn recv_from(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> io::Result<(usize, Option<SocketAddr>)> {
        match (&self.conn, self.kind) {
            (Conn::Stream { rx, .. }, _) => {
                let rx = *rx;
                self.block_on(flags, |st| {
                    let pipe = &mut st.pipes[rx];
                    if pipe.data.is_empty() {
                        return pipe.closed.then(|| Ok((0, None)));
                    }
                    let n = buf.len().min(pipe.data.len());
                    for (b, d) in buf.iter_mut().zip(pipe.data.drain(..n)) {
                        *b = d;
                    }
                    Some(Ok((n, None)))
                })
            }
            (_, SocketType::Datagram) => {
                let local = self.local.ok_or(io::ErrorKind::InvalidInput)?;
                self.block_on(flags, |st| {
                    let (data, from) = st.datagrams.get_mut(&local)?.pop_front()?;
                    let n = buf.len().min(data.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Some(Ok((n, Some(from))))
                })
            }
            _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn readiness(&mut self, events: PollFlags) -> io::Result<PollFlags> {
        let st = self.net.lock();
        Ok(self.ready(&st, events))
    }

    fn wait(&mut self, events: PollFlags, timeout: Option<Duration>) -> io::Result<PollFlags> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.net.lock();

        loop {
            let r = self.ready(&st, events);
            if !r.is_empty() {
                return Ok(r);
            }

            match deadline {
                None => st = self.net.cond.wait(st).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(PollFlags::empty());
                    }
                    st = self.net.cond.wait_timeout(st, d - now).unwrap().0;
                }
            }
        }
    }

    fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn setsockopt(&mut self, level: i32, name: i32, value: &[u8]) -> io::Result<()> {
        self.options.insert((level, name), value.to_vec());
        Ok(())
    }

    fn getsockopt(&mut self, level: i32, name: i32, value: &mut [u8]) -> io::Result<usize> {
        let v = self
            .options
            .get(&(level, name))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOPROTOOPT))?;
        let n = v.len().min(value.len());
        value[..n].copy_from_slice(&v[..n]);
        Ok(n)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.local.ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.conn {
            Conn::Stream { peer, .. } => Ok(peer),
            _ => self
                .default_peer
                .ok_or_else(|| io::ErrorKind::NotConnected.into()),
        }
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if let Conn::Stream { tx, .. } = self.conn {
            if how != Shutdown::Read {
                self.net.lock().pipes[tx].closed = true;
                self.net.cond.notify_all();
            }
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut st = self.net.lock();

        match (&self.conn, self.local) {
            (Conn::Stream { rx, tx, .. }, _) => {
                st.pipes[*rx].closed = true;
                st.pipes[*tx].closed = true;
            }
            (Conn::Listening, Some(local)) => {
                st.listeners.remove(&local);
            }
            (Conn::Idle, Some(local)) if self.kind == SocketType::Datagram => {
                st.datagrams.remove(&local);
            }
            _ => {}
        }

        self.conn = Conn::Idle;
        self.local = None;
        self.net.cond.notify_all();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Toy record protocol
// ---------------------------------------------------------------------------

pub const CLIENT_HELLO: u8 = 1;
pub const HELLO_VERIFY: u8 = 2;
pub const SERVER_HELLO: u8 = 3;
pub const CLIENT_FINISHED: u8 = 4;
pub const APP_DATA: u8 = 23;
pub const CLOSE_NOTIFY: u8 = 21;

pub fn record(ty: u8, payload: &[u8]) -> Vec<u8> {
    let mut r = vec![ty];
    r.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    r.extend_from_slice(payload);
    r
}

/// Split one record off the front of `buf`.
pub fn parse_record(buf: &[u8]) -> Option<(u8, Vec<u8>, usize)> {
    if buf.len() < 3 {
        return None;
    }
    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < 3 + len {
        return None;
    }
    Some((buf[0], buf[3..3 + len].to_vec(), 3 + len))
}

pub fn client_hello(cookie: &[u8], session_id: &[u8]) -> Vec<u8> {
    let mut p = vec![cookie.len() as u8];
    p.extend_from_slice(cookie);
    p.push(session_id.len() as u8);
    p.extend_from_slice(session_id);
    record(CLIENT_HELLO, &p)
}

fn parse_client_hello(p: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let clen = *p.first()? as usize;
    let cookie = p.get(1..1 + clen)?.to_vec();
    let slen = *p.get(1 + clen)? as usize;
    let sid = p.get(2 + clen..2 + clen + slen)?.to_vec();
    Some((cookie, sid))
}

/// XOR keystream derived from a session id. High bits are always set, so
/// ASCII plaintext never survives.
pub fn crypt(session_id: &[u8], data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ (session_id[i % session_id.len()] | 0x80))
        .collect()
}

pub const SERVER_CERT: &[u8] = b"CN=server.test";
pub const OTHER_CERT: &[u8] = b"CN=other.test";

#[derive(Debug, Default)]
pub struct Stats {
    pub full: AtomicUsize,
    pub resumed: AtomicUsize,
    pub hello_verify: AtomicUsize,
    pub created: AtomicUsize,
}

impl Stats {
    pub fn full(&self) -> usize {
        self.full.load(Ordering::SeqCst)
    }

    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn hello_verify(&self) -> usize {
        self.hello_verify.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct Session {
    id: Vec<u8>,
    cert: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hs {
    Start,
    ClientWaitHello,
    ServerWaitHello,
    ServerWaitFinished,
    Established,
}

pub struct ToyEngine {
    stats: Arc<Stats>,
    ids: Arc<AtomicU64>,
    truncate_saves: Arc<AtomicBool>,
    config: Option<EngineConfig>,
    ca: Vec<Arc<[u8]>>,
    own_cert: Option<Arc<[u8]>>,
    psk: Option<Vec<u8>>,
    hs: Hs,
    rx: Vec<u8>,
    plain: VecDeque<u8>,
    cookie: Vec<u8>,
    resume: Option<Session>,
    session: Option<Session>,
    last_flight: Vec<u8>,
    started: Option<Instant>,
    timeout: Duration,
}

impl ToyEngine {
    fn dtls(&self) -> bool {
        self.config
            .as_ref()
            .map(|c| c.protocol.is_dtls())
            .unwrap_or(false)
    }

    fn role(&self) -> Role {
        self.config.as_ref().map(|c| c.role).unwrap_or_default()
    }

    fn timeouts(&self) -> (Duration, Duration) {
        self.config
            .as_ref()
            .map(|c| c.dtls_timeouts)
            .unwrap_or((Duration::from_secs(1), Duration::from_secs(60)))
    }

    fn next_record(&mut self, bio: &mut dyn Bio) -> Result<(u8, Vec<u8>), EngineError> {
        loop {
            if let Some((ty, payload, used)) = parse_record(&self.rx) {
                self.rx.drain(..used);
                return Ok((ty, payload));
            }
            let mut buf = [0u8; 2048];
            let n = bio.recv(&mut buf)?;
            self.rx.extend_from_slice(&buf[..n]);
        }
    }

    fn send_flight(&mut self, bio: &mut dyn Bio, rec: Vec<u8>) -> Result<(), EngineError> {
        bio.send(&rec)?;
        if self.dtls() {
            if self.started.is_none() {
                self.started = Some(Instant::now());
                self.timeout = self.timeouts().0;
            }
            bio.set_timer(self.timeout / 4, self.timeout);
            self.last_flight = rec;
        }
        Ok(())
    }

    fn on_timeout(&mut self, bio: &mut dyn Bio) -> Result<(), EngineError> {
        let max = self.timeouts().1;
        let expired = self.started.map(|s| s.elapsed() >= max).unwrap_or(true);

        if self.last_flight.is_empty() || expired {
            bio.set_timer(Duration::ZERO, Duration::ZERO);
            return Err(EngineError::Timeout);
        }

        bio.send(&self.last_flight.clone())?;
        self.timeout = (self.timeout * 2).min(max);
        bio.set_timer(self.timeout / 4, self.timeout);
        Ok(())
    }

    fn recv_handshake(&mut self, bio: &mut dyn Bio) -> Result<(u8, Vec<u8>), EngineError> {
        loop {
            match self.next_record(bio) {
                Ok(r) => return Ok(r),
                Err(EngineError::Timeout) => self.on_timeout(bio)?,
                Err(EngineError::WantRead)
                    if self.dtls() && bio.timer() == TimerState::Expired =>
                {
                    self.on_timeout(bio)?
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finish(&mut self, bio: &mut dyn Bio) {
        bio.set_timer(Duration::ZERO, Duration::ZERO);
        self.last_flight.clear();
        self.started = None;
        self.hs = Hs::Established;
    }

    fn client_hello(&mut self, bio: &mut dyn Bio) -> Result<(), EngineError> {
        let sid = self.resume.as_ref().map(|s| s.id.clone()).unwrap_or_default();
        let rec = client_hello(&self.cookie, &sid);
        self.send_flight(bio, rec)
    }

    fn verify_server(&self, cert: &[u8]) -> Result<(), EngineError> {
        let Some(config) = &self.config else {
            return Err(EngineError::BadInput);
        };

        let trusted = self.ca.iter().any(|ca| &ca[..] == cert);
        // No hostname set at all fails, an explicitly cleared one skips the check.
        let name_ok = match (&config.hostname, config.hostname_set) {
            (_, false) => false,
            (Some(h), true) => cert == format!("CN={}", h).as_bytes(),
            (None, true) => true,
        };

        match config.verify {
            VerifyLevel::Required if !(trusted && name_ok) => Err(EngineError::Verification),
            _ => Ok(()),
        }
    }

    fn server_hello(&mut self, bio: &mut dyn Bio, payload: &[u8]) -> Result<(), EngineError> {
        let (cookie, sid) = parse_client_hello(payload).ok_or(EngineError::BadInput)?;
        let config = self.config.clone().ok_or(EngineError::BadInput)?;

        if let Some(jar) = &config.cookies {
            let peer = bio.transport_id().ok_or(EngineError::Transport)?;
            if !jar.verify(&cookie, &peer) {
                let cookie = jar.generate(&peer).map_err(|_| EngineError::Fatal(-1))?;
                bio.send(&record(HELLO_VERIFY, &cookie))?;
                self.stats.hello_verify.fetch_add(1, Ordering::SeqCst);
                return Err(EngineError::HelloVerifyRequired);
            }
        }

        let cert = self.own_cert.clone().ok_or(EngineError::Verification)?;

        let resumed = !sid.is_empty()
            && config
                .session_store
                .as_ref()
                .and_then(|s| s.get(&sid))
                .is_some();

        let id = if resumed {
            self.stats.resumed.fetch_add(1, Ordering::SeqCst);
            sid
        } else {
            self.stats.full.fetch_add(1, Ordering::SeqCst);
            let id = self.ids.fetch_add(1, Ordering::SeqCst).to_be_bytes().to_vec();
            if let Some(store) = &config.session_store {
                store.set(&id, &cert);
            }
            id
        };

        let mut p = id.clone();
        p.push(resumed as u8);
        p.extend_from_slice(&cert);

        self.session = Some(Session {
            id,
            cert: cert.to_vec(),
        });
        self.send_flight(bio, record(SERVER_HELLO, &p))?;
        self.hs = Hs::ServerWaitFinished;
        Ok(())
    }

    fn client_finish(&mut self, bio: &mut dyn Bio, payload: &[u8]) -> Result<(), EngineError> {
        if payload.len() < 9 {
            return Err(EngineError::BadInput);
        }
        let id = payload[..8].to_vec();
        let resumed = payload[8] == 1;
        let cert = payload[9..].to_vec();

        if resumed {
            match &self.resume {
                Some(s) if s.id == id => self.session = Some(s.clone()),
                _ => return Err(EngineError::BadInput),
            }
        } else {
            self.verify_server(&cert)?;
            self.session = Some(Session { id, cert });
        }

        bio.send(&record(CLIENT_FINISHED, &[]))?;
        self.finish(bio);
        Ok(())
    }

    fn key(&self) -> Result<Vec<u8>, EngineError> {
        self.session
            .as_ref()
            .map(|s| s.id.clone())
            .ok_or(EngineError::BadInput)
    }

    /// Process one record while established.
    fn handle_record(&mut self, ty: u8, payload: Vec<u8>) -> Result<(), EngineError> {
        match ty {
            APP_DATA => {
                let key = self.key()?;
                self.plain.extend(crypt(&key, &payload));
                Ok(())
            }
            CLOSE_NOTIFY => Err(EngineError::PeerCloseNotify),
            CLIENT_HELLO if self.dtls() && self.role() == Role::Server => {
                Err(EngineError::ClientReconnect)
            }
            SERVER_HELLO | CLIENT_FINISHED | HELLO_VERIFY => Ok(()),
            _ => Err(EngineError::BadInput),
        }
    }
}

impl Engine for ToyEngine {
    fn configure(&mut self, config: &EngineConfig) -> Result<(), EngineError> {
        self.config = Some(config.clone());
        self.hs = Hs::Start;
        Ok(())
    }

    fn add_ca_cert(&mut self, der: Arc<[u8]>) -> Result<(), EngineError> {
        self.ca.push(der);
        Ok(())
    }

    fn set_own_cert(&mut self, cert: Arc<[u8]>, key: &[u8]) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::BadInput);
        }
        self.own_cert = Some(cert);
        Ok(())
    }

    fn set_psk(&mut self, psk: &[u8], _identity: &[u8]) -> Result<(), EngineError> {
        self.psk = Some(psk.to_vec());
        Ok(())
    }

    fn setup(&mut self) -> Result<(), EngineError> {
        if self.config.is_none() {
            return Err(EngineError::BadInput);
        }
        Ok(())
    }

    fn handshake_step(&mut self, bio: &mut dyn Bio) -> Result<(), EngineError> {
        loop {
            match self.hs {
                Hs::Start => {
                    if self.role() == Role::Client {
                        self.client_hello(bio)?;
                        self.hs = Hs::ClientWaitHello;
                    } else {
                        self.hs = Hs::ServerWaitHello;
                    }
                }
                Hs::ClientWaitHello => {
                    let (ty, p) = self.recv_handshake(bio)?;
                    match ty {
                        HELLO_VERIFY => {
                            self.cookie = p;
                            self.client_hello(bio)?;
                        }
                        SERVER_HELLO => return self.client_finish(bio, &p),
                        CLOSE_NOTIFY => return Err(EngineError::PeerCloseNotify),
                        _ => {}
                    }
                }
                Hs::ServerWaitHello => {
                    let (ty, p) = self.recv_handshake(bio)?;
                    match ty {
                        CLIENT_HELLO => self.server_hello(bio, &p)?,
                        CLOSE_NOTIFY => return Err(EngineError::PeerCloseNotify),
                        _ => {}
                    }
                }
                Hs::ServerWaitFinished => {
                    let (ty, _) = self.recv_handshake(bio)?;
                    match ty {
                        CLIENT_FINISHED => {
                            self.finish(bio);
                            return Ok(());
                        }
                        CLIENT_HELLO => {
                            let flight = self.last_flight.clone();
                            bio.send(&flight)?;
                        }
                        CLOSE_NOTIFY => return Err(EngineError::PeerCloseNotify),
                        _ => {}
                    }
                }
                Hs::Established => return Ok(()),
            }
        }
    }

    fn read(&mut self, bio: &mut dyn Bio, buf: &mut [u8]) -> Result<usize, EngineError> {
        if self.hs != Hs::Established {
            return Err(EngineError::BadInput);
        }

        if buf.is_empty() {
            if self.plain.is_empty() {
                let (ty, p) = self.next_record(bio)?;
                self.handle_record(ty, p)?;
            }
            return Ok(0);
        }

        loop {
            if !self.plain.is_empty() {
                let n = buf.len().min(self.plain.len());
                for (b, d) in buf.iter_mut().zip(self.plain.drain(..n)) {
                    *b = d;
                }
                return Ok(n);
            }
            let (ty, p) = self.next_record(bio)?;
            self.handle_record(ty, p)?;
        }
    }

    fn write(&mut self, bio: &mut dyn Bio, buf: &[u8]) -> Result<usize, EngineError> {
        if self.hs != Hs::Established {
            return Err(EngineError::BadInput);
        }
        let key = self.key()?;
        bio.send(&record(APP_DATA, &crypt(&key, buf)))?;
        Ok(buf.len())
    }

    fn close_notify(&mut self, bio: &mut dyn Bio) -> Result<(), EngineError> {
        bio.send(&record(CLOSE_NOTIFY, &[]))?;
        Ok(())
    }

    fn bytes_available(&self) -> usize {
        self.plain.len()
    }

    fn session_reset(&mut self) -> Result<(), EngineError> {
        self.hs = Hs::Start;
        self.rx.clear();
        self.plain.clear();
        self.cookie.clear();
        self.resume = None;
        self.session = None;
        self.last_flight.clear();
        self.started = None;
        Ok(())
    }

    fn save_session(&self) -> Result<Vec<u8>, EngineError> {
        let s = self.session.as_ref().ok_or(EngineError::BadInput)?;
        let mut v = s.id.clone();
        v.extend_from_slice(&s.cert);
        if self.truncate_saves.load(Ordering::SeqCst) {
            v.truncate(4);
        }
        Ok(v)
    }

    fn load_session(&mut self, session: &[u8]) -> Result<(), EngineError> {
        if session.len() < 8 {
            return Err(EngineError::BadInput);
        }
        self.resume = Some(Session {
            id: session[..8].to_vec(),
            cert: session[8..].to_vec(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct ToyEngines {
    pub stats: Arc<Stats>,
    ids: Arc<AtomicU64>,
    /// Saved sessions come out too short to load again.
    pub truncate_saves: Arc<AtomicBool>,
}

impl ToyEngines {
    pub fn new() -> Arc<Self> {
        Arc::new(ToyEngines {
            stats: Arc::new(Stats::default()),
            ids: Arc::new(AtomicU64::new(0x0101_0101_0101_0101)),
            truncate_saves: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl EngineProvider for ToyEngines {
    fn new_engine(&self) -> Result<Box<dyn Engine>, EngineError> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ToyEngine {
            stats: self.stats.clone(),
            ids: self.ids.clone(),
            truncate_saves: self.truncate_saves.clone(),
            config: None,
            ca: Vec::new(),
            own_cert: None,
            psk: None,
            hs: Hs::Start,
            rx: Vec::new(),
            plain: VecDeque::new(),
            cookie: Vec::new(),
            resume: None,
            session: None,
            last_flight: Vec::new(),
            started: None,
            timeout: Duration::from_secs(1),
        }))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// CA trusting the test server.
pub const CA_TAG: SecTag = 1;
/// Server certificate and key.
pub const SERVER_TAG: SecTag = 2;
/// CA trusting some other server.
pub const OTHER_CA_TAG: SecTag = 3;

pub const HOSTNAME: &[u8] = b"server.test";

pub struct Setup {
    pub net: Net,
    pub engines: Arc<ToyEngines>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub layer: SecureSockets,
}

impl Setup {
    pub fn stats(&self) -> &Stats {
        &self.engines.stats
    }
}

pub fn setup() -> Setup {
    setup_with(Config::default())
}

pub fn setup_with(config: Config) -> Setup {
    let _ = env_logger::try_init();

    let net = Net::new();
    let engines = ToyEngines::new();

    let credentials = Arc::new(MemoryCredentialStore::new());
    credentials
        .add(CA_TAG, CredentialKind::CaCertificate, SERVER_CERT)
        .unwrap();
    credentials
        .add(SERVER_TAG, CredentialKind::OwnCertificate, SERVER_CERT)
        .unwrap();
    credentials
        .add(SERVER_TAG, CredentialKind::PrivateKey, b"server-key")
        .unwrap();
    credentials
        .add(OTHER_CA_TAG, CredentialKind::CaCertificate, OTHER_CERT)
        .unwrap();

    let layer = SecureSockets::new(
        config,
        Arc::new(net.clone()),
        engines.clone(),
        credentials.clone(),
    );

    Setup {
        net,
        engines,
        credentials,
        layer,
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn int(v: i32) -> [u8; 4] {
    v.to_ne_bytes()
}

pub fn tags(t: &[SecTag]) -> Vec<u8> {
    t.iter().flat_map(|t| t.to_ne_bytes()).collect()
}

/// A listening TLS server with the server certificate.
pub fn tls_server(s: &Setup, port: u16) -> SecureSocket {
    let mut sock = s
        .layer
        .socket(AddressFamily::Inet, SocketType::Stream, IPPROTO_TLS_1_2)
        .expect("server socket");
    sock.setsockopt(SOL_TLS, TLS_SEC_TAG_LIST, &tags(&[SERVER_TAG]))
        .expect("server tags");
    sock.bind(addr(port)).expect("bind");
    sock.listen(4).expect("listen");
    sock
}

/// A TLS client trusting the server certificate.
pub fn tls_client(s: &Setup) -> SecureSocket {
    let mut sock = s
        .layer
        .socket(AddressFamily::Inet, SocketType::Stream, IPPROTO_TLS_1_2)
        .expect("client socket");
    sock.setsockopt(SOL_TLS, TLS_SEC_TAG_LIST, &tags(&[CA_TAG]))
        .expect("client tags");
    sock.setsockopt(SOL_TLS, TLS_HOSTNAME, HOSTNAME)
        .expect("hostname");
    sock
}

/// Connect `client` to `listener`, returning the accepted socket.
pub fn connect(client: &mut SecureSocket, listener: &mut SecureSocket, port: u16) -> SecureSocket {
    std::thread::scope(|sc| {
        let h = sc.spawn(|| listener.accept());
        client.connect(addr(port)).expect("connect");
        let (accepted, _) = h.join().unwrap().expect("accept");
        accepted
    })
}

/// A bound DTLS server with the server certificate.
pub fn dtls_server(s: &Setup, port: u16) -> SecureSocket {
    let mut sock = s
        .layer
        .socket(AddressFamily::Inet, SocketType::Datagram, IPPROTO_DTLS_1_2)
        .expect("dtls server socket");
    sock.setsockopt(SOL_TLS, TLS_SEC_TAG_LIST, &tags(&[SERVER_TAG]))
        .expect("server tags");
    sock.setsockopt(SOL_TLS, TLS_DTLS_ROLE, &int(TLS_DTLS_ROLE_SERVER))
        .expect("role");
    sock.bind(addr(port)).expect("bind");
    sock
}

/// A DTLS client trusting the server certificate.
pub fn dtls_client(s: &Setup) -> SecureSocket {
    let mut sock = s
        .layer
        .socket(AddressFamily::Inet, SocketType::Datagram, IPPROTO_DTLS_1_2)
        .expect("dtls client socket");
    sock.setsockopt(SOL_TLS, TLS_SEC_TAG_LIST, &tags(&[CA_TAG]))
        .expect("client tags");
    sock.setsockopt(SOL_TLS, TLS_HOSTNAME, HOSTNAME)
        .expect("hostname");
    sock
}

/// A plain datagram socket speaking the toy protocol by hand.
pub struct RawPeer {
    pub sock: MemSocket,
    pub session_id: Vec<u8>,
}

impl RawPeer {
    pub fn new(s: &Setup, port: u16) -> Self {
        let mut sock = s.net.socket(SocketType::Datagram);
        sock.bind(addr(port)).expect("raw bind");
        RawPeer {
            sock,
            session_id: Vec::new(),
        }
    }

    pub fn send(&mut self, to: SocketAddr, rec: &[u8]) {
        self.sock
            .send_to(rec, MsgFlags::empty(), Some(to))
            .expect("raw send");
    }

    /// Next record, waiting up to one second.
    pub fn recv(&mut self) -> (u8, Vec<u8>) {
        let ready = self
            .sock
            .wait(PollFlags::IN, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(!ready.is_empty(), "raw peer: nothing received");
        let mut buf = [0u8; 2048];
        let (n, _) = self.sock.recv_from(&mut buf, MsgFlags::DONTWAIT).unwrap();
        let (ty, p, _) = parse_record(&buf[..n]).expect("raw peer: bad record");
        (ty, p)
    }

    pub fn send_app(&mut self, to: SocketAddr, data: &[u8]) {
        let rec = record(APP_DATA, &crypt(&self.session_id, data));
        self.send(to, &rec);
    }
}

/// Port the DTLS servers of the tests bind to.
pub const DTLS_PORT: u16 = 5684;

/// Complete a handshake between `server` and a hand driven peer, using
/// non-blocking receives on the server.
pub fn handshake_raw(server: &mut SecureSocket, raw: &mut RawPeer) {
    let to = addr(DTLS_PORT);
    let mut buf = [0u8; 64];

    raw.send(to, &client_hello(&[], &[]));
    assert_eq!(
        server.recv(&mut buf, MsgFlags::DONTWAIT),
        Err(Error::WouldBlock)
    );

    let (ty, cookie) = raw.recv();
    assert_eq!(ty, HELLO_VERIFY);

    raw.send(to, &client_hello(&cookie, &[]));
    assert_eq!(
        server.recv(&mut buf, MsgFlags::DONTWAIT),
        Err(Error::WouldBlock)
    );

    let (ty, hello) = raw.recv();
    assert_eq!(ty, SERVER_HELLO);
    raw.session_id = hello[..8].to_vec();

    raw.send(to, &record(CLIENT_FINISHED, &[]));
}

/// Wait for `cond` for up to a second.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

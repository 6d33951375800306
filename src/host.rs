//! Host engine.
//!
//! [`Host`] owns all ATT and GATT state for every connection and is driven
//! entirely through `&mut self` methods, which makes it the single execution
//! context for all protocol transitions. Inputs arrive from the transport and
//! security collaborators, outputs leave through the [`Transport`] trait and
//! the [`Event`] queue, and time is injected via [`Host::poll_timers`].

use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use structbuf::StructBuf;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::att::{Bearer, Request, DEFAULT_MTU, EATT_MIN_MTU, MAX_MTU};
use crate::gatt::{self, Db, ServiceDef};
use crate::le::Peer;
use crate::util::{earliest, name_of, Slab, SlabKey, Timer};
use crate::{att, Result};

/// Transport and security collaborator. Implementations segment and
/// reassemble PDUs, provide flow control, and report link security.
pub trait Transport: Send + 'static {
    /// Sends a PDU on the specified channel. Ownership of the buffer is
    /// returned to the caller if the send fails.
    fn send(&mut self, ch: ChanId, pdu: StructBuf) -> std::result::Result<(), SendError>;

    /// Disconnects the specified connection. The transport must eventually
    /// call [`Host::disconnected`].
    fn disconnect(&mut self, conn: ConnId);

    /// Returns the current link security properties.
    fn security(&self, conn: ConnId) -> ConnSec;

    /// Requests a security level upgrade. Returns `false` if the procedure
    /// cannot be started. The result is reported via
    /// [`Host::encryption_changed`].
    fn raise_security(&mut self, conn: ConnId, level: SecLevel) -> bool;

    /// Returns whether the peer is bonded.
    fn is_bonded(&self, peer: Peer) -> bool;

    /// Appends a 12-byte authentication signature to a signed write command
    /// ([Vol 3] Part H, Section 2.4.5). Returns `false` if signing is not
    /// possible.
    fn sign(&mut self, _conn: ConnId, _pdu: &mut StructBuf) -> bool {
        false
    }

    /// Verifies the signature of a received signed write command.
    fn verify_signature(&mut self, _conn: ConnId, _pdu: &[u8]) -> bool {
        false
    }

    /// Requests `n` additional enhanced ATT channels. Established channels
    /// are reported via [`Host::chan_connected`].
    fn connect_enhanced(&mut self, _conn: ConnId, _n: usize) {}
}

/// [`Transport::send`] error.
#[derive(Debug)]
pub enum SendError {
    /// The channel has no credits or buffers. The transport must call
    /// [`Host::ready`] when the channel can accept more data.
    WouldBlock(StructBuf),
    /// The channel is unusable.
    Failed(StructBuf),
}

/// Connection identifier.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnId(pub(crate) SlabKey);

impl Debug for ConnId {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(ConnId), self.0.index())
    }
}

impl Display for ConnId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Channel identifier ([Vol 3] Part A, Section 2.1).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Cid(pub u16);

impl Cid {
    /// Fixed ATT channel.
    pub const ATT: Self = Self(0x0004);
}

impl Debug for Cid {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", name_of!(Cid), self.0)
    }
}

/// Channel of a specific connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChanId {
    pub conn: ConnId,
    pub cid: Cid,
}

impl ChanId {
    /// Returns the fixed ATT channel of the specified connection.
    #[inline(always)]
    #[must_use]
    pub const fn att(conn: ConnId) -> Self {
        Self { conn, cid: Cid::ATT }
    }
}

impl Display for ChanId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:#06X}", self.conn, self.cid.0)
    }
}

/// LE security mode 1 levels ([Vol 3] Part C, Section 10.2.1).
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize,
)]
#[repr(u8)]
pub enum SecLevel {
    /// No security.
    #[default]
    Open = 1,
    /// Unauthenticated pairing with encryption.
    Encrypted = 2,
    /// Authenticated pairing with encryption.
    Authenticated = 3,
    /// Authenticated LE Secure Connections pairing with a 128-bit key.
    Secure = 4,
}

/// Link security properties.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnSec {
    pub level: SecLevel,
    /// Encryption key size in octets.
    pub key_len: u8,
    /// Whether the peer is authorized by the application.
    pub authz: bool,
}

/// Host configuration.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local receive MTU.
    pub mtu: u16,
    /// Maximum number of connections.
    pub max_conns: usize,
    /// Maximum number of ATT channels per connection.
    pub max_chans: usize,
    /// Size of the shared request pool.
    pub max_reqs: usize,
    /// Maximum number of queued prepared writes per connection.
    pub prepare_count: usize,
    /// Maximum number of peer entries per CCC descriptor.
    pub ccc_entries: usize,
    /// Multiple notification batch flush delay.
    pub notify_batch_delay: Duration,
    /// Service Changed indication debounce delay.
    pub sc_delay: Duration,
    /// Database hash recomputation delay.
    pub hash_delay: Duration,
    /// Peer configuration persistence delay.
    pub store_delay: Duration,
    /// Number of enhanced ATT channels to open after encryption.
    pub eatt_chans: usize,
    /// Delay before opening enhanced ATT channels.
    pub eatt_delay: Duration,
    /// ATT transaction timeout ([Vol 3] Part F, Section 3.3.3).
    pub timeout: Duration,
}

impl Config {
    /// Returns the local receive MTU clamped to the valid range.
    #[inline]
    #[must_use]
    pub(crate) fn rx_mtu(&self) -> u16 {
        self.mtu.clamp(DEFAULT_MTU, MAX_MTU)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 247,
            max_conns: 4,
            max_chans: 4,
            max_reqs: 16,
            prepare_count: 16,
            ccc_entries: 8,
            notify_batch_delay: Duration::from_millis(10),
            sc_delay: Duration::from_millis(10),
            hash_delay: Duration::from_millis(10),
            store_delay: Duration::from_millis(50),
            eatt_chans: 0,
            eatt_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Outbound host event.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// Maximum ATT MTU of a connection increased.
    MtuChanged { conn: ConnId, tx: u16, rx: u16 },
    /// Bonded peer configuration must be persisted.
    PersistPeer { peer: Peer, cache: gatt::Cache },
    /// Database hash must be persisted.
    PersistHash(u128),
    /// Persisted peer configuration must be removed.
    ClearPeer(Peer),
}

/// Connection state.
pub(crate) struct Conn<T: Transport> {
    pub id: ConnId,
    pub peer: Peer,
    pub br: Bearer<T>,
    /// Queued prepared writes.
    pub prep: Vec<att::Prepared>,
    /// Pending multiple handle value notification.
    pub batch: gatt::Batch,
    /// `DatabaseOutOfSync` was sent during this connection.
    pub oos_sent: bool,
    /// The database hash was read during this connection.
    pub hash_read: bool,
    /// Enhanced channel connect timer.
    pub eatt: Timer,
}

/// Host engine. See the module documentation.
pub struct Host<T: Transport> {
    pub(crate) tr: T,
    pub(crate) cfg: Config,
    pub(crate) conns: Slab<Conn<T>>,
    pub(crate) reqs: Slab<Request<T>>,
    pub(crate) db: Db,
    pub(crate) srv: gatt::Server,
    pub(crate) clt: gatt::Client<T>,
    pub(crate) events: VecDeque<Event>,
}

impl<T: Transport> Host<T> {
    /// Creates a new host with the GATT service followed by static services.
    /// Static services receive sequential handles in declaration order and do
    /// not generate Service Changed indications.
    pub fn new(tr: T, cfg: Config, svcs: impl IntoIterator<Item = ServiceDef>) -> Result<Self> {
        let mut db = Db::default();
        let gatt = gatt::service(cfg.eatt_chans > 0);
        db.register(gatt)?;
        for s in svcs {
            db.register(s)?;
        }
        Ok(Self {
            tr,
            conns: Slab::with_capacity(cfg.max_conns),
            reqs: Slab::with_capacity(cfg.max_reqs),
            db,
            srv: gatt::Server::default(),
            clt: gatt::Client::default(),
            events: VecDeque::new(),
            cfg,
        })
    }

    /// Returns the host configuration.
    #[inline(always)]
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    /// Returns the transport.
    #[inline(always)]
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.tr
    }

    /// Returns the transport.
    #[inline(always)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.tr
    }

    /// Returns the attribute database.
    #[inline(always)]
    #[must_use]
    pub const fn db(&self) -> &Db {
        &self.db
    }

    /// Returns the peer of the specified connection.
    #[inline]
    #[must_use]
    pub fn peer(&self, conn: ConnId) -> Option<Peer> {
        self.conns.get(conn.0).map(|cn| cn.peer)
    }

    /// Returns the maximum transmit MTU of the connection.
    #[inline]
    #[must_use]
    pub fn mtu(&self, conn: ConnId) -> Option<u16> {
        self.conns.get(conn.0).map(|cn| cn.br.max_mtu().0)
    }

    /// Returns whether another request can be allocated from the pool.
    #[inline(always)]
    #[must_use]
    pub fn can_request(&self) -> bool {
        !self.reqs.is_full()
    }

    /// Registers a new connection with a fixed ATT channel.
    pub fn connected(&mut self, peer: Peer) -> Result<ConnId> {
        let cn = Conn {
            id: ConnId(SlabKey::default()),
            peer,
            br: Bearer::new(),
            prep: Vec::new(),
            batch: gatt::Batch::default(),
            oos_sent: false,
            hash_read: false,
            eatt: Timer::default(),
        };
        let key = self.conns.insert(cn).map_err(|_| att::Error::NoResources)?;
        let id = ConnId(key);
        let max_chans = self.cfg.max_chans;
        if let Some(cn) = self.conns.get_mut(key) {
            cn.id = id;
            // Fixed channel starts with the default MTU until exchange
            // ([Vol 3] Part F, Section 3.2.8).
            cn.br.attach(Cid::ATT, false, DEFAULT_MTU, DEFAULT_MTU, max_chans)?;
        }
        info!("{id} connected to {peer}");
        self.gatt_connected(id);
        self.resubscribe(id);
        Ok(id)
    }

    /// Tears down a connection. Queued requests complete with
    /// [`att::Error::ConnectionReset`]. Calling this for an unknown
    /// connection is a no-op.
    #[inline]
    pub fn disconnected(&mut self, conn: ConnId) {
        self.teardown(conn, None);
    }

    /// Attaches an enhanced ATT channel.
    pub fn chan_connected(&mut self, ch: ChanId, rx_mtu: u16, tx_mtu: u16) -> Result<()> {
        let max_chans = self.cfg.max_chans;
        let Some(cn) = self.conns.get_mut(ch.conn.0) else {
            return Err(att::Error::NotConnected);
        };
        let (rx, tx) = (rx_mtu.max(EATT_MIN_MTU), tx_mtu.max(EATT_MIN_MTU));
        cn.br.attach(ch.cid, true, rx, tx, max_chans)?;
        debug!("{ch} attached (rx={rx} tx={tx})");
        self.mtu_updated(ch.conn);
        self.dispatch(ch.conn);
        Ok(())
    }

    /// Detaches an ATT channel. Detaching the last channel tears down the
    /// connection.
    pub fn chan_disconnected(&mut self, ch: ChanId) {
        let Some(cn) = self.conns.get_mut(ch.conn.0) else { return };
        let Some(c) = cn.br.detach(ch.cid) else { return };
        debug!("{ch} detached");
        if cn.br.is_empty() {
            self.teardown(ch.conn, None);
            return;
        }
        self.release_chan(ch.conn, c);
        self.dispatch(ch.conn);
    }

    /// Updates the MTU of an enhanced channel after reconfiguration.
    pub fn chan_mtu_changed(&mut self, ch: ChanId, rx_mtu: u16, tx_mtu: u16) {
        let Some(c) = (self.conns.get_mut(ch.conn.0)).and_then(|cn| cn.br.chan_mut(ch.cid)) else {
            return;
        };
        c.set_mtu(rx_mtu, tx_mtu);
        self.mtu_updated(ch.conn);
    }

    /// Resumes sending on a channel that previously returned
    /// [`SendError::WouldBlock`].
    pub fn ready(&mut self, ch: ChanId) {
        if let Some(c) = (self.conns.get_mut(ch.conn.0)).and_then(|cn| cn.br.chan_mut(ch.cid)) {
            c.blocked = false;
            self.dispatch(ch.conn);
        }
    }

    /// Handles a link security change. Requests waiting for a security
    /// upgrade are resent or failed, enhanced channel setup is scheduled, and
    /// pending subscriptions are restored.
    pub fn encryption_changed(&mut self, conn: ConnId, ok: bool) {
        let (eatt_chans, eatt_delay) = (self.cfg.eatt_chans, self.cfg.eatt_delay);
        let Some(cn) = self.conns.get_mut(conn.0) else { return };
        debug!("{conn} encryption changed (ok={ok})");
        if ok && eatt_chans > 0 && !cn.br.has_enhanced() {
            cn.eatt.start_once(eatt_delay);
        }
        self.retry_parked(conn, ok);
        if ok {
            self.resubscribe(conn);
        }
    }

    /// Returns the next outbound event.
    #[inline]
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Returns the earliest timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let conns = self.conns.iter().flat_map(|(_, cn)| {
            (cn.br.deadlines()).chain([cn.batch.deadline(), cn.eatt.deadline()])
        });
        earliest(conns.chain(self.srv.deadlines()))
    }

    /// Processes all timers that expired at or before `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        for id in self.conn_ids() {
            let Some(cn) = self.conns.get_mut(id.0) else { continue };
            if let Some(cid) = cn.br.expired(now) {
                self.req_timeout(ChanId { conn: id, cid });
                continue;
            }
            if cn.batch.expire(now) {
                self.flush_batch(id);
            }
            let n = self.cfg.eatt_chans;
            if let Some(cn) = self.conns.get_mut(id.0) {
                if cn.eatt.expire(now) && !cn.br.has_enhanced() {
                    trace!("{id} connecting {n} enhanced channel(s)");
                    self.tr.connect_enhanced(id, n);
                }
            }
        }
        self.gatt_timers(now);
    }

    /// Returns the IDs of all connections.
    pub(crate) fn conn_ids(&self) -> Vec<ConnId> {
        self.conns.iter().map(|(k, _)| ConnId(k)).collect()
    }

    /// Returns connection state.
    #[inline(always)]
    pub(crate) fn conn(&self, id: ConnId) -> Option<&Conn<T>> {
        self.conns.get(id.0)
    }

    /// Returns mutable connection state.
    #[inline(always)]
    pub(crate) fn conn_mut(&mut self, id: ConnId) -> Option<&mut Conn<T>> {
        self.conns.get_mut(id.0)
    }

    /// Recomputes bearer MTUs and raises [`Event::MtuChanged`] if either
    /// maximum increased.
    pub(crate) fn mtu_updated(&mut self, id: ConnId) {
        let Some(cn) = self.conns.get_mut(id.0) else { return };
        if let Some((tx, rx)) = cn.br.update_max_mtu() {
            debug!("{id} MTU changed (tx={tx} rx={rx})");
            self.events.push_back(Event::MtuChanged { conn: id, tx, rx });
        }
    }

    /// Removes the connection and fails all of its requests and buffers. The
    /// request in `timeout` completes with [`att::Error::Timeout`].
    pub(crate) fn teardown(&mut self, id: ConnId, timeout: Option<(att::ReqId, att::Opcode)>) {
        let Some(cn) = self.conns.remove(id.0) else { return };
        info!("{id} disconnected from {}", cn.peer);
        let Conn { peer, br, .. } = cn;
        let (reqs, bufs) = br.drain();
        for r in reqs {
            let Some(req) = self.reqs.remove(r.0) else { continue };
            let err = match timeout {
                Some((t, op)) if t == r => att::Error::Timeout(op),
                _ => att::Error::ConnectionReset,
            };
            req.complete(self, id, Err(err));
        }
        for b in bufs {
            b.complete(self, id, Err(att::Error::ConnectionReset));
        }
        self.gatt_disconnected(id, peer);
    }

    /// Fails everything owned by a detached channel.
    pub(crate) fn release_chan(&mut self, id: ConnId, c: att::Chan<T>) {
        let (req, bufs) = c.drain();
        if let Some(req) = req.and_then(|r| self.reqs.remove(r.0)) {
            warn!("{id} request {} reset by channel detach", req.op);
            req.complete(self, id, Err(att::Error::ConnectionReset));
        }
        for b in bufs {
            b.complete(self, id, Err(att::Error::ConnectionReset));
        }
    }
}

impl<T: Transport + Debug> Debug for Host<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("tr", &self.tr)
            .field("conns", &self.conns.len())
            .field("reqs", &self.reqs.len())
            .finish_non_exhaustive()
    }
}

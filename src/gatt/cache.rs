use std::collections::BTreeMap;

use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use gattic_const::Characteristic;

use crate::host::{ConnId, Event, Host, Transport};
use crate::le::Peer;
use crate::util::Timer;

use super::*;

/// Persisted per-peer server state ([Vol 3] Part G, Section 2.5.2).
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Cache {
    /// Client Supported Features.
    pub features: ClientFeatures,
    /// The peer is change-aware.
    pub aware: bool,
    /// Non-zero CCC values.
    pub ccc: Vec<(Handle, u16)>,
    /// Service Changed range that has not been indicated yet.
    pub sc: Option<HandleRange>,
}

/// Server state of one peer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PeerCfg {
    cf: ClientFeatures,
    aware: bool,
    sc: Option<HandleRange>,
    /// A Service Changed indication is outstanding.
    sc_busy: bool,
    /// State must be persisted.
    dirty: bool,
}

impl Default for PeerCfg {
    fn default() -> Self {
        Self {
            cf: ClientFeatures::empty(),
            aware: true,
            sc: None,
            sc_busy: false,
            dirty: false,
        }
    }
}

/// GATT server state that is not part of the database: client features,
/// change awareness ([Vol 3] Part G, Section 2.5.2.1), pending Service
/// Changed ranges, and the database hash.
#[derive(Debug, Default)]
pub(crate) struct Server {
    peers: BTreeMap<Peer, PeerCfg>,
    hash: Option<u128>,
    sc_timer: Timer,
    hash_timer: Timer,
    store_timer: Timer,
}

impl Server {
    /// Returns all timer deadlines.
    #[inline]
    pub fn deadlines(&self) -> impl Iterator<Item = Option<Instant>> {
        [
            self.sc_timer.deadline(),
            self.hash_timer.deadline(),
            self.store_timer.deadline(),
        ]
        .into_iter()
    }

    /// Returns the Client Supported Features of a peer.
    #[inline]
    pub fn features(&self, peer: Peer) -> ClientFeatures {
        self.peers.get(&peer).map_or(ClientFeatures::empty(), |p| p.cf)
    }
}

/// Database mutation and Robust Caching ([Vol 3] Part G, Section 2.5.2).
impl<T: Transport> Host<T> {
    /// Registers a dynamic service. Peers are notified via Service Changed
    /// indications and Robust Caching clients become change-unaware.
    pub fn register(&mut self, def: ServiceDef) -> crate::Result<ServiceId> {
        let (id, r) = self.db.register(def)?;
        info!("Registered service at {}..={}", r.start(), r.end());
        self.db_changed(r);
        Ok(id)
    }

    /// Unregisters a dynamic service, returning its definition with all CCC
    /// state cleared.
    pub fn unregister(&mut self, id: ServiceId) -> crate::Result<ServiceDef> {
        let (mut def, r) = self.db.unregister(id)?;
        info!("Unregistered service from {}..={}", r.start(), r.end());
        let mut peers = SmallVec::<[Peer; 4]>::new();
        let mut changed = Vec::new();
        for c in def.attrs.iter_mut().filter_map(Attr::ccc_mut) {
            let (p, f) = c.clear();
            peers.extend(p);
            changed.extend(f);
        }
        for (f, v) in changed {
            f(v);
        }
        peers.sort_unstable();
        peers.dedup();
        for peer in peers {
            if self.tr.is_bonded(peer) {
                let cache = self.peer_cache(peer);
                self.events.push_back(Event::PersistPeer { peer, cache });
            }
        }
        self.db_changed(r);
        Ok(def)
    }

    /// Loads the persisted state of a bonded peer. This may be called at
    /// startup for every bonded peer or when the peer connects.
    pub fn restore(&mut self, peer: Peer, cache: &Cache) {
        debug!("Restoring GATT state of {peer}");
        let p = self.srv.peers.entry(peer).or_default();
        p.cf = cache.features;
        p.aware = cache.aware;
        p.sc = cache.sc;
        p.dirty = false;
        let pending = p.sc.is_some();
        self.clear_cccs(peer, HandleRange::ALL);
        self.restore_cccs(peer, &cache.ccc);
        self.update_cccs();
        if pending && self.connected_peers().contains(&peer) {
            self.srv.sc_timer.start_once(self.cfg.sc_delay);
        }
    }

    /// Compares the current database hash with the persisted one. On a
    /// mismatch every known bonded peer becomes change-unaware and a
    /// Service Changed indication for the whole database is scheduled.
    pub fn load_hash(&mut self, stored: Option<u128>) {
        let hash = self.db.hash();
        self.srv.hash = Some(hash);
        if stored == Some(hash) {
            return;
        }
        if stored.is_some() {
            info!("Database hash changed to {hash:#034X}");
            let bonded: SmallVec<[Peer; 4]> = (self.srv.peers.keys().copied())
                .filter(|&p| self.tr.is_bonded(p))
                .collect();
            for peer in bonded {
                if let Some(p) = self.srv.peers.get_mut(&peer) {
                    p.aware = false;
                }
                self.schedule_store(peer);
            }
            self.signal_sc(HandleRange::ALL);
        }
        self.events.push_back(Event::PersistHash(hash));
    }

    /// Removes all state of a peer that is no longer bonded.
    pub fn forget(&mut self, peer: Peer) {
        debug!("Forgetting {peer}");
        self.srv.peers.remove(&peer);
        self.clear_cccs(peer, HandleRange::ALL);
        self.update_cccs();
        self.forget_subscriptions(peer);
        self.events.push_back(Event::ClearPeer(peer));
    }

    /// Returns the persistable state of a peer.
    #[must_use]
    pub fn peer_cache(&self, peer: Peer) -> Cache {
        let p = self.srv.peers.get(&peer).copied().unwrap_or_default();
        let ccc = (self.db.cccs())
            .filter_map(|(h, c)| {
                let v = c.get(peer);
                (!v.is_empty()).then_some((h, v.bits()))
            })
            .collect();
        Cache {
            features: p.cf,
            aware: p.aware,
            ccc,
            sc: p.sc,
        }
    }

    /// Initializes server state of a new connection.
    pub(crate) fn gatt_connected(&mut self, id: ConnId) {
        let Some(peer) = self.peer(id) else { return };
        let bonded = self.tr.is_bonded(peer);
        if !bonded || !self.srv.peers.contains_key(&peer) {
            self.srv.peers.insert(peer, PeerCfg::default());
        }
        self.update_cccs();
        if (self.srv.peers.get(&peer)).is_some_and(|p| p.sc.is_some()) {
            self.srv.sc_timer.start_once(self.cfg.sc_delay);
        }
    }

    /// Releases server and client state of a closed connection. Bonded
    /// peers keep their configuration.
    pub(crate) fn gatt_disconnected(&mut self, id: ConnId, peer: Peer) {
        let bonded = self.tr.is_bonded(peer);
        if bonded {
            if let Some(p) = self.srv.peers.get_mut(&peer) {
                p.sc_busy = false;
            }
        } else {
            self.srv.peers.remove(&peer);
            self.clear_cccs(peer, HandleRange::ALL);
        }
        self.update_cccs();
        self.client_disconnected(id, peer, bonded);
    }

    /// Processes server timers.
    pub(crate) fn gatt_timers(&mut self, now: Instant) {
        if self.srv.hash_timer.expire(now) {
            let hash = self.db.hash();
            debug!("Database hash is {hash:#034X}");
            self.srv.hash = Some(hash);
            self.events.push_back(Event::PersistHash(hash));
        }
        if self.srv.sc_timer.expire(now) {
            self.send_sc();
        }
        if self.srv.store_timer.expire(now) {
            let dirty: SmallVec<[Peer; 4]> = (self.srv.peers.iter_mut())
                .filter_map(|(&peer, p)| std::mem::take(&mut p.dirty).then_some(peer))
                .collect();
            for peer in dirty {
                if self.tr.is_bonded(peer) {
                    let cache = self.peer_cache(peer);
                    trace!("Persisting {peer}");
                    self.events.push_back(Event::PersistPeer { peer, cache });
                }
            }
        }
    }

    /// Schedules persistence of a bonded peer's state.
    pub(crate) fn schedule_store(&mut self, peer: Peer) {
        if !self.tr.is_bonded(peer) {
            return;
        }
        self.srv.peers.entry(peer).or_default().dirty = true;
        self.srv.store_timer.start_once(self.cfg.store_delay);
    }

    /// Change-aware gate for incoming requests and commands
    /// ([Vol 3] Part G, Section 2.5.2.1). Returns `false` if the PDU must be
    /// rejected with `DatabaseOutOfSync` (requests) or dropped (commands).
    pub(crate) fn change_aware(&mut self, conn: ConnId, req: bool) -> bool {
        let Some(cn) = self.conns.get_mut(conn.0) else { return false };
        let peer = cn.peer;
        let Some(p) = self.srv.peers.get_mut(&peer) else { return true };
        if p.aware || !p.cf.contains(ClientFeatures::ROBUST_CACHING) {
            return true;
        }
        if !req {
            trace!("{conn} dropping command from change-unaware peer");
            return false;
        }
        if cn.hash_read || (cn.oos_sent && cn.br.fixed_only()) {
            debug!("{conn} peer is change-aware");
            p.aware = true;
            self.schedule_store(peer);
            return true;
        }
        if cn.oos_sent {
            return true;
        }
        debug!("{conn} peer is change-unaware");
        cn.oos_sent = true;
        false
    }

    /// Reads a host-managed GATT service value.
    pub(crate) fn read_builtin(&mut self, conn: ConnId, b: Builtin, r: &mut ReadReq) -> IoResult {
        match b {
            Builtin::ServiceChanged => r.complete([0; 4]),
            Builtin::ClientFeatures => r.complete([self.srv.features(r.peer()).bits()]),
            Builtin::DbHash => {
                let hash = match self.srv.hash {
                    Some(h) => h,
                    None => {
                        let h = self.db.hash();
                        self.srv.hash = Some(h);
                        h
                    }
                };
                if let Some(cn) = self.conns.get_mut(conn.0) {
                    cn.hash_read = true;
                }
                r.complete(hash.to_le_bytes())
            }
            Builtin::ServerFeatures(f) => r.complete([f.bits()]),
        }
    }

    /// Writes a host-managed GATT service value.
    pub(crate) fn write_builtin(&mut self, conn: ConnId, b: Builtin, w: &WriteReq) -> IoResult<()> {
        match b {
            Builtin::ClientFeatures => self.write_client_features(conn, w),
            _ => Err(ErrorCode::WriteNotPermitted),
        }
    }

    /// Handles a Client Supported Features write ([Vol 3] Part G,
    /// Section 7.2). Bits can only be set.
    fn write_client_features(&mut self, conn: ConnId, w: &WriteReq) -> IoResult<()> {
        if w.offset() > 1 {
            return Err(ErrorCode::InvalidOffset);
        }
        if w.offset() + w.value().len() > 1 {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        if w.flags().contains(WriteFlags::PREPARE) || w.value().is_empty() {
            return Ok(());
        }
        let peer = w.peer();
        let p = self.srv.peers.entry(peer).or_default();
        let cf = ClientFeatures::from_bits_truncate(w.value()[0]);
        if !cf.contains(p.cf) {
            debug!("{conn} attempted to clear client features");
            return Err(ErrorCode::ValueNotAllowed);
        }
        if cf == p.cf {
            return Ok(());
        }
        if cf.contains(ClientFeatures::ROBUST_CACHING) && !p.cf.contains(ClientFeatures::ROBUST_CACHING) {
            p.aware = true;
        }
        debug!("{conn} client features {cf:?}");
        p.cf = cf;
        self.schedule_store(peer);
        Ok(())
    }

    /// Handles a database mutation affecting range `r`.
    fn db_changed(&mut self, r: HandleRange) {
        self.srv.hash = None;
        self.srv.hash_timer.start_once(self.cfg.hash_delay);
        let unaware: SmallVec<[Peer; 4]> = (self.srv.peers.iter_mut())
            .filter(|(_, p)| p.aware && p.cf.contains(ClientFeatures::ROBUST_CACHING))
            .map(|(&peer, p)| {
                p.aware = false;
                peer
            })
            .collect();
        for peer in unaware {
            trace!("{peer} is change-unaware");
            self.schedule_store(peer);
        }
        for (_, cn) in self.conns.iter_mut() {
            cn.hash_read = false;
            cn.oos_sent = false;
        }
        self.signal_sc(r);
    }

    /// Adds `r` to the pending Service Changed range of every peer that
    /// enabled Service Changed indications.
    fn signal_sc(&mut self, r: HandleRange) {
        let Some(ccc) = (self.db.builtin(Builtin::ServiceChanged))
            .and_then(|h| self.db.ccc_of(h))
            .and_then(|h| self.db.attr(h))
            .and_then(Attr::ccc)
        else {
            return;
        };
        let subs: SmallVec<[Peer; 4]> = (ccc.entries())
            .filter(|e| e.1.contains(Cccd::INDICATE))
            .map(|e| e.0)
            .collect();
        for peer in subs {
            let p = self.srv.peers.entry(peer).or_default();
            p.sc = Some(p.sc.map_or(r, |sc| sc.union(r)));
            self.schedule_store(peer);
        }
        self.srv.sc_timer.start_once(self.cfg.sc_delay);
    }

    /// Sends pending Service Changed indications to all connected peers
    /// without an outstanding one.
    fn send_sc(&mut self) {
        let Some(hdl) = self.db.builtin(Builtin::ServiceChanged) else { return };
        for conn in self.conn_ids() {
            let Some(peer) = self.peer(conn) else { continue };
            if !self.is_subscribed(conn, hdl, Cccd::INDICATE) {
                continue;
            }
            let Some(p) = self.srv.peers.get_mut(&peer).filter(|p| !p.sc_busy) else {
                continue;
            };
            let Some(r) = p.sc.take() else { continue };
            p.sc_busy = true;
            let mut val = [0; 4];
            val[..2].copy_from_slice(&r.start().get().to_le_bytes());
            val[2..].copy_from_slice(&r.end().get().to_le_bytes());
            debug!("{conn} indicating Service Changed {}..={}", r.start(), r.end());
            let done = crate::att::done(move |h: &mut Self, conn, res| {
                h.sc_done(conn, peer, r, res.map(|_| ()));
            });
            if let Err(e) = self.send_indication(conn, hdl, &val, done) {
                warn!("{conn} failed to indicate Service Changed: {e}");
                if let Some(p) = self.srv.peers.get_mut(&peer) {
                    p.sc = Some(p.sc.map_or(r, |sc| sc.union(r)));
                    p.sc_busy = false;
                }
                self.srv.sc_timer.start_once(self.cfg.sc_delay);
            }
        }
    }

    /// Completes a Service Changed indication.
    fn sc_done(&mut self, conn: ConnId, peer: Peer, r: HandleRange, res: crate::Result<()>) {
        let fixed_only = self.conn(conn).is_some_and(|cn| cn.br.fixed_only());
        let Some(p) = self.srv.peers.get_mut(&peer) else { return };
        p.sc_busy = false;
        match res {
            Ok(()) => {
                trace!("{conn} confirmed Service Changed");
                if fixed_only && !p.aware {
                    debug!("{conn} peer is change-aware");
                    p.aware = true;
                }
            }
            Err(e) => {
                debug!("{conn} Service Changed failed: {e}");
                p.sc = Some(p.sc.map_or(r, |sc| sc.union(r)));
            }
        }
        let pending = p.sc.is_some();
        self.schedule_store(peer);
        if pending && self.conn(conn).is_some() {
            self.srv.sc_timer.start_once(self.cfg.sc_delay);
        }
    }

    /// Returns whether `u` is the Database Hash characteristic type.
    #[inline]
    pub(crate) fn is_hash_type(u: Uuid) -> bool {
        u == Characteristic::DatabaseHash
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::host::tests::TestHost;

    /// Handles of the GATT service when EATT is disabled.
    const SC_CCC: u16 = 0x04;
    const CF: u16 = 0x06;
    const HASH: u16 = 0x08;

    fn new_service() -> ServiceDef {
        ServiceDef::primary(gattic_const::Service::Battery, |s| {
            s.ro_characteristic(Characteristic::BatteryLevel, crate::att::Access::READ, [50], |_| {});
        })
    }

    #[test]
    fn out_of_sync_once() {
        let mut h = TestHost::new();
        let conn = h.connect(true);
        h.recv_att(conn, &[0x12, CF as u8, 0x00, 0x01]);
        assert_eq!(h.sent(), vec![vec![0x13]]);
        h.register(new_service()).unwrap();

        // First request is rejected, the retry succeeds
        h.recv_att(conn, &[0x0A, 0x01, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x01, 0x0A, 0x01, 0x00, 0x12]]);
        h.recv_att(conn, &[0x0A, 0x01, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x0B, 0x01, 0x18]]);
        h.recv_att(conn, &[0x0A, 0x01, 0x00]);
        assert_eq!(h.sent().len(), 1);

        // Commands from a change-unaware peer are dropped
        h.register(new_service()).unwrap();
        h.recv_att(conn, &[0x52, CF as u8, 0x00, 0x01]);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn hash_read_makes_aware() {
        let mut h = TestHost::new();
        let conn = h.connect(true);
        h.recv_att(conn, &[0x12, CF as u8, 0x00, 0x01]);
        h.sent();
        h.register(new_service()).unwrap();
        h.recv_att(conn, &[0x0A, HASH as u8, 0x00]);
        let rsp = h.sent().pop().unwrap();
        assert_eq!(rsp[0], 0x0B);
        assert_eq!(rsp[1..], h.db().hash().to_le_bytes());
        h.recv_att(conn, &[0x0A, 0x01, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x0B, 0x01, 0x18]]);
        assert!(h.peer_cache(h.peer(conn).unwrap()).aware);
    }

    #[test]
    fn client_features() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        h.recv_att(conn, &[0x12, CF as u8, 0x00, 0x05]);
        assert_eq!(h.sent(), vec![vec![0x13]]);
        h.recv_att(conn, &[0x12, CF as u8, 0x00, 0x01]);
        assert_eq!(h.sent(), vec![vec![0x01, 0x12, CF as u8, 0x00, 0x13]]);
        h.recv_att(conn, &[0x12, CF as u8, 0x00, 0x01, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x01, 0x12, CF as u8, 0x00, 0x0D]]);
        h.recv_att(conn, &[0x0A, CF as u8, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x0B, 0x05]]);
    }

    #[test]
    fn service_changed() {
        let mut h = TestHost::new();
        let conn = h.connect(true);
        h.recv_att(conn, &[0x12, SC_CCC as u8, 0x00, 0x02, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x13]]);
        let id = h.register(new_service()).unwrap();
        let r = h.db().service_range(id).unwrap();
        h.advance(Duration::from_millis(20));
        let (s, e) = (r.start().get().to_le_bytes(), r.end().get().to_le_bytes());
        assert_eq!(h.sent(), vec![vec![0x1D, 0x03, 0x00, s[0], s[1], e[0], e[1]]]);

        // Changes while an indication is outstanding are coalesced
        let id2 = h.register(new_service()).unwrap();
        h.unregister(id).unwrap();
        h.advance(Duration::from_millis(20));
        assert!(h.sent().is_empty());
        h.recv_att(conn, &[0x1E]);
        h.advance(Duration::from_millis(20));
        let r2 = h.db().service_range(id2).unwrap();
        let (s, e) = (r.start().get().to_le_bytes(), r2.end().get().to_le_bytes());
        assert_eq!(h.sent(), vec![vec![0x1D, 0x03, 0x00, s[0], s[1], e[0], e[1]]]);
    }

    #[test]
    fn persist_and_restore() {
        let mut h = TestHost::new();
        let conn = h.connect(true);
        let peer = h.peer(conn).unwrap();
        h.recv_att(conn, &[0x12, SC_CCC as u8, 0x00, 0x02, 0x00]);
        h.recv_att(conn, &[0x12, CF as u8, 0x00, 0x01]);
        h.advance(Duration::from_millis(100));
        let want = Cache {
            features: ClientFeatures::ROBUST_CACHING,
            aware: true,
            ccc: vec![(Handle::new(SC_CCC).unwrap(), 0x02)],
            sc: None,
        };
        let ev: Vec<_> = std::iter::from_fn(|| h.next_event()).collect();
        assert!(ev.contains(&Event::PersistPeer { peer, cache: want.clone() }));

        // Disconnected bonded peer keeps a pending range
        h.disconnected(conn);
        h.register(new_service()).unwrap();
        let cache = h.peer_cache(peer);
        assert!(!cache.aware);
        assert!(cache.sc.is_some());

        let mut h2 = TestHost::new();
        h2.restore(peer, &cache);
        assert_eq!(h2.peer_cache(peer), cache);
        h2.forget(peer);
        assert_eq!(h2.peer_cache(peer), Cache { aware: true, ..Cache::default() });
        assert_eq!(h2.next_event(), Some(Event::ClearPeer(peer)));
    }

    #[test]
    fn load_hash() {
        let mut h = TestHost::new();
        let hash = h.db().hash();
        h.load_hash(Some(hash));
        assert_eq!(h.next_event(), None);
        h.load_hash(None);
        assert_eq!(h.next_event(), Some(Event::PersistHash(hash)));
        h.load_hash(Some(!hash));
        assert_eq!(h.next_event(), Some(Event::PersistHash(hash)));
    }
}

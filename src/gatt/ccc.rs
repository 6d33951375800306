use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::host::{ConnId, Host, Transport};
use crate::le::Peer;

use super::*;

pub(crate) type ChangedFn = Arc<dyn Fn(Cccd) + Send + Sync>;
type WriteFn = Arc<dyn Fn(Peer, Cccd) -> IoResult<()> + Send + Sync>;
type MatchFn = Arc<dyn Fn(Peer) -> bool + Send + Sync>;

/// Client Characteristic Configuration descriptor state
/// ([Vol 3] Part G, Section 3.3.3.3). Each peer has its own configuration
/// entry. The effective value is the maximum over all connected peers.
#[derive(Clone, Default)]
pub struct Ccc {
    entries: SmallVec<[(Peer, Cccd); 2]>,
    value: Cccd,
    sticky: Cccd,
    changed: Option<ChangedFn>,
    write: Option<WriteFn>,
    matches: Option<MatchFn>,
}

impl Ccc {
    /// Marks configuration bits that a client may not clear with a non-zero
    /// write.
    #[inline]
    #[must_use]
    pub fn sticky(mut self, bits: Cccd) -> Self {
        self.sticky = bits;
        self
    }

    /// Sets a callback that is invoked when the effective value changes.
    #[inline]
    #[must_use]
    pub fn on_changed(mut self, f: impl Fn(Cccd) + Send + Sync + 'static) -> Self {
        self.changed = Some(Arc::new(f));
        self
    }

    /// Sets a callback that can reject a configuration write.
    #[inline]
    #[must_use]
    pub fn on_write(mut self, f: impl Fn(Peer, Cccd) -> IoResult<()> + Send + Sync + 'static) -> Self {
        self.write = Some(Arc::new(f));
        self
    }

    /// Sets a callback that selects the peers receiving notifications and
    /// indications.
    #[inline]
    #[must_use]
    pub fn on_match(mut self, f: impl Fn(Peer) -> bool + Send + Sync + 'static) -> Self {
        self.matches = Some(Arc::new(f));
        self
    }

    /// Returns the effective configuration value.
    #[inline(always)]
    #[must_use]
    pub const fn value(&self) -> Cccd {
        self.value
    }

    /// Returns the configuration of the specified peer.
    #[inline]
    #[must_use]
    pub fn get(&self, peer: Peer) -> Cccd {
        (self.entries.iter().find(|e| e.0 == peer)).map_or(Cccd::empty(), |e| e.1)
    }

    /// Returns whether notifications and indications should be sent to the
    /// peer.
    #[inline]
    pub(crate) fn matches(&self, peer: Peer) -> bool {
        self.matches.as_ref().map_or(true, |f| f(peer))
    }

    /// Updates or creates the peer entry. A zero value removes the entry of
    /// an unbonded peer.
    pub(crate) fn set(&mut self, peer: Peer, v: Cccd, bonded: bool, max: usize) -> IoResult<()> {
        match self.entries.iter().position(|e| e.0 == peer) {
            Some(i) if v.is_empty() && !bonded => {
                self.entries.remove(i);
            }
            Some(i) => self.entries[i].1 = v,
            None if v.is_empty() => {}
            None if self.entries.len() >= max => return Err(ErrorCode::InsufficientResources),
            None => self.entries.push((peer, v)),
        }
        Ok(())
    }

    /// Removes the peer entry.
    #[inline]
    pub(crate) fn remove(&mut self, peer: Peer) -> bool {
        let n = self.entries.len();
        self.entries.retain(|e| e.0 != peer);
        n != self.entries.len()
    }

    /// Recomputes the effective value. Returns the value change callback if
    /// the value changed.
    pub(crate) fn update(&mut self, connected: &[Peer]) -> Option<(ChangedFn, Cccd)> {
        let v = (self.entries.iter())
            .filter(|e| connected.contains(&e.0))
            .map(|e| e.1)
            .max_by_key(|v| v.bits())
            .unwrap_or_default();
        if v == self.value {
            return None;
        }
        self.value = v;
        self.changed.clone().map(|f| (f, v))
    }

    /// Removes all entries. Returns the peers that had an entry and the value
    /// change callback if the effective value changed.
    pub(crate) fn clear(&mut self) -> (SmallVec<[Peer; 2]>, Option<(ChangedFn, Cccd)>) {
        let peers = self.entries.drain(..).map(|e| e.0).collect();
        (peers, self.update(&[]))
    }

    /// Returns all non-empty peer configurations.
    #[inline]
    pub(crate) fn entries(&self) -> impl Iterator<Item = (Peer, Cccd)> + '_ {
        self.entries.iter().copied().filter(|e| !e.1.is_empty())
    }
}

impl Debug for Ccc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ccc")
            .field("entries", &self.entries)
            .field("value", &self.value)
            .field("sticky", &self.sticky)
            .finish_non_exhaustive()
    }
}

/// Client Characteristic Configuration handling.
impl<T: Transport> Host<T> {
    /// Returns whether the peer of `conn` enabled any of the configuration
    /// `bits` for the characteristic at `hdl` (declaration or value handle).
    #[must_use]
    pub fn is_subscribed(&self, conn: ConnId, hdl: Handle, bits: Cccd) -> bool {
        let Some(peer) = self.peer(conn) else { return false };
        let Some(ccc) = (self.db.attr_value_handle(hdl))
            .and_then(|v| self.db.ccc_of(v))
            .and_then(|h| self.db.attr(h))
            .and_then(Attr::ccc)
        else {
            return false;
        };
        ccc.get(peer).intersects(bits)
    }

    /// Handles a CCC descriptor write.
    pub(crate) fn write_ccc(&mut self, conn: ConnId, hdl: Handle, off: u16, val: &[u8]) -> IoResult<()> {
        if off != 0 {
            return Err(ErrorCode::InvalidOffset);
        }
        let raw = match *val {
            [lo] => u16::from(lo),
            [lo, hi] => u16::from_le_bytes([lo, hi]),
            _ => return Err(ErrorCode::InvalidAttributeValueLength),
        };
        let Some(peer) = self.peer(conn) else {
            return Err(ErrorCode::UnlikelyError);
        };
        let v = Cccd::from_bits_truncate(raw);
        let props = self.db.char_of(hdl).map_or(Prop::empty(), |c| c.1);
        if !Cccd::allowed_by(props).contains(v) {
            debug!("{conn} CCC {hdl} does not allow {v:?}");
            return Err(ErrorCode::ValueNotAllowed);
        }
        let bonded = self.tr.is_bonded(peer);
        let max = self.cfg.ccc_entries;
        let connected = self.connected_peers();
        let Some(ccc) = self.db.attr_mut(hdl).and_then(Attr::ccc_mut) else {
            return Err(ErrorCode::UnlikelyError);
        };
        let cur = ccc.get(peer);
        if !v.is_empty() && cur.intersects(ccc.sticky.difference(v)) {
            debug!("{conn} CCC {hdl} attempted to clear sticky bits");
            return Err(ErrorCode::ValueNotAllowed);
        }
        if let Some(f) = ccc.write.as_ref() {
            f(peer, v)?;
        }
        ccc.set(peer, v, bonded, max)?;
        trace!("{conn} CCC {hdl} set to {v:?}");
        let changed = ccc.update(&connected);
        if cur != v && bonded {
            self.schedule_store(peer);
        }
        if let Some((f, v)) = changed {
            f(v);
        }
        Ok(())
    }

    /// Recomputes effective CCC values after the set of connected peers or
    /// their configurations changed.
    pub(crate) fn update_cccs(&mut self) {
        let connected = self.connected_peers();
        let changed: Vec<_> = (self.db.cccs_mut(HandleRange::ALL))
            .filter_map(|(_, c)| c.update(&connected))
            .collect();
        for (f, v) in changed {
            f(v);
        }
    }

    /// Removes all CCC entries of a peer within a range.
    pub(crate) fn clear_cccs(&mut self, peer: Peer, r: HandleRange) {
        for (h, c) in self.db.cccs_mut(r) {
            if c.remove(peer) {
                trace!("Cleared CCC {h} of {peer}");
            }
        }
    }

    /// Applies persisted CCC entries of a bonded peer.
    pub(crate) fn restore_cccs(&mut self, peer: Peer, ccc: &[(Handle, u16)]) {
        let max = self.cfg.ccc_entries;
        for &(h, v) in ccc {
            let Some(c) = self.db.attr_mut(h).and_then(Attr::ccc_mut) else {
                warn!("Ignoring stale CCC {h} of {peer}");
                continue;
            };
            if c.set(peer, Cccd::from_bits_truncate(v), true, max).is_err() {
                warn!("No room to restore CCC {h} of {peer}");
            }
        }
    }

    /// Returns the peers of all connections.
    pub(crate) fn connected_peers(&self) -> SmallVec<[Peer; 4]> {
        self.conns.iter().map(|(_, cn)| cn.peer).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU16, Ordering};

    use super::*;
    use crate::att::Access;
    use crate::host::tests::TestHost;

    fn peer(id: u8) -> Peer {
        Peer { id, ..Peer::default() }
    }

    #[test]
    fn entries() {
        let mut c = Ccc::default();
        assert_eq!(c.set(peer(1), Cccd::NOTIFY, false, 2), Ok(()));
        assert_eq!(c.set(peer(2), Cccd::INDICATE, true, 2), Ok(()));
        assert_eq!(c.set(peer(3), Cccd::NOTIFY, false, 2), Err(ErrorCode::InsufficientResources));
        assert!(c.update(&[peer(1)]).is_none());
        assert_eq!(c.value(), Cccd::NOTIFY);
        c.update(&[peer(1), peer(2)]);
        assert_eq!(c.value(), Cccd::INDICATE);

        // Zero removes unbonded entries only
        c.set(peer(1), Cccd::empty(), false, 2).unwrap();
        c.set(peer(2), Cccd::empty(), true, 2).unwrap();
        assert_eq!(c.entries.len(), 1);
        assert_eq!(c.entries().count(), 0);
    }

    #[test]
    fn sticky() {
        let last = Arc::new(AtomicU16::new(0xFFFF));
        let cb = Arc::clone(&last);
        let mut h = TestHost::with_service(|s| {
            s.characteristic(
                gattic_const::Characteristic::BatteryLevel,
                Prop::READ | Prop::NOTIFY | Prop::INDICATE,
                Access::READ,
                SharedValue::new([1]),
                |d| {
                    let ccc = (Ccc::default().sticky(Cccd::INDICATE))
                        .on_changed(move |v| cb.store(v.bits(), Ordering::Relaxed));
                    d.client_cfg(Access::READ_WRITE, ccc);
                },
            );
        });
        let conn = h.connect(false);
        let ccc = h.svc_handle(3);
        assert_eq!(h.write_ccc(conn, ccc, 0, &[0x03, 0x00]), Ok(()));
        assert_eq!(last.load(Ordering::Relaxed), 0x03);

        // Clearing only the sticky bit is rejected, clearing everything is not
        assert_eq!(h.write_ccc(conn, ccc, 0, &[0x01, 0x00]), Err(ErrorCode::ValueNotAllowed));
        assert!(h.is_subscribed(conn, h.svc_handle(1), Cccd::INDICATE));
        assert_eq!(h.write_ccc(conn, ccc, 0, &[0x00, 0x00]), Ok(()));
        assert_eq!(last.load(Ordering::Relaxed), 0x00);
        assert!(!h.is_subscribed(conn, h.svc_handle(2), Cccd::INDICATE));

        assert_eq!(h.write_ccc(conn, ccc, 1, &[0x00]), Err(ErrorCode::InvalidOffset));
        assert_eq!(
            h.write_ccc(conn, ccc, 0, &[0x00, 0x00, 0x00]),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(h.write_ccc(conn, ccc, 0, &[0x04]), Ok(()));
        assert_eq!(last.load(Ordering::Relaxed), 0x00);
    }

    #[test]
    fn props() {
        let mut h = TestHost::with_service(|s| {
            s.characteristic(
                gattic_const::Characteristic::BatteryLevel,
                Prop::READ | Prop::NOTIFY,
                Access::READ,
                SharedValue::new([1]),
                |d| d.client_cfg(Access::READ_WRITE, Ccc::default()),
            );
        });
        let conn = h.connect(false);
        let ccc = h.svc_handle(3);
        assert_eq!(h.write_ccc(conn, ccc, 0, &[0x02, 0x00]), Err(ErrorCode::ValueNotAllowed));
        assert_eq!(h.write_ccc(conn, ccc, 0, &[0x01, 0x00]), Ok(()));
    }
}

use std::sync::Arc;

use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::att::{Access, Body, Buf, ChanOpt, Opcode, ReqId};
use crate::host::{ConnId, Host, Transport};
use crate::util::Timer;
use crate::Result;

use super::*;

/// Indication completion callback. Called once for every peer that the
/// indication was addressed to.
pub type IndicateDone<T> = Arc<dyn Fn(&mut Host<T>, ConnId, Result<()>) + Send + Sync>;

/// Pending `ATT_MULTIPLE_HANDLE_VALUE_NTF` ([Vol 3] Part F, Section 3.4.7.4)
/// of one connection.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    /// Handle, length, and value tuples.
    buf: Vec<u8>,
    n: usize,
    timer: Timer,
}

impl Batch {
    /// Returns the flush deadline.
    #[inline(always)]
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Returns whether the flush deadline expired.
    #[inline(always)]
    pub fn expire(&mut self, now: Instant) -> bool {
        self.timer.expire(now)
    }

    /// Appends a tuple.
    fn push(&mut self, hdl: Handle, val: &[u8]) {
        self.buf.extend_from_slice(&hdl.get().to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        self.buf.extend_from_slice(&(val.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(val);
        self.n += 1;
    }
}

/// Server-initiated notifications and indications
/// ([Vol 3] Part G, Section 4.10 and 4.11).
impl<T: Transport> Host<T> {
    /// Notifies the characteristic value at `hdl` (declaration or value
    /// handle). If `conn` is [`None`], all subscribed peers are notified.
    /// Notifying a specific connection that is not subscribed is an error.
    pub fn notify(&mut self, conn: Option<ConnId>, hdl: Handle, val: &[u8]) -> Result<()> {
        let (hdl, conns) = self.subscribers(conn, hdl, Cccd::NOTIFY)?;
        for id in conns {
            let Some(peer) = self.peer(id) else { continue };
            if self.srv.features(peer).contains(ClientFeatures::MULTI_NTF) {
                self.batch_notify(id, hdl, val);
            } else {
                self.send_notify(id, hdl, val)?;
            }
        }
        Ok(())
    }

    /// Notifies multiple characteristic values, sending them in as few PDUs
    /// as possible to peers that support multiple handle value
    /// notifications.
    pub fn notify_multiple(&mut self, conn: Option<ConnId>, vals: &[(Handle, &[u8])]) -> Result<()> {
        for &(hdl, val) in vals {
            self.notify(conn, hdl, val)?;
        }
        for id in conn.map_or_else(|| self.conn_ids(), |c| vec![c]) {
            self.flush_batch(id);
        }
        Ok(())
    }

    /// Indicates the characteristic value at `hdl` (declaration or value
    /// handle). If `conn` is [`None`], all subscribed peers are indicated.
    /// `done` is called with the confirmation result of each peer, or with
    /// the error if the indication could not be queued for that peer. Returns
    /// the number of indications queued.
    pub fn indicate(
        &mut self,
        conn: Option<ConnId>,
        hdl: Handle,
        val: &[u8],
        done: impl Fn(&mut Self, ConnId, Result<()>) + Send + Sync + 'static,
    ) -> Result<usize> {
        let (hdl, conns) = self.subscribers(conn, hdl, Cccd::INDICATE)?;
        let done: IndicateDone<T> = Arc::new(done);
        let mut n = 0;
        for id in conns {
            let f = Arc::clone(&done);
            let d = crate::att::done(move |h: &mut Self, conn, r| f(h, conn, r.map(|_| ())));
            match self.send_indication(id, hdl, val, d) {
                Ok(_) => n += 1,
                Err(e) => {
                    warn!("{id} failed to indicate {hdl}: {e}");
                    done(self, id, Err(e));
                }
            }
        }
        Ok(n)
    }

    /// Sends a pending multiple handle value notification.
    pub(crate) fn flush_batch(&mut self, id: ConnId) {
        let Some(cn) = self.conns.get_mut(id.0) else { return };
        cn.batch.timer.stop();
        let n = std::mem::take(&mut cn.batch.n);
        let v = std::mem::take(&mut cn.batch.buf);
        let mtu = cn.br.max_mtu().0;
        let b = match n {
            0 => return,
            // Single tuple is sent as a regular notification
            1 => Buf::new(Opcode::HandleValueNtf, mtu, |p| {
                p.put(&v[..2]).put(&v[4..]);
            }),
            _ => Buf::new(Opcode::MultipleHandleValueNtf, mtu, |p| {
                p.put(&v);
            }),
        };
        trace!("{id} flushing {n} notification(s)");
        if let Err(e) = self.submit_buf(id, None, b) {
            warn!("{id} failed to send {n} notification(s): {e}");
        }
    }

    /// Sends an indication on one connection.
    pub(crate) fn send_indication(
        &mut self,
        conn: ConnId,
        hdl: Handle,
        val: &[u8],
        done: crate::att::Done<T>,
    ) -> Result<ReqId> {
        let mtu = self.mtu(conn).ok_or(crate::att::Error::NotConnected)?;
        let n = val.len().min(usize::from(mtu) - 3);
        let mut raw = Vec::with_capacity(2 + n);
        raw.extend_from_slice(&hdl.get().to_le_bytes());
        raw.extend_from_slice(&val[..n]);
        self.submit_req(conn, Opcode::HandleValueInd, ChanOpt::Any, Body::Raw(raw.into()), done)
    }

    /// Sends a single notification.
    fn send_notify(&mut self, id: ConnId, hdl: Handle, val: &[u8]) -> Result<()> {
        let mtu = self.mtu(id).ok_or(crate::att::Error::NotConnected)?;
        let n = val.len().min(usize::from(mtu) - 3);
        let b = Buf::new(Opcode::HandleValueNtf, mtu, |p| {
            p.u16(hdl).put(&val[..n]);
        });
        self.submit_buf(id, None, b)
    }

    /// Adds a notification to the connection batch, flushing the batch first
    /// if the new tuple does not fit.
    fn batch_notify(&mut self, id: ConnId, hdl: Handle, val: &[u8]) {
        let delay = self.cfg.notify_batch_delay;
        let Some(cn) = self.conns.get(id.0) else { return };
        let max = usize::from(cn.br.max_mtu().0) - 1;
        let val = &val[..val.len().min(max - 4)];
        if cn.batch.buf.len() + 4 + val.len() > max {
            self.flush_batch(id);
        }
        let Some(cn) = self.conns.get_mut(id.0) else { return };
        cn.batch.push(hdl, val);
        cn.batch.timer.start_once(delay);
        if cn.batch.buf.len() + 4 >= max {
            self.flush_batch(id);
        }
    }

    /// Returns the value handle and the connections that should receive a
    /// notification or indication.
    fn subscribers(
        &self,
        conn: Option<ConnId>,
        hdl: Handle,
        bits: Cccd,
    ) -> Result<(Handle, SmallVec<[ConnId; 4]>)> {
        use crate::att::Error;
        let val = self.db.attr_value_handle(hdl).ok_or(Error::InvalidParam)?;
        let at = self.db.attr(val).ok_or(Error::InvalidParam)?;
        let ccc = (self.db.ccc_of(val))
            .and_then(|h| self.db.attr(h))
            .and_then(Attr::ccc)
            .ok_or(Error::NotSupported)?;
        let eligible = |id: ConnId| {
            let Some(peer) = self.peer(id) else { return false };
            let req = Access::request(Access::READ, self.tr.security(id));
            ccc.get(peer).intersects(bits) && ccc.matches(peer) && at.perms().test(req).is_ok()
        };
        let conns = match conn {
            Some(id) if eligible(id) => SmallVec::from_elem(id, 1),
            Some(id) => {
                debug!("{id} is not subscribed to {val}");
                return Err(Error::InvalidParam);
            }
            None => self.conn_ids().into_iter().filter(|&id| eligible(id)).collect(),
        };
        Ok((val, conns))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use gattic_const::Characteristic;

    use super::*;
    use crate::host::tests::TestHost;

    fn host() -> TestHost {
        TestHost::with_service(|s| {
            s.characteristic(
                Characteristic::BatteryLevel,
                Prop::READ | Prop::NOTIFY | Prop::INDICATE,
                Access::READ,
                SharedValue::new([0]),
                |d| d.client_cfg(Access::READ_WRITE, Ccc::default()),
            );
        })
    }

    #[test]
    fn multiple_notify() {
        let mut h = host();
        let conn = h.connect(false);
        let (val, ccc) = (h.svc_handle(2), h.svc_handle(3));
        let cf = h.db().builtin(Builtin::ClientFeatures).unwrap();
        h.recv_att(conn, &[0x02, 50, 0]);
        h.recv_att(conn, &[0x12, cf.get() as u8, 0x00, 0x04]);
        h.recv_att(conn, &[0x12, ccc.get() as u8, 0x00, 0x01, 0x00]);
        h.sent();
        for i in 0..3 {
            h.notify(None, val, &[i; 8]).unwrap();
        }
        assert!(h.sent().is_empty());
        h.advance(Duration::from_millis(20));
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], 0x23);
        assert_eq!(sent[0].len(), 1 + 3 * 12);

        // Single tuple is downgraded
        h.notify(Some(conn), val, &[7]).unwrap();
        h.advance(Duration::from_millis(20));
        let v = val.get().to_le_bytes();
        assert_eq!(h.sent(), vec![vec![0x1B, v[0], v[1], 7]]);
    }

    #[test]
    fn notify() {
        let mut h = host();
        let conn = h.connect(false);
        let (val, ccc) = (h.svc_handle(2), h.svc_handle(3));
        assert_eq!(h.notify(Some(conn), val, &[1]), Err(crate::att::Error::InvalidParam));
        assert_eq!(h.notify(None, val, &[1]), Ok(()));
        assert!(h.sent().is_empty());
        h.recv_att(conn, &[0x12, ccc.get() as u8, 0x00, 0x01, 0x00]);
        h.sent();
        let decl = h.svc_handle(1);
        h.notify(None, decl, &[0xAB; 30]).unwrap();
        let sent = h.sent();
        assert_eq!(sent[0].len(), 23);
        assert_eq!(sent[0][..3], [0x1B, val.get() as u8, 0x00]);
    }

    #[test]
    fn indicate() {
        let mut h = host();
        let conn = h.connect(false);
        let (val, ccc) = (h.svc_handle(2), h.svc_handle(3));
        h.recv_att(conn, &[0x12, ccc.get() as u8, 0x00, 0x02, 0x00]);
        h.sent();
        let res = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&res);
        let n = h.indicate(None, val, &[5], move |_, conn, res| {
            r.lock().push((conn, res));
        });
        assert_eq!(n, Ok(1));
        assert_eq!(h.sent(), vec![vec![0x1D, val.get() as u8, 0x00, 5]]);
        assert!(res.lock().is_empty());
        h.recv_att(conn, &[0x1E]);
        assert_eq!(*res.lock(), vec![(conn, Ok(()))]);
    }

    #[test]
    fn indicate_partial_failure() {
        let mut h = host();
        let (c1, c2) = (h.connect(false), h.connect(false));
        let (val, ccc) = (h.svc_handle(2), h.svc_handle(3));
        for c in [c1, c2] {
            h.recv_att(c, &[0x12, ccc.get() as u8, 0x00, 0x02, 0x00]);
        }
        h.sent();

        // Leave one free request slot
        let mut reads = Vec::new();
        while h.can_request() {
            reads.push(h.read_req(c1, 3));
        }
        assert!(h.cancel(c1, reads.last().unwrap().id()));

        let res = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&res);
        let n = h.indicate(None, val, &[5], move |_, conn, res| r.lock().push((conn, res)));
        assert_eq!(n, Ok(1));
        assert_eq!(*res.lock(), vec![(c2, Err(crate::att::Error::NoResources))]);
    }
}

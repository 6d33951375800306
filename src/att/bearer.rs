use std::collections::VecDeque;

use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::host::{ChanId, Cid, ConnId, Host, SecLevel, SendError, Transport};

use super::*;

/// ATT bearer: all ATT channels of one connection
/// ([Vol 3] Part F, Section 3.2.11).
#[derive(Debug)]
pub(crate) struct Bearer<T: Transport> {
    /// Channels, most recently attached first.
    chans: SmallVec<[Chan<T>; 2]>,
    /// Requests waiting for a channel.
    reqs: VecDeque<ReqId>,
    /// Commands and notifications waiting for a channel.
    cmds: VecDeque<Buf<T>>,
    /// Last reported maximum transmit and receive MTUs.
    max: (u16, u16),
}

impl<T: Transport> Bearer<T> {
    /// Creates a bearer without any channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chans: SmallVec::new(),
            reqs: VecDeque::new(),
            cmds: VecDeque::new(),
            max: (DEFAULT_MTU, DEFAULT_MTU),
        }
    }

    /// Attaches a new channel.
    pub fn attach(
        &mut self,
        cid: Cid,
        enhanced: bool,
        rx_mtu: u16,
        tx_mtu: u16,
        max: usize,
    ) -> Result<()> {
        if self.chans.iter().any(|c| c.cid == cid) {
            return Err(Error::AlreadyExists);
        }
        if self.chans.len() >= max {
            return Err(Error::NoResources);
        }
        self.chans.insert(0, Chan::new(cid, enhanced, rx_mtu, tx_mtu));
        Ok(())
    }

    /// Detaches a channel.
    pub fn detach(&mut self, cid: Cid) -> Option<Chan<T>> {
        let i = self.chans.iter().position(|c| c.cid == cid)?;
        Some(self.chans.remove(i))
    }

    /// Returns whether the bearer has no channels.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chans.is_empty()
    }

    /// Returns whether any enhanced channels are attached.
    #[inline]
    #[must_use]
    pub fn has_enhanced(&self) -> bool {
        self.chans.iter().any(|c| c.enhanced)
    }

    /// Returns whether the peer only uses the fixed ATT channel.
    #[inline]
    #[must_use]
    pub fn fixed_only(&self) -> bool {
        matches!(*self.chans, [ref c] if !c.enhanced)
    }

    /// Returns the specified channel.
    #[inline]
    pub fn chan(&self, cid: Cid) -> Option<&Chan<T>> {
        self.chans.iter().find(|c| c.cid == cid)
    }

    /// Returns the specified channel.
    #[inline]
    pub fn chan_mut(&mut self, cid: Cid) -> Option<&mut Chan<T>> {
        self.chans.iter_mut().find(|c| c.cid == cid)
    }

    /// Returns the first idle channel matching `opt`.
    pub fn select(&self, opt: ChanOpt) -> Option<&Chan<T>> {
        (self.chans.iter()).find(|c| opt.allows(c.enhanced) && c.is_idle())
    }

    /// Returns the smallest transmit MTU of all channels. Values that fit this
    /// MTU can be sent on any channel.
    #[must_use]
    pub fn min_mtu(&self) -> u16 {
        (self.chans.iter().map(|c| c.tx_mtu).min()).unwrap_or(DEFAULT_MTU)
    }

    /// Returns the maximum transmit and receive MTUs of all channels.
    #[must_use]
    pub fn max_mtu(&self) -> (u16, u16) {
        self.chans.iter().fold((DEFAULT_MTU, DEFAULT_MTU), |(tx, rx), c| {
            (tx.max(c.tx_mtu), rx.max(c.rx_mtu))
        })
    }

    /// Recomputes maximum MTUs, returning the new values if either increased.
    pub fn update_max_mtu(&mut self) -> Option<(u16, u16)> {
        let (tx, rx) = self.max_mtu();
        let inc = tx > self.max.0 || rx > self.max.1;
        self.max = (tx, rx);
        inc.then_some((tx, rx))
    }

    /// Queues a request.
    #[inline]
    pub fn push_req(&mut self, id: ReqId) {
        self.reqs.push_back(id);
    }

    /// Removes a queued request.
    pub fn remove_req(&mut self, id: ReqId) -> bool {
        let Some(i) = self.reqs.iter().position(|&r| r == id) else {
            return false;
        };
        self.reqs.remove(i);
        true
    }

    /// Queues a buffer on the specified channel or on the shared queue.
    pub fn push_buf(&mut self, cid: Option<Cid>, b: Buf<T>) {
        match cid.and_then(|cid| self.chan_mut(cid)) {
            Some(c) => c.queue.push_back(b),
            None => self.cmds.push_back(b),
        }
    }

    /// Returns the channel holding request `id`.
    pub fn find_req(&mut self, id: ReqId) -> Option<&mut Chan<T>> {
        self.chans.iter_mut().find(|c| c.slot == Slot::Busy(id))
    }

    /// Returns the first channel whose transaction timer expired.
    pub fn expired(&mut self, now: Instant) -> Option<Cid> {
        (self.chans.iter_mut()).find_map(|c| c.expired(now).then_some(c.cid))
    }

    /// Returns all channel timer deadlines.
    pub fn deadlines(&self) -> impl Iterator<Item = Option<Instant>> + '_ {
        self.chans.iter().map(|c| c.timer.deadline())
    }

    /// Empties the bearer, returning all requests and buffers.
    pub fn drain(self) -> (Vec<ReqId>, Vec<Buf<T>>) {
        let (mut reqs, mut bufs): (Vec<_>, Vec<_>) = (self.reqs.into(), self.cmds.into());
        for c in self.chans {
            let (r, b) = c.drain();
            reqs.extend(r);
            bufs.extend(b);
        }
        (reqs, bufs)
    }
}

/// Completion collected during dispatch and invoked after all borrows end.
enum Outcome<T: Transport> {
    Sent(Option<SendDone<T>>),
    BufFailed(Option<SendDone<T>>),
    ReqFailed(Request<T>),
}

/// Transaction queue ([Vol 3] Part F, Section 3.3.2).
impl<T: Transport> Host<T> {
    /// Allocates a request and queues it on the bearer.
    pub(crate) fn submit_req(
        &mut self,
        conn: ConnId,
        op: Opcode,
        opt: ChanOpt,
        body: Body,
        done: Done<T>,
    ) -> Result<ReqId> {
        debug_assert!(matches!(op.typ(), PduType::Req | PduType::Ind));
        self.can_submit(conn)?;
        let req = Request {
            op,
            opt,
            body,
            done: Some(done),
            parked: None,
            retried: false,
        };
        let id = ReqId(self.reqs.insert(req).map_err(|_| Error::NoResources)?);
        trace!("{conn} queued {op}");
        if let Some(cn) = self.conns.get_mut(conn.0) {
            cn.br.push_req(id);
        }
        self.dispatch(conn);
        Ok(id)
    }

    /// Returns the error that [`Self::submit_req`] would fail with for a new
    /// request on `conn`, if any.
    pub(crate) fn can_submit(&self, conn: ConnId) -> Result<()> {
        if !self.conns.get(conn.0).is_some_and(|cn| !cn.br.is_empty()) {
            return Err(Error::NotConnected);
        }
        if self.reqs.is_full() {
            return Err(Error::NoResources);
        }
        Ok(())
    }

    /// Queues an outgoing buffer on the specified channel or the shared queue.
    pub(crate) fn submit_buf(&mut self, conn: ConnId, cid: Option<Cid>, b: Buf<T>) -> Result<()> {
        let Some(cn) = self.conns.get_mut(conn.0) else {
            return Err(Error::NotConnected);
        };
        trace!("{conn} queued {}", b.op);
        cn.br.push_buf(cid, b);
        self.dispatch(conn);
        Ok(())
    }

    /// Sends queued buffers and requests on every channel that can accept
    /// them.
    pub(crate) fn dispatch(&mut self, conn: ConnId) {
        let mut out = Vec::new();
        {
            let Self {
                tr, conns, reqs, cfg, ..
            } = self;
            let Some(cn) = conns.get_mut(conn.0) else { return };
            let br = &mut cn.br;
            for c in &mut br.chans {
                if c.blocked {
                    continue;
                }
                let ch = ChanId { conn, cid: c.cid };
                // Private queue first, then compatible shared buffers
                while !c.blocked {
                    let (b, private) = if let Some(b) = c.queue.pop_front() {
                        (b, true)
                    } else if let Some(b) = (br.cmds.iter())
                        .position(|b| b.opt.allows(c.enhanced) && b.pdu.len() <= usize::from(c.tx_mtu))
                        .and_then(|i| br.cmds.remove(i))
                    {
                        (b, false)
                    } else {
                        break;
                    };
                    let Buf { op, pdu, opt, done } = b;
                    match tr.send(ch, pdu) {
                        Ok(()) => {
                            trace!("{ch} sent {op}");
                            out.push(Outcome::Sent(done));
                        }
                        Err(SendError::WouldBlock(pdu)) => {
                            trace!("{ch} blocked on {op}");
                            let b = Buf { op, pdu, opt, done };
                            if private {
                                c.queue.push_front(b);
                            } else {
                                br.cmds.push_front(b);
                            }
                            c.blocked = true;
                        }
                        Err(SendError::Failed(_)) => {
                            error!("{ch} failed to send {op}");
                            out.push(Outcome::BufFailed(done));
                        }
                    }
                }
                if c.blocked || !c.is_idle() {
                    continue;
                }
                let Some(i) = (br.reqs.iter()).position(|&id| {
                    reqs.get(id.0).is_some_and(|r| r.fits(c.enhanced, c.tx_mtu))
                }) else {
                    continue;
                };
                let Some(id) = br.reqs.remove(i) else { continue };
                let Some(req) = reqs.get(id.0) else { continue };
                let op = req.op;
                match tr.send(ch, req.encode(c.tx_mtu)) {
                    Ok(()) => {
                        trace!("{ch} sent {op}");
                        c.slot = Slot::Busy(id);
                        c.timer.start(cfg.timeout);
                    }
                    Err(SendError::WouldBlock(_)) => {
                        trace!("{ch} blocked on {op}");
                        br.reqs.push_front(id);
                        c.blocked = true;
                    }
                    Err(SendError::Failed(_)) => {
                        error!("{ch} failed to send {op}");
                        if let Some(req) = reqs.remove(id.0) {
                            out.push(Outcome::ReqFailed(req));
                        }
                    }
                }
            }
        }
        for o in out {
            match o {
                Outcome::Sent(Some(f)) => f(self, conn, Ok(())),
                Outcome::BufFailed(Some(f)) => f(self, conn, Err(Error::Send)),
                Outcome::Sent(None) | Outcome::BufFailed(None) => {}
                Outcome::ReqFailed(r) => r.complete(self, conn, Err(Error::Send)),
            }
        }
    }

    /// Handles a transaction timeout. The bearer is torn down as if the
    /// transport disconnected ([Vol 3] Part F, Section 3.3.3).
    pub(crate) fn req_timeout(&mut self, ch: ChanId) {
        let Some(c) = (self.conns.get(ch.conn.0)).and_then(|cn| cn.br.chan(ch.cid)) else {
            return;
        };
        let timed_out = match c.slot {
            Slot::Busy(id) => self.reqs.get(id.0).map(|r| (id, r.op)),
            Slot::Idle | Slot::Cancelled(_) => None,
        };
        error!(
            "{ch} transaction timeout{}",
            timed_out.map_or(String::new(), |(_, op)| format!(" for {op}"))
        );
        self.tr.disconnect(ch.conn);
        self.teardown(ch.conn, timed_out);
    }

    /// Cancels a queued or in-flight request. The request completes with a
    /// simulated `UnlikelyError` response. An in-flight request leaves a
    /// sentinel in its channel so that the late response is discarded. A
    /// request parked for a security upgrade has no response pending and
    /// frees its channel immediately.
    pub fn cancel(&mut self, conn: ConnId, id: ReqId) -> bool {
        let Some(cn) = self.conns.get_mut(conn.0) else { return false };
        if !cn.br.remove_req(id) {
            let Some(c) = cn.br.find_req(id) else { return false };
            match self.reqs.get(id.0) {
                Some(r) if r.parked.is_some() => c.release(),
                r => c.slot = Slot::Cancelled(r.map_or(Opcode::ErrorRsp, |r| r.op)),
            }
        }
        let Some(req) = self.reqs.remove(id.0) else { return false };
        debug!("{conn} cancelled {}", req.op);
        let e = ErrorRsp::new(req.op.into(), None, ErrorCode::UnlikelyError);
        req.complete(self, conn, Err(e.into()));
        self.dispatch(conn);
        true
    }

    /// Handles a response or confirmation PDU.
    pub(crate) fn recv_rsp(&mut self, ch: ChanId, pdu: Pdu<'_>) {
        let op = pdu.opcode();
        let Some(c) = (self.conns.get_mut(ch.conn.0)).and_then(|cn| cn.br.chan_mut(ch.cid)) else {
            return;
        };
        let id = match c.slot {
            Slot::Busy(id) => id,
            Slot::Cancelled(req) => {
                debug!("{ch} discarded {op} for cancelled {req}");
                c.release();
                self.dispatch(ch.conn);
                return;
            }
            Slot::Idle => {
                warn!("{ch} unexpected {op}");
                return;
            }
        };
        let Some(req_op) = self.reqs.get(id.0).map(|r| r.op) else {
            c.release();
            return;
        };
        let r = if op == Opcode::ErrorRsp {
            let e = pdu.error_rsp();
            if e.req() == u8::from(req_op) {
                Err(e)
            } else {
                warn!("{ch} error response for {:#04X} while waiting for {req_op}", e.req());
                Err(ErrorRsp::new(req_op.into(), None, ErrorCode::UnlikelyError))
            }
        } else if req_op.rsp() == Some(op) {
            Ok(pdu)
        } else {
            warn!("{ch} unexpected {op} while waiting for {req_op}");
            Err(ErrorRsp::new(req_op.into(), None, ErrorCode::UnlikelyError))
        };
        if let Err(e) = r {
            if e.code().is_security() && self.park(ch, id, e) {
                return;
            }
        }
        let Some(cn) = self.conns.get_mut(ch.conn.0) else { return };
        if let Some(c) = cn.br.chan_mut(ch.cid) {
            c.release();
        }
        let Some(req) = self.reqs.remove(id.0) else { return };
        trace!("{ch} completed {req_op}");
        req.complete(self, ch.conn, r.map_err(Error::from));
        self.dispatch(ch.conn);
    }

    /// Parks a request that failed with a security error until the link
    /// security is raised. Returns `false` if the request must fail
    /// instead.
    fn park(&mut self, ch: ChanId, id: ReqId, e: ErrorRsp) -> bool {
        let sec = self.tr.security(ch.conn);
        let Some(req) = self.reqs.get_mut(id.0) else { return false };
        if req.retried {
            return false;
        }
        if let Body::Raw(_) = req.body {
            // Pre-encoded requests cannot be resent
            let Some(req) = self.reqs.remove(id.0) else { return false };
            if let Some(c) = (self.conns.get_mut(ch.conn.0)).and_then(|cn| cn.br.chan_mut(ch.cid)) {
                c.release();
            }
            req.complete(self, ch.conn, Err(Error::Authentication));
            self.dispatch(ch.conn);
            return true;
        }
        use {ErrorCode::*, SecLevel::*};
        let want = match (e.code(), sec.level) {
            (InsufficientEncryption | EncryptionKeySizeTooShort, Open) => Encrypted,
            (InsufficientAuthentication, Open) => Encrypted,
            (InsufficientAuthentication, Encrypted) => Authenticated,
            (InsufficientAuthentication, Authenticated) => Secure,
            _ => return false,
        };
        if !self.tr.raise_security(ch.conn, want) {
            return false;
        }
        debug!("{ch} {} waiting for {want:?} security", req.op);
        req.parked = Some(e);
        req.retried = true;
        if let Some(c) = (self.conns.get_mut(ch.conn.0)).and_then(|cn| cn.br.chan_mut(ch.cid)) {
            c.timer.stop();
        }
        true
    }

    /// Resends or fails requests that were parked for a security upgrade.
    pub(crate) fn retry_parked(&mut self, conn: ConnId, ok: bool) {
        let Some(cn) = self.conns.get(conn.0) else { return };
        let parked: SmallVec<[(Cid, ReqId); 2]> = (cn.br.chans.iter())
            .filter_map(|c| c.req().map(|id| (c.cid, id)))
            .filter(|&(_, id)| self.reqs.get(id.0).is_some_and(|r| r.parked.is_some()))
            .collect();
        for (cid, id) in parked {
            let ch = ChanId { conn, cid };
            let Some(req) = self.reqs.get_mut(id.0) else { continue };
            let Some(e) = req.parked else { continue };
            if ok {
                let Some(c) = (self.conns.get_mut(conn.0)).and_then(|cn| cn.br.chan_mut(cid)) else {
                    continue;
                };
                let pdu = req.encode(c.tx_mtu);
                req.parked = None;
                debug!("{ch} resending {}", req.op);
                match self.tr.send(ch, pdu) {
                    Ok(()) => c.timer.start(self.cfg.timeout),
                    Err(SendError::WouldBlock(_)) => {
                        // Sent again by dispatch once the channel is ready
                        debug!("{ch} blocked, requeueing {}", req.op);
                        c.release();
                        c.blocked = true;
                        if let Some(cn) = self.conns.get_mut(conn.0) {
                            cn.br.reqs.push_front(id);
                        }
                    }
                    Err(SendError::Failed(_)) => {
                        c.release();
                        if let Some(req) = self.reqs.remove(id.0) {
                            req.complete(self, conn, Err(Error::Send));
                        }
                    }
                }
            } else {
                if let Some(c) = (self.conns.get_mut(conn.0)).and_then(|cn| cn.br.chan_mut(cid)) {
                    c.release();
                }
                if let Some(req) = self.reqs.remove(id.0) {
                    req.complete(self, conn, Err(e.into()));
                }
            }
        }
        self.dispatch(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::{MockTransport, TestHost};

    #[test]
    fn select_chan() {
        let mut br = Bearer::<MockTransport>::new();
        br.attach(Cid::ATT, false, 23, 23, 3).unwrap();
        br.attach(Cid(0x40), true, 64, 100, 3).unwrap();
        br.attach(Cid(0x41), true, 64, 80, 3).unwrap();
        assert_eq!(br.attach(Cid(0x42), true, 64, 64, 3), Err(Error::NoResources));
        assert_eq!(br.select(ChanOpt::Any).unwrap().cid, Cid(0x41));
        assert_eq!(br.select(ChanOpt::Unenhanced).unwrap().cid, Cid::ATT);
        assert_eq!(br.min_mtu(), 23);
        assert_eq!(br.max_mtu(), (100, 64));
        assert!(!br.fixed_only());
        br.chan_mut(Cid(0x41)).unwrap().slot = Slot::Cancelled(Opcode::ReadReq);
        assert_eq!(br.select(ChanOpt::Enhanced).unwrap().cid, Cid(0x40));
        assert!(br.detach(Cid(0x40)).is_some());
        assert!(br.detach(Cid(0x40)).is_none());
    }

    #[test]
    fn one_req_per_chan() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let r1 = h.read_req(conn, 3);
        let r2 = h.read_req(conn, 3);
        assert_eq!(h.sent().len(), 1);
        h.recv_att(conn, &[0x0B, 0xAA]);
        assert_eq!(r1.take(), Some(Ok(vec![0xAA])));
        assert_eq!(h.sent().len(), 1);

        // Cancelled request leaves a sentinel until the late response
        h.cancel(conn, r2.id());
        assert_eq!(r2.take(), Some(Err(Error::Att(ErrorRsp::new(0x0A, None, ErrorCode::UnlikelyError)))));
        let r3 = h.read_req(conn, 3);
        assert!(h.sent().is_empty());
        h.recv_att(conn, &[0x0B, 0xBB]);
        assert_eq!(r3.take(), None);
        assert_eq!(h.sent().len(), 1);
        h.recv_att(conn, &[0x0B, 0xCC]);
        assert_eq!(r3.take(), Some(Ok(vec![0xCC])));
    }

    #[test]
    fn enhanced_parallel() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        h.chan_connected(ChanId { conn, cid: Cid(0x40) }, 100, 100).unwrap();
        let _r1 = h.read_req(conn, 3);
        let _r2 = h.read_req(conn, 4);
        let _r3 = h.read_req(conn, 5);
        let sent = h.sent_on();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0.cid, Cid(0x40));
        assert_eq!(sent[1].0.cid, Cid::ATT);
    }

    #[test]
    fn timeout_resets_bearer() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let r1 = h.read_req(conn, 3);
        let r2 = h.read_req(conn, 4);
        let r3 = h.read_req(conn, 5);
        h.advance(std::time::Duration::from_secs(31));
        assert_eq!(r1.take(), Some(Err(Error::Timeout(Opcode::ReadReq))));
        assert_eq!(r2.take(), Some(Err(Error::ConnectionReset)));
        assert_eq!(r3.take(), Some(Err(Error::ConnectionReset)));
        assert_eq!(h.transport().disconnects, vec![conn]);
        assert!(h.peer(conn).is_none());
    }

    #[test]
    fn would_block() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        h.transport_mut().block = true;
        let r = h.read_req(conn, 3);
        assert!(h.sent().is_empty());
        h.transport_mut().block = false;
        h.ready(ChanId::att(conn));
        assert_eq!(h.sent(), vec![vec![0x0A, 0x03, 0x00]]);
        h.recv_att(conn, &[0x0B]);
        assert_eq!(r.take(), Some(Ok(vec![])));
    }

    #[test]
    fn security_retry() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let r = h.read_req(conn, 3);
        h.sent();
        h.recv_att(conn, &[0x01, 0x0A, 0x03, 0x00, 0x05]);
        assert_eq!(h.transport().raised, vec![(conn, SecLevel::Encrypted)]);
        assert_eq!(r.take(), None);
        h.transport_mut().sec.level = SecLevel::Encrypted;
        h.encryption_changed(conn, true);
        assert_eq!(h.sent(), vec![vec![0x0A, 0x03, 0x00]]);
        h.recv_att(conn, &[0x0B, 0x01]);
        assert_eq!(r.take(), Some(Ok(vec![0x01])));

        // Failed upgrade reports the original error
        let r = h.read_req(conn, 3);
        h.sent();
        h.recv_att(conn, &[0x01, 0x0A, 0x03, 0x00, 0x05]);
        h.encryption_changed(conn, false);
        let e = ErrorRsp::new(0x0A, Handle::new(3), ErrorCode::InsufficientAuthentication);
        assert_eq!(r.take(), Some(Err(Error::Att(e))));
    }

    #[test]
    fn cancel_parked() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let r1 = h.read_req(conn, 3);
        h.sent();
        h.recv_att(conn, &[0x01, 0x0A, 0x03, 0x00, 0x05]);
        assert!(h.cancel(conn, r1.id()));
        let e = ErrorRsp::new(0x0A, None, ErrorCode::UnlikelyError);
        assert_eq!(r1.take(), Some(Err(Error::Att(e))));

        // Channel is free for the next request
        let r2 = h.read_req(conn, 4);
        assert_eq!(h.sent(), vec![vec![0x0A, 0x04, 0x00]]);
        h.transport_mut().sec.level = SecLevel::Encrypted;
        h.encryption_changed(conn, true);
        assert!(h.sent().is_empty());
        h.recv_att(conn, &[0x0B, 0x02]);
        assert_eq!(r2.take(), Some(Ok(vec![0x02])));
    }

    #[test]
    fn security_retry_blocked() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let r = h.read_req(conn, 3);
        h.sent();
        h.recv_att(conn, &[0x01, 0x0A, 0x03, 0x00, 0x05]);
        h.transport_mut().sec.level = SecLevel::Encrypted;
        h.transport_mut().block = true;
        h.encryption_changed(conn, true);
        assert!(h.sent().is_empty());
        assert_eq!(r.take(), None);

        h.transport_mut().block = false;
        h.ready(ChanId::att(conn));
        assert_eq!(h.sent(), vec![vec![0x0A, 0x03, 0x00]]);
        h.recv_att(conn, &[0x0B, 0x01]);
        assert_eq!(r.take(), Some(Ok(vec![0x01])));
    }
}

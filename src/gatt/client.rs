use std::sync::Arc;

use bitflags::bitflags;
use smallvec::SmallVec;
use structbuf::Unpack;
use tracing::{debug, trace, warn};

use gattic_const::{Declaration, Descriptor, UuidVec};

use crate::att::{done, send_done, Pdu, ReqId, SendDone, DEFAULT_MTU};
use crate::host::{ChanId, Cid, ConnId, Host, SecLevel, Transport};
use crate::le::Peer;
use crate::Result;

use super::*;

/// Discovery procedure ([Vol 3] Part G, Section 4.4 to 4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Discover {
    /// Primary services, optionally with a specific UUID.
    Primary(Option<Uuid>),
    /// Secondary services.
    Secondary,
    /// Included services.
    Include,
    /// Characteristics, optionally with a specific UUID.
    Characteristic(Option<Uuid>),
    /// Characteristic descriptors. Declarations in the range are skipped.
    Descriptor,
    /// All attributes.
    Attribute,
    /// Values of one standard characteristic descriptor type (extended
    /// properties, client or server configuration, or presentation format).
    StdDescriptor(Descriptor),
}

/// Discovered attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Discovered {
    Service { hdl: Handle, end: Handle, uuid: Uuid },
    Include { hdl: Handle, start: Handle, end: Handle, uuid: Uuid },
    Characteristic { hdl: Handle, props: Prop, val: Handle, uuid: Uuid },
    Attribute { hdl: Handle, uuid: Uuid },
    Descriptor { hdl: Handle, uuid: Uuid, val: Vec<u8> },
}

impl Discovered {
    /// Returns the attribute handle.
    #[must_use]
    pub const fn handle(&self) -> Handle {
        match *self {
            Self::Service { hdl, .. }
            | Self::Include { hdl, .. }
            | Self::Characteristic { hdl, .. }
            | Self::Attribute { hdl, .. }
            | Self::Descriptor { hdl, .. } => hdl,
        }
    }
}

/// Discovery callback. Called once for every discovered attribute and then
/// with `Ok(None)` when the range is exhausted. Returning [`Iter::Stop`]
/// ends the procedure without a terminating call.
pub type DiscoverFn<T> = Box<dyn FnMut(&mut Host<T>, ConnId, Result<Option<Discovered>>) -> Iter + Send>;

/// Read By Type callback. Called for each `(handle, value)` pair and then
/// with `Ok(None)`.
pub type ReadByUuidFn<T> =
    Box<dyn for<'a> FnMut(&mut Host<T>, ConnId, Result<Option<(Handle, &'a [u8])>>) -> Iter + Send>;

/// Notification callback. `None` means that the subscription was removed.
/// Returning [`Iter::Stop`] unsubscribes.
pub type NotifyFn<T> = Arc<dyn Fn(&mut Host<T>, ConnId, Option<&[u8]>) -> Iter + Send + Sync>;

bitflags! {
    /// Subscription flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct SubFlags: u8 {
        /// Remove the subscription on disconnect even if the peer is bonded.
        const VOLATILE = 1 << 0;
        /// Do not rewrite the CCC descriptor when a bonded peer reconnects.
        const NO_RESUB = 1 << 1;
        /// CCC descriptor write is pending. Managed by the host.
        const WRITE_PENDING = 1 << 2;
    }
}

/// Subscription parameters ([Vol 3] Part G, Section 4.10 and 4.11).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Subscribe {
    /// Characteristic value handle.
    pub val: Handle,
    /// CCC descriptor handle.
    pub ccc: Handle,
    /// Requested configuration.
    pub value: Cccd,
    /// Security level required before the CCC descriptor is written.
    pub min_sec: SecLevel,
    pub flags: SubFlags,
}

impl Subscribe {
    /// Returns notification subscription parameters.
    #[inline]
    #[must_use]
    pub fn new(val: Handle, ccc: Handle, value: Cccd) -> Self {
        Self {
            val,
            ccc,
            value,
            min_sec: SecLevel::Open,
            flags: SubFlags::empty(),
        }
    }
}

/// Subscription identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct SubId(u32);

/// Active subscription of a remote characteristic.
pub(crate) struct Subscription<T: Transport> {
    id: SubId,
    peer: Peer,
    /// `None` while a bonded peer is disconnected.
    conn: Option<ConnId>,
    p: Subscribe,
    notify: NotifyFn<T>,
    /// Completion of the initial CCC write.
    done: Option<SendDone<T>>,
    /// CCC write is in flight.
    writing: bool,
}

/// Client subscription state.
pub(crate) struct Client<T: Transport> {
    subs: Vec<Subscription<T>>,
    next: u32,
}

impl<T: Transport> Default for Client<T> {
    fn default() -> Self {
        Self {
            subs: Vec::new(),
            next: 1,
        }
    }
}

impl<T: Transport> Client<T> {
    /// Returns the combined configuration of all subscriptions of `peer` to
    /// the CCC descriptor at `ccc`.
    fn ccc_value(&self, peer: Peer, ccc: Handle) -> Cccd {
        (self.subs.iter())
            .filter(|s| s.peer == peer && s.p.ccc == ccc)
            .fold(Cccd::empty(), |v, s| v | s.p.value)
    }

    /// Removes a subscription.
    fn remove(&mut self, id: SubId) -> Option<Subscription<T>> {
        let i = self.subs.iter().position(|s| s.id == id)?;
        Some(self.subs.remove(i))
    }
}

/// Queues the next request of a multi-request procedure. If no request can
/// be queued, `fail` receives the procedure state and the error instead.
fn resume<T: Transport, S>(
    h: &mut Host<T>,
    conn: ConnId,
    st: S,
    next: impl FnOnce(S, &mut Host<T>, ConnId) -> Result<ReqId>,
    fail: impl FnOnce(S, &mut Host<T>, Error),
) {
    if let Err(e) = h.can_submit(conn) {
        return fail(st, h, e);
    }
    // Submission only fails for the conditions checked above
    let r = next(st, h, conn);
    debug_assert!(r.is_ok(), "{conn} lost procedure request");
}

/// Client discovery state.
struct Discovery<T: Transport> {
    what: Discover,
    start: Handle,
    end: Handle,
    f: DiscoverFn<T>,
}

impl<T: Transport> Discovery<T> {
    /// Requests the next page starting at `self.start`.
    fn next(self, h: &mut Host<T>, conn: ConnId) -> Result<ReqId> {
        let r = HandleRange::new(self.start, self.end);
        let what = self.what;
        let d = done(move |h: &mut Host<T>, conn, rsp| self.rsp(h, conn, rsp));
        match what {
            Discover::Primary(None) => h.read_by_group_type_req(conn, r, Declaration::PrimaryService.uuid(), d),
            Discover::Primary(Some(u)) => {
                let typ = u16::from(Declaration::PrimaryService);
                h.find_by_type_value_req(conn, r, typ, UuidVec::new(u).to_vec().into(), d)
            }
            Discover::Secondary => h.read_by_group_type_req(conn, r, Declaration::SecondaryService.uuid(), d),
            Discover::Include => h.read_by_type_req(conn, r, Declaration::Include.uuid(), d),
            Discover::Characteristic(_) => h.read_by_type_req(conn, r, Declaration::Characteristic.uuid(), d),
            Discover::Descriptor | Discover::Attribute => h.find_information_req(conn, r, d),
            Discover::StdDescriptor(typ) => h.read_by_type_req(conn, r, typ.uuid(), d),
        }
    }

    /// Handles a discovery response.
    fn rsp(mut self, h: &mut Host<T>, conn: ConnId, rsp: Result<Pdu<'_>>) {
        let pdu = match rsp {
            Ok(pdu) => pdu,
            Err(e) if e.code() == Some(ErrorCode::AttributeNotFound) => {
                (self.f)(h, conn, Ok(None));
                return;
            }
            Err(e) => {
                (self.f)(h, conn, Err(e));
                return;
            }
        };
        let op = pdu.opcode();
        let mut out = Vec::new();
        let Some(last) = self.parse(pdu, &mut out) else {
            warn!("{conn} malformed {op}");
            (self.f)(h, conn, Err(unlikely(op)));
            return;
        };
        // Included services with 128-bit UUIDs require a separate read
        // ([Vol 3] Part G, Section 4.5.1).
        if let Some(&Discovered::Include { hdl, start, end, .. }) = out.last() {
            if self.what == Discover::Include && out.len() == 1 && pdu.params()[0] == 2 + 4 {
                if let Err(e) = h.can_submit(conn) {
                    (self.f)(h, conn, Err(e));
                    return;
                }
                let d = done(move |h: &mut Host<T>, conn, r: Result<Pdu<'_>>| {
                    let uuid = r.map(|p| Uuid::try_from(p.params()));
                    match uuid {
                        Ok(Ok(uuid)) => {
                            let inc = Discovered::Include { hdl, start, end, uuid };
                            self.deliver(h, conn, vec![inc], hdl);
                        }
                        Ok(Err(())) => {
                            (self.f)(h, conn, Err(unlikely(Opcode::ReadReq)));
                        }
                        Err(e) => {
                            (self.f)(h, conn, Err(e));
                        }
                    }
                });
                let r = h.read_req(conn, start, 0, d);
                debug_assert!(r.is_ok(), "{conn} lost included service read");
                return;
            }
        }
        self.deliver(h, conn, out, last);
    }

    /// Passes discovered attributes to the callback and continues after
    /// `last`.
    fn deliver(mut self, h: &mut Host<T>, conn: ConnId, out: Vec<Discovered>, last: Handle) {
        for v in out {
            if (self.f)(h, conn, Ok(Some(v))) == Iter::Stop {
                return;
            }
        }
        match last.next() {
            Some(next) if last < self.end => {
                self.start = next;
                trace!("{conn} continuing discovery at {next}");
                resume(h, conn, self, Self::next, |mut d: Self, h, e| {
                    (d.f)(h, conn, Err(e));
                });
            }
            _ => {
                (self.f)(h, conn, Ok(None));
            }
        }
    }

    /// Decodes a response into discovered attributes. Returns the handle
    /// after which discovery continues or [`None`] if the response is
    /// malformed.
    fn parse(&self, pdu: Pdu<'_>, out: &mut Vec<Discovered>) -> Option<Handle> {
        let in_range = |h: u16| Handle::new(h).filter(|&h| self.start <= h && h <= self.end);
        let mut last = None;
        match self.what {
            Discover::Primary(None) | Discover::Secondary => {
                for (hdl, end, v) in pdu.read_by_group_type_rsp()? {
                    let (hdl, end) = (in_range(hdl)?, Handle::new(end)?);
                    if end < hdl {
                        return None;
                    }
                    let uuid = Uuid::try_from(v).ok()?;
                    out.push(Discovered::Service { hdl, end, uuid });
                    last = Some(end);
                }
            }
            Discover::Primary(Some(uuid)) => {
                for (hdl, end) in pdu.find_by_type_value_rsp()? {
                    let (hdl, end) = (in_range(hdl)?, Handle::new(end)?);
                    if end < hdl {
                        return None;
                    }
                    out.push(Discovered::Service { hdl, end, uuid });
                    last = Some(end);
                }
            }
            Discover::Include => {
                for (hdl, v) in pdu.read_by_type_rsp()? {
                    let hdl = in_range(hdl)?;
                    let b = v.get(..4)?;
                    let mut p = b.unpack();
                    let (start, end) = (Handle::new(p.u16())?, Handle::new(p.u16())?);
                    last = Some(hdl);
                    let uuid = match v.len() {
                        6 => Uuid::try_from(&v[4..]).ok()?,
                        4 => {
                            // UUID is read separately, one include at a time
                            out.push(Discovered::Include {
                                hdl,
                                start,
                                end,
                                uuid: Declaration::Include.uuid(),
                            });
                            break;
                        }
                        _ => return None,
                    };
                    out.push(Discovered::Include { hdl, start, end, uuid });
                }
            }
            Discover::Characteristic(filter) => {
                for (hdl, v) in pdu.read_by_type_rsp()? {
                    let hdl = in_range(hdl)?;
                    if v.len() != 5 && v.len() != 19 {
                        return None;
                    }
                    let mut p = v.unpack();
                    let props = Prop::from_bits_retain(p.u8());
                    let val = Handle::new(p.u16())?;
                    let uuid = Uuid::try_from(&v[3..]).ok()?;
                    last = Some(hdl);
                    if filter.map_or(true, |f| f == uuid) {
                        out.push(Discovered::Characteristic { hdl, props, val, uuid });
                    }
                }
            }
            Discover::Descriptor | Discover::Attribute => {
                for (hdl, uuid) in pdu.find_information_rsp()? {
                    let (hdl, uuid) = (in_range(hdl)?, uuid?);
                    last = Some(hdl);
                    if self.what == Discover::Descriptor && is_declaration(uuid) {
                        continue;
                    }
                    out.push(Discovered::Attribute { hdl, uuid });
                }
            }
            Discover::StdDescriptor(typ) => {
                for (hdl, v) in pdu.read_by_type_rsp()? {
                    let hdl = in_range(hdl)?;
                    last = Some(hdl);
                    out.push(Discovered::Descriptor {
                        hdl,
                        uuid: typ.uuid(),
                        val: v.to_vec(),
                    });
                }
            }
        }
        last
    }
}

/// Read By Type procedure state.
struct ReadByUuid<T: Transport> {
    r: HandleRange,
    start: Handle,
    uuid: Uuid,
    f: ReadByUuidFn<T>,
}

impl<T: Transport> ReadByUuid<T> {
    /// Requests the next page.
    fn next(self, h: &mut Host<T>, conn: ConnId) -> Result<ReqId> {
        let (r, uuid) = (HandleRange::new(self.start, self.r.end()), self.uuid);
        h.read_by_type_req(conn, r, uuid, done(move |h: &mut Host<T>, conn, rsp| self.rsp(h, conn, rsp)))
    }

    /// Handles a Read By Type response
    /// ([Vol 3] Part G, Section 4.8.2).
    fn rsp(mut self, h: &mut Host<T>, conn: ConnId, rsp: Result<Pdu<'_>>) {
        let pdu = match rsp {
            Ok(pdu) => pdu,
            Err(e) if e.code() == Some(ErrorCode::AttributeNotFound) => {
                (self.f)(h, conn, Ok(None));
                return;
            }
            Err(e) => {
                (self.f)(h, conn, Err(e));
                return;
            }
        };
        let Some(it) = pdu.read_by_type_rsp() else {
            (self.f)(h, conn, Err(unlikely(Opcode::ReadByTypeReq)));
            return;
        };
        let mut last = self.start;
        for (hdl, v) in it {
            // Every handle must be within the requested range
            let Some(hdl) = Handle::new(hdl).filter(|&h| self.start <= h && h <= self.r.end()) else {
                warn!("{conn} read by type returned a handle outside of {:?}", self.r);
                (self.f)(h, conn, Err(unlikely(Opcode::ReadByTypeReq)));
                return;
            };
            last = hdl;
            if (self.f)(h, conn, Ok(Some((hdl, v)))) == Iter::Stop {
                return;
            }
        }
        match last.next() {
            Some(next) if last < self.r.end() => {
                self.start = next;
                resume(h, conn, self, Self::next, |mut rd: Self, h, e| {
                    (rd.f)(h, conn, Err(e));
                });
            }
            _ => {
                (self.f)(h, conn, Ok(None));
            }
        }
    }
}

/// Long read state ([Vol 3] Part G, Section 4.8.3).
struct LongRead<T: Transport> {
    hdl: Handle,
    off: u16,
    acc: Vec<u8>,
    done: Box<dyn FnOnce(&mut Host<T>, ConnId, Result<Vec<u8>>) + Send>,
}

impl<T: Transport> LongRead<T> {
    /// Requests the fragment after the received part of the value.
    fn next(self, h: &mut Host<T>, conn: ConnId) -> Result<ReqId> {
        #[allow(clippy::cast_possible_truncation)]
        let at = self.off + self.acc.len() as u16;
        let hdl = self.hdl;
        h.read_req(conn, hdl, at, done(move |h: &mut Host<T>, conn, r| self.rsp(h, conn, r)))
    }

    /// Appends a fragment. The value is complete when a fragment is shorter
    /// than the MTU of the channel that carried it allows.
    fn rsp(mut self, h: &mut Host<T>, conn: ConnId, r: Result<Pdu<'_>>) {
        let pdu = match r {
            Ok(pdu) => pdu,
            // Reading past the end of a value that was a multiple of the
            // fragment size.
            Err(e)
                if !self.acc.is_empty()
                    && matches!(e.code(), Some(ErrorCode::AttributeNotLong | ErrorCode::InvalidOffset)) =>
            {
                return (self.done)(h, conn, Ok(self.acc));
            }
            Err(e) => return (self.done)(h, conn, Err(e)),
        };
        let v = pdu.params();
        self.acc.extend_from_slice(v);
        if v.len() + 1 < usize::from(pdu.chan_mtu()) || usize::from(self.off) + self.acc.len() >= MAX_VAL_LEN {
            return (self.done)(h, conn, Ok(self.acc));
        }
        trace!("{conn} continuing long read of {} at {}", self.hdl, self.acc.len());
        resume(h, conn, self, Self::next, |rd: Self, h, e| (rd.done)(h, conn, Err(e)));
    }
}

/// Long write state ([Vol 3] Part G, Section 4.9.4).
struct LongWrite<T: Transport> {
    hdl: Handle,
    off: u16,
    val: Arc<[u8]>,
    pos: usize,
    chunk: usize,
    done: SendDone<T>,
}

impl<T: Transport> LongWrite<T> {
    /// Sends the next prepared write or the execute request.
    fn next(self, h: &mut Host<T>, conn: ConnId) -> Result<ReqId> {
        if self.pos >= self.val.len() {
            let d = self.done;
            return h.execute_write_req(conn, true, done(move |h: &mut Host<T>, conn, r| d(h, conn, r.map(|_| ()))));
        }
        let end = (self.pos + self.chunk).min(self.val.len());
        let v: Box<[u8]> = self.val[self.pos..end].into();
        #[allow(clippy::cast_possible_truncation)]
        let off = self.off + self.pos as u16;
        let hdl = self.hdl;
        h.prepare_write_req(conn, hdl, off, v, done(move |h: &mut Host<T>, conn, r| self.prepared(h, conn, r, end)))
    }

    /// Verifies the prepared write echo and continues.
    fn prepared(mut self, h: &mut Host<T>, conn: ConnId, r: Result<Pdu<'_>>, end: usize) {
        let pdu = match r {
            Ok(pdu) => pdu,
            Err(e) => {
                if self.pos > 0 {
                    self.cancel(h, conn);
                }
                (self.done)(h, conn, Err(e));
                return;
            }
        };
        let mut p = pdu.unpack();
        let ok = p.u16() == self.hdl.get()
            && usize::from(p.u16()) == usize::from(self.off) + self.pos
            && pdu.params()[4..] == self.val[self.pos..end];
        if !ok {
            warn!("{conn} prepared write echo mismatch for {}", self.hdl);
            self.cancel(h, conn);
            (self.done)(h, conn, Err(unlikely(Opcode::PrepareWriteReq)));
            return;
        }
        self.pos = end;
        resume(h, conn, self, Self::next, |w: Self, h, e| (w.done)(h, conn, Err(e)));
    }

    /// Discards the server prepare queue.
    fn cancel(&self, h: &mut Host<T>, conn: ConnId) {
        if let Err(e) = h.execute_write_req(conn, false, done(|_, _, _| {})) {
            debug!("{conn} failed to cancel prepared writes: {e}");
        }
    }
}

/// Generic Attribute Profile client procedures ([Vol 3] Part G, Section 4).
impl<T: Transport> Host<T> {
    /// Exchanges the fixed channel MTU ([Vol 3] Part G, Section 4.3.1).
    /// `done` receives the new MTU.
    pub fn exchange_mtu(
        &mut self,
        conn: ConnId,
        done: impl FnOnce(&mut Self, ConnId, Result<u16>) + Send + 'static,
    ) -> Result<ReqId> {
        self.exchange_mtu_req(
            conn,
            crate::att::done(move |h: &mut Self, conn, r| {
                let r = r.map(|pdu| h.mtu_exchanged(conn, pdu.mtu()));
                done(h, conn, r);
            }),
        )
    }

    /// Discovers attributes of type `what` within range `r`
    /// ([Vol 3] Part G, Section 4.4 to 4.7).
    pub fn discover(
        &mut self,
        conn: ConnId,
        what: Discover,
        r: HandleRange,
        f: impl FnMut(&mut Self, ConnId, Result<Option<Discovered>>) -> Iter + Send + 'static,
    ) -> Result<ReqId> {
        if let Discover::StdDescriptor(typ) = what {
            if !matches!(
                typ,
                Descriptor::CharacteristicExtendedProperties
                    | Descriptor::ClientCharacteristicConfiguration
                    | Descriptor::ServerCharacteristicConfiguration
                    | Descriptor::CharacteristicPresentationFormat
            ) {
                return Err(Error::InvalidParam);
            }
        }
        let d = Discovery {
            what,
            start: r.start(),
            end: r.end(),
            f: Box::new(f),
        };
        d.next(self, conn)
    }

    /// Reads a characteristic value or descriptor starting at `off`,
    /// continuing with `ATT_READ_BLOB_REQ` until the complete value is
    /// received ([Vol 3] Part G, Section 4.8.1 and 4.8.3).
    pub fn read(
        &mut self,
        conn: ConnId,
        hdl: Handle,
        off: u16,
        done: impl FnOnce(&mut Self, ConnId, Result<Vec<u8>>) + Send + 'static,
    ) -> Result<ReqId> {
        let rd = LongRead {
            hdl,
            off,
            acc: Vec::new(),
            done: Box::new(done),
        };
        rd.next(self, conn)
    }

    /// Reads multiple values with known lengths
    /// ([Vol 3] Part G, Section 4.8.4). The values are concatenated.
    pub fn read_multiple(
        &mut self,
        conn: ConnId,
        hdls: &[Handle],
        done: impl FnOnce(&mut Self, ConnId, Result<Vec<u8>>) + Send + 'static,
    ) -> Result<ReqId> {
        let d = crate::att::done(move |h: &mut Self, conn, r| done(h, conn, r.map(|p| p.params().to_vec())));
        self.read_multiple_req(conn, hdls, false, d)
    }

    /// Reads multiple variable length values
    /// ([Vol 3] Part G, Section 4.8.5). The last value may be truncated.
    pub fn read_multiple_variable(
        &mut self,
        conn: ConnId,
        hdls: &[Handle],
        done: impl FnOnce(&mut Self, ConnId, Result<Vec<Vec<u8>>>) + Send + 'static,
    ) -> Result<ReqId> {
        let d = crate::att::done(move |h: &mut Self, conn, r: Result<Pdu<'_>>| {
            let r = r.map(|p| p.length_value_list(false).map(|(_, v)| v.to_vec()).collect());
            done(h, conn, r);
        });
        self.read_multiple_req(conn, hdls, true, d)
    }

    /// Reads all values of type `uuid` within range `r`
    /// ([Vol 3] Part G, Section 4.8.2).
    pub fn read_by_uuid(
        &mut self,
        conn: ConnId,
        r: HandleRange,
        uuid: Uuid,
        f: impl for<'a> FnMut(&mut Self, ConnId, Result<Option<(Handle, &'a [u8])>>) -> Iter + Send + 'static,
    ) -> Result<ReqId> {
        let rd = ReadByUuid {
            r,
            start: r.start(),
            uuid,
            f: Box::new(f),
        };
        rd.next(self, conn)
    }

    /// Writes a characteristic value or descriptor
    /// ([Vol 3] Part G, Section 4.9.3 and 4.9.4). Values that do not fit
    /// in one request or start at a non-zero offset are written with
    /// prepared writes.
    pub fn write(
        &mut self,
        conn: ConnId,
        hdl: Handle,
        off: u16,
        val: impl Into<Vec<u8>>,
        done: impl FnOnce(&mut Self, ConnId, Result<()>) + Send + 'static,
    ) -> Result<ReqId> {
        let val = val.into();
        if usize::from(off) + val.len() > MAX_VAL_LEN {
            return Err(Error::InvalidParam);
        }
        let mtu = usize::from(self.conn(conn).ok_or(Error::NotConnected)?.br.min_mtu());
        if off == 0 && 3 + val.len() <= mtu {
            let d = crate::att::done(move |h: &mut Self, conn, r| done(h, conn, r.map(|_| ())));
            return self.write_req(conn, hdl, val.into(), d);
        }
        let w = LongWrite {
            hdl,
            off,
            val: val.into(),
            pos: 0,
            chunk: mtu - 5,
            done: send_done(done),
        };
        w.next(self, conn)
    }

    /// Writes a characteristic value without a response, optionally signed
    /// ([Vol 3] Part G, Section 4.9.1 and 4.9.2).
    #[inline]
    pub fn write_without_rsp(&mut self, conn: ConnId, hdl: Handle, val: &[u8], signed: bool) -> Result<()> {
        self.write_cmd(conn, hdl, val, signed)
    }

    /// Subscribes to notifications or indications of a remote
    /// characteristic. The CCC descriptor is written only if the combined
    /// configuration of all subscriptions to it changes. `done` is called
    /// once the descriptor is written.
    pub fn subscribe(
        &mut self,
        conn: ConnId,
        p: Subscribe,
        notify: impl Fn(&mut Self, ConnId, Option<&[u8]>) -> Iter + Send + Sync + 'static,
        done: impl FnOnce(&mut Self, ConnId, Result<()>) + Send + 'static,
    ) -> Result<SubId> {
        let peer = self.peer(conn).ok_or(Error::NotConnected)?;
        if p.value.is_empty() {
            return Err(Error::InvalidParam);
        }
        let before = self.clt.ccc_value(peer, p.ccc);
        let id = SubId(self.clt.next);
        self.clt.next = self.clt.next.wrapping_add(1);
        let mut s = Subscription {
            id,
            peer,
            conn: Some(conn),
            p,
            notify: Arc::new(notify),
            done: None,
            writing: false,
        };
        s.p.flags.remove(SubFlags::WRITE_PENDING);
        if before.contains(p.value) {
            debug!("{conn} CCC {} already configured", p.ccc);
            self.clt.subs.push(s);
            done(self, conn, Ok(()));
            return Ok(id);
        }
        s.p.flags.insert(SubFlags::WRITE_PENDING);
        s.done = Some(send_done(done));
        self.clt.subs.push(s);
        if self.tr.security(conn).level < p.min_sec {
            debug!("{conn} subscription {id:?} waiting for {:?} security", p.min_sec);
            if !self.tr.raise_security(conn, p.min_sec) {
                self.clt.remove(id);
                return Err(Error::Authentication);
            }
            return Ok(id);
        }
        if let Err(e) = self.write_sub_ccc(conn, peer, p.ccc) {
            self.clt.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Removes a subscription. The CCC descriptor is rewritten if the
    /// combined configuration of the remaining subscriptions changes.
    pub fn unsubscribe(
        &mut self,
        conn: ConnId,
        id: SubId,
        done: impl FnOnce(&mut Self, ConnId, Result<()>) + Send + 'static,
    ) -> Result<()> {
        let peer = self.peer(conn).ok_or(Error::NotConnected)?;
        if !(self.clt.subs.iter()).any(|s| s.id == id && s.peer == peer) {
            return Err(Error::NotFound);
        }
        let Some(s) = self.clt.remove(id) else { return Err(Error::NotFound) };
        let after = self.clt.ccc_value(peer, s.p.ccc);
        (s.notify)(self, conn, None);
        if let Some(f) = s.done {
            f(self, conn, Err(Error::ConnectionReset));
        }
        if after.contains(s.p.value) {
            done(self, conn, Ok(()));
            return Ok(());
        }
        trace!("{conn} unsubscribing {id:?}");
        let d = crate::att::done(move |h: &mut Self, conn, r| done(h, conn, r.map(|_| ())));
        self.write_req(conn, s.p.ccc, after.bits().to_le_bytes().into(), d)?;
        Ok(())
    }

    /// Updates the fixed channel MTU after an exchange.
    fn mtu_exchanged(&mut self, conn: ConnId, srv_mtu: u16) -> u16 {
        let mtu = srv_mtu.max(DEFAULT_MTU).min(self.cfg.rx_mtu());
        if let Some(c) = self.conn_mut(conn).and_then(|cn| cn.br.chan_mut(Cid::ATT)) {
            if mtu > c.tx_mtu {
                c.set_mtu(mtu, mtu);
            }
        }
        self.mtu_updated(conn);
        mtu
    }

    /// Writes the combined configuration of `peer` to a remote CCC
    /// descriptor.
    fn write_sub_ccc(&mut self, conn: ConnId, peer: Peer, ccc: Handle) -> Result<()> {
        let v = self.clt.ccc_value(peer, ccc);
        trace!("{conn} writing CCC {ccc} = {v:?}");
        let d = done(move |h: &mut Self, conn, r| h.sub_written(peer, ccc, conn, r.map(|_| ())));
        self.write_req(conn, ccc, v.bits().to_le_bytes().into(), d)?;
        for s in (self.clt.subs.iter_mut()).filter(|s| s.peer == peer && s.p.ccc == ccc) {
            if s.p.flags.contains(SubFlags::WRITE_PENDING) {
                s.writing = true;
            }
        }
        Ok(())
    }

    /// Completes pending subscriptions after a CCC descriptor write. New
    /// subscriptions are removed if the write failed.
    fn sub_written(&mut self, peer: Peer, ccc: Handle, conn: ConnId, r: Result<()>) {
        let mut cbs: SmallVec<[(SendDone<T>, NotifyFn<T>, bool); 2]> = SmallVec::new();
        self.clt.subs.retain_mut(|s| {
            if s.peer != peer || s.p.ccc != ccc || !s.writing {
                return true;
            }
            s.writing = false;
            s.p.flags.remove(SubFlags::WRITE_PENDING);
            let Some(f) = s.done.take() else {
                if let Err(e) = r {
                    warn!("{conn} resubscription to {ccc} failed: {e}");
                }
                return true;
            };
            cbs.push((f, Arc::clone(&s.notify), r.is_err()));
            r.is_ok()
        });
        for (f, notify, removed) in cbs {
            if removed {
                notify(self, conn, None);
            }
            f(self, conn, r);
        }
    }

    /// Restores subscriptions of a reconnected bonded peer and writes CCC
    /// descriptors that were waiting for a security upgrade.
    pub(crate) fn resubscribe(&mut self, conn: ConnId) {
        let Some(peer) = self.peer(conn) else { return };
        let level = self.tr.security(conn).level;
        let mut cccs: SmallVec<[Handle; 4]> = SmallVec::new();
        for s in (self.clt.subs.iter_mut()).filter(|s| s.peer == peer) {
            if s.conn.is_none() {
                s.conn = Some(conn);
                if !s.p.flags.contains(SubFlags::NO_RESUB) {
                    s.p.flags.insert(SubFlags::WRITE_PENDING);
                }
            }
            if s.p.flags.contains(SubFlags::WRITE_PENDING)
                && !s.writing
                && level >= s.p.min_sec
                && !cccs.contains(&s.p.ccc)
            {
                cccs.push(s.p.ccc);
            }
        }
        for ccc in cccs {
            debug!("{conn} resubscribing to {ccc}");
            if let Err(e) = self.write_sub_ccc(conn, peer, ccc) {
                warn!("{conn} failed to resubscribe to {ccc}: {e}");
            }
        }
    }

    /// Handles an incoming notification or indication
    /// ([Vol 3] Part G, Section 4.10 and 4.11).
    pub(crate) fn client_notify(&mut self, ch: ChanId, pdu: Pdu<'_>) {
        let op = pdu.opcode();
        if op == Opcode::MultipleHandleValueNtf {
            for (hdl, v) in pdu.length_value_list(true) {
                self.notify_subs(ch.conn, hdl, v);
            }
        } else {
            self.notify_subs(ch.conn, pdu.unpack().u16(), &pdu.params()[2..]);
        }
        if op == Opcode::HandleValueInd {
            if let Err(e) = self.confirm(ch) {
                warn!("{ch} failed to confirm indication: {e}");
            }
        }
    }

    /// Removes subscriptions of a closed connection. Non-volatile
    /// subscriptions of bonded peers are kept until the peer reconnects.
    pub(crate) fn client_disconnected(&mut self, id: ConnId, peer: Peer, bonded: bool) {
        let mut cbs: SmallVec<[(Option<SendDone<T>>, NotifyFn<T>); 2]> = SmallVec::new();
        self.clt.subs.retain_mut(|s| {
            if s.peer != peer || s.conn != Some(id) {
                return true;
            }
            s.conn = None;
            s.writing = false;
            if bonded && !s.p.flags.contains(SubFlags::VOLATILE) {
                return true;
            }
            cbs.push((s.done.take(), Arc::clone(&s.notify)));
            false
        });
        for (f, notify) in cbs {
            notify(self, id, None);
            if let Some(f) = f {
                f(self, id, Err(Error::ConnectionReset));
            }
        }
    }

    /// Removes all subscriptions of a peer. Connected subscriptions are
    /// notified of the removal.
    pub(crate) fn forget_subscriptions(&mut self, peer: Peer) {
        let (gone, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.clt.subs).into_iter().partition(|s| s.peer == peer);
        self.clt.subs = keep;
        for s in gone {
            let Subscription { conn, notify, .. } = s;
            if let Some(conn) = conn {
                notify(self, conn, None);
            }
        }
    }

    /// Passes a notified value to all matching subscriptions.
    fn notify_subs(&mut self, conn: ConnId, hdl: u16, v: &[u8]) {
        let subs: SmallVec<[(SubId, NotifyFn<T>); 2]> = (self.clt.subs.iter())
            .filter(|s| s.conn == Some(conn) && s.p.val.get() == hdl)
            .map(|s| (s.id, Arc::clone(&s.notify)))
            .collect();
        if subs.is_empty() {
            trace!("{conn} no subscription for {hdl:#06X}");
        }
        for (id, f) in subs {
            if f(self, conn, Some(v)) == Iter::Stop {
                if let Err(e) = self.unsubscribe(conn, id, |_, _, _| {}) {
                    debug!("{conn} failed to unsubscribe {id:?}: {e}");
                }
            }
        }
    }
}

/// Returns whether `u` is an attribute declaration type.
#[inline]
fn is_declaration(u: Uuid) -> bool {
    u == Declaration::PrimaryService
        || u == Declaration::SecondaryService
        || u == Declaration::Include
        || u == Declaration::Characteristic
}

/// Returns the error reported for a malformed or unexpected response.
#[inline]
fn unlikely(op: Opcode) -> Error {
    Error::Att(ErrorRsp::new(op.into(), None, ErrorCode::UnlikelyError))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use gattic_const::{Characteristic, Service};

    use super::*;
    use crate::att::Access;
    use crate::host::tests::{pump, MockTransport, TestHost};

    type H = Host<MockTransport>;

    struct Pair {
        clt: TestHost,
        cc: ConnId,
        srv: TestHost,
        sc: ConnId,
        val: SharedValue,
    }

    impl Pair {
        fn new() -> Self {
            let val = SharedValue::new([0]);
            let io = val.clone();
            let mut srv = TestHost::with_service(move |s| {
                s.characteristic(
                    Characteristic::BatteryLevel,
                    Prop::READ | Prop::WRITE | Prop::NOTIFY | Prop::INDICATE,
                    Access::READ_WRITE,
                    io,
                    |d| d.client_cfg(Access::READ_WRITE, Ccc::default()),
                );
            });
            let mut clt = TestHost::new();
            let (cc, sc) = (clt.connect(false), srv.connect(false));
            Self { clt, cc, srv, sc, val }
        }

        fn pump(&mut self) {
            pump(&mut self.clt, self.cc, &mut self.srv, self.sc);
        }

        fn discover(&mut self, what: Discover, r: HandleRange) -> Vec<Discovered> {
            let out = Arc::new(Mutex::new(Vec::new()));
            let fin = Arc::new(AtomicUsize::new(0));
            let (o, f) = (Arc::clone(&out), Arc::clone(&fin));
            (self.clt)
                .discover(self.cc, what, r, move |_, _, r| {
                    match r.unwrap() {
                        Some(v) => o.lock().push(v),
                        None => {
                            f.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Iter::Continue
                })
                .unwrap();
            self.pump();
            assert_eq!(fin.load(Ordering::Relaxed), 1);
            let v = out.lock().clone();
            v
        }
    }

    fn hdl(h: u16) -> Handle {
        Handle::new(h).unwrap()
    }

    /// Fills the request pool.
    fn exhaust(h: &mut H, conn: ConnId) {
        while h.can_request() {
            h.read(conn, hdl(1), 0, |_, _, _| {}).unwrap();
        }
    }

    #[test]
    fn discovery_pages() {
        let mut p = Pair::new();
        let svcs = p.discover(Discover::Primary(None), HandleRange::ALL);
        let want = vec![
            Discovered::Service {
                hdl: hdl(0x01),
                end: hdl(0x08),
                uuid: Service::GenericAttribute.uuid(),
            },
            Discovered::Service {
                hdl: hdl(0x09),
                end: hdl(0x0C),
                uuid: Service::Battery.uuid(),
            },
        ];
        assert_eq!(svcs, want);
        let by_uuid = p.discover(Discover::Primary(Some(Service::Battery.uuid())), HandleRange::ALL);
        assert_eq!(by_uuid, want[1..]);

        // Results do not depend on the MTU
        let chars = p.discover(Discover::Characteristic(None), HandleRange::ALL);
        let attrs = p.discover(Discover::Attribute, HandleRange::ALL);
        assert_eq!(chars.len(), 4);
        assert_eq!(attrs.len(), 12);
        let mtu = Arc::new(Mutex::new(None));
        let m = Arc::clone(&mtu);
        (p.clt.exchange_mtu(p.cc, move |_, _, r| *m.lock() = Some(r))).unwrap();
        p.pump();
        assert_eq!(*mtu.lock(), Some(Ok(247)));
        assert_eq!(p.clt.mtu(p.cc), Some(247));
        assert_eq!(p.discover(Discover::Characteristic(None), HandleRange::ALL), chars);
        assert_eq!(p.discover(Discover::Attribute, HandleRange::ALL), attrs);

        let bl = Characteristic::BatteryLevel.uuid();
        let one = p.discover(Discover::Characteristic(Some(bl)), HandleRange::ALL);
        assert_eq!(
            one,
            vec![Discovered::Characteristic {
                hdl: hdl(0x0A),
                props: Prop::READ | Prop::WRITE | Prop::NOTIFY | Prop::INDICATE,
                val: hdl(0x0B),
                uuid: bl,
            }]
        );
        let desc = p.discover(Discover::Descriptor, HandleRange::new(hdl(0x0B), hdl(0x0C)));
        let ccc = Descriptor::ClientCharacteristicConfiguration.uuid();
        assert_eq!(
            desc,
            vec![
                Discovered::Attribute { hdl: hdl(0x0B), uuid: bl },
                Discovered::Attribute { hdl: hdl(0x0C), uuid: ccc },
            ]
        );
        let std = p.discover(
            Discover::StdDescriptor(Descriptor::ClientCharacteristicConfiguration),
            HandleRange::ALL,
        );
        assert_eq!(std.len(), 2);
        let cud = Discover::StdDescriptor(Descriptor::CharacteristicUserDescription);
        let r = p.clt.discover(p.cc, cud, HandleRange::ALL, |_, _, _| Iter::Stop);
        assert_eq!(r, Err(Error::InvalidParam));
    }

    #[test]
    fn long_read_write() {
        let mut p = Pair::new();
        let val = p.srv.svc_handle(2);
        let v: Vec<u8> = (0..60).collect();
        p.val.set(v.clone());
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        p.clt.read(p.cc, val, 0, move |_, _, v| *r.lock() = Some(v)).unwrap();
        p.pump();
        assert_eq!(res.lock().take(), Some(Ok(v)));

        let w: Vec<u8> = (100..140).collect();
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        p.clt.write(p.cc, val, 0, w.clone(), move |_, _, v| *r.lock() = Some(v)).unwrap();
        p.pump();
        assert_eq!(res.lock().take(), Some(Ok(())));
        assert_eq!(p.val.get(), w);

        // Short writes use a single request
        p.clt.write(p.cc, val, 0, [1, 2], |_, _, _| {}).unwrap();
        let sent = p.clt.sent();
        assert_eq!(sent, vec![vec![0x12, val.get() as u8, 0x00, 1, 2]]);
        assert_eq!(p.clt.write(p.cc, val, 500, [0; 13], |_, _, _| {}), Err(Error::InvalidParam));
    }

    #[test]
    fn prepare_echo_mismatch() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        h.write(conn, hdl(0x20), 0, [0xAA; 40], move |_, _, v| *r.lock() = Some(v)).unwrap();
        let sent = h.sent();
        assert_eq!(sent[0][..5], [0x16, 0x20, 0x00, 0x00, 0x00]);
        assert_eq!(sent[0].len(), 5 + 18);
        let mut echo = sent[0].clone();
        echo[0] = 0x17;
        echo[6] = 0xBB;
        h.recv_att(conn, &echo);
        assert_eq!(h.sent(), vec![vec![0x18, 0x00]]);
        let e = Error::Att(ErrorRsp::new(0x16, None, ErrorCode::UnlikelyError));
        assert_eq!(res.lock().take(), Some(Err(e)));
    }

    #[test]
    fn read_by_uuid_range() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::clone(&got);
        let r = HandleRange::new(hdl(1), hdl(5));
        let u = Characteristic::BatteryLevel.uuid();
        (h.read_by_uuid(conn, r, u, move |_: &mut H, _, v: Result<Option<(Handle, &[u8])>>| {
            g.lock().push(v.map(|o| o.map(|(h, v)| (h, v.to_vec()))));
            Iter::Continue
        }))
        .unwrap();
        assert_eq!(h.sent(), vec![vec![0x08, 0x01, 0x00, 0x05, 0x00, 0x19, 0x2A]]);
        h.recv_att(conn, &[0x09, 0x03, 0x02, 0x00, 0x55]);
        assert_eq!(h.sent(), vec![vec![0x08, 0x03, 0x00, 0x05, 0x00, 0x19, 0x2A]]);
        h.recv_att(conn, &[0x09, 0x03, 0x07, 0x00, 0x66]);
        let e = Error::Att(ErrorRsp::new(0x08, None, ErrorCode::UnlikelyError));
        assert_eq!(*got.lock(), vec![Ok(Some((hdl(2), vec![0x55]))), Err(e)]);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn discovery_next_page_fails() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::clone(&got);
        (h.discover(conn, Discover::Primary(None), HandleRange::ALL, move |h: &mut H, conn, r| {
            if matches!(r, Ok(Some(_))) {
                exhaust(h, conn);
            }
            g.lock().push(r);
            Iter::Continue
        }))
        .unwrap();
        h.sent();
        h.recv_att(conn, &[0x11, 0x06, 0x01, 0x00, 0x08, 0x00, 0x01, 0x18]);
        let svc = Discovered::Service {
            hdl: hdl(0x01),
            end: hdl(0x08),
            uuid: Service::GenericAttribute.uuid(),
        };
        assert_eq!(*got.lock(), vec![Ok(Some(svc)), Err(Error::NoResources)]);
    }

    #[test]
    fn read_by_uuid_next_page_fails() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::clone(&got);
        let r = HandleRange::new(hdl(1), hdl(5));
        let u = Characteristic::BatteryLevel.uuid();
        (h.read_by_uuid(conn, r, u, move |h: &mut H, conn, v: Result<Option<(Handle, &[u8])>>| {
            if matches!(v, Ok(Some(_))) {
                exhaust(h, conn);
            }
            g.lock().push(v.map(|o| o.map(|(h, v)| (h, v.to_vec()))));
            Iter::Continue
        }))
        .unwrap();
        h.sent();
        h.recv_att(conn, &[0x09, 0x03, 0x02, 0x00, 0x55]);
        assert_eq!(*got.lock(), vec![Ok(Some((hdl(2), vec![0x55]))), Err(Error::NoResources)]);
    }

    #[test]
    fn long_read_next_fragment_fails() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        let rd = LongRead {
            hdl: hdl(3),
            off: 0,
            acc: Vec::new(),
            done: Box::new(move |_: &mut H, _: ConnId, v: Result<Vec<u8>>| *r.lock() = Some(v)),
        };
        exhaust(&mut h, conn);
        let mut frag = vec![0x0B];
        frag.extend([5; 22]);
        rd.rsp(&mut h, conn, Ok(Pdu::new(&frag).unwrap()));
        assert_eq!(res.lock().take(), Some(Err(Error::NoResources)));
    }

    #[test]
    fn long_write_next_chunk_fails() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        let w = LongWrite {
            hdl: hdl(0x20),
            off: 0,
            val: Arc::from(&[0xAA; 40][..]),
            pos: 0,
            chunk: 18,
            done: send_done(move |_: &mut H, _, v| *r.lock() = Some(v)),
        };
        exhaust(&mut h, conn);
        let mut echo = vec![0x17, 0x20, 0x00, 0x00, 0x00];
        echo.extend([0xAA; 18]);
        w.prepared(&mut h, conn, Ok(Pdu::new(&echo).unwrap()), 18);
        assert_eq!(res.lock().take(), Some(Err(Error::NoResources)));
    }

    #[test]
    fn long_read_uses_response_chan_mtu() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let ch = ChanId { conn, cid: Cid(0x40) };
        h.chan_connected(ch, 100, 100).unwrap();
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        h.read(conn, hdl(3), 0, move |_, _, v| *r.lock() = Some(v)).unwrap();
        assert_eq!(h.sent_on(), vec![(ch, vec![0x0A, 0x03, 0x00])]);

        // 40 bytes fill the fixed channel MTU but not the enhanced one
        let mut rsp = vec![0x0B];
        rsp.extend([7; 40]);
        h.recv(ch, &rsp);
        assert_eq!(res.lock().take(), Some(Ok(vec![7; 40])));
        assert!(h.sent().is_empty());

        // A full fragment on the enhanced channel continues with a blob read
        h.read(conn, hdl(3), 0, |_, _, _| {}).unwrap();
        h.sent();
        let mut rsp = vec![0x0B];
        rsp.extend([7; 99]);
        h.recv(ch, &rsp);
        assert_eq!(h.sent_on(), vec![(ch, vec![0x0C, 0x03, 0x00, 99, 0x00])]);
    }

    #[test]
    fn subscribe_notify() {
        let mut p = Pair::new();
        let (val, ccc) = (p.srv.svc_handle(2), p.srv.svc_handle(3));
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::clone(&got);
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        let sub = Subscribe::new(val, ccc, Cccd::NOTIFY | Cccd::INDICATE);
        let id = (p.clt.subscribe(
            p.cc,
            sub,
            move |_, _, v| {
                g.lock().push(v.map(<[u8]>::to_vec));
                Iter::Continue
            },
            move |_, _, v| *r.lock() = Some(v),
        ))
        .unwrap();
        p.pump();
        assert_eq!(res.lock().take(), Some(Ok(())));
        assert!(p.srv.is_subscribed(p.sc, val, Cccd::NOTIFY | Cccd::INDICATE));

        // Covered configuration completes without a write
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = Arc::clone(&n);
        let sub2 = Subscribe::new(val, ccc, Cccd::NOTIFY);
        let id2 = (p.clt.subscribe(p.cc, sub2, |_, _, _| Iter::Continue, move |_, _, r| {
            assert_eq!(r, Ok(()));
            n2.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();
        assert_eq!(n.load(Ordering::Relaxed), 1);
        assert!(p.clt.sent().is_empty());

        p.srv.notify(Some(p.sc), val, &[7]).unwrap();
        let cfm = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&cfm);
        p.srv
            .indicate(Some(p.sc), val, &[8], move |_, _, r| {
                assert_eq!(r, Ok(()));
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        p.pump();
        assert_eq!(cfm.load(Ordering::Relaxed), 1);
        assert_eq!(*got.lock(), vec![Some(vec![7]), Some(vec![8])]);

        // Removing one of two subscriptions keeps the descriptor
        p.clt.unsubscribe(p.cc, id2, |_, _, _| {}).unwrap();
        assert!(p.clt.sent().is_empty());
        p.clt.unsubscribe(p.cc, id, |_, _, _| {}).unwrap();
        p.pump();
        assert!(!p.srv.is_subscribed(p.sc, val, Cccd::NOTIFY));
        assert_eq!(got.lock().last(), Some(&None));
        assert_eq!(p.clt.unsubscribe(p.cc, id, |_, _, _| {}), Err(Error::NotFound));
    }

    #[test]
    fn resubscribe_bonded() {
        let mut h = TestHost::new();
        let conn = h.connect(true);
        let peer = h.peer(conn).unwrap();
        let removed = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&removed);
        let sub = Subscribe::new(hdl(0x10), hdl(0x11), Cccd::NOTIFY);
        h.subscribe(
            conn,
            sub,
            move |_, _, v| {
                if v.is_none() {
                    r.fetch_add(1, Ordering::Relaxed);
                }
                Iter::Continue
            },
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!(h.sent(), vec![vec![0x12, 0x11, 0x00, 0x01, 0x00]]);
        h.recv_att(conn, &[0x13]);

        h.disconnected(conn);
        assert_eq!(removed.load(Ordering::Relaxed), 0);
        let conn = h.connected(peer).unwrap();
        assert_eq!(h.sent(), vec![vec![0x12, 0x11, 0x00, 0x01, 0x00]]);
        h.recv_att(conn, &[0x13]);
        h.recv_att(conn, &[0x1B, 0x10, 0x00, 0x42]);

        // Subscriptions waiting for security are written after encryption
        let mut sub = Subscribe::new(hdl(0x20), hdl(0x21), Cccd::INDICATE);
        sub.min_sec = SecLevel::Encrypted;
        h.subscribe(conn, sub, |_, _, _| Iter::Continue, |_, _, _| {}).unwrap();
        assert!(h.sent().is_empty());
        assert_eq!(h.transport().raised, vec![(conn, SecLevel::Encrypted)]);
        h.transport_mut().sec.level = SecLevel::Encrypted;
        h.encryption_changed(conn, true);
        assert_eq!(h.sent(), vec![vec![0x12, 0x21, 0x00, 0x02, 0x00]]);

        h.forget_subscriptions(peer);
        assert_eq!(removed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unbonded_removed() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let res = Arc::new(Mutex::new(None));
        let r = Arc::clone(&res);
        let sub = Subscribe::new(hdl(0x10), hdl(0x11), Cccd::NOTIFY);
        h.subscribe(conn, sub, |_, _, _| Iter::Continue, move |_, _, v| *r.lock() = Some(v)).unwrap();
        h.disconnected(conn);
        assert_eq!(res.lock().take(), Some(Err(Error::ConnectionReset)));
        assert!(h.clt.subs.is_empty());
    }
}

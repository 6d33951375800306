use structbuf::Packer;
use tracing::{debug, trace, warn};

use crate::gatt::{Builtin, Db, IoResult, ReadReq, Val, WriteFlags, WriteReq};
use crate::host::{ChanId, ConnId, Host, Transport};

use super::*;

/// Server response result. Commands produce no response.
type Rsp<T> = RspResult<Option<Buf<T>>>;

/// Queued `ATT_PREPARE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.1).
#[derive(Debug)]
pub(crate) struct Prepared {
    hdl: Handle,
    off: u16,
    val: Box<[u8]>,
}

/// Attribute Protocol server ([Vol 3] Part F, Section 3.4).
impl<T: Transport> Host<T> {
    /// Handles a PDU received on an ATT channel.
    pub fn recv(&mut self, ch: ChanId, raw: &[u8]) {
        let Some(mtu) = self.chan_mtu(ch) else {
            warn!("{ch} received PDU on unknown channel");
            return;
        };
        let pdu = match Pdu::new(raw) {
            Ok(pdu) => pdu.with_mtu(mtu),
            Err(err) => {
                let op = raw.first().copied().unwrap_or_default();
                let known = Opcode::try_from(op).ok();
                warn!("{ch} invalid PDU {op:#04X} ({err})");
                // Only requests and unknown non-command opcodes get a response
                let respond = match known {
                    Some(op) => op.typ() == PduType::Req,
                    None => op != 0 && !Opcode::is_cmd(op),
                };
                if respond {
                    self.send_rsp(ch, mtu, Err(ErrorRsp::new(op, None, err)));
                }
                return;
            }
        };
        let op = pdu.opcode();
        trace!("{ch} received {op}");
        match op.typ() {
            PduType::Rsp | PduType::Cfm => self.recv_rsp(ch, pdu),
            PduType::Ntf | PduType::Ind => self.client_notify(ch, pdu),
            PduType::Req | PduType::Cmd => {
                let r = self.handle_req(ch, mtu, pdu);
                self.send_rsp(ch, mtu, r);
            }
        }
    }

    /// Returns the transmit MTU of a channel.
    fn chan_mtu(&self, ch: ChanId) -> Option<u16> {
        (self.conn(ch.conn)).and_then(|cn| cn.br.chan(ch.cid)).map(|c| c.tx_mtu)
    }

    /// Handles a request or command.
    fn handle_req(&mut self, ch: ChanId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        use Opcode::*;
        let c = ch.conn;
        match pdu.opcode() {
            ExchangeMtuReq => self.handle_exchange_mtu_req(ch, mtu, pdu),
            FindInformationReq => self.handle_find_information_req(mtu, pdu),
            FindByTypeValueReq => self.handle_find_by_type_value_req(c, mtu, pdu),
            ReadByTypeReq => self.handle_read_by_type_req(c, mtu, pdu),
            ReadReq | ReadBlobReq => self.handle_read_req(c, mtu, pdu),
            ReadMultipleReq | ReadMultipleVariableReq => self.handle_read_multiple_req(c, mtu, pdu),
            ReadByGroupTypeReq => self.handle_read_by_group_type_req(c, mtu, pdu),
            WriteReq | WriteCmd | SignedWriteCmd => self.handle_write_req(c, mtu, pdu),
            PrepareWriteReq => self.handle_prepare_write_req(c, mtu, pdu),
            ExecuteWriteReq => self.handle_execute_write_req(c, mtu, pdu),
            op => op.err(ErrorCode::RequestNotSupported),
        }
    }

    /// Sends a response or an `ATT_ERROR_RSP` ([Vol 3] Part F,
    /// Section 3.4.1.1). Command errors are only logged.
    fn send_rsp(&mut self, ch: ChanId, mtu: u16, r: Rsp<T>) {
        let b = match r {
            Ok(None) => return,
            Ok(Some(b)) => b,
            Err(e) => {
                debug!("{ch} {e}");
                if Opcode::is_cmd(e.req()) {
                    return;
                }
                Buf::new(Opcode::ErrorRsp, mtu, |p| {
                    p.u8(e.req()).u16(e.hdl().map_or(0, u16::from)).u8(e.code());
                })
            }
        };
        if let Err(e) = self.submit_buf(ch.conn, Some(ch.cid), b) {
            warn!("{ch} failed to queue response: {e}");
        }
    }

    /// Handles `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1).
    fn handle_exchange_mtu_req(&mut self, ch: ChanId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let srv_mtu = self.cfg.rx_mtu();
        let Some(c) = self.conn_mut(ch.conn).and_then(|cn| cn.br.chan_mut(ch.cid)) else {
            return op.err(ErrorCode::UnlikelyError);
        };
        // MTU of enhanced channels is negotiated by L2CAP
        if c.enhanced {
            return op.err(ErrorCode::RequestNotSupported);
        }
        let clt_mtu = pdu.mtu().max(DEFAULT_MTU);
        let rsp = rsp(mtu, Opcode::ExchangeMtuRsp, |p| {
            p.u16(srv_mtu);
        });
        let min = clt_mtu.min(srv_mtu);
        if min > c.tx_mtu {
            debug!("{ch} ATT_MTU={min}");
            c.set_mtu(min, min);
            self.mtu_updated(ch.conn);
        }
        rsp
    }

    /// Handles `ATT_FIND_INFORMATION_REQ` ([Vol 3] Part F, Section 3.4.3.1).
    fn handle_find_information_req(&mut self, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let mut p = pdu.unpack();
        let r = handle_range(op, p.u16(), p.u16())?;
        let mut it = self.db.iter(r).map(|(h, at)| (h, at.uuid())).peekable();
        let Some(&(_, first)) = it.peek() else {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        };
        let short = first.as_u16().is_some();
        rsp(mtu, Opcode::FindInformationRsp, |p| {
            p.u8(if short { 0x01 } else { 0x02 });
            if short {
                for (h, u) in (it.take(p.remaining() / (2 + 2))).map_while(|(h, u)| u.as_u16().map(|u| (h, u))) {
                    p.u16(h).u16(u);
                }
            } else {
                for (h, u) in (it.take(p.remaining() / (2 + 16))).take_while(|(_, u)| u.as_u16().is_none()) {
                    p.u16(h).put(&u.to_bytes());
                }
            }
        })
    }

    /// Handles `ATT_FIND_BY_TYPE_VALUE_REQ` ([Vol 3] Part F, Section 3.4.3.3).
    fn handle_find_by_type_value_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let mut p = pdu.unpack();
        let r = handle_range(op, p.u16(), p.u16())?;
        let Ok(typ) = Uuid::try_from(p.u16()) else {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        };
        let want = &pdu.params()[6..];
        let cand: Vec<Handle> = self.db.find(r, Some(typ), None).map(|(h, _)| h).collect();
        let max = (usize::from(mtu) - 1) / 4;
        let mut found = Vec::new();
        for h in cand {
            if found.len() == max {
                break;
            }
            // Values are compared without a permission check
            let v = self.read_value(conn, h, 0, MAX_VAL_LEN);
            if v.is_ok_and(|v| v == want) {
                found.push((h, self.db.group_end(h)));
            }
        }
        if found.is_empty() {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        }
        rsp(mtu, Opcode::FindByTypeValueRsp, |p| {
            for (h, end) in found {
                p.u16(h).u16(end);
            }
        })
    }

    /// Handles `ATT_READ_BY_TYPE_REQ` ([Vol 3] Part F, Section 3.4.4.1).
    fn handle_read_by_type_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let mut p = pdu.unpack();
        let r = handle_range(op, p.u16(), p.u16())?;
        let typ = uuid(op, &pdu.params()[4..])?;
        if !Self::is_hash_type(typ) {
            self.gate(conn, op, r.start())?;
        }
        let cand: Vec<Handle> = self.db.find(r, Some(typ), None).map(|(h, _)| h).collect();
        let room = usize::from(mtu) - 2;
        let lim = (room - 2).min(usize::from(u8::MAX) - 2);
        let mut out: Vec<(Handle, Vec<u8>)> = Vec::new();
        for h in cand {
            let v = match self.read_attr(conn, h, 0, lim) {
                Ok(v) => v,
                Err(e) if out.is_empty() => return op.hdl_err(e, h),
                Err(_) => break,
            };
            if let Some((_, first)) = out.first() {
                if v.len() != first.len() || (out.len() + 1) * (2 + v.len()) > room {
                    break;
                }
            }
            out.push((h, v));
        }
        let Some(n) = out.first().map(|(_, v)| v.len()) else {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        };
        rsp(mtu, Opcode::ReadByTypeRsp, |p| {
            #[allow(clippy::cast_possible_truncation)]
            p.u8(2 + n as u8);
            for (h, v) in out {
                p.u16(h).put(&v);
            }
        })
    }

    /// Handles `ATT_READ_REQ` and `ATT_READ_BLOB_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.3 and 3.4.4.5).
    fn handle_read_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let mut p = pdu.unpack();
        let hdl = handle(op, p.u16())?;
        let off = if op == Opcode::ReadBlobReq { p.u16() } else { 0 };
        let is_hash = (self.db.attr(hdl)).is_some_and(|at| matches!(at.val, Val::Builtin(Builtin::DbHash)));
        if !is_hash {
            self.gate(conn, op, hdl)?;
        }
        let v = (self.read_attr(conn, hdl, off, usize::from(mtu) - 1)).or_else(|e| op.hdl_err(e, hdl))?;
        let rsp_op = op.rsp().unwrap_or(Opcode::ReadRsp);
        rsp(mtu, rsp_op, |p| {
            p.put(&v);
        })
    }

    /// Handles `ATT_READ_MULTIPLE_REQ` and `ATT_READ_MULTIPLE_VARIABLE_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.7 and 3.4.4.11).
    fn handle_read_multiple_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let v = pdu.params();
        if v.len() % 2 != 0 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let hdls: Vec<u16> = v.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        self.gate(conn, op, Handle::new(hdls[0]).unwrap_or(Handle::MIN))?;
        let var = op == Opcode::ReadMultipleVariableReq;
        let room = usize::from(mtu) - 1;
        let mut out = Vec::with_capacity(room);
        let hdr = if var { 2 } else { 0 };
        for h in hdls {
            let hdl = handle(op, h)?;
            if var && out.len() + hdr > room {
                break;
            }
            let lim = room.saturating_sub(out.len() + hdr);
            let val = self.read_attr(conn, hdl, 0, lim).or_else(|e| op.hdl_err(e, hdl))?;
            if var {
                // Length of a truncated value is the number of bytes included
                #[allow(clippy::cast_possible_truncation)]
                out.extend_from_slice(&(val.len() as u16).to_le_bytes());
            }
            out.extend_from_slice(&val);
        }
        rsp(mtu, op.rsp().unwrap_or(Opcode::ReadMultipleRsp), |p| {
            p.put(&out);
        })
    }

    /// Handles `ATT_READ_BY_GROUP_TYPE_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.9).
    fn handle_read_by_group_type_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let mut p = pdu.unpack();
        let r = handle_range(op, p.u16(), p.u16())?;
        let typ = uuid(op, &pdu.params()[4..])?;
        if !Db::is_group_type(typ) {
            return op.hdl_err(ErrorCode::UnsupportedGroupType, r.start());
        }
        let cand: Vec<Handle> = self.db.find(r, Some(typ), None).map(|(h, _)| h).collect();
        let room = usize::from(mtu) - 2;
        let lim = (room - 4).min(usize::from(u8::MAX) - 4);
        let mut out: Vec<(Handle, Handle, Vec<u8>)> = Vec::new();
        for h in cand {
            let v = match self.read_attr(conn, h, 0, lim) {
                Ok(v) => v,
                Err(e) if out.is_empty() => return op.hdl_err(e, h),
                Err(_) => break,
            };
            if let Some((_, _, first)) = out.first() {
                if v.len() != first.len() || (out.len() + 1) * (4 + v.len()) > room {
                    break;
                }
            }
            out.push((h, self.db.group_end(h), v));
        }
        let Some(n) = out.first().map(|(_, _, v)| v.len()) else {
            return op.hdl_err(ErrorCode::AttributeNotFound, r.start());
        };
        rsp(mtu, Opcode::ReadByGroupTypeRsp, |p| {
            #[allow(clippy::cast_possible_truncation)]
            p.u8(4 + n as u8);
            for (h, end, v) in out {
                p.u16(h).u16(end).put(&v);
            }
        })
    }

    /// Handles `ATT_WRITE_REQ`, `ATT_WRITE_CMD`, and `ATT_SIGNED_WRITE_CMD`
    /// ([Vol 3] Part F, Section 3.4.5).
    fn handle_write_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let hdl = handle(op, pdu.unpack().u16())?;
        let mut val = &pdu.params()[2..];
        let mut flags = WriteFlags::empty();
        if op != Opcode::WriteReq {
            flags = WriteFlags::CMD;
        }
        if op.is_signed() {
            if !self.tr.verify_signature(conn, pdu.as_ref()) {
                warn!("{conn} signature verification failed");
                return Ok(None);
            }
            val = &val[..val.len() - SIGNATURE_LEN];
        }
        self.gate(conn, op, hdl)?;
        self.check_props(op, hdl).or_else(|e| op.hdl_err(e, hdl))?;
        (self.write_attr(conn, hdl, 0, val, flags)).or_else(|e| op.hdl_err(e, hdl))?;
        if op != Opcode::WriteReq {
            return Ok(None);
        }
        rsp(mtu, Opcode::WriteRsp, |_| {})
    }

    /// Handles `ATT_PREPARE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.1).
    fn handle_prepare_write_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let mut p = pdu.unpack();
        let (hdl, off) = (handle(op, p.u16())?, p.u16());
        let val = &pdu.params()[4..];
        self.gate(conn, op, hdl)?;
        self.check_props(op, hdl).or_else(|e| op.hdl_err(e, hdl))?;
        // Authorization is checked before the value is queued
        (self.write_attr(conn, hdl, off, &[], WriteFlags::PREPARE)).or_else(|e| op.hdl_err(e, hdl))?;
        let max = self.cfg.prepare_count;
        let Some(cn) = self.conn_mut(conn) else {
            return op.err(ErrorCode::UnlikelyError);
        };
        if cn.prep.len() >= max {
            return op.hdl_err(ErrorCode::PrepareQueueFull, hdl);
        }
        cn.prep.push(Prepared {
            hdl,
            off,
            val: val.into(),
        });
        rsp(mtu, Opcode::PrepareWriteRsp, |p| {
            p.put(pdu.params());
        })
    }

    /// Handles `ATT_EXECUTE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.3).
    /// Consecutive prepared writes to the same handle are combined into one
    /// write. The queue is discarded on the first error.
    fn handle_execute_write_req(&mut self, conn: ConnId, mtu: u16, pdu: Pdu) -> Rsp<T> {
        let op = pdu.opcode();
        let flags = pdu.unpack().u8();
        if flags > 0x01 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let Some(cn) = self.conn_mut(conn) else {
            return op.err(ErrorCode::UnlikelyError);
        };
        let prep = std::mem::take(&mut cn.prep);
        if flags == 0x00 {
            trace!("{conn} cancelled {} prepared write(s)", prep.len());
            return rsp(mtu, Opcode::ExecuteWriteRsp, |_| {});
        }
        let mut it = prep.into_iter().peekable();
        while let Some(first) = it.next() {
            let (hdl, base) = (first.hdl, first.off);
            let mut val = Vec::from(first.val);
            while let Some(next) = it.next_if(|p| p.hdl == hdl) {
                if usize::from(next.off) != usize::from(base) + val.len() {
                    return op.hdl_err(ErrorCode::InvalidOffset, hdl);
                }
                val.extend_from_slice(&next.val);
            }
            if usize::from(base) + val.len() > MAX_VAL_LEN {
                return op.hdl_err(ErrorCode::InvalidAttributeValueLength, hdl);
            }
            (self.write_value(conn, hdl, base, &val, WriteFlags::EXECUTE)).or_else(|e| op.hdl_err(e, hdl))?;
        }
        rsp(mtu, Opcode::ExecuteWriteRsp, |_| {})
    }

    /// Applies the change-aware gate.
    fn gate(&mut self, conn: ConnId, op: Opcode, hdl: Handle) -> RspResult<()> {
        if self.change_aware(conn, op.typ() == PduType::Req) {
            Ok(())
        } else {
            op.hdl_err(ErrorCode::DatabaseOutOfSync, hdl)
        }
    }

    /// Checks characteristic properties required by write commands and
    /// prepared writes ([Vol 3] Part G, Section 3.3.1.1).
    fn check_props(&self, op: Opcode, hdl: Handle) -> IoResult<()> {
        use crate::gatt::{ExtProp, Prop};
        let Some((decl, props, _)) = self.db.char_of(hdl) else { return Ok(()) };
        if decl.next() != Some(hdl) {
            return Ok(());
        }
        let ok = match op {
            Opcode::WriteCmd => props.contains(Prop::WRITE_WITHOUT_RESPONSE),
            Opcode::SignedWriteCmd => props.contains(Prop::AUTHENTICATED_SIGNED_WRITES),
            Opcode::PrepareWriteReq => {
                props.contains(Prop::WRITE) || self.db.ext_props(hdl).contains(ExtProp::RELIABLE_WRITE)
            }
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ErrorCode::WriteNotPermitted)
        }
    }

    /// Reads an attribute after checking read permissions.
    fn read_attr(&mut self, conn: ConnId, hdl: Handle, off: u16, lim: usize) -> IoResult<Vec<u8>> {
        let sec = self.tr.security(conn);
        let at = self.db.attr(hdl).ok_or(ErrorCode::InvalidHandle)?;
        at.perms().test(Access::request(Access::READ, sec))?;
        self.read_value(conn, hdl, off, lim)
    }

    /// Reads an attribute value without a permission check.
    fn read_value(&mut self, conn: ConnId, hdl: Handle, off: u16, lim: usize) -> IoResult<Vec<u8>> {
        let peer = self.peer(conn).ok_or(ErrorCode::UnlikelyError)?;
        let mut r = ReadReq::new(conn, peer, hdl, off, lim);
        if let Some(v) = self.db.stored_value(hdl) {
            r.complete(v)?;
            return Ok(r.value().to_vec());
        }
        let at = self.db.attr(hdl).ok_or(ErrorCode::InvalidHandle)?;
        match at.val {
            Val::Io(ref io) => {
                let io = io.clone();
                io.read(&mut r)?;
            }
            Val::Ccc(ref c) => {
                r.complete(c.get(peer).bits().to_le_bytes())?;
            }
            Val::Builtin(b) => {
                self.read_builtin(conn, b, &mut r)?;
            }
            _ => return Err(ErrorCode::UnlikelyError),
        }
        Ok(r.value().to_vec())
    }

    /// Writes an attribute after checking write permissions.
    fn write_attr(&mut self, conn: ConnId, hdl: Handle, off: u16, val: &[u8], flags: WriteFlags) -> IoResult<()> {
        let sec = self.tr.security(conn);
        let at = self.db.attr(hdl).ok_or(ErrorCode::InvalidHandle)?;
        at.perms().test(Access::request(Access::WRITE, sec))?;
        if flags.contains(WriteFlags::PREPARE) {
            // Value length is checked by the execute request
            return self.write_value(conn, hdl, off, val, flags);
        }
        if usize::from(off) + val.len() > MAX_VAL_LEN {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        self.write_value(conn, hdl, off, val, flags)
    }

    /// Writes an attribute value without a permission check.
    fn write_value(&mut self, conn: ConnId, hdl: Handle, off: u16, val: &[u8], flags: WriteFlags) -> IoResult<()> {
        let peer = self.peer(conn).ok_or(ErrorCode::UnlikelyError)?;
        let at = self.db.attr(hdl).ok_or(ErrorCode::InvalidHandle)?;
        let w = WriteReq {
            conn,
            peer,
            hdl,
            off,
            val,
            flags,
        };
        match at.val {
            Val::Io(ref io) => io.clone().write(&w),
            Val::Ccc(_) if flags.contains(WriteFlags::PREPARE) => Ok(()),
            Val::Ccc(_) => self.write_ccc(conn, hdl, off, val),
            Val::Builtin(b) => self.write_builtin(conn, b, &w),
            _ => Err(ErrorCode::WriteNotPermitted),
        }
    }
}

/// Returns a response PDU, calling `f` to encode the parameters.
#[inline]
fn rsp<T: Transport>(mtu: u16, op: Opcode, f: impl FnOnce(&mut Packer)) -> Rsp<T> {
    Ok(Some(Buf::new(op, mtu, f)))
}

/// Validates a request handle.
#[inline]
fn handle(op: Opcode, h: u16) -> RspResult<Handle> {
    Handle::new(h).map_or_else(|| op.err(ErrorCode::InvalidHandle), Ok)
}

/// Validates a request handle range ([Vol 3] Part F, Section 3.4.3.1).
#[inline]
fn handle_range(op: Opcode, start: u16, end: u16) -> RspResult<HandleRange> {
    HandleRange::validate(start, end).or_else(|h| match Handle::new(h) {
        Some(h) => op.hdl_err(ErrorCode::InvalidHandle, h),
        None => op.err(ErrorCode::InvalidHandle),
    })
}

/// Unpacks a 16- or 128-bit UUID.
#[inline]
fn uuid(op: Opcode, v: &[u8]) -> RspResult<Uuid> {
    match v.len() {
        2 | 16 => Uuid::try_from(v).or_else(|_| op.err(ErrorCode::InvalidPdu)),
        _ => op.err(ErrorCode::InvalidPdu),
    }
}

#[cfg(test)]
mod tests {
    use gattic_const::Characteristic;

    use super::*;
    use crate::gatt::{Prop, SharedValue};
    use crate::host::tests::TestHost;

    fn err(req: u8, hdl: u16, code: u8) -> Vec<u8> {
        let h = hdl.to_le_bytes();
        vec![0x01, req, h[0], h[1], code]
    }

    #[test]
    fn invalid_range() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        for req in [[0x04, 0, 0, 0xFF, 0xFF], [0x04, 0x05, 0, 0x02, 0], [0x04, 0x01, 0, 0, 0]] {
            h.recv_att(conn, &req);
            let start = u16::from_le_bytes([req[1], req[2]]);
            let end = u16::from_le_bytes([req[3], req[4]]);
            let bad = if start == 0 || end != 0 { start } else { end };
            assert_eq!(h.sent(), vec![err(0x04, bad, 0x01)]);
        }
        h.recv_att(conn, &[0x08, 0x03, 0x00, 0x01, 0x00, 0x03, 0x28]);
        assert_eq!(h.sent(), vec![err(0x08, 0x03, 0x01)]);
        h.recv_att(conn, &[0x10, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
        assert_eq!(h.sent(), vec![err(0x10, 0x00, 0x01)]);
        h.recv_att(conn, &[0x06, 0x02, 0x00, 0x01, 0x00, 0x00, 0x28, 0x01, 0x18]);
        assert_eq!(h.sent(), vec![err(0x06, 0x02, 0x01)]);
    }

    #[test]
    fn discovery() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        h.recv_att(conn, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
        assert_eq!(h.sent(), vec![vec![0x11, 0x06, 0x01, 0x00, 0x08, 0x00, 0x01, 0x18]]);
        h.recv_att(conn, &[0x10, 0x09, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
        assert_eq!(h.sent(), vec![err(0x10, 0x09, 0x0A)]);
        h.recv_att(conn, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x03, 0x28]);
        assert_eq!(h.sent(), vec![err(0x10, 0x01, 0x10)]);

        h.recv_att(conn, &[0x04, 0x01, 0x00, 0x03, 0x00]);
        let info = vec![0x05, 0x01, 0x01, 0x00, 0x00, 0x28, 0x02, 0x00, 0x03, 0x28, 0x03, 0x00, 0x05, 0x2A];
        assert_eq!(h.sent(), vec![info]);

        h.recv_att(conn, &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x01, 0x18]);
        assert_eq!(h.sent(), vec![vec![0x07, 0x01, 0x00, 0x08, 0x00]]);
        h.recv_att(conn, &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x0F, 0x18]);
        assert_eq!(h.sent(), vec![err(0x06, 0x01, 0x0A)]);

        // Characteristic declarations of the GATT service have equal lengths
        h.recv_att(conn, &[0x08, 0x01, 0x00, 0xFF, 0xFF, 0x03, 0x28]);
        let rsp = h.sent().pop().unwrap();
        assert_eq!(rsp[..2], [0x09, 7]);
        assert_eq!(rsp.len(), 2 + 3 * 7);
        assert_eq!(rsp[2..9], [0x02, 0x00, 0x20, 0x03, 0x00, 0x05, 0x2A]);
    }

    #[test]
    fn unknown_and_short() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        h.recv_att(conn, &[0x30]);
        assert_eq!(h.sent(), vec![err(0x30, 0, 0x06)]);
        h.recv_att(conn, &[0x70, 0x01]);
        assert!(h.sent().is_empty());
        h.recv_att(conn, &[0x0A, 0x01]);
        assert_eq!(h.sent(), vec![err(0x0A, 0, 0x04)]);
        h.recv_att(conn, &[0x0A, 0x00, 0x00]);
        assert_eq!(h.sent(), vec![err(0x0A, 0, 0x01)]);
        h.recv_att(conn, &[0x0A, 0x00, 0x01]);
        assert_eq!(h.sent(), vec![err(0x0A, 0x0100, 0x01)]);
    }

    fn writable() -> (TestHost, SharedValue) {
        let v = SharedValue::new([0]);
        let io = v.clone();
        let h = TestHost::with_service(move |s| {
            s.characteristic(
                Characteristic::BatteryLevel,
                Prop::READ | Prop::WRITE,
                Access::READ_WRITE,
                io,
                |_| {},
            );
        });
        (h, v)
    }

    #[test]
    fn prepare_execute() {
        let (mut h, v) = writable();
        let conn = h.connect(false);
        let hdl = h.svc_handle(2).get() as u8;
        let prep = |h: &mut TestHost, off: u8, b: u8| {
            let req = [0x16, hdl, 0x00, off, 0x00, b, b, b, b];
            h.recv_att(conn, &req);
            let mut want = req.to_vec();
            want[0] = 0x17;
            assert_eq!(h.sent(), vec![want]);
        };
        prep(&mut h, 0, 1);
        prep(&mut h, 4, 2);
        prep(&mut h, 8, 3);
        h.recv_att(conn, &[0x18, 0x01]);
        assert_eq!(h.sent(), vec![vec![0x19]]);
        assert_eq!(v.get(), [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);

        prep(&mut h, 0, 4);
        prep(&mut h, 4, 5);
        prep(&mut h, 12, 6);
        h.recv_att(conn, &[0x18, 0x01]);
        assert_eq!(h.sent(), vec![err(0x18, u16::from(hdl), 0x07)]);
        assert_eq!(v.get(), [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);

        // Queue was discarded
        h.recv_att(conn, &[0x18, 0x01]);
        assert_eq!(h.sent(), vec![vec![0x19]]);
        prep(&mut h, 0, 7);
        h.recv_att(conn, &[0x18, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x19]]);
        assert_eq!(v.get()[0], 1);
    }

    #[test]
    fn write_and_read() {
        let (mut h, v) = writable();
        let conn = h.connect(false);
        let hdl = h.svc_handle(2).get() as u8;
        h.recv_att(conn, &[0x12, hdl, 0x00, 0x0A, 0x0B]);
        assert_eq!(h.sent(), vec![vec![0x13]]);
        assert_eq!(v.get(), [0x0A, 0x0B]);

        // Write command requires the matching property
        h.recv_att(conn, &[0x52, hdl, 0x00, 0x0C]);
        assert!(h.sent().is_empty());
        assert_eq!(v.get(), [0x0A, 0x0B]);

        h.recv_att(conn, &[0x0A, hdl, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x0B, 0x0A, 0x0B]]);
        h.recv_att(conn, &[0x0C, hdl, 0x00, 0x01, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x0D, 0x0B]]);
        h.recv_att(conn, &[0x0C, hdl, 0x00, 0x03, 0x00]);
        assert_eq!(h.sent(), vec![err(0x0C, u16::from(hdl), 0x07)]);
        h.recv_att(conn, &[0x0E, hdl, 0x00, 0x01, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x0F, 0x0A, 0x0B, 0x01, 0x18]]);
        h.recv_att(conn, &[0x20, hdl, 0x00, 0x01, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x21, 0x02, 0x00, 0x0A, 0x0B, 0x02, 0x00, 0x01, 0x18]]);

        // Declarations are read-only
        h.recv_att(conn, &[0x12, 0x01, 0x00, 0x00]);
        assert_eq!(h.sent(), vec![err(0x12, 0x01, 0x03)]);
    }

    #[test]
    fn read_multiple_variable() {
        let (mut h, v) = writable();
        let conn = h.connect(false);
        let hdl = h.svc_handle(2).get() as u8;
        v.set(vec![0x55; 30]);

        // Truncated value reports the number of bytes included
        h.recv_att(conn, &[0x20, hdl, 0x00, hdl, 0x00]);
        let mut want = vec![0x21, 20, 0x00];
        want.extend([0x55; 20]);
        assert_eq!(h.sent(), vec![want]);
    }

    #[test]
    fn exchange_mtu() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        h.recv_att(conn, &[0x02, 0x00, 0x01]);
        assert_eq!(h.sent(), vec![vec![0x03, 247, 0x00]]);
        assert_eq!(h.mtu(conn), Some(247));
        h.recv_att(conn, &[0x02, 0x10, 0x00]);
        assert_eq!(h.sent(), vec![vec![0x03, 247, 0x00]]);
        assert_eq!(h.mtu(conn), Some(247));
    }
}

use gattic_const::UuidPacker;
use structbuf::Packer;

use crate::host::{ChanId, Cid, ConnId, Host, Transport};

use super::*;

/// Attribute Protocol client requests ([Vol 3] Part F, Section 3.4).
///
/// Each method queues one request and returns its identifier. Parameters are
/// re-encoded for the selected channel, so values longer than the channel MTU
/// are truncated.
impl<T: Transport> Host<T> {
    /// Sends `ATT_EXCHANGE_MTU_REQ` on the fixed channel
    /// ([Vol 3] Part F, Section 3.4.2.1).
    pub(crate) fn exchange_mtu_req(&mut self, conn: ConnId, done: Done<T>) -> Result<ReqId> {
        let mtu = self.cfg.rx_mtu();
        self.req(conn, Opcode::ExchangeMtuReq, ChanOpt::Unenhanced, done, move |p| {
            p.u16(mtu);
        })
    }

    /// Sends `ATT_FIND_INFORMATION_REQ` ([Vol 3] Part F, Section 3.4.3.1).
    pub(crate) fn find_information_req(&mut self, conn: ConnId, r: HandleRange, done: Done<T>) -> Result<ReqId> {
        self.req(conn, Opcode::FindInformationReq, ChanOpt::Any, done, move |p| {
            p.u16(r.start()).u16(r.end());
        })
    }

    /// Sends `ATT_FIND_BY_TYPE_VALUE_REQ` ([Vol 3] Part F, Section 3.4.3.3).
    pub(crate) fn find_by_type_value_req(
        &mut self,
        conn: ConnId,
        r: HandleRange,
        typ: u16,
        val: Box<[u8]>,
        done: Done<T>,
    ) -> Result<ReqId> {
        self.req(conn, Opcode::FindByTypeValueReq, ChanOpt::Any, done, move |p| {
            p.u16(r.start()).u16(r.end()).u16(typ);
            put_trunc(p, &val);
        })
    }

    /// Sends `ATT_READ_BY_TYPE_REQ` ([Vol 3] Part F, Section 3.4.4.1).
    pub(crate) fn read_by_type_req(&mut self, conn: ConnId, r: HandleRange, typ: Uuid, done: Done<T>) -> Result<ReqId> {
        self.req(conn, Opcode::ReadByTypeReq, ChanOpt::Any, done, move |p| {
            p.u16(r.start()).u16(r.end()).uuid(typ);
        })
    }

    /// Sends `ATT_READ_BY_GROUP_TYPE_REQ` ([Vol 3] Part F, Section 3.4.4.9).
    pub(crate) fn read_by_group_type_req(
        &mut self,
        conn: ConnId,
        r: HandleRange,
        typ: Uuid,
        done: Done<T>,
    ) -> Result<ReqId> {
        self.req(conn, Opcode::ReadByGroupTypeReq, ChanOpt::Any, done, move |p| {
            p.u16(r.start()).u16(r.end()).uuid(typ);
        })
    }

    /// Sends `ATT_READ_REQ` or, for a non-zero offset, `ATT_READ_BLOB_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.3 and 3.4.4.5).
    pub(crate) fn read_req(&mut self, conn: ConnId, hdl: Handle, off: u16, done: Done<T>) -> Result<ReqId> {
        if off == 0 {
            return self.req(conn, Opcode::ReadReq, ChanOpt::Any, done, move |p| {
                p.u16(hdl);
            });
        }
        self.req(conn, Opcode::ReadBlobReq, ChanOpt::Any, done, move |p| {
            p.u16(hdl).u16(off);
        })
    }

    /// Sends `ATT_READ_MULTIPLE_REQ` or `ATT_READ_MULTIPLE_VARIABLE_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.7 and 3.4.4.11).
    pub(crate) fn read_multiple_req(
        &mut self,
        conn: ConnId,
        hdls: &[Handle],
        variable: bool,
        done: Done<T>,
    ) -> Result<ReqId> {
        if hdls.len() < 2 {
            return Err(Error::InvalidParam);
        }
        let op = if variable {
            Opcode::ReadMultipleVariableReq
        } else {
            Opcode::ReadMultipleReq
        };
        let hdls: Box<[Handle]> = hdls.into();
        self.req(conn, op, ChanOpt::Any, done, move |p| {
            for &h in hdls.iter().take(p.remaining() / 2) {
                p.u16(h);
            }
        })
    }

    /// Sends `ATT_WRITE_REQ` ([Vol 3] Part F, Section 3.4.5.1).
    pub(crate) fn write_req(&mut self, conn: ConnId, hdl: Handle, val: Box<[u8]>, done: Done<T>) -> Result<ReqId> {
        self.req(conn, Opcode::WriteReq, ChanOpt::Any, done, move |p| {
            p.u16(hdl);
            put_trunc(p, &val);
        })
    }

    /// Sends `ATT_PREPARE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.1).
    pub(crate) fn prepare_write_req(
        &mut self,
        conn: ConnId,
        hdl: Handle,
        off: u16,
        val: Box<[u8]>,
        done: Done<T>,
    ) -> Result<ReqId> {
        self.req(conn, Opcode::PrepareWriteReq, ChanOpt::Any, done, move |p| {
            p.u16(hdl).u16(off);
            put_trunc(p, &val);
        })
    }

    /// Sends `ATT_EXECUTE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.3).
    pub(crate) fn execute_write_req(&mut self, conn: ConnId, commit: bool, done: Done<T>) -> Result<ReqId> {
        self.req(conn, Opcode::ExecuteWriteReq, ChanOpt::Any, done, move |p| {
            p.u8(u8::from(commit));
        })
    }

    /// Sends `ATT_WRITE_CMD` or `ATT_SIGNED_WRITE_CMD`
    /// ([Vol 3] Part F, Section 3.4.5.3 and 3.4.5.4). The value must fit
    /// within the smallest channel MTU.
    pub(crate) fn write_cmd(&mut self, conn: ConnId, hdl: Handle, val: &[u8], signed: bool) -> Result<()> {
        let mtu = self.conn(conn).ok_or(Error::NotConnected)?.br.min_mtu();
        let (op, sig) = if signed {
            (Opcode::SignedWriteCmd, SIGNATURE_LEN)
        } else {
            (Opcode::WriteCmd, 0)
        };
        if 3 + val.len() + sig > usize::from(mtu) {
            return Err(Error::InvalidParam);
        }
        let mut b = Buf::new(op, mtu, |p| {
            p.u16(hdl).put(val);
        });
        if signed && !self.tr.sign(conn, &mut b.pdu) {
            return Err(Error::Authentication);
        }
        // Signed commands are only sent on the fixed channel
        // ([Vol 3] Part F, Section 3.4.5.4).
        let cid = signed.then_some(Cid::ATT);
        self.submit_buf(conn, cid, b)
    }

    /// Sends `ATT_HANDLE_VALUE_CFM` on the channel that received the
    /// indication ([Vol 3] Part F, Section 3.4.7.3).
    pub(crate) fn confirm(&mut self, ch: ChanId) -> Result<()> {
        let b = Buf::new(Opcode::HandleValueCfm, DEFAULT_MTU, |_| {});
        self.submit_buf(ch.conn, Some(ch.cid), b)
    }

    /// Queues a request with re-encodable parameters.
    #[inline]
    fn req(
        &mut self,
        conn: ConnId,
        op: Opcode,
        opt: ChanOpt,
        done: Done<T>,
        f: impl Fn(&mut Packer) + Send + 'static,
    ) -> Result<ReqId> {
        self.submit_req(conn, op, opt, Body::Fn(Box::new(f)), done)
    }
}

/// Writes as much of `v` as fits in the remaining PDU space.
#[inline]
fn put_trunc(p: &mut Packer, v: &[u8]) {
    let n = v.len().min(p.remaining());
    p.put(&v[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::TestHost;

    #[test]
    fn encode() {
        let mut h = TestHost::new();
        let conn = h.connect(false);
        let hdl = Handle::new(0x0102).unwrap();
        h.write_req(conn, hdl, vec![0xAA; 30].into(), done(|_, _, _| {})).unwrap();
        let sent = h.sent();
        assert_eq!(sent[0].len(), 23);
        assert_eq!(sent[0][..4], [0x12, 0x02, 0x01, 0xAA]);
        h.recv_att(conn, &[0x13]);

        let r = HandleRange::new(Handle::MIN, Handle::MAX);
        let u = Uuid::try_from(0x2800_u16).unwrap();
        h.read_by_group_type_req(conn, r, u, done(|_, _, _| {})).unwrap();
        assert_eq!(h.sent(), vec![vec![0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]]);
        h.recv_att(conn, &[0x01, 0x10, 0x01, 0x00, 0x0A]);

        assert_eq!(h.read_multiple_req(conn, &[hdl], false, done(|_, _, _| {})), Err(Error::InvalidParam));
        h.write_cmd(conn, hdl, &[1, 2], false).unwrap();
        assert_eq!(h.sent(), vec![vec![0x52, 0x02, 0x01, 1, 2]]);
        assert_eq!(h.write_cmd(conn, hdl, &[1, 2], true), Err(Error::Authentication));
        assert_eq!(h.write_cmd(conn, hdl, &[0; 21], false), Err(Error::InvalidParam));
    }
}

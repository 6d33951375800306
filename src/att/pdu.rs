use structbuf::{Unpack, Unpacker};

use super::*;

/// Received ATT protocol data unit ([Vol 3] Part F, Section 3.3). The PDU
/// always contains at least the minimum number of bytes required by its
/// opcode.
#[derive(Clone, Copy, Debug)]
pub struct Pdu<'a> {
    op: Opcode,
    raw: &'a [u8],
    mtu: u16,
}

impl<'a> Pdu<'a> {
    /// Wraps a received PDU, checking the minimum length.
    #[inline]
    pub(crate) fn new(raw: &'a [u8]) -> std::result::Result<Self, ErrorCode> {
        let Some(&op) = raw.first() else {
            return Err(ErrorCode::InvalidPdu);
        };
        let op = Opcode::try_from(op).map_err(|_| ErrorCode::RequestNotSupported)?;
        if raw.len() < op.min_len() {
            return Err(ErrorCode::InvalidPdu);
        }
        Ok(Self {
            op,
            raw,
            mtu: DEFAULT_MTU,
        })
    }

    /// Sets the MTU of the channel that carried the PDU.
    #[inline(always)]
    #[must_use]
    pub(crate) const fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Returns the PDU opcode.
    #[inline(always)]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.op
    }

    /// Returns the MTU of the channel that carried the PDU.
    #[inline(always)]
    #[must_use]
    pub const fn chan_mtu(&self) -> u16 {
        self.mtu
    }

    /// Returns PDU parameters following the opcode.
    #[inline(always)]
    #[must_use]
    pub fn params(&self) -> &'a [u8] {
        &self.raw[1..]
    }

    /// Returns an unpacker over the PDU parameters.
    #[inline(always)]
    #[must_use]
    pub fn unpack(&self) -> Unpacker<'a> {
        Unpacker::new(self.params())
    }

    /// Returns the error response parameters
    /// ([Vol 3] Part F, Section 3.4.1.1).
    #[must_use]
    pub fn error_rsp(&self) -> ErrorRsp {
        debug_assert_eq!(self.op, Opcode::ErrorRsp);
        let mut p = self.unpack();
        let (req, hdl) = (p.u8(), Handle::new(p.u16()));
        let err = ErrorCode::try_from(p.u8()).unwrap_or(ErrorCode::UnlikelyError);
        ErrorRsp::new(req, hdl, err)
    }

    /// Returns the server MTU from `ATT_EXCHANGE_MTU_RSP`
    /// ([Vol 3] Part F, Section 3.4.2.2).
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.unpack().u16()
    }

    /// Returns the entries of `ATT_FIND_INFORMATION_RSP`
    /// ([Vol 3] Part F, Section 3.4.3.2) or [`None`] if the PDU is malformed.
    pub fn find_information_rsp(&self) -> Option<impl Iterator<Item = (u16, Option<Uuid>)> + 'a> {
        let p = self.params();
        let n = match p[0] {
            0x01 => 2 + 2,
            0x02 => 2 + 16,
            _ => return None,
        };
        let v = &p[1..];
        (!v.is_empty() && v.len() % n == 0).then(|| {
            v.chunks_exact(n).map(|c| {
                let (h, u) = c.split_at(2);
                (h.unpack().u16(), Uuid::try_from(u).ok())
            })
        })
    }

    /// Returns the handle ranges of `ATT_FIND_BY_TYPE_VALUE_RSP`
    /// ([Vol 3] Part F, Section 3.4.3.4).
    pub fn find_by_type_value_rsp(&self) -> Option<impl Iterator<Item = (u16, u16)> + 'a> {
        let v = self.params();
        (!v.is_empty() && v.len() % 4 == 0).then(|| {
            v.chunks_exact(4).map(|c| {
                let mut p = c.unpack();
                (p.u16(), p.u16())
            })
        })
    }

    /// Returns the `(handle, value)` entries of `ATT_READ_BY_TYPE_RSP`
    /// ([Vol 3] Part F, Section 3.4.4.2).
    pub fn read_by_type_rsp(&self) -> Option<impl Iterator<Item = (u16, &'a [u8])> + 'a> {
        self.entries(2).map(|it| {
            it.map(|c| {
                let (h, v) = c.split_at(2);
                (h.unpack().u16(), v)
            })
        })
    }

    /// Returns the `(start, end, value)` entries of
    /// `ATT_READ_BY_GROUP_TYPE_RSP` ([Vol 3] Part F, Section 3.4.4.10).
    pub fn read_by_group_type_rsp(
        &self,
    ) -> Option<impl Iterator<Item = (u16, u16, &'a [u8])> + 'a> {
        self.entries(4).map(|it| {
            it.map(|c| {
                let (h, v) = c.split_at(4);
                let mut p = h.unpack();
                (p.u16(), p.u16(), v)
            })
        })
    }

    /// Returns the `(handle, value)` tuples of `ATT_READ_MULTIPLE_VARIABLE_RSP`
    /// ([Vol 3] Part F, Section 3.4.4.12) or `ATT_MULTIPLE_HANDLE_VALUE_NTF`
    /// ([Vol 3] Part F, Section 3.4.7.4) when `with_hdl` is set. The last
    /// value may be truncated.
    pub fn length_value_list(&self, with_hdl: bool) -> LengthValueIter<'a> {
        LengthValueIter {
            v: self.params(),
            with_hdl,
        }
    }

    /// Returns fixed-length entries prefixed by a length octet, each at least
    /// `min` bytes long.
    fn entries(&self, min: usize) -> Option<std::slice::ChunksExact<'a, u8>> {
        let p = self.params();
        let n = usize::from(p[0]);
        let v = &p[1..];
        (n >= min && !v.is_empty() && v.len() % n == 0).then(|| v.chunks_exact(n))
    }
}

impl AsRef<[u8]> for Pdu<'_> {
    /// Returns PDU bytes.
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.raw
    }
}

/// Iterator over length-prefixed values.
#[derive(Debug)]
pub struct LengthValueIter<'a> {
    v: &'a [u8],
    with_hdl: bool,
}

impl<'a> Iterator for LengthValueIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let hdr = if self.with_hdl { 4 } else { 2 };
        if self.v.len() < hdr {
            return None;
        }
        let (h, rest) = self.v.split_at(hdr);
        let mut p = h.unpack();
        let hdl = if self.with_hdl { p.u16() } else { 0 };
        let n = usize::from(p.u16()).min(rest.len());
        let (v, rest) = rest.split_at(n);
        self.v = rest;
        Some((hdl, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_len() {
        assert_eq!(Pdu::new(&[]).unwrap_err(), ErrorCode::InvalidPdu);
        assert_eq!(Pdu::new(&[0xFF]).unwrap_err(), ErrorCode::RequestNotSupported);
        assert_eq!(Pdu::new(&[0x0A, 0x01]).unwrap_err(), ErrorCode::InvalidPdu);
        assert_eq!(Pdu::new(&[0x0A, 0x01, 0x00]).unwrap().opcode(), Opcode::ReadReq);
    }

    #[test]
    fn error_rsp() {
        let pdu = Pdu::new(&[0x01, 0x0A, 0x03, 0x00, 0x05]).unwrap();
        let e = pdu.error_rsp();
        assert_eq!(e.req(), 0x0A);
        assert_eq!(e.hdl(), Handle::new(3));
        assert_eq!(e.code(), ErrorCode::InsufficientAuthentication);
    }

    #[test]
    fn entries() {
        let pdu = Pdu::new(&[0x09, 0x04, 0x01, 0x00, 0xAA, 0xBB, 0x02, 0x00, 0xCC, 0xDD]).unwrap();
        let v: Vec<_> = pdu.read_by_type_rsp().unwrap().collect();
        assert_eq!(v, [(1, &[0xAA, 0xBB][..]), (2, &[0xCC, 0xDD][..])]);
        let bad = Pdu::new(&[0x09, 0x04, 0x01, 0x00, 0xAA]).unwrap();
        assert!(bad.read_by_type_rsp().is_none());

        let pdu = Pdu::new(&[0x23, 0x01, 0x00, 0x01, 0x00, 0xAA, 0x02, 0x00, 0x02, 0x00, 0xBB]).unwrap();
        let v: Vec<_> = pdu.length_value_list(true).collect();
        assert_eq!(v, [(1, &[0xAA][..]), (2, &[0xBB][..])]);
    }
}

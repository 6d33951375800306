use std::fmt::{Debug, Formatter};

use structbuf::{Pack, Packer, StructBuf};

use crate::host::{ConnId, Host, Transport};
use crate::util::SlabKey;

use super::*;

/// Outstanding request identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct ReqId(pub(crate) SlabKey);

/// Channel routing preference of a request or buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ChanOpt {
    /// Any channel.
    #[default]
    Any,
    /// Enhanced channels only.
    Enhanced,
    /// The fixed (unenhanced) channel only.
    Unenhanced,
}

impl ChanOpt {
    /// Returns whether a channel with the specified type is acceptable.
    #[inline]
    #[must_use]
    pub const fn allows(self, enhanced: bool) -> bool {
        match self {
            Self::Any => true,
            Self::Enhanced => enhanced,
            Self::Unenhanced => !enhanced,
        }
    }
}

/// Request completion continuation. Receives the response or confirmation
/// PDU, or an error.
pub type Done<T> = Box<dyn for<'a> FnOnce(&mut Host<T>, ConnId, Result<Pdu<'a>>) + Send>;

/// Buffer transmission continuation.
pub(crate) type SendDone<T> = Box<dyn FnOnce(&mut Host<T>, ConnId, Result<()>) + Send>;

/// Boxes a request completion continuation.
#[inline(always)]
pub(crate) fn done<T, F>(f: F) -> Done<T>
where
    T: Transport,
    F: for<'a> FnOnce(&mut Host<T>, ConnId, Result<Pdu<'a>>) + Send + 'static,
{
    Box::new(f)
}

/// Boxes a buffer transmission continuation.
#[inline(always)]
pub(crate) fn send_done<T, F>(f: F) -> SendDone<T>
where
    T: Transport,
    F: FnOnce(&mut Host<T>, ConnId, Result<()>) + Send + 'static,
{
    Box::new(f)
}

/// Request parameter encoder. Called with a packer positioned after the
/// opcode and limited to the MTU of the selected channel. Encoders are called
/// again if the request is resent after a security upgrade.
pub type Encode = Box<dyn Fn(&mut Packer) + Send>;

/// Request parameters.
pub(crate) enum Body {
    /// Re-encodable parameters.
    Fn(Encode),
    /// Pre-encoded parameters that cannot be resent.
    Raw(Box<[u8]>),
}

/// Client-initiated transaction ([Vol 3] Part F, Section 3.3.2).
pub(crate) struct Request<T: Transport> {
    pub op: Opcode,
    pub opt: ChanOpt,
    pub body: Body,
    pub done: Option<Done<T>>,
    /// Error response that parked the request until a security upgrade.
    pub parked: Option<ErrorRsp>,
    /// The request was already resent after a security upgrade.
    pub retried: bool,
}

impl<T: Transport> Request<T> {
    /// Returns whether the request can be sent on a channel with the specified
    /// type and MTU.
    #[inline]
    pub fn fits(&self, enhanced: bool, mtu: u16) -> bool {
        self.opt.allows(enhanced)
            && match self.body {
                Body::Fn(_) => true,
                Body::Raw(ref v) => 1 + v.len() <= usize::from(mtu),
            }
    }

    /// Encodes the request for a channel with the specified MTU.
    pub fn encode(&self, mtu: u16) -> StructBuf {
        let mut pdu = StructBuf::new(usize::from(mtu));
        {
            let mut p = pdu.append();
            p.u8(self.op);
            match self.body {
                Body::Fn(ref f) => f(&mut p),
                Body::Raw(ref v) => {
                    p.put(&v[..]);
                }
            }
        }
        pdu
    }

    /// Invokes the completion continuation.
    pub fn complete(mut self, h: &mut Host<T>, conn: ConnId, r: Result<Pdu<'_>>) {
        if let Some(f) = self.done.take() {
            f(h, conn, r);
        }
    }
}

impl<T: Transport> Debug for Request<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("op", &self.op)
            .field("opt", &self.opt)
            .field("parked", &self.parked)
            .finish_non_exhaustive()
    }
}

/// Outgoing command, notification, response, or confirmation PDU.
pub(crate) struct Buf<T: Transport> {
    pub op: Opcode,
    pub pdu: StructBuf,
    pub opt: ChanOpt,
    pub done: Option<SendDone<T>>,
}

impl<T: Transport> Buf<T> {
    /// Creates a buffer limited to `mtu` bytes, calling `f` to encode the
    /// parameters after the opcode.
    pub fn new(op: Opcode, mtu: u16, f: impl FnOnce(&mut Packer)) -> Self {
        let mut pdu = StructBuf::new(usize::from(mtu));
        f(pdu.append().u8(op));
        Self {
            op,
            pdu,
            opt: ChanOpt::Any,
            done: None,
        }
    }

    /// Invokes the completion continuation.
    pub fn complete(mut self, h: &mut Host<T>, conn: ConnId, r: Result<()>) {
        if let Some(f) = self.done.take() {
            f(h, conn, r);
        }
    }
}

impl<T: Transport> Debug for Buf<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("op", &self.op)
            .field("len", &self.pdu.len())
            .field("opt", &self.opt)
            .finish_non_exhaustive()
    }
}

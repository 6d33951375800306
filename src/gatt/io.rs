use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use structbuf::StructBuf;

use crate::host::ConnId;
use crate::le::Peer;
use crate::util::name_of;

use super::*;

/// I/O callback result type. Successful calls return the number of bytes
/// read or consumed.
pub type IoResult<T = usize> = std::result::Result<T, ErrorCode>;

/// Characteristic or descriptor I/O callback.
#[derive(Clone)]
#[repr(transparent)]
pub struct Io(Arc<dyn for<'a, 'b> Fn(IoReq<'a, 'b>) -> IoResult + Send + Sync>);

impl Io {
    /// Returns an I/O callback for a method of `T`.
    #[inline(always)]
    pub fn with<T: Send + Sync + 'static>(
        this: &Arc<T>,
        f: impl Fn(&T, IoReq) -> IoResult + Send + Sync + 'static,
    ) -> Self {
        let this = Arc::clone(this);
        Self(Arc::new(move |req: IoReq| f(&this, req)))
    }

    /// Executes a read request.
    #[inline]
    pub(crate) fn read(&self, r: &mut ReadReq) -> IoResult {
        (self.0)(IoReq::Read(r))
    }

    /// Executes a write request. The callback must consume the entire value.
    pub(crate) fn write(&self, w: &WriteReq) -> IoResult<()> {
        let n = (self.0)(IoReq::Write(w))?;
        if n != w.val.len() {
            return Err(ErrorCode::UnlikelyError);
        }
        Ok(())
    }
}

impl Debug for Io {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_tuple(name_of!(Io)).field(&Arc::as_ptr(&self.0))).finish()
    }
}

impl<T: for<'a, 'b> Fn(IoReq<'a, 'b>) -> IoResult + Send + Sync + 'static> From<T> for Io {
    #[inline(always)]
    fn from(f: T) -> Self {
        Self(Arc::new(f))
    }
}

/// Characteristic or descriptor I/O request.
#[derive(Debug)]
#[non_exhaustive]
pub enum IoReq<'a, 'b> {
    Read(&'a mut ReadReq),
    Write(&'a WriteReq<'b>),
}

/// Server characteristic or descriptor read request.
#[derive(Debug)]
pub struct ReadReq {
    pub(crate) conn: ConnId,
    pub(crate) peer: Peer,
    pub(crate) hdl: Handle,
    pub(crate) off: u16,
    pub(crate) buf: StructBuf,
}

impl ReadReq {
    /// Creates a read request that accepts at most `lim` bytes.
    #[inline]
    pub(crate) fn new(conn: ConnId, peer: Peer, hdl: Handle, off: u16, lim: usize) -> Self {
        Self {
            conn,
            peer,
            hdl,
            off,
            buf: StructBuf::new(lim),
        }
    }

    /// Returns the connection of the requesting client.
    #[inline(always)]
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    /// Returns the requesting client.
    #[inline(always)]
    #[must_use]
    pub const fn peer(&self) -> Peer {
        self.peer
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the value offset.
    #[inline(always)]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.off as _
    }

    /// Provides the complete attribute value with automatic offset and MTU
    /// handling.
    #[inline]
    pub fn complete(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        let v = v.as_ref();
        self.partial(v.get(self.offset()..).ok_or(ErrorCode::InvalidOffset)?)
    }

    /// Provides the attribute value starting at the requested offset. The value
    /// is truncated to fit within the MTU.
    #[inline]
    pub fn partial(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        let v = v.as_ref();
        let n = v.len().min(self.buf.lim());
        self.buf.clear();
        self.buf.put_at(0, &v[..n]);
        Ok(n)
    }

    /// Returns the value provided by the callback.
    #[inline(always)]
    pub(crate) fn value(&self) -> &[u8] {
        &self.buf
    }
}

bitflags! {
    /// Write request flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct WriteFlags: u8 {
        /// Authorization check for `ATT_PREPARE_WRITE_REQ`. The value is empty
        /// and nothing must be written.
        const PREPARE = 1 << 0;
        /// Write command without a response.
        const CMD = 1 << 1;
        /// Value assembled by `ATT_EXECUTE_WRITE_REQ`.
        const EXECUTE = 1 << 2;
    }
}

/// Server characteristic or descriptor write request.
#[derive(Debug)]
pub struct WriteReq<'a> {
    pub(crate) conn: ConnId,
    pub(crate) peer: Peer,
    pub(crate) hdl: Handle,
    pub(crate) off: u16,
    pub(crate) val: &'a [u8],
    pub(crate) flags: WriteFlags,
}

impl<'a> WriteReq<'a> {
    /// Returns the connection of the requesting client.
    #[inline(always)]
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    /// Returns the requesting client.
    #[inline(always)]
    #[must_use]
    pub const fn peer(&self) -> Peer {
        self.peer
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the value offset.
    #[inline(always)]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.off as _
    }

    /// Returns the value to be written at the specified offset.
    #[inline(always)]
    #[must_use]
    pub const fn value(&self) -> &'a [u8] {
        self.val
    }

    /// Returns the write flags.
    #[inline(always)]
    #[must_use]
    pub const fn flags(&self) -> WriteFlags {
        self.flags
    }

    /// Updates `dst` with the written value. Returns either `InvalidOffset` or
    /// `InvalidAttributeValueLength` if the written value is not a subslice of
    /// `dst`.
    #[inline]
    pub fn update(&self, mut dst: impl AsMut<[u8]>) -> IoResult {
        let Some(dst) = dst.as_mut().get_mut(self.off as usize..) else {
            return Err(ErrorCode::InvalidOffset);
        };
        let Some(dst) = dst.get_mut(..self.val.len()) else {
            return Err(ErrorCode::InvalidAttributeValueLength);
        };
        dst.copy_from_slice(self.val);
        Ok(self.val.len())
    }
}

/// Attribute value shared between the host and application threads.
#[derive(Clone, Debug, Default)]
pub struct SharedValue(Arc<Mutex<Vec<u8>>>);

impl SharedValue {
    /// Creates a shared value.
    #[inline]
    #[must_use]
    pub fn new(v: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(Mutex::new(v.into())))
    }

    /// Returns a copy of the current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Replaces the current value.
    #[inline]
    pub fn set(&self, v: impl Into<Vec<u8>>) {
        *self.0.lock() = v.into();
    }

    /// Handles an I/O request. Writes may extend the value up to the maximum
    /// attribute length.
    fn io(&self, req: IoReq) -> IoResult {
        match req {
            IoReq::Read(r) => r.complete(&*self.0.lock()),
            IoReq::Write(w) if w.flags.contains(WriteFlags::PREPARE) => Ok(0),
            IoReq::Write(w) => {
                let mut v = self.0.lock();
                let off = w.offset();
                if off > v.len() {
                    return Err(ErrorCode::InvalidOffset);
                }
                let end = off + w.val.len();
                if end > MAX_VAL_LEN {
                    return Err(ErrorCode::InvalidAttributeValueLength);
                }
                v.truncate(off);
                v.extend_from_slice(w.val);
                Ok(w.val.len())
            }
        }
    }
}

impl From<SharedValue> for Io {
    #[inline]
    fn from(v: SharedValue) -> Self {
        Self(Arc::new(move |req: IoReq| v.io(req)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(off: u16, lim: usize) -> ReadReq {
        let conn = crate::host::tests::conn_id();
        ReadReq::new(conn, Peer::default(), Handle::MIN, off, lim)
    }

    #[test]
    fn read_offset() {
        let mut r = req(2, 3);
        assert_eq!(r.complete([1, 2, 3, 4, 5, 6]), Ok(3));
        assert_eq!(r.value(), &[3, 4, 5]);
        let mut r = req(6, 3);
        assert_eq!(r.complete([1, 2, 3, 4, 5, 6]), Ok(0));
        let mut r = req(7, 3);
        assert_eq!(r.complete([1, 2, 3, 4, 5, 6]), Err(ErrorCode::InvalidOffset));
    }

    #[test]
    fn shared_value() {
        let v = SharedValue::new([1, 2, 3]);
        let io = Io::from(v.clone());
        let w = |off, val: &'static [u8]| WriteReq {
            conn: crate::host::tests::conn_id(),
            peer: Peer::default(),
            hdl: Handle::MIN,
            off,
            val,
            flags: WriteFlags::empty(),
        };
        assert_eq!(io.write(&w(1, &[9, 9, 9])), Ok(()));
        assert_eq!(v.get(), [1, 9, 9, 9]);
        assert_eq!(io.write(&w(5, &[1])), Err(ErrorCode::InvalidOffset));
        let mut r = req(0, 10);
        assert_eq!(io.read(&mut r), Ok(4));
        assert_eq!(r.value(), &[1, 9, 9, 9]);

        // Short writes are reported as errors
        let short = Io::from(|_: IoReq| Ok(1));
        assert_eq!(short.write(&w(0, &[1, 2])), Err(ErrorCode::UnlikelyError));
    }
}

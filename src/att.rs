//! Attribute Protocol ([Vol 3] Part F).
//!
//! The ATT layer multiplexes one or more channels of a connection into a
//! [`Bearer`], arbitrates client requests across those channels, and answers
//! peer requests from the GATT database.

use std::fmt::Debug;

use gattic_const::Uuid;

pub use {consts::*, handle::*, pdu::*, perm::*, req::*};
pub(crate) use {bearer::*, chan::*, server::*};

mod bearer;
mod chan;
mod client;
mod consts;
mod handle;
mod pdu;
mod perm;
mod req;
mod server;

/// Error type returned by the ATT layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Att(#[from] ErrorRsp),
    #[error("timeout while waiting for {0} response")]
    Timeout(Opcode),
    #[error("connection reset")]
    ConnectionReset,
    #[error("insufficient resources")]
    NoResources,
    #[error("not connected")]
    NotConnected,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("operation not supported")]
    NotSupported,
    #[error("authentication required")]
    Authentication,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("transport send failure")]
    Send,
}

impl Error {
    /// Returns the ATT error code if the error came from an error response.
    #[inline]
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match *self {
            Self::Att(ref e) => Some(e.err),
            _ => None,
        }
    }
}

/// Common ATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// PDU response result.
pub type RspResult<T> = std::result::Result<T, ErrorRsp>;

/// `ATT_ERROR_RSP` PDU ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("ATT {req:#04X}{} failed with {err}", .hdl.map_or(String::new(), |h| format!(" for handle {:#06X}", u16::from(h))))]
pub struct ErrorRsp {
    req: u8,
    hdl: Option<Handle>,
    err: ErrorCode,
}

impl ErrorRsp {
    /// Creates a new error response.
    #[inline(always)]
    #[must_use]
    pub const fn new(req: u8, hdl: Option<Handle>, err: ErrorCode) -> Self {
        Self { req, hdl, err }
    }

    /// Returns the raw opcode of the failed request.
    #[inline(always)]
    #[must_use]
    pub const fn req(&self) -> u8 {
        self.req
    }

    /// Returns the handle that caused the error, if any.
    #[inline(always)]
    #[must_use]
    pub const fn hdl(&self) -> Option<Handle> {
        self.hdl
    }

    /// Returns the error code.
    #[inline(always)]
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.err
    }
}

/// Default LE ATT MTU ([Vol 3] Part F, Section 3.2.8).
pub const DEFAULT_MTU: u16 = 23;

/// Minimum MTU of an enhanced ATT channel ([Vol 3] Part F, Section 3.2.8).
pub const EATT_MIN_MTU: u16 = 64;

/// Largest MTU that can carry a maximum-length attribute value.
pub const MAX_MTU: u16 = 517;

/// Authentication signature length of `ATT_SIGNED_WRITE_CMD`
/// ([Vol 3] Part F, Section 3.4.5.4).
pub const SIGNATURE_LEN: usize = 12;

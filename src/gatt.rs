//! Generic Attribute Profile ([Vol 3] Part G).
//!
//! The server side is an attribute database built from [`ServiceDef`]s, with
//! per-peer CCC state and Robust Caching ([Vol 3] Part G, Section 2.5.2).
//! The client side runs discovery, long read and write procedures, and
//! tracks subscriptions to remote characteristics.

pub use {builder::*, cache::*, ccc::*, client::*, consts::*, db::*, io::*, notify::*};

use gattic_const::Uuid;

use crate::att::*;

mod builder;
mod cache;
mod ccc;
mod client;
mod consts;
mod db;
mod io;
mod notify;

//! Bluetooth LE Attribute Protocol and Generic Attribute Profile library.
//!
//! [`host::Host`] is a synchronous engine that implements the ATT client and
//! server, the GATT attribute database with Robust Caching, and client-side
//! discovery and subscriptions. It is driven by a [`host::Transport`]
//! implementation and can be run on a tokio task via [`driver::Driver`].

pub use att::{Error, Result};

pub mod att;
pub mod driver;
#[cfg(feature = "fs")]
pub mod fs;
pub mod gatt;
pub mod host;
pub mod le;
pub mod store;
mod util;

//! In-process GATT simulator.
//!
//! A [`Hub`] connects simulated clients and servers. Servers register their
//! attribute list and a [`ServerCallback`](crate::event::ServerCallback);
//! clients connect to a registered server through a [`SimTransport`]. Every
//! operation is routed through the hub, which either answers it directly
//! (MTU, PHY, RSSI, services) or forwards it to the server as a request that
//! the server answers with [`Hub::send_response`]. [`Peripheral`] is a
//! ready-made server backed by a [`ValueStore`](crate::gatt::ValueStore).

pub use {hub::*, pairing::*, peripheral::*, transport::*};

use crate::gatt::{Handle, Status};
use crate::le::{Addr, Link};
use crate::request::StaleRequest;

mod hub;
mod pairing;
mod peripheral;
mod transport;

#[cfg(test)]
mod tests;

/// Error type returned by the simulator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown server {0}")]
    UnknownServer(Addr),
    #[error("server {0} is already registered")]
    AlreadyRegistered(Addr),
    #[error("{0} is not connected")]
    NotConnected(Link),
    #[error("{0} is already connected")]
    AlreadyConnected(Link),
    #[error("invalid attribute {0}")]
    InvalidHandle(Handle),
    #[error("operation not supported by attribute {0}")]
    NotSupported(Handle),
    #[error(transparent)]
    StaleRequest(#[from] StaleRequest),
}

impl From<Error> for Status {
    /// Returns the status reported by a transport that fails to issue a call.
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidHandle(_) => Self::InvalidHandle,
            Error::NotSupported(_) => Self::RequestNotSupported,
            _ => Self::Error,
        }
    }
}

/// Common simulator result type.
pub type Result<T> = std::result::Result<T, Error>;

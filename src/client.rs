//! Serialized GATT client.
//!
//! A [`Client`] drives one link through a callback-driven [`Transport`]. Each
//! operation acquires the [`RequestLock`](crate::lock::RequestLock) slot of
//! its [`FeatureClass`], issues the transport call, and suspends until the
//! matching [`ClientEvent`](crate::event::ClientEvent) arrives, the link is
//! lost, or the operation times out.

use std::time::Duration;

pub use {client::*, session::*, transport::*};

use crate::gatt::{ConnStatus, Handle, Status, MAX_MTU, MIN_MTU};
use crate::lock::FeatureClass;

mod client;
mod session;
mod transport;

/// Error type returned by client operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{op} operation failed: {status}")]
    OperationFailed { op: FeatureClass, status: Status },
    #[error("connection failed: {0}")]
    ConnectionFailed(ConnStatus),
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("{0} operation timed out")]
    Timeout(FeatureClass),
    #[error("transport rejected {op} operation: {reason}")]
    Rejected { op: FeatureClass, reason: Status },
    #[error("unknown attribute {0}")]
    InvalidHandle(Handle),
    #[error("client closed")]
    Closed,
}

/// Common client result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Client configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum time to wait for the completion of any operation.
    pub op_timeout: Option<Duration>,
    /// Keep the client open after link loss so that it can reconnect.
    pub auto_connect: bool,
    /// MTU assumed before negotiation and after disconnection.
    pub default_mtu: u16,
    /// Upper bound for MTU requests.
    pub max_mtu: u16,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            // ATT transaction timeout ([Vol 3] Part F, Section 3.3.3)
            op_timeout: Some(Duration::from_secs(30)),
            auto_connect: false,
            default_mtu: MIN_MTU,
            max_mtu: MAX_MTU,
        }
    }
}

impl Config {
    /// Returns `mtu` limited to the configured bounds.
    #[inline]
    #[must_use]
    pub fn clamp_mtu(&self, mtu: u16) -> u16 {
        mtu.clamp(MIN_MTU, self.max_mtu.max(MIN_MTU))
    }
}

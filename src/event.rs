//! Client-bound and server-bound GATT events.
//!
//! Every completion produced by a transport, and every request forwarded to a
//! simulated peripheral, is one variant of a closed event type for its
//! direction. Receivers dispatch on the variant.

use std::fmt::Debug;
use std::sync::Arc;

use tracing::warn;

use crate::gatt::{BondState, ConnState, ConnStatus, Handle, Phy, Schema, Status, MAX_MTU};
use crate::le::Addr;
use crate::lock::FeatureClass;
use crate::request::RequestId;
use crate::sim::Hub;

/// Event delivered to the GATT client (central) side of a link.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ClientEvent {
    ConnectionStateChanged {
        status: ConnStatus,
        state: ConnState,
    },
    ServicesDiscovered {
        status: Status,
        services: Arc<Schema>,
    },
    /// The server attribute list changed and must be discovered again.
    ServiceChanged,
    MtuChanged {
        status: Status,
        mtu: u16,
    },
    PhyRead {
        status: Status,
        tx: Phy,
        rx: Phy,
    },
    PhyUpdated {
        status: Status,
        tx: Phy,
        rx: Phy,
    },
    RemoteRssiRead {
        status: Status,
        rssi: i8,
    },
    CharacteristicRead {
        hdl: Handle,
        status: Status,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        hdl: Handle,
        status: Status,
    },
    /// Notification or indication of a characteristic value.
    CharacteristicChanged {
        hdl: Handle,
        value: Vec<u8>,
    },
    DescriptorRead {
        hdl: Handle,
        status: Status,
        value: Vec<u8>,
    },
    DescriptorWrite {
        hdl: Handle,
        status: Status,
    },
    ReliableWriteCompleted {
        status: Status,
    },
    BondStateChanged {
        state: BondState,
    },
}

impl ClientEvent {
    /// Returns the operation class that this event completes, or `None` for
    /// unsolicited events.
    #[must_use]
    pub const fn class(&self) -> Option<FeatureClass> {
        use FeatureClass as F;
        Some(match *self {
            Self::ConnectionStateChanged { .. } => F::Connect,
            Self::ServicesDiscovered { .. } => F::ServicesDiscovered,
            Self::MtuChanged { .. } => F::Mtu,
            Self::PhyRead { .. } => F::PhyRead,
            Self::PhyUpdated { .. } => F::PhyUpdate,
            Self::RemoteRssiRead { .. } => F::RemoteRssi,
            Self::CharacteristicRead { .. } => F::CharacteristicRead,
            Self::CharacteristicWrite { .. } | Self::ReliableWriteCompleted { .. } => {
                F::CharacteristicWrite
            }
            Self::DescriptorRead { .. } => F::DescriptorRead,
            Self::DescriptorWrite { .. } => F::DescriptorWrite,
            Self::BondStateChanged { .. } => F::Bonding,
            Self::ServiceChanged | Self::CharacteristicChanged { .. } => return None,
        })
    }

    /// Returns the attribute handle that the event refers to.
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        match *self {
            Self::CharacteristicRead { hdl, .. }
            | Self::CharacteristicWrite { hdl, .. }
            | Self::CharacteristicChanged { hdl, .. }
            | Self::DescriptorRead { hdl, .. }
            | Self::DescriptorWrite { hdl, .. } => Some(hdl),
            _ => None,
        }
    }

    /// Returns the operation status carried by the event.
    #[must_use]
    pub const fn status(&self) -> Status {
        match *self {
            Self::ServicesDiscovered { status, .. }
            | Self::MtuChanged { status, .. }
            | Self::PhyRead { status, .. }
            | Self::PhyUpdated { status, .. }
            | Self::RemoteRssiRead { status, .. }
            | Self::CharacteristicRead { status, .. }
            | Self::CharacteristicWrite { status, .. }
            | Self::DescriptorRead { status, .. }
            | Self::DescriptorWrite { status, .. }
            | Self::ReliableWriteCompleted { status } => status,
            Self::ConnectionStateChanged { status, .. } => {
                if matches!(status, ConnStatus::Success) {
                    Status::Success
                } else {
                    Status::Failure
                }
            }
            Self::ServiceChanged
            | Self::CharacteristicChanged { .. }
            | Self::BondStateChanged { .. } => Status::Success,
        }
    }
}

/// Event delivered to the GATT server (peripheral) side of a link. `device`
/// is the address of the client that caused the event.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ServerEvent {
    ConnectionStateChanged {
        device: Addr,
        status: ConnStatus,
        state: ConnState,
    },
    CharacteristicReadRequest {
        device: Addr,
        id: RequestId,
        offset: usize,
        hdl: Handle,
    },
    CharacteristicWriteRequest {
        device: Addr,
        id: RequestId,
        hdl: Handle,
        /// Write is part of a reliable write transaction.
        prepared: bool,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    },
    DescriptorReadRequest {
        device: Addr,
        id: RequestId,
        offset: usize,
        hdl: Handle,
    },
    DescriptorWriteRequest {
        device: Addr,
        id: RequestId,
        hdl: Handle,
        prepared: bool,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    },
    /// Commit (`execute == true`) or discard all prepared writes of `device`.
    ExecuteWrite {
        device: Addr,
        id: RequestId,
        execute: bool,
    },
    NotificationSent {
        device: Addr,
        status: Status,
    },
    MtuChanged {
        device: Addr,
        mtu: u16,
    },
    PhyUpdated {
        device: Addr,
        status: Status,
        tx: Phy,
        rx: Phy,
    },
}

impl ServerEvent {
    /// Returns the address of the client that caused the event.
    #[must_use]
    pub const fn device(&self) -> Addr {
        match *self {
            Self::ConnectionStateChanged { device, .. }
            | Self::CharacteristicReadRequest { device, .. }
            | Self::CharacteristicWriteRequest { device, .. }
            | Self::DescriptorReadRequest { device, .. }
            | Self::DescriptorWriteRequest { device, .. }
            | Self::ExecuteWrite { device, .. }
            | Self::NotificationSent { device, .. }
            | Self::MtuChanged { device, .. }
            | Self::PhyUpdated { device, .. } => device,
        }
    }
}

/// Receiver of client-bound events. Implementations must not block; events
/// are delivered from whichever task completed the operation.
pub trait ClientCallback: Debug + Send + Sync {
    fn on_event(&self, e: ClientEvent);
}

/// Receiver of server-bound events. Request events must eventually be answered
/// with [`Hub::send_response`], either from within the callback or later.
pub trait ServerCallback: Debug + Send + Sync {
    fn on_event(&self, hub: &Hub, e: ServerEvent);

    /// Returns the largest ATT MTU supported by the server.
    #[inline]
    fn max_mtu(&self) -> u16 {
        MAX_MTU
    }
}

impl ClientCallback for tokio::sync::mpsc::UnboundedSender<ClientEvent> {
    fn on_event(&self, e: ClientEvent) {
        if let Err(e) = self.send(e) {
            warn!("Client event dropped: {:?}", e.0);
        }
    }
}

impl ServerCallback for tokio::sync::mpsc::UnboundedSender<ServerEvent> {
    fn on_event(&self, _: &Hub, e: ServerEvent) {
        if let Err(e) = self.send(e) {
            warn!("Server event dropped: {:?}", e.0);
        }
    }
}

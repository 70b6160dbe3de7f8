use std::sync::Weak;

use tracing::{debug, trace};

use crate::client::{Issued, Transport};
use crate::event::{ClientCallback, ClientEvent};
use crate::gatt::{ConnState, ConnStatus, Handle, PhyMask, PhyOption, Priority, Status, WriteType};
use crate::le::Link;
use crate::lock::FeatureClass;

use super::*;

/// Client transport that routes every call through a [`Hub`].
#[derive(Debug)]
pub struct SimTransport {
    hub: Hub,
    link: Link,
    params: PairingParams,
}

impl SimTransport {
    /// Creates a transport for `link` that connects with parameters `params`.
    #[inline]
    #[must_use]
    pub const fn new(hub: Hub, link: Link, params: PairingParams) -> Self {
        Self { hub, link, params }
    }

    /// Returns the hub used by the transport.
    #[inline(always)]
    #[must_use]
    pub const fn hub(&self) -> &Hub {
        &self.hub
    }
}

impl Transport for SimTransport {
    #[inline(always)]
    fn link(&self) -> Link {
        self.link
    }

    fn connect(&self, cb: Weak<dyn ClientCallback>, auto_connect: bool) -> Issued {
        trace!("Connecting {} (auto_connect={auto_connect})", self.link);
        match self.hub.connect(self.link, Weak::clone(&cb), self.params) {
            Ok(_) => Ok(()),
            // Failure to reach the peer is reported as a state change
            Err(Error::UnknownServer(_)) => {
                if let Some(cb) = cb.upgrade() {
                    cb.on_event(ClientEvent::ConnectionStateChanged {
                        status: ConnStatus::FailedToEstablish,
                        state: ConnState::Disconnected,
                    });
                }
                Ok(())
            }
            Err(e) => issued(Err(e)),
        }
    }

    #[inline]
    fn disconnect(&self) -> Issued {
        issued(self.hub.disconnect(self.link))
    }

    #[inline]
    fn close(&self) {
        self.hub.close(self.link);
    }

    #[inline]
    fn discover_services(&self) -> Issued {
        issued(self.hub.discover_services(self.link))
    }

    #[inline]
    fn request_mtu(&self, mtu: u16) -> Issued {
        issued(self.hub.request_mtu(self.link, mtu))
    }

    #[inline]
    fn read_phy(&self) -> Issued {
        issued(self.hub.read_phy(self.link))
    }

    #[inline]
    fn set_preferred_phy(&self, tx: PhyMask, rx: PhyMask, opt: PhyOption) -> Issued {
        issued(self.hub.set_preferred_phy(self.link, tx, rx, opt))
    }

    #[inline]
    fn read_remote_rssi(&self) -> Issued {
        issued(self.hub.read_remote_rssi(self.link))
    }

    #[inline]
    fn request_connection_priority(&self, p: Priority) -> Issued {
        issued(self.hub.request_connection_priority(self.link, p))
    }

    #[inline]
    fn read_characteristic(&self, hdl: Handle) -> Issued {
        issued(self.hub.read_characteristic(self.link, hdl))
    }

    #[inline]
    fn write_characteristic(&self, hdl: Handle, value: &[u8], t: WriteType) -> Issued {
        issued(self.hub.write_characteristic(self.link, hdl, value, t))
    }

    #[inline]
    fn read_descriptor(&self, hdl: Handle) -> Issued {
        issued(self.hub.read_descriptor(self.link, hdl))
    }

    #[inline]
    fn write_descriptor(&self, hdl: Handle, value: &[u8]) -> Issued {
        issued(self.hub.write_descriptor(self.link, hdl, value))
    }

    #[inline]
    fn set_characteristic_notification(&self, hdl: Handle, enable: bool) -> Issued {
        issued((self.hub).set_characteristic_notification(self.link, hdl, enable))
    }

    #[inline]
    fn begin_reliable_write(&self) -> Issued {
        issued(self.hub.begin_reliable_write(self.link))
    }

    #[inline]
    fn execute_reliable_write(&self) -> Issued {
        issued(self.hub.execute_reliable_write(self.link))
    }

    #[inline]
    fn abort_reliable_write(&self) -> Issued {
        issued(self.hub.abort_reliable_write(self.link))
    }

    #[inline]
    fn create_bond(&self) -> Issued {
        issued(self.hub.create_bond(self.link))
    }

    #[inline]
    fn cancel(&self, op: FeatureClass) {
        self.hub.cancel(self.link, op);
    }
}

/// Converts a hub result into the outcome of a transport call.
fn issued(r: Result<()>) -> Issued {
    r.map_err(|e| {
        debug!("Simulated call failed: {e}");
        Status::from(e)
    })
}

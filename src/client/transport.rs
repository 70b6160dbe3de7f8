use std::fmt::Debug;
use std::sync::Weak;

use crate::event::ClientCallback;
use crate::gatt::{Handle, PhyMask, PhyOption, Priority, Status, WriteType};
use crate::le::Link;
use crate::lock::FeatureClass;

/// Outcome of issuing a transport call. `Ok` means that the call was accepted
/// and its completion will be reported as an event. `Err` means that the call
/// was not issued and no event will follow.
pub type Issued = std::result::Result<(), Status>;

/// Callback-driven GATT transport for one link. Implementations permit at most
/// one outstanding call of each operation class and report completions through
/// the [`ClientCallback`] registered by [`Transport::connect`]. Completions may
/// be delivered before the call that caused them returns.
pub trait Transport: Debug + Send + Sync {
    /// Returns the link served by the transport.
    fn link(&self) -> Link;

    /// Connects to the server. `auto_connect` requests the transport to keep
    /// reconnecting after link loss.
    fn connect(&self, cb: Weak<dyn ClientCallback>, auto_connect: bool) -> Issued;

    /// Disconnects from the server, keeping transport resources allocated.
    fn disconnect(&self) -> Issued;

    /// Releases all transport resources. No events are delivered afterwards.
    fn close(&self);

    fn discover_services(&self) -> Issued;

    fn request_mtu(&self, mtu: u16) -> Issued;

    fn read_phy(&self) -> Issued;

    fn set_preferred_phy(&self, tx: PhyMask, rx: PhyMask, opt: PhyOption) -> Issued;

    fn read_remote_rssi(&self) -> Issued;

    /// Requests a connection interval priority. Completes without an event.
    fn request_connection_priority(&self, p: Priority) -> Issued;

    fn read_characteristic(&self, hdl: Handle) -> Issued;

    fn write_characteristic(&self, hdl: Handle, value: &[u8], t: WriteType) -> Issued;

    fn read_descriptor(&self, hdl: Handle) -> Issued;

    fn write_descriptor(&self, hdl: Handle, value: &[u8]) -> Issued;

    /// Enables or disables local delivery of value changes for characteristic
    /// `hdl`. Completes without an event.
    fn set_characteristic_notification(&self, hdl: Handle, enable: bool) -> Issued;

    /// Starts a reliable write transaction. Completes without an event.
    fn begin_reliable_write(&self) -> Issued;

    fn execute_reliable_write(&self) -> Issued;

    fn abort_reliable_write(&self) -> Issued;

    fn create_bond(&self) -> Issued;

    /// Abandons the outstanding call of class `op`, which was cancelled or
    /// timed out. A completion that arrives later is not matched to a newer
    /// call of the same class. The default implementation does nothing.
    #[inline]
    fn cancel(&self, op: FeatureClass) {
        let _ = op;
    }
}

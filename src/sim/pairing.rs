use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use crate::event::ClientCallback;
use crate::gatt::{Handle, Phy, PhyOption, Priority, Schema, MIN_MTU};
use crate::le::Link;

/// Connection parameters of a simulated link.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PairingParams {
    pub mtu: u16,
    /// Signal strength reported by RSSI reads, in dBm.
    pub rssi: i8,
    pub tx_phy: Phy,
    pub rx_phy: Phy,
    pub phy_option: PhyOption,
    pub priority: Priority,
}

impl Default for PairingParams {
    #[inline]
    fn default() -> Self {
        Self {
            mtu: MIN_MTU,
            rssi: -40,
            tx_phy: Phy::Le1M,
            rx_phy: Phy::Le1M,
            phy_option: PhyOption::NoPreferred,
            priority: Priority::Balanced,
        }
    }
}

/// Active simulated session between a client and a server. The hub owns the
/// live pairing; callers receive snapshots.
#[derive(Clone, Debug)]
pub struct Pairing {
    link: Link,
    client: Weak<dyn ClientCallback>,
    schema: Arc<Schema>,
    params: PairingParams,
    notifying: SmallVec<[Handle; 4]>,
    reliable_write: bool,
}

impl Pairing {
    pub(super) fn new(
        link: Link,
        client: Weak<dyn ClientCallback>,
        schema: Arc<Schema>,
        params: PairingParams,
    ) -> Self {
        Self {
            link,
            client,
            schema,
            params,
            notifying: SmallVec::new(),
            reliable_write: false,
        }
    }

    /// Returns the link identity.
    #[inline(always)]
    #[must_use]
    pub const fn link(&self) -> Link {
        self.link
    }

    /// Returns the server attribute list.
    #[inline(always)]
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the connection parameters.
    #[inline(always)]
    #[must_use]
    pub const fn params(&self) -> &PairingParams {
        &self.params
    }

    /// Returns whether the client enabled notifications for characteristic
    /// `hdl`.
    #[inline]
    #[must_use]
    pub fn is_notifying(&self, hdl: Handle) -> bool {
        self.notifying.contains(&hdl)
    }

    /// Returns whether a reliable write transaction is active.
    #[inline(always)]
    #[must_use]
    pub const fn is_reliable_write(&self) -> bool {
        self.reliable_write
    }

    #[inline(always)]
    pub(super) fn client(&self) -> &Weak<dyn ClientCallback> {
        &self.client
    }

    #[inline(always)]
    pub(super) fn params_mut(&mut self) -> &mut PairingParams {
        &mut self.params
    }

    #[inline]
    pub(super) fn set_schema(&mut self, schema: Arc<Schema>) {
        self.schema = schema;
        self.notifying.clear();
    }

    pub(super) fn set_notifying(&mut self, hdl: Handle, enable: bool) {
        match (self.is_notifying(hdl), enable) {
            (false, true) => self.notifying.push(hdl),
            (true, false) => self.notifying.retain(|&mut h| h != hdl),
            _ => {}
        }
    }

    /// Starts a reliable write transaction. Has no effect if one is already
    /// active.
    #[inline]
    pub(super) fn begin_reliable_write(&mut self) {
        self.reliable_write = true;
    }

    /// Ends the reliable write transaction and returns whether one was active.
    #[inline]
    pub(super) fn end_reliable_write(&mut self) -> bool {
        std::mem::take(&mut self.reliable_write)
    }
}

#[cfg(test)]
mod tests {
    use crate::le::Addr;

    use super::*;

    #[derive(Debug)]
    struct Nop;

    impl ClientCallback for Nop {
        fn on_event(&self, _: crate::event::ClientEvent) {}
    }

    #[test]
    fn state() {
        let link = Link::new(Addr::default(), Addr::default());
        let client: Weak<dyn ClientCallback> = Weak::<Nop>::new();
        let mut p = Pairing::new(link, client, Arc::default(), PairingParams::default());
        let h = Handle::new(3).unwrap();
        p.set_notifying(h, true);
        p.set_notifying(h, true);
        assert!(p.is_notifying(h));
        assert_eq!(p.notifying.len(), 1);
        p.set_notifying(h, false);
        assert!(!p.is_notifying(h));

        p.begin_reliable_write();
        p.begin_reliable_write();
        assert!(p.is_reliable_write());
        assert!(p.end_reliable_write());
        assert!(!p.end_reliable_write());
    }
}

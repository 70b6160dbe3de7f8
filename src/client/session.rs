use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::event::ClientEvent;
use crate::gatt::{BondState, ConnState, ConnStatus, Phy, Schema};

/// Connection phase and the status of the last transition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct State {
    pub phase: ConnState,
    pub status: ConnStatus,
}

impl State {
    /// Returns whether the link is connected.
    #[inline(always)]
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.phase, ConnState::Connected)
    }
}

/// Observable per-link state. Values are updated only from the event
/// delivery path, except for the `Connecting` and `Disconnecting` phases,
/// which are set locally as soon as the transition is requested.
#[derive(Debug)]
pub struct Session {
    default_mtu: u16,
    state: watch::Sender<State>,
    mtu: watch::Sender<u16>,
    phy: watch::Sender<(Phy, Phy)>,
    bond: watch::Sender<BondState>,
    services: watch::Sender<Option<Arc<Schema>>>,
}

impl Session {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(default_mtu: u16) -> Self {
        Self {
            default_mtu,
            state: watch::channel(State::default()).0,
            mtu: watch::channel(default_mtu).0,
            phy: watch::channel((Phy::Le1M, Phy::Le1M)).0,
            bond: watch::channel(BondState::None).0,
            services: watch::channel(None).0,
        }
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Returns whether the link is connected.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Returns the negotiated MTU.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> u16 {
        *self.mtu.borrow()
    }

    /// Returns the current transmitter and receiver PHYs.
    #[inline]
    #[must_use]
    pub fn phy(&self) -> (Phy, Phy) {
        *self.phy.borrow()
    }

    /// Returns the bond state.
    #[inline]
    #[must_use]
    pub fn bond_state(&self) -> BondState {
        *self.bond.borrow()
    }

    /// Returns the last discovered attribute list.
    #[inline]
    #[must_use]
    pub fn services(&self) -> Option<Arc<Schema>> {
        self.services.borrow().clone()
    }

    #[inline]
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    #[inline]
    pub fn watch_mtu(&self) -> watch::Receiver<u16> {
        self.mtu.subscribe()
    }

    #[inline]
    pub fn watch_bond_state(&self) -> watch::Receiver<BondState> {
        self.bond.subscribe()
    }

    #[inline]
    pub fn watch_services(&self) -> watch::Receiver<Option<Arc<Schema>>> {
        self.services.subscribe()
    }

    /// Sets a locally synthesized connection phase.
    pub(super) fn set_phase(&self, phase: ConnState, status: ConnStatus) {
        let old = self.state.send_replace(State { phase, status });
        if old.phase != phase {
            debug!("Connection state: {} -> {phase} ({status})", old.phase);
        }
    }

    /// Applies the state changes carried by event `e`.
    pub(super) fn update(&self, e: &ClientEvent) {
        match *e {
            ClientEvent::ConnectionStateChanged { status, state } => {
                self.set_phase(state, status);
                if state == ConnState::Disconnected {
                    self.mtu.send_replace(self.default_mtu);
                    self.services.send_replace(None);
                }
            }
            ClientEvent::ServicesDiscovered {
                status,
                ref services,
            } if status.is_ok() => {
                self.services.send_replace(Some(Arc::clone(services)));
            }
            ClientEvent::MtuChanged { status, mtu } if status.is_ok() => {
                debug!("MTU: {mtu}");
                self.mtu.send_replace(mtu);
            }
            ClientEvent::PhyRead { status, tx, rx } | ClientEvent::PhyUpdated { status, tx, rx }
                if status.is_ok() =>
            {
                self.phy.send_replace((tx, rx));
            }
            ClientEvent::BondStateChanged { state } => {
                debug!("Bond state: {state}");
                self.bond.send_replace(state);
            }
            _ => {}
        }
    }
}

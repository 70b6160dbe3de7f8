use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::event::{ServerCallback, ServerEvent};
use crate::gatt::{ConnState, Handle, Prop, Schema, Status, ValueStore, MAX_MTU, MIN_MTU};
use crate::le::Addr;
use crate::request::RequestId;
use crate::SyncMutex;

use super::*;

/// Simulated GATT server backed by a [`ValueStore`]. Reads are answered from
/// committed values, writes update them, and prepared writes are staged per
/// client until the client executes or aborts its reliable write transaction.
/// Prepared values of a client are discarded when it disconnects.
#[derive(Debug)]
pub struct Peripheral {
    addr: Addr,
    schema: Arc<Schema>,
    max_mtu: u16,
    st: SyncMutex<State>,
    subs: SyncMutex<Vec<mpsc::UnboundedSender<ServerEvent>>>,
}

#[derive(Debug)]
struct State {
    vals: ValueStore,
    mtu: HashMap<Addr, u16>,
}

impl State {
    #[inline]
    fn mtu(&self, device: Addr) -> u16 {
        self.mtu.get(&device).copied().unwrap_or(MIN_MTU)
    }
}

impl Peripheral {
    /// Creates a peripheral with address `addr`, attribute list `schema`, and
    /// initial attribute values `vals`.
    #[must_use]
    pub fn new(addr: Addr, schema: Arc<Schema>, vals: ValueStore) -> Self {
        Self {
            addr,
            schema,
            max_mtu: MAX_MTU,
            st: SyncMutex::new(State {
                vals,
                mtu: HashMap::new(),
            }),
            subs: SyncMutex::default(),
        }
    }

    /// Sets the largest MTU that the peripheral accepts.
    #[inline]
    #[must_use]
    pub fn with_max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu.clamp(MIN_MTU, MAX_MTU);
        self
    }

    /// Registers the peripheral with `hub`.
    pub fn register(self, hub: &Hub) -> Result<Arc<Self>> {
        let p = Arc::new(self);
        let api: Arc<dyn ServerCallback> = Arc::clone(&p) as _;
        hub.register_server(p.addr, api, Arc::clone(&p.schema))?;
        Ok(p)
    }

    /// Returns the peripheral address.
    #[inline(always)]
    #[must_use]
    pub const fn addr(&self) -> Addr {
        self.addr
    }

    /// Returns the attribute list.
    #[inline(always)]
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the committed value of attribute `hdl`.
    #[must_use]
    pub fn value(&self, hdl: Handle) -> Option<Vec<u8>> {
        self.st.lock().vals.get(hdl).map(<[u8]>::to_vec)
    }

    /// Returns the value of attribute `hdl` prepared by client `device`.
    #[must_use]
    pub fn pending(&self, device: Addr, hdl: Handle) -> Option<Vec<u8>> {
        self.st.lock().vals.pending(device, hdl).map(<[u8]>::to_vec)
    }

    /// Replaces the committed value of attribute `hdl`.
    pub fn set_value(&self, hdl: Handle, v: &[u8]) -> Result<()> {
        (self.st.lock().vals.write(hdl, 0, v)).map_err(|_| Error::InvalidHandle(hdl))
    }

    /// Updates the value of characteristic `hdl` and sends it to client
    /// `device`, using an indication if the characteristic does not support
    /// notifications. Returns whether the client received the value.
    pub fn notify(&self, hub: &Hub, device: Addr, hdl: Handle, v: &[u8]) -> Result<bool> {
        let props = (self.schema.characteristic(hdl))
            .ok_or(Error::InvalidHandle(hdl))?
            .properties();
        self.set_value(hdl, v)?;
        let confirm = !props.contains(Prop::NOTIFY);
        hub.notify_characteristic_changed(self.addr, device, hdl, confirm, v)
    }

    /// Returns a receiver of all events delivered to the peripheral.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().push(tx);
        rx
    }

    fn read(&self, device: Addr, hdl: Handle, offset: usize) -> (Status, Option<Vec<u8>>) {
        let st = self.st.lock();
        // ATT_READ_RSP header is 1 byte
        let max = usize::from(st.mtu(device)) - 1;
        match st.vals.read(hdl, offset, max) {
            Ok(v) => (Status::Success, Some(v)),
            Err(status) => (status, None),
        }
    }

    fn write(&self, device: Addr, hdl: Handle, prepared: bool, offset: usize, v: &[u8]) -> Status {
        let mut st = self.st.lock();
        let r = if prepared {
            st.vals.prepare(device, hdl, offset, v)
        } else {
            st.vals.write(hdl, offset, v)
        };
        match r {
            Ok(()) => Status::Success,
            Err(status) => {
                debug!("Write to {hdl} by {device} failed: {status}");
                status
            }
        }
    }

    fn publish(&self, e: &ServerEvent) {
        let mut subs = self.subs.lock();
        if !subs.is_empty() {
            subs.retain(|tx| tx.send(e.clone()).is_ok());
        }
    }
}

impl ServerCallback for Peripheral {
    fn on_event(&self, hub: &Hub, e: ServerEvent) {
        trace!("{}: {e:?}", self.addr);
        self.publish(&e);
        let rsp: Option<(Addr, RequestId, usize, Status, Option<Vec<u8>>)> = match e {
            ServerEvent::CharacteristicReadRequest {
                device,
                id,
                offset,
                hdl,
            }
            | ServerEvent::DescriptorReadRequest {
                device,
                id,
                offset,
                hdl,
            } => {
                let (status, v) = self.read(device, hdl, offset);
                Some((device, id, offset, status, v))
            }
            ServerEvent::CharacteristicWriteRequest {
                device,
                id,
                hdl,
                prepared,
                response_needed,
                offset,
                ref value,
            }
            | ServerEvent::DescriptorWriteRequest {
                device,
                id,
                hdl,
                prepared,
                response_needed,
                offset,
                ref value,
            } => {
                let status = self.write(device, hdl, prepared, offset, value);
                // Prepare write responses echo the value
                let v = prepared.then(|| value.clone());
                response_needed.then_some((device, id, offset, status, v))
            }
            ServerEvent::ExecuteWrite {
                device,
                id,
                execute,
            } => {
                let mut st = self.st.lock();
                if execute {
                    let n = st.vals.execute(device);
                    debug!("Committed {n} prepared value(s) from {device}");
                } else {
                    let n = st.vals.abort(device);
                    debug!("Discarded {n} prepared value(s) from {device}");
                }
                Some((device, id, 0, Status::Success, None))
            }
            ServerEvent::ConnectionStateChanged {
                device,
                state: ConnState::Disconnected,
                ..
            } => {
                let mut st = self.st.lock();
                st.vals.abort(device);
                st.mtu.remove(&device);
                None
            }
            ServerEvent::MtuChanged { device, mtu } => {
                self.st.lock().mtu.insert(device, mtu);
                None
            }
            _ => None,
        };
        if let Some((device, id, offset, status, v)) = rsp {
            if let Err(e) = hub.send_response(device, id, status, offset, v.as_deref()) {
                warn!("Response to {id} from {} failed: {e}", self.addr);
            }
        }
    }

    #[inline]
    fn max_mtu(&self) -> u16 {
        self.max_mtu
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::event::{ClientCallback, ClientEvent, ServerCallback, ServerEvent};
use crate::gatt::{
    ConnState, ConnStatus, Handle, PhyMask, PhyOption, Priority, Prop, Schema, Status, WriteType,
    MAX_MTU, MIN_MTU,
};
use crate::le::{Addr, Link};
use crate::lock::FeatureClass;
use crate::request::{AttrType, Registry, RequestId, RequestKind};
use crate::SyncMutex;

use super::*;

/// Registry of simulated servers and their active pairings. Every simulated
/// operation and response is routed through the hub.
///
/// Events are delivered synchronously by the call that produced them, after
/// all internal locks are released, so callbacks may call back into the hub.
/// Events of one pairing are delivered in the order of the calls that
/// produced them. Cloning a hub returns another handle to the same registry.
#[derive(Clone, Debug, Default)]
pub struct Hub(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    st: SyncMutex<State>,
    reqs: Registry,
}

#[derive(Debug, Default)]
struct State {
    servers: HashMap<Addr, Server>,
    pairings: HashMap<Link, Pairing>,
    bonds: HashSet<Link>,
}

#[derive(Debug)]
struct Server {
    api: Arc<dyn ServerCallback>,
    schema: Arc<Schema>,
    max_mtu: u16,
}

impl Hub {
    /// Creates an empty hub.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server with address `addr` and attribute list `schema`.
    pub fn register_server(
        &self,
        addr: Addr,
        api: Arc<dyn ServerCallback>,
        schema: Arc<Schema>,
    ) -> Result<()> {
        let max_mtu = api.max_mtu().clamp(MIN_MTU, MAX_MTU);
        let mut st = self.0.st.lock();
        if st.servers.contains_key(&addr) {
            return Err(Error::AlreadyRegistered(addr));
        }
        debug!("Registered server {addr} (max MTU {max_mtu})");
        let s = Server {
            api,
            schema,
            max_mtu,
        };
        st.servers.insert(addr, s);
        Ok(())
    }

    /// Replaces the attribute list of server `addr` and notifies all connected
    /// clients that services have changed. Notification subscriptions are
    /// reset.
    pub fn update_services(&self, addr: Addr, schema: Arc<Schema>) -> Result<()> {
        let mut out = Outbox::default();
        {
            let mut st = self.0.st.lock();
            let State {
                servers, pairings, ..
            } = &mut *st;
            let s = servers.get_mut(&addr).ok_or(Error::UnknownServer(addr))?;
            s.schema = Arc::clone(&schema);
            for p in pairings.values_mut().filter(|p| p.link().server == addr) {
                p.set_schema(Arc::clone(&schema));
                out.client(p, ClientEvent::ServiceChanged);
            }
        }
        debug!("Updated services of {addr}");
        self.deliver(out);
        Ok(())
    }

    /// Unregisters server `addr`. All clients connected to it observe a link
    /// loss.
    pub fn unregister_server(&self, addr: Addr) -> Result<()> {
        let mut out = Outbox::default();
        {
            let mut st = self.0.st.lock();
            st.servers
                .remove(&addr)
                .ok_or(Error::UnknownServer(addr))?;
            st.pairings.retain(|&link, p| {
                if link.server != addr {
                    return true;
                }
                self.0.reqs.discard(link);
                out.client(
                    p,
                    ClientEvent::ConnectionStateChanged {
                        status: ConnStatus::LinkLoss,
                        state: ConnState::Disconnected,
                    },
                );
                false
            });
        }
        debug!("Unregistered server {addr}");
        self.deliver(out);
        Ok(())
    }

    /// Returns whether server `addr` is registered.
    #[must_use]
    pub fn is_registered(&self, addr: Addr) -> bool {
        self.0.st.lock().servers.contains_key(&addr)
    }

    /// Connects the client of `link` to its server and returns the new
    /// pairing. The client callback is held weakly; events are dropped once
    /// the client is gone. The initial MTU is limited by the server and
    /// reported to both sides if it differs from the default.
    pub fn connect(
        &self,
        link: Link,
        client: Weak<dyn ClientCallback>,
        mut params: PairingParams,
    ) -> Result<Pairing> {
        let mut out = Outbox::default();
        let p = {
            let mut st = self.0.st.lock();
            let State {
                servers, pairings, ..
            } = &mut *st;
            let s = (servers.get(&link.server)).ok_or(Error::UnknownServer(link.server))?;
            if pairings.contains_key(&link) {
                return Err(Error::AlreadyConnected(link));
            }
            params.mtu = params.mtu.clamp(MIN_MTU, s.max_mtu);
            let p = Pairing::new(link, client, Arc::clone(&s.schema), params);
            out.server(
                s,
                ServerEvent::ConnectionStateChanged {
                    device: link.client,
                    status: ConnStatus::Success,
                    state: ConnState::Connected,
                },
            );
            // A larger initial MTU is reported to the client before the
            // connection completes
            let mtu = params.mtu;
            if mtu != MIN_MTU {
                let device = link.client;
                out.server(s, ServerEvent::MtuChanged { device, mtu });
                let status = Status::Success;
                out.client(&p, ClientEvent::MtuChanged { status, mtu });
            }
            out.client(
                &p,
                ClientEvent::ConnectionStateChanged {
                    status: ConnStatus::Success,
                    state: ConnState::Connected,
                },
            );
            pairings.insert(link, p.clone());
            p
        };
        debug!("Connected {link}");
        self.deliver(out);
        Ok(p)
    }

    /// Disconnects `link` at the request of the client.
    #[inline]
    pub fn disconnect(&self, link: Link) -> Result<()> {
        self.end(
            link,
            Some(ConnStatus::TerminateLocalHost),
            ConnStatus::TerminatePeerUser,
        )
    }

    /// Releases `link` resources of the client. The client does not receive
    /// any further events. Has no effect if the link is not connected.
    pub fn close(&self, link: Link) {
        match self.end(link, None, ConnStatus::TerminatePeerUser) {
            Ok(()) | Err(Error::NotConnected(_)) => {}
            Err(e) => error!("Failed to close {link}: {e}"),
        }
    }

    /// Disconnects `link` at the request of the server. The client observes a
    /// graceful disconnection by the peer.
    #[inline]
    pub fn cancel_connection(&self, link: Link) -> Result<()> {
        self.end(
            link,
            Some(ConnStatus::TerminatePeerUser),
            ConnStatus::TerminateLocalHost,
        )
    }

    /// Simulates loss of `link`, such as a supervision timeout.
    #[inline]
    pub fn link_loss(&self, link: Link) -> Result<()> {
        self.end(link, Some(ConnStatus::LinkLoss), ConnStatus::LinkLoss)
    }

    /// Returns a snapshot of the `link` pairing.
    #[must_use]
    pub fn pairing(&self, link: Link) -> Option<Pairing> {
        self.0.st.lock().pairings.get(&link).cloned()
    }

    /// Returns the addresses of all clients connected to server `addr`.
    #[must_use]
    pub fn clients(&self, addr: Addr) -> Vec<Addr> {
        let st = self.0.st.lock();
        let mut v: Vec<Addr> = (st.pairings.keys())
            .filter(|l| l.server == addr)
            .map(|l| l.client)
            .collect();
        v.sort_unstable();
        v
    }

    /// Discards the outstanding requests of `link` issued by a cancelled client
    /// operation of class `op`. Server responses to those requests are
    /// rejected as stale.
    pub fn cancel(&self, link: Link, op: FeatureClass) {
        let n = self.0.reqs.cancel(link, op);
        if n > 0 {
            debug!("Cancelled {n} {op} request(s) on {link}");
        }
    }

    /// Returns the number of requests awaiting a server response.
    #[inline]
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.0.reqs.len()
    }

    /// Reports the attribute list of the server.
    pub fn discover_services(&self, link: Link) -> Result<()> {
        self.op(link, |p, _, out| {
            let services = Arc::clone(p.schema());
            out.client(
                p,
                ClientEvent::ServicesDiscovered {
                    status: Status::Success,
                    services,
                },
            );
            Ok(())
        })
    }

    /// Negotiates the MTU as the smaller of `mtu` and the server maximum.
    pub fn request_mtu(&self, link: Link, mtu: u16) -> Result<()> {
        self.op(link, |p, s, out| {
            let mtu = mtu.clamp(MIN_MTU, s.max_mtu);
            p.params_mut().mtu = mtu;
            out.server(
                s,
                ServerEvent::MtuChanged {
                    device: link.client,
                    mtu,
                },
            );
            let status = Status::Success;
            out.client(p, ClientEvent::MtuChanged { status, mtu });
            Ok(())
        })
    }

    /// Reports the current PHYs.
    pub fn read_phy(&self, link: Link) -> Result<()> {
        self.op(link, |p, _, out| {
            let (tx, rx) = (p.params().tx_phy, p.params().rx_phy);
            let status = Status::Success;
            out.client(p, ClientEvent::PhyRead { status, tx, rx });
            Ok(())
        })
    }

    /// Selects new PHYs from the client preferences. An empty mask keeps the
    /// current PHY for that direction.
    pub fn set_preferred_phy(
        &self,
        link: Link,
        tx: PhyMask,
        rx: PhyMask,
        opt: PhyOption,
    ) -> Result<()> {
        self.op(link, |p, s, out| {
            let pp = p.params_mut();
            pp.tx_phy = tx.select().unwrap_or(pp.tx_phy);
            pp.rx_phy = rx.select().unwrap_or(pp.rx_phy);
            pp.phy_option = opt;
            let (tx, rx) = (pp.tx_phy, pp.rx_phy);
            let status = Status::Success;
            out.server(
                s,
                ServerEvent::PhyUpdated {
                    device: link.client,
                    status,
                    tx: rx,
                    rx: tx,
                },
            );
            out.client(p, ClientEvent::PhyUpdated { status, tx, rx });
            Ok(())
        })
    }

    /// Reports the configured RSSI of the link.
    pub fn read_remote_rssi(&self, link: Link) -> Result<()> {
        self.op(link, |p, _, out| {
            let rssi = p.params().rssi;
            let status = Status::Success;
            out.client(p, ClientEvent::RemoteRssiRead { status, rssi });
            Ok(())
        })
    }

    /// Updates the connection priority. No event is produced.
    pub fn request_connection_priority(&self, link: Link, prio: Priority) -> Result<()> {
        self.op(link, |p, _, _| {
            p.params_mut().priority = prio;
            Ok(())
        })
    }

    /// Forwards a characteristic read request to the server.
    pub fn read_characteristic(&self, link: Link, hdl: Handle) -> Result<()> {
        self.op(link, |p, s, out| {
            let props = char_props(p, hdl)?;
            if !props.contains(Prop::READ) {
                out.client(
                    p,
                    ClientEvent::CharacteristicRead {
                        hdl,
                        status: Status::ReadNotPermitted,
                        value: Vec::new(),
                    },
                );
                return Ok(());
            }
            let kind = RequestKind::Read(AttrType::Characteristic);
            let id = self.0.reqs.new_request(link, Some(hdl), kind);
            out.server(
                s,
                ServerEvent::CharacteristicReadRequest {
                    device: link.client,
                    id,
                    offset: 0,
                    hdl,
                },
            );
            Ok(())
        })
    }

    /// Forwards a characteristic write request to the server. Writes without
    /// a response are completed immediately. During a reliable write
    /// transaction, the write is marked as prepared and always needs a
    /// response.
    pub fn write_characteristic(
        &self,
        link: Link,
        hdl: Handle,
        value: &[u8],
        wt: WriteType,
    ) -> Result<()> {
        self.op(link, |p, s, out| {
            let props = char_props(p, hdl)?;
            if !props.permits(wt) {
                let status = Status::WriteNotPermitted;
                out.client(p, ClientEvent::CharacteristicWrite { hdl, status });
                return Ok(());
            }
            let prepared = p.is_reliable_write();
            let response_needed = prepared || wt.needs_response();
            let id = if response_needed {
                let kind = RequestKind::Write(AttrType::Characteristic);
                self.0.reqs.new_request(link, Some(hdl), kind)
            } else {
                self.0.reqs.skip()
            };
            out.server(
                s,
                ServerEvent::CharacteristicWriteRequest {
                    device: link.client,
                    id,
                    hdl,
                    prepared,
                    response_needed,
                    offset: 0,
                    value: value.to_vec(),
                },
            );
            if !response_needed {
                let status = Status::Success;
                out.client(p, ClientEvent::CharacteristicWrite { hdl, status });
            }
            Ok(())
        })
    }

    /// Forwards a descriptor read request to the server.
    pub fn read_descriptor(&self, link: Link, hdl: Handle) -> Result<()> {
        self.op(link, |p, s, out| {
            p.schema()
                .descriptor(hdl)
                .ok_or(Error::InvalidHandle(hdl))?;
            let kind = RequestKind::Read(AttrType::Descriptor);
            let id = self.0.reqs.new_request(link, Some(hdl), kind);
            out.server(
                s,
                ServerEvent::DescriptorReadRequest {
                    device: link.client,
                    id,
                    offset: 0,
                    hdl,
                },
            );
            Ok(())
        })
    }

    /// Forwards a descriptor write request to the server.
    pub fn write_descriptor(&self, link: Link, hdl: Handle, value: &[u8]) -> Result<()> {
        self.op(link, |p, s, out| {
            p.schema()
                .descriptor(hdl)
                .ok_or(Error::InvalidHandle(hdl))?;
            let kind = RequestKind::Write(AttrType::Descriptor);
            let id = self.0.reqs.new_request(link, Some(hdl), kind);
            out.server(
                s,
                ServerEvent::DescriptorWriteRequest {
                    device: link.client,
                    id,
                    hdl,
                    prepared: p.is_reliable_write(),
                    response_needed: true,
                    offset: 0,
                    value: value.to_vec(),
                },
            );
            Ok(())
        })
    }

    /// Enables or disables delivery of value changes of characteristic `hdl`
    /// to the client. No event is produced.
    pub fn set_characteristic_notification(
        &self,
        link: Link,
        hdl: Handle,
        enable: bool,
    ) -> Result<()> {
        self.op(link, |p, _, _| {
            if !char_props(p, hdl)?.can_subscribe() {
                return Err(Error::NotSupported(hdl));
            }
            trace!("Notifications for {hdl} on {link}: {enable}");
            p.set_notifying(hdl, enable);
            Ok(())
        })
    }

    /// Starts a reliable write transaction. Has no effect if one is already
    /// active; previously prepared writes are kept.
    pub fn begin_reliable_write(&self, link: Link) -> Result<()> {
        self.op(link, |p, _, _| {
            debug!("Reliable write started on {link}");
            p.begin_reliable_write();
            Ok(())
        })
    }

    /// Asks the server to commit all prepared writes of the client.
    #[inline]
    pub fn execute_reliable_write(&self, link: Link) -> Result<()> {
        self.end_reliable_write(link, true)
    }

    /// Asks the server to discard all prepared writes of the client.
    #[inline]
    pub fn abort_reliable_write(&self, link: Link) -> Result<()> {
        self.end_reliable_write(link, false)
    }

    /// Bonds the client with the server. Bonds outlive the connection.
    pub fn create_bond(&self, link: Link) -> Result<()> {
        let mut out = Outbox::default();
        {
            let mut st = self.0.st.lock();
            let State {
                pairings, bonds, ..
            } = &mut *st;
            let p = pairings.get(&link).ok_or(Error::NotConnected(link))?;
            if bonds.insert(link) {
                let state = crate::gatt::BondState::Bonding;
                out.client(p, ClientEvent::BondStateChanged { state });
            }
            let state = crate::gatt::BondState::Bonded;
            out.client(p, ClientEvent::BondStateChanged { state });
        }
        self.deliver(out);
        Ok(())
    }

    /// Answers the server request `id` from client `device`. The completion
    /// event is delivered to the client if the pairing still exists. A
    /// response to a request that is not outstanding for `device` is a
    /// protocol violation and is dropped without affecting other requests.
    pub fn send_response(
        &self,
        device: Addr,
        id: RequestId,
        status: Status,
        offset: usize,
        value: Option<&[u8]>,
    ) -> Result<()> {
        let r = match self.0.reqs.resolve_for(id, device) {
            Ok(r) => r,
            Err(e) => {
                error!("Response for {device} dropped: {e}");
                return Err(e.into());
            }
        };
        let value = value.map_or_else(Vec::new, <[u8]>::to_vec);
        trace!("Response to {id}: {status} [offset={offset}] {value:02X?}");
        let e = match (r.kind, r.hdl) {
            (RequestKind::Read(AttrType::Characteristic), Some(hdl)) => {
                ClientEvent::CharacteristicRead { hdl, status, value }
            }
            (RequestKind::Write(AttrType::Characteristic), Some(hdl)) => {
                ClientEvent::CharacteristicWrite { hdl, status }
            }
            (RequestKind::Read(AttrType::Descriptor), Some(hdl)) => {
                ClientEvent::DescriptorRead { hdl, status, value }
            }
            (RequestKind::Write(AttrType::Descriptor), Some(hdl)) => {
                ClientEvent::DescriptorWrite { hdl, status }
            }
            _ => ClientEvent::ReliableWriteCompleted { status },
        };
        let mut out = Outbox::default();
        match self.0.st.lock().pairings.get(&r.link) {
            Some(p) => out.client(p, e),
            None => debug!("Response to {id} for disconnected {}", r.link),
        }
        self.deliver(out);
        Ok(())
    }

    /// Sends a notification (`confirm == false`) or indication of the value of
    /// characteristic `hdl` from server `server` to client `device`. Returns
    /// whether the value was delivered, which requires the client to have
    /// enabled notifications. Values are truncated to fit the MTU.
    pub fn notify_characteristic_changed(
        &self,
        server: Addr,
        device: Addr,
        hdl: Handle,
        confirm: bool,
        value: &[u8],
    ) -> Result<bool> {
        let link = Link::new(server, device);
        let mut out = Outbox::default();
        let sent = {
            let st = self.0.st.lock();
            let p = st.pairings.get(&link).ok_or(Error::NotConnected(link))?;
            let s = st.servers.get(&server).ok_or(Error::UnknownServer(server))?;
            let need = if confirm { Prop::INDICATE } else { Prop::NOTIFY };
            if !char_props(p, hdl)?.contains(need) {
                return Err(Error::NotSupported(hdl));
            }
            if p.is_notifying(hdl) {
                // ATT_HANDLE_VALUE_NTF/IND header is 3 bytes
                let n = value.len().min(usize::from(p.params().mtu) - 3);
                let value = value[..n].to_vec();
                out.client(p, ClientEvent::CharacteristicChanged { hdl, value });
                let status = Status::Success;
                out.server(s, ServerEvent::NotificationSent { device, status });
                true
            } else {
                trace!("Notification for {hdl} on {link} dropped (not subscribed)");
                false
            }
        };
        self.deliver(out);
        Ok(sent)
    }

    /// Calls `f` with the live pairing of `link` and its server, and delivers
    /// the events that it produced.
    fn op(
        &self,
        link: Link,
        f: impl FnOnce(&mut Pairing, &Server, &mut Outbox) -> Result<()>,
    ) -> Result<()> {
        let mut out = Outbox::default();
        let r = {
            let mut st = self.0.st.lock();
            let State {
                servers, pairings, ..
            } = &mut *st;
            let p = pairings.get_mut(&link).ok_or(Error::NotConnected(link))?;
            let s = (servers.get(&link.server)).ok_or(Error::UnknownServer(link.server))?;
            f(p, s, &mut out)
        };
        self.deliver(out);
        r
    }

    /// Removes the `link` pairing, discarding its outstanding requests, and
    /// reports the disconnection to the server and, if `client` is specified,
    /// to the client.
    fn end(&self, link: Link, client: Option<ConnStatus>, server: ConnStatus) -> Result<()> {
        let mut out = Outbox::default();
        {
            let mut st = self.0.st.lock();
            let p = (st.pairings.remove(&link)).ok_or(Error::NotConnected(link))?;
            let n = self.0.reqs.discard(link);
            if let Some(s) = st.servers.get(&link.server) {
                out.server(
                    s,
                    ServerEvent::ConnectionStateChanged {
                        device: link.client,
                        status: server,
                        state: ConnState::Disconnected,
                    },
                );
            }
            if let Some(status) = client {
                let state = ConnState::Disconnected;
                out.client(&p, ClientEvent::ConnectionStateChanged { status, state });
            }
            debug!("Disconnected {link} ({server}), {n} pending request(s) discarded");
        }
        self.deliver(out);
        Ok(())
    }

    fn end_reliable_write(&self, link: Link, execute: bool) -> Result<()> {
        self.op(link, |p, s, out| {
            if !p.end_reliable_write() {
                debug!("No reliable write in progress on {link}");
            }
            let id = (self.0.reqs).new_request(link, None, RequestKind::ExecuteWrite);
            out.server(
                s,
                ServerEvent::ExecuteWrite {
                    device: link.client,
                    id,
                    execute,
                },
            );
            Ok(())
        })
    }

    /// Delivers events collected while the hub state was locked.
    fn deliver(&self, out: Outbox) {
        for d in out.0 {
            match d {
                Delivery::Client(cb, e) => match cb.upgrade() {
                    Some(cb) => cb.on_event(e),
                    None => trace!("Client gone, dropped {e:?}"),
                },
                Delivery::Server(api, e) => api.on_event(self, e),
            }
        }
    }
}

/// Returns the properties of characteristic `hdl` of the pairing server.
#[inline]
fn char_props(p: &Pairing, hdl: Handle) -> Result<Prop> {
    (p.schema().characteristic(hdl))
        .map(|c| c.properties())
        .ok_or(Error::InvalidHandle(hdl))
}

#[derive(Debug)]
enum Delivery {
    Client(Weak<dyn ClientCallback>, ClientEvent),
    Server(Arc<dyn ServerCallback>, ServerEvent),
}

/// Events pending delivery.
#[derive(Debug, Default)]
struct Outbox(SmallVec<[Delivery; 2]>);

impl Outbox {
    #[inline]
    fn client(&mut self, p: &Pairing, e: ClientEvent) {
        self.0.push(Delivery::Client(Weak::clone(p.client()), e));
    }

    #[inline]
    fn server(&mut self, s: &Server, e: ServerEvent) {
        self.0.push(Delivery::Server(Arc::clone(&s.api), e));
    }
}

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::event::{ClientCallback, ClientEvent};
use crate::gatt::{
    BondState, Cccd, ConnState, ConnStatus, Handle, Phy, PhyMask, PhyOption, Priority, Schema,
    Status, WriteType,
};
use crate::le::Link;
use crate::lock::{FeatureClass, LockGuard, RequestLock};
use crate::SyncMutex;

use super::*;

/// Predicate selecting the event variant that completes an operation.
type Accept = fn(&ClientEvent) -> bool;

/// GATT client for one link. Operations of the same [`FeatureClass`] are
/// executed one at a time in FIFO order, and operations of different classes
/// may be in flight concurrently. All operations are cancel safe: dropping an
/// operation future releases its lock slot and ignores the late completion.
#[derive(Debug)]
pub struct Client<T: Transport>(Arc<Inner<T>>);

impl<T: Transport> Clone for Client<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Transport + 'static> Client<T> {
    /// Creates a client that uses transport `t`. All clients of the same host
    /// adapter must share `lock`.
    #[must_use]
    pub fn new(t: T, lock: RequestLock, cfg: Config) -> Self {
        let link = t.link();
        Self(Arc::new(Inner {
            t,
            link,
            cfg,
            lock,
            session: Session::new(cfg.default_mtu),
            waiters: SyncMutex::default(),
            subs: SyncMutex::default(),
            rediscovery: SyncMutex::default(),
            closed: CancellationToken::new(),
            user_closed: AtomicBool::new(false),
        }))
    }

    /// Returns the link served by the client.
    #[inline]
    #[must_use]
    pub fn link(&self) -> Link {
        self.0.link
    }

    /// Returns the client configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.0.cfg
    }

    /// Returns the current link state.
    #[inline]
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.0.session
    }

    /// Returns whether the link is connected.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.0.session.is_connected()
    }

    /// Returns whether the client was closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.is_cancelled()
    }

    /// Returns a receiver of connection state changes.
    #[inline]
    pub fn state(&self) -> watch::Receiver<State> {
        self.0.session.watch_state()
    }

    /// Returns a receiver of MTU changes.
    #[inline]
    pub fn mtu(&self) -> watch::Receiver<u16> {
        self.0.session.watch_mtu()
    }

    /// Returns a receiver of bond state changes.
    #[inline]
    pub fn bond_state(&self) -> watch::Receiver<BondState> {
        self.0.session.watch_bond_state()
    }

    /// Returns a receiver of the discovered attribute list.
    #[inline]
    pub fn services(&self) -> watch::Receiver<Option<Arc<Schema>>> {
        self.0.session.watch_services()
    }

    /// Returns a stream of characteristic value changes for all characteristics
    /// with enabled notifications. The stream ends when the client is closed.
    pub fn notifications(&self) -> Notifications {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.0.subs.lock().push(tx);
        }
        Notifications(rx)
    }

    /// Connects to the server. Returns immediately if already connected.
    pub async fn connect(&self) -> Result<()> {
        let s = &self.0;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let _g = self.acquire(FeatureClass::Connect).await?;
        if s.session.is_connected() {
            return Ok(());
        }
        (s.session).set_phase(ConnState::Connecting, ConnStatus::Success);
        let (w, rx) = s.register(FeatureClass::Connect, None, |e| {
            matches!(
                e,
                ClientEvent::ConnectionStateChanged {
                    state: ConnState::Connected | ConnState::Disconnected,
                    ..
                }
            )
        });
        let cb = Arc::downgrade(&self.0) as Weak<dyn ClientCallback>;
        if let Err(reason) = s.t.connect(cb, s.cfg.auto_connect) {
            warn!("Connection to {} rejected: {reason}", s.link);
            (s.session).set_phase(ConnState::Disconnected, ConnStatus::Error);
            return Err(Error::Rejected {
                op: FeatureClass::Connect,
                reason,
            });
        }
        let r = self.wait(FeatureClass::Connect, rx).await;
        drop(w);
        match r {
            Ok(ClientEvent::ConnectionStateChanged {
                state: ConnState::Connected,
                ..
            }) => Ok(()),
            Ok(ClientEvent::ConnectionStateChanged { status, .. }) => {
                Err(Error::ConnectionFailed(status))
            }
            Ok(e) => unreachable!("unexpected connect completion: {e:?}"),
            Err(Error::Timeout(op)) => {
                let _ = s.t.disconnect();
                (s.session).set_phase(ConnState::Disconnected, ConnStatus::FailedToEstablish);
                Err(Error::Timeout(op))
            }
            // Disconnection is delivered to the waiter, so only close() can
            // drop it.
            Err(_) => Err(s.closed_error()),
        }
    }

    /// Disconnects from the server and waits for the link to be disconnected.
    /// This does not wait for other operations, which fail with
    /// [`Error::DeviceDisconnected`].
    pub async fn disconnect(&self) -> Result<()> {
        let s = &self.0;
        if s.user_closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut rx = s.session.watch_state();
        let prev = *rx.borrow_and_update();
        if prev.phase == ConnState::Disconnected {
            return Ok(());
        }
        (s.session).set_phase(ConnState::Disconnecting, ConnStatus::Success);
        if let Err(reason) = s.t.disconnect() {
            s.session.set_phase(prev.phase, prev.status);
            return Err(Error::Rejected {
                op: FeatureClass::Connect,
                reason,
            });
        }
        let disconnected = async {
            loop {
                if rx.borrow_and_update().phase == ConnState::Disconnected {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Closed);
                }
            }
        };
        match s.cfg.op_timeout {
            Some(d) => (tokio::time::timeout(d, disconnected).await)
                .map_err(|_| Error::Timeout(FeatureClass::Connect))?,
            None => disconnected.await,
        }
    }

    /// Closes the client, releasing transport resources. Pending operations
    /// fail with [`Error::DeviceDisconnected`] and new ones with
    /// [`Error::Closed`]. A client that was closed because the link was lost
    /// keeps reporting [`Error::DeviceDisconnected`] until this is called.
    #[inline]
    pub fn close(&self) {
        self.0.user_closed.store(true, Ordering::Release);
        self.0.close();
    }

    /// Discovers server services and returns the attribute list.
    pub async fn discover_services(&self) -> Result<Arc<Schema>> {
        let e = (self.exec(
            FeatureClass::ServicesDiscovered,
            None,
            |e| matches!(e, ClientEvent::ServicesDiscovered { .. }),
            |t| t.discover_services(),
        ))
        .await?;
        let ClientEvent::ServicesDiscovered { services, .. } = e else {
            unreachable!()
        };
        debug!("Discovered {} services", services.services().len());
        Ok(services)
    }

    /// Requests an ATT MTU and returns the negotiated value.
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        let mtu = self.0.cfg.clamp_mtu(mtu);
        let e = (self.exec(
            FeatureClass::Mtu,
            None,
            |e| matches!(e, ClientEvent::MtuChanged { .. }),
            |t| t.request_mtu(mtu),
        ))
        .await?;
        let ClientEvent::MtuChanged { mtu, .. } = e else {
            unreachable!()
        };
        Ok(mtu)
    }

    /// Returns the current transmitter and receiver PHYs.
    pub async fn read_phy(&self) -> Result<(Phy, Phy)> {
        let e = (self.exec(
            FeatureClass::PhyRead,
            None,
            |e| matches!(e, ClientEvent::PhyRead { .. }),
            |t| t.read_phy(),
        ))
        .await?;
        let ClientEvent::PhyRead { tx, rx, .. } = e else {
            unreachable!()
        };
        Ok((tx, rx))
    }

    /// Sets the preferred PHYs and returns the selected ones.
    pub async fn set_phy(&self, tx: PhyMask, rx: PhyMask, opt: PhyOption) -> Result<(Phy, Phy)> {
        let e = (self.exec(
            FeatureClass::PhyUpdate,
            None,
            |e| matches!(e, ClientEvent::PhyUpdated { .. }),
            |t| t.set_preferred_phy(tx, rx, opt),
        ))
        .await?;
        let ClientEvent::PhyUpdated { tx, rx, .. } = e else {
            unreachable!()
        };
        Ok((tx, rx))
    }

    /// Reads the RSSI of the link. RSSI reads of all links sharing the same
    /// lock are serialized.
    pub async fn read_rssi(&self) -> Result<i8> {
        let e = (self.exec(
            FeatureClass::RemoteRssi,
            None,
            |e| matches!(e, ClientEvent::RemoteRssiRead { .. }),
            |t| t.read_remote_rssi(),
        ))
        .await?;
        let ClientEvent::RemoteRssiRead { rssi, .. } = e else {
            unreachable!()
        };
        Ok(rssi)
    }

    /// Requests a connection interval priority.
    pub fn request_connection_priority(&self, p: Priority) -> Result<()> {
        self.check_connected()?;
        (self.0.t.request_connection_priority(p)).map_err(|reason| Error::Rejected {
            op: FeatureClass::Connect,
            reason,
        })
    }

    /// Reads the value of characteristic `hdl`.
    pub async fn read_characteristic(&self, hdl: Handle) -> Result<Vec<u8>> {
        let e = (self.exec(
            FeatureClass::CharacteristicRead,
            Some(hdl),
            |e| matches!(e, ClientEvent::CharacteristicRead { .. }),
            |t| t.read_characteristic(hdl),
        ))
        .await?;
        let ClientEvent::CharacteristicRead { value, .. } = e else {
            unreachable!()
        };
        Ok(value)
    }

    /// Writes the value of characteristic `hdl`. Within a reliable write
    /// transaction, the value is only prepared.
    pub async fn write_characteristic(&self, hdl: Handle, value: &[u8], wt: WriteType) -> Result<()> {
        (self.exec(
            FeatureClass::CharacteristicWrite,
            Some(hdl),
            |e| matches!(e, ClientEvent::CharacteristicWrite { .. }),
            |t| t.write_characteristic(hdl, value, wt),
        ))
        .await
        .map(|_| ())
    }

    /// Reads the value of descriptor `hdl`.
    pub async fn read_descriptor(&self, hdl: Handle) -> Result<Vec<u8>> {
        let e = (self.exec(
            FeatureClass::DescriptorRead,
            Some(hdl),
            |e| matches!(e, ClientEvent::DescriptorRead { .. }),
            |t| t.read_descriptor(hdl),
        ))
        .await?;
        let ClientEvent::DescriptorRead { value, .. } = e else {
            unreachable!()
        };
        Ok(value)
    }

    /// Writes the value of descriptor `hdl`.
    pub async fn write_descriptor(&self, hdl: Handle, value: &[u8]) -> Result<()> {
        (self.exec(
            FeatureClass::DescriptorWrite,
            Some(hdl),
            |e| matches!(e, ClientEvent::DescriptorWrite { .. }),
            |t| t.write_descriptor(hdl, value),
        ))
        .await
        .map(|_| ())
    }

    /// Enables or disables value change notifications for characteristic
    /// `hdl`. If the characteristic has a Client Characteristic Configuration
    /// descriptor, it is first updated to request notifications or
    /// indications, depending on the characteristic properties. Local delivery
    /// is only changed once the descriptor write succeeds. Services must be
    /// discovered first.
    pub async fn set_notifying(&self, hdl: Handle, enable: bool) -> Result<()> {
        let s = &self.0;
        self.check_connected()?;
        let (props, cccd) = (s.session.services())
            .and_then(|sv| sv.characteristic(hdl).map(|c| (c.properties(), c.cccd())))
            .ok_or(Error::InvalidHandle(hdl))?;
        if let Some(cccd) = cccd {
            let v = if enable {
                Cccd::enable(props)
            } else {
                Cccd::empty()
            };
            self.write_descriptor(cccd, &v.to_bytes()).await?;
        }
        (s.t.set_characteristic_notification(hdl, enable)).map_err(|reason| Error::Rejected {
            op: FeatureClass::DescriptorWrite,
            reason,
        })
    }

    /// Starts a reliable write transaction. Subsequent characteristic writes
    /// are prepared until the transaction is executed or aborted.
    pub async fn begin_reliable_write(&self) -> Result<()> {
        let _g = self.acquire(FeatureClass::CharacteristicWrite).await?;
        self.check_connected()?;
        (self.0.t.begin_reliable_write()).map_err(|reason| Error::Rejected {
            op: FeatureClass::CharacteristicWrite,
            reason,
        })
    }

    /// Commits all writes prepared since [`Self::begin_reliable_write`].
    pub async fn execute_reliable_write(&self) -> Result<()> {
        (self.exec(
            FeatureClass::CharacteristicWrite,
            None,
            |e| matches!(e, ClientEvent::ReliableWriteCompleted { .. }),
            |t| t.execute_reliable_write(),
        ))
        .await
        .map(|_| ())
    }

    /// Discards all writes prepared since [`Self::begin_reliable_write`].
    pub async fn abort_reliable_write(&self) -> Result<()> {
        (self.exec(
            FeatureClass::CharacteristicWrite,
            None,
            |e| matches!(e, ClientEvent::ReliableWriteCompleted { .. }),
            |t| t.abort_reliable_write(),
        ))
        .await
        .map(|_| ())
    }

    /// Bonds with the server. Returns immediately if already bonded.
    pub async fn create_bond(&self) -> Result<()> {
        if self.0.session.bond_state() == BondState::Bonded {
            return Ok(());
        }
        let e = (self.exec(
            FeatureClass::Bonding,
            None,
            |e| matches!(e, ClientEvent::BondStateChanged { state } if *state != BondState::Bonding),
            |t| t.create_bond(),
        ))
        .await?;
        match e {
            ClientEvent::BondStateChanged {
                state: BondState::Bonded,
            } => Ok(()),
            _ => Err(Error::OperationFailed {
                op: FeatureClass::Bonding,
                status: Status::InsufficientAuthentication,
            }),
        }
    }

    /// Executes an operation of class `op` that is completed by an event
    /// selected by `accept` and, if specified, referring to attribute `hdl`.
    async fn exec(
        &self,
        op: FeatureClass,
        hdl: Option<Handle>,
        accept: Accept,
        call: impl FnOnce(&T) -> Issued,
    ) -> Result<ClientEvent> {
        let s = &self.0;
        let _g = self.acquire(op).await?;
        let (w, rx) = s.register(op, hdl, accept);
        // Checked after registration so that a concurrent disconnection either
        // drains the waiter or is observed here.
        self.check_connected()?;
        if let Err(reason) = call(&s.t) {
            warn!("Transport rejected {op} on {}: {reason}", s.link);
            return Err(Error::Rejected { op, reason });
        }
        let r = self.wait(op, rx).await;
        drop(w);
        let e = r?;
        match e.status() {
            Status::Success => Ok(e),
            status => {
                debug!("{op} failed on {}: {status}", s.link);
                Err(Error::OperationFailed { op, status })
            }
        }
    }

    /// Acquires the lock slot for class `op`.
    async fn acquire(&self, op: FeatureClass) -> Result<LockGuard> {
        let s = &self.0;
        tokio::select! {
            biased;
            _ = s.closed.cancelled() => Err(s.closed_error()),
            g = s.lock.acquire(s.link, op) => Ok(g),
        }
    }

    /// Waits for the completion event of an operation of class `op`.
    async fn wait(&self, op: FeatureClass, rx: oneshot::Receiver<ClientEvent>) -> Result<ClientEvent> {
        let r = match self.0.cfg.op_timeout {
            Some(d) => (tokio::time::timeout(d, rx).await).map_err(|_| {
                warn!("{op} timed out on {}", self.0.link);
                Error::Timeout(op)
            })?,
            None => rx.await,
        };
        r.map_err(|_| Error::DeviceDisconnected)
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.0.closed_error())
        } else if self.is_connected() {
            Ok(())
        } else {
            Err(Error::DeviceDisconnected)
        }
    }
}

/// Stream of characteristic value changes.
#[derive(Debug)]
pub struct Notifications(mpsc::UnboundedReceiver<Notification>);

impl Notifications {
    /// Returns the next value change or `None` if the client was closed.
    #[inline]
    pub async fn recv(&mut self) -> Option<Notification> {
        self.0.recv().await
    }

    /// Returns the next value change if one is available without waiting.
    #[inline]
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.0.try_recv().ok()
    }
}

impl futures_core::Stream for Notifications {
    type Item = Notification;

    #[inline]
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

/// Characteristic value notification or indication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    pub hdl: Handle,
    pub value: Vec<u8>,
}

/// Shared client state, which also receives transport events.
#[derive(Debug)]
struct Inner<T: Transport> {
    t: T,
    link: Link,
    cfg: Config,
    lock: RequestLock,
    session: Session,
    waiters: SyncMutex<Waiters>,
    subs: SyncMutex<Vec<mpsc::UnboundedSender<Notification>>>,
    /// Lock slot held by a discovery started by a Service Changed event.
    rediscovery: SyncMutex<Option<LockGuard>>,
    closed: CancellationToken,
    /// Set when the owner called [`Client::close`].
    user_closed: AtomicBool,
}

impl<T: Transport> Inner<T> {
    /// Registers a waiter for the completion of an operation of class `op`.
    fn register(
        &self,
        op: FeatureClass,
        hdl: Option<Handle>,
        accept: Accept,
    ) -> (WaiterGuard<'_, T>, oneshot::Receiver<ClientEvent>) {
        let (tx, rx) = oneshot::channel();
        let mut ws = self.waiters.lock();
        ws.next_id += 1;
        let id = ws.next_id;
        let w = Waiter {
            id,
            hdl,
            accept,
            tx,
        };
        if ws.map.insert(op, w).is_some() {
            warn!("Replaced {op} waiter on {}", self.link);
        }
        (WaiterGuard { inner: self, op, id }, rx)
    }

    /// Resumes the operation completed by event `e`.
    fn complete(&self, e: ClientEvent) {
        let Some(op) = e.class() else { return };
        let w = {
            let mut ws = self.waiters.lock();
            if ws.map.get(&op).map_or(false, |w| w.matches(&e)) {
                ws.map.remove(&op)
            } else {
                None
            }
        };
        match w {
            // The receiver is gone if the operation was cancelled
            Some(w) => {
                let _ = w.tx.send(e);
            }
            None => debug!("Unsolicited event on {}: {e:?}", self.link),
        }
    }

    /// Fails all pending operations, except for a pending connection attempt,
    /// which is completed by `e`.
    fn disconnected(&self, status: ConnStatus, e: &ClientEvent) {
        let ws: Vec<Waiter> = self.waiters.lock().map.drain().map(|(_, w)| w).collect();
        let n = ws.len();
        for w in ws {
            if w.matches(e) {
                let _ = w.tx.send(e.clone());
            }
        }
        drop(self.rediscovery.lock().take());
        debug!("Disconnected from {} ({status}), {n} operation(s) completed", self.link);
        if !status.is_peer_graceful() && !self.cfg.auto_connect {
            self.close();
        }
    }

    /// Starts service rediscovery unless a discovery is already in progress,
    /// in which case its result reflects the change.
    fn service_changed(&self) {
        let Some(g) = self.lock.try_acquire(self.link, FeatureClass::ServicesDiscovered) else {
            debug!("Service changed on {} during discovery", self.link);
            return;
        };
        debug!("Service changed on {}, rediscovering", self.link);
        let prev = self.rediscovery.lock().replace(g);
        drop(prev);
        if let Err(st) = self.t.discover_services() {
            warn!("Service rediscovery on {} rejected: {st}", self.link);
            drop(self.rediscovery.lock().take());
        }
    }

    /// Returns the error of an operation that found the client closed.
    fn closed_error(&self) -> Error {
        if self.user_closed.load(Ordering::Acquire) {
            Error::Closed
        } else {
            Error::DeviceDisconnected
        }
    }

    fn notify(&self, n: Notification) {
        trace!("Notification from {}: {n:?}", self.link);
        self.subs.lock().retain(|tx| tx.send(n.clone()).is_ok());
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!("Closing client for {}", self.link);
        self.closed.cancel();
        self.t.close();
        self.waiters.lock().map.clear();
        self.subs.lock().clear();
        drop(self.rediscovery.lock().take());
        if self.session.state().phase != ConnState::Disconnected {
            (self.session).set_phase(ConnState::Disconnected, ConnStatus::TerminateLocalHost);
        }
    }
}

impl<T: Transport> ClientCallback for Inner<T> {
    fn on_event(&self, e: ClientEvent) {
        trace!("{}: {e:?}", self.link);
        if self.closed.is_cancelled() {
            return;
        }
        self.session.update(&e);
        match e {
            ClientEvent::ConnectionStateChanged {
                status,
                state: ConnState::Disconnected,
            } => return self.disconnected(status, &e),
            ClientEvent::ServiceChanged => return self.service_changed(),
            ClientEvent::CharacteristicChanged { hdl, value } => {
                return self.notify(Notification { hdl, value })
            }
            ClientEvent::ServicesDiscovered { .. } => {
                let g = self.rediscovery.lock().take();
                drop(g);
            }
            _ => {}
        }
        self.complete(e);
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Default)]
struct Waiters {
    next_id: u64,
    map: HashMap<FeatureClass, Waiter>,
}

/// Suspended operation awaiting its completion event.
struct Waiter {
    id: u64,
    hdl: Option<Handle>,
    accept: Accept,
    tx: oneshot::Sender<ClientEvent>,
}

impl Waiter {
    /// Returns whether event `e` completes the operation.
    #[inline]
    fn matches(&self, e: &ClientEvent) -> bool {
        (self.accept)(e) && (self.hdl.is_none() || e.handle() == self.hdl)
    }
}

impl Debug for Waiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Waiter"))
            .field("id", &self.id)
            .field("hdl", &self.hdl)
            .finish_non_exhaustive()
    }
}

/// Guard that unregisters an operation waiter when dropped. If the operation
/// has not completed, the outstanding transport call is cancelled.
#[derive(Debug)]
struct WaiterGuard<'a, T: Transport> {
    inner: &'a Inner<T>,
    op: FeatureClass,
    id: u64,
}

impl<T: Transport> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        let w = {
            let mut ws = self.inner.waiters.lock();
            if ws.map.get(&self.op).map_or(false, |w| w.id == self.id) {
                ws.map.remove(&self.op)
            } else {
                None
            }
        };
        // Operation did not complete
        if w.is_some() {
            self.inner.t.cancel(self.op);
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use matches::assert_matches;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::client::{self, Client, Config, Notification};
use crate::event::{ClientEvent, ServerEvent};
use crate::gatt::*;
use crate::le::{Addr, Link, RawAddr};
use crate::lock::{FeatureClass, RequestLock};
use crate::request::RequestId;

use super::*;

const SERVER: Addr = Addr::Public(RawAddr::from_le_bytes([0x01, 0, 0, 0, 0, 0xA0]));

const fn device(i: u8) -> Addr {
    Addr::Random(RawAddr::from_le_bytes([i, 0, 0, 0, 0, 0xC0]))
}

#[derive(Clone, Copy, Debug)]
struct Handles {
    /// Read and write with response.
    a: Handle,
    /// Read and write with or without response.
    b: Handle,
    /// Read and notify.
    n: Handle,
    /// Indicate only.
    i: Handle,
    /// 300-byte read-only value.
    long: Handle,
}

fn schema() -> (Arc<Schema>, ValueStore, Handles) {
    let mut b = Schema::build();
    let (_, h) = b.primary_service(uuid16(0xFFF0), |s| {
        let rw = Prop::READ | Prop::WRITE;
        let (a, _) = s.characteristic(uuid16(0xFFF1), rw, [0x01_u8], |_| ());
        let (b, _) = s.characteristic(uuid16(0xFFF2), rw | Prop::WRITE_CMD, [0_u8], |_| ());
        let (n, _) = s.characteristic(uuid16(0xFFF3), Prop::READ | Prop::NOTIFY, [0_u8], |_| ());
        let (i, _) = s.characteristic(uuid16(0xFFF4), Prop::INDICATE, Vec::new(), |_| ());
        let (long, _) = s.characteristic(uuid16(0xFFF5), Prop::READ, vec![0xAB; 300], |_| ());
        Handles { a, b, n, i, long }
    });
    let (schema, vals) = b.freeze();
    (schema, vals, h)
}

/// Hub with one registered [`Peripheral`] and a shared client lock.
struct Sim {
    hub: Hub,
    lock: RequestLock,
    per: Arc<Peripheral>,
    h: Handles,
}

impl Sim {
    fn new() -> Self {
        Self::with(|p| p)
    }

    fn with(f: impl FnOnce(Peripheral) -> Peripheral) -> Self {
        crate::init_log();
        let hub = Hub::new();
        let (schema, vals, h) = schema();
        let per = f(Peripheral::new(SERVER, schema, vals)).register(&hub).unwrap();
        Self {
            hub,
            lock: RequestLock::new(),
            per,
            h,
        }
    }

    fn client(&self, i: u8) -> Client<SimTransport> {
        client(&self.hub, &self.lock, i, Config::default())
    }
}

fn client(hub: &Hub, lock: &RequestLock, i: u8, cfg: Config) -> Client<SimTransport> {
    let link = Link::new(SERVER, device(i));
    let t = SimTransport::new(hub.clone(), link, PairingParams::default());
    Client::new(t, lock.clone(), cfg)
}

/// Returns a hub with a server whose requests are delivered to a channel.
fn manual() -> (Hub, Handles, mpsc::UnboundedReceiver<ServerEvent>) {
    crate::init_log();
    let hub = Hub::new();
    let (schema, _, h) = schema();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();
    hub.register_server(SERVER, Arc::new(tx), schema).unwrap();
    (hub, h, rx)
}

/// Returns the next request received by a manual server, skipping all other
/// events.
async fn next_request(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> (Addr, RequestId) {
    loop {
        let e = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no server request")
            .expect("server channel closed");
        match e {
            ServerEvent::CharacteristicReadRequest { device, id, .. }
            | ServerEvent::CharacteristicWriteRequest { device, id, .. }
            | ServerEvent::DescriptorReadRequest { device, id, .. }
            | ServerEvent::DescriptorWriteRequest { device, id, .. }
            | ServerEvent::ExecuteWrite { device, id, .. } => return (device, id),
            _ => {}
        }
    }
}

#[tokio::test]
async fn reliable_write_abort_execute() {
    let s = Sim::new();
    let (c, a) = (s.client(1), s.h.a);
    c.connect().await.unwrap();
    assert_eq!(c.read_characteristic(a).await.unwrap(), [0x01]);

    c.begin_reliable_write().await.unwrap();
    (c.write_characteristic(a, &[0x02], WriteType::WithResponse))
        .await
        .unwrap();
    assert_eq!(s.per.value(a), Some(vec![0x01]));
    assert_eq!(s.per.pending(device(1), a), Some(vec![0x02]));
    // Prepared values are not visible to reads
    assert_eq!(c.read_characteristic(a).await.unwrap(), [0x01]);
    c.abort_reliable_write().await.unwrap();
    assert_eq!(s.per.pending(device(1), a), None);
    assert_eq!(c.read_characteristic(a).await.unwrap(), [0x01]);

    c.begin_reliable_write().await.unwrap();
    (c.write_characteristic(a, &[0x02], WriteType::WithResponse))
        .await
        .unwrap();
    assert_eq!(c.read_characteristic(a).await.unwrap(), [0x01]);
    c.execute_reliable_write().await.unwrap();
    assert_eq!(c.read_characteristic(a).await.unwrap(), [0x02]);
    assert!(!s.hub.pairing(c.link()).unwrap().is_reliable_write());
    assert_eq!(s.hub.pending_requests(), 0);
}

#[tokio::test]
async fn reliable_write_commits_all() {
    let s = Sim::new();
    let (c, h) = (s.client(1), s.h);
    c.connect().await.unwrap();
    c.begin_reliable_write().await.unwrap();
    let wt = WriteType::WithResponse;
    c.write_characteristic(h.a, &[0x0A], wt).await.unwrap();
    c.write_characteristic(h.b, &[0x0B], wt).await.unwrap();
    assert_eq!(s.per.value(h.a), Some(vec![0x01]));
    assert_eq!(s.per.value(h.b), Some(vec![0x00]));

    // Another client does not observe or affect the transaction
    let c2 = s.client(2);
    c2.connect().await.unwrap();
    c2.write_characteristic(h.b, &[0x0C], wt).await.unwrap();
    assert_eq!(c2.read_characteristic(h.a).await.unwrap(), [0x01]);

    c.execute_reliable_write().await.unwrap();
    assert_eq!(s.per.value(h.a), Some(vec![0x0A]));
    assert_eq!(c2.read_characteristic(h.b).await.unwrap(), [0x0B]);
}

#[tokio::test]
async fn prepared_values_discarded_on_disconnect() {
    let s = Sim::new();
    let c = s.client(1);
    c.connect().await.unwrap();
    c.begin_reliable_write().await.unwrap();
    (c.write_characteristic(s.h.a, &[0x05], WriteType::WithResponse))
        .await
        .unwrap();
    assert!(s.per.pending(device(1), s.h.a).is_some());
    c.disconnect().await.unwrap();
    assert_eq!(s.per.pending(device(1), s.h.a), None);
    assert_eq!(s.per.value(s.h.a), Some(vec![0x01]));
}

#[tokio::test]
async fn notifications() {
    let s = Sim::new();
    let (c, n) = (s.client(1), s.h.n);
    let mut ns = c.notifications();
    c.connect().await.unwrap();
    let services = c.discover_services().await.unwrap();
    let cccd = services.characteristic(n).unwrap().cccd().unwrap();

    // Values are only delivered to subscribed clients
    assert!(!s.per.notify(&s.hub, device(1), n, &[5]).unwrap());
    assert!(ns.try_recv().is_none());
    assert_eq!(s.per.value(n), Some(vec![5]));

    c.set_notifying(n, true).await.unwrap();
    assert_eq!(c.read_descriptor(cccd).await.unwrap(), Cccd::NOTIFY.to_bytes());
    let mut ev = s.per.events();
    assert!(s.per.notify(&s.hub, device(1), n, &[6]).unwrap());
    let v = timeout(Duration::from_secs(1), ns.recv()).await.unwrap();
    assert_eq!(v, Some(Notification { hdl: n, value: vec![6] }));
    assert_matches!(
        ev.try_recv(),
        Ok(ServerEvent::NotificationSent {
            status: Status::Success,
            ..
        })
    );

    c.set_notifying(n, false).await.unwrap();
    assert_eq!(c.read_descriptor(cccd).await.unwrap(), [0, 0]);
    assert!(!s.per.notify(&s.hub, device(1), n, &[7]).unwrap());
    assert!(ns.try_recv().is_none());
}

#[tokio::test]
async fn indications() {
    let s = Sim::new();
    let (c, i) = (s.client(1), s.h.i);
    let mut ns = c.notifications();
    c.connect().await.unwrap();
    let services = c.discover_services().await.unwrap();
    let cccd = services.characteristic(i).unwrap().cccd().unwrap();
    c.set_notifying(i, true).await.unwrap();
    assert_eq!(
        c.read_descriptor(cccd).await.unwrap(),
        Cccd::INDICATE.to_bytes()
    );
    assert!(s.per.notify(&s.hub, device(1), i, &[1, 2]).unwrap());
    assert_eq!(ns.try_recv().unwrap().value, [1, 2]);

    // Notifications are not permitted
    assert_matches!(
        s.hub.notify_characteristic_changed(SERVER, device(1), i, false, &[3]),
        Err(Error::NotSupported(_))
    );
    // Reads are not permitted
    assert_matches!(
        c.read_characteristic(i).await,
        Err(client::Error::OperationFailed {
            op: FeatureClass::CharacteristicRead,
            status: Status::ReadNotPermitted,
        })
    );
    assert_matches!(
        c.set_notifying(s.h.a, true).await,
        Err(client::Error::Rejected {
            reason: Status::RequestNotSupported,
            ..
        })
    );
    assert_matches!(
        c.set_notifying(Handle::new(0x0F00).unwrap(), true).await,
        Err(client::Error::InvalidHandle(_))
    );
}

#[tokio::test]
async fn stale_response() {
    let (hub, h, mut rx) = manual();
    let c = client(&hub, &RequestLock::new(), 1, Config::default());
    c.connect().await.unwrap();
    let read = tokio::spawn({
        let c = c.clone();
        async move { c.read_characteristic(h.a).await }
    });
    let (dev, id) = next_request(&mut rx).await;
    assert_eq!(dev, device(1));
    hub.send_response(dev, id, Status::Success, 0, Some(&[7]))
        .unwrap();
    assert_eq!(read.await.unwrap().unwrap(), [7]);

    assert_matches!(
        hub.send_response(dev, id, Status::Success, 0, Some(&[8])),
        Err(Error::StaleRequest(e)) if e.id == id
    );
    assert_eq!(hub.pending_requests(), 0);
}

#[tokio::test]
async fn response_from_wrong_device() {
    let (hub, h, mut rx) = manual();
    let c = client(&hub, &RequestLock::new(), 1, Config::default());
    c.connect().await.unwrap();
    let read = tokio::spawn({
        let c = c.clone();
        async move { c.read_characteristic(h.a).await }
    });
    let (dev, id) = next_request(&mut rx).await;
    assert_matches!(
        hub.send_response(device(9), id, Status::Success, 0, Some(&[9])),
        Err(Error::StaleRequest(_))
    );
    // The request is still outstanding for its own client
    assert_eq!(hub.pending_requests(), 1);
    hub.send_response(dev, id, Status::Success, 0, Some(&[4]))
        .unwrap();
    assert_eq!(read.await.unwrap().unwrap(), [4]);
    assert_eq!(hub.pending_requests(), 0);
}

#[tokio::test]
async fn disconnect_during_operation() {
    let (hub, h, mut rx) = manual();
    let lock = RequestLock::new();
    let c = client(&hub, &lock, 1, Config::default());
    c.connect().await.unwrap();
    let read = tokio::spawn({
        let c = c.clone();
        async move { c.read_characteristic(h.a).await }
    });
    let (dev, id) = next_request(&mut rx).await;
    assert!(lock.is_locked(c.link(), FeatureClass::CharacteristicRead));
    assert_eq!(hub.pending_requests(), 1);
    // Queued behind the first read
    let queued = tokio::spawn({
        let c = c.clone();
        async move { c.read_characteristic(h.b).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!queued.is_finished());
    assert_eq!(hub.pending_requests(), 1);

    hub.link_loss(c.link()).unwrap();
    assert_matches!(read.await.unwrap(), Err(client::Error::DeviceDisconnected));
    assert_matches!(queued.await.unwrap(), Err(client::Error::DeviceDisconnected));
    assert!(!lock.is_locked(c.link(), FeatureClass::CharacteristicRead));
    assert_eq!(hub.pending_requests(), 0);
    assert_matches!(
        hub.send_response(dev, id, Status::Success, 0, None),
        Err(Error::StaleRequest(_))
    );

    // Link loss closes the client, but operations still report the lost link
    assert!(c.is_closed());
    assert_eq!(c.session().state().status, ConnStatus::LinkLoss);
    assert_matches!(c.read_phy().await, Err(client::Error::DeviceDisconnected));
    assert_matches!(
        c.read_characteristic(h.a).await,
        Err(client::Error::DeviceDisconnected)
    );
    c.disconnect().await.unwrap();
    assert_eq!(lock.active(), 0);

    c.close();
    assert_matches!(c.read_phy().await, Err(client::Error::Closed));
    assert_matches!(c.disconnect().await, Err(client::Error::Closed));
}

#[tokio::test]
async fn timeout_releases_lock() {
    let (hub, h, mut rx) = manual();
    let lock = RequestLock::new();
    let cfg = Config {
        op_timeout: Some(Duration::from_millis(50)),
        ..Config::default()
    };
    let c = client(&hub, &lock, 1, cfg);
    c.connect().await.unwrap();
    assert_matches!(
        c.read_characteristic(h.a).await,
        Err(client::Error::Timeout(FeatureClass::CharacteristicRead))
    );
    assert!(!lock.is_locked(c.link(), FeatureClass::CharacteristicRead));

    assert_eq!(hub.pending_requests(), 0);

    // A late response does not complete the next operation
    let (dev, late) = next_request(&mut rx).await;
    let read = tokio::spawn({
        let c = c.clone();
        async move { c.read_characteristic(h.a).await }
    });
    let (_, id) = next_request(&mut rx).await;
    assert!(id > late);
    assert_matches!(
        hub.send_response(dev, late, Status::Success, 0, Some(&[1])),
        Err(Error::StaleRequest(_))
    );
    hub.send_response(dev, id, Status::Success, 0, Some(&[2]))
        .unwrap();
    assert_eq!(read.await.unwrap().unwrap(), [2]);
    assert!(c.is_connected());
}

#[tokio::test]
async fn cancelled_operation() {
    let (hub, h, mut rx) = manual();
    let lock = RequestLock::new();
    let c = client(&hub, &lock, 1, Config::default());
    c.connect().await.unwrap();
    let read = tokio::spawn({
        let c = c.clone();
        async move { c.read_characteristic(h.a).await }
    });
    let (dev, id) = next_request(&mut rx).await;
    read.abort();
    let _ = read.await;
    assert!(!lock.is_locked(c.link(), FeatureClass::CharacteristicRead));

    assert_eq!(hub.pending_requests(), 0);
    assert_matches!(
        hub.send_response(dev, id, Status::Success, 0, Some(&[1])),
        Err(Error::StaleRequest(_))
    );
    let write = tokio::spawn({
        let c = c.clone();
        async move { c.write_characteristic(h.a, &[3], WriteType::WithResponse).await }
    });
    let (_, id) = next_request(&mut rx).await;
    hub.send_response(dev, id, Status::WriteNotPermitted, 0, None)
        .unwrap();
    assert_matches!(
        write.await.unwrap(),
        Err(client::Error::OperationFailed {
            op: FeatureClass::CharacteristicWrite,
            status: Status::WriteNotPermitted,
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients() {
    const CLIENTS: u8 = 10;
    const ITERS: usize = 20;
    let s = Sim::new();
    let tasks: Vec<_> = (1..=CLIENTS)
        .map(|i| {
            let (c, h) = (s.client(i), s.h);
            tokio::spawn(async move {
                c.connect().await.unwrap();
                let services = c.discover_services().await.unwrap();
                let cccd = services.characteristic(h.n).unwrap().cccd().unwrap();
                for _ in 0..ITERS {
                    let (a, b, rssi, d, mtu) = tokio::join!(
                        c.read_characteristic(h.a),
                        c.read_characteristic(h.a),
                        c.read_rssi(),
                        c.read_descriptor(cccd),
                        c.request_mtu(64),
                    );
                    assert_eq!(a.unwrap(), [0x01]);
                    assert_eq!(b.unwrap(), [0x01]);
                    assert_eq!(rssi.unwrap(), -40);
                    assert_eq!(d.unwrap(), [0, 0]);
                    assert_eq!(mtu.unwrap(), 64);
                }
                c.disconnect().await.unwrap();
            })
        })
        .collect();
    let join = async {
        for t in tasks {
            t.await.unwrap();
        }
    };
    timeout(Duration::from_secs(30), join)
        .await
        .expect("clients deadlocked");
    assert_eq!(s.lock.active(), 0);
    assert_eq!(s.hub.pending_requests(), 0);
    assert!(s.hub.clients(SERVER).is_empty());
}

#[tokio::test]
async fn link_parameters() {
    let s = Sim::with(|p| p.with_max_mtu(185));
    let c = s.client(1);
    c.connect().await.unwrap();

    // Reads are limited by the MTU
    assert_eq!(c.read_characteristic(s.h.long).await.unwrap().len(), 22);
    let mut mtu = c.mtu();
    assert_eq!(c.request_mtu(247).await.unwrap(), 185);
    assert!(mtu.has_changed().unwrap());
    assert_eq!(*mtu.borrow_and_update(), 185);
    assert_eq!(c.read_characteristic(s.h.long).await.unwrap().len(), 184);

    assert_eq!(c.read_phy().await.unwrap(), (Phy::Le1M, Phy::Le1M));
    let (tx, rx) = (PhyMask::LE_2M | PhyMask::LE_1M, PhyMask::LE_CODED);
    let phy = c.set_phy(tx, rx, PhyOption::S8).await.unwrap();
    assert_eq!(phy, (Phy::Le2M, Phy::LeCoded));
    assert_eq!(c.session().phy(), phy);
    let phy = (c.set_phy(PhyMask::empty(), PhyMask::LE_1M, PhyOption::NoPreferred))
        .await
        .unwrap();
    assert_eq!(phy, (Phy::Le2M, Phy::Le1M));

    assert_eq!(c.read_rssi().await.unwrap(), -40);
    c.request_connection_priority(Priority::High).unwrap();
    let p = s.hub.pairing(c.link()).unwrap();
    assert_eq!(p.params().priority, Priority::High);
    assert_eq!(p.params().mtu, 185);

    // The MTU is reset on disconnection
    c.disconnect().await.unwrap();
    assert_eq!(c.session().mtu(), MIN_MTU);
}

#[tokio::test]
async fn custom_params() {
    let s = Sim::new();
    let link = Link::new(SERVER, device(1));
    let params = PairingParams {
        mtu: 1000,
        rssi: -70,
        ..PairingParams::default()
    };
    let t = SimTransport::new(s.hub.clone(), link, params);
    let c = Client::new(t, s.lock.clone(), Config::default());
    c.connect().await.unwrap();
    assert_eq!(c.read_rssi().await.unwrap(), -70);
    assert_eq!(s.hub.pairing(link).unwrap().params().mtu, MAX_MTU);
}

#[tokio::test]
async fn initial_mtu() {
    let s = Sim::with(|p| p.with_max_mtu(185));
    let mut ev = s.per.events();
    let link = Link::new(SERVER, device(1));
    let params = PairingParams {
        mtu: 100,
        ..PairingParams::default()
    };
    let c = Client::new(
        SimTransport::new(s.hub.clone(), link, params),
        s.lock.clone(),
        Config::default(),
    );
    c.connect().await.unwrap();
    assert_eq!(c.session().mtu(), 100);
    assert_eq!(s.hub.pairing(link).unwrap().params().mtu, 100);
    assert_matches!(
        ev.try_recv(),
        Ok(ServerEvent::ConnectionStateChanged {
            state: ConnState::Connected,
            ..
        })
    );
    assert_matches!(ev.try_recv(), Ok(ServerEvent::MtuChanged { mtu: 100, .. }));
    // Reads and notifications use the same MTU
    assert_eq!(c.read_characteristic(s.h.long).await.unwrap().len(), 99);
    let mut ns = c.notifications();
    c.discover_services().await.unwrap();
    c.set_notifying(s.h.n, true).await.unwrap();
    assert!(s.per.notify(&s.hub, device(1), s.h.n, &[1; 200]).unwrap());
    assert_eq!(ns.try_recv().unwrap().value.len(), 97);

    // The default MTU is not announced
    let c2 = s.client(2);
    c2.connect().await.unwrap();
    assert_eq!(c2.session().mtu(), MIN_MTU);
    assert!(!std::iter::from_fn(|| ev.try_recv().ok())
        .any(|e| matches!(e, ServerEvent::MtuChanged { device: d, .. } if d == device(2))));
}

#[tokio::test]
async fn failed_subscription() {
    let (hub, h, mut rx) = manual();
    let c = client(&hub, &RequestLock::new(), 1, Config::default());
    c.connect().await.unwrap();
    c.discover_services().await.unwrap();
    let sub = tokio::spawn({
        let c = c.clone();
        async move { c.set_notifying(h.n, true).await }
    });
    let (dev, id) = next_request(&mut rx).await;
    hub.send_response(dev, id, Status::WriteNotPermitted, 0, None)
        .unwrap();
    assert_matches!(
        sub.await.unwrap(),
        Err(client::Error::OperationFailed {
            op: FeatureClass::DescriptorWrite,
            status: Status::WriteNotPermitted,
        })
    );
    assert!(!hub.pairing(c.link()).unwrap().is_notifying(h.n));
    assert!(!hub
        .notify_characteristic_changed(SERVER, dev, h.n, false, &[1])
        .unwrap());
}

#[tokio::test]
async fn service_changed() {
    let s = Sim::new();
    let c = s.client(1);
    c.connect().await.unwrap();
    let old = c.discover_services().await.unwrap();
    let mut services = c.services();

    let mut b = Schema::build();
    b.primary_service(uuid16(0x180F), |sb| {
        sb.characteristic(uuid16(0x2A19), Prop::READ, [100_u8], |_| ());
    });
    let (new, _) = b.freeze();
    s.hub.update_services(SERVER, Arc::clone(&new)).unwrap();

    // Rediscovery completes without a client call
    timeout(Duration::from_secs(1), services.changed())
        .await
        .unwrap()
        .unwrap();
    let cur = c.session().services().unwrap();
    assert!(Arc::ptr_eq(&cur, &new));
    assert!(!Arc::ptr_eq(&cur, &old));
    assert!(!s.lock.is_locked(c.link(), FeatureClass::ServicesDiscovered));
    assert!(Arc::ptr_eq(&c.discover_services().await.unwrap(), &new));
}

#[tokio::test]
async fn peer_disconnect_keeps_client_open() {
    let s = Sim::new();
    let c = s.client(1);
    let mut ev = s.per.events();
    c.connect().await.unwrap();
    assert_eq!(s.hub.clients(SERVER), [device(1)]);

    s.hub.cancel_connection(c.link()).unwrap();
    assert!(!c.is_connected());
    assert!(!c.is_closed());
    assert_eq!(c.session().state().status, ConnStatus::TerminatePeerUser);
    assert_matches!(
        c.read_characteristic(s.h.a).await,
        Err(client::Error::DeviceDisconnected)
    );
    assert_matches!(
        ev.try_recv(),
        Ok(ServerEvent::ConnectionStateChanged {
            state: ConnState::Connected,
            ..
        })
    );
    assert_matches!(
        ev.try_recv(),
        Ok(ServerEvent::ConnectionStateChanged {
            status: ConnStatus::TerminateLocalHost,
            state: ConnState::Disconnected,
            ..
        })
    );

    // Reconnect
    c.connect().await.unwrap();
    assert_eq!(c.read_characteristic(s.h.a).await.unwrap(), [0x01]);
}

#[tokio::test]
async fn local_disconnect_closes_client() {
    let s = Sim::new();
    let c = s.client(1);
    c.connect().await.unwrap();
    c.connect().await.unwrap();
    c.disconnect().await.unwrap();
    assert!(c.is_closed());
    assert_eq!(c.session().state().status, ConnStatus::TerminateLocalHost);
    assert!(s.hub.pairing(c.link()).is_none());
    assert_matches!(c.connect().await, Err(client::Error::Closed));
}

#[tokio::test]
async fn unknown_server() {
    crate::init_log();
    let hub = Hub::new();
    let c = client(&hub, &RequestLock::new(), 1, Config::default());
    assert_matches!(
        c.connect().await,
        Err(client::Error::ConnectionFailed(
            ConnStatus::FailedToEstablish
        ))
    );
    assert!(c.is_closed());
}

#[tokio::test]
async fn server_unregistered() {
    let s = Sim::new();
    let c = s.client(1);
    c.connect().await.unwrap();
    s.hub.unregister_server(SERVER).unwrap();
    assert!(!s.hub.is_registered(SERVER));
    assert_eq!(c.session().state().status, ConnStatus::LinkLoss);
    assert!(c.is_closed());
    assert_matches!(s.hub.unregister_server(SERVER), Err(Error::UnknownServer(_)));
}

#[tokio::test]
async fn write_without_response() {
    let s = Sim::new();
    let c = s.client(1);
    c.connect().await.unwrap();
    (c.write_characteristic(s.h.b, &[9], WriteType::WithoutResponse))
        .await
        .unwrap();
    assert_eq!(s.per.value(s.h.b), Some(vec![9]));
    assert_eq!(s.hub.pending_requests(), 0);

    assert_matches!(
        c.write_characteristic(s.h.a, &[9], WriteType::WithoutResponse)
            .await,
        Err(client::Error::OperationFailed {
            op: FeatureClass::CharacteristicWrite,
            status: Status::WriteNotPermitted,
        })
    );
    assert_matches!(
        c.write_characteristic(s.h.a, &[0; 600], WriteType::WithResponse)
            .await,
        Err(client::Error::OperationFailed {
            status: Status::InvalidAttributeValueLength,
            ..
        })
    );
}

#[tokio::test]
async fn bonding() {
    let s = Sim::new();
    let c = s.client(1);
    let mut bond = c.bond_state();
    c.connect().await.unwrap();
    c.create_bond().await.unwrap();
    assert!(bond.has_changed().unwrap());
    assert_eq!(*bond.borrow_and_update(), BondState::Bonded);
    c.create_bond().await.unwrap();
    assert!(!bond.has_changed().unwrap());
}

#[tokio::test]
async fn transport_errors() {
    let s = Sim::new();
    let c = s.client(1);
    assert_matches!(c.read_rssi().await, Err(client::Error::DeviceDisconnected));
    c.connect().await.unwrap();
    let bad = Handle::new(0x0F00).unwrap();
    assert_matches!(
        c.read_characteristic(bad).await,
        Err(client::Error::Rejected {
            op: FeatureClass::CharacteristicRead,
            reason: Status::InvalidHandle,
        })
    );
    assert_matches!(
        c.write_descriptor(bad, &[1]).await,
        Err(client::Error::Rejected {
            reason: Status::InvalidHandle,
            ..
        })
    );
    assert!(!s.lock.is_locked(c.link(), FeatureClass::CharacteristicRead));
}

#[test]
fn hub_errors() {
    crate::init_log();
    let hub = Hub::new();
    let (schema, _, h) = schema();
    let (stx, _srx) = mpsc::unbounded_channel::<ServerEvent>();
    let api = Arc::new(stx);
    hub.register_server(SERVER, Arc::clone(&api) as _, Arc::clone(&schema))
        .unwrap();
    assert_matches!(
        hub.register_server(SERVER, api, schema),
        Err(Error::AlreadyRegistered(_))
    );

    let link = Link::new(SERVER, device(1));
    let (ctx, mut crx) = mpsc::unbounded_channel::<ClientEvent>();
    let cb = Arc::new(ctx);
    assert_matches!(hub.read_phy(link), Err(Error::NotConnected(_)));
    hub.connect(link, Arc::downgrade(&cb) as _, PairingParams::default())
        .unwrap();
    assert_matches!(
        crx.try_recv(),
        Ok(ClientEvent::ConnectionStateChanged {
            state: ConnState::Connected,
            ..
        })
    );
    assert_matches!(
        hub.connect(link, Arc::downgrade(&cb) as _, PairingParams::default()),
        Err(Error::AlreadyConnected(_))
    );
    assert_matches!(
        hub.set_characteristic_notification(link, h.a, true),
        Err(Error::NotSupported(_))
    );
    assert_matches!(
        hub.notify_characteristic_changed(SERVER, device(2), h.n, false, &[1]),
        Err(Error::NotConnected(_))
    );
    assert_matches!(
        hub.read_descriptor(link, h.a),
        Err(Error::InvalidHandle(_))
    );

    // Events are dropped once the client is gone
    drop(cb);
    hub.read_phy(link).unwrap();
    hub.close(link);
    hub.close(link);
    assert!(hub.pairing(link).is_none());
}

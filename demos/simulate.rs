#![allow(unused_crate_dependencies)]
#![allow(clippy::print_stdout)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Barrier;
use tracing::info;

use gattlink::client::{Client, Config};
use gattlink::gatt::{uuid16, Handle, Prop, Schema, WriteType};
use gattlink::le::{Addr, Link, RawAddr};
use gattlink::lock::RequestLock;
use gattlink::sim::{Hub, PairingParams, Peripheral, SimTransport};

#[derive(Clone, Debug, clap::Parser)]
struct Args {
    /// Number of simulated clients.
    #[arg(short, long, default_value_t = 3)]
    clients: u8,

    /// MTU requested by each client.
    #[arg(short, long, default_value_t = 247)]
    mtu: u16,

    /// Client configuration as JSON (e.g. '{"op_timeout":{"secs":5,"nanos":0}}').
    #[arg(long)]
    config: Option<String>,

    /// Number of battery level notifications sent by the peripheral.
    #[arg(short, long, default_value_t = 5)]
    notifications: u8,
}

#[derive(Clone, Copy, Debug)]
struct Handles {
    battery: Handle,
    name: Handle,
    mode: Handle,
}

const SERVER: Addr = Addr::Public(RawAddr::from_le_bytes([0x01, 0x00, 0x00, 0x5E, 0xED, 0xC0]));

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let cfg: Config = match args.config {
        Some(ref s) => serde_json::from_str(s)?,
        None => Config::default(),
    };
    info!("Client configuration: {}", serde_json::to_string(&cfg)?);

    let mut db = Schema::build();
    let (_, battery) = db.primary_service(uuid16(0x180F), |s| {
        let props = Prop::READ | Prop::NOTIFY;
        s.characteristic(uuid16(0x2A19), props, [100_u8], |_| ()).0
    });
    let (_, (name, mode)) = db.primary_service(uuid16(0xFFF0), |s| {
        let props = Prop::READ | Prop::WRITE;
        let name = s.characteristic(uuid16(0xFFF1), props, *b"unnamed", |_| ()).0;
        let mode = s.characteristic(uuid16(0xFFF2), props, [0_u8], |_| ()).0;
        (name, mode)
    });
    let h = Handles {
        battery,
        name,
        mode,
    };
    let (schema, vals) = db.freeze();
    let hub = Hub::new();
    let per = Peripheral::new(SERVER, schema, vals).register(&hub)?;

    let lock = RequestLock::new();
    let ready = Arc::new(Barrier::new(usize::from(args.clients) + 1));
    let clients: Vec<_> = (1..=args.clients)
        .map(|i| {
            let dev = Addr::Random(RawAddr::from_le_bytes([i, 0, 0, 0, 0, 0xC0]));
            let t = SimTransport::new(hub.clone(), Link::new(SERVER, dev), PairingParams::default());
            let c = Client::new(t, lock.clone(), cfg);
            let ready = Arc::clone(&ready);
            tokio::spawn(run_client(c, h, args.mtu, args.notifications, ready))
        })
        .collect();

    // Wait for all clients to subscribe
    ready.wait().await;
    for level in (0..args.notifications).map(|n| 100_u8.saturating_sub(n)) {
        for dev in hub.clients(SERVER) {
            per.notify(&hub, dev, h.battery, &[level])?;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for c in clients {
        c.await??;
    }
    println!(
        "Final values: name={:?} mode={:?}",
        String::from_utf8_lossy(&per.value(h.name).unwrap_or_default()),
        per.value(h.mode)
    );
    Ok(())
}

async fn run_client(
    c: Client<SimTransport>,
    h: Handles,
    mtu: u16,
    notifications: u8,
    ready: Arc<Barrier>,
) -> Result<()> {
    let dev = c.link().client;
    let mut ns = c.notifications();
    c.connect().await?;
    let mtu = c.request_mtu(mtu).await?;
    let services = c.discover_services().await?;
    info!("{dev}: MTU {mtu}, {} services", services.services().len());
    c.set_notifying(h.battery, true).await?;
    ready.wait().await;

    // Update both settings atomically
    let name = format!("client-{}", dev.raw());
    c.begin_reliable_write().await?;
    c.write_characteristic(h.name, name.as_bytes(), WriteType::WithResponse)
        .await?;
    c.write_characteristic(h.mode, &[1], WriteType::WithResponse)
        .await?;
    c.execute_reliable_write().await?;
    let v = c.read_characteristic(h.name).await?;
    info!("{dev}: name is {:?}", String::from_utf8_lossy(&v));

    for _ in 0..notifications {
        let Some(n) = ns.recv().await else { break };
        info!("{dev}: battery level {}%", n.value.first().copied().unwrap_or_default());
    }
    let (rssi, phy) = (c.read_rssi().await?, c.read_phy().await?);
    println!("{dev}: RSSI {rssi} dBm, PHY {phy:?}");
    c.disconnect().await?;
    Ok(())
}

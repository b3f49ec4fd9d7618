//! End-to-end scenarios against the booted demo plant: live Modbus over
//! TCP, safety trips, grid response, segmentation, and deterministic
//! stepped replay.

use gridforge_core::{EventKind, MemKey, MemValue, MemorySnapshot};
use gridforge_sim::catalogue::{demo_plant_stepped, TURBINES};
use gridforge_sim::Orchestrator;
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn boot_stepped() -> Orchestrator {
    let (config, parts) = demo_plant_stepped();
    Orchestrator::boot(config, parts).await.unwrap()
}

fn adu(transaction: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + pdu.len());
    out.extend_from_slice(&transaction.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    out.push(unit);
    out.extend_from_slice(pdu);
    out
}

async fn exchange(stream: &mut TcpStream, request: &[u8]) -> Vec<u8> {
    stream.write_all(request).await.unwrap();
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await.unwrap();
    pdu
}

/// FC 06 write through an open session.
async fn write_register(stream: &mut TcpStream, unit: u8, addr: u16, value: u16) {
    let mut pdu = vec![0x06];
    pdu.extend_from_slice(&addr.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    let resp = exchange(stream, &adu(1, unit, &pdu)).await;
    assert_eq!(resp[0], 0x06, "write rejected: {resp:02X?}");
}

/// FC 05 write through an open session.
async fn write_coil(stream: &mut TcpStream, unit: u8, addr: u16, on: bool) {
    let mut pdu = vec![0x05];
    pdu.extend_from_slice(&addr.to_be_bytes());
    pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
    let resp = exchange(stream, &adu(2, unit, &pdu)).await;
    assert_eq!(resp[0], 0x05, "write rejected: {resp:02X?}");
}

/// FC 03 read of a single holding register.
async fn read_register(stream: &mut TcpStream, unit: u8, addr: u16) -> u16 {
    let mut pdu = vec![0x03];
    pdu.extend_from_slice(&addr.to_be_bytes());
    pdu.extend_from_slice(&1u16.to_be_bytes());
    let resp = exchange(stream, &adu(3, unit, &pdu)).await;
    assert_eq!(resp[0], 0x03, "read rejected: {resp:02X?}");
    u16::from_be_bytes([resp[2], resp[3]])
}

fn snapshot_all(orch: &Orchestrator) -> BTreeMap<String, MemorySnapshot> {
    orch.fabric()
        .device_names()
        .into_iter()
        .map(|name| {
            let snap = orch.fabric().read_bulk(&name).unwrap();
            (name, snap)
        })
        .collect()
}

// ── S1: boot + single PLC ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_boot_and_first_read() {
    let mut orch = boot_stepped().await;
    assert_eq!(
        orch.events().count(EventKind::DeviceRegistered),
        orch.fabric().device_names().len() as u64
    );

    // A few ticks so telemetry reaches the mirrors
    for _ in 0..5 {
        orch.step(0.1).unwrap();
    }

    let addr = orch.listener_addr("turbine_plc_1", "modbus").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    // FC 04, input register 0, count 1: shaft speed of a turbine at rest
    let resp = exchange(&mut stream, &adu(1, 1, &[0x04, 0x00, 0x00, 0x00, 0x01])).await;
    assert_eq!(resp[0], 0x04);
    assert_eq!(resp[1], 2);
    let value = u16::from_be_bytes([resp[2], resp[3]]);
    assert!(value <= 3, "resting turbine reported {value} rpm");

    assert_eq!(orch.events().count(EventKind::ConnectionAllowed), 1);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_outside_peer_is_denied() {
    // Same plant, but the plant segment lives on 192.168.1.0/24 — loopback
    // peers classify into the corporate fallback and get the door.
    let (mut config, parts) = demo_plant_stepped();
    config.topology.networks[0].subnet = "192.168.1.0/24".into();
    let mut orch = Orchestrator::boot(config, parts).await.unwrap();
    orch.step(0.1).unwrap();

    let addr = orch.listener_addr("turbine_plc_1", "modbus").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&adu(1, 1, &[0x04, 0x00, 0x00, 0x00, 0x01]))
        .await
        .ok();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("denied socket must close promptly")
        .unwrap_or(0);
    assert_eq!(n, 0, "denied peer received protocol bytes");
    assert!(orch.events().count(EventKind::ConnectionDenied) >= 1);
    assert_eq!(orch.gate().connections().active_count(), 0);
    orch.shutdown().await;
}

// ── Causal layering and round-trip ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_write_lands_after_exactly_one_sync() {
    let mut orch = boot_stepped().await;
    orch.step(0.1).unwrap();

    let addr = orch.listener_addr("turbine_plc_2", "modbus").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_register(&mut stream, 2, 10, 1800).await;
    write_coil(&mut stream, 2, 10, true).await;

    // Nothing on the device until the next tick's sync step
    assert_eq!(
        orch.fabric().read("turbine_plc_2", MemKey::holding(10)).unwrap(),
        None
    );

    orch.step(0.1).unwrap();
    assert_eq!(
        orch.fabric().read("turbine_plc_2", MemKey::holding(10)).unwrap(),
        Some(MemValue::Word(1800))
    );
    // Physics saw the governor command starting this tick, so the shaft
    // has not moved yet...
    let speed_now = orch
        .fabric()
        .read("turbine_plc_2", MemKey::holding(0))
        .unwrap()
        .unwrap()
        .as_word()
        .unwrap();
    assert_eq!(speed_now, 0);

    // ...and begins accelerating on the tick after
    orch.step(0.1).unwrap();
    orch.step(0.1).unwrap();
    let speed_later = orch
        .fabric()
        .read("turbine_plc_2", MemKey::holding(0))
        .unwrap()
        .unwrap()
        .as_word()
        .unwrap();
    assert!(speed_later > 0);

    // Round-trip: FC 03 at the written address returns the value
    assert_eq!(read_register(&mut stream, 2, 10).await, 1800);
    orch.shutdown().await;
}

// ── S2: overspeed attack ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_overspeed_attack_tripped_by_safety_plc() {
    let mut orch = boot_stepped().await;
    // Unit 1 is running at rated speed when the attacker arrives
    orch.fabric()
        .write_bulk(
            "turbine_plc_1",
            &[
                (MemKey::holding(10), MemValue::Word(3600)),
                (MemKey::coil(10), MemValue::Bit(true)),
            ],
        )
        .unwrap();
    for _ in 0..450 {
        orch.step(0.1).unwrap();
    }

    let addr = orch.listener_addr("turbine_plc_1", "modbus").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    // The attack: setpoint 4500 rpm, governor on
    write_register(&mut stream, 1, 10, 4500).await;
    write_coil(&mut stream, 1, 10, true).await;

    // Within 40 s of sim time the SIS must assert the trip coil
    let mut trip_at = None;
    for i in 0..800 {
        orch.step(0.05).unwrap();
        let tripped = orch
            .fabric()
            .read("turbine_plc_1", MemKey::coil(11))
            .unwrap()
            .map(|v| v.as_bit().unwrap_or(false))
            .unwrap_or(false);
        if tripped {
            trip_at = Some(i as f64 * 0.05);
            break;
        }
    }
    let trip_at = trip_at.expect("safety PLC never tripped the turbine");
    assert!(trip_at <= 40.0, "trip came late, at {trip_at} s");
    assert!(orch.events().count(EventKind::OverspeedTrip) >= 1);

    // Within 60 s of the trip the shaft is stopped
    for _ in 0..1200 {
        orch.step(0.05).unwrap();
    }
    let speed = read_register(&mut stream, 1, 0).await;
    assert_eq!(speed, 0, "shaft still turning at {speed} rpm");
    orch.shutdown().await;
}

// ── S3: grid load loss ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_generation_loss_sags_grid_frequency() {
    let mut orch = boot_stepped().await;

    // Dispatch all three turbines to rated speed
    for name in TURBINES {
        orch.fabric()
            .write_bulk(
                name,
                &[
                    (MemKey::holding(10), MemValue::Word(3600)),
                    (MemKey::coil(10), MemValue::Bit(true)),
                ],
            )
            .unwrap();
    }
    // Spin-up and settle: ~60 s
    for _ in 0..600 {
        orch.step(0.1).unwrap();
    }
    let freq0 = orch
        .fabric()
        .read("grid_monitor_1", MemKey::holding(0))
        .unwrap()
        .unwrap()
        .as_word()
        .unwrap();
    assert!(
        (4950..=5010).contains(&freq0),
        "pre-trip frequency {freq0} cHz out of band"
    );

    // Trip turbine 1 over the wire
    let addr = orch.listener_addr("turbine_plc_1", "modbus").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_coil(&mut stream, 1, 11, true).await;

    // 100 s of sim time later the island is sagging but stable
    for _ in 0..1000 {
        orch.step(0.1).unwrap();
    }
    let freq = orch
        .fabric()
        .read("grid_monitor_1", MemKey::holding(0))
        .unwrap()
        .unwrap()
        .as_word()
        .unwrap();
    assert!(freq < 4990, "frequency {freq} cHz did not sag below 49.9 Hz");
    assert!(freq > 4850, "frequency {freq} cHz collapsed past 48.5 Hz");
    // With H = 5000 MW·s the 49.0 Hz limit is not reached in this window
    assert_eq!(orch.events().count(EventKind::GridTrip), 0);
    orch.shutdown().await;
}

// ── S4: dual-homed pivot ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_pivot_reach_follows_membership() {
    let orch = boot_stepped().await;
    let gate = orch.gate();
    let port = orch
        .listener_addr("turbine_plc_1", "modbus")
        .unwrap()
        .port();

    let reach_from_ws = |gate: &std::sync::Arc<gridforge_network::NetworkGate>| {
        let networks =
            gate.with_topology(|t| t.device_networks("engineering_ws_1"));
        networks
            .iter()
            .any(|net| gate.can_reach(net, "turbine_plc_1", "modbus", port).0)
    };

    // Corporate + scada homing: the PLC is out of reach
    assert!(!reach_from_ws(gate));

    // Grant the workstation a plant-side leg: now it pivots through
    gate.with_topology(|t| t.add_membership("engineering_ws_1", "plant_network").unwrap());
    assert!(reach_from_ws(gate));

    // Remove the leg again: the path closes
    gate.with_topology(|t| t.remove_membership("engineering_ws_1", "plant_network"));
    assert!(!reach_from_ws(gate));
}

// ── S5: deterministic replay ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_stepped_replay_is_deterministic() {
    let mut fingerprints: Vec<Vec<BTreeMap<String, MemorySnapshot>>> = Vec::new();

    for _ in 0..2 {
        let mut orch = boot_stepped().await;
        // Identical stimulus on both runs, applied through the fabric
        orch.fabric()
            .write_bulk(
                "turbine_plc_1",
                &[
                    (MemKey::holding(10), MemValue::Word(3600)),
                    (MemKey::coil(10), MemValue::Bit(true)),
                ],
            )
            .unwrap();
        orch.fabric()
            .write_bulk(
                "reactor_plc_1",
                &[
                    (MemKey::holding(10), MemValue::Word(60)),
                    (MemKey::holding(11), MemValue::Word(70)),
                    (MemKey::holding(12), MemValue::Word(80)),
                    (MemKey::coil(11), MemValue::Bit(true)),
                ],
            )
            .unwrap();

        let mut trace = Vec::new();
        for i in 0..600 {
            orch.step(0.1).unwrap();
            if i % 100 == 99 {
                trace.push(snapshot_all(&orch));
            }
        }
        fingerprints.push(trace);
        orch.shutdown().await;
    }

    assert_eq!(fingerprints[0].len(), fingerprints[1].len());
    for (tick, (a, b)) in fingerprints[0].iter().zip(&fingerprints[1]).enumerate() {
        assert_eq!(a, b, "state diverged at checkpoint {tick}");
    }
}

// ── Supervisory layer end-to-end ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scada_alarm_and_historian_capture_overspeed() {
    let mut orch = boot_stepped().await;
    orch.fabric()
        .write_bulk(
            "turbine_plc_2",
            &[
                (MemKey::holding(10), MemValue::Word(4200)),
                (MemKey::coil(10), MemValue::Bit(true)),
            ],
        )
        .unwrap();
    // 50 s: unit 2 passes its alarm limit (no SIS guards unit 2)
    for _ in 0..500 {
        orch.step(0.1).unwrap();
    }

    let scada = orch.fabric().read_bulk("scada_master_1").unwrap();
    let active_alarms = scada.word(MemKey::input(3));
    assert!(active_alarms >= 1, "SCADA raised no alarm for unit 2 overspeed");

    let historian = orch.fabric().read_bulk("historian_primary").unwrap();
    let points = historian.word(MemKey::input(0));
    assert!(points > 0, "historian collected nothing");
    orch.shutdown().await;
}

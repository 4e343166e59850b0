//! Connection manager end-to-end behavior against the simulated bus.

use std::time::Duration;

use esclink_core::esc::Feedback;
use esclink_core::protocol::packet::FrameBody;
use esclink_core::protocol::{Connection, ConnectionState, Protocol, ProtocolError};
use esclink_core::sim::{SimBus, SimPorts};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn firmware_rig(ids: &[u8]) -> (SimBus, SimPorts) {
    let bus = SimBus::new(Protocol::Firmware, ids);
    let mut ports = SimPorts::new();
    ports.add_endpoint("sim0", 250_000, &bus);
    (bus, ports)
}

#[test]
fn open_discovers_all_devices() {
    init_tracing();
    let (_bus, ports) = firmware_rig(&[0, 1, 2, 3]);

    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();
    assert_eq!(conn.state(), ConnectionState::Open(Protocol::Firmware));

    let escs = conn.escs();
    assert_eq!(escs.len(), 4);
    let mut ids: Vec<u8> = escs.iter().map(|e| e.id).collect();
    ids.sort();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(escs[0].version.hardware, 31);
}

#[test]
fn open_fails_fast_on_silent_port() {
    let mut ports = SimPorts::new();
    ports.add_silent_port("quiet");

    match Connection::open(&ports, "quiet", 250_000) {
        Err(ProtocolError::ConnectFailed) => {}
        other => panic!("expected ConnectFailed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn open_fails_fast_on_missing_port() {
    let ports = SimPorts::new();
    match Connection::open(&ports, "nope", 250_000) {
        Err(ProtocolError::PortUnavailable(_)) => {}
        other => panic!("expected PortUnavailable, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn telemetry_flows_into_the_registry() {
    init_tracing();
    let (bus, ports) = firmware_rig(&[0, 1, 2, 3]);
    let pinned = Feedback {
        rpm: 8000,
        power: 450,
        voltage: 14.8,
        current: 3.2,
        temperature: 41.0,
    };
    bus.set_fixed_feedback(3, pinned);

    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();
    // the sender polls feedback round-robin; give it a few rotations
    std::thread::sleep(Duration::from_millis(250));

    let esc = conn.esc(3).expect("device 3 discovered");
    assert_eq!(esc.feedback, Some(pinned));
    assert_eq!(esc.rpm(), 8000);
    assert_eq!(esc.power(), 450);
}

#[test]
fn target_change_reaches_the_wire_as_power_zero() {
    init_tracing();
    let (bus, ports) = firmware_rig(&[0, 1, 2, 3]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    conn.set_target_rpm(3, 8000).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        bus.last_command_for(3),
        Some(FrameBody::RpmCommand { rpm: 8000, .. })
    ));

    // switching targets must swap the command type on the next tick,
    // not keep sending the stale RPM target
    conn.set_target_power(3, 0).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        bus.last_command_for(3),
        Some(FrameBody::PowerCommand { power: 0, .. })
    ));
}

#[test]
fn led_state_rides_on_command_frames() {
    let (bus, ports) = firmware_rig(&[5]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    conn.set_leds(5, [true, false, true]).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    match bus.last_command_for(5) {
        Some(FrameBody::PowerCommand { leds, .. }) => assert_eq!(leds, 0b101),
        other => panic!("unexpected command: {:?}", other),
    }
}

#[test]
fn reset_is_fire_and_forget() {
    let (bus, ports) = firmware_rig(&[0, 1]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    conn.reset(1).unwrap();
    conn.reset_all().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let resets = bus.resets();
    assert!(resets.contains(&1));
    assert!(resets.contains(&255));
}

#[test]
fn reset_of_unknown_id_is_reported() {
    let (_bus, ports) = firmware_rig(&[0]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    assert!(matches!(
        conn.reset(9),
        Err(ProtocolError::DeviceNotFound(9))
    ));
}

#[test]
fn switch_protocol_reconnects_and_keeps_the_registry() {
    init_tracing();
    let fw_bus = SimBus::new(Protocol::Firmware, &[0, 1]);
    let boot_bus = SimBus::new(Protocol::Bootloader, &[0]);
    let mut ports = SimPorts::new();
    ports.add_endpoint("sim0", 250_000, &fw_bus);
    ports.add_endpoint("sim0", 230_400, &boot_bus);

    let mut conn = Connection::open(&ports, "sim0", 250_000).unwrap();
    assert_eq!(conn.escs().len(), 2);

    conn.switch_protocol(&ports, Protocol::Bootloader, 230_400)
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Open(Protocol::Bootloader));
    assert_eq!(conn.baud(), 230_400);
    // the device population discovered in firmware mode is retained
    assert_eq!(conn.escs().len(), 2);

    // and back
    conn.switch_protocol(&ports, Protocol::Firmware, 250_000)
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Open(Protocol::Firmware));
}

#[test]
fn firmware_operations_refuse_bootloader_mode() {
    let boot_bus = SimBus::new(Protocol::Bootloader, &[0]);
    let mut ports = SimPorts::new();
    ports.add_endpoint("simB", 230_400, &boot_bus);

    let conn = Connection::open_bootloader(&ports, "simB", 230_400).unwrap();
    assert!(matches!(
        conn.reset_all(),
        Err(ProtocolError::WrongProtocol { .. })
    ));
}

#[test]
fn close_is_idempotent() {
    let (_bus, ports) = firmware_rig(&[0]);
    let mut conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);
    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[test]
fn highspeed_feedback_polls_one_device_faster() {
    let (bus, ports) = firmware_rig(&[0, 1, 2, 3]);
    for id in 0..4 {
        bus.set_fixed_feedback(
            id,
            Feedback {
                rpm: 1000 + id as i32,
                power: 100,
                voltage: 14.8,
                current: 1.0,
                temperature: 30.0,
            },
        );
    }

    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();
    conn.set_highspeed_feedback(Some(2)).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // every device still gets polled eventually, holder included
    for id in 0..4u8 {
        let esc = conn.esc(id).unwrap();
        assert!(esc.feedback.is_some(), "device {} never polled", id);
    }
}

//! Parameter push/pull/validation through a live (simulated) connection,
//! plus the cross-format file round-trip.

use std::time::Duration;

use esclink_core::params::{
    params_from_eep, params_from_xml, params_to_eep, params_to_xml, ParamKind,
};
use esclink_core::protocol::{Connection, Protocol};
use esclink_core::sim::{default_params, SimBus, SimPorts};

fn rig(ids: &[u8]) -> (SimBus, SimPorts) {
    let bus = SimBus::new(Protocol::Firmware, ids);
    let mut ports = SimPorts::new();
    ports.add_endpoint("sim0", 250_000, &bus);
    (bus, ports)
}

#[test]
fn read_params_pulls_all_four_blocks() {
    let (_bus, ports) = rig(&[0]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    let set = conn.read_params(0, Duration::from_secs(1)).unwrap();
    assert!(set.is_complete());
    assert!(set.is_valid());
    assert!(set.matches(&default_params(0)));
}

#[test]
fn read_params_of_unknown_id_errors() {
    let (_bus, ports) = rig(&[0]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    assert!(conn.read_params(6, Duration::from_millis(200)).is_err());
}

#[test]
fn invalid_params_are_isolated_per_device() {
    let (bus, ports) = rig(&[0, 1]);
    // device 1 answers tune requests with a corrupt block
    bus.corrupt_param_block(1, ParamKind::Tune);

    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    let good = conn.read_params(0, Duration::from_secs(1)).unwrap();
    let bad = conn.read_params(1, Duration::from_secs(1)).unwrap();

    // one device's bad checksum must not taint the other
    assert!(good.is_valid());
    assert!(!bad.is_valid());
}

#[test]
fn push_config_updates_every_device() {
    let (bus, ports) = rig(&[0, 1, 2, 3]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    // author a new tune and broadcast it, one block per push with a
    // settle delay, the way the provisioning flow does
    let mut set = default_params(0);
    let mut tune = set.tune().unwrap();
    tune.kp = 0.08;
    set.set_block(ParamKind::Tune, tune.encode().to_vec());

    conn.push_config(ParamKind::Tune, &set).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    for id in 0..4 {
        let stored = bus.params_of(id).unwrap();
        assert_eq!(
            stored.block(ParamKind::Tune),
            set.block(ParamKind::Tune),
            "device {} missed the push",
            id
        );
    }
}

#[test]
fn pushed_params_survive_a_request_roundtrip() {
    let (_bus, ports) = rig(&[0]);
    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();

    let mut set = default_params(0);
    let mut board = set.board().unwrap();
    board.current_limit = 55.0;
    set.set_block(ParamKind::Board, board.encode().to_vec());

    conn.push_config_to(0, ParamKind::Board, &set).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let back = conn.read_params(0, Duration::from_secs(1)).unwrap();
    assert_eq!(back.board().unwrap().current_limit, 55.0);
}

#[test]
fn eep_file_roundtrip() {
    // the provisioning flow ships .eep images around on disk
    let set = default_params(0);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("factory.eep");

    std::fs::write(&path, params_to_eep(&set).unwrap()).unwrap();
    let back = params_from_eep(&std::fs::read(&path).unwrap()).unwrap();
    assert!(back.matches(&set));
}

#[test]
fn xml_to_eep_to_blocks_is_lossless() {
    let set = default_params(3);

    let xml = params_to_xml(&set).unwrap();
    let from_xml = params_from_xml(&xml).unwrap();
    let eep = params_to_eep(&from_xml).unwrap();
    let from_eep = params_from_eep(&eep).unwrap();

    for kind in ParamKind::ALL {
        assert_eq!(from_eep.block(kind), set.block(kind), "{} drifted", kind);
    }
}

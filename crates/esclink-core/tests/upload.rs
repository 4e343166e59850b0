//! Firmware upload against the simulated bootloader.

use esclink_core::firmware::CHUNK_SIZE;
use esclink_core::protocol::{Connection, Protocol, ProtocolError};
use esclink_core::sim::{SimBus, SimPorts};

fn boot_rig() -> (SimBus, SimPorts) {
    let bus = SimBus::new(Protocol::Bootloader, &[0]);
    let mut ports = SimPorts::new();
    ports.add_endpoint("simBoot", 230_400, &bus);
    (bus, ports)
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn full_upload_yields_monotonic_progress_ending_at_one() {
    let (bus, ports) = boot_rig();
    let conn = Connection::open_bootloader(&ports, "simBoot", 230_400).unwrap();

    let fw = image(CHUNK_SIZE * 7 + 100); // 8 chunks, last one short
    let upload = conn.upload_firmware(&fw, 0).unwrap();
    assert_eq!(upload.total_chunks(), 8);

    let progress: Vec<f32> = upload.map(|p| p.unwrap()).collect();
    assert_eq!(progress.len(), 8);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*progress.last().unwrap(), 1.0);

    assert_eq!(bus.received_image().unwrap(), fw);
}

#[test]
fn single_chunk_image_uploads() {
    let (bus, ports) = boot_rig();
    let conn = Connection::open_bootloader(&ports, "simBoot", 230_400).unwrap();

    let fw = image(37);
    let progress: Vec<f32> = conn
        .upload_firmware(&fw, 0)
        .unwrap()
        .map(|p| p.unwrap())
        .collect();
    assert_eq!(progress, vec![1.0]);
    assert_eq!(bus.received_image().unwrap(), fw);
}

#[test]
fn nacked_chunk_is_retried_and_recovered() {
    let (bus, ports) = boot_rig();
    // chunk 3 is rejected twice, then accepted on the final attempt
    bus.nack_chunk(3, 2);

    let conn = Connection::open_bootloader(&ports, "simBoot", 230_400).unwrap();
    let fw = image(CHUNK_SIZE * 5);
    let progress: Vec<f32> = conn
        .upload_firmware(&fw, 0)
        .unwrap()
        .map(|p| p.unwrap())
        .collect();

    assert_eq!(progress.len(), 5);
    assert_eq!(*progress.last().unwrap(), 1.0);
    assert_eq!(bus.received_image().unwrap(), fw);
}

#[test]
fn chunk_dead_after_retries_aborts_the_session() {
    let (bus, ports) = boot_rig();
    // chunk 2 never acknowledges, past every retry
    bus.drop_chunk_acks(2, 100);

    let conn = Connection::open_bootloader(&ports, "simBoot", 230_400).unwrap();
    let fw = image(CHUNK_SIZE * 4);
    let mut upload = conn.upload_firmware(&fw, 0).unwrap();

    // chunks 0 and 1 make progress
    assert!(upload.next().unwrap().is_ok());
    assert!(upload.next().unwrap().is_ok());

    // chunk 2 surfaces the failure with its index
    match upload.next().unwrap() {
        Err(ProtocolError::UploadChunkFailed { chunk: 2, attempts }) => {
            assert!(attempts >= 1);
        }
        other => panic!("expected UploadChunkFailed, got {:?}", other),
    }

    // and the sequence ends: no further progress values
    assert!(upload.next().is_none());
}

#[test]
fn empty_image_is_rejected_up_front() {
    let (_bus, ports) = boot_rig();
    let conn = Connection::open_bootloader(&ports, "simBoot", 230_400).unwrap();

    assert!(matches!(
        conn.upload_firmware(&[], 0).err(),
        Some(ProtocolError::EmptyImage)
    ));
}

#[test]
fn upload_requires_bootloader_mode() {
    let bus = SimBus::new(Protocol::Firmware, &[0]);
    let mut ports = SimPorts::new();
    ports.add_endpoint("sim0", 250_000, &bus);

    let conn = Connection::open(&ports, "sim0", 250_000).unwrap();
    assert!(matches!(
        conn.upload_firmware(&image(64), 0).err(),
        Some(ProtocolError::WrongProtocol { .. })
    ));
}

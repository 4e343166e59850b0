//! ESC device model and registry
//!
//! Tracks every ESC discovered on the bus: identity reported in its
//! identification frame, the latest telemetry snapshot, and the outbound
//! command state (target + LEDs) the sender loop encodes each tick.

use serde::{Deserialize, Serialize};

use crate::params::ParameterSet;
use crate::protocol::ProtocolError;

/// Safety bound on RPM targets. Commands beyond this are clamped.
pub const MAX_SAFE_RPM: i32 = 30_000;

/// Full scale of the internal power command (maps to 100% externally).
pub const MAX_POWER: i16 = 1000;

/// Length of the unique hardware ID reported by each ESC.
pub const UID_LEN: usize = 12;

/// One telemetry snapshot reported by an ESC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Measured rotor speed, signed.
    pub rpm: i32,
    /// Applied power in internal units (0–1000).
    pub power: u16,
    /// Bus voltage in volts.
    pub voltage: f32,
    /// Phase current in amps.
    pub current: f32,
    /// Controller temperature in °C.
    pub temperature: f32,
}

/// Identity block reported by an ESC in its identification frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Firmware version number.
    pub firmware: u16,
    /// Hardware revision number.
    pub hardware: u16,
    /// Bootloader version number.
    pub bootloader: u16,
    /// Unique hardware ID, stored least-significant byte first.
    pub uid: [u8; UID_LEN],
    /// Short git hash the firmware was built from (ASCII).
    pub fw_git_hash: String,
    /// Short git hash the bootloader was built from (ASCII).
    pub boot_git_hash: String,
}

impl VersionInfo {
    /// UID formatted as hex, most-significant byte first.
    pub fn uid_hex(&self) -> String {
        let mut s = String::with_capacity(2 + 2 * UID_LEN);
        s.push_str("0x");
        for b in self.uid.iter().rev() {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

/// Outbound target for one ESC. Power and RPM targets are mutually
/// exclusive; setting one clears the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// No target set; the sender transmits zero power.
    #[default]
    None,
    /// Open-loop power target in internal units (−1000..=1000).
    Power(i16),
    /// Closed-loop RPM target (±[`MAX_SAFE_RPM`]).
    Rpm(i32),
}

/// One discovered ESC.
///
/// Created on the first identification frame from an unseen ID, updated on
/// every subsequent telemetry frame, and dropped only with the registry.
#[derive(Debug, Clone)]
pub struct Device {
    /// Bus ID (0–254).
    pub id: u8,
    /// Identity reported at discovery.
    pub version: VersionInfo,
    /// Latest telemetry snapshot, if any has arrived yet.
    pub feedback: Option<Feedback>,
    /// LED channel state sent with every command frame.
    pub leds: [bool; 3],
    /// Current outbound target.
    pub target: Target,
    /// Last parameter blocks reported by the device.
    pub params: ParameterSet,
}

impl Device {
    fn new(id: u8, version: VersionInfo) -> Self {
        Self {
            id,
            version,
            feedback: None,
            leds: [false; 3],
            target: Target::None,
            params: ParameterSet::default(),
        }
    }

    /// Latest measured RPM, zero before any telemetry arrived.
    pub fn rpm(&self) -> i32 {
        self.feedback.map(|f| f.rpm).unwrap_or(0)
    }

    /// Latest applied power in internal units.
    pub fn power(&self) -> u16 {
        self.feedback.map(|f| f.power).unwrap_or(0)
    }

    /// Latest bus voltage in volts.
    pub fn voltage(&self) -> f32 {
        self.feedback.map(|f| f.voltage).unwrap_or(0.0)
    }

    /// Latest phase current in amps.
    pub fn current(&self) -> f32 {
        self.feedback.map(|f| f.current).unwrap_or(0.0)
    }

    /// Latest controller temperature in °C.
    pub fn temperature(&self) -> f32 {
        self.feedback.map(|f| f.temperature).unwrap_or(0.0)
    }
}

/// Registry of every ESC seen on the open connection, in discovery order.
#[derive(Debug, Default)]
pub struct EscRegistry {
    devices: Vec<Device>,
    highspeed_fb: Option<u8>,
}

impl EscRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identification frame. Creates the device on first sight,
    /// refreshes its identity otherwise.
    pub fn upsert_identity(&mut self, id: u8, version: VersionInfo) {
        match self.devices.iter_mut().find(|d| d.id == id) {
            Some(dev) => dev.version = version,
            None => self.devices.push(Device::new(id, version)),
        }
    }

    /// Record a telemetry frame. Frames from IDs that never identified
    /// themselves are dropped; identification creates devices, telemetry
    /// only updates them.
    pub fn upsert_feedback(&mut self, id: u8, feedback: Feedback) {
        if let Some(dev) = self.devices.iter_mut().find(|d| d.id == id) {
            dev.feedback = Some(feedback);
        } else {
            tracing::debug!(id, "telemetry from unidentified ESC, dropped");
        }
    }

    /// Store a parameter block reported by a device. Validity is derived
    /// from the bytes on demand, never cached.
    pub fn store_params(&mut self, id: u8, kind: crate::params::ParamKind, block: Vec<u8>) {
        if let Some(dev) = self.devices.iter_mut().find(|d| d.id == id) {
            dev.params.set_block(kind, block);
        } else {
            tracing::debug!(id, "parameter block from unidentified ESC, dropped");
        }
    }

    /// Look up a device by ID.
    pub fn get(&self, id: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// All devices, ordered by discovery.
    pub fn all(&self) -> &[Device] {
        &self.devices
    }

    /// IDs of all devices, ordered by discovery.
    pub fn ids(&self) -> Vec<u8> {
        self.devices.iter().map(|d| d.id).collect()
    }

    /// Number of discovered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when nothing has been discovered yet.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Set an open-loop power target, in external percent (−100..=100).
    /// Clears any RPM target on the device.
    pub fn set_target_power(&mut self, id: u8, percent: i16) -> Result<(), ProtocolError> {
        let dev = self.get_mut(id)?;
        let pct = percent.clamp(-100, 100);
        dev.target = Target::Power(pct * 10);
        Ok(())
    }

    /// Set a closed-loop RPM target, clamped to ±[`MAX_SAFE_RPM`]. Clears
    /// any power target on the device.
    pub fn set_target_rpm(&mut self, id: u8, rpm: i32) -> Result<(), ProtocolError> {
        let dev = self.get_mut(id)?;
        dev.target = Target::Rpm(rpm.clamp(-MAX_SAFE_RPM, MAX_SAFE_RPM));
        Ok(())
    }

    /// Set the three LED channels. The state rides along with every command
    /// frame the sender emits for this device.
    pub fn set_leds(&mut self, id: u8, leds: [bool; 3]) -> Result<(), ProtocolError> {
        self.get_mut(id)?.leds = leds;
        Ok(())
    }

    /// Designate at most one device for high-rate feedback polling.
    /// Assigning a new holder clears the previous one.
    pub fn set_highspeed_feedback(&mut self, id: Option<u8>) -> Result<(), ProtocolError> {
        if let Some(id) = id {
            if self.get(id).is_none() {
                return Err(ProtocolError::DeviceNotFound(id));
            }
        }
        self.highspeed_fb = id;
        Ok(())
    }

    /// Current high-rate feedback holder, if any.
    pub fn highspeed_feedback(&self) -> Option<u8> {
        self.highspeed_fb
    }

    fn get_mut(&mut self, id: u8) -> Result<&mut Device, ProtocolError> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(ProtocolError::DeviceNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(n: u16) -> VersionInfo {
        VersionInfo {
            firmware: n,
            hardware: 31,
            bootloader: 2,
            uid: [0x11; UID_LEN],
            fw_git_hash: "deadbeef".into(),
            boot_git_hash: "cafef00d".into(),
        }
    }

    #[test]
    fn discovery_order_is_preserved() {
        let mut reg = EscRegistry::new();
        for id in [3, 0, 2, 1] {
            reg.upsert_identity(id, version(1));
        }
        assert_eq!(reg.ids(), vec![3, 0, 2, 1]);

        // re-identification must not reorder or duplicate
        reg.upsert_identity(2, version(2));
        assert_eq!(reg.ids(), vec![3, 0, 2, 1]);
        assert_eq!(reg.get(2).unwrap().version.firmware, 2);
    }

    #[test]
    fn feedback_for_unknown_id_is_dropped() {
        let mut reg = EscRegistry::new();
        reg.upsert_feedback(
            7,
            Feedback {
                rpm: 100,
                power: 10,
                voltage: 12.0,
                current: 1.0,
                temperature: 30.0,
            },
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn rpm_target_clears_power_target() {
        let mut reg = EscRegistry::new();
        reg.upsert_identity(3, version(1));

        reg.set_target_power(3, 45).unwrap();
        assert_eq!(reg.get(3).unwrap().target, Target::Power(450));

        reg.set_target_rpm(3, 8000).unwrap();
        assert_eq!(reg.get(3).unwrap().target, Target::Rpm(8000));

        reg.set_target_power(3, 0).unwrap();
        assert_eq!(reg.get(3).unwrap().target, Target::Power(0));
    }

    #[test]
    fn targets_are_clamped() {
        let mut reg = EscRegistry::new();
        reg.upsert_identity(0, version(1));

        reg.set_target_power(0, 150).unwrap();
        assert_eq!(reg.get(0).unwrap().target, Target::Power(1000));

        reg.set_target_rpm(0, 90_000).unwrap();
        assert_eq!(reg.get(0).unwrap().target, Target::Rpm(MAX_SAFE_RPM));
    }

    #[test]
    fn highspeed_feedback_is_a_singleton() {
        let mut reg = EscRegistry::new();
        reg.upsert_identity(0, version(1));
        reg.upsert_identity(1, version(1));

        reg.set_highspeed_feedback(Some(0)).unwrap();
        assert_eq!(reg.highspeed_feedback(), Some(0));

        reg.set_highspeed_feedback(Some(1)).unwrap();
        assert_eq!(reg.highspeed_feedback(), Some(1));

        assert!(matches!(
            reg.set_highspeed_feedback(Some(9)),
            Err(ProtocolError::DeviceNotFound(9))
        ));
        // failed assignment leaves the previous holder in place
        assert_eq!(reg.highspeed_feedback(), Some(1));
    }

    #[test]
    fn unknown_id_errors() {
        let mut reg = EscRegistry::new();
        assert!(matches!(
            reg.set_target_power(4, 10),
            Err(ProtocolError::DeviceNotFound(4))
        ));
    }

    #[test]
    fn uid_prints_msb_first() {
        let mut v = version(1);
        v.uid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c];
        assert_eq!(v.uid_hex(), "0x0c0b0a090807060504030201");
    }
}

//! ESC configuration parameters
//!
//! Each ESC carries four independently pushable configuration blocks:
//! board, id, uart, and tune. On the wire and in the binary file format a
//! block is a fixed-layout little-endian byte group; the typed views in
//! this module encode and decode those bytes. Validity is always derived
//! from the bytes, never stored, so it cannot go stale when a block is
//! replaced by a device response or a file load.
//!
//! Two external encodings exist: a human-editable XML form ([`xml`]) and a
//! compact binary form ([`eep`]). Both decode to the same byte blocks.

pub mod eep;
pub mod xml;

pub use eep::{params_from_eep, params_to_eep, EepError};
pub use xml::{params_from_xml, params_to_xml, XmlParamError};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::esc::MAX_SAFE_RPM;

/// Errors raised by parameter block encoding, decoding, and validation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParamError {
    /// A block had the wrong length for its kind.
    #[error("{kind} block is {actual} bytes, expected {expected}")]
    WrongLength {
        /// Block kind.
        kind: ParamKind,
        /// Length the layout requires.
        expected: usize,
        /// Length actually seen.
        actual: usize,
    },

    /// A decoded field is outside its permitted range.
    #[error("{kind} parameter '{field}' is out of range")]
    OutOfRange {
        /// Block kind.
        kind: ParamKind,
        /// Offending field name.
        field: &'static str,
    },

    /// A wire frame or file named a block kind this version does not know.
    #[error("unknown parameter block kind {0}")]
    UnknownKind(u8),

    /// An operation needed a block the set does not hold yet.
    #[error("parameter set has no {0} block")]
    MissingBlock(ParamKind),
}

/// The four configuration block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Hardware limits and protections.
    Board,
    /// Bus identity and motor wiring.
    Id,
    /// Serial link configuration.
    Uart,
    /// Control loop gains and limits.
    Tune,
}

impl ParamKind {
    /// All kinds, in wire/file order.
    pub const ALL: [ParamKind; 4] = [
        ParamKind::Board,
        ParamKind::Id,
        ParamKind::Uart,
        ParamKind::Tune,
    ];

    /// Wire code for this kind.
    pub fn code(self) -> u8 {
        match self {
            ParamKind::Board => 0,
            ParamKind::Id => 1,
            ParamKind::Uart => 2,
            ParamKind::Tune => 3,
        }
    }

    /// Kind for a wire code.
    pub fn from_code(code: u8) -> Result<Self, ParamError> {
        match code {
            0 => Ok(ParamKind::Board),
            1 => Ok(ParamKind::Id),
            2 => Ok(ParamKind::Uart),
            3 => Ok(ParamKind::Tune),
            other => Err(ParamError::UnknownKind(other)),
        }
    }

    /// Fixed byte length of this kind's block.
    pub fn block_len(self) -> usize {
        match self {
            ParamKind::Board => 16,
            ParamKind::Id => 8,
            ParamKind::Uart => 8,
            ParamKind::Tune => 24,
        }
    }

    /// Lowercase name used in files and log output.
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Board => "board",
            ParamKind::Id => "id",
            ParamKind::Uart => "uart",
            ParamKind::Tune => "tune",
        }
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A device's configuration as raw per-kind byte blocks.
///
/// Blocks arrive independently (device responses come back one frame per
/// kind), so any subset may be present. A set is only valid once all four
/// blocks are present and decode within range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    blocks: [Option<Vec<u8>>; 4],
}

impl ParameterSet {
    /// Build a set from the four typed views.
    pub fn from_configs(
        board: &BoardConfig,
        id: &IdConfig,
        uart: &UartConfig,
        tune: &TuneConfig,
    ) -> Self {
        let mut set = Self::default();
        set.set_block(ParamKind::Board, board.encode().to_vec());
        set.set_block(ParamKind::Id, id.encode().to_vec());
        set.set_block(ParamKind::Uart, uart.encode().to_vec());
        set.set_block(ParamKind::Tune, tune.encode().to_vec());
        set
    }

    /// Raw bytes of one block, if present.
    pub fn block(&self, kind: ParamKind) -> Option<&[u8]> {
        self.blocks[kind.code() as usize].as_deref()
    }

    /// Replace one block with the given bytes. Stored as-is; validity is
    /// recomputed on demand by [`is_valid`](Self::is_valid).
    pub fn set_block(&mut self, kind: ParamKind, bytes: Vec<u8>) {
        self.blocks[kind.code() as usize] = Some(bytes);
    }

    /// True when all four blocks are present.
    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.is_some())
    }

    /// Recompute validity over all blocks: complete, correct lengths, and
    /// every decoded field within range.
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Like [`is_valid`](Self::is_valid), but reports the first failure.
    pub fn check(&self) -> Result<(), ParamError> {
        self.board()?.validate()?;
        self.id()?.validate()?;
        self.uart()?.validate()?;
        self.tune()?.validate()?;
        Ok(())
    }

    /// Byte-block equality with another set (all four kinds).
    pub fn matches(&self, other: &ParameterSet) -> bool {
        self.blocks == other.blocks
    }

    /// Typed view of the board block.
    pub fn board(&self) -> Result<BoardConfig, ParamError> {
        BoardConfig::decode(self.required(ParamKind::Board)?)
    }

    /// Typed view of the id block.
    pub fn id(&self) -> Result<IdConfig, ParamError> {
        IdConfig::decode(self.required(ParamKind::Id)?)
    }

    /// Typed view of the uart block.
    pub fn uart(&self) -> Result<UartConfig, ParamError> {
        UartConfig::decode(self.required(ParamKind::Uart)?)
    }

    /// Typed view of the tune block.
    pub fn tune(&self) -> Result<TuneConfig, ParamError> {
        TuneConfig::decode(self.required(ParamKind::Tune)?)
    }

    fn required(&self, kind: ParamKind) -> Result<&[u8], ParamError> {
        self.block(kind).ok_or(ParamError::MissingBlock(kind))
    }
}

fn check_len(kind: ParamKind, bytes: &[u8]) -> Result<(), ParamError> {
    if bytes.len() != kind.block_len() {
        return Err(ParamError::WrongLength {
            kind,
            expected: kind.block_len(),
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Hardware limits and protections (16-byte block).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardConfig {
    /// Hardware revision the block was authored for.
    pub hardware_rev: u16,
    /// Battery cell count.
    pub num_cells: u8,
    /// Pack voltage below which the ESC shuts down, in volts.
    pub shutdown_voltage: f32,
    /// Temperature above which output is cut, in °C.
    pub overtemp_limit: f32,
    /// Phase current limit in amps.
    pub current_limit: f32,
}

impl BoardConfig {
    /// Pack into the 16-byte wire/file layout.
    pub fn encode(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        LittleEndian::write_u16(&mut b[0..2], self.hardware_rev);
        b[2] = self.num_cells;
        // b[3] reserved
        LittleEndian::write_f32(&mut b[4..8], self.shutdown_voltage);
        LittleEndian::write_f32(&mut b[8..12], self.overtemp_limit);
        LittleEndian::write_f32(&mut b[12..16], self.current_limit);
        b
    }

    /// Unpack from the 16-byte layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParamError> {
        check_len(ParamKind::Board, bytes)?;
        Ok(Self {
            hardware_rev: LittleEndian::read_u16(&bytes[0..2]),
            num_cells: bytes[2],
            shutdown_voltage: LittleEndian::read_f32(&bytes[4..8]),
            overtemp_limit: LittleEndian::read_f32(&bytes[8..12]),
            current_limit: LittleEndian::read_f32(&bytes[12..16]),
        })
    }

    /// Range-check every field.
    pub fn validate(&self) -> Result<(), ParamError> {
        let err = |field| ParamError::OutOfRange {
            kind: ParamKind::Board,
            field,
        };
        if !(1..=14).contains(&self.num_cells) {
            return Err(err("num_cells"));
        }
        if !self.shutdown_voltage.is_finite() || !(0.0..=60.0).contains(&self.shutdown_voltage) {
            return Err(err("shutdown_voltage"));
        }
        if !self.overtemp_limit.is_finite() || !(0.0..=200.0).contains(&self.overtemp_limit) {
            return Err(err("overtemp_limit"));
        }
        if !self.current_limit.is_finite() || !(0.0..=500.0).contains(&self.current_limit) {
            return Err(err("current_limit"));
        }
        Ok(())
    }
}

/// Bus identity and motor wiring (8-byte block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdConfig {
    /// Bus ID (0–254).
    pub id: u8,
    /// Spin direction reversed.
    pub reversed: bool,
    /// Emit telemetry without being polled.
    pub broadcast_telemetry: bool,
    /// Motor pole count.
    pub motor_poles: u16,
}

impl IdConfig {
    /// Pack into the 8-byte wire/file layout.
    pub fn encode(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.id;
        b[1] = self.reversed as u8;
        b[2] = self.broadcast_telemetry as u8;
        // b[3] reserved
        LittleEndian::write_u16(&mut b[4..6], self.motor_poles);
        // b[6..8] reserved
        b
    }

    /// Unpack from the 8-byte layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParamError> {
        check_len(ParamKind::Id, bytes)?;
        Ok(Self {
            id: bytes[0],
            reversed: bytes[1] != 0,
            broadcast_telemetry: bytes[2] != 0,
            motor_poles: LittleEndian::read_u16(&bytes[4..6]),
        })
    }

    /// Range-check every field.
    pub fn validate(&self) -> Result<(), ParamError> {
        let err = |field| ParamError::OutOfRange {
            kind: ParamKind::Id,
            field,
        };
        if self.id == crate::protocol::BROADCAST_ID {
            return Err(err("id"));
        }
        if !(2..=64).contains(&self.motor_poles) {
            return Err(err("motor_poles"));
        }
        Ok(())
    }
}

/// Serial link configuration (8-byte block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    /// Link baud rate.
    pub baud_rate: u32,
    /// Protocol version the device speaks.
    pub proto_version: u16,
    /// Inter-character timeout the device applies, in milliseconds.
    pub char_timeout_ms: u16,
}

impl UartConfig {
    /// Pack into the 8-byte wire/file layout.
    pub fn encode(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        LittleEndian::write_u32(&mut b[0..4], self.baud_rate);
        LittleEndian::write_u16(&mut b[4..6], self.proto_version);
        LittleEndian::write_u16(&mut b[6..8], self.char_timeout_ms);
        b
    }

    /// Unpack from the 8-byte layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParamError> {
        check_len(ParamKind::Uart, bytes)?;
        Ok(Self {
            baud_rate: LittleEndian::read_u32(&bytes[0..4]),
            proto_version: LittleEndian::read_u16(&bytes[4..6]),
            char_timeout_ms: LittleEndian::read_u16(&bytes[6..8]),
        })
    }

    /// Range-check every field.
    pub fn validate(&self) -> Result<(), ParamError> {
        let err = |field| ParamError::OutOfRange {
            kind: ParamKind::Uart,
            field,
        };
        if !(9_600..=6_000_000).contains(&self.baud_rate) {
            return Err(err("baud_rate"));
        }
        if self.proto_version == 0 {
            return Err(err("proto_version"));
        }
        if !(1..=1000).contains(&self.char_timeout_ms) {
            return Err(err("char_timeout_ms"));
        }
        Ok(())
    }
}

/// Control loop gains and limits (24-byte block).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneConfig {
    /// Proportional gain.
    pub kp: f32,
    /// Integral gain.
    pub ki: f32,
    /// Integral windup bound.
    pub max_kerr_sum: f32,
    /// Lowest RPM the closed loop will regulate to.
    pub min_rpm: f32,
    /// Highest RPM the closed loop will regulate to.
    pub max_rpm: f32,
    /// Feedback low-pass coefficient (0–1).
    pub rpm_filter_alpha: f32,
}

impl TuneConfig {
    /// Pack into the 24-byte wire/file layout.
    pub fn encode(&self) -> [u8; 24] {
        let mut b = [0u8; 24];
        LittleEndian::write_f32(&mut b[0..4], self.kp);
        LittleEndian::write_f32(&mut b[4..8], self.ki);
        LittleEndian::write_f32(&mut b[8..12], self.max_kerr_sum);
        LittleEndian::write_f32(&mut b[12..16], self.min_rpm);
        LittleEndian::write_f32(&mut b[16..20], self.max_rpm);
        LittleEndian::write_f32(&mut b[20..24], self.rpm_filter_alpha);
        b
    }

    /// Unpack from the 24-byte layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParamError> {
        check_len(ParamKind::Tune, bytes)?;
        Ok(Self {
            kp: LittleEndian::read_f32(&bytes[0..4]),
            ki: LittleEndian::read_f32(&bytes[4..8]),
            max_kerr_sum: LittleEndian::read_f32(&bytes[8..12]),
            min_rpm: LittleEndian::read_f32(&bytes[12..16]),
            max_rpm: LittleEndian::read_f32(&bytes[16..20]),
            rpm_filter_alpha: LittleEndian::read_f32(&bytes[20..24]),
        })
    }

    /// Range-check every field.
    pub fn validate(&self) -> Result<(), ParamError> {
        let err = |field| ParamError::OutOfRange {
            kind: ParamKind::Tune,
            field,
        };
        for (name, v) in [
            ("kp", self.kp),
            ("ki", self.ki),
            ("max_kerr_sum", self.max_kerr_sum),
            ("min_rpm", self.min_rpm),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(err(name));
            }
        }
        if !self.max_rpm.is_finite()
            || self.max_rpm <= self.min_rpm
            || self.max_rpm > MAX_SAFE_RPM as f32
        {
            return Err(err("max_rpm"));
        }
        if !self.rpm_filter_alpha.is_finite() || !(0.0..=1.0).contains(&self.rpm_filter_alpha) {
            return Err(err("rpm_filter_alpha"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A known-good set shared by the file-format tests.
    pub(crate) fn sample_set() -> ParameterSet {
        ParameterSet::from_configs(
            &BoardConfig {
                hardware_rev: 31,
                num_cells: 4,
                shutdown_voltage: 12.2,
                overtemp_limit: 110.0,
                current_limit: 40.0,
            },
            &IdConfig {
                id: 0,
                reversed: false,
                broadcast_telemetry: true,
                motor_poles: 14,
            },
            &UartConfig {
                baud_rate: 250_000,
                proto_version: 1,
                char_timeout_ms: 50,
            },
            &TuneConfig {
                kp: 0.05,
                ki: 0.01,
                max_kerr_sum: 100.0,
                min_rpm: 1000.0,
                max_rpm: 27_000.0,
                rpm_filter_alpha: 0.6,
            },
        )
    }

    #[test]
    fn block_roundtrip() {
        let set = sample_set();
        assert_eq!(set.board().unwrap().encode().as_slice(), set.block(ParamKind::Board).unwrap());
        assert_eq!(set.tune().unwrap().encode().as_slice(), set.block(ParamKind::Tune).unwrap());
        assert!(set.is_valid());
    }

    #[test]
    fn incomplete_set_is_invalid() {
        let mut set = ParameterSet::default();
        assert!(!set.is_valid());
        set.set_block(ParamKind::Board, sample_set().block(ParamKind::Board).unwrap().to_vec());
        assert!(!set.is_complete());
        assert!(!set.is_valid());
    }

    #[test]
    fn wrong_length_block_is_invalid() {
        let mut set = sample_set();
        set.set_block(ParamKind::Uart, vec![0; 5]);
        assert!(!set.is_valid());
        assert_eq!(
            set.uart(),
            Err(ParamError::WrongLength {
                kind: ParamKind::Uart,
                expected: 8,
                actual: 5
            })
        );
    }

    #[test]
    fn out_of_range_field_is_invalid() {
        let mut cfg = sample_set().tune().unwrap();
        cfg.max_rpm = 90_000.0;
        let mut set = sample_set();
        set.set_block(ParamKind::Tune, cfg.encode().to_vec());
        assert!(!set.is_valid());
    }

    #[test]
    fn broadcast_id_is_rejected() {
        let cfg = IdConfig {
            id: 255,
            reversed: false,
            broadcast_telemetry: false,
            motor_poles: 14,
        };
        assert_eq!(
            cfg.validate(),
            Err(ParamError::OutOfRange {
                kind: ParamKind::Id,
                field: "id"
            })
        );
    }

    #[test]
    fn matches_compares_all_blocks() {
        let a = sample_set();
        let mut b = sample_set();
        assert!(a.matches(&b));
        let mut id = b.id().unwrap();
        id.motor_poles = 12;
        b.set_block(ParamKind::Id, id.encode().to_vec());
        assert!(!a.matches(&b));
    }
}

//! Frame encoding/decoding
//!
//! Wire format, both protocol modes:
//!
//! ```text
//! sync(1)  id(1)  type(1)  len(1)  payload(len)  crc32(4, LE)
//! ```
//!
//! The sync byte doubles as the protocol-mode tag (`0xAF` firmware, `0xB5`
//! bootloader); the CRC-32 covers sync through payload. The checksum
//! algorithm and the type enumeration are a reconstructed contract; confirm
//! against the device firmware before relying on them in the field.
//!
//! Decoding is stream-oriented: the transport may deliver partial frames, so
//! [`FrameDecoder`] buffers trailing bytes across calls. A frame failing its
//! CRC is dropped and the scanner moves one byte forward, so a corrupted
//! byte never stalls the stream; alignment recovers at the next valid frame.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

use super::{Protocol, ProtocolError, MAX_PAYLOAD};
use crate::esc::{Feedback, VersionInfo, UID_LEN};
use crate::params::ParamKind;

/// Fixed length of the git-hash fields in an identification payload.
pub const GIT_HASH_LEN: usize = 8;

/// Sequence number acknowledging a `BootBegin` frame (chunks count from 0).
pub const BOOT_BEGIN_SEQ: u16 = 0xFFFF;

/// Pack the three LED channels into the wire bit field.
pub fn leds_to_byte(leds: [bool; 3]) -> u8 {
    (leds[0] as u8) | (leds[1] as u8) << 1 | (leds[2] as u8) << 2
}

/// Unpack the wire bit field into the three LED channels.
pub fn leds_from_byte(b: u8) -> [bool; 3] {
    [b & 1 != 0, b & 2 != 0, b & 4 != 0]
}

/// One decoded frame: the addressed (or originating) device ID plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Device ID; 255 addresses every device on the bus.
    pub id: u8,
    /// Typed frame contents.
    pub body: FrameBody,
}

impl Frame {
    /// Encode into exactly one checksum-protected wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.body.encode_payload();
        debug_assert!(payload.len() <= MAX_PAYLOAD);

        let mut out = Vec::with_capacity(4 + payload.len() + 4);
        out.push(self.body.protocol().sync_byte());
        out.push(self.id);
        out.push(self.body.type_byte());
        out.push(payload.len() as u8);
        out.extend_from_slice(&payload);

        let mut hasher = Hasher::new();
        hasher.update(&out);
        let mut crc = [0u8; 4];
        LittleEndian::write_u32(&mut crc, hasher.finalize());
        out.extend_from_slice(&crc);
        out
    }

    /// Decode a single complete frame (exact length required). Streamed
    /// input goes through [`FrameDecoder`] instead.
    pub fn decode(protocol: Protocol, bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 8 || bytes[0] != protocol.sync_byte() {
            return Err(ProtocolError::InvalidFrame);
        }
        let len = bytes[3] as usize;
        if bytes.len() != 4 + len + 4 {
            return Err(ProtocolError::InvalidFrame);
        }

        let mut hasher = Hasher::new();
        hasher.update(&bytes[..4 + len]);
        let expected = hasher.finalize();
        let actual = LittleEndian::read_u32(&bytes[4 + len..]);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch);
        }

        let body = FrameBody::decode(protocol, bytes[2], &bytes[4..4 + len])?;
        Ok(Frame { id: bytes[1], body })
    }
}

/// Tagged union over every frame the two protocol modes can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// Ask a device (or all devices) to identify itself.
    VersionRequest,
    /// Identity reported by a device.
    VersionResponse(VersionInfo),
    /// Telemetry snapshot reported by a device.
    Feedback(Feedback),
    /// Open-loop power command with LED state.
    PowerCommand {
        /// Power in internal units (−1000..=1000).
        power: i16,
        /// LED bit field, see [`leds_to_byte`].
        leds: u8,
        /// Ask the addressed device to answer with a feedback frame.
        request_feedback: bool,
    },
    /// Closed-loop RPM command with LED state.
    RpmCommand {
        /// Signed RPM target.
        rpm: i32,
        /// LED bit field.
        leds: u8,
        /// Ask the addressed device to answer with a feedback frame.
        request_feedback: bool,
    },
    /// Ask a device to emit one of its configuration blocks.
    ParamRequest {
        /// Which block.
        kind: ParamKind,
    },
    /// Configuration block reported by a device.
    ParamResponse {
        /// Which block.
        kind: ParamKind,
        /// Raw block bytes.
        block: Vec<u8>,
    },
    /// Write a configuration block; the device does not respond.
    ParamWrite {
        /// Which block.
        kind: ParamKind,
        /// Raw block bytes.
        block: Vec<u8>,
    },
    /// Reboot the addressed device(s); no acknowledgement.
    Reset,

    /// Probe for a device running in bootloader mode.
    BootPing,
    /// Bootloader presence reply.
    BootPingReply,
    /// Announce an upload: chunk count and image checksum.
    BootBegin {
        /// Number of chunks that will follow.
        total_chunks: u16,
        /// Image length in bytes.
        image_len: u32,
        /// CRC-32 of the whole image.
        image_crc: u32,
    },
    /// One firmware chunk.
    BootChunk {
        /// Zero-based chunk sequence number.
        seq: u16,
        /// Raw image slice.
        data: Vec<u8>,
    },
    /// Per-chunk acknowledgement.
    BootAckFrame {
        /// Acknowledged sequence number ([`BOOT_BEGIN_SEQ`] for the
        /// announcement frame).
        seq: u16,
        /// 0 on success, non-zero on device-side rejection.
        status: u8,
    },
}

impl FrameBody {
    /// Which protocol mode this body belongs to.
    pub fn protocol(&self) -> Protocol {
        match self {
            FrameBody::VersionRequest
            | FrameBody::VersionResponse(_)
            | FrameBody::Feedback(_)
            | FrameBody::PowerCommand { .. }
            | FrameBody::RpmCommand { .. }
            | FrameBody::ParamRequest { .. }
            | FrameBody::ParamResponse { .. }
            | FrameBody::ParamWrite { .. }
            | FrameBody::Reset => Protocol::Firmware,
            _ => Protocol::Bootloader,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            FrameBody::VersionRequest => 0x00,
            FrameBody::VersionResponse(_) => 0x01,
            FrameBody::Feedback(_) => 0x02,
            FrameBody::PowerCommand { .. } => 0x03,
            FrameBody::RpmCommand { .. } => 0x04,
            FrameBody::ParamRequest { .. } => 0x05,
            FrameBody::ParamResponse { .. } => 0x06,
            FrameBody::ParamWrite { .. } => 0x07,
            FrameBody::Reset => 0x08,
            FrameBody::BootPing => 0x00,
            FrameBody::BootPingReply => 0x01,
            FrameBody::BootBegin { .. } => 0x02,
            FrameBody::BootChunk { .. } => 0x03,
            FrameBody::BootAckFrame { .. } => 0x04,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            FrameBody::VersionRequest
            | FrameBody::Reset
            | FrameBody::BootPing
            | FrameBody::BootPingReply => Vec::new(),

            FrameBody::VersionResponse(v) => {
                let mut p = vec![0u8; 6 + UID_LEN + 2 * GIT_HASH_LEN];
                LittleEndian::write_u16(&mut p[0..2], v.firmware);
                LittleEndian::write_u16(&mut p[2..4], v.hardware);
                LittleEndian::write_u16(&mut p[4..6], v.bootloader);
                p[6..6 + UID_LEN].copy_from_slice(&v.uid);
                write_hash(&mut p[6 + UID_LEN..6 + UID_LEN + GIT_HASH_LEN], &v.fw_git_hash);
                write_hash(&mut p[6 + UID_LEN + GIT_HASH_LEN..], &v.boot_git_hash);
                p
            }

            FrameBody::Feedback(f) => {
                let mut p = vec![0u8; 18];
                LittleEndian::write_i32(&mut p[0..4], f.rpm);
                LittleEndian::write_u16(&mut p[4..6], f.power);
                LittleEndian::write_f32(&mut p[6..10], f.voltage);
                LittleEndian::write_f32(&mut p[10..14], f.current);
                LittleEndian::write_f32(&mut p[14..18], f.temperature);
                p
            }

            FrameBody::PowerCommand {
                power,
                leds,
                request_feedback,
            } => {
                let mut p = vec![0u8; 4];
                LittleEndian::write_i16(&mut p[0..2], *power);
                p[2] = *leds;
                p[3] = *request_feedback as u8;
                p
            }

            FrameBody::RpmCommand {
                rpm,
                leds,
                request_feedback,
            } => {
                let mut p = vec![0u8; 6];
                LittleEndian::write_i32(&mut p[0..4], *rpm);
                p[4] = *leds;
                p[5] = *request_feedback as u8;
                p
            }

            FrameBody::ParamRequest { kind } => vec![kind.code()],

            FrameBody::ParamResponse { kind, block } | FrameBody::ParamWrite { kind, block } => {
                let mut p = Vec::with_capacity(1 + block.len());
                p.push(kind.code());
                p.extend_from_slice(block);
                p
            }

            FrameBody::BootBegin {
                total_chunks,
                image_len,
                image_crc,
            } => {
                let mut p = vec![0u8; 10];
                LittleEndian::write_u16(&mut p[0..2], *total_chunks);
                LittleEndian::write_u32(&mut p[2..6], *image_len);
                LittleEndian::write_u32(&mut p[6..10], *image_crc);
                p
            }

            FrameBody::BootChunk { seq, data } => {
                let mut p = Vec::with_capacity(2 + data.len());
                let mut s = [0u8; 2];
                LittleEndian::write_u16(&mut s, *seq);
                p.extend_from_slice(&s);
                p.extend_from_slice(data);
                p
            }

            FrameBody::BootAckFrame { seq, status } => {
                let mut p = vec![0u8; 3];
                LittleEndian::write_u16(&mut p[0..2], *seq);
                p[2] = *status;
                p
            }
        }
    }

    fn decode(protocol: Protocol, type_byte: u8, p: &[u8]) -> Result<Self, ProtocolError> {
        match (protocol, type_byte) {
            (Protocol::Firmware, 0x00) if p.is_empty() => Ok(FrameBody::VersionRequest),

            (Protocol::Firmware, 0x01) if p.len() == 6 + UID_LEN + 2 * GIT_HASH_LEN => {
                let mut uid = [0u8; UID_LEN];
                uid.copy_from_slice(&p[6..6 + UID_LEN]);
                Ok(FrameBody::VersionResponse(VersionInfo {
                    firmware: LittleEndian::read_u16(&p[0..2]),
                    hardware: LittleEndian::read_u16(&p[2..4]),
                    bootloader: LittleEndian::read_u16(&p[4..6]),
                    uid,
                    fw_git_hash: read_hash(&p[6 + UID_LEN..6 + UID_LEN + GIT_HASH_LEN]),
                    boot_git_hash: read_hash(&p[6 + UID_LEN + GIT_HASH_LEN..]),
                }))
            }

            (Protocol::Firmware, 0x02) if p.len() == 18 => Ok(FrameBody::Feedback(Feedback {
                rpm: LittleEndian::read_i32(&p[0..4]),
                power: LittleEndian::read_u16(&p[4..6]),
                voltage: LittleEndian::read_f32(&p[6..10]),
                current: LittleEndian::read_f32(&p[10..14]),
                temperature: LittleEndian::read_f32(&p[14..18]),
            })),

            (Protocol::Firmware, 0x03) if p.len() == 4 => Ok(FrameBody::PowerCommand {
                power: LittleEndian::read_i16(&p[0..2]),
                leds: p[2],
                request_feedback: p[3] != 0,
            }),

            (Protocol::Firmware, 0x04) if p.len() == 6 => Ok(FrameBody::RpmCommand {
                rpm: LittleEndian::read_i32(&p[0..4]),
                leds: p[4],
                request_feedback: p[5] != 0,
            }),

            (Protocol::Firmware, 0x05) if p.len() == 1 => Ok(FrameBody::ParamRequest {
                kind: ParamKind::from_code(p[0]).map_err(|_| ProtocolError::InvalidFrame)?,
            }),

            (Protocol::Firmware, 0x06) if !p.is_empty() => Ok(FrameBody::ParamResponse {
                kind: ParamKind::from_code(p[0]).map_err(|_| ProtocolError::InvalidFrame)?,
                block: p[1..].to_vec(),
            }),

            (Protocol::Firmware, 0x07) if !p.is_empty() => Ok(FrameBody::ParamWrite {
                kind: ParamKind::from_code(p[0]).map_err(|_| ProtocolError::InvalidFrame)?,
                block: p[1..].to_vec(),
            }),

            (Protocol::Firmware, 0x08) if p.is_empty() => Ok(FrameBody::Reset),

            (Protocol::Bootloader, 0x00) if p.is_empty() => Ok(FrameBody::BootPing),
            (Protocol::Bootloader, 0x01) if p.is_empty() => Ok(FrameBody::BootPingReply),

            (Protocol::Bootloader, 0x02) if p.len() == 10 => Ok(FrameBody::BootBegin {
                total_chunks: LittleEndian::read_u16(&p[0..2]),
                image_len: LittleEndian::read_u32(&p[2..6]),
                image_crc: LittleEndian::read_u32(&p[6..10]),
            }),

            (Protocol::Bootloader, 0x03) if p.len() >= 2 => Ok(FrameBody::BootChunk {
                seq: LittleEndian::read_u16(&p[0..2]),
                data: p[2..].to_vec(),
            }),

            (Protocol::Bootloader, 0x04) if p.len() == 3 => Ok(FrameBody::BootAckFrame {
                seq: LittleEndian::read_u16(&p[0..2]),
                status: p[2],
            }),

            _ => Err(ProtocolError::InvalidFrame),
        }
    }
}

fn write_hash(dst: &mut [u8], hash: &str) {
    for (d, s) in dst.iter_mut().zip(hash.bytes()) {
        *d = s;
    }
}

fn read_hash(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).to_string()
}

/// Streaming frame decoder for one protocol mode.
///
/// Feed raw transport bytes with [`push`](Self::push); complete frames come
/// back in arrival order, incomplete trailing bytes stay buffered for the
/// next call.
#[derive(Debug)]
pub struct FrameDecoder {
    protocol: Protocol,
    buf: Vec<u8>,
    dropped: u64,
}

impl FrameDecoder {
    /// New decoder for the given protocol mode.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            buf: Vec::new(),
            dropped: 0,
        }
    }

    /// Number of frames dropped so far (checksum or parse failures).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append raw bytes and decode every complete frame now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let sync = self.protocol.sync_byte();

        let mut frames = Vec::new();
        loop {
            // discard garbage ahead of the next sync byte
            match self.buf.iter().position(|&b| b == sync) {
                Some(0) => {}
                Some(start) => {
                    self.buf.drain(..start);
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }

            if self.buf.len() < 4 {
                break;
            }
            let total = 4 + self.buf[3] as usize + 4;
            if self.buf.len() < total {
                break;
            }

            match Frame::decode(self.protocol, &self.buf[..total]) {
                Ok(frame) => {
                    frames.push(frame);
                    self.buf.drain(..total);
                }
                Err(_) => {
                    // drop only the offending sync byte and rescan; the
                    // stream realigns at the next genuine frame start
                    self.dropped += 1;
                    self.buf.drain(..1);
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame {
                id: 255,
                body: FrameBody::VersionRequest,
            },
            Frame {
                id: 3,
                body: FrameBody::Feedback(Feedback {
                    rpm: 8000,
                    power: 450,
                    voltage: 14.8,
                    current: 3.2,
                    temperature: 41.5,
                }),
            },
            Frame {
                id: 3,
                body: FrameBody::PowerCommand {
                    power: 0,
                    leds: 0b101,
                    request_feedback: true,
                },
            },
            Frame {
                id: 1,
                body: FrameBody::RpmCommand {
                    rpm: -2500,
                    leds: 0,
                    request_feedback: false,
                },
            },
            Frame {
                id: 0,
                body: FrameBody::ParamResponse {
                    kind: ParamKind::Uart,
                    block: vec![0x40, 0xd0, 0x03, 0x00, 0x01, 0x00, 0x32, 0x00],
                },
            },
            Frame {
                id: 0,
                body: FrameBody::VersionResponse(VersionInfo {
                    firmware: 39,
                    hardware: 31,
                    bootloader: 2,
                    uid: [7; UID_LEN],
                    fw_git_hash: "1a2b3c4d".into(),
                    boot_git_hash: "9f8e7d6c".into(),
                }),
            },
        ]
    }

    #[test]
    fn encode_decode_roundtrip() {
        for frame in sample_frames() {
            let wire = frame.encode();
            let back = Frame::decode(Protocol::Firmware, &wire).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn bootloader_roundtrip() {
        let frames = vec![
            Frame {
                id: 0,
                body: FrameBody::BootBegin {
                    total_chunks: 12,
                    image_len: 1500,
                    image_crc: 0xDEADBEEF,
                },
            },
            Frame {
                id: 0,
                body: FrameBody::BootChunk {
                    seq: 4,
                    data: vec![0xAA; 128],
                },
            },
            Frame {
                id: 0,
                body: FrameBody::BootAckFrame { seq: 4, status: 0 },
            },
        ];
        for frame in frames {
            let wire = frame.encode();
            assert_eq!(Frame::decode(Protocol::Bootloader, &wire).unwrap(), frame);
        }
    }

    #[test]
    fn corrupted_frame_fails_checksum() {
        let mut wire = sample_frames()[1].encode();
        wire[6] ^= 0xFF;
        assert!(matches!(
            Frame::decode(Protocol::Firmware, &wire),
            Err(ProtocolError::ChecksumMismatch)
        ));
    }

    #[test]
    fn decoder_handles_partial_delivery() {
        let frames = sample_frames();
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }

        let mut dec = FrameDecoder::new(Protocol::Firmware);
        let mut out = Vec::new();
        // dribble the stream in 3-byte slices
        for chunk in wire.chunks(3) {
            out.extend(dec.push(chunk));
        }
        assert_eq!(out, frames);
        assert_eq!(dec.dropped(), 0);
    }

    #[test]
    fn decoder_resynchronizes_after_corruption() {
        let frames = sample_frames();
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }

        // corrupt a single byte inside the second frame's payload
        let first_len = frames[0].encode().len();
        wire[first_len + 6] ^= 0x5A;

        let mut dec = FrameDecoder::new(Protocol::Firmware);
        let mut out = dec.push(&wire);

        // keep the stream flowing the way a live bus would; a false sync
        // match inside the corrupted region may hold the decoder until
        // enough bytes arrive to fail its checksum
        let heartbeat = Frame {
            id: 2,
            body: FrameBody::Feedback(Feedback {
                rpm: 100,
                power: 10,
                voltage: 12.0,
                current: 0.5,
                temperature: 25.0,
            }),
        };
        for _ in 0..40 {
            out.extend(dec.push(&heartbeat.encode()));
        }

        // the corrupted frame is gone, everything after it decodes
        assert!(out.contains(&frames[0]));
        for f in &frames[2..] {
            assert!(out.contains(f), "lost frame after corruption: {:?}", f);
        }
        assert!(!out.contains(&frames[1]));
        assert!(dec.dropped() > 0);
    }

    #[test]
    fn decoder_skips_leading_garbage() {
        let frame = &sample_frames()[1];
        let mut wire = vec![0x00, 0x13, 0x37];
        wire.extend_from_slice(&frame.encode());

        let mut dec = FrameDecoder::new(Protocol::Firmware);
        assert_eq!(dec.push(&wire), vec![frame.clone()]);
    }

    #[test]
    fn decoder_rejects_wrong_mode_frames() {
        let boot = Frame {
            id: 0,
            body: FrameBody::BootPing,
        };
        let mut dec = FrameDecoder::new(Protocol::Firmware);
        // bootloader sync byte never matches, stream is discarded
        assert!(dec.push(&boot.encode()).is_empty());
    }

    #[test]
    fn leds_bitfield_roundtrip() {
        for bits in 0..8u8 {
            assert_eq!(leds_to_byte(leds_from_byte(bits)), bits);
        }
        assert_eq!(leds_to_byte([true, false, true]), 0b101);
    }
}

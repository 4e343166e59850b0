//! Simulated ESC bus
//!
//! An in-process device population implementing the [`Channel`] and
//! [`PortProvider`] traits, so the scanner, connection manager, uploader,
//! and parameter flows run end-to-end without hardware. The integration
//! tests drive the whole engine against this bus.
//!
//! The simulation answers identification probes, models telemetry from the
//! last command, stores pushed parameter blocks, and acknowledges firmware
//! chunks, with hooks for fault injection (corrupt parameter blocks,
//! NACKed or dropped chunk acks).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::esc::{Feedback, VersionInfo, UID_LEN};
use crate::params::{
    BoardConfig, IdConfig, ParamKind, ParameterSet, TuneConfig, UartConfig,
};
use crate::protocol::packet::{Frame, FrameBody, FrameDecoder, BOOT_BEGIN_SEQ};
use crate::protocol::{Channel, PortInfo, PortProvider, Protocol, ProtocolError, BROADCAST_ID};

/// One simulated ESC.
#[derive(Debug, Clone)]
pub struct SimEsc {
    /// Bus ID.
    pub id: u8,
    /// Identity reported to version requests.
    pub version: VersionInfo,
    /// Parameter blocks the device reports and accepts.
    pub params: ParameterSet,
    /// When set, telemetry reports exactly this snapshot instead of the
    /// modeled values. Lets tests pin precise readings.
    pub fixed_feedback: Option<Feedback>,
    power_cmd: i16,
    rpm_cmd: i32,
}

impl SimEsc {
    /// A device with plausible defaults for the given ID.
    pub fn new(id: u8) -> Self {
        let mut uid = [0u8; UID_LEN];
        uid[0] = id;
        uid[1] = 0xE5;
        uid[11] = 0xC0;
        Self {
            id,
            version: VersionInfo {
                firmware: 39,
                hardware: 31,
                bootloader: 2,
                uid,
                fw_git_hash: "1a2b3c4d".into(),
                boot_git_hash: "9f8e7d6c".into(),
            },
            params: default_params(id),
            fixed_feedback: None,
            power_cmd: 0,
            rpm_cmd: 0,
        }
    }
}

/// Factory-default parameter blocks for a device.
pub fn default_params(id: u8) -> ParameterSet {
    ParameterSet::from_configs(
        &BoardConfig {
            hardware_rev: 31,
            num_cells: 4,
            shutdown_voltage: 12.2,
            overtemp_limit: 110.0,
            current_limit: 40.0,
        },
        &IdConfig {
            id,
            reversed: false,
            broadcast_telemetry: false,
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

struct SimState {
    mode: Protocol,
    escs: Vec<SimEsc>,
    decoder: FrameDecoder,
    outbox: Vec<u8>,
    resets: Vec<u8>,
    commands: Vec<Frame>,
    corrupt_blocks: Vec<(u8, ParamKind)>,
    chunk_nacks: HashMap<u16, u32>,
    chunk_silent: HashMap<u16, u32>,
    expected_chunks: u16,
    image: HashMap<u16, Vec<u8>>,
    rng: StdRng,
}

impl SimState {
    fn emit(&mut self, frame: Frame) {
        self.outbox.extend_from_slice(&frame.encode());
    }

    fn handle(&mut self, frame: Frame) {
        match self.mode {
            Protocol::Firmware => self.handle_firmware(frame),
            Protocol::Bootloader => self.handle_bootloader(frame),
        }
    }

    fn matching(&self, id: u8) -> Vec<usize> {
        self.escs
            .iter()
            .enumerate()
            .filter(|(_, e)| id == BROADCAST_ID || e.id == id)
            .map(|(i, _)| i)
            .collect()
    }

    fn handle_firmware(&mut self, frame: Frame) {
        match frame.body.clone() {
            FrameBody::VersionRequest => {
                for i in self.matching(frame.id) {
                    let reply = Frame {
                        id: self.escs[i].id,
                        body: FrameBody::VersionResponse(self.escs[i].version.clone()),
                    };
                    self.emit(reply);
                }
            }
            FrameBody::PowerCommand {
                power,
                request_feedback,
                ..
            } => {
                self.commands.push(frame.clone());
                for i in self.matching(frame.id) {
                    self.escs[i].power_cmd = power;
                    self.escs[i].rpm_cmd = 0;
                    if request_feedback {
                        self.emit_feedback(i);
                    }
                }
            }
            FrameBody::RpmCommand {
                rpm,
                request_feedback,
                ..
            } => {
                self.commands.push(frame.clone());
                for i in self.matching(frame.id) {
                    self.escs[i].rpm_cmd = rpm;
                    self.escs[i].power_cmd = 0;
                    if request_feedback {
                        self.emit_feedback(i);
                    }
                }
            }
            FrameBody::ParamRequest { kind } => {
                for i in self.matching(frame.id) {
                    let esc_id = self.escs[i].id;
                    let block = if self.corrupt_blocks.contains(&(esc_id, kind)) {
                        // short garbage block fails the length check downstream
                        vec![0xEE; 3]
                    } else {
                        match self.escs[i].params.block(kind) {
                            Some(b) => b.to_vec(),
                            None => continue,
                        }
                    };
                    self.emit(Frame {
                        id: esc_id,
                        body: FrameBody::ParamResponse { kind, block },
                    });
                }
            }
            FrameBody::ParamWrite { kind, block } => {
                for i in self.matching(frame.id) {
                    self.escs[i].params.set_block(kind, block.clone());
                }
            }
            FrameBody::Reset => {
                self.resets.push(frame.id);
            }
            _ => {}
        }
    }

    fn handle_bootloader(&mut self, frame: Frame) {
        match frame.body {
            FrameBody::BootPing => {
                if let Some(esc) = self.escs.first() {
                    let id = esc.id;
                    self.emit(Frame {
                        id,
                        body: FrameBody::BootPingReply,
                    });
                }
            }
            FrameBody::BootBegin { total_chunks, .. } => {
                self.expected_chunks = total_chunks;
                self.image.clear();
                let reply_id = frame.id;
                self.emit(Frame {
                    id: reply_id,
                    body: FrameBody::BootAckFrame {
                        seq: BOOT_BEGIN_SEQ,
                        status: 0,
                    },
                });
            }
            FrameBody::BootChunk { seq, data } => {
                if let Some(n) = self.chunk_silent.get_mut(&seq) {
                    if *n > 0 {
                        *n -= 1;
                        return;
                    }
                }
                if let Some(n) = self.chunk_nacks.get_mut(&seq) {
                    if *n > 0 {
                        *n -= 1;
                        let reply_id = frame.id;
                        self.emit(Frame {
                            id: reply_id,
                            body: FrameBody::BootAckFrame { seq, status: 1 },
                        });
                        return;
                    }
                }
                self.image.insert(seq, data);
                let reply_id = frame.id;
                self.emit(Frame {
                    id: reply_id,
                    body: FrameBody::BootAckFrame { seq, status: 0 },
                });
            }
            _ => {}
        }
    }

    fn emit_feedback(&mut self, i: usize) {
        let feedback = match self.escs[i].fixed_feedback {
            Some(f) => f,
            None => {
                let esc = &self.escs[i];
                let rpm = if esc.rpm_cmd != 0 {
                    esc.rpm_cmd
                } else {
                    esc.power_cmd as i32 * 27
                };
                let power = if esc.rpm_cmd != 0 {
                    (esc.rpm_cmd.unsigned_abs() / 30).min(1000) as u16
                } else {
                    esc.power_cmd.unsigned_abs().min(1000)
                };
                Feedback {
                    rpm: rpm + self.rng.gen_range(-5..=5),
                    power,
                    voltage: 14.8 + self.rng.gen_range(-0.05f32..0.05f32),
                    current: 0.2 + power as f32 * 0.004,
                    temperature: 32.0 + self.rng.gen_range(-0.5f32..0.5f32),
                }
            }
        };
        let id = self.escs[i].id;
        self.emit(Frame {
            id,
            body: FrameBody::Feedback(feedback),
        });
    }
}

/// Control handle for one simulated bus (one device population in one
/// protocol mode).
#[derive(Clone)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    /// A bus with one default device per ID, in the given mode.
    pub fn new(mode: Protocol, ids: &[u8]) -> Self {
        Self::with_escs(mode, ids.iter().map(|&id| SimEsc::new(id)).collect())
    }

    /// A bus with a custom device population.
    pub fn with_escs(mode: Protocol, escs: Vec<SimEsc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                mode,
                escs,
                decoder: FrameDecoder::new(mode),
                outbox: Vec::new(),
                resets: Vec::new(),
                commands: Vec::new(),
                corrupt_blocks: Vec::new(),
                chunk_nacks: HashMap::new(),
                chunk_silent: HashMap::new(),
                expected_chunks: 0,
                image: HashMap::new(),
                rng: StdRng::seed_from_u64(0x45C),
            })),
        }
    }

    /// Pin a device's telemetry to an exact snapshot.
    pub fn set_fixed_feedback(&self, id: u8, feedback: Feedback) {
        let mut st = self.state.lock().unwrap();
        if let Some(esc) = st.escs.iter_mut().find(|e| e.id == id) {
            esc.fixed_feedback = Some(feedback);
        }
    }

    /// Make one device answer requests for `kind` with a corrupt block.
    pub fn corrupt_param_block(&self, id: u8, kind: ParamKind) {
        self.state.lock().unwrap().corrupt_blocks.push((id, kind));
    }

    /// NACK the next `times` transmissions of chunk `seq`.
    pub fn nack_chunk(&self, seq: u16, times: u32) {
        self.state.lock().unwrap().chunk_nacks.insert(seq, times);
    }

    /// Swallow (never acknowledge) the next `times` transmissions of chunk
    /// `seq`.
    pub fn drop_chunk_acks(&self, seq: u16, times: u32) {
        self.state.lock().unwrap().chunk_silent.insert(seq, times);
    }

    /// IDs that received a reset frame, in order (255 = broadcast).
    pub fn resets(&self) -> Vec<u8> {
        self.state.lock().unwrap().resets.clone()
    }

    /// Most recent command frame addressed to the given ID.
    pub fn last_command_for(&self, id: u8) -> Option<FrameBody> {
        let st = self.state.lock().unwrap();
        st.commands
            .iter()
            .rev()
            .find(|f| f.id == id)
            .map(|f| f.body.clone())
    }

    /// Parameter blocks currently stored in a device.
    pub fn params_of(&self, id: u8) -> Option<ParameterSet> {
        let st = self.state.lock().unwrap();
        st.escs.iter().find(|e| e.id == id).map(|e| e.params.clone())
    }

    /// The uploaded image, reassembled in chunk order. `None` until every
    /// announced chunk has arrived.
    pub fn received_image(&self) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        if st.expected_chunks == 0 {
            return None;
        }
        let mut image = Vec::new();
        for seq in 0..st.expected_chunks {
            image.extend_from_slice(st.image.get(&seq)?);
        }
        Some(image)
    }

    fn reset_link(&self) {
        let mut st = self.state.lock().unwrap();
        st.outbox.clear();
        st.decoder = FrameDecoder::new(st.mode);
    }
}

/// Live channel endpoint into a [`SimBus`].
struct SimChannel {
    state: Arc<Mutex<SimState>>,
}

impl Read for SimChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        if st.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(st.outbox.len());
        buf[..n].copy_from_slice(&st.outbox[..n]);
        st.outbox.drain(..n);
        Ok(n)
    }
}

impl Write for SimChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let frames = st.decoder.push(buf);
        for frame in frames {
            st.handle(frame);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for SimChannel {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().outbox.clear();
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.state.lock().unwrap().outbox.len() as u32)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Channel>> {
        Ok(Box::new(SimChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

/// An open port with nothing listening: writes vanish, reads time out.
struct DeadChannel;

impl Read for DeadChannel {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for DeadChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for DeadChannel {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(0)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Channel>> {
        Ok(Box::new(DeadChannel))
    }
}

/// Simulated [`PortProvider`]: named ports, each optionally wired to a
/// [`SimBus`] at one specific baud rate. Opens at any other baud succeed
/// but reach nothing, like a real port with no listener at that rate.
#[derive(Default)]
pub struct SimPorts {
    endpoints: HashMap<String, Vec<(u32, SimBus)>>,
    silent: Vec<String>,
    opens: Arc<Mutex<Vec<(String, u32)>>>,
}

impl SimPorts {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire `bus` to `port` at exactly `baud`.
    pub fn add_endpoint(&mut self, port: &str, baud: u32, bus: &SimBus) {
        self.endpoints
            .entry(port.to_string())
            .or_default()
            .push((baud, bus.clone()));
    }

    /// Add a port that enumerates and opens but never answers.
    pub fn add_silent_port(&mut self, port: &str) {
        self.silent.push(port.to_string());
    }

    /// Every (port, baud) pair opened so far, in order.
    pub fn opens(&self) -> Vec<(String, u32)> {
        self.opens.lock().unwrap().clone()
    }
}

impl PortProvider for SimPorts {
    fn list(&self) -> Vec<PortInfo> {
        let mut names: Vec<&String> = self.endpoints.keys().chain(self.silent.iter()).collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .map(|name| PortInfo {
                name: name.clone(),
                vid: Some(0x0403),
                pid: Some(0x6001),
                manufacturer: Some("Simulated".into()),
                product: Some("USB UART bridge".into()),
                serial_number: None,
            })
            .collect()
    }

    fn open(&self, name: &str, baud: u32) -> Result<Box<dyn Channel>, ProtocolError> {
        self.opens.lock().unwrap().push((name.to_string(), baud));

        if let Some(eps) = self.endpoints.get(name) {
            if let Some((_, bus)) = eps.iter().find(|(b, _)| *b == baud) {
                bus.reset_link();
                return Ok(Box::new(SimChannel {
                    state: Arc::clone(&bus.state),
                }));
            }
            return Ok(Box::new(DeadChannel));
        }
        if self.silent.iter().any(|p| p == name) {
            return Ok(Box::new(DeadChannel));
        }
        Err(ProtocolError::PortUnavailable(name.to_string()))
    }
}

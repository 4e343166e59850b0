//! Connection management
//!
//! Owns one open [`Channel`] at one (port, baud, protocol) triple and runs
//! the two protocol-layer activities: a periodic sender that transmits one
//! combined command frame per device per tick, and a receiver that drains
//! the transport and dispatches decoded frames into the registry.
//!
//! State machine: `Closed → Connecting → Open(mode) → Closed`. Protocol
//! mode and baud rate change only together, through
//! [`switch_protocol`](Connection::switch_protocol). That is a controlled
//! reconnection, never a live mutation, because framing differs per mode.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::packet::{leds_to_byte, Frame, FrameBody, FrameDecoder};
use super::transport::{Channel, PortProvider};
use super::{
    Protocol, ProtocolError, BROADCAST_ID, DEFAULT_COMMAND_RATE_HZ, MIN_COMMAND_RATE_HZ,
};
use crate::esc::{Device, EscRegistry, Target};
use crate::params::{ParamKind, ParameterSet};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No channel held.
    Closed,
    /// Channel open, handshake in progress.
    Connecting,
    /// Handshake succeeded; loops running in the given mode.
    Open(Protocol),
}

/// Per-chunk bootloader acknowledgement delivered to the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootAck {
    /// Acknowledged chunk sequence number.
    pub seq: u16,
    /// 0 on success.
    pub status: u8,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Identification probes sent before giving up on a handshake.
    pub probe_attempts: u32,
    /// Settle time after each probe.
    pub probe_interval: Duration,
    /// Periodic sender rate. Values below [`MIN_COMMAND_RATE_HZ`] are
    /// raised to the floor; devices apply a command-timeout failsafe.
    pub command_rate_hz: u32,
    /// Timeout for synchronous exchanges (bootloader acks).
    pub response_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_attempts: 3,
            probe_interval: Duration::from_millis(25),
            command_rate_hz: DEFAULT_COMMAND_RATE_HZ,
            response_timeout: Duration::from_millis(250),
        }
    }
}

/// One session against one physical port.
///
/// Closing (or dropping) the connection stops both loops, aborts any
/// in-flight upload or parameter exchange, and releases the port.
pub struct Connection {
    state: ConnectionState,
    port_name: String,
    baud: u32,
    config: ConnectionConfig,
    /// Framing of the currently open channel. Tracks the channel, not the
    /// state: valid while Connecting too.
    link_protocol: Protocol,
    registry: Arc<Mutex<EscRegistry>>,
    writer: Option<Arc<Mutex<Box<dyn Channel>>>>,
    stop: Arc<AtomicBool>,
    rate_hz: Arc<AtomicU32>,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
    ack_rx: Option<Receiver<BootAck>>,
    boot_present: Arc<AtomicBool>,
    dropped_frames: Arc<AtomicU64>,
}

impl Connection {
    /// Open a port and handshake in firmware mode.
    ///
    /// Fails with [`ProtocolError::ConnectFailed`] when no device identifies
    /// itself within the probe budget; the port is released before
    /// returning.
    pub fn open(
        provider: &dyn PortProvider,
        port: &str,
        baud: u32,
    ) -> Result<Self, ProtocolError> {
        Self::open_with(provider, port, baud, ConnectionConfig::default())
    }

    /// [`open`](Self::open) with explicit configuration.
    pub fn open_with(
        provider: &dyn PortProvider,
        port: &str,
        baud: u32,
        config: ConnectionConfig,
    ) -> Result<Self, ProtocolError> {
        let mut conn = Self::attach(provider, port, baud, config, Protocol::Firmware)?;
        match conn.probe_firmware() {
            Ok(()) => {
                conn.state = ConnectionState::Open(Protocol::Firmware);
                conn.start_sender();
                Ok(conn)
            }
            Err(e) => {
                conn.shutdown_loops();
                Err(e)
            }
        }
    }

    /// Open a port and handshake in bootloader mode (ping/ping-reply).
    /// Used by the scanner's bootloader pass and by upload flows that skip
    /// the firmware-side reset.
    pub fn open_bootloader(
        provider: &dyn PortProvider,
        port: &str,
        baud: u32,
    ) -> Result<Self, ProtocolError> {
        Self::open_bootloader_with(provider, port, baud, ConnectionConfig::default())
    }

    /// [`open_bootloader`](Self::open_bootloader) with explicit
    /// configuration.
    pub fn open_bootloader_with(
        provider: &dyn PortProvider,
        port: &str,
        baud: u32,
        config: ConnectionConfig,
    ) -> Result<Self, ProtocolError> {
        let mut conn = Self::attach(provider, port, baud, config, Protocol::Bootloader)?;
        match conn.probe_bootloader() {
            Ok(()) => {
                conn.state = ConnectionState::Open(Protocol::Bootloader);
                Ok(conn)
            }
            Err(e) => {
                conn.shutdown_loops();
                Err(e)
            }
        }
    }

    fn attach(
        provider: &dyn PortProvider,
        port: &str,
        baud: u32,
        config: ConnectionConfig,
        protocol: Protocol,
    ) -> Result<Self, ProtocolError> {
        let rate = config.command_rate_hz.max(MIN_COMMAND_RATE_HZ);
        if rate != config.command_rate_hz {
            tracing::warn!(
                requested = config.command_rate_hz,
                floor = MIN_COMMAND_RATE_HZ,
                "command rate below device failsafe floor, raised"
            );
        }

        let mut conn = Self {
            state: ConnectionState::Closed,
            port_name: port.to_string(),
            baud,
            config,
            link_protocol: protocol,
            registry: Arc::new(Mutex::new(EscRegistry::new())),
            writer: None,
            stop: Arc::new(AtomicBool::new(false)),
            rate_hz: Arc::new(AtomicU32::new(rate)),
            rx_thread: None,
            tx_thread: None,
            ack_rx: None,
            boot_present: Arc::new(AtomicBool::new(false)),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        };

        let channel = provider.open(port, baud)?;
        conn.spawn_receiver(channel, protocol)?;
        conn.state = ConnectionState::Connecting;
        tracing::debug!(port, baud, %protocol, "channel open, handshaking");
        Ok(conn)
    }

    fn spawn_receiver(
        &mut self,
        channel: Box<dyn Channel>,
        protocol: Protocol,
    ) -> Result<(), ProtocolError> {
        let reader = channel.try_clone()?;
        self.writer = Some(Arc::new(Mutex::new(channel)));
        self.stop = Arc::new(AtomicBool::new(false));
        self.boot_present = Arc::new(AtomicBool::new(false));
        self.link_protocol = protocol;

        let (ack_tx, ack_rx) = mpsc::channel();
        self.ack_rx = Some(ack_rx);

        let registry = Arc::clone(&self.registry);
        let stop = Arc::clone(&self.stop);
        let boot_present = Arc::clone(&self.boot_present);
        let dropped = Arc::clone(&self.dropped_frames);

        let handle = std::thread::Builder::new()
            .name("esclink-rx".into())
            .spawn(move || {
                rx_loop(reader, protocol, registry, ack_tx, boot_present, dropped, stop)
            })?;
        self.rx_thread = Some(handle);
        Ok(())
    }

    fn start_sender(&mut self) {
        let writer = match &self.writer {
            Some(w) => Arc::clone(w),
            None => return,
        };
        let registry = Arc::clone(&self.registry);
        let stop = Arc::clone(&self.stop);
        let rate = Arc::clone(&self.rate_hz);

        let handle = std::thread::Builder::new()
            .name("esclink-tx".into())
            .spawn(move || tx_loop(writer, registry, rate, stop));
        match handle {
            Ok(h) => self.tx_thread = Some(h),
            Err(e) => tracing::error!("failed to start sender thread: {e}"),
        }
    }

    fn probe_firmware(&self) -> Result<(), ProtocolError> {
        for attempt in 0..self.config.probe_attempts {
            self.write_frame(&Frame {
                id: BROADCAST_ID,
                body: FrameBody::VersionRequest,
            })?;
            std::thread::sleep(self.config.probe_interval);
            if !self.registry.lock().unwrap().is_empty() {
                return Ok(());
            }
            tracing::debug!(attempt, "no identification response yet");
        }
        Err(ProtocolError::ConnectFailed)
    }

    fn probe_bootloader(&self) -> Result<(), ProtocolError> {
        for attempt in 0..self.config.probe_attempts {
            self.write_frame(&Frame {
                id: BROADCAST_ID,
                body: FrameBody::BootPing,
            })?;
            std::thread::sleep(self.config.probe_interval);
            if self.boot_present.load(Ordering::Relaxed) {
                return Ok(());
            }
            tracing::debug!(attempt, "no bootloader reply yet");
        }
        Err(ProtocolError::ConnectFailed)
    }

    /// Atomically reconfigure the session to the other protocol mode at a
    /// new baud rate: stops both loops, closes the channel, reopens and
    /// re-handshakes. The registry (and its device population) survives.
    pub fn switch_protocol(
        &mut self,
        provider: &dyn PortProvider,
        protocol: Protocol,
        baud: u32,
    ) -> Result<(), ProtocolError> {
        if !matches!(self.state, ConnectionState::Open(_)) {
            return Err(ProtocolError::NotConnected);
        }
        tracing::info!(%protocol, baud, "switching protocol");
        self.shutdown_loops();
        self.state = ConnectionState::Connecting;

        let channel = match provider.open(&self.port_name, baud) {
            Ok(c) => c,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(e);
            }
        };
        self.baud = baud;
        self.spawn_receiver(channel, protocol)?;

        let handshake = match protocol {
            Protocol::Firmware => self.probe_firmware(),
            Protocol::Bootloader => self.probe_bootloader(),
        };
        match handshake {
            Ok(()) => {
                self.state = ConnectionState::Open(protocol);
                if protocol == Protocol::Firmware {
                    self.start_sender();
                }
                Ok(())
            }
            Err(e) => {
                self.shutdown_loops();
                Err(e)
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Protocol mode, when open.
    pub fn protocol(&self) -> Option<Protocol> {
        match self.state {
            ConnectionState::Open(p) => Some(p),
            _ => None,
        }
    }

    /// Port this session owns.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Baud rate of the open channel.
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Shared handle to the device registry.
    pub fn registry(&self) -> Arc<Mutex<EscRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Snapshot of every discovered device, in discovery order.
    pub fn escs(&self) -> Vec<Device> {
        self.registry.lock().unwrap().all().to_vec()
    }

    /// Snapshot of one device.
    pub fn esc(&self, id: u8) -> Option<Device> {
        self.registry.lock().unwrap().get(id).cloned()
    }

    /// Frames dropped by the decoder since the channel opened.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Change the periodic sender rate. Values below the failsafe floor are
    /// raised to it.
    pub fn set_command_rate(&self, hz: u32) {
        let clamped = hz.max(MIN_COMMAND_RATE_HZ);
        if clamped != hz {
            tracing::warn!(requested = hz, floor = MIN_COMMAND_RATE_HZ, "command rate raised");
        }
        self.rate_hz.store(clamped, Ordering::Relaxed);
    }

    /// Set a power target in external percent (−100..=100). See
    /// [`EscRegistry::set_target_power`].
    pub fn set_target_power(&self, id: u8, percent: i16) -> Result<(), ProtocolError> {
        self.registry.lock().unwrap().set_target_power(id, percent)
    }

    /// Set an RPM target. See [`EscRegistry::set_target_rpm`].
    pub fn set_target_rpm(&self, id: u8, rpm: i32) -> Result<(), ProtocolError> {
        self.registry.lock().unwrap().set_target_rpm(id, rpm)
    }

    /// Set the LED channels for one device.
    pub fn set_leds(&self, id: u8, leds: [bool; 3]) -> Result<(), ProtocolError> {
        self.registry.lock().unwrap().set_leds(id, leds)
    }

    /// Designate the single device polled for feedback every tick.
    pub fn set_highspeed_feedback(&self, id: Option<u8>) -> Result<(), ProtocolError> {
        self.registry.lock().unwrap().set_highspeed_feedback(id)
    }

    /// Send one frame through the open channel. The body's mode must match
    /// the channel framing.
    pub fn send_frame(&self, id: u8, body: FrameBody) -> Result<(), ProtocolError> {
        if body.protocol() != self.link_protocol {
            return Err(ProtocolError::WrongProtocol {
                required: body.protocol(),
                actual: self.link_protocol,
            });
        }
        self.write_frame(&Frame { id, body })
    }

    fn write_frame(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let writer = self.writer.as_ref().ok_or(ProtocolError::NotConnected)?;
        let mut w = writer.lock().unwrap();
        w.write_all(&frame.encode())?;
        w.flush()?;
        Ok(())
    }

    /// Reboot one device. Fire-and-forget: the device vanishes and
    /// reappears under firmware-protocol defaults; no acknowledgement is
    /// awaited. Errors with [`ProtocolError::DeviceNotFound`] when the ID
    /// was never discovered, so callers can surface a best-effort warning
    /// and continue.
    pub fn reset(&self, id: u8) -> Result<(), ProtocolError> {
        self.require_mode(Protocol::Firmware)?;
        if id != BROADCAST_ID && self.registry.lock().unwrap().get(id).is_none() {
            return Err(ProtocolError::DeviceNotFound(id));
        }
        self.send_frame(id, FrameBody::Reset)
    }

    /// Reboot every device on the bus.
    pub fn reset_all(&self) -> Result<(), ProtocolError> {
        self.require_mode(Protocol::Firmware)?;
        self.send_frame(BROADCAST_ID, FrameBody::Reset)
    }

    /// Push one configuration block to every device. Fire-and-forget; the
    /// caller enforces a settle delay before the next block or a reset.
    pub fn push_config(&self, kind: ParamKind, set: &ParameterSet) -> Result<(), ProtocolError> {
        self.push_config_to(BROADCAST_ID, kind, set)
    }

    /// Push one configuration block to one device.
    pub fn push_config_to(
        &self,
        id: u8,
        kind: ParamKind,
        set: &ParameterSet,
    ) -> Result<(), ProtocolError> {
        self.require_mode(Protocol::Firmware)?;
        let block = set
            .block(kind)
            .ok_or(ProtocolError::InvalidParameters(id))?
            .to_vec();
        self.send_frame(id, FrameBody::ParamWrite { kind, block })
    }

    /// Ask one device to emit one of its configuration blocks. The response
    /// lands in the registry asynchronously.
    pub fn request_config(&self, kind: ParamKind, id: u8) -> Result<(), ProtocolError> {
        self.require_mode(Protocol::Firmware)?;
        self.send_frame(id, FrameBody::ParamRequest { kind })
    }

    /// Request all four configuration blocks from a device and wait until
    /// they arrive. Returns the set regardless of validity (the caller
    /// decides what an invalid set means), but times out when any block
    /// never shows up.
    pub fn read_params(&self, id: u8, timeout: Duration) -> Result<ParameterSet, ProtocolError> {
        self.require_mode(Protocol::Firmware)?;
        if self.registry.lock().unwrap().get(id).is_none() {
            return Err(ProtocolError::DeviceNotFound(id));
        }
        for kind in ParamKind::ALL {
            self.request_config(kind, id)?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            {
                let reg = self.registry.lock().unwrap();
                if let Some(dev) = reg.get(id) {
                    if dev.params.is_complete() {
                        return Ok(dev.params.clone());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(ProtocolError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Wait for the next bootloader acknowledgement.
    pub(crate) fn recv_boot_ack(&self, timeout: Duration) -> Result<BootAck, ProtocolError> {
        let rx = self.ack_rx.as_ref().ok_or(ProtocolError::NotConnected)?;
        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ProtocolError::Timeout,
            RecvTimeoutError::Disconnected => ProtocolError::NotConnected,
        })
    }

    /// Drain acknowledgements left over from a previous exchange.
    pub(crate) fn drain_boot_acks(&self) {
        if let Some(rx) = &self.ack_rx {
            while rx.try_recv().is_ok() {}
        }
    }

    /// Configured response timeout for synchronous exchanges.
    pub(crate) fn response_timeout(&self) -> Duration {
        self.config.response_timeout
    }

    pub(crate) fn require_mode(&self, required: Protocol) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Open(actual) if actual == required => Ok(()),
            ConnectionState::Open(actual) => {
                Err(ProtocolError::WrongProtocol { required, actual })
            }
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn shutdown_loops(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.tx_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.rx_thread.take() {
            let _ = h.join();
        }
        self.writer = None;
        self.ack_rx = None;
    }

    /// Stop both loops and release the port. Idempotent; also aborts any
    /// in-flight upload or parameter exchange.
    pub fn close(&mut self) {
        self.shutdown_loops();
        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Encode the combined command frame (target + LEDs) for one device.
pub(crate) fn command_frame(dev: &Device, request_feedback: bool) -> Frame {
    let leds = leds_to_byte(dev.leds);
    let body = match dev.target {
        Target::Rpm(rpm) => FrameBody::RpmCommand {
            rpm,
            leds,
            request_feedback,
        },
        Target::Power(power) => FrameBody::PowerCommand {
            power,
            leds,
            request_feedback,
        },
        Target::None => FrameBody::PowerCommand {
            power: 0,
            leds,
            request_feedback,
        },
    };
    Frame { id: dev.id, body }
}

/// Pick which device gets the feedback-request flag this tick. The
/// highspeed holder, when set, is polled three ticks out of four; everyone
/// else shares a round-robin.
fn feedback_target(reg: &EscRegistry, tick: u64) -> Option<u8> {
    let ids = reg.ids();
    if ids.is_empty() {
        return None;
    }
    if let Some(h) = reg.highspeed_feedback() {
        if tick % 4 != 3 {
            return Some(h);
        }
        let others: Vec<u8> = ids.into_iter().filter(|&i| i != h).collect();
        if others.is_empty() {
            return Some(h);
        }
        return Some(others[(tick / 4) as usize % others.len()]);
    }
    Some(ids[tick as usize % ids.len()])
}

fn tx_loop(
    writer: Arc<Mutex<Box<dyn Channel>>>,
    registry: Arc<Mutex<EscRegistry>>,
    rate_hz: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
) {
    let mut tick: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();

        let frames: Vec<Frame> = {
            let reg = registry.lock().unwrap();
            let fb_id = feedback_target(&reg, tick);
            reg.all()
                .iter()
                .map(|dev| command_frame(dev, fb_id == Some(dev.id)))
                .collect()
        };

        if !frames.is_empty() {
            let mut w = writer.lock().unwrap();
            for frame in &frames {
                if let Err(e) = w.write_all(&frame.encode()) {
                    tracing::warn!("sender write failed: {e}");
                    break;
                }
            }
            let _ = w.flush();
        }

        tick = tick.wrapping_add(1);
        let period =
            Duration::from_secs_f64(1.0 / rate_hz.load(Ordering::Relaxed).max(1) as f64);
        let elapsed = started.elapsed();
        if elapsed < period {
            std::thread::sleep(period - elapsed);
        }
    }
}

fn rx_loop(
    mut chan: Box<dyn Channel>,
    protocol: Protocol,
    registry: Arc<Mutex<EscRegistry>>,
    ack_tx: Sender<BootAck>,
    boot_present: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
) {
    let _ = chan.set_timeout(Duration::from_millis(5));
    let mut decoder = FrameDecoder::new(protocol);
    let mut buf = [0u8; 512];

    while !stop.load(Ordering::Relaxed) {
        let available = match chan.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                tracing::debug!("bytes_to_read failed: {e}");
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
        };
        if available == 0 {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }

        let to_read = available.min(buf.len());
        let n = match chan.read(&mut buf[..to_read]) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!("receiver read failed: {e}");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        for frame in decoder.push(&buf[..n]) {
            dispatch(frame, &registry, &ack_tx, &boot_present);
        }
        dropped.store(decoder.dropped(), Ordering::Relaxed);
    }
}

fn dispatch(
    frame: Frame,
    registry: &Arc<Mutex<EscRegistry>>,
    ack_tx: &Sender<BootAck>,
    boot_present: &Arc<AtomicBool>,
) {
    match frame.body {
        FrameBody::VersionResponse(version) => {
            tracing::debug!(id = frame.id, fw = version.firmware, "ESC identified");
            registry.lock().unwrap().upsert_identity(frame.id, version);
        }
        FrameBody::Feedback(feedback) => {
            registry.lock().unwrap().upsert_feedback(frame.id, feedback);
        }
        FrameBody::ParamResponse { kind, block } => {
            let mut reg = registry.lock().unwrap();
            reg.store_params(frame.id, kind, block);
            if let Some(dev) = reg.get(frame.id) {
                if dev.params.is_complete() && !dev.params.is_valid() {
                    tracing::warn!(id = frame.id, "ESC reported invalid parameters");
                }
            }
        }
        FrameBody::BootPingReply => {
            boot_present.store(true, Ordering::Relaxed);
        }
        FrameBody::BootAckFrame { seq, status } => {
            let _ = ack_tx.send(BootAck { seq, status });
        }
        other => {
            tracing::debug!(id = frame.id, ?other, "unexpected inbound frame, ignored");
        }
    }
}

//! Firmware upload
//!
//! Drives the bootloader protocol through a chunked binary transfer. The
//! connection must already be open in bootloader mode at the bootloader
//! baud rate; the target device should have just been reset out of firmware
//! mode (a manual power-cycle is the accepted fallback when the reset step
//! cannot find the ID; see the CLI upload flow).
//!
//! Progress is exposed as a lazy, finite, non-restartable iterator the
//! caller pulls: one fractional value per acknowledged chunk, ending at
//! exactly 1.0 on full success. A chunk that stays unacknowledged after
//! all retries yields an error item and the sequence ends; partial writes
//! are not resumed automatically. Dropping the iterator (or closing the
//! connection) cancels the upload.

use std::time::{Duration, Instant};

use crate::protocol::packet::{FrameBody, BOOT_BEGIN_SEQ};
use crate::protocol::{Connection, Protocol, ProtocolError};

/// Fixed chunk size the bootloader accepts.
pub const CHUNK_SIZE: usize = 128;

/// Send attempts per chunk before the upload is abandoned.
pub const CHUNK_RETRIES: u32 = 3;

impl Connection {
    /// Begin a firmware upload to the given device ID.
    ///
    /// Splits the image into [`CHUNK_SIZE`] chunks in file order and returns
    /// the progress iterator. Nothing is transmitted until the first
    /// [`next`](Iterator::next) call.
    pub fn upload_firmware(
        &self,
        image: &[u8],
        id: u8,
    ) -> Result<FirmwareUpload<'_>, ProtocolError> {
        self.require_mode(Protocol::Bootloader)?;
        if image.is_empty() {
            return Err(ProtocolError::EmptyImage);
        }
        let chunks: Vec<Vec<u8>> = image.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        if chunks.len() > u16::MAX as usize {
            return Err(ProtocolError::InvalidFrame);
        }

        Ok(FirmwareUpload {
            conn: self,
            id,
            image_len: image.len() as u32,
            image_crc: crc32fast::hash(image),
            chunks,
            next: 0,
            begun: false,
            finished: false,
        })
    }
}

/// In-flight upload session. See [`Connection::upload_firmware`].
pub struct FirmwareUpload<'a> {
    conn: &'a Connection,
    id: u8,
    chunks: Vec<Vec<u8>>,
    image_len: u32,
    image_crc: u32,
    next: usize,
    begun: bool,
    finished: bool,
}

impl FirmwareUpload<'_> {
    /// Total number of chunks in this session.
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn begin(&mut self) -> Result<(), ProtocolError> {
        self.conn.drain_boot_acks();
        for attempt in 1..=CHUNK_RETRIES {
            self.conn.send_frame(
                self.id,
                FrameBody::BootBegin {
                    total_chunks: self.chunks.len() as u16,
                    image_len: self.image_len,
                    image_crc: self.image_crc,
                },
            )?;
            match self.await_ack(BOOT_BEGIN_SEQ) {
                Ok(()) => return Ok(()),
                Err(ProtocolError::Timeout) => {
                    tracing::debug!(attempt, "upload announcement unacknowledged");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProtocolError::Timeout)
    }

    fn send_chunk(&mut self, seq: u16) -> Result<(), ProtocolError> {
        let data = self.chunks[seq as usize].clone();
        for attempt in 1..=CHUNK_RETRIES {
            self.conn.send_frame(
                self.id,
                FrameBody::BootChunk {
                    seq,
                    data: data.clone(),
                },
            )?;
            match self.await_ack(seq) {
                Ok(()) => return Ok(()),
                Err(ProtocolError::Timeout) => {
                    tracing::debug!(seq, attempt, "chunk unacknowledged, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProtocolError::UploadChunkFailed {
            chunk: seq as usize,
            attempts: CHUNK_RETRIES,
        })
    }

    /// Wait for the acknowledgement of `seq`, skipping stale acks from
    /// earlier retries. A NACK counts as a failed attempt, like a timeout.
    fn await_ack(&self, seq: u16) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + self.conn.response_timeout();
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO);
            let ack = self.conn.recv_boot_ack(remaining)?;
            if ack.seq != seq {
                continue;
            }
            if ack.status == 0 {
                return Ok(());
            }
            tracing::debug!(seq, status = ack.status, "chunk rejected by bootloader");
            return Err(ProtocolError::Timeout);
        }
    }
}

impl Iterator for FirmwareUpload<'_> {
    type Item = Result<f32, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if !self.begun {
            if let Err(e) = self.begin() {
                self.finished = true;
                return Some(Err(e));
            }
            self.begun = true;
        }

        let seq = self.next as u16;
        match self.send_chunk(seq) {
            Ok(()) => {
                self.next += 1;
                let progress = self.next as f32 / self.chunks.len() as f32;
                if self.next == self.chunks.len() {
                    self.finished = true;
                }
                Some(Ok(progress))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

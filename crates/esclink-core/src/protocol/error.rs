//! Protocol errors

use thiserror::Error;

use super::Protocol;

/// Errors that can occur during ESC communication.
///
/// Transport- and framing-level faults are recovered locally where a retry
/// is meaningful (frame resynchronization, chunk retries, next scan
/// candidate); identity and semantic faults are surfaced to the caller.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The OS refused to open the port (missing, or already locked by
    /// another session). Fatal to the probe, non-fatal to a scan.
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),

    /// No device responded within the connect probe budget. Recoverable by
    /// trying the next (port, baud) candidate.
    #[error("no device responded within the probe budget")]
    ConnectFailed,

    /// A response did not arrive in time.
    #[error("operation timed out")]
    Timeout,

    /// Operation requires an open connection.
    #[error("not connected")]
    NotConnected,

    /// `open` was called on a connection that is already open.
    #[error("already connected")]
    AlreadyConnected,

    /// A frame failed its CRC check.
    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    /// A frame could not be parsed (bad length, unknown type for the mode).
    #[error("malformed frame")]
    InvalidFrame,

    /// The requested device ID is not present in the registry.
    #[error("ESC ID {0} not found")]
    DeviceNotFound(u8),

    /// A received or loaded parameter block failed validation. Reported per
    /// device; does not abort processing of other devices.
    #[error("parameters for ESC ID {0} are invalid")]
    InvalidParameters(u8),

    /// A firmware chunk went unacknowledged after all retries. Fatal to the
    /// upload session; `chunk` identifies how far the image got.
    #[error("firmware chunk {chunk} unacknowledged after {attempts} attempts")]
    UploadChunkFailed {
        /// Zero-based index of the failing chunk.
        chunk: usize,
        /// Number of send attempts made for that chunk.
        attempts: u32,
    },

    /// The firmware image to upload is empty.
    #[error("firmware image is empty")]
    EmptyImage,

    /// The connection is open in the wrong protocol mode for the operation.
    #[error("operation requires the {required} protocol, connection is in {actual}")]
    WrongProtocol {
        /// Mode the operation needs.
        required: Protocol,
        /// Mode the connection is currently in.
        actual: Protocol,
    },

    /// Underlying I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

use crate::cmd::NakCode;

/// Errors surfaced across the crate's public API.
///
/// Codec-local conditions (`PKT_WAIT`/`PKT_SKIP`) are deliberately absent
/// from the variants that escape a `refresh` call: they are retry
/// dispositions the role state machines consume internally, never facts the
/// host needs to react to. See [`crate::phy::PhyOutcome`] for the full,
/// internal taxonomy.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// A null/invalid argument was passed to a host-facing API (e.g. a PD
    /// index out of range). This is the only class of error that aborts the
    /// call outright rather than degrading a state machine.
    #[error("invalid argument")]
    InvalidArgument,

    /// A bounded queue (command or event) had no free slots.
    #[error("queue is full")]
    QueueFull,

    /// The byte channel adapter reported an I/O failure.
    #[error("channel I/O error")]
    ChannelIo,

    /// A received frame had a malformed header (bad SOM, length, or control
    /// byte). Triggers a phy reset.
    #[error("malformed packet")]
    PacketFormat,

    /// CRC/checksum validation of a received frame failed. Triggers a phy
    /// reset.
    #[error("packet check failed")]
    PacketCheck,

    /// The secure channel handshake failed or a MAC did not verify; the
    /// secure channel has been torn down to `SC_INIT`.
    #[error("secure channel handshake failed")]
    SecureChannel,

    /// A MAC-protected packet failed MAC verification.
    #[error("MAC verification failed")]
    Mac,

    /// An encrypted payload could not be decrypted/unpadded.
    #[error("payload decryption failed")]
    Decrypt,

    /// A sequence number mismatch was observed outside of the tolerated
    /// resync window.
    #[error("sequence number error")]
    Sequence,

    /// A reply was not received within `reply_timeout_ms`.
    #[error("reply timeout")]
    Timeout,

    /// The requested command/feature is not supported by this role or PD.
    #[error("unsupported")]
    Unsupported,

    /// The peer NAK'd the last command.
    #[error("NAK: {0:?}")]
    Nak(NakCode),
}

pub type Result<T> = core::result::Result<T, Error>;

//! Byte channel adapter (`SPEC_FULL.md` §4.A).
//!
//! Modeled after the teacher's [`NetworkInterface`]-style hardware traits:
//! a small, non-blocking surface the role state machines drive directly,
//! with no assumption about what sits underneath (UART, TCP socket, loopback
//! buffer in a test).

/// Opaque identity of a physical channel, used to let several PDs that share
/// one RS-485 bus arbitrate access to it (`SPEC_FULL.md` §4.A, §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

/// A non-blocking byte channel.
///
/// Implementations must never block: `read`/`write` return as many bytes as
/// are immediately available/consumable, including zero.
pub trait Channel {
    /// Reads up to `buf.len()` bytes without blocking. Returns the number of
    /// bytes actually read, which may be zero.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Writes up to `buf.len()` bytes without blocking. Returns the number
    /// of bytes actually consumed, which may be less than `buf.len()`.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Flushes any buffered output.
    fn flush(&mut self);

    /// Identity used to share a lock across PDs wired to the same bus.
    fn id(&self) -> ChannelId;
}

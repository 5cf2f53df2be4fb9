//! Unsolicited PD events (`SPEC_FULL.md` §2, §4.G).
//!
//! A PD queues these itself (card reads, keypad digits, tamper) and the
//! state machine drains one per `CMD_POLL`, matching `spec.md`'s "events are
//! delivered to the CP only in response to the next POLL, one per poll."

use crate::cmd::ReplyCode;

/// An event a PD reports to the CP, one at a time, in reply to a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Raw card data (`REPLY_RAW`): `bit_count` significant bits in `data`.
    CardRead {
        format: u8,
        bit_count: u16,
        data: [u8; 32],
    },
    /// A single keypad digit (`REPLY_KEYPAD`).
    Keypress { reader_no: u8, digit: u8 },
    /// Local tamper condition latched (`REPLY_LSTATR`).
    Tamper(bool),
    /// Local power condition changed (`REPLY_LSTATR`).
    Power(bool),
    /// Vendor-specific event, reported via `REPLY_MFGREP`.
    Custom { vendor_code: [u8; 3], data: [u8; 16], len: u8 },
}

impl Event {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Event::CardRead { .. } => ReplyCode::Raw,
            Event::Keypress { .. } => ReplyCode::KeyPad,
            Event::Tamper(_) | Event::Power(_) => ReplyCode::LstatR,
            Event::Custom { .. } => ReplyCode::MfgRep,
        }
    }
}

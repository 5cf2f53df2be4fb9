//! Wire-level command/reply codes and the command record the host exchanges
//! with a PD (`SPEC_FULL.md` §3, §4.G).
//!
//! Marshaling an individual command's *payload* is explicitly out of scope
//! (`spec.md` §1): `Command` carries only what the state machines need to
//! pick a wire code and a byte length, not a full typed model of every OSDP
//! command's fields.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Reserved command codes (`CMD_POLL`..`CMD_KEEPACTIVE` in the original
/// header). CP -> PD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    Poll = 0x60,
    Id = 0x61,
    Cap = 0x62,
    Diag = 0x63,
    Lstat = 0x64,
    Istat = 0x65,
    Ostat = 0x66,
    Rstat = 0x67,
    Out = 0x68,
    Led = 0x69,
    Buz = 0x6A,
    Text = 0x6B,
    Rmode = 0x6C,
    Tdset = 0x6D,
    Comset = 0x6E,
    Data = 0x6F,
    Xmit = 0x70,
    Prompt = 0x71,
    Spe = 0x72,
    BioRead = 0x73,
    BioMatch = 0x74,
    KeySet = 0x75,
    Chlng = 0x76,
    Scrypt = 0x77,
    Cont = 0x79,
    Abort = 0x7A,
    AcuRxSize = 0x7B,
    FileTransfer = 0x7C,
    Mfg = 0x80,
    ScDone = 0xA0,
    Xwr = 0xA1,
    KeepActive = 0xA7,
}

/// Reserved reply codes (`REPLY_ACK`..`REPLY_XRD`). PD -> CP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReplyCode {
    Ack = 0x40,
    Nak = 0x41,
    PdId = 0x45,
    PdCap = 0x46,
    LstatR = 0x48,
    IstatR = 0x49,
    OstatR = 0x4A,
    RstatR = 0x4B,
    Raw = 0x50,
    Fmt = 0x51,
    Pres = 0x52,
    KeyPad = 0x53,
    Com = 0x54,
    ScRep = 0x55,
    SpeR = 0x56,
    BioReadR = 0x57,
    BioMatchR = 0x58,
    Busy = 0x79,
    CCrypt = 0x76,
    RMacI = 0x78,
    FtStat = 0x7A,
    MfgRep = 0x90,
    Xrd = 0xB1,
}

/// Secure block types identifying handshake stages and MAC/ENC packet
/// classes (`SCS_11`..`SCS_18`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ScsType {
    /// CP -> PD -- CMD_CHLNG
    Chlng = 0x11,
    /// PD -> CP -- REPLY_CCRYPT
    Ccrypt = 0x12,
    /// CP -> PD -- CMD_SCRYPT
    Scrypt = 0x13,
    /// PD -> CP -- REPLY_RMAC_I
    RmacI = 0x14,
    /// CP -> PD -- MAC, no encryption
    Cmd15 = 0x15,
    /// PD -> CP -- MAC, no encryption
    Reply16 = 0x16,
    /// CP -> PD -- MAC and encryption
    Cmd17 = 0x17,
    /// PD -> CP -- MAC and encryption
    Reply18 = 0x18,
}

impl ScsType {
    /// Whether packets of this type carry an encrypted payload in addition
    /// to a MAC.
    pub fn is_encrypted(self) -> bool {
        matches!(self, ScsType::Cmd17 | ScsType::Reply18)
    }
}

/// NAK reasons a PD can return (`osdp_pd_nak_code_e`, minus the unused
/// `SENTINEL`/`NONE` placeholders which a Rust enum doesn't need).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NakCode {
    MessageCheckFailed = 1,
    CommandLength = 2,
    UnknownCommand = 3,
    SequenceNumber = 4,
    SecureChannelUnsupported = 5,
    SecureChannelConditions = 6,
    BioType = 7,
    BioFormat = 8,
    UnableToProcessRecord = 9,
}

/// A command the host wants the CP to issue to a PD, or a PD callback
/// issues in reply to one it was asked to perform.
///
/// Payloads beyond the fixed fields OSDP itself defines (addresses, bit
/// patterns, timers) are left to the host: this is the tagged "ephemeral"
/// scratch value from the reference header's `union osdp_ephemeral_data`,
/// modeled as a plain enum per `SPEC_FULL.md` §3/§9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Poll,
    Id,
    Cap,
    Lstat,
    Istat,
    Ostat,
    Rstat,
    /// Drive an output (relay/strike) `output_no` to `control_code` for
    /// `timer` centiseconds (0 = indefinite).
    Output {
        output_no: u8,
        control_code: u8,
        timer: u16,
    },
    /// Drive a reader LED.
    Led {
        reader_no: u8,
        led_no: u8,
        control_code: u8,
    },
    /// Sound the reader's buzzer.
    Buzzer { reader_no: u8, control_code: u8 },
    /// Display up to 32 bytes of text on the reader.
    Text { reader_no: u8, len: u8 },
    /// Reconfigure the PD's bus address/baud rate.
    Comset { address: u8, baud_rate: u32 },
    /// Begin a secure channel handshake, carrying `cp_random`.
    Chlng([u8; 8]),
    /// Second handshake step, carrying `cp_cryptogram`.
    Scrypt([u8; 16]),
    /// Install a new SCBK on the PD.
    KeySet { scbk: [u8; 16] },
    /// Vendor-specific manufacturer command.
    Mfg { vendor_code: [u8; 3], len: u8 },
    FileTransfer { len: u16 },
    AcuRxSize { bytes: u16 },
    KeepActive { seconds: u16 },
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match self {
            Command::Poll => CommandCode::Poll,
            Command::Id => CommandCode::Id,
            Command::Cap => CommandCode::Cap,
            Command::Lstat => CommandCode::Lstat,
            Command::Istat => CommandCode::Istat,
            Command::Ostat => CommandCode::Ostat,
            Command::Rstat => CommandCode::Rstat,
            Command::Output { .. } => CommandCode::Out,
            Command::Led { .. } => CommandCode::Led,
            Command::Buzzer { .. } => CommandCode::Buz,
            Command::Text { .. } => CommandCode::Text,
            Command::Comset { .. } => CommandCode::Comset,
            Command::Chlng(_) => CommandCode::Chlng,
            Command::Scrypt(_) => CommandCode::Scrypt,
            Command::KeySet { .. } => CommandCode::KeySet,
            Command::Mfg { .. } => CommandCode::Mfg,
            Command::FileTransfer { .. } => CommandCode::FileTransfer,
            Command::AcuRxSize { .. } => CommandCode::AcuRxSize,
            Command::KeepActive { .. } => CommandCode::KeepActive,
        }
    }
}

/// A PD's response to a dispatched [`Command`], as returned by the host's
/// command callback (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Ack,
    Nak(NakCode),
    /// A typed reply, for commands that expect one beyond a bare ACK (e.g.
    /// `MFGREP` for `CMD_MFG`).
    Reply(ReplyCode),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip_through_their_byte_values() {
        for code in [CommandCode::Poll, CommandCode::Cap, CommandCode::KeepActive] {
            let byte: u8 = code.into();
            assert_eq!(CommandCode::try_from(byte), Ok(code));
        }
    }

    #[test]
    fn unknown_command_byte_fails_to_convert() {
        assert!(CommandCode::try_from(0x00u8).is_err());
    }

    #[test]
    fn scs_17_18_are_the_only_encrypted_types() {
        assert!(ScsType::Cmd17.is_encrypted());
        assert!(ScsType::Reply18.is_encrypted());
        assert!(!ScsType::Cmd15.is_encrypted());
        assert!(!ScsType::Chlng.is_encrypted());
    }
}

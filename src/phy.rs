//! Packet codec (`SPEC_FULL.md` §4.E).
//!
//! Frame layout:
//!
//! ```text
//! [MARK=0xFF]? SOM=0x53 ADDR LEN_LSB LEN_MSB CTRL [SBLEN SBTYPE SBDATA...]? PAYLOAD CHK/CRC
//! ```
//!
//! `init`/`finalize` build a frame into a caller-supplied buffer without any
//! intermediate allocation; `check`/`decode` split parsing into "do we have a
//! whole frame yet" and "what does it mean", so the caller can keep feeding
//! a ring buffer without re-parsing bytes it has already rejected.

use crate::cmd::{ReplyCode, ScsType};
use crate::crypto::{checksum8, crc16_ccitt};
use crate::error::{Error, Result};

pub const SOM: u8 = 0x53;
pub const MARK: u8 = 0xFF;

/// Largest frame this crate will build or accept. Generous enough for a
/// `CMD_TEXT`/`CMD_MFG` payload plus secure block and MAC, small enough to
/// live on the stack per PD.
pub const MAX_FRAME: usize = 256;

const CTRL_SQN_MASK: u8 = 0x03;
const CTRL_CRC: u8 = 0x04;
const CTRL_SCB: u8 = 0x08;

/// Outcome of scanning a raw input buffer for one complete frame.
///
/// This is the internal taxonomy: `Wait`/`Skip`/`Busy` never escape a
/// `refresh` call as host-visible errors, they are retry dispositions the
/// role state machines consume themselves (`crate::error::Error`'s doc
/// comment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyOutcome {
    /// Buffer is empty.
    None,
    /// Not enough bytes yet to know; caller must read more before retrying.
    NeedMore,
    /// A length field makes no sense (too short to hold a header+trailer).
    BadFormat,
    /// `n` leading bytes are garbage (no mark/SOM found in them) and should
    /// be discarded; the caller must advance past them and re-check.
    Skip(usize),
    /// A complete frame was found but its CRC/checksum trailer is wrong.
    CheckFailed,
    /// A complete, valid, unencrypted `REPLY_BUSY` frame was found. Detected
    /// here so the caller can reschedule without a full decode.
    Busy,
    /// A complete, valid frame of `len` bytes (from the first `SOM`, mark
    /// excluded) was found.
    Packet(usize),
}

/// Reserves header space in `buf` and returns the offset where the secure
/// block (if any) or payload must be written.
pub fn init(buf: &mut [u8], use_mark: bool) -> usize {
    let mut off = 0;
    if use_mark {
        buf[off] = MARK;
        off += 1;
    }
    buf[off] = SOM;
    off + 1 + 4
}

/// Writes `ADDR`/`LEN`/`CTRL` for a frame whose secure block, payload and
/// (if any) MAC lengths are already known. Returns `som_off`, the offset of
/// `SOM` in `buf` (mark excluded), which callers need to slice out the MAC
/// input (`buf[som_off..header_off + sb_len + payload_len]`) before the MAC
/// itself exists, since the MAC covers these header bytes too.
///
/// Split out of [`finalize`] so a secure-channel-aware caller can write the
/// header, compute the MAC over it plus the secure block and payload, and
/// only then hand the MAC to [`write_trailer`] — rather than the MAC input
/// being limited to bytes the caller happened to have already placed in
/// `buf` before the header existed.
pub fn write_header(
    buf: &mut [u8],
    header_off: usize,
    use_mark: bool,
    address: u8,
    is_reply: bool,
    sequence: u8,
    sb_len: usize,
    payload_len: usize,
    mac_len: usize,
    use_crc: bool,
) -> usize {
    let som_off = header_off - 4 - if use_mark { 1 } else { 0 };
    let addr_off = som_off + 1;
    let len_off = som_off + 2;
    let ctrl_off = som_off + 4;

    let trailer_len = if use_crc { 2 } else { 1 };
    let total_len_from_som = 5 + sb_len + payload_len + mac_len + trailer_len;

    buf[addr_off] = (address & 0x7f) | if is_reply { 0x80 } else { 0 };
    buf[len_off..len_off + 2].copy_from_slice(&(total_len_from_som as u16).to_le_bytes());

    let mut ctrl = sequence & CTRL_SQN_MASK;
    if use_crc {
        ctrl |= CTRL_CRC;
    }
    if sb_len > 0 {
        ctrl |= CTRL_SCB;
    }
    buf[ctrl_off] = ctrl;

    som_off
}

/// Appends `mac` (if any) right after the payload, then computes and
/// appends the CRC/checksum trailer covering everything from `SOM` through
/// the MAC. `som_off` is [`write_header`]'s return value for this frame.
/// Returns the total length of the finished frame, mark included.
#[allow(clippy::too_many_arguments)]
pub fn write_trailer(
    buf: &mut [u8],
    som_off: usize,
    header_off: usize,
    sb_len: usize,
    payload_len: usize,
    mac: Option<&[u8]>,
    use_crc: bool,
) -> usize {
    let mac_len = mac.map_or(0, <[u8]>::len);
    let body_len_from_som = 5 + sb_len + payload_len + mac_len;
    let trailer_len = if use_crc { 2 } else { 1 };

    if let Some(mac) = mac {
        let mac_off = header_off + sb_len + payload_len;
        buf[mac_off..mac_off + mac.len()].copy_from_slice(mac);
    }

    let trailer_off = som_off + body_len_from_som;
    let (body, _) = buf.split_at(trailer_off);
    let body = &body[som_off..];
    if use_crc {
        let crc = crc16_ccitt(body);
        buf[trailer_off..trailer_off + 2].copy_from_slice(&crc.to_le_bytes());
    } else {
        buf[trailer_off] = checksum8(body);
    }

    som_off + body_len_from_som + trailer_len
}

/// Writes `ADDR`/`LEN`/`CTRL`, appends `mac` (if any) right after the
/// payload, then computes and appends the CRC/checksum trailer.
///
/// The caller must already have written `sb_len` bytes of secure block
/// (`[SBLEN][SBTYPE][SBDATA...]`) followed by `payload_len` bytes of payload
/// starting at `header_off` (the offset [`init`] returned). Returns the
/// total length of the finished frame, mark included.
///
/// Convenience wrapper over [`write_header`]/[`write_trailer`] for callers
/// that don't need the MAC to cover the header (plain and unauthenticated
/// frames); secure-channel sends call the two halves directly.
#[allow(clippy::too_many_arguments)]
pub fn finalize(
    buf: &mut [u8],
    header_off: usize,
    use_mark: bool,
    address: u8,
    is_reply: bool,
    sequence: u8,
    sb_len: usize,
    payload_len: usize,
    mac: Option<&[u8]>,
    use_crc: bool,
) -> usize {
    let mac_len = mac.map_or(0, <[u8]>::len);
    let som_off = write_header(buf, header_off, use_mark, address, is_reply, sequence, sb_len, payload_len, mac_len, use_crc);
    write_trailer(buf, som_off, header_off, sb_len, payload_len, mac, use_crc)
}

/// Scans `buf` for one complete frame, per [`PhyOutcome`]. Never advances
/// past an incomplete frame: `buf` is read-only and the caller decides how
/// much to discard based on the outcome.
pub fn check(buf: &[u8], use_mark: bool) -> PhyOutcome {
    if buf.is_empty() {
        return PhyOutcome::None;
    }

    // `use_mark` only governs whether a leading 0xFF is emitted/expected; a
    // mark byte ahead of SOM is not itself garbage, so skipping still hunts
    // for the next SOM either way.
    let _ = use_mark;
    let som_off = match buf.iter().position(|&b| b == SOM) {
        Some(0) => 0,
        Some(pos) => return PhyOutcome::Skip(pos),
        None => return PhyOutcome::Skip(buf.len()),
    };

    if buf.len() < som_off + 5 {
        return PhyOutcome::NeedMore;
    }
    let len = u16::from_le_bytes([buf[som_off + 2], buf[som_off + 3]]) as usize;
    if len < 6 {
        return PhyOutcome::BadFormat;
    }
    let total = som_off + len;
    if buf.len() < total {
        return PhyOutcome::NeedMore;
    }

    let frame = &buf[som_off..total];
    let ctrl = frame[4];
    let use_crc = ctrl & CTRL_CRC != 0;
    let trailer_len = if use_crc { 2 } else { 1 };
    if frame.len() < 5 + trailer_len {
        return PhyOutcome::BadFormat;
    }
    let body = &frame[..frame.len() - trailer_len];
    let valid = if use_crc {
        let got = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        crc16_ccitt(body) == got
    } else {
        checksum8(body) == frame[frame.len() - 1]
    };
    if !valid {
        return PhyOutcome::CheckFailed;
    }

    let has_sb = ctrl & CTRL_SCB != 0;
    let is_reply = frame[1] & 0x80 != 0;
    if is_reply && !has_sb {
        let payload = &frame[5..frame.len() - trailer_len];
        if payload.len() == 1 && payload[0] == ReplyCode::Busy as u8 {
            return PhyOutcome::Busy;
        }
    }

    PhyOutcome::Packet(total)
}

/// A decoded frame's fields, borrowed from the buffer [`check`] validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub address: u8,
    pub is_reply: bool,
    pub sequence: u8,
    pub use_crc: bool,
    pub sb_type: Option<ScsType>,
    pub sb_data: &'a [u8],
    pub payload: &'a [u8],
    pub mac: Option<&'a [u8]>,
}

impl Decoded<'_> {
    /// Byte range of `frame` a MAC (if present) is computed over: `SOM`
    /// through the secure block and payload, excluding the MAC itself and
    /// the CRC/checksum trailer. `None` when the frame carries no MAC.
    pub fn mac_input_len(&self, frame: &[u8]) -> Option<usize> {
        let _ = self.mac?;
        let trailer_len = if self.use_crc { 2 } else { 1 };
        Some(frame.len() - trailer_len - crate::sc::MAC_WIRE_LEN)
    }
}

/// Decodes a frame that [`check`] has already reported as `Packet(_)` (its
/// CRC/checksum has already been verified; this step only parses fields and
/// splits out the secure block and payload). `frame` starts at `SOM`, mark
/// excluded, and is exactly the frame's length.
pub fn decode(frame: &[u8]) -> Result<Decoded<'_>> {
    if frame.len() < 6 || frame[0] != SOM {
        return Err(Error::PacketFormat);
    }
    let addr = frame[1];
    let is_reply = addr & 0x80 != 0;
    let address = addr & 0x7f;
    let ctrl = frame[4];
    let sequence = ctrl & CTRL_SQN_MASK;
    let use_crc = ctrl & CTRL_CRC != 0;
    let has_sb = ctrl & CTRL_SCB != 0;
    let trailer_len = if use_crc { 2 } else { 1 };
    let body_end = frame.len() - trailer_len;

    let mut off = 5;
    let (sb_type, sb_data) = if has_sb {
        if body_end < off + 2 {
            return Err(Error::PacketFormat);
        }
        let sb_len = frame[off] as usize;
        if sb_len < 2 || body_end < off + sb_len {
            return Err(Error::PacketFormat);
        }
        let ty = ScsType::try_from(frame[off + 1]).map_err(|_| Error::PacketFormat)?;
        let data = &frame[off + 2..off + sb_len];
        off += sb_len;
        (Some(ty), data)
    } else {
        (None, &frame[0..0])
    };

    if off > body_end {
        return Err(Error::PacketFormat);
    }

    // Ongoing MAC/ENC packets carry their MAC as a trailer between the
    // payload and the CRC/checksum, rather than inside the secure block
    // (whose SBDATA is only used by the handshake stages).
    let carries_mac = matches!(
        sb_type,
        Some(ScsType::Cmd15) | Some(ScsType::Reply16) | Some(ScsType::Cmd17) | Some(ScsType::Reply18)
    );
    let (payload, mac) = if carries_mac {
        if body_end < off + crate::sc::MAC_WIRE_LEN {
            return Err(Error::PacketFormat);
        }
        let mac_start = body_end - crate::sc::MAC_WIRE_LEN;
        (&frame[off..mac_start], Some(&frame[mac_start..body_end]))
    } else {
        (&frame[off..body_end], None)
    };

    Ok(Decoded {
        address,
        is_reply,
        sequence,
        use_crc,
        sb_type,
        sb_data,
        payload,
        mac,
    })
}

/// Advances a sequence number modulo 4, skipping zero (the reset value).
pub fn next_sequence(prev: u8) -> u8 {
    match prev & CTRL_SQN_MASK {
        0 | 3 => 1,
        n => n + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CommandCode;

    fn encode_simple(buf: &mut [u8], address: u8, is_reply: bool, sequence: u8, payload: &[u8]) -> usize {
        let off = init(buf, false);
        buf[off..off + payload.len()].copy_from_slice(payload);
        finalize(
            buf,
            off,
            false,
            address,
            is_reply,
            sequence,
            0,
            payload.len(),
            None,
            true,
        )
    }

    #[test]
    fn poll_command_round_trips_through_check_and_decode() {
        let mut buf = [0u8; 32];
        let payload = [CommandCode::Poll as u8];
        let len = encode_simple(&mut buf, 0x00, false, 1, &payload);

        match check(&buf[..len], false) {
            PhyOutcome::Packet(n) => assert_eq!(n, len),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let decoded = decode(&buf[..len]).unwrap();
        assert_eq!(decoded.address, 0x00);
        assert!(!decoded.is_reply);
        assert_eq!(decoded.sequence, 1);
        assert!(decoded.use_crc);
        assert_eq!(decoded.sb_type, None);
        assert_eq!(decoded.payload, &payload);
    }

    #[test]
    fn reply_address_bit_is_set_for_replies() {
        let mut buf = [0u8; 32];
        let len = encode_simple(&mut buf, 0x05, true, 2, &[0x40]);
        let decoded = decode(&buf[..len]).unwrap();
        assert_eq!(decoded.address, 0x05);
        assert!(decoded.is_reply);
    }

    #[test]
    fn a_single_flipped_body_byte_fails_the_crc_check() {
        let mut buf = [0u8; 32];
        let len = encode_simple(&mut buf, 0x00, false, 1, &[CommandCode::Poll as u8]);
        buf[5] ^= 0xff;
        assert_eq!(check(&buf[..len], false), PhyOutcome::CheckFailed);
    }

    #[test]
    fn incomplete_frame_asks_for_more_bytes() {
        let mut buf = [0u8; 32];
        let len = encode_simple(&mut buf, 0x00, false, 1, &[CommandCode::Poll as u8]);
        assert_eq!(check(&buf[..len - 1], false), PhyOutcome::NeedMore);
    }

    #[test]
    fn garbage_before_som_is_reported_as_skip() {
        let mut buf = [0u8; 32];
        buf[0] = 0x11;
        buf[1] = 0x22;
        let len = encode_simple(&mut buf[2..], 0x00, false, 1, &[CommandCode::Poll as u8]);
        assert_eq!(check(&buf[..2 + len], false), PhyOutcome::Skip(2));
    }

    #[test]
    fn a_lone_busy_reply_is_detected_without_a_full_decode() {
        let mut buf = [0u8; 32];
        let len = encode_simple(&mut buf, 0x00, true, 1, &[ReplyCode::Busy as u8]);
        assert_eq!(check(&buf[..len], false), PhyOutcome::Busy);
    }

    #[test]
    fn sequence_cycles_one_two_three_skipping_zero() {
        assert_eq!(next_sequence(0), 1);
        assert_eq!(next_sequence(1), 2);
        assert_eq!(next_sequence(2), 3);
        assert_eq!(next_sequence(3), 1);
    }
}

//! PD role state machine (`SPEC_FULL.md` §4.G).
//!
//! One call to [`PdState::tick`] drives the whole
//! `IDLE -> PROCESS_CMD -> SEND_REPLY -> IDLE` cycle for at most one
//! received frame; `ERR` is modeled as an early return plus a phy buffer
//! reset rather than a state the caller has to pump separately, since a PD
//! has nothing useful to do while erroring beyond "forget what it was
//! reading and wait for the next `SOM`".

use crate::channel::Channel;
use crate::clock::Clock;
use crate::cmd::{Command, CommandCode, CommandOutcome, NakCode, ReplyCode, ScsType};
use crate::crypto::BlockCipher;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::flags::PdFlags;
use crate::id::{Capabilities, PdId};
use crate::logger::{osdp_log, LogLevel, Logger};
use crate::phy::{self, PhyOutcome};
use crate::rng::Rng;
use crate::sc::{self, ScState, SecureChannel};
use crate::slab::Slab;

/// Where a tick left the state machine; exposed mainly so tests can assert
/// on it without re-deriving it from side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdPhase {
    Idle,
    ProcessCmd,
    SendReply,
    Err,
}

/// Receives a dispatched [`Command`] and decides ACK/NAK/reply, realizing
/// whatever physical side effect (driving an output, lighting an LED) the
/// host application is responsible for.
pub trait CommandHandler {
    fn handle(&mut self, command: Command) -> CommandOutcome;
}

impl<F> CommandHandler for F
where
    F: FnMut(Command) -> CommandOutcome,
{
    fn handle(&mut self, command: Command) -> CommandOutcome {
        (self)(command)
    }
}

/// Per-PD state: identity, capabilities, secure channel, event queue and
/// the rolling receive buffer. `EVT_CAP` bounds the event queue.
pub struct PdState<const EVT_CAP: usize> {
    pub address: u8,
    pub flags: PdFlags,
    pub id: PdId,
    pub caps: Capabilities,
    pub sc: SecureChannel,
    scbk: Option<[u8; 16]>,
    last_seq: u8,
    phase: PdPhase,
    events: Slab<Event, EVT_CAP>,
    rx: [u8; phy::MAX_FRAME],
    rx_len: usize,
    /// Reply body (reply code + data) built by [`Self::dispatch`], awaiting
    /// framing and transmission by [`Self::write_reply`].
    pending_reply: Option<([u8; phy::MAX_FRAME], usize)>,
    /// Secure block type for a handshake reply in flight (`CCrypt`/`RmacI`);
    /// `None` means "frame normally for the current SC state".
    pending_sb: Option<ScsType>,
}

impl<const EVT_CAP: usize> PdState<EVT_CAP> {
    pub fn new(address: u8, id: PdId, caps: Capabilities) -> Self {
        Self {
            address,
            flags: PdFlags::PD_MODE,
            id,
            caps,
            sc: SecureChannel::new(),
            scbk: None,
            last_seq: 0,
            phase: PdPhase::Idle,
            events: Slab::new(),
            rx: [0; phy::MAX_FRAME],
            rx_len: 0,
            pending_reply: None,
            pending_sb: None,
        }
    }

    pub fn phase(&self) -> PdPhase {
        self.phase
    }

    /// Installs a per-PD SCBK provisioned directly by the host, skipping
    /// master-key derivation.
    pub fn set_scbk(&mut self, scbk: [u8; 16]) {
        self.scbk = Some(scbk);
        self.flags.insert(PdFlags::HAS_SCBK);
    }

    /// Queues an unsolicited event for delivery on the next poll.
    pub fn submit_event(&mut self, event: Event) -> Result<()> {
        self.events.push_back(event)
    }

    fn reset_rx(&mut self) {
        self.rx_len = 0;
        self.phase = PdPhase::Err;
    }

    /// Reads whatever bytes are available, processes at most one complete
    /// frame, and writes the corresponding reply. Returns `Ok(())` whether
    /// or not a frame was available; errors are frame-local conditions that
    /// have already been handled (phy reset, NAK queued) rather than
    /// something the host needs to react to, mirroring `spec.md` §7's
    /// "codec errors are local" policy.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        channel: &mut dyn Channel,
        clock: &dyn Clock,
        cipher: &dyn BlockCipher,
        rng: &mut dyn Rng,
        handler: &mut dyn CommandHandler,
        logger: &mut dyn Logger,
    ) -> Result<()> {
        let _ = clock;
        let n = channel.read(&mut self.rx[self.rx_len..]);
        self.rx_len += n;

        let use_mark = self.flags.contains(PdFlags::PKT_HAS_MARK);
        let result = loop {
            match phy::check(&self.rx[..self.rx_len], use_mark) {
                PhyOutcome::None | PhyOutcome::NeedMore => break Ok(()),
                PhyOutcome::Skip(k) => {
                    self.rx.copy_within(k..self.rx_len, 0);
                    self.rx_len -= k;
                    continue;
                }
                PhyOutcome::BadFormat | PhyOutcome::CheckFailed | PhyOutcome::Busy => {
                    osdp_log!(logger, LogLevel::Warning, "pd {}: malformed frame, resetting phy", self.address);
                    self.reset_rx();
                    break Err(Error::PacketFormat);
                }
                PhyOutcome::Packet(total) => {
                    let mut frame_owned = [0u8; phy::MAX_FRAME];
                    frame_owned[..total].copy_from_slice(&self.rx[..total]);
                    self.rx.copy_within(total..self.rx_len, 0);
                    self.rx_len -= total;
                    break self.process_frame(&frame_owned[..total], cipher, rng, handler, logger);
                }
            }
        };

        if self.pending_reply.is_some() {
            self.write_reply(channel, cipher);
        }
        result
    }

    fn process_frame(
        &mut self,
        frame: &[u8],
        cipher: &dyn BlockCipher,
        rng: &mut dyn Rng,
        handler: &mut dyn CommandHandler,
        logger: &mut dyn Logger,
    ) -> Result<()> {
        self.phase = PdPhase::ProcessCmd;
        let decoded = match phy::decode(frame) {
            Ok(d) => d,
            Err(e) => {
                self.phase = PdPhase::Err;
                return Err(e);
            }
        };

        if decoded.address != self.address && decoded.address != 0x7f {
            self.phase = PdPhase::Idle;
            return Ok(());
        }

        // Sequence 0 is the CP's resync signal, sent whenever it tears its
        // own state down (`CHECK`/`FMT` failure); always accepted, never
        // compared against the expected next sequence.
        let expected = phy::next_sequence(self.last_seq);
        let is_resync = decoded.sequence == 0;
        if !is_resync && decoded.sequence != expected && !self.flags.contains(PdFlags::SKIP_SEQ_CHECK) {
            osdp_log!(logger, LogLevel::Notice, "pd {}: sequence mismatch, expected {} got {}", self.address, expected, decoded.sequence);
            self.phase = PdPhase::Err;
            return self.send_nak(NakCode::SequenceNumber);
        }
        self.last_seq = decoded.sequence;

        let mut payload_buf = [0u8; phy::MAX_FRAME];
        let payload_len = decoded.payload.len();
        payload_buf[..payload_len].copy_from_slice(decoded.payload);

        let plain_len = if let Some(mac) = decoded.mac {
            let mac_input_len = decoded.mac_input_len(frame).expect("mac present");
            let mut mac_scratch = [0u8; phy::MAX_FRAME];
            mac_scratch[..mac_input_len].copy_from_slice(&frame[..mac_input_len]);

            let new_mac = match sc::verify_mac(
                cipher,
                &self.sc.keys.s_mac1,
                &self.sc.keys.s_mac2,
                &self.sc.c_mac,
                &mut mac_scratch,
                mac_input_len,
                mac,
            ) {
                Ok(m) => m,
                Err(_) => {
                    osdp_log!(logger, LogLevel::Error, "pd {}: MAC verification failed, tearing down SC", self.address);
                    self.sc.reset();
                    self.flags.remove(PdFlags::SC_ACTIVE);
                    self.phase = PdPhase::Err;
                    return self.send_nak(NakCode::SecureChannelConditions);
                }
            };
            self.sc.c_mac = new_mac;

            if decoded.sb_type == Some(ScsType::Cmd17) {
                match sc::decrypt_payload(cipher, &self.sc.keys.s_enc, &self.sc.r_mac, &mut payload_buf[..payload_len]) {
                    Ok(len) => len,
                    Err(_) => {
                        self.phase = PdPhase::Err;
                        return self.send_nak(NakCode::SecureChannelConditions);
                    }
                }
            } else {
                payload_len
            }
        } else {
            payload_len
        };

        let reply = self.dispatch(&payload_buf[..plain_len], decoded.sb_type, cipher, rng, handler, logger);
        self.phase = PdPhase::SendReply;
        reply
    }

    fn dispatch(
        &mut self,
        payload: &[u8],
        sb_type: Option<ScsType>,
        cipher: &dyn BlockCipher,
        rng: &mut dyn Rng,
        handler: &mut dyn CommandHandler,
        logger: &mut dyn Logger,
    ) -> Result<()> {
        if payload.is_empty() {
            return self.send_nak(NakCode::CommandLength);
        }
        let code = match CommandCode::try_from(payload[0]) {
            Ok(c) => c,
            Err(_) => return self.send_nak(NakCode::UnknownCommand),
        };

        match code {
            CommandCode::Poll => self.send_poll_reply(),
            CommandCode::Id => {
                let id = self.id;
                self.send_reply_with(ReplyCode::PdId, |buf| {
                    id.encode(&mut buf[..PdId::WIRE_LEN]);
                    PdId::WIRE_LEN
                })
            }
            CommandCode::Cap => self.send_cap_reply(),
            CommandCode::Lstat => self.send_lstat_reply(),
            CommandCode::Comset => self.send_ack(),
            CommandCode::Chlng => self.handle_chlng(payload, cipher, rng),
            CommandCode::Scrypt => self.handle_scrypt(payload, cipher),
            CommandCode::KeySet => self.handle_keyset(payload, sb_type),
            CommandCode::Istat
            | CommandCode::Ostat
            | CommandCode::Rstat
            | CommandCode::Out
            | CommandCode::Led
            | CommandCode::Buz
            | CommandCode::Text
            | CommandCode::Mfg
            | CommandCode::FileTransfer
            | CommandCode::AcuRxSize
            | CommandCode::KeepActive => self.forward_to_host(code, payload, handler, logger),
            _ => self.send_nak(NakCode::UnknownCommand),
        }
    }

    fn forward_to_host(&mut self, code: CommandCode, payload: &[u8], handler: &mut dyn CommandHandler, logger: &mut dyn Logger) -> Result<()> {
        let command = match decode_optional_command(code, payload) {
            Some(c) => c,
            None => return self.send_nak(NakCode::CommandLength),
        };
        match handler.handle(command) {
            CommandOutcome::Ack => self.send_ack(),
            CommandOutcome::Nak(code) => {
                osdp_log!(logger, LogLevel::Info, "pd {}: host NAK'd command: {:?}", self.address, code);
                self.send_nak(code)
            }
            CommandOutcome::Reply(reply_code) => self.send_reply_with(reply_code, |_| 0),
        }
    }

    fn handle_chlng(&mut self, payload: &[u8], cipher: &dyn BlockCipher, rng: &mut dyn Rng) -> Result<()> {
        if payload.len() < 9 || !self.flags.contains(PdFlags::SC_CAPABLE) {
            return self.send_nak(NakCode::SecureChannelUnsupported);
        }
        let mut cp_random = [0u8; 8];
        cp_random.copy_from_slice(&payload[1..9]);
        self.sc.cp_random = cp_random;
        let mut pd_random = [0u8; 8];
        rng.fill(&mut pd_random);
        self.sc.pd_random = pd_random;

        let scbk = self.current_scbk();
        self.sc.keys = sc::derive_session_keys(cipher, &scbk, &cp_random, &pd_random);
        self.sc.state = ScState::Chlng;

        let pd_cryptogram = sc::cryptogram(cipher, &self.sc.keys.s_enc, &cp_random, &pd_random);
        self.pending_sb = Some(ScsType::Ccrypt);
        self.send_reply_with(ReplyCode::CCrypt, |buf| {
            buf[0..8].copy_from_slice(&[0u8; 8]); // pd_client_uid: host-assigned in real deployments
            buf[8..16].copy_from_slice(&pd_random);
            buf[16..32].copy_from_slice(&pd_cryptogram);
            32
        })
    }

    fn handle_scrypt(&mut self, payload: &[u8], cipher: &dyn BlockCipher) -> Result<()> {
        if payload.len() < 17 || self.sc.state != ScState::Chlng {
            self.sc.reset();
            return self.send_nak(NakCode::SecureChannelConditions);
        }
        let mut cp_cryptogram = [0u8; 16];
        cp_cryptogram.copy_from_slice(&payload[1..17]);
        let expected = sc::cryptogram(cipher, &self.sc.keys.s_enc, &self.sc.pd_random, &self.sc.cp_random);
        if expected != cp_cryptogram {
            self.sc.reset();
            return self.send_nak(NakCode::SecureChannelConditions);
        }
        let seed = sc::initial_mac_chain(cipher, &self.sc.keys.s_mac2, &cp_cryptogram);
        self.sc.c_mac = seed;
        self.sc.r_mac = seed;
        self.sc.state = ScState::Active;
        self.flags.insert(PdFlags::SC_ACTIVE);

        self.pending_sb = Some(ScsType::RmacI);
        self.send_reply_with(ReplyCode::RMacI, |buf| {
            buf[..16].copy_from_slice(&seed);
            16
        })
    }

    fn handle_keyset(&mut self, payload: &[u8], sb_type: Option<ScsType>) -> Result<()> {
        if !self.sc.is_active() || sb_type.is_none() || payload.len() < 17 {
            return self.send_nak(NakCode::SecureChannelConditions);
        }
        let mut scbk = [0u8; 16];
        scbk.copy_from_slice(&payload[1..17]);
        self.set_scbk(scbk);
        self.flags.remove(PdFlags::SC_USE_SCBKD);
        self.send_ack()
    }

    fn current_scbk(&self) -> [u8; 16] {
        self.scbk.unwrap_or([0u8; 16])
    }

    fn send_poll_reply(&mut self) -> Result<()> {
        if let Some(event) = self.events.pop_front() {
            let code = event.reply_code();
            return self.send_reply_with(code, |buf| encode_event(&event, buf));
        }
        self.send_ack()
    }

    fn send_cap_reply(&mut self) -> Result<()> {
        let caps = self.caps;
        self.send_reply_with(ReplyCode::PdCap, |buf| {
            let mut n = 0;
            for code in 1u8..=14 {
                let cap = caps.get(crate::id::CapabilityCode::try_from(code).unwrap());
                buf[n] = code;
                buf[n + 1] = cap.compliance_level;
                buf[n + 2] = cap.num_items;
                n += 3;
            }
            n
        })
    }

    fn send_lstat_reply(&mut self) -> Result<()> {
        let tamper = self.flags.contains(PdFlags::TAMPER);
        let power = self.flags.contains(PdFlags::POWER);
        self.send_reply_with(ReplyCode::LstatR, |buf| {
            buf[0] = tamper as u8;
            buf[1] = power as u8;
            2
        })
    }

    fn send_ack(&mut self) -> Result<()> {
        self.send_reply_with(ReplyCode::Ack, |_| 0)
    }

    fn send_nak(&mut self, code: NakCode) -> Result<()> {
        self.send_reply_with(ReplyCode::Nak, |buf| {
            buf[0] = code.into();
            1
        })
    }

    /// Stages a reply body (reply code + fields) for [`Self::write_reply`]
    /// to frame and transmit once dispatch returns.
    fn send_reply_with(&mut self, code: ReplyCode, fill: impl FnOnce(&mut [u8; phy::MAX_FRAME]) -> usize) -> Result<()> {
        let mut buf = [0u8; phy::MAX_FRAME];
        buf[0] = code.into();
        let body_len = fill(&mut buf) + 1;
        self.pending_reply = Some((buf, body_len));
        self.phase = PdPhase::Idle;
        Ok(())
    }

    /// Frames the staged reply and writes it to `channel`, MAC-protecting
    /// and encrypting it if the secure channel is active and this isn't a
    /// handshake-stage reply (those travel in the clear, before any MAC
    /// chain exists).
    fn write_reply(&mut self, channel: &mut dyn Channel, cipher: &dyn BlockCipher) {
        let (body_buf, body_len) = match self.pending_reply.take() {
            Some(v) => v,
            None => return,
        };
        let handshake_sb = self.pending_sb.take();
        let active = self.sc.is_active() && handshake_sb.is_none();
        let encrypt = active && body_len > 1;
        let sb_ty = handshake_sb.or(if active { Some(if encrypt { ScsType::Reply18 } else { ScsType::Reply16 }) } else { None });

        let mut frame_buf = [0u8; phy::MAX_FRAME];
        let use_mark = self.flags.contains(PdFlags::PKT_HAS_MARK);
        let header_off = phy::init(&mut frame_buf, use_mark);

        let mut off = header_off;
        if let Some(ty) = sb_ty {
            frame_buf[off] = 2;
            frame_buf[off + 1] = ty.into();
            off += 2;
        }
        let sb_len = off - header_off;

        frame_buf[off..off + body_len].copy_from_slice(&body_buf[..body_len]);

        let payload_len = if encrypt {
            sc::encrypt_payload(cipher, &self.sc.keys.s_enc, &self.sc.c_mac, &mut frame_buf[off..], body_len)
        } else {
            body_len
        };

        let sequence = self.last_seq;
        let mac_len = if active { sc::MAC_WIRE_LEN } else { 0 };
        let som_off = phy::write_header(&mut frame_buf, header_off, use_mark, self.address, true, sequence, sb_len, payload_len, mac_len, true);

        let mac_full: Option<[u8; 16]> = if active {
            let mac_input_len = off + payload_len - som_off;
            let mut mac_scratch = [0u8; phy::MAX_FRAME];
            mac_scratch[..mac_input_len].copy_from_slice(&frame_buf[som_off..off + payload_len]);
            let new_mac = sc::compute_mac(cipher, &self.sc.keys.s_mac1, &self.sc.keys.s_mac2, &self.sc.r_mac, &mut mac_scratch, mac_input_len);
            self.sc.r_mac = new_mac;
            Some(new_mac)
        } else {
            None
        };

        let total_len = phy::write_trailer(
            &mut frame_buf,
            som_off,
            header_off,
            sb_len,
            payload_len,
            mac_full.as_ref().map(|m| &m[..sc::MAC_WIRE_LEN]),
            true,
        );
        channel.write(&frame_buf[..total_len]);
    }
}

fn decode_optional_command(code: CommandCode, payload: &[u8]) -> Option<Command> {
    let body = &payload[1..];
    Some(match code {
        CommandCode::Istat => Command::Istat,
        CommandCode::Ostat => Command::Ostat,
        CommandCode::Rstat => Command::Rstat,
        CommandCode::Out if body.len() >= 4 => Command::Output {
            output_no: body[0],
            control_code: body[1],
            timer: u16::from_le_bytes([body[2], body[3]]),
        },
        CommandCode::Led if body.len() >= 3 => Command::Led {
            reader_no: body[0],
            led_no: body[1],
            control_code: body[2],
        },
        CommandCode::Buz if body.len() >= 2 => Command::Buzzer {
            reader_no: body[0],
            control_code: body[1],
        },
        CommandCode::Text if !body.is_empty() => Command::Text {
            reader_no: body[0],
            len: (body.len() - 1) as u8,
        },
        CommandCode::Mfg if body.len() >= 3 => Command::Mfg {
            vendor_code: [body[0], body[1], body[2]],
            len: (body.len() - 3) as u8,
        },
        CommandCode::FileTransfer => Command::FileTransfer { len: body.len() as u16 },
        CommandCode::AcuRxSize if body.len() >= 2 => Command::AcuRxSize {
            bytes: u16::from_le_bytes([body[0], body[1]]),
        },
        CommandCode::KeepActive if body.len() >= 2 => Command::KeepActive {
            seconds: u16::from_le_bytes([body[0], body[1]]),
        },
        _ => return None,
    })
}

fn encode_event(event: &Event, buf: &mut [u8; phy::MAX_FRAME]) -> usize {
    match *event {
        Event::CardRead { format, bit_count, data } => {
            buf[0] = format;
            buf[1..3].copy_from_slice(&bit_count.to_le_bytes());
            let n = (bit_count as usize).div_ceil(8);
            buf[3..3 + n].copy_from_slice(&data[..n]);
            3 + n
        }
        Event::Keypress { reader_no, digit } => {
            buf[0] = reader_no;
            buf[1] = digit;
            2
        }
        Event::Tamper(active) => {
            buf[0] = active as u8;
            buf[1] = 0;
            2
        }
        Event::Power(restored) => {
            buf[0] = 0;
            buf[1] = restored as u8;
            2
        }
        Event::Custom { vendor_code, data, len } => {
            buf[0..3].copy_from_slice(&vendor_code);
            buf[3..3 + len as usize].copy_from_slice(&data[..len as usize]);
            3 + len as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::RealAes;
    use crate::id::Capabilities;

    struct NoopHandler;
    impl CommandHandler for NoopHandler {
        fn handle(&mut self, _command: Command) -> CommandOutcome {
            CommandOutcome::Ack
        }
    }

    fn pd() -> PdState<4> {
        PdState::new(0, PdId::default(), Capabilities::new())
    }

    #[test]
    fn istat_ostat_rstat_are_forwarded_to_the_host_handler_rather_than_bare_ackd() {
        struct RecordingHandler(Option<Command>);
        impl CommandHandler for RecordingHandler {
            fn handle(&mut self, command: Command) -> CommandOutcome {
                self.0 = Some(command);
                CommandOutcome::Reply(ReplyCode::IstatR)
            }
        }

        let mut state = pd();
        let cipher = RealAes;
        let mut rng = crate::rng::CountingRng(0);
        let mut handler = RecordingHandler(None);
        let mut logger = crate::logger::NullLogger;
        state
            .dispatch(&[CommandCode::Istat as u8], None, &cipher, &mut rng, &mut handler, &mut logger)
            .unwrap();
        assert_eq!(handler.0, Some(Command::Istat));
        let (buf, _) = state.pending_reply.unwrap();
        assert_eq!(buf[0], ReplyCode::IstatR as u8);
    }

    #[test]
    fn poll_with_no_queued_events_acks() {
        let mut state = pd();
        let payload = [CommandCode::Poll as u8];
        let cipher = RealAes;
        let mut rng = crate::rng::CountingRng(0);
        let mut handler = NoopHandler;
        let mut logger = crate::logger::NullLogger;
        state
            .dispatch(&payload, None, &cipher, &mut rng, &mut handler, &mut logger)
            .unwrap();
        let (buf, len) = state.pending_reply.unwrap();
        assert_eq!(buf[0], ReplyCode::Ack as u8);
        assert_eq!(len, 1);
    }

    #[test]
    fn poll_delivers_one_queued_event_per_call() {
        let mut state = pd();
        state.submit_event(Event::Tamper(true)).unwrap();
        state.submit_event(Event::Power(true)).unwrap();
        let payload = [CommandCode::Poll as u8];
        let cipher = RealAes;
        let mut rng = crate::rng::CountingRng(0);
        let mut handler = NoopHandler;
        let mut logger = crate::logger::NullLogger;

        state
            .dispatch(&payload, None, &cipher, &mut rng, &mut handler, &mut logger)
            .unwrap();
        let (buf, _) = state.pending_reply.unwrap();
        assert_eq!(buf[0], ReplyCode::LstatR as u8);
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn unknown_command_byte_is_nakd() {
        let mut state = pd();
        let cipher = RealAes;
        let mut rng = crate::rng::CountingRng(0);
        let mut handler = NoopHandler;
        let mut logger = crate::logger::NullLogger;
        state.dispatch(&[0x00], None, &cipher, &mut rng, &mut handler, &mut logger).unwrap();
        let (buf, len) = state.pending_reply.unwrap();
        assert_eq!(buf[0], ReplyCode::Nak as u8);
        assert_eq!(len, 2);
        assert_eq!(buf[1], NakCode::UnknownCommand as u8);
    }

    #[test]
    fn id_request_replies_with_the_pd_identity() {
        let mut state = pd();
        state.id = PdId {
            vendor_code: [1, 2, 3],
            model: 4,
            version: 5,
            serial: [6, 7, 8, 9],
            firmware_version: [1, 0, 0],
        };
        let cipher = RealAes;
        let mut rng = crate::rng::CountingRng(0);
        let mut handler = NoopHandler;
        let mut logger = crate::logger::NullLogger;
        state
            .dispatch(&[CommandCode::Id as u8], None, &cipher, &mut rng, &mut handler, &mut logger)
            .unwrap();
        let (buf, len) = state.pending_reply.unwrap();
        assert_eq!(buf[0], ReplyCode::PdId as u8);
        assert_eq!(len, 1 + PdId::WIRE_LEN);
        assert_eq!(PdId::decode(&buf[1..1 + PdId::WIRE_LEN]).unwrap(), state.id);
    }

    #[test]
    fn full_tick_round_trip_over_a_loopback_channel_produces_an_ack() {
        use crate::channel::loopback::LoopbackChannel;
        use crate::clock::StepClock;

        let (mut cp_side, mut pd_side) = LoopbackChannel::pair(1, 2);
        let clock = StepClock::new();
        let cipher = RealAes;
        let mut rng = crate::rng::CountingRng(0);
        let mut handler = NoopHandler;
        let mut logger = crate::logger::NullLogger;
        let mut state = pd();

        let mut frame_buf = [0u8; phy::MAX_FRAME];
        let off = phy::init(&mut frame_buf, false);
        frame_buf[off] = CommandCode::Poll as u8;
        let len = phy::finalize(&mut frame_buf, off, false, 0, false, 1, 0, 1, None, true);
        cp_side.write(&frame_buf[..len]);

        state.tick(&mut pd_side, &clock, &cipher, &mut rng, &mut handler, &mut logger).unwrap();
        assert_eq!(state.phase(), PdPhase::Idle);

        let mut reply_buf = [0u8; phy::MAX_FRAME];
        let n = cp_side.read(&mut reply_buf);
        let decoded = phy::decode(&reply_buf[..n]).unwrap();
        assert_eq!(decoded.payload, &[ReplyCode::Ack as u8]);
    }
}

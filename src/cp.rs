//! CP role state machine and scheduler (`SPEC_FULL.md` §4.H, §4.I).
//!
//! One [`CpPd::tick`] call drives at most one "unit of work" for a single
//! PD: either processing whatever reply bytes are waiting, or — if nothing
//! is outstanding — deciding what to send next. The outer round-robin over
//! every PD on a context lives in `CpContext::refresh` (`lib.rs`); this
//! module only knows about one PD's bring-up/online state, mirroring
//! `pd.rs`'s split between the per-PD state machine and the host-facing
//! context that owns an array of them.

use crate::channel::{Channel, ChannelId};
use crate::clock::Clock;
use crate::cmd::{Command, CommandCode, NakCode, ReplyCode, ScsType};
use crate::crypto::BlockCipher;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::flags::PdFlags;
use crate::id::{Capabilities, Capability, CapabilityCode, PdId};
use crate::logger::{osdp_log, LogLevel, Logger};
use crate::phy::{self, PhyOutcome};
use crate::rng::Rng;
use crate::sc::{self, ScState, SecureChannel};
use crate::slab::Slab;

/// Default reply timeout, in the "hundreds of ms" range `spec.md` §5 calls
/// for. Overridable per PD via [`PdConfig::reply_timeout_ms`].
pub const DEFAULT_REPLY_TIMEOUT_MS: i64 = 200;
/// Default spacing between polls while `ONLINE` and the command queue is
/// empty.
pub const DEFAULT_POLL_INTERVAL_MS: i64 = 50;
/// Consecutive reply timeouts before a PD is declared `OFFLINE`.
pub const MAX_CONSECUTIVE_MISSES: u8 = 3;
/// Consecutive `WAIT`/format retries of the same packet before escalating
/// to a miss (and forcing a sequence resync).
pub const MAX_RETRY_COUNT: u8 = 3;
/// Initial `OFFLINE` backoff before the first re-bring-up attempt.
pub const OFFLINE_BACKOFF_INITIAL_MS: i64 = 1_000;
/// Ceiling the backoff grows towards on repeated bring-up failure.
pub const OFFLINE_BACKOFF_MAX_MS: i64 = 30_000;
/// Upper bound on distinct physical channels one [`ChannelLock`] can
/// arbitrate. Generous for any bus this crate is likely to see wired up.
pub const MAX_CHANNELS: usize = 32;

/// Per-PD bring-up/online state (`spec.md` §4.H): `INIT -> IDREQ -> CAPDET
/// -> (SC_INIT -> SC_CHLNG -> SC_SCRYPT -> [SET_SCBK] ->) ONLINE`, with
/// `OFFLINE` reachable from any awaiting state after too many misses.
///
/// `Init` and `ScInit` are never "awaited": entering them immediately
/// builds and sends a command and moves on to the corresponding awaiting
/// phase in the same [`CpPd::tick`] call, matching the instant
/// decide-then-send step `spec.md` describes for those two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpPdPhase {
    Init,
    IdReq,
    CapDet,
    ScInit,
    ScChlng,
    ScScrypt,
    SetScbk,
    Online,
    Offline,
}

/// Terminal disposition of a submitted command, reported to the host's
/// [`CommandCompleteCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDisposition {
    /// The PD ACK'd the command.
    Delivered,
    /// The PD NAK'd the command with this reason.
    Nakd(NakCode),
    /// The command was evicted because the PD went `OFFLINE` before it
    /// could be delivered.
    Evicted,
}

/// An [`Event`] delivered by a PD's poll reply, tagged with the index of
/// the PD that produced it.
pub trait EventCallback {
    fn handle(&mut self, pd_index: usize, event: Event);
}

impl<F> EventCallback for F
where
    F: FnMut(usize, Event),
{
    fn handle(&mut self, pd_index: usize, event: Event) {
        (self)(pd_index, event)
    }
}

/// Notified once a command submitted via [`CpPd::submit_command`] reaches a
/// terminal state.
pub trait CommandCompleteCallback {
    fn handle(&mut self, pd_index: usize, token: u32, disposition: CommandDisposition);
}

impl<F> CommandCompleteCallback for F
where
    F: FnMut(usize, u32, CommandDisposition),
{
    fn handle(&mut self, pd_index: usize, token: u32, disposition: CommandDisposition) {
        (self)(pd_index, token, disposition)
    }
}

/// Arbitrates transmit access to a physical channel shared by several PDs
/// (`spec.md` §4.H "channel sharing"). A PD may only send while it holds
/// the slot for its [`ChannelId`]; the slot frees on full frame receipt,
/// timeout, or an aborted exchange.
pub struct ChannelLock {
    slots: [Option<(ChannelId, usize)>; MAX_CHANNELS],
}

impl ChannelLock {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_CHANNELS],
        }
    }

    /// Attempts to acquire `id` for `pd_index`. Returns `true` if the PD
    /// already holds it or the channel was free; `false` if another PD
    /// holds it (the caller must wait) or the table is full.
    pub fn try_acquire(&mut self, id: ChannelId, pd_index: usize) -> bool {
        for slot in self.slots.iter() {
            if let Some((cid, holder)) = slot {
                if *cid == id {
                    return *holder == pd_index;
                }
            }
        }
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some((id, pd_index));
                return true;
            }
        }
        false
    }

    pub fn release(&mut self, id: ChannelId, pd_index: usize) {
        for slot in self.slots.iter_mut() {
            if *slot == Some((id, pd_index)) {
                *slot = None;
            }
        }
    }
}

impl Default for ChannelLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Static configuration for one PD on a CP's bus (`pd_info` in `spec.md`
/// §6).
#[derive(Debug, Clone, Copy)]
pub struct PdConfig {
    pub address: u8,
    pub baud_rate: u32,
    pub channel_id: ChannelId,
    /// A host-provisioned SCBK. `None` means "derive from the context's
    /// master key the first time SC bring-up succeeds", starting from the
    /// well-known [`sc::SCBKD`] for that first handshake.
    pub scbk: Option<[u8; 16]>,
    pub reply_timeout_ms: Option<i64>,
    pub poll_interval_ms: Option<i64>,
}

impl PdConfig {
    pub fn new(address: u8, baud_rate: u32, channel_id: ChannelId) -> Self {
        Self {
            address,
            baud_rate,
            channel_id,
            scbk: None,
            reply_timeout_ms: None,
            poll_interval_ms: None,
        }
    }

    pub fn with_scbk(mut self, scbk: [u8; 16]) -> Self {
        self.scbk = Some(scbk);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedCommand {
    token: u32,
    command: Command,
}

/// One PD as tracked by a CP: bring-up state, secure channel, the pending
/// command queue, and the rolling receive buffer.
///
/// `CMD_CAP` bounds the per-PD command queue (`OSDP_CP_CMD_POOL_SIZE` in
/// the reference header).
pub struct CpPd<const CMD_CAP: usize> {
    pub address: u8,
    pub baud_rate: u32,
    channel_id: ChannelId,
    flags: PdFlags,
    id: PdId,
    caps: Capabilities,
    sc: SecureChannel,
    scbk: Option<[u8; 16]>,
    handshake_scbk: [u8; 16],
    pending_scbk: [u8; 16],
    pd_client_uid: [u8; 8],
    cp_cryptogram: [u8; 16],
    master_key: Option<[u8; 16]>,
    sc_disabled: bool,

    phase: CpPdPhase,
    seq: u8,
    resync: bool,
    pending_seq: u8,
    await_resp: bool,
    in_flight_token: Option<u32>,

    reply_timeout_ms: i64,
    poll_interval_ms: i64,
    phy_tstamp: i64,
    last_activity: i64,
    last_poll_at: i64,
    miss_count: u8,
    retry_count: u8,
    offline_backoff_ms: i64,
    next_retry_at: i64,

    cmd_queue: Slab<QueuedCommand, CMD_CAP>,
    next_token: u32,

    rx: [u8; phy::MAX_FRAME],
    rx_len: usize,
}

impl<const CMD_CAP: usize> CpPd<CMD_CAP> {
    pub fn new(config: PdConfig, master_key: Option<[u8; 16]>, sc_disabled: bool) -> Self {
        let mut flags = PdFlags::empty();
        if config.scbk.is_some() {
            flags.insert(PdFlags::HAS_SCBK);
        }
        Self {
            address: config.address,
            baud_rate: config.baud_rate,
            channel_id: config.channel_id,
            flags,
            id: PdId::default(),
            caps: Capabilities::new(),
            sc: SecureChannel::new(),
            scbk: config.scbk,
            handshake_scbk: [0; 16],
            pending_scbk: [0; 16],
            pd_client_uid: [0; 8],
            cp_cryptogram: [0; 16],
            master_key,
            sc_disabled,

            phase: CpPdPhase::Init,
            seq: 0,
            resync: true,
            pending_seq: 0,
            await_resp: false,
            in_flight_token: None,

            reply_timeout_ms: config.reply_timeout_ms.unwrap_or(DEFAULT_REPLY_TIMEOUT_MS),
            poll_interval_ms: config.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            phy_tstamp: 0,
            last_activity: 0,
            last_poll_at: 0,
            miss_count: 0,
            retry_count: 0,
            offline_backoff_ms: OFFLINE_BACKOFF_INITIAL_MS,
            next_retry_at: 0,

            cmd_queue: Slab::new(),
            next_token: 1,

            rx: [0; phy::MAX_FRAME],
            rx_len: 0,
        }
    }

    pub fn phase(&self) -> CpPdPhase {
        self.phase
    }

    pub fn is_online(&self) -> bool {
        self.phase == CpPdPhase::Online
    }

    pub fn id(&self) -> PdId {
        self.id
    }

    pub fn caps(&self) -> Capabilities {
        self.caps
    }

    pub fn flags(&self) -> PdFlags {
        self.flags
    }

    pub fn queue_len(&self) -> usize {
        self.cmd_queue.len()
    }

    /// Enqueues `command` for delivery the next time this PD is `ONLINE`
    /// and has no command in flight. Returns a token the host can match
    /// against the eventual [`CommandCompleteCallback`] notification.
    pub fn submit_command(&mut self, command: Command) -> Result<u32> {
        let token = self.next_token;
        self.cmd_queue.push_back(QueuedCommand { token, command })?;
        self.next_token = self.next_token.wrapping_add(1).max(1);
        Ok(token)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        pd_index: usize,
        channel: &mut dyn Channel,
        channel_lock: &mut ChannelLock,
        clock: &dyn Clock,
        cipher: &dyn BlockCipher,
        rng: &mut dyn Rng,
        event_cb: &mut dyn EventCallback,
        complete_cb: &mut dyn CommandCompleteCallback,
        logger: &mut dyn Logger,
    ) -> Result<()> {
        let now = clock.now_ms();

        if self.phase == CpPdPhase::Offline {
            if now >= self.next_retry_at {
                osdp_log!(logger, LogLevel::Info, "pd {}: retrying bring-up after backoff", self.address);
                self.phase = CpPdPhase::Init;
                self.miss_count = 0;
                self.retry_count = 0;
                self.resync = true;
            }
            return Ok(());
        }

        if self.await_resp {
            let n = channel.read(&mut self.rx[self.rx_len..]);
            self.rx_len += n;
            let use_mark = self.flags.contains(PdFlags::PKT_HAS_MARK);

            match phy::check(&self.rx[..self.rx_len], use_mark) {
                PhyOutcome::None | PhyOutcome::NeedMore => {
                    if now - self.phy_tstamp >= self.reply_timeout_ms {
                        osdp_log!(logger, LogLevel::Notice, "pd {}: reply timeout", self.address);
                        self.register_miss(pd_index, now, channel_lock, complete_cb, logger);
                    }
                }
                PhyOutcome::Skip(k) => {
                    self.rx.copy_within(k..self.rx_len, 0);
                    self.rx_len -= k;
                }
                PhyOutcome::BadFormat | PhyOutcome::CheckFailed => {
                    self.rx_len = 0;
                    osdp_log!(logger, LogLevel::Warning, "pd {}: malformed reply", self.address);
                    self.on_decode_error(pd_index, now, channel_lock, complete_cb, logger);
                }
                PhyOutcome::Busy => {
                    self.rx_len = 0;
                    osdp_log!(logger, LogLevel::Debug, "pd {}: busy, rescheduling", self.address);
                    self.await_resp = false;
                    channel_lock.release(self.channel_id, pd_index);
                }
                PhyOutcome::Packet(total) => {
                    let mut frame = [0u8; phy::MAX_FRAME];
                    frame[..total].copy_from_slice(&self.rx[..total]);
                    self.rx.copy_within(total..self.rx_len, 0);
                    self.rx_len -= total;
                    self.await_resp = false;
                    self.handle_reply(pd_index, &frame[..total], now, channel_lock, cipher, event_cb, complete_cb, logger);
                }
            }
            return Ok(());
        }

        self.maybe_send(pd_index, channel, channel_lock, clock, cipher, rng, logger);
        Ok(())
    }

    fn register_miss(
        &mut self,
        pd_index: usize,
        now: i64,
        channel_lock: &mut ChannelLock,
        complete_cb: &mut dyn CommandCompleteCallback,
        logger: &mut dyn Logger,
    ) {
        self.await_resp = false;
        channel_lock.release(self.channel_id, pd_index);
        self.miss_count = self.miss_count.saturating_add(1);
        if self.miss_count >= MAX_CONSECUTIVE_MISSES {
            osdp_log!(logger, LogLevel::Warning, "pd {}: offline after {} consecutive misses", self.address, self.miss_count);
            self.go_offline(pd_index, now, complete_cb);
        }
    }

    fn go_offline(&mut self, pd_index: usize, now: i64, complete_cb: &mut dyn CommandCompleteCallback) {
        while let Some(q) = self.cmd_queue.pop_front() {
            complete_cb.handle(pd_index, q.token, CommandDisposition::Evicted);
        }
        self.sc.reset();
        self.flags.remove(PdFlags::SC_ACTIVE);
        self.phase = CpPdPhase::Offline;
        self.resync = true;
        self.next_retry_at = now + self.offline_backoff_ms;
        self.offline_backoff_ms = (self.offline_backoff_ms * 2).min(OFFLINE_BACKOFF_MAX_MS);
    }

    /// `FMT`/`CHECK`-class failure: tear down to resync per `spec.md` §7.
    fn on_decode_error(
        &mut self,
        pd_index: usize,
        now: i64,
        channel_lock: &mut ChannelLock,
        complete_cb: &mut dyn CommandCompleteCallback,
        logger: &mut dyn Logger,
    ) {
        self.resync = true;
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count > MAX_RETRY_COUNT {
            self.retry_count = 0;
            self.register_miss(pd_index, now, channel_lock, complete_cb, logger);
        } else {
            self.await_resp = false;
            channel_lock.release(self.channel_id, pd_index);
        }
    }

    /// `WAIT`-class disposition: retry the same outstanding exchange, per
    /// `spec.md` §4.E's sequence policy.
    fn on_sequence_mismatch(
        &mut self,
        pd_index: usize,
        now: i64,
        channel_lock: &mut ChannelLock,
        complete_cb: &mut dyn CommandCompleteCallback,
        logger: &mut dyn Logger,
    ) {
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count > MAX_RETRY_COUNT {
            self.retry_count = 0;
            self.resync = true;
            self.register_miss(pd_index, now, channel_lock, complete_cb, logger);
        } else {
            self.await_resp = false;
            channel_lock.release(self.channel_id, pd_index);
        }
    }

    /// Any secure channel failure (MAC, cryptogram mismatch, bad handshake
    /// reply): torn down to `SC_INIT`, or straight to plaintext `ONLINE` if
    /// SC was never required (`spec.md` §4.F "Failure semantics").
    fn sc_failure(
        &mut self,
        pd_index: usize,
        now: i64,
        channel_lock: &mut ChannelLock,
        complete_cb: &mut dyn CommandCompleteCallback,
        logger: &mut dyn Logger,
    ) {
        osdp_log!(logger, LogLevel::Error, "pd {}: secure channel handshake failed", self.address);
        self.sc.reset();
        self.flags.remove(PdFlags::SC_ACTIVE);
        self.phase = if self.sc_disabled || self.master_key.is_none() {
            CpPdPhase::Online
        } else {
            CpPdPhase::ScInit
        };
        self.register_miss(pd_index, now, channel_lock, complete_cb, logger);
    }

    fn parse_caps(&mut self, body: &[u8]) {
        let mut caps = Capabilities::new();
        for chunk in body.chunks_exact(3) {
            if let Ok(code) = CapabilityCode::try_from(chunk[0]) {
                caps.set(
                    code,
                    Capability {
                        compliance_level: chunk[1],
                        num_items: chunk[2],
                    },
                );
            }
        }
        self.caps = caps;
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_reply(
        &mut self,
        pd_index: usize,
        frame: &[u8],
        now: i64,
        channel_lock: &mut ChannelLock,
        cipher: &dyn BlockCipher,
        event_cb: &mut dyn EventCallback,
        complete_cb: &mut dyn CommandCompleteCallback,
        logger: &mut dyn Logger,
    ) {
        channel_lock.release(self.channel_id, pd_index);

        let decoded = match phy::decode(frame) {
            Ok(d) => d,
            Err(_) => {
                self.on_decode_error(pd_index, now, channel_lock, complete_cb, logger);
                return;
            }
        };
        if !decoded.is_reply || decoded.address != self.address {
            return;
        }
        if decoded.sequence != self.pending_seq {
            osdp_log!(logger, LogLevel::Notice, "pd {}: sequence mismatch, expected {} got {}", self.address, self.pending_seq, decoded.sequence);
            self.on_sequence_mismatch(pd_index, now, channel_lock, complete_cb, logger);
            return;
        }
        self.seq = self.pending_seq;
        self.resync = false;

        let mut payload_buf = [0u8; phy::MAX_FRAME];
        let payload_len = decoded.payload.len();
        payload_buf[..payload_len].copy_from_slice(decoded.payload);

        let plain_len = if let Some(mac) = decoded.mac {
            let mac_input_len = decoded.mac_input_len(frame).expect("mac present");
            let mut mac_scratch = [0u8; phy::MAX_FRAME];
            mac_scratch[..mac_input_len].copy_from_slice(&frame[..mac_input_len]);

            let new_mac = match sc::verify_mac(cipher, &self.sc.keys.s_mac1, &self.sc.keys.s_mac2, &self.sc.r_mac, &mut mac_scratch, mac_input_len, mac) {
                Ok(m) => m,
                Err(_) => {
                    self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
                    return;
                }
            };
            self.sc.r_mac = new_mac;

            if decoded.sb_type == Some(ScsType::Reply18) {
                match sc::decrypt_payload(cipher, &self.sc.keys.s_enc, &self.sc.c_mac, &mut payload_buf[..payload_len]) {
                    Ok(len) => len,
                    Err(_) => {
                        self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
                        return;
                    }
                }
            } else {
                payload_len
            }
        } else {
            payload_len
        };

        if plain_len == 0 {
            self.on_decode_error(pd_index, now, channel_lock, complete_cb, logger);
            return;
        }
        let payload = &payload_buf[..plain_len];
        let reply_code = match ReplyCode::try_from(payload[0]) {
            Ok(c) => c,
            Err(_) => {
                self.on_decode_error(pd_index, now, channel_lock, complete_cb, logger);
                return;
            }
        };

        self.miss_count = 0;
        self.retry_count = 0;
        self.last_activity = now;

        match self.phase {
            CpPdPhase::IdReq => {
                if reply_code == ReplyCode::PdId {
                    if let Some(id) = PdId::decode(&payload[1..]) {
                        self.id = id;
                        self.phase = CpPdPhase::CapDet;
                    }
                }
            }
            CpPdPhase::CapDet => {
                if reply_code == ReplyCode::PdCap {
                    self.parse_caps(&payload[1..]);
                    let sc_capable = self.caps.supports(CapabilityCode::CommunicationSecurity);
                    self.flags.set(PdFlags::SC_CAPABLE, sc_capable);
                    let require_sc = self.master_key.is_some() && !self.sc_disabled && sc_capable;
                    self.phase = if require_sc { CpPdPhase::ScInit } else { CpPdPhase::Online };
                    if self.phase == CpPdPhase::Online {
                        self.offline_backoff_ms = OFFLINE_BACKOFF_INITIAL_MS;
                    }
                }
            }
            CpPdPhase::ScChlng => {
                if reply_code == ReplyCode::CCrypt && payload.len() >= 33 {
                    let mut pd_client_uid = [0u8; 8];
                    pd_client_uid.copy_from_slice(&payload[1..9]);
                    let mut pd_random = [0u8; 8];
                    pd_random.copy_from_slice(&payload[9..17]);
                    let mut pd_cryptogram = [0u8; 16];
                    pd_cryptogram.copy_from_slice(&payload[17..33]);

                    let keys = sc::derive_session_keys(cipher, &self.handshake_scbk, &self.sc.cp_random, &pd_random);
                    let expected = sc::cryptogram(cipher, &keys.s_enc, &self.sc.cp_random, &pd_random);
                    if expected != pd_cryptogram {
                        self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
                        return;
                    }
                    self.sc.keys = keys;
                    self.sc.pd_random = pd_random;
                    self.pd_client_uid = pd_client_uid;
                    self.cp_cryptogram = sc::cryptogram(cipher, &keys.s_enc, &pd_random, &self.sc.cp_random);
                    self.phase = CpPdPhase::ScScrypt;
                } else {
                    self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
                }
            }
            CpPdPhase::ScScrypt => {
                if reply_code == ReplyCode::RMacI && payload.len() >= 17 {
                    let mut seed = [0u8; 16];
                    seed.copy_from_slice(&payload[1..17]);
                    let expected = sc::initial_mac_chain(cipher, &self.sc.keys.s_mac2, &self.cp_cryptogram);
                    if expected != seed {
                        self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
                        return;
                    }
                    self.sc.c_mac = seed;
                    self.sc.r_mac = seed;
                    self.sc.state = ScState::Active;
                    self.flags.insert(PdFlags::SC_ACTIVE);

                    self.phase = if self.flags.contains(PdFlags::SC_USE_SCBKD) && self.master_key.is_some() {
                        self.pending_scbk = sc::derive_scbk(cipher, self.master_key.as_ref().unwrap(), &self.pd_client_uid);
                        CpPdPhase::SetScbk
                    } else {
                        CpPdPhase::Online
                    };
                    if self.phase == CpPdPhase::Online {
                        self.offline_backoff_ms = OFFLINE_BACKOFF_INITIAL_MS;
                    }
                } else {
                    self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
                }
            }
            CpPdPhase::SetScbk => {
                if reply_code == ReplyCode::Ack {
                    self.scbk = Some(self.pending_scbk);
                    self.flags.insert(PdFlags::HAS_SCBK);
                    self.flags.remove(PdFlags::SC_USE_SCBKD);
                    self.phase = CpPdPhase::Online;
                    self.offline_backoff_ms = OFFLINE_BACKOFF_INITIAL_MS;
                } else {
                    self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
                }
            }
            CpPdPhase::Online => {
                self.handle_online_reply(pd_index, now, channel_lock, reply_code, payload, event_cb, complete_cb, logger);
            }
            CpPdPhase::Init | CpPdPhase::ScInit | CpPdPhase::Offline => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_online_reply(
        &mut self,
        pd_index: usize,
        now: i64,
        channel_lock: &mut ChannelLock,
        reply_code: ReplyCode,
        payload: &[u8],
        event_cb: &mut dyn EventCallback,
        complete_cb: &mut dyn CommandCompleteCallback,
        logger: &mut dyn Logger,
    ) {
        let token = self.in_flight_token.take();
        let mut nak = None;
        match reply_code {
            ReplyCode::Nak => {
                nak = Some(payload.get(1).copied().and_then(|b| NakCode::try_from(b).ok()).unwrap_or(NakCode::UnknownCommand));
            }
            ReplyCode::LstatR if payload.len() >= 3 => {
                let tamper = payload[1] != 0;
                let power = payload[2] != 0;
                self.flags.set(PdFlags::TAMPER, tamper);
                self.flags.set(PdFlags::POWER, power);
                event_cb.handle(pd_index, Event::Tamper(tamper));
                event_cb.handle(pd_index, Event::Power(power));
            }
            ReplyCode::Raw | ReplyCode::KeyPad | ReplyCode::MfgRep => {
                if let Some(event) = decode_event(reply_code, payload) {
                    event_cb.handle(pd_index, event);
                }
            }
            _ => {}
        }

        // Any reply code completes the in-flight command, not just Ack/Nak:
        // a submitted LSTAT/ISTAT/OSTAT/RSTAT gets its specific *R reply back,
        // never a bare Ack, and that must still pop the queue and fire the
        // completion callback or the same command re-sends forever and wedges
        // every command queued behind it.
        if let Some(t) = token {
            self.cmd_queue.pop_front();
            let disposition = match nak {
                Some(code) => CommandDisposition::Nakd(code),
                None => CommandDisposition::Delivered,
            };
            complete_cb.handle(pd_index, t, disposition);
        }

        // The PD only ever returns these two NAK codes when it has torn its
        // own secure channel down (`spec.md` §4.F); follow it back to
        // `SC_INIT` rather than keep MAC-chaining frames the PD can no longer
        // verify.
        if self.sc.is_active() && matches!(nak, Some(NakCode::SecureChannelConditions) | Some(NakCode::SecureChannelUnsupported)) {
            self.sc_failure(pd_index, now, channel_lock, complete_cb, logger);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn maybe_send(
        &mut self,
        pd_index: usize,
        channel: &mut dyn Channel,
        channel_lock: &mut ChannelLock,
        clock: &dyn Clock,
        cipher: &dyn BlockCipher,
        rng: &mut dyn Rng,
        logger: &mut dyn Logger,
    ) {
        if !channel_lock.try_acquire(self.channel_id, pd_index) {
            return;
        }
        let now = clock.now_ms();

        match self.phase {
            CpPdPhase::Init => {
                self.send_frame(channel, cipher, now, CommandCode::Id, &[], None);
                self.phase = CpPdPhase::IdReq;
            }
            CpPdPhase::IdReq => self.send_frame(channel, cipher, now, CommandCode::Id, &[], None),
            CpPdPhase::CapDet => self.send_frame(channel, cipher, now, CommandCode::Cap, &[], None),
            CpPdPhase::ScInit => {
                self.handshake_scbk = match self.scbk {
                    Some(k) => {
                        self.flags.remove(PdFlags::SC_USE_SCBKD);
                        k
                    }
                    None => {
                        self.flags.insert(PdFlags::SC_USE_SCBKD);
                        sc::SCBKD
                    }
                };
                osdp_log!(logger, LogLevel::Info, "pd {}: starting secure channel handshake", self.address);
                let mut cp_random = [0u8; 8];
                rng.fill(&mut cp_random);
                self.sc.cp_random = cp_random;
                self.send_frame(channel, cipher, now, CommandCode::Chlng, &cp_random, Some(ScsType::Chlng));
                self.phase = CpPdPhase::ScChlng;
            }
            CpPdPhase::ScChlng => {
                let cp_random = self.sc.cp_random;
                self.send_frame(channel, cipher, now, CommandCode::Chlng, &cp_random, Some(ScsType::Chlng));
            }
            CpPdPhase::ScScrypt => {
                let cc = self.cp_cryptogram;
                self.send_frame(channel, cipher, now, CommandCode::Scrypt, &cc, Some(ScsType::Scrypt));
            }
            CpPdPhase::SetScbk => {
                let k = self.pending_scbk;
                self.send_frame(channel, cipher, now, CommandCode::KeySet, &k, None);
            }
            CpPdPhase::Online => {
                let poll_due = now - self.last_poll_at >= self.poll_interval_ms;
                if !self.cmd_queue.is_empty() {
                    let q = *self.cmd_queue.peek_front().unwrap();
                    self.in_flight_token = Some(q.token);
                    let mut buf = [0u8; phy::MAX_FRAME];
                    let n = encode_command_fields(&q.command, &mut buf);
                    self.send_frame(channel, cipher, now, q.command.code(), &buf[..n], None);
                } else if poll_due {
                    self.in_flight_token = None;
                    self.send_frame(channel, cipher, now, CommandCode::Poll, &[], None);
                    self.last_poll_at = now;
                } else {
                    channel_lock.release(self.channel_id, pd_index);
                }
            }
            CpPdPhase::Offline => {}
        }
    }

    /// Frames and transmits one command: handshake stages carry `sb_type`
    /// in the clear, everything else is MAC'd once `SC_ACTIVE`. A command
    /// with no payload beyond its code byte (`CMD_POLL`) only needs that
    /// MAC (`SCS_15`); one that actually carries data is also encrypted
    /// (`SCS_17`). Mirrors `pd.rs`'s `write_reply`, with the CP/PD roles of
    /// `c_mac`/`r_mac` swapped.
    fn send_frame(&mut self, channel: &mut dyn Channel, cipher: &dyn BlockCipher, now: i64, code: CommandCode, body: &[u8], handshake_sb: Option<ScsType>) {
        let seq = if self.resync { 0 } else { phy::next_sequence(self.seq) };
        self.pending_seq = seq;

        let active = self.sc.is_active() && handshake_sb.is_none();
        let body_len = 1 + body.len();
        let encrypt = active && body_len > 1;
        let sb_ty = handshake_sb.or(if active { Some(if encrypt { ScsType::Cmd17 } else { ScsType::Cmd15 }) } else { None });

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

        frame_buf[off] = code.into();
        frame_buf[off + 1..off + 1 + body.len()].copy_from_slice(body);

        let payload_len = if encrypt {
            sc::encrypt_payload(cipher, &self.sc.keys.s_enc, &self.sc.r_mac, &mut frame_buf[off..], body_len)
        } else {
            body_len
        };

        let mac_len = if active { sc::MAC_WIRE_LEN } else { 0 };
        let som_off = phy::write_header(&mut frame_buf, header_off, use_mark, self.address, false, seq, sb_len, payload_len, mac_len, true);

        let mac_full: Option<[u8; 16]> = if active {
            let mac_input_len = off + payload_len - som_off;
            let mut mac_scratch = [0u8; phy::MAX_FRAME];
            mac_scratch[..mac_input_len].copy_from_slice(&frame_buf[som_off..off + payload_len]);
            let new_mac = sc::compute_mac(cipher, &self.sc.keys.s_mac1, &self.sc.keys.s_mac2, &self.sc.c_mac, &mut mac_scratch, mac_input_len);
            self.sc.c_mac = new_mac;
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

        self.await_resp = true;
        self.phy_tstamp = now;
    }
}

fn encode_command_fields(command: &Command, buf: &mut [u8]) -> usize {
    match *command {
        Command::Poll | Command::Id | Command::Cap | Command::Lstat | Command::Istat | Command::Ostat | Command::Rstat => 0,
        Command::Output { output_no, control_code, timer } => {
            buf[0] = output_no;
            buf[1] = control_code;
            buf[2..4].copy_from_slice(&timer.to_le_bytes());
            4
        }
        Command::Led { reader_no, led_no, control_code } => {
            buf[0] = reader_no;
            buf[1] = led_no;
            buf[2] = control_code;
            3
        }
        Command::Buzzer { reader_no, control_code } => {
            buf[0] = reader_no;
            buf[1] = control_code;
            2
        }
        Command::Text { reader_no, len } => {
            buf[0] = reader_no;
            for b in buf.iter_mut().skip(1).take(len as usize) {
                *b = 0;
            }
            1 + len as usize
        }
        Command::Comset { address, baud_rate } => {
            buf[0] = address;
            buf[1..5].copy_from_slice(&baud_rate.to_le_bytes());
            5
        }
        Command::Chlng(r) => {
            buf[..8].copy_from_slice(&r);
            8
        }
        Command::Scrypt(c) => {
            buf[..16].copy_from_slice(&c);
            16
        }
        Command::KeySet { scbk } => {
            buf[..16].copy_from_slice(&scbk);
            16
        }
        Command::Mfg { vendor_code, len } => {
            buf[..3].copy_from_slice(&vendor_code);
            for b in buf.iter_mut().skip(3).take(len as usize) {
                *b = 0;
            }
            3 + len as usize
        }
        Command::FileTransfer { len } => len as usize,
        Command::AcuRxSize { bytes } => {
            buf[..2].copy_from_slice(&bytes.to_le_bytes());
            2
        }
        Command::KeepActive { seconds } => {
            buf[..2].copy_from_slice(&seconds.to_le_bytes());
            2
        }
    }
}

fn decode_event(code: ReplyCode, payload: &[u8]) -> Option<Event> {
    let body = payload.get(1..)?;
    Some(match code {
        ReplyCode::Raw if body.len() >= 3 => {
            let format = body[0];
            let bit_count = u16::from_le_bytes([body[1], body[2]]);
            let n = (bit_count as usize).div_ceil(8).min(32);
            if body.len() < 3 + n {
                return None;
            }
            let mut data = [0u8; 32];
            data[..n].copy_from_slice(&body[3..3 + n]);
            Event::CardRead { format, bit_count, data }
        }
        ReplyCode::KeyPad if body.len() >= 2 => Event::Keypress { reader_no: body[0], digit: body[1] },
        ReplyCode::MfgRep if body.len() >= 3 => {
            let vendor_code = [body[0], body[1], body[2]];
            let len = (body.len() - 3).min(16) as u8;
            let mut data = [0u8; 16];
            data[..len as usize].copy_from_slice(&body[3..3 + len as usize]);
            Event::Custom { vendor_code, data, len }
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::loopback::LoopbackChannel;
    use crate::clock::StepClock;
    use crate::cmd::CommandOutcome;
    use crate::crypto::tests::RealAes;
    use crate::id::{Capabilities, Capability};
    use crate::pd::{CommandHandler, PdState};
    use crate::rng::CountingRng;

    struct NoopHandler;
    impl CommandHandler for NoopHandler {
        fn handle(&mut self, _command: Command) -> CommandOutcome {
            CommandOutcome::Ack
        }
    }

    struct RecordingEvents(alloc::vec::Vec<(usize, Event)>);
    impl EventCallback for RecordingEvents {
        fn handle(&mut self, pd_index: usize, event: Event) {
            self.0.push((pd_index, event));
        }
    }

    struct RecordingCompletions(alloc::vec::Vec<(usize, u32, CommandDisposition)>);
    impl CommandCompleteCallback for RecordingCompletions {
        fn handle(&mut self, pd_index: usize, token: u32, disposition: CommandDisposition) {
            self.0.push((pd_index, token, disposition));
        }
    }

    fn pd_with_caps(sc_capable: bool) -> PdState<4> {
        let mut caps = Capabilities::new();
        if sc_capable {
            caps.set(CapabilityCode::CommunicationSecurity, Capability { compliance_level: 1, num_items: 1 });
        }
        let id = PdId {
            vendor_code: [1, 2, 3],
            model: 9,
            version: 1,
            serial: [0xAA, 0xBB, 0xCC, 0xDD],
            firmware_version: [1, 0, 0],
        };
        let mut pd = PdState::new(0, id, caps);
        pd.flags.set(PdFlags::SC_CAPABLE, sc_capable);
        pd
    }

    /// Drives both sides until `cp.phase()` matches `want` or a step budget
    /// is exhausted (guards against an infinite loop on a real bug).
    #[allow(clippy::too_many_arguments)]
    fn pump<const N: usize>(
        cp: &mut CpPd<N>,
        pd: &mut PdState<4>,
        cp_chan: &mut LoopbackChannel,
        pd_chan: &mut LoopbackChannel,
        lock: &mut ChannelLock,
        clock: &StepClock,
        want: CpPdPhase,
        max_steps: usize,
    ) {
        let cipher = RealAes;
        let mut cp_rng = CountingRng(1);
        let mut pd_rng = CountingRng(200);
        let mut handler = NoopHandler;
        let mut logger = crate::logger::NullLogger;
        let mut events = RecordingEvents(alloc::vec::Vec::new());
        let mut completions = RecordingCompletions(alloc::vec::Vec::new());

        for _ in 0..max_steps {
            if cp.phase() == want {
                return;
            }
            pd.tick(pd_chan, clock, &cipher, &mut pd_rng, &mut handler, &mut logger).ok();
            cp.tick(0, cp_chan, lock, clock, &cipher, &mut cp_rng, &mut events, &mut completions, &mut logger).ok();
            clock.advance(5);
        }
        assert_eq!(cp.phase(), want, "did not reach expected phase in time");
    }

    #[test]
    fn bring_up_without_master_key_reaches_online_with_id_and_caps() {
        let (mut cp_chan, mut pd_chan) = LoopbackChannel::pair(1, 2);
        let clock = StepClock::new();
        let mut lock = ChannelLock::new();
        let mut cp: CpPd<4> = CpPd::new(PdConfig::new(0, 9600, ChannelId(1)), None, false);
        let mut pd = pd_with_caps(false);

        pump(&mut cp, &mut pd, &mut cp_chan, &mut pd_chan, &mut lock, &clock, CpPdPhase::Online, 40);

        assert_eq!(cp.id(), pd.id);
        assert!(!cp.flags().contains(PdFlags::SC_ACTIVE));
    }

    #[test]
    fn bring_up_with_master_key_and_sc_capable_pd_reaches_sc_active() {
        let (mut cp_chan, mut pd_chan) = LoopbackChannel::pair(1, 2);
        let clock = StepClock::new();
        let mut lock = ChannelLock::new();
        let master_key = [0x00u8; 16];
        let mut cp: CpPd<4> = CpPd::new(PdConfig::new(0, 9600, ChannelId(1)), Some(master_key), false);
        let mut pd = pd_with_caps(true);

        pump(&mut cp, &mut pd, &mut cp_chan, &mut pd_chan, &mut lock, &clock, CpPdPhase::Online, 60);

        assert!(cp.flags().contains(PdFlags::SC_ACTIVE));
        assert!(pd.flags.contains(PdFlags::SC_ACTIVE));
    }

    #[test]
    fn submit_command_past_capacity_returns_queue_full() {
        let mut cp: CpPd<2> = CpPd::new(PdConfig::new(0, 9600, ChannelId(1)), None, false);
        cp.submit_command(Command::Poll).unwrap();
        cp.submit_command(Command::Poll).unwrap();
        assert_eq!(cp.submit_command(Command::Poll), Err(Error::QueueFull));
    }

    #[test]
    fn unresponsive_pd_goes_offline_after_three_misses() {
        let (mut cp_chan, _pd_chan) = LoopbackChannel::pair(1, 2);
        let clock = StepClock::new();
        let mut lock = ChannelLock::new();
        let cipher = RealAes;
        let mut rng = CountingRng(1);
        let mut logger = crate::logger::NullLogger;
        let mut events = RecordingEvents(alloc::vec::Vec::new());
        let mut completions = RecordingCompletions(alloc::vec::Vec::new());
        let mut cp: CpPd<4> = CpPd::new(PdConfig::new(0, 9600, ChannelId(1)), None, false);

        for _ in 0..400 {
            cp.tick(0, &mut cp_chan, &mut lock, &clock, &cipher, &mut rng, &mut events, &mut completions, &mut logger).ok();
            clock.advance(20);
            if cp.phase() == CpPdPhase::Offline {
                break;
            }
        }
        assert_eq!(cp.phase(), CpPdPhase::Offline);
    }

    #[test]
    fn channel_lock_only_admits_its_current_holder() {
        let mut lock = ChannelLock::new();
        assert!(lock.try_acquire(ChannelId(1), 0));
        assert!(lock.try_acquire(ChannelId(1), 0));
        assert!(!lock.try_acquire(ChannelId(1), 1));
        lock.release(ChannelId(1), 0);
        assert!(lock.try_acquire(ChannelId(1), 1));
    }
}

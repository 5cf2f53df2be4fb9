//! Open Supervised Device Protocol (OSDP) control-panel and peripheral-device
//! state machines.
//!
//! This crate owns the wire codec, secure channel cryptography, and the two
//! role state machines (`cp`, `pd`) from `SPEC_FULL.md`. It never performs
//! I/O, timekeeping, random generation, or AES itself — those come from the
//! host through the [`channel::Channel`], [`clock::Clock`], [`rng::Rng`] and
//! [`crypto::BlockCipher`] traits, so the same state machines run unchanged
//! on a microcontroller UART or a Unix domain socket in a test harness.
//!
//! [`CpContext`] drives a bus of PDs from the control panel side;
//! [`PdContext`] drives a single peripheral device. Both are thin,
//! allocating wrappers around the `no_alloc` per-PD state machines in
//! [`cp::CpPd`] and [`pd::PdState`]; everything below those two types never
//! allocates once `Context::new` returns.

#![no_std]
#![warn(rust_2018_idioms)]

extern crate alloc;

pub mod channel;
pub mod clock;
pub mod cmd;
pub mod cp;
pub mod crypto;
pub mod error;
pub mod event;
pub mod flags;
pub mod id;
pub mod logger;
pub mod pd;
pub mod rng;
pub mod sc;
pub mod slab;

mod phy;

use alloc::boxed::Box;

use channel::Channel;
use clock::Clock;
use cmd::Command;
use cp::{ChannelLock, CommandCompleteCallback, CommandDisposition, CpPd, EventCallback, PdConfig};
use crypto::BlockCipher;
use error::{Error, Result};
use event::Event;
use flags::ContextFlags;
use logger::{Logger, NullLogger};
use pd::{CommandHandler, PdState};
use rng::Rng;

/// Control panel context: owns every PD on one or more shared buses and
/// round-robins [`cp::CpPd::tick`] across them (`SPEC_FULL.md` §4.H, §6).
///
/// `MAX_PD` bounds the number of PDs this context can ever hold and
/// `CMD_CAP` bounds each PD's outstanding command queue; both are part of
/// the type, so the PD table itself never grows the heap the way a plain
/// `Vec` would; the only per-PD heap cost is the one-time [`Box`] each
/// [`add_pd`](CpContext::add_pd) call makes for its channel handle.
pub struct CpContext<const MAX_PD: usize, const CMD_CAP: usize> {
    pds: heapless::Vec<CpPd<CMD_CAP>, MAX_PD>,
    channels: heapless::Vec<Box<dyn Channel>, MAX_PD>,
    channel_lock: ChannelLock,
    cipher: Box<dyn BlockCipher>,
    rng: Box<dyn Rng>,
    clock: Box<dyn Clock>,
    logger: Box<dyn Logger>,
    event_cb: Box<dyn EventCallback>,
    complete_cb: Box<dyn CommandCompleteCallback>,
    master_key: Option<[u8; 16]>,
    /// `CP_MODE` is implied by the type itself and never read back; only
    /// `SC_DISABLED` is live state here (`SPEC_FULL.md` §3's context-level
    /// flags word, kept separate from the per-PD [`flags::PdFlags`] word).
    flags: ContextFlags,
}

impl<const MAX_PD: usize, const CMD_CAP: usize> CpContext<MAX_PD, CMD_CAP> {
    /// Builds an empty context. `master_key` provisions the secure channel
    /// installation key (`None` means every PD runs in plaintext, as if
    /// `SC_DISABLED` were set); PDs are added afterwards with
    /// [`CpContext::add_pd`].
    pub fn new(cipher: Box<dyn BlockCipher>, rng: Box<dyn Rng>, clock: Box<dyn Clock>, master_key: Option<[u8; 16]>) -> Self {
        let mut flags = ContextFlags::CP_MODE;
        flags.set(ContextFlags::SC_DISABLED, master_key.is_none());
        Self {
            pds: heapless::Vec::new(),
            channels: heapless::Vec::new(),
            channel_lock: ChannelLock::new(),
            cipher,
            rng,
            clock,
            logger: Box::new(NullLogger),
            event_cb: Box::new(|_: usize, _: Event| {}),
            complete_cb: Box::new(|_: usize, _: u32, _: CommandDisposition| {}),
            master_key,
            flags,
        }
    }

    /// Disables secure channel negotiation entirely, even if a master key
    /// was supplied (useful for talking to legacy PDs on a bus that also has
    /// SC-capable ones the host does not want promoted).
    pub fn set_sc_disabled(&mut self, disabled: bool) {
        self.flags.set(ContextFlags::SC_DISABLED, disabled);
    }

    pub fn set_logger(&mut self, logger: Box<dyn Logger>) {
        self.logger = logger;
    }

    pub fn set_event_callback(&mut self, cb: Box<dyn EventCallback>) {
        self.event_cb = cb;
    }

    pub fn set_command_complete_callback(&mut self, cb: Box<dyn CommandCompleteCallback>) {
        self.complete_cb = cb;
    }

    /// Registers a new PD and its channel, returning the index used to
    /// address it in every other `CpContext` method. Fails with
    /// [`Error::QueueFull`] once `MAX_PD` PDs are already registered.
    pub fn add_pd(&mut self, config: PdConfig, channel: Box<dyn Channel>) -> Result<usize> {
        let index = self.pds.len();
        let pd = CpPd::new(config, self.master_key, self.flags.contains(ContextFlags::SC_DISABLED));
        self.pds.push(pd).map_err(|_| Error::QueueFull)?;
        self.channels.push(channel).map_err(|_| Error::QueueFull)?;
        Ok(index)
    }

    pub fn pd(&self, index: usize) -> Option<&CpPd<CMD_CAP>> {
        self.pds.get(index)
    }

    /// Drives one unit of work for every registered PD. Call this
    /// periodically (e.g. once per host event loop iteration); it never
    /// blocks.
    pub fn refresh(&mut self) {
        for index in 0..self.pds.len() {
            let pd = &mut self.pds[index];
            let channel = &mut *self.channels[index];
            pd.tick(
                index,
                channel,
                &mut self.channel_lock,
                &*self.clock,
                &*self.cipher,
                &mut *self.rng,
                &mut *self.event_cb,
                &mut *self.complete_cb,
                &mut *self.logger,
            )
            .ok();
        }
    }

    /// Enqueues `command` for PD `index`, returning a token the host can
    /// correlate with the eventual completion callback.
    pub fn submit_command(&mut self, index: usize, command: Command) -> Result<u32> {
        self.pds.get_mut(index).ok_or(Error::InvalidArgument)?.submit_command(command)
    }

    /// A bitmask with bit `i` set if PD `i` is `ONLINE`. Hosts with more
    /// than 32 PDs should use [`CpContext::pd`] per index instead.
    pub fn get_status_mask(&self) -> u32 {
        self.pds.iter().enumerate().fold(0u32, |mask, (i, pd)| if i < 32 && pd.is_online() { mask | (1 << i) } else { mask })
    }
}

/// Peripheral device context: owns one PD's state machine, its channel, and
/// the host callbacks that realize commands and provide events
/// (`SPEC_FULL.md` §4.G, §6).
pub struct PdContext<const EVT_CAP: usize> {
    state: PdState<EVT_CAP>,
    channel: Box<dyn Channel>,
    cipher: Box<dyn BlockCipher>,
    rng: Box<dyn Rng>,
    clock: Box<dyn Clock>,
    handler: Box<dyn CommandHandler>,
    logger: Box<dyn Logger>,
}

impl<const EVT_CAP: usize> PdContext<EVT_CAP> {
    pub fn new(
        state: PdState<EVT_CAP>,
        channel: Box<dyn Channel>,
        cipher: Box<dyn BlockCipher>,
        rng: Box<dyn Rng>,
        clock: Box<dyn Clock>,
        handler: Box<dyn CommandHandler>,
    ) -> Self {
        Self {
            state,
            channel,
            cipher,
            rng,
            clock,
            handler,
            logger: Box::new(NullLogger),
        }
    }

    pub fn set_logger(&mut self, logger: Box<dyn Logger>) {
        self.logger = logger;
    }

    pub fn set_handler(&mut self, handler: Box<dyn CommandHandler>) {
        self.handler = handler;
    }

    /// Installs a host-provisioned SCBK, bypassing master-key derivation.
    pub fn set_scbk(&mut self, scbk: [u8; 16]) {
        self.state.set_scbk(scbk);
    }

    /// Queues an unsolicited event (card read, keypress, tamper) for
    /// delivery on the next poll.
    pub fn submit_event(&mut self, event: Event) -> Result<()> {
        self.state.submit_event(event)
    }

    pub fn state(&self) -> &PdState<EVT_CAP> {
        &self.state
    }

    /// Services at most one incoming frame and its reply. Call this
    /// periodically; it never blocks.
    pub fn refresh(&mut self) {
        self.state
            .tick(&mut *self.channel, &*self.clock, &*self.cipher, &mut *self.rng, &mut *self.handler, &mut *self.logger)
            .ok();
    }
}

//! Test doubles shared by the end-to-end scenarios in `scenarios.rs`.
//!
//! These mirror the `#[cfg(test)]`-only doubles inside the crate itself
//! (`src/channel.rs`, `src/clock.rs`) but live here instead: a `tests/`
//! integration binary only sees the crate's public surface, and `phy`,
//! `LoopbackChannel`, and `StepClock` are all crate-private.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use osdp::channel::{Channel, ChannelId};
use osdp::clock::Clock;
use osdp::crypto::BlockCipher;
use osdp::rng::Rng;

/// A byte-for-byte loopback pair, with the raw in-flight queue exposed so a
/// test can corrupt a frame mid-transit (the MAC-tampering scenario).
pub struct LoopbackChannel {
    inbox: Rc<RefCell<VecDeque<u8>>>,
    outbox: Rc<RefCell<VecDeque<u8>>>,
    id: ChannelId,
}

impl LoopbackChannel {
    pub fn pair(id_a: u32, id_b: u32) -> (Self, Self) {
        let a_to_b = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a = Rc::new(RefCell::new(VecDeque::new()));
        let ep_a = Self {
            inbox: b_to_a.clone(),
            outbox: a_to_b.clone(),
            id: ChannelId(id_a),
        };
        let ep_b = Self {
            inbox: a_to_b,
            outbox: b_to_a,
            id: ChannelId(id_b),
        };
        (ep_a, ep_b)
    }

    /// The queue of bytes this endpoint has written but its peer has not yet
    /// read, so a test can mutate an in-flight frame before the peer's next
    /// `refresh`.
    pub fn outbox(&self) -> Rc<RefCell<VecDeque<u8>>> {
        self.outbox.clone()
    }
}

impl Channel for LoopbackChannel {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut inbox = self.inbox.borrow_mut();
        let n = buf.len().min(inbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inbox.pop_front().unwrap();
        }
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.outbox.borrow_mut().extend(buf.iter().copied());
        buf.len()
    }

    fn flush(&mut self) {}

    fn id(&self) -> ChannelId {
        self.id
    }
}

/// A `Channel` wrapper that also records every frame written to it, letting
/// a test assert on exact wire bytes without reaching into crate internals.
pub struct TappedChannel<C> {
    inner: C,
    pub written: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl<C: Channel> TappedChannel<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            written: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn written_log(&self) -> Rc<RefCell<Vec<Vec<u8>>>> {
        self.written.clone()
    }
}

impl<C: Channel> Channel for TappedChannel<C> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.written.borrow_mut().push(buf.to_vec());
        self.inner.write(buf)
    }

    fn flush(&mut self) {
        self.inner.flush()
    }

    fn id(&self) -> ChannelId {
        self.inner.id()
    }
}

/// A `Clock` the test advances by hand instead of sleeping.
pub struct StepClock {
    now: Cell<i64>,
}

impl StepClock {
    pub fn new() -> Self {
        Self { now: Cell::new(0) }
    }

    pub fn advance(&self, ms: i64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for StepClock {
    fn now_ms(&self) -> i64 {
        self.now.get()
    }
}

/// A deterministic, non-cryptographic [`Rng`]: enough to drive the secure
/// channel handshake in a test without needing a CSPRNG dependency.
pub struct CountingRng(pub u8);

impl Rng for CountingRng {
    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.0;
            self.0 = self.0.wrapping_add(1);
        }
    }
}

/// AES-128 via the `aes` crate, standing in for whatever hardware/software
/// AES a real host would supply (same role as `crypto::tests::RealAes`
/// inside the crate, reimplemented here since that one is private).
pub struct RealAes;

impl BlockCipher for RealAes {
    fn encrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        use aes::cipher::{BlockEncrypt, KeyInit};
        let cipher = aes::Aes128::new_from_slice(key).unwrap();
        let mut ga = aes::cipher::generic_array::GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut ga);
        block.copy_from_slice(ga.as_slice());
    }

    fn decrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        use aes::cipher::{BlockDecrypt, KeyInit};
        let cipher = aes::Aes128::new_from_slice(key).unwrap();
        let mut ga = aes::cipher::generic_array::GenericArray::clone_from_slice(block);
        cipher.decrypt_block(&mut ga);
        block.copy_from_slice(ga.as_slice());
    }
}

/// Flips the first MAC byte of a single in-flight MAC-protected frame
/// sitting in `outbox`, then recomputes the CRC trailer so the corruption
/// is caught by MAC verification rather than the cheaper CRC check the
/// codec runs first. `phy` is crate-private, so this pokes the wire layout
/// directly instead of going through it; the layout itself (`SOM ADDR LEN
/// CTRL [SB] PAYLOAD MAC CRC16`) is part of the public wire format this
/// crate documents, not an internal.
pub fn corrupt_one_mac_byte(outbox: &Rc<RefCell<VecDeque<u8>>>) {
    let mut bytes: Vec<u8> = outbox.borrow().iter().copied().collect();
    let len = bytes.len();
    assert!(len >= 6 + osdp::sc::MAC_WIRE_LEN, "frame too short to carry a MAC");
    let mac_start = len - 2 - osdp::sc::MAC_WIRE_LEN;
    bytes[mac_start] ^= 0xFF;
    let body = &bytes[..len - 2];
    let crc = osdp::crypto::crc16_ccitt(body);
    let crc_bytes = crc.to_le_bytes();
    bytes[len - 2..].copy_from_slice(&crc_bytes);
    outbox.borrow_mut().clear();
    outbox.borrow_mut().extend(bytes);
}

/// XORs `mask` into byte `index` of a single in-flight MAC-protected frame
/// sitting in `outbox`, recomputing the CRC trailer so a bare checksum
/// check alone would wave the tamper through. Used to flip a byte the MAC
/// is supposed to cover but that nothing else in the codec independently
/// validates (the secure block's `SBTYPE`, say), to prove the corruption is
/// still caught by MAC verification and not silently accepted.
pub fn corrupt_byte_with_mask_recomputing_crc(outbox: &Rc<RefCell<VecDeque<u8>>>, index: usize, mask: u8) {
    let mut bytes: Vec<u8> = outbox.borrow().iter().copied().collect();
    let len = bytes.len();
    assert!(len >= 6 + osdp::sc::MAC_WIRE_LEN, "frame too short to carry a MAC");
    bytes[index] ^= mask;
    let body = &bytes[..len - 2];
    let crc = osdp::crypto::crc16_ccitt(body);
    bytes[len - 2..].copy_from_slice(&crc.to_le_bytes());
    outbox.borrow_mut().clear();
    outbox.borrow_mut().extend(bytes);
}

/// Flips a body byte of a single in-flight frame sitting in `outbox`
/// without fixing up the CRC trailer, so the codec's cheap check catches it
/// (`PhyOutcome::CheckFailed`) the way a line glitch would, rather than the
/// MAC (`corrupt_one_mac_byte`'s job).
pub fn corrupt_one_byte_breaking_crc(outbox: &Rc<RefCell<VecDeque<u8>>>) {
    let mut bytes: Vec<u8> = outbox.borrow().iter().copied().collect();
    assert!(bytes.len() >= 6, "frame too short to corrupt");
    bytes[5] ^= 0xFF;
    outbox.borrow_mut().clear();
    outbox.borrow_mut().extend(bytes);
}

/// Hand-builds a single-byte `REPLY_BUSY` frame, as a stand-in PD under
/// momentary load would send. Built from raw bytes rather than through
/// `phy` (crate-private) using only the wire layout and the public
/// `crc16_ccitt` helper.
pub fn build_busy_frame(address: u8, sequence: u8) -> Vec<u8> {
    use osdp::cmd::ReplyCode;
    let busy: u8 = ReplyCode::Busy.into();
    let mut frame = vec![0x53u8, (address & 0x7f) | 0x80, 0, 0, (sequence & 0x03) | 0x04, busy];
    let total_len = frame.len() as u16 + 2;
    frame[2..4].copy_from_slice(&total_len.to_le_bytes());
    let crc = osdp::crypto::crc16_ccitt(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

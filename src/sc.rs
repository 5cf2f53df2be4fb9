//! Secure channel (`SPEC_FULL.md` §4.F).
//!
//! Key derivation, cryptogram computation, MAC chaining and payload
//! encryption are all built from repeated calls into the host's
//! [`BlockCipher`](crate::crypto::BlockCipher) — nothing here invents a new
//! cryptographic primitive, it only composes the one the host supplies the
//! way OSDP's secure channel protocol requires.

use crate::crypto::{self, BlockCipher};
use crate::error::{Error, Result};

/// Context byte mixed into each session-key derivation block so that
/// `s_enc`/`s_mac1`/`s_mac2` (and the PD's base `SCBK`) are distinct even
/// though they're all derived from the same randoms via the same cipher.
mod kd {
    pub const SCBK: u8 = 0x01;
    pub const ENC: u8 = 0x02;
    pub const MAC1: u8 = 0x03;
    pub const MAC2: u8 = 0x04;
}

/// Fixed constant byte the reference protocol mixes into every derivation
/// block, distinguishing key-derivation blocks from cryptogram blocks that
/// otherwise share a similar shape.
const KD_CONST: u8 = 0x82;

/// MAC field width on the wire; the cryptographic chain value is a full
/// 16-byte AES block, but only its first 4 bytes travel in the frame.
pub const MAC_WIRE_LEN: usize = 4;

/// The well-known default SCBK (`SCBK-D`) used for the very first handshake
/// with a PD that has not yet been issued a real key (`spec.md` §4.F).
pub const SCBKD: [u8; 16] = [0u8; 16];

fn kd_block(context: u8, random_a: &[u8; 8], random_b: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = context;
    block[1] = KD_CONST;
    block[2..10].copy_from_slice(random_a);
    let n = random_b.len().min(6);
    block[10..10 + n].copy_from_slice(&random_b[..n]);
    block
}

/// Derives a PD's base SCBK from the 16-byte installation master key and
/// the PD's 8-byte client UID.
pub fn derive_scbk(cipher: &dyn BlockCipher, master_key: &[u8; 16], pd_client_uid: &[u8; 8]) -> [u8; 16] {
    let block = kd_block(kd::SCBK, pd_client_uid, &[]);
    crypto::ecb_encrypt(cipher, master_key, &block)
}

/// Session keys derived from an SCBK and the two handshake randoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub s_enc: [u8; 16],
    pub s_mac1: [u8; 16],
    pub s_mac2: [u8; 16],
}

pub fn derive_session_keys(
    cipher: &dyn BlockCipher,
    scbk: &[u8; 16],
    cp_random: &[u8; 8],
    pd_random: &[u8; 8],
) -> SessionKeys {
    SessionKeys {
        s_enc: crypto::ecb_encrypt(cipher, scbk, &kd_block(kd::ENC, cp_random, pd_random)),
        s_mac1: crypto::ecb_encrypt(cipher, scbk, &kd_block(kd::MAC1, cp_random, pd_random)),
        s_mac2: crypto::ecb_encrypt(cipher, scbk, &kd_block(kd::MAC2, cp_random, pd_random)),
    }
}

/// Computes `AES(s_enc, a || b)`, used for both `pd_cryptogram` and
/// `cp_cryptogram` (which differ only in the random order concatenated).
pub fn cryptogram(cipher: &dyn BlockCipher, s_enc: &[u8; 16], a: &[u8; 8], b: &[u8; 8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(a);
    block[8..].copy_from_slice(b);
    crypto::ecb_encrypt(cipher, s_enc, &block)
}

/// The shared initial MAC chain value both sides derive once the handshake
/// cryptograms have been exchanged and verified: the seed carried in
/// `REPLY_RMAC_I` and mirrored into the CP's own chain state.
pub fn initial_mac_chain(cipher: &dyn BlockCipher, s_mac2: &[u8; 16], cp_cryptogram: &[u8; 16]) -> [u8; 16] {
    crypto::ecb_encrypt(cipher, s_mac2, cp_cryptogram)
}

/// Computes the MAC over `data` (`CTRL` and payload bytes), chained from
/// `prev_mac`. `scratch` must start with `data`'s bytes and have at least
/// `crypto::pad16(data_len + 1)` bytes of capacity; it is overwritten.
///
/// All blocks but the last are chained under `s_mac1`; the last block uses
/// `s_mac2`, per `spec.md` §4.F.
pub fn compute_mac(
    cipher: &dyn BlockCipher,
    s_mac1: &[u8; 16],
    s_mac2: &[u8; 16],
    prev_mac: &[u8; 16],
    scratch: &mut [u8],
    data_len: usize,
) -> [u8; 16] {
    let padded_len = crypto::pad_osdp(scratch, data_len);
    let data = &mut scratch[..padded_len];
    let n_blocks = padded_len / 16;

    let mut chain = *prev_mac;
    for (i, block) in data.chunks_mut(16).enumerate() {
        let key = if i + 1 == n_blocks { s_mac2 } else { s_mac1 };
        for (b, c) in block.iter_mut().zip(chain.iter()) {
            *b ^= c;
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(block);
        cipher.encrypt_block(key, &mut out);
        block.copy_from_slice(&out);
        chain = out;
    }
    chain
}

/// Verifies a received MAC (the wire-truncated first [`MAC_WIRE_LEN`]
/// bytes of the full chain value) against one freshly computed.
pub fn verify_mac(
    cipher: &dyn BlockCipher,
    s_mac1: &[u8; 16],
    s_mac2: &[u8; 16],
    prev_mac: &[u8; 16],
    scratch: &mut [u8],
    data_len: usize,
    received: &[u8],
) -> Result<[u8; 16]> {
    let computed = compute_mac(cipher, s_mac1, s_mac2, prev_mac, scratch, data_len);
    if received.len() != MAC_WIRE_LEN || computed[..MAC_WIRE_LEN] != *received {
        return Err(Error::Mac);
    }
    Ok(computed)
}

/// Encrypts `buf[..len]` in place under `s_enc`, chained from the peer's
/// last MAC, padding with the `0x80`-then-zero scheme. `buf` must have at
/// least `crypto::pad16(len + 1)` bytes of capacity. Returns the padded
/// ciphertext length.
pub fn encrypt_payload(cipher: &dyn BlockCipher, s_enc: &[u8; 16], peer_mac: &[u8; 16], buf: &mut [u8], len: usize) -> usize {
    let padded_len = crypto::pad_osdp(buf, len);
    crypto::cbc_encrypt(cipher, s_enc, peer_mac, &mut buf[..padded_len]);
    padded_len
}

/// Decrypts and unpads `buf` (already a multiple of 16 bytes) in place.
/// Returns the recovered plaintext length, or [`Error::Decrypt`] if the
/// padding marker is missing (corrupt or misaligned ciphertext).
pub fn decrypt_payload(cipher: &dyn BlockCipher, s_enc: &[u8; 16], peer_mac: &[u8; 16], buf: &mut [u8]) -> Result<usize> {
    crypto::cbc_decrypt(cipher, s_enc, peer_mac, buf);
    crypto::unpad_osdp(buf).ok_or(Error::Decrypt)
}

/// Secure channel negotiation state, tracked per PD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScState {
    /// No secure channel established; the next command/poll starts a fresh
    /// handshake (or the channel operates in plaintext if SC is disabled).
    Init,
    /// `CMD_CHLNG` sent, awaiting `REPLY_CCRYPT`.
    Chlng,
    /// `CMD_SCRYPT` sent, awaiting `REPLY_RMAC_I`.
    Scrypt,
    /// Handshake complete; `c_mac`/`r_mac` are live and every subsequent
    /// packet is MAC-protected (and, for SCS_17/18, encrypted).
    Active,
}

/// Live secure-channel state for one PD: negotiated keys and the running
/// MAC chain in each direction.
#[derive(Debug, Clone, Copy)]
pub struct SecureChannel {
    pub state: ScState,
    pub use_scbkd: bool,
    pub keys: SessionKeys,
    pub cp_random: [u8; 8],
    pub pd_random: [u8; 8],
    /// Running CP-to-PD MAC chain value.
    pub c_mac: [u8; 16],
    /// Running PD-to-CP MAC chain value.
    pub r_mac: [u8; 16],
}

impl SecureChannel {
    pub const fn new() -> Self {
        Self {
            state: ScState::Init,
            use_scbkd: false,
            keys: SessionKeys {
                s_enc: [0; 16],
                s_mac1: [0; 16],
                s_mac2: [0; 16],
            },
            cp_random: [0; 8],
            pd_random: [0; 8],
            c_mac: [0; 16],
            r_mac: [0; 16],
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ScState::Active
    }

    /// Tears the channel back down to [`ScState::Init`], clearing all
    /// session key material. Called on any handshake or MAC failure.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for SecureChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::RealAes;

    #[test]
    fn scbk_derivation_is_deterministic_and_key_dependent() {
        let cipher = RealAes;
        let master_key = [0x11u8; 16];
        let uid = [1, 2, 3, 4, 5, 6, 7, 8];
        let a = derive_scbk(&cipher, &master_key, &uid);
        let b = derive_scbk(&cipher, &master_key, &uid);
        assert_eq!(a, b);

        let other_uid = [8, 7, 6, 5, 4, 3, 2, 1];
        let c = derive_scbk(&cipher, &master_key, &other_uid);
        assert_ne!(a, c);
    }

    #[test]
    fn session_keys_are_pairwise_distinct() {
        let cipher = RealAes;
        let scbk = [0x22u8; 16];
        let cp_random = [1u8; 8];
        let pd_random = [2u8; 8];
        let keys = derive_session_keys(&cipher, &scbk, &cp_random, &pd_random);
        assert_ne!(keys.s_enc, keys.s_mac1);
        assert_ne!(keys.s_mac1, keys.s_mac2);
        assert_ne!(keys.s_enc, keys.s_mac2);
    }

    #[test]
    fn cryptograms_are_order_dependent() {
        let cipher = RealAes;
        let s_enc = [0x33u8; 16];
        let cp_random = [1u8; 8];
        let pd_random = [2u8; 8];
        let pd_cryptogram = cryptogram(&cipher, &s_enc, &cp_random, &pd_random);
        let cp_cryptogram = cryptogram(&cipher, &s_enc, &pd_random, &cp_random);
        assert_ne!(pd_cryptogram, cp_cryptogram);
    }

    #[test]
    fn mac_round_trips_and_detects_a_single_bit_flip() {
        let cipher = RealAes;
        let s_mac1 = [0x44u8; 16];
        let s_mac2 = [0x55u8; 16];
        let prev = [0u8; 16];
        let data = [0x53, 0x00, 0x09, 0x00, 0x15, 0x60];

        let mut scratch = [0u8; 32];
        scratch[..data.len()].copy_from_slice(&data);
        let mac = compute_mac(&cipher, &s_mac1, &s_mac2, &prev, &mut scratch, data.len());

        let mut scratch2 = [0u8; 32];
        scratch2[..data.len()].copy_from_slice(&data);
        assert!(verify_mac(&cipher, &s_mac1, &s_mac2, &prev, &mut scratch2, data.len(), &mac[..MAC_WIRE_LEN]).is_ok());

        let mut tampered = data;
        tampered[2] ^= 0x01;
        let mut scratch3 = [0u8; 32];
        scratch3[..tampered.len()].copy_from_slice(&tampered);
        assert_eq!(
            verify_mac(&cipher, &s_mac1, &s_mac2, &prev, &mut scratch3, tampered.len(), &mac[..MAC_WIRE_LEN]),
            Err(Error::Mac)
        );
    }

    #[test]
    fn payload_encryption_round_trips_under_the_peer_mac_as_iv() {
        let cipher = RealAes;
        let s_enc = [0x66u8; 16];
        let peer_mac = [0x77u8; 16];
        let mut buf = [0u8; 32];
        let plain = b"unlock door 3";
        buf[..plain.len()].copy_from_slice(plain);

        let padded_len = encrypt_payload(&cipher, &s_enc, &peer_mac, &mut buf, plain.len());
        assert_ne!(&buf[..plain.len()], plain);

        let len = decrypt_payload(&cipher, &s_enc, &peer_mac, &mut buf[..padded_len]).unwrap();
        assert_eq!(&buf[..len], plain);
    }

    #[test]
    fn decrypt_rejects_a_buffer_with_no_padding_marker() {
        let cipher = RealAes;
        let s_enc = [0x66u8; 16];
        let peer_mac = [0x77u8; 16];
        let mut buf = [0u8; 16];
        // all-zero plaintext encrypts to something with no trailing 0x80.
        crypto::cbc_encrypt(&cipher, &s_enc, &peer_mac, &mut buf);
        for b in &mut buf {
            *b ^= 0xff;
        }
        assert_eq!(decrypt_payload(&cipher, &s_enc, &peer_mac, &mut buf), Err(Error::Decrypt));
    }

    #[test]
    fn fresh_secure_channel_starts_in_init_and_reset_returns_to_it() {
        let mut sc = SecureChannel::new();
        assert_eq!(sc.state, ScState::Init);
        sc.state = ScState::Active;
        sc.c_mac = [9; 16];
        sc.reset();
        assert_eq!(sc.state, ScState::Init);
        assert_eq!(sc.c_mac, [0; 16]);
    }
}

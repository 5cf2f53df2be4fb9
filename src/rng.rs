//! Random byte source.
//!
//! The secure channel needs 8 bytes of randomness per handshake attempt
//! (`cp_random`). This crate never generates entropy itself — it asks the
//! host for it through this trait — but optionally offers a ready-made
//! `ChaCha20`-backed implementation behind the `software-rng` feature for
//! hosts that do not already have a CSPRNG wired up.

/// A source of cryptographically-adequate random bytes.
pub trait Rng {
    fn fill(&mut self, buf: &mut [u8]);
}

#[cfg(feature = "software-rng")]
pub use chacha::ChaChaRng;

#[cfg(feature = "software-rng")]
mod chacha {
    use super::Rng;
    use rand_chacha::rand_core::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    /// A [`Rng`] backed by the ChaCha20 stream cipher, seeded once at
    /// construction from a caller-supplied 32-byte seed (e.g. hardware
    /// entropy gathered at boot).
    pub struct ChaChaRng(ChaCha20Rng);

    impl ChaChaRng {
        pub fn from_seed(seed: [u8; 32]) -> Self {
            Self(ChaCha20Rng::from_seed(seed))
        }
    }

    impl Rng for ChaChaRng {
        fn fill(&mut self, buf: &mut [u8]) {
            self.0.fill_bytes(buf);
        }
    }
}

#[cfg(test)]
pub(crate) struct CountingRng(pub u8);

#[cfg(test)]
impl Rng for CountingRng {
    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.0;
            self.0 = self.0.wrapping_add(1);
        }
    }
}

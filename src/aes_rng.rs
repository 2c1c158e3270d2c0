//! RNG based on AES in CTR mode.
//!
//! Two parties that seed an [`AesRng`] with the same 128-bit key draw identical streams, which
//! is what the evaluator uses to derive correlated randomness without communication. On
//! platforms with hardware accelerated AES instructions the [`aes`] crate detects and uses them
//! at runtime; otherwise it falls back to its portable implementation.
use aes::{
    Aes128,
    cipher::{BlockCipherEncrypt, KeyInit},
};
use rand::rand_core::block::{BlockRng, BlockRngCore, CryptoBlockRng};
use rand::{CryptoRng, RngCore, SeedableRng};

/// Number of AES blocks encrypted per refill of the buffer.
const PAR_BLOCKS: usize = 8;

/// A PRG that encrypts a counter with a fixed AES key.
#[derive(Clone, Debug)]
pub struct AesRng(BlockRng<AesRngCore>);

impl RngCore for AesRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }
}

impl SeedableRng for AesRng {
    type Seed = [u8; 16];

    #[inline]
    fn from_seed(seed: Self::Seed) -> Self {
        AesRng(BlockRng::<AesRngCore>::from_seed(seed))
    }
}

impl CryptoRng for AesRng {}

impl AesRng {
    /// Fills `dest` with random 64-bit words.
    pub fn fill_words(&mut self, dest: &mut [u64]) {
        self.fill_bytes(bytemuck::cast_slice_mut(dest));
    }
}

/// The core of `AesRng`, used with `BlockRng`.
#[derive(Clone)]
pub struct AesRngCore {
    aes: Aes128,
    state: u128,
}

impl std::fmt::Debug for AesRngCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "AesRngCore {{}}")
    }
}

impl BlockRngCore for AesRngCore {
    type Item = u32;
    type Results = [u32; PAR_BLOCKS * 4];

    // Compute `E(state)` for `PAR_BLOCKS` consecutive counter values.
    #[inline]
    fn generate(&mut self, results: &mut Self::Results) {
        let blocks = bytemuck::cast_slice_mut::<_, aes::Block>(results.as_mut_slice());
        blocks.iter_mut().for_each(|blk| {
            *blk = aes::cipher::Array(self.state.to_le_bytes());
            self.state += 1;
        });
        self.aes.encrypt_blocks(blocks);
    }
}

impl SeedableRng for AesRngCore {
    type Seed = [u8; 16];

    #[inline]
    fn from_seed(seed: Self::Seed) -> Self {
        let aes = Aes128::new(&seed.into());
        AesRngCore { aes, state: 0 }
    }
}

impl CryptoBlockRng for AesRngCore {}

//! Deterministic test payloads.
//!
//! One seeded generator produces the payload a test sends and, on failure,
//! regenerates the bytes it expected, so the two can never drift apart and no
//! second copy of the buffer has to be kept.
//!
//! The sequence is bit-exact with newlib's `rand_r`: the Park-Miller minimal
//! standard generator (multiplier 16807, modulus 2^31 - 1) computed with
//! Schrage's method in 32-bit signed arithmetic. Each payload byte is the low
//! 8 bits of one draw.

use rand_core::{impls, Error, RngCore, SeedableRng};

const MODULUS: i32 = 0x7fff_ffff;
const MULTIPLIER: i32 = 16_807;
// MODULUS / MULTIPLIER and MODULUS % MULTIPLIER
const QUOTIENT: i32 = 127_773;
const REMAINDER: i32 = 2_836;
/// Stand-in for a zero seed, which would otherwise stay zero forever.
const ZERO_SEED: i32 = 0x1234_5987;

/// Park-Miller generator compatible with newlib `rand_r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRng {
    state: u32,
}

impl PatternRng {
    /// Start the sequence at `seed`.
    pub const fn new(seed: u32) -> Self {
        PatternRng { state: seed }
    }

    /// Next draw, in `0..2^31`.
    pub fn next_draw(&mut self) -> u32 {
        let mut s = self.state as i32;
        if s == 0 {
            s = ZERO_SEED;
        }
        let k = s / QUOTIENT;
        s = MULTIPLIER * (s - k * QUOTIENT) - REMAINDER * k;
        if s < 0 {
            s += MODULUS;
        }
        self.state = s as u32;
        (s & MODULUS) as u32
    }

    /// Next payload byte.
    pub fn next_byte(&mut self) -> u8 {
        self.next_draw() as u8
    }
}

impl RngCore for PatternRng {
    fn next_u32(&mut self) -> u32 {
        self.next_draw()
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    /// One draw per byte, unlike most generators, so that a filled buffer
    /// matches [`fill`].
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest {
            *byte = self.next_byte();
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for PatternRng {
    type Seed = [u8; 4];

    fn from_seed(seed: Self::Seed) -> Self {
        PatternRng::new(u32::from_le_bytes(seed))
    }
}

/// Overwrite `buf` with the pattern for `seed`.
pub fn fill(buf: &mut [u8], seed: u32) {
    PatternRng::new(seed).fill_bytes(buf);
}

/// The pattern for `seed`, one byte at a time.
pub fn expected(seed: u32) -> Expected {
    Expected(PatternRng::new(seed))
}

/// Endless iterator over the pattern bytes, see [`expected`].
#[derive(Debug, Clone)]
pub struct Expected(PatternRng);

impl Iterator for Expected {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        Some(self.0.next_byte())
    }
}

/// First position where a buffer differs from what was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mismatch {
    /// Offset into the buffer.
    pub index: usize,
    /// Byte that should be there.
    pub expected: u8,
    /// Byte that is there.
    pub actual: u8,
}

/// Compare `buf` against the pattern for `seed`.
pub fn first_mismatch(buf: &[u8], seed: u32) -> Option<Mismatch> {
    first_difference(expected(seed), buf)
}

/// Compare `actual` against `reference` byte by byte.
pub fn first_difference(
    reference: impl IntoIterator<Item = u8>,
    actual: &[u8],
) -> Option<Mismatch> {
    reference
        .into_iter()
        .zip(actual.iter().copied())
        .enumerate()
        .find(|(_, (expected, actual))| expected != actual)
        .map(|(index, (expected, actual))| Mismatch {
            index,
            expected,
            actual,
        })
}

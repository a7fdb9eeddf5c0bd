//! Fixed-length bit strings
//!
//! Messages, codewords, pads and broadcast values are all bit strings whose
//! length is fixed by the group configuration, not a multiple of eight.
//! `Bits` stores them packed (least-significant bit first within each byte)
//! together with an explicit bit length.
//!
//! Invariant: the storage holds exactly `ceil(len / 8)` bytes and every bit
//! past `len` in the last byte is zero, so equality and XOR operate on the
//! canonical representation.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A packed bit string of explicit length.
#[derive(Clone, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
#[serde(from = "RawBits")]
pub struct Bits {
    bytes: Vec<u8>,
    len: usize,
}

/// Unvalidated wire form of [`Bits`].
///
/// Deserialization goes through this type so that inputs from the network
/// are forced back into canonical shape: the byte count is derived from the
/// claimed length (never grown beyond what was actually sent) and the tail
/// of the last byte is masked to zero.
#[derive(Deserialize)]
struct RawBits {
    bytes: Vec<u8>,
    len: usize,
}

impl From<RawBits> for Bits {
    fn from(raw: RawBits) -> Self {
        let len = raw.len.min(raw.bytes.len().saturating_mul(8));
        let mut bytes = raw.bytes;
        bytes.truncate(len.div_ceil(8));
        let mut bits = Bits { bytes, len };
        bits.mask_tail();
        bits
    }
}

impl Bits {
    /// All-zero bit string of the given length.
    pub fn zeros(len: usize) -> Self {
        Bits {
            bytes: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Uniformly random bit string of the given length.
    pub fn random<R: RngCore + ?Sized>(len: usize, rng: &mut R) -> Self {
        let mut bytes = vec![0u8; len.div_ceil(8)];
        rng.fill_bytes(&mut bytes);
        let mut bits = Bits { bytes, len };
        bits.mask_tail();
        bits
    }

    /// Bit string covering every bit of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Bits {
            bytes: bytes.to_vec(),
            len: bytes.len() * 8,
        }
    }

    /// Length in bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Packed storage, least-significant bit first within each byte.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Value of bit `index`. Out-of-range reads return `false`.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        if index >= self.len {
            return false;
        }
        (self.bytes[index / 8] >> (index % 8)) & 1 == 1
    }

    pub fn set_bit(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.len);
        if index >= self.len {
            return;
        }
        let mask = 1u8 << (index % 8);
        if value {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
    }

    /// XOR `other` into `self`. Both operands must have equal length.
    pub fn xor_in_place(&mut self, other: &Bits) {
        debug_assert_eq!(self.len, other.len);
        for (dst, src) in self.bytes.iter_mut().zip(other.bytes.iter()) {
            *dst ^= src;
        }
    }

    /// The first `len` bits as a new string. `len` must not exceed the
    /// current length.
    pub fn prefix(&self, len: usize) -> Bits {
        debug_assert!(len <= self.len);
        let len = len.min(self.len);
        let mut bits = Bits {
            bytes: self.bytes[..len.div_ceil(8)].to_vec(),
            len,
        };
        bits.mask_tail();
        bits
    }

    /// Copy resized to `len` bits: zero-extended when growing, truncated
    /// when shrinking.
    pub fn resized(&self, len: usize) -> Bits {
        if len <= self.len {
            return self.prefix(len);
        }
        let mut bits = self.clone();
        bits.bytes.resize(len.div_ceil(8), 0);
        bits.len = len;
        bits
    }

    /// Append the low `count` bits of `word`, least significant first.
    pub fn extend_from_word(&mut self, word: u64, count: usize) {
        debug_assert!(count <= 64);
        for i in 0..count {
            let index = self.len;
            self.len += 1;
            if self.bytes.len() * 8 < self.len {
                self.bytes.push(0);
            }
            self.set_bit(index, (word >> i) & 1 == 1);
        }
    }

    /// Read `count` bits starting at `start` into the low bits of a word.
    pub fn word_at(&self, start: usize, count: usize) -> u64 {
        debug_assert!(count <= 64);
        let mut word = 0u64;
        for i in 0..count {
            if self.bit(start + i) {
                word |= 1u64 << i;
            }
        }
        word
    }

    fn mask_tail(&mut self) {
        let used = self.len % 8;
        if used != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << used) - 1;
            }
        }
    }
}

impl std::fmt::Debug for Bits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bits({}: 0x{})", self.len, hex::encode(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zeros_and_len() {
        let bits = Bits::zeros(99);
        assert_eq!(bits.len(), 99);
        assert_eq!(bits.as_bytes().len(), 13);
        assert!((0..99).all(|i| !bits.bit(i)));
    }

    #[test]
    fn test_set_and_get() {
        let mut bits = Bits::zeros(17);
        bits.set_bit(0, true);
        bits.set_bit(8, true);
        bits.set_bit(16, true);
        assert!(bits.bit(0));
        assert!(!bits.bit(1));
        assert!(bits.bit(8));
        assert!(bits.bit(16));

        bits.set_bit(8, false);
        assert!(!bits.bit(8));
    }

    #[test]
    fn test_xor_cancels() {
        let mut rng = StdRng::from_seed([7u8; 32]);
        let a = Bits::random(35, &mut rng);
        let b = Bits::random(35, &mut rng);

        let mut c = a.clone();
        c.xor_in_place(&b);
        c.xor_in_place(&b);
        assert_eq!(c, a);

        let mut d = a.clone();
        d.xor_in_place(&a);
        assert_eq!(d, Bits::zeros(35));
    }

    #[test]
    fn test_random_masks_tail() {
        let mut rng = StdRng::from_seed([1u8; 32]);
        for len in [1, 7, 9, 63, 99] {
            let bits = Bits::random(len, &mut rng);
            let last = *bits.as_bytes().last().unwrap();
            let used = len % 8;
            if used != 0 {
                assert_eq!(last & !((1u8 << used) - 1), 0, "len {len}");
            }
        }
    }

    #[test]
    fn test_prefix_and_resized() {
        let mut rng = StdRng::from_seed([2u8; 32]);
        let bits = Bits::random(40, &mut rng);

        let prefix = bits.prefix(9);
        assert_eq!(prefix.len(), 9);
        assert!((0..9).all(|i| prefix.bit(i) == bits.bit(i)));

        let grown = prefix.resized(20);
        assert_eq!(grown.len(), 20);
        assert!((0..9).all(|i| grown.bit(i) == prefix.bit(i)));
        assert!((9..20).all(|i| !grown.bit(i)));
    }

    #[test]
    fn test_word_round_trip() {
        let mut bits = Bits::zeros(5);
        bits.extend_from_word(0b1_0110_1101, 9);
        assert_eq!(bits.len(), 14);
        assert_eq!(bits.word_at(5, 9), 0b1_0110_1101);
        assert_eq!(bits.word_at(0, 5), 0);
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let bits = Bits::from_bytes(b"Hello, 2!");
        assert_eq!(bits.len(), 72);
        assert_eq!(bits.as_bytes(), b"Hello, 2!");
    }

    #[test]
    fn test_bincode_round_trip() {
        let mut rng = StdRng::from_seed([3u8; 32]);
        let bits = Bits::random(99, &mut rng);
        let encoded = bincode::serialize(&bits).unwrap();
        let decoded: Bits = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, bits);
    }

    #[test]
    fn test_deserialize_canonicalizes_hostile_input() {
        // Same bincode layout as Bits: Vec<u8> then u64 length.
        let wire = bincode::serialize(&(vec![0xFFu8, 0xFF], 9u64)).unwrap();
        let decoded: Bits = bincode::deserialize(&wire).unwrap();

        let mut expected = Bits::zeros(9);
        for i in 0..9 {
            expected.set_bit(i, true);
        }
        assert_eq!(decoded, expected);

        // A length claiming more bits than were sent must not grow storage.
        let wire = bincode::serialize(&(vec![0xFFu8], u64::MAX)).unwrap();
        let decoded: Bits = bincode::deserialize(&wire).unwrap();
        assert_eq!(decoded.len(), 8);
    }
}

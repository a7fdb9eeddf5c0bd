//! Algebraic manipulation detection (AMD) codec
//!
//! Broadcast values travel XOR-masked, so an active adversary can flip any
//! bit of the recovered payload without being noticed by the masking alone.
//! The codec closes that gap: an L-bit message is expanded into an L'-bit
//! codeword carrying a random field element theta and an algebraic tag; any
//! additive (XOR) manipulation of the codeword survives decoding undetected
//! with probability at most 2^-beta.
//!
//! Construction (over GF(2^gamma) = GF(2)[x] / b(x)):
//!
//! ```text
//! codeword = m_padded || theta || tag
//! tag      = theta^(d+2) + sum_{i=1..d} u_i * theta^i
//! ```
//!
//! where m_padded is the message zero-padded to d*gamma bits, split into the
//! d field elements u_1..u_d, and b(x) is the canonical irreducible
//! polynomial of degree gamma (the first irreducible in integer order, the
//! same on every participant).

use rand::RngCore;

use crate::bits::Bits;
use crate::error::ProtocolError;

/// Largest supported field degree. Field elements are packed into single
/// machine words, so gamma must fit 64 bits.
pub const MAX_GAMMA: u32 = 64;

/// Derived codec parameters for one (message length, security) pair.
///
/// Derivation is deterministic, so every participant that agrees on the
/// group configuration agrees on the codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmdParams {
    /// Message length L in bits.
    pub message_len: usize,
    /// Security parameter beta: tampering escapes detection with
    /// probability at most 2^-beta.
    pub security: u32,
    /// Number of message field elements; always odd.
    pub d: u32,
    /// Field degree: tags and theta are gamma-bit field elements.
    pub gamma: u32,
    modulus: u128,
}

impl AmdParams {
    /// Derives (d, gamma) for a message length and security parameter.
    ///
    /// d is the smallest odd value with `d * (beta + log2(d + 1)) >= L`,
    /// and `gamma = ceil(beta + log2(d + 1))`, which makes the forgery
    /// bound `(d + 1) / 2^gamma <= 2^-beta`.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the message length or security
    /// parameter is zero, or if the derived gamma exceeds [`MAX_GAMMA`].
    pub fn derive(message_len: usize, security: u32) -> Result<Self, ProtocolError> {
        if message_len == 0 {
            return Err(ProtocolError::InvalidParameter(
                "message length must be at least 1 bit".to_string(),
            ));
        }
        if security == 0 {
            return Err(ProtocolError::InvalidParameter(
                "security parameter must be at least 1".to_string(),
            ));
        }

        let mut d: u32 = 1;
        while (d as f64) * (security as f64 + ((d + 1) as f64).log2()) < message_len as f64 {
            d += 2;
        }
        let gamma = (security as f64 + ((d + 1) as f64).log2()).ceil() as u32;
        if gamma > MAX_GAMMA {
            return Err(ProtocolError::InvalidParameter(format!(
                "derived field degree {} exceeds the supported maximum {}",
                gamma, MAX_GAMMA
            )));
        }

        Ok(AmdParams {
            message_len,
            security,
            d,
            gamma,
            modulus: irreducible(gamma),
        })
    }

    /// Codeword length L' = d*gamma + 2*gamma bits.
    pub fn codeword_len(&self) -> usize {
        (self.d as usize + 2) * self.gamma as usize
    }

    /// Length of the zero-padded message section, d*gamma bits.
    pub fn padded_len(&self) -> usize {
        self.d as usize * self.gamma as usize
    }
}

/// Outcome of decoding: the recovered message and the tag verdict.
///
/// `valid == false` means the codeword was manipulated in transit. The
/// message is still surfaced so callers can log or inspect it; it must not
/// be trusted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub message: Bits,
    pub valid: bool,
}

/// Encodes a message into a codeword carrying a fresh random theta.
///
/// # Errors
/// Returns `InvalidParameter` if the message length does not match the
/// parameters.
pub fn encode<R: RngCore + ?Sized>(
    params: &AmdParams,
    message: &Bits,
    rng: &mut R,
) -> Result<Bits, ProtocolError> {
    if message.len() != params.message_len {
        return Err(ProtocolError::InvalidParameter(format!(
            "message is {} bits, codec expects {}",
            message.len(),
            params.message_len
        )));
    }

    let gamma = params.gamma as usize;
    let theta = Bits::random(gamma, rng).word_at(0, gamma);

    let mut codeword = message.resized(params.padded_len());
    let tag = tag(params, &codeword, theta);
    codeword.extend_from_word(theta, gamma);
    codeword.extend_from_word(tag, gamma);
    Ok(codeword)
}

/// Decodes a codeword, recomputing and checking the tag.
///
/// Any input of exactly the codeword length decodes to a message plus a
/// verdict; a wrong length is an input-contract violation and errors
/// instead of being truncated or padded.
pub fn decode(params: &AmdParams, codeword: &Bits) -> Result<Decoded, ProtocolError> {
    if codeword.len() != params.codeword_len() {
        return Err(ProtocolError::CodewordLength {
            expected: params.codeword_len(),
            got: codeword.len(),
        });
    }

    let gamma = params.gamma as usize;
    let padded = codeword.prefix(params.padded_len());
    let theta = codeword.word_at(params.padded_len(), gamma);
    let received_tag = codeword.word_at(params.padded_len() + gamma, gamma);

    let expected_tag = tag(params, &padded, theta);
    let valid = constant_time_word_eq(received_tag, expected_tag);

    Ok(Decoded {
        message: padded.prefix(params.message_len),
        valid,
    })
}

/// tag = theta^(d+2) + sum_{i=1..d} u_i * theta^i in GF(2^gamma).
fn tag(params: &AmdParams, padded: &Bits, theta: u64) -> u64 {
    let gamma = params.gamma as usize;
    let m = params.modulus;

    let mut acc: u128 = 0;
    // power tracks theta^i, reduced at every step so operands stay below
    // degree gamma.
    let mut power = pmod(theta as u128, m);
    for i in 0..params.d as usize {
        let u = padded.word_at(i * gamma, gamma) as u128;
        acc ^= pmulmod(u, power, m);
        power = pmulmod(power, theta as u128, m);
    }
    // After the loop power = theta^(d+1); one more step gives theta^(d+2).
    power = pmulmod(power, theta as u128, m);
    acc ^= power;
    acc as u64
}

/// Constant-time comparison of two field elements.
fn constant_time_word_eq(a: u64, b: u64) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.to_le_bytes().iter().zip(b.to_le_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// The canonical irreducible polynomial of degree `gamma` over GF(2): the
/// first candidate in increasing integer order that passes the
/// irreducibility test. Deterministic, so every participant derives the
/// same field.
fn irreducible(gamma: u32) -> u128 {
    debug_assert!((2..=MAX_GAMMA).contains(&gamma));
    let base = 1u128 << gamma;
    // Even candidates are divisible by x, so only odd ones are tried.
    let mut candidate = base + 1;
    while candidate < base << 1 {
        if is_irreducible(candidate, gamma) {
            return candidate;
        }
        candidate += 2;
    }
    unreachable!("an irreducible polynomial exists for every degree");
}

/// Rabin's irreducibility test: b of degree n is irreducible over GF(2)
/// iff x^(2^n) == x (mod b) and gcd(x^(2^(n/p)) - x, b) == 1 for every
/// prime p dividing n.
fn is_irreducible(b: u128, n: u32) -> bool {
    if frobenius(b, n) != 0b10 {
        return false;
    }
    for p in prime_divisors(n) {
        let h = frobenius(b, n / p) ^ 0b10;
        if pgcd(h, b) != 1 {
            return false;
        }
    }
    true
}

/// x^(2^k) mod b, by k repeated squarings of x.
fn frobenius(b: u128, k: u32) -> u128 {
    let mut t = pmod(0b10, b);
    for _ in 0..k {
        t = pmulmod(t, t, b);
    }
    t
}

fn prime_divisors(mut n: u32) -> Vec<u32> {
    let mut primes = Vec::new();
    let mut p = 2;
    while p * p <= n {
        if n % p == 0 {
            primes.push(p);
            while n % p == 0 {
                n /= p;
            }
        }
        p += 1;
    }
    if n > 1 {
        primes.push(n);
    }
    primes
}

/// Degree of a polynomial packed into a word; -1 for the zero polynomial.
fn pdeg(a: u128) -> i32 {
    127 - a.leading_zeros() as i32
}

/// Carry-less product. Operand degrees must sum below 128.
fn pmul(a: u128, b: u128) -> u128 {
    let mut acc = 0u128;
    let mut a = a;
    let mut shift = 0;
    while a != 0 {
        let low = a.trailing_zeros();
        a >>= low;
        shift += low;
        acc ^= b << shift;
        a &= !1;
    }
    acc
}

/// Remainder of a modulo m in GF(2)[x].
fn pmod(mut a: u128, m: u128) -> u128 {
    let md = pdeg(m);
    while pdeg(a) >= md {
        a ^= m << (pdeg(a) - md) as u32;
    }
    a
}

fn pmulmod(a: u128, b: u128, m: u128) -> u128 {
    pmod(pmul(a, b), m)
}

fn pgcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let r = pmod(a, b);
        a = b;
        b = r;
    }
    a
}

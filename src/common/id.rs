//! 160-bit identifier used for node ids and value keys.
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The size of an [InfoHash] in bytes.
pub const HASH_SIZE: usize = 20;

/// The size of an [InfoHash] in bits.
pub const HASH_BITS: usize = HASH_SIZE * 8;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// 160-bit identifier, used both for node ids and for value keys.
///
/// Distances are XOR distances compared lexicographically, big-endian.
pub struct InfoHash(pub [u8; HASH_SIZE]);

impl InfoHash {
    /// The all-zero id, the lower bound of the id space.
    pub const ZERO: InfoHash = InfoHash([0; HASH_SIZE]);

    /// Generates a uniformly random id.
    pub fn random() -> InfoHash {
        let mut rng = rand::thread_rng();
        InfoHash(rng.gen())
    }

    /// Create an id from a byte slice. Returns `Err` if `bytes` is not of
    /// length [HASH_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<InfoHash> {
        let bytes = bytes.as_ref();
        if bytes.len() != HASH_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp = [0; HASH_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(InfoHash(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// XOR of two ids.
    pub fn xor(&self, other: &InfoHash) -> InfoHash {
        let mut out = [0; HASH_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        InfoHash(out)
    }

    /// Compare the distance of `a` and `b` to `self`, by XOR metric.
    ///
    /// Returns `Less` when `a` is closer to `self` than `b`.
    pub fn xor_cmp(&self, a: &InfoHash, b: &InfoHash) -> Ordering {
        for i in 0..HASH_SIZE {
            let da = self.0[i] ^ a.0[i];
            let db = self.0[i] ^ b.0[i];
            if da != db {
                return da.cmp(&db);
            }
        }
        Ordering::Equal
    }

    /// Number of leading bits `self` and `other` have in common.
    pub fn common_bits(&self, other: &InfoHash) -> usize {
        for i in 0..HASH_SIZE {
            let x = self.0[i] ^ other.0[i];
            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }
        HASH_BITS
    }

    /// Position of the lowest set bit, counting from the most significant
    /// bit. `None` for the zero id.
    pub fn lowbit(&self) -> Option<usize> {
        let i = (0..HASH_SIZE).rev().find(|&i| self.0[i] != 0)?;
        Some(i * 8 + 7 - self.0[i].trailing_zeros() as usize)
    }

    /// Returns a copy of this id with bit `bit` (0 = most significant) set
    /// or cleared.
    pub fn with_bit(&self, bit: usize, value: bool) -> InfoHash {
        let mut out = self.0;
        if value {
            out[bit / 8] |= 0x80 >> (bit % 8);
        } else {
            out[bit / 8] &= !(0x80 >> (bit % 8));
        }
        InfoHash(out)
    }

    /// Returns bit `bit`, counting from the most significant.
    pub fn bit(&self, bit: usize) -> bool {
        self.0[bit / 8] & (0x80 >> (bit % 8)) != 0
    }

    /// Generates a random id agreeing with `self` on the first `bits` bits.
    pub fn random_with_prefix(&self, bits: usize) -> InfoHash {
        let mut id = InfoHash::random();
        let whole = bits / 8;
        id.0[..whole].copy_from_slice(&self.0[..whole]);
        if bits % 8 != 0 {
            let mask: u8 = 0xff << (8 - bits % 8);
            id.0[whole] = (self.0[whole] & mask) | (id.0[whole] & !mask);
        }
        id
    }
}

impl FromStr for InfoHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<InfoHash> {
        if s.len() != HASH_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding("expected 40 hex characters"));
        }

        let mut out = [0; HASH_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding("invalid hex character"))?;
        }
        Ok(InfoHash(out))
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Debug for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

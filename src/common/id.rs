//! Kademlia node Id, lookup target or storage key
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id, lookup target or storage key.
///
/// A 160 bit unsigned integer stored big-endian, so the derived ordering
/// is the numeric ordering.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The smallest Id (all bits unset).
    pub const MIN: Id = Id([0; ID_SIZE]);
    /// The largest Id (all bits set).
    pub const MAX: Id = Id([u8::MAX; ID_SIZE]);

    /// Generate a uniformly random Id.
    pub fn random() -> Id {
        Self::random_from(&mut rand::thread_rng())
    }

    /// Generate a uniformly random Id from a given random source.
    pub fn random_from<R: Rng + ?Sized>(rng: &mut R) -> Id {
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Generate a random Id sharing the first `depth` bits with `prefix`,
    /// in other words a random Id within the bucket range starting at `prefix`.
    pub fn random_with_prefix<R: Rng + ?Sized>(prefix: &Id, depth: usize, rng: &mut R) -> Id {
        let mut id = Self::random_from(rng);

        for index in 0..depth.min(ID_BITS) {
            id = id.with_bit(index, prefix.bit(index));
        }

        id
    }

    /// Hash an arbitrary application key into the Id space.
    pub fn from_key<T: AsRef<[u8]>>(key: T) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(key.as_ref());

        Id(hasher.digest().bytes())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// XOR distance between this Id and a target Id.
    ///
    /// The result is itself an [Id] so it compares as an unsigned integer,
    /// smaller is closer.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Number of leading bits shared with `other`.
    ///
    /// Equal Ids share all [ID_BITS].
    pub fn common_prefix_len(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                return i * 8 + (a ^ b).leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of this Id with the bit at `index` set to `value`.
    pub fn with_bit(mut self, index: usize, value: bool) -> Id {
        let mask = 0x80 >> (index % 8);

        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }

        self
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse an Id from its 40 characters hex encoding.
    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = s
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| Error::InvalidIdEncoding(s.to_string()))?;

            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

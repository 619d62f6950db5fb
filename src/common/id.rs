//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Kademlia node Id or a lookup target (info hash).
///
/// Ordering is the unsigned big-endian (lexicographic) ordering of the bytes.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generate a random Id from the thread local rng.
    pub fn random() -> Id {
        Self::random_from(&mut rand::thread_rng())
    }

    /// Generate a random Id from a given rng, useful for seeded simulations.
    pub fn random_from<R: Rng + ?Sized>(rng: &mut R) -> Id {
        let bytes: [u8; ID_SIZE] = rng.gen();

        Id(bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// The all zeros Id, lower bound of the identifier space.
    pub const fn zero() -> Id {
        Id([0; ID_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR distance between this Id and another, as an Id.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Compare the XOR distances of `a` and `b` to this Id, byte by byte,
    /// without materializing either distance.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        for i in 0..ID_SIZE {
            let da = a.0[i] ^ self.0[i];
            let db = b.0[i] ^ self.0[i];

            if da != db {
                return da.cmp(&db);
            }
        }

        Ordering::Equal
    }

    /// Returns the bit at `index`, where bit 0 is the most significant bit.
    pub fn get_bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of this Id with the bit at `index` set to `value`.
    ///
    /// Bit 0 is the most significant bit.
    pub fn set_bit(mut self, index: usize, value: bool) -> Id {
        if value {
            self.0[index / 8] |= 0x80 >> (index % 8);
        } else {
            self.0[index / 8] &= !(0x80 >> (index % 8));
        }

        self
    }

    /// Index (counted from the most significant bit) of the lowest set bit,
    /// or `None` for the zero Id.
    ///
    /// For a bucket lower bound this is the last bit fixed by its prefix.
    pub fn low_bit(&self) -> Option<usize> {
        let (i, byte) = self
            .0
            .iter()
            .enumerate()
            .rev()
            .find(|(_, byte)| **byte != 0)?;

        Some(i * 8 + 7 - byte.trailing_zeros() as usize)
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

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_str_and_display() {
        let string = "5a3ce9c14e7a08645677bbd1cfe7d8f956d53256";
        let id = Id::from_str(string).unwrap();

        assert_eq!(id.to_string(), string);
        assert_eq!(id.as_bytes()[0], 0x5a);
    }

    #[test]
    fn invalid_ids() {
        assert!(matches!(
            Id::from_bytes([0; 19]),
            Err(Error::InvalidIdSize(19))
        ));
        assert!(Id::from_str("5a3ce9c14e7a").is_err());
        assert!(Id::from_str("zz3ce9c14e7a08645677bbd1cfe7d8f956d53256").is_err());
    }

    #[test]
    fn lexicographic_order() {
        let a = Id::from_str("0000000000000000000000000000000000000001").unwrap();
        let b = Id::from_str("0100000000000000000000000000000000000000").unwrap();

        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Greater);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn bits() {
        let id = Id::zero().set_bit(0, true).set_bit(159, true);

        assert!(id.get_bit(0));
        assert!(!id.get_bit(1));
        assert!(id.get_bit(159));
        assert_eq!(id.as_bytes()[0], 0x80);
        assert_eq!(id.as_bytes()[19], 0x01);

        assert!(!id.set_bit(0, false).get_bit(0));
    }

    #[test]
    fn low_bit() {
        assert_eq!(Id::zero().low_bit(), None);
        assert_eq!(Id::zero().set_bit(0, true).low_bit(), Some(0));
        assert_eq!(Id::zero().set_bit(0, true).set_bit(9, true).low_bit(), Some(9));
        assert_eq!(Id::zero().set_bit(159, true).low_bit(), Some(159));
    }

    #[test]
    fn xor_distance() {
        let id = Id::random();

        assert_eq!(id.xor(&id), Id::zero());

        let target = Id::zero();
        let near = Id::zero().set_bit(100, true);
        let far = Id::zero().set_bit(3, true);

        assert_eq!(target.cmp_distance(&near, &far), Ordering::Less);
        assert_eq!(target.cmp_distance(&far, &near), Ordering::Greater);
        assert_eq!(
            target.cmp_distance(&near, &far),
            near.xor(&target).cmp(&far.xor(&target))
        );
    }
}

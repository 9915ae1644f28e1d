//! # Entry Identifier Generation
//!
//! Every entry gets a 26-character id that sorts, as a plain string, in
//! creation order. The id is the log's total order key: scans order by it and
//! the pagination cursor is compared against it.
//!
//! ## Layout
//!
//! ```text
//!  01ARZ3NDEK        TSV4RRFFQ69G5FAV
//! └──────────┘      └────────────────┘
//!  48-bit Unix ms     80 bits of entropy
//!  (10 chars)         (16 chars)
//!
//! 128 bits, Crockford base32: 0123456789ABCDEFGHJKMNPQRSTVWXYZ
//! ```
//!
//! The alphabet is in ascending ASCII order and every id has the same width,
//! so string comparison equals numeric comparison of the 128-bit value.
//!
//! ## Monotonicity
//!
//! A single [`IdGenerator`] never hands out the same or a smaller id twice:
//! when the clock has not moved forward since the last call, the previous
//! random part is incremented instead of drawing fresh entropy.
//!
//! ```text
//! t=1000 → 1000·R1
//! t=1000 → 1000·(R1+1)     same millisecond: increment
//! t=999  → 1000·(R1+2)     clock stepped back: still increment
//! t=1001 → 1001·R2         clock advanced: fresh entropy
//! ```
//!
//! Ids from *different* generators (other processes) are only ordered by their
//! millisecond prefix; ties within the same millisecond fall wherever the
//! random parts land. Nothing in Chronicles relies on cross-process order.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::error::{Error, Result};
use crate::types::EntryId;

/// Crockford base32 alphabet (no I, L, O, U).
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Length of an encoded id.
pub const ID_LEN: usize = 26;

/// Number of characters holding the timestamp.
const TIME_LEN: usize = 10;

const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1u128 << RANDOM_BITS) - 1;

/// Largest timestamp that fits in 48 bits.
const MAX_TIMESTAMP_MS: u64 = (1u64 << 48) - 1;

// =============================================================================
// Generator
// =============================================================================

/// Produces unique, sortable entry ids.
///
/// The generator is owned by the writer thread, so `next` takes `&mut self`
/// and needs no locking.
#[derive(Debug, Default)]
pub struct IdGenerator {
    /// Timestamp part of the last id handed out.
    last_ms: u64,
    /// Random part of the last id handed out.
    last_random: u128,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new id stamped with the current system time.
    ///
    /// # Errors
    ///
    /// `Error::IdGeneration` if the system clock is before the Unix epoch or
    /// the OS entropy source cannot be read.
    pub fn next(&mut self) -> Result<EntryId> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::IdGeneration(format!("system clock before unix epoch: {e}")))?
            .as_millis() as u64;
        self.next_at(now_ms)
    }

    /// Returns a new id for the given wall-clock reading.
    pub(crate) fn next_at(&mut self, now_ms: u64) -> Result<EntryId> {
        if now_ms > MAX_TIMESTAMP_MS {
            return Err(Error::IdGeneration(format!(
                "timestamp {now_ms} does not fit in 48 bits"
            )));
        }

        if now_ms > self.last_ms || (self.last_ms == 0 && self.last_random == 0) {
            self.last_ms = now_ms;
            self.last_random = fresh_random()?;
        } else if self.last_random == RANDOM_MASK {
            // Random part exhausted within this millisecond: borrow the next one.
            if self.last_ms == MAX_TIMESTAMP_MS {
                return Err(Error::IdGeneration("id space exhausted".to_string()));
            }
            self.last_ms += 1;
            self.last_random = fresh_random()?;
        } else {
            self.last_random += 1;
        }

        Ok(EntryId::new(encode(self.last_ms, self.last_random)))
    }
}

/// Draws 80 bits from the OS entropy source.
fn fresh_random() -> Result<u128> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes[6..])
        .map_err(|e| Error::IdGeneration(format!("entropy source unavailable: {e}")))?;
    Ok(u128::from_be_bytes(bytes) & RANDOM_MASK)
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a timestamp and random part into the 26-character form.
pub(crate) fn encode(timestamp_ms: u64, random: u128) -> String {
    let value = ((timestamp_ms as u128) << RANDOM_BITS) | (random & RANDOM_MASK);
    let mut out = String::with_capacity(ID_LEN);
    for i in 0..ID_LEN {
        let shift = 5 * (ID_LEN - 1 - i);
        let index = ((value >> shift) & 0x1f) as usize;
        out.push(ALPHABET[index] as char);
    }
    out
}

/// Decodes the millisecond timestamp from an encoded id.
///
/// Returns `None` for strings of the wrong length or with characters outside
/// the alphabet. Lower-case input is accepted.
pub fn decode_timestamp_ms(id: &str) -> Option<u64> {
    if id.len() != ID_LEN {
        return None;
    }

    let mut value: u64 = 0;
    for c in id.bytes().take(TIME_LEN) {
        let digit = ALPHABET
            .iter()
            .position(|&a| a == c.to_ascii_uppercase())? as u64;
        value = (value << 5) | digit;
    }

    // The first character only carries 3 meaningful bits of a 128-bit value.
    if value > MAX_TIMESTAMP_MS {
        return None;
    }

    // The remaining characters must still be valid.
    if !id.bytes().skip(TIME_LEN).all(|c| ALPHABET.contains(&c.to_ascii_uppercase())) {
        return None;
    }

    Some(value)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_known_encoding() {
        // 1469922850259 ms, random part "TSV4RRFFQ69G5FAV"
        let id = encode(1_469_922_850_259, 0);
        assert_eq!(&id[..TIME_LEN], "01ARZ3NDEK");
        assert_eq!(&id[TIME_LEN..], "0000000000000000");
        assert_eq!(decode_timestamp_ms(&id), Some(1_469_922_850_259));
    }

    #[test]
    fn test_fixed_width_and_url_safe() {
        let mut generator = IdGenerator::new();
        for _ in 0..100 {
            let id = generator.next().unwrap();
            assert_eq!(id.as_str().len(), ID_LEN);
            assert!(id.as_str().bytes().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_strictly_increasing_within_same_millisecond() {
        let mut generator = IdGenerator::new();
        let mut previous = generator.next_at(5_000).unwrap();
        for _ in 0..1000 {
            let id = generator.next_at(5_000).unwrap();
            assert!(id > previous, "{id} should sort after {previous}");
            assert_eq!(id.timestamp_ms(), Some(5_000));
            previous = id;
        }
    }

    #[test]
    fn test_clock_going_backwards_does_not_reorder() {
        let mut generator = IdGenerator::new();
        let a = generator.next_at(10_000).unwrap();
        let b = generator.next_at(9_000).unwrap();
        assert!(b > a);
        assert_eq!(b.timestamp_ms(), Some(10_000));
    }

    #[test]
    fn test_later_millisecond_sorts_later() {
        let mut generator = IdGenerator::new();
        let a = generator.next_at(1_000).unwrap();
        let b = generator.next_at(1_001).unwrap();
        assert!(b > a);
        assert_eq!(b.timestamp_ms(), Some(1_001));
    }

    #[test]
    fn test_random_overflow_borrows_next_millisecond() {
        let mut generator = IdGenerator {
            last_ms: 42,
            last_random: RANDOM_MASK,
        };
        let id = generator.next_at(42).unwrap();
        assert_eq!(id.timestamp_ms(), Some(43));
        assert!(id > EntryId::new(encode(42, RANDOM_MASK)));
    }

    #[test]
    fn test_string_order_matches_numeric_order() {
        let pairs = [
            ((1, 0), (1, 1)),
            ((1, RANDOM_MASK), (2, 0)),
            ((0x0000_FFFF_FFFF, 5), (0x0001_0000_0000, 0)),
            ((MAX_TIMESTAMP_MS - 1, RANDOM_MASK), (MAX_TIMESTAMP_MS, 0)),
        ];
        for ((t1, r1), (t2, r2)) in pairs {
            assert!(encode(t1, r1) < encode(t2, r2));
        }
    }

    #[test]
    fn test_unique_across_generators() {
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let mut generator = IdGenerator::new();
            for _ in 0..500 {
                assert!(seen.insert(generator.next().unwrap()));
            }
        }
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode_timestamp_ms(""), None);
        assert_eq!(decode_timestamp_ms("B"), None);
        assert_eq!(decode_timestamp_ms("01ARZ3NDEKTSV4RRFFQ69G5FA!"), None);
        assert_eq!(decode_timestamp_ms("81ARZ3NDEKTSV4RRFFQ69G5FAV"), None);
        assert_eq!(decode_timestamp_ms("01arz3ndektsv4rrffq69g5fav"), Some(1_469_922_850_259));
    }

    #[test]
    fn test_timestamp_out_of_range() {
        let mut generator = IdGenerator::new();
        let err = generator.next_at(MAX_TIMESTAMP_MS + 1).unwrap_err();
        assert!(matches!(err, Error::IdGeneration(_)));
    }
}

//! FNV-1 hash, used to derive advisory lock keys.
//!
//! FNV-1 (not FNV-1a: multiply happens before the XOR) compresses an
//! arbitrary-length lock string into the 64 bits a Postgres advisory lock
//! offers. It is not a cryptographic hash and is never used as one here.
//! Interoperating clients depend on bit-exact agreement, so the constants
//! below must never change.

const OFFSET_BASIS_32: u32 = 0x811c_9dc5;
const PRIME_32: u32 = 0x0100_0193;

const OFFSET_BASIS_64: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME_64: u64 = 0x0000_0100_0000_01b3;

/// 32-bit FNV-1 hash of the input bytes.
pub(crate) fn fnv1_32(data: &[u8]) -> u32 {
    let mut hash = OFFSET_BASIS_32;
    for &byte in data {
        hash = hash.wrapping_mul(PRIME_32);
        hash ^= u32::from(byte);
    }
    hash
}

/// 64-bit FNV-1 hash of the input bytes.
pub(crate) fn fnv1_64(data: &[u8]) -> u64 {
    let mut hash = OFFSET_BASIS_64;
    for &byte in data {
        hash = hash.wrapping_mul(PRIME_64);
        hash ^= u64::from(byte);
    }
    hash
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_offset_basis() {
        assert_eq!(fnv1_32(b""), OFFSET_BASIS_32);
        assert_eq!(fnv1_64(b""), OFFSET_BASIS_64);
    }

    #[test]
    fn hash_is_deterministic() {
        let input = b"unique_keykind=simple&queue=default";
        assert_eq!(fnv1_32(input), fnv1_32(input));
        assert_eq!(fnv1_64(input), fnv1_64(input));
    }

    #[test]
    fn distinct_inputs_hash_differently() {
        assert_ne!(fnv1_64(b"kind=simple"), fnv1_64(b"kind=simple2"));
        assert_ne!(fnv1_32(b"kind=simple"), fnv1_32(b"kind=simple2"));
    }

    #[test]
    fn single_byte_folds_into_basis() {
        // One iteration of FNV-1 is multiply-then-XOR by construction.
        assert_eq!(
            fnv1_64(b"a"),
            OFFSET_BASIS_64.wrapping_mul(PRIME_64) ^ u64::from(b'a')
        );
        assert_eq!(
            fnv1_32(b"a"),
            OFFSET_BASIS_32.wrapping_mul(PRIME_32) ^ u32::from(b'a')
        );
    }
}

//! Checksum utilities for FlashKV
//!
//! Every on-disk structure is protected by a CRC32C computed over the whole
//! block with the checksum field itself treated as zero. The CRC is seeded,
//! normally with the structure's eye-catcher, so that a block of one type can
//! never validate as a block of another type.

/// Byte offset of the checksum field in every metadata block header
pub const CHECKSUM_OFFSET: usize = 8;

/// Width of the checksum field
const CHECKSUM_LEN: usize = 4;

/// Compute the checksum of `block` with the field at `offset` taken as zero.
///
/// # Panics
///
/// Panics if the checksum field does not fit inside `block`.
#[must_use]
pub fn block_checksum(block: &[u8], seed: u32, offset: usize) -> u32 {
    assert!(offset + CHECKSUM_LEN <= block.len(), "checksum field out of range");
    let crc = crc32c::crc32c_append(seed, &block[..offset]);
    let crc = crc32c::crc32c_append(crc, &[0u8; CHECKSUM_LEN]);
    crc32c::crc32c_append(crc, &block[offset + CHECKSUM_LEN..])
}

/// Read the stored checksum at `offset`
#[must_use]
pub fn stored_checksum(block: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; CHECKSUM_LEN];
    raw.copy_from_slice(&block[offset..offset + CHECKSUM_LEN]);
    u32::from_le_bytes(raw)
}

/// Compute and store the checksum of `block` in place
pub fn seal_block(block: &mut [u8], seed: u32, offset: usize) -> u32 {
    let crc = block_checksum(block, seed, offset);
    block[offset..offset + CHECKSUM_LEN].copy_from_slice(&crc.to_le_bytes());
    crc
}

/// Verify the checksum of `block`, returning `(stored, computed)` on mismatch
pub fn verify_block_checksum(block: &[u8], seed: u32, offset: usize) -> Result<(), (u32, u32)> {
    let stored = stored_checksum(block, offset);
    let computed = block_checksum(block, seed, offset);
    if stored == computed {
        Ok(())
    } else {
        Err((stored, computed))
    }
}

/// Fold a 64-bit value into a 32-bit checksum seed
#[inline]
#[must_use]
pub const fn fold_seed(base: u32, value: u64) -> u32 {
    base ^ (value as u32) ^ ((value >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const SEED: u32 = 0x4653_4B46;

    fn sample_block() -> Vec<u8> {
        (0..512u32).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_seal_then_verify() {
        let mut block = sample_block();
        seal_block(&mut block, SEED, CHECKSUM_OFFSET);
        assert!(verify_block_checksum(&block, SEED, CHECKSUM_OFFSET).is_ok());
    }

    #[test]
    fn test_checksum_ignores_its_own_field() {
        let mut a = sample_block();
        let mut b = sample_block();
        b[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            block_checksum(&a, SEED, CHECKSUM_OFFSET),
            block_checksum(&b, SEED, CHECKSUM_OFFSET)
        );
        seal_block(&mut a, SEED, CHECKSUM_OFFSET);
        seal_block(&mut b, SEED, CHECKSUM_OFFSET);
        assert_eq!(a, b);
    }

    #[test]
    fn test_seed_separates_structures() {
        let mut block = sample_block();
        seal_block(&mut block, SEED, CHECKSUM_OFFSET);
        assert!(verify_block_checksum(&block, SEED ^ 1, CHECKSUM_OFFSET).is_err());
    }

    #[test]
    fn test_any_single_byte_corruption_detected() {
        let mut rng = rand::thread_rng();
        let mut block = sample_block();
        seal_block(&mut block, SEED, CHECKSUM_OFFSET);
        for _ in 0..64 {
            let mut corrupted = block.clone();
            let pos = rng.gen_range(0..corrupted.len());
            let flip: u8 = rng.gen_range(1..=255);
            corrupted[pos] ^= flip;
            assert!(verify_block_checksum(&corrupted, SEED, CHECKSUM_OFFSET).is_err());
        }
    }

    #[test]
    fn test_fold_seed() {
        assert_eq!(fold_seed(0, 0), 0);
        assert_eq!(fold_seed(1, 1 << 32), 0);
        assert_ne!(fold_seed(SEED, 41), fold_seed(SEED, 42));
    }
}

use anyhow::Result;

pub mod cpu;
pub mod cuda;

pub use cpu::CpuEngine;
pub use cuda::CudaEngine;

use poc_spec::{HASHES_PER_NONCE, HASH_WORDS, LANE};

const LANE_MASK: usize = LANE - 1;

/// Word index of `(nonce, hash, word)` inside a batch buffer.
///
/// The hash kernel packs 16 consecutive nonces into one lane group and
/// interleaves their words, so that threads of a SIMD group load and store
/// contiguous memory. Every consumer of engine output goes through this one
/// function.
#[inline]
pub fn interleaved_index(nonce: usize, hash: usize, word: usize) -> usize {
    (nonce & !LANE_MASK) * HASHES_PER_NONCE * HASH_WORDS
        + hash * LANE * HASH_WORDS
        + word * LANE
        + (nonce & LANE_MASK)
}

/// Batch hasher filling blocks with nonce material in the interleaved layout.
pub trait HashEngine: Send {
    fn name(&self) -> &'static str;

    /// Natural batch size in nonces; blocks are sized to this.
    fn global_work_size(&self) -> usize;

    /// Fill `out` with hash material for `nonces` nonces starting at
    /// `start_nonce`. `out` must hold `global_work_size()` nonces and be
    /// 4-byte aligned; an engine may fill the whole batch even when
    /// `nonces` is smaller.
    fn plot(&mut self, plot_id: u64, start_nonce: u64, nonces: usize, out: &mut [u8])
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn interleaving_is_a_bijection_over_one_lane_group() {
        let words_per_group = LANE * HASHES_PER_NONCE * HASH_WORDS;
        let mut seen = HashSet::with_capacity(words_per_group);
        for nonce in 0..LANE {
            for hash in (0..HASHES_PER_NONCE).step_by(512) {
                for word in 0..HASH_WORDS {
                    let idx = interleaved_index(nonce, hash, word);
                    assert!(idx < words_per_group);
                    assert!(seen.insert(idx), "index {idx} mapped twice");
                }
            }
        }
    }

    #[test]
    fn second_lane_group_starts_after_the_first() {
        let group_words = LANE * HASHES_PER_NONCE * HASH_WORDS;
        assert_eq!(interleaved_index(16, 0, 0), group_words);
        assert_eq!(interleaved_index(17, 0, 0), group_words + 1);
    }

    #[test]
    fn words_of_one_hash_are_lane_strided() {
        let base = interleaved_index(3, 100, 0);
        for word in 0..HASH_WORDS {
            assert_eq!(interleaved_index(3, 100, word), base + word * LANE);
        }
    }
}

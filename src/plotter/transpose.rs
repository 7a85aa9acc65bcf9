use poc_spec::{HASHES_PER_NONCE, HASH_WORDS, SCOOP_BYTES};

use crate::engine::interleaved_index;

/// Words per 64-byte scoop record.
pub const SCOOP_WORDS: usize = SCOOP_BYTES / 4;

/// Gather one scoop's records for `n` nonces starting at `nstart` out of a
/// batch in the interleaved engine layout, packing them contiguously into
/// `dst`. A record pairs hash `2s` with its mirror hash
/// `HASHES_PER_NONCE - 2s - 1`.
///
/// This is the only fast-path code that touches the interleaved indices;
/// the writer emits `dst` as a linear stream.
pub fn transpose_scoop(src: &[u32], dst: &mut [u32], scoop: usize, nstart: usize, n: usize) {
    debug_assert!(scoop < HASHES_PER_NONCE / 2);
    debug_assert!(dst.len() >= n * SCOOP_WORDS);

    let hi_a = scoop * 2;
    let hi_b = HASHES_PER_NONCE - (scoop * 2 + 1);
    for i in 0..n {
        let nonce = nstart + i;
        let record = &mut dst[i * SCOOP_WORDS..(i + 1) * SCOOP_WORDS];
        for w in 0..HASH_WORDS {
            record[w] = src[interleaved_index(nonce, hi_a, w)];
        }
        for w in 0..HASH_WORDS {
            record[HASH_WORDS + w] = src[interleaved_index(nonce, hi_b, w)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poc_spec::{LANE, PLOT_SIZE};

    fn encode(nonce: usize, hash: usize, word: usize) -> u32 {
        ((nonce as u32) << 17) | ((hash as u32) << 4) | word as u32
    }

    fn synthetic_batch(nonces: usize) -> Vec<u32> {
        let mut src = vec![0u32; nonces * PLOT_SIZE / 4];
        for nonce in 0..nonces {
            for hash in 0..HASHES_PER_NONCE {
                for word in 0..HASH_WORDS {
                    src[interleaved_index(nonce, hash, word)] = encode(nonce, hash, word);
                }
            }
        }
        src
    }

    #[test]
    fn records_pair_scoop_hash_with_mirror_hash() {
        let src = synthetic_batch(LANE);
        let scoop = 5;
        let mut dst = vec![0u32; 7 * SCOOP_WORDS];
        transpose_scoop(&src, &mut dst, scoop, 3, 7);

        for i in 0..7 {
            let nonce = 3 + i;
            for w in 0..HASH_WORDS {
                assert_eq!(dst[i * SCOOP_WORDS + w], encode(nonce, 2 * scoop, w));
                assert_eq!(
                    dst[i * SCOOP_WORDS + HASH_WORDS + w],
                    encode(nonce, HASHES_PER_NONCE - 2 * scoop - 1, w)
                );
            }
        }
    }

    #[test]
    fn extreme_scoops_stay_in_bounds() {
        let src = synthetic_batch(LANE);
        let mut dst = vec![0u32; LANE * SCOOP_WORDS];
        for scoop in [0, HASHES_PER_NONCE / 2 - 1] {
            transpose_scoop(&src, &mut dst, scoop, 0, LANE);
            assert_eq!(dst[0], encode(0, 2 * scoop, 0));
            assert_eq!(
                dst[HASH_WORDS],
                encode(0, HASHES_PER_NONCE - 2 * scoop - 1, 0)
            );
        }
    }
}

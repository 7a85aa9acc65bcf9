use anyhow::{bail, Result};

use poc_spec::{HASHES_PER_NONCE, HASH_WORDS, LANE, PLOT_SIZE};

use crate::engine::{interleaved_index, HashEngine};

/// Reference engine: runs the CPU nonce generator and scatters its output
/// into the interleaved batch layout. Slow, but available everywhere; used
/// by test mode and as the oracle the GPU path is compared against.
pub struct CpuEngine {
    global_work_size: usize,
}

impl CpuEngine {
    pub fn new(global_work_size: usize) -> Result<Self> {
        if global_work_size == 0 || global_work_size % LANE != 0 {
            bail!("global work size must be a positive multiple of {LANE}");
        }
        Ok(Self { global_work_size })
    }
}

impl HashEngine for CpuEngine {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn global_work_size(&self) -> usize {
        self.global_work_size
    }

    fn plot(
        &mut self,
        plot_id: u64,
        start_nonce: u64,
        nonces: usize,
        out: &mut [u8],
    ) -> Result<()> {
        if nonces > self.global_work_size {
            bail!(
                "batch of {nonces} nonces exceeds global work size {}",
                self.global_work_size
            );
        }
        if out.len() < self.global_work_size * PLOT_SIZE {
            bail!(
                "output buffer holds {} bytes, batch needs {}",
                out.len(),
                self.global_work_size * PLOT_SIZE
            );
        }
        let Ok(words) = bytemuck::try_cast_slice_mut::<u8, u32>(out) else {
            bail!("output buffer is not word aligned");
        };

        for n in 0..nonces {
            let material = poc_spec::generate_nonce(plot_id, start_nonce + n as u64);
            for hash in 0..HASHES_PER_NONCE {
                for word in 0..HASH_WORDS {
                    let src = hash * HASH_WORDS * 4 + word * 4;
                    words[interleaved_index(n, hash, word)] =
                        u32::from_ne_bytes(material[src..src + 4].try_into().unwrap());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_pool::Block;

    #[test]
    fn rejects_partial_lane_groups() {
        assert!(CpuEngine::new(0).is_err());
        assert!(CpuEngine::new(17).is_err());
        assert!(CpuEngine::new(32).is_ok());
    }

    #[test]
    fn deinterleaving_recovers_the_reference_material() {
        let mut engine = CpuEngine::new(LANE).unwrap();
        let mut block = Block::new(LANE * PLOT_SIZE);
        engine.plot(11, 1000, 2, block.as_mut_slice()).unwrap();

        let words = block.words();
        for n in 0..2usize {
            let reference = poc_spec::generate_nonce(11, 1000 + n as u64);
            for hash in (0..HASHES_PER_NONCE).step_by(37) {
                for word in 0..HASH_WORDS {
                    let src = hash * HASH_WORDS * 4 + word * 4;
                    let expect = u32::from_ne_bytes(reference[src..src + 4].try_into().unwrap());
                    assert_eq!(
                        words[interleaved_index(n, hash, word)],
                        expect,
                        "nonce {n} hash {hash} word {word}"
                    );
                }
            }
        }
    }

    #[test]
    fn oversized_batch_is_refused() {
        let mut engine = CpuEngine::new(LANE).unwrap();
        let mut block = Block::new(LANE * PLOT_SIZE);
        assert!(engine
            .plot(1, 0, LANE + 1, block.as_mut_slice())
            .is_err());
    }
}

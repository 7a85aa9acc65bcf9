use shabal::{Digest, Shabal256};

pub const HASH_BYTES: usize = 32;
pub const HASH_WORDS: usize = 8;
pub const HASHES_PER_NONCE: usize = 8192;
pub const PLOT_SIZE: usize = HASHES_PER_NONCE * HASH_BYTES;
pub const SCOOP_BYTES: usize = 64;
pub const SCOOPS_PER_NONCE: usize = HASHES_PER_NONCE / 2;
pub const SEED_BYTES: usize = 16;
pub const LANE: usize = 16;

/// Upper bound on how many trailing bytes feed each hash during generation.
pub const HASH_CAP: usize = 4096;

/// Generation seed: big-endian plot id followed by the big-endian nonce.
pub fn seed(plot_id: u64, nonce: u64) -> [u8; SEED_BYTES] {
    let mut out = [0u8; SEED_BYTES];
    out[..8].copy_from_slice(&plot_id.to_be_bytes());
    out[8..].copy_from_slice(&nonce.to_be_bytes());
    out
}

/// Reference CPU generator: the 256 KiB of hash material for one nonce.
///
/// Hashes are produced back to front. Each step digests the material already
/// generated after its own offset, capped at [`HASH_CAP`] bytes, so late
/// hashes depend on a sliding window rather than the whole buffer. A final
/// digest over the entire scratch (seed included) is XOR-folded across the
/// plot body.
pub fn generate_nonce(plot_id: u64, nonce: u64) -> Vec<u8> {
    let mut scratch = vec![0u8; PLOT_SIZE + SEED_BYTES];
    scratch[PLOT_SIZE..].copy_from_slice(&seed(plot_id, nonce));

    let mut offset = PLOT_SIZE;
    while offset > 0 {
        let len = (PLOT_SIZE + SEED_BYTES - offset).min(HASH_CAP);
        let digest = Shabal256::digest(&scratch[offset..offset + len]);
        offset -= HASH_BYTES;
        scratch[offset..offset + HASH_BYTES].copy_from_slice(&digest);
    }

    let fold = Shabal256::digest(&scratch);
    scratch.truncate(PLOT_SIZE);
    for (i, byte) in scratch.iter_mut().enumerate() {
        *byte ^= fold[i % HASH_BYTES];
    }
    scratch
}

/// The 64-byte scoop record of a generated nonce: hash `2s` followed by its
/// mirror hash `HASHES_PER_NONCE - 2s - 1`.
pub fn scoop_record(plot: &[u8], scoop: usize) -> [u8; SCOOP_BYTES] {
    assert_eq!(plot.len(), PLOT_SIZE);
    assert!(scoop < SCOOPS_PER_NONCE);
    let hi_a = scoop * 2;
    let hi_b = HASHES_PER_NONCE - (scoop * 2 + 1);
    let mut record = [0u8; SCOOP_BYTES];
    record[..HASH_BYTES].copy_from_slice(&plot[hi_a * HASH_BYTES..(hi_a + 1) * HASH_BYTES]);
    record[HASH_BYTES..].copy_from_slice(&plot[hi_b * HASH_BYTES..(hi_b + 1) * HASH_BYTES]);
    record
}

pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

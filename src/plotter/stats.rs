use std::time::Instant;

use poc_spec::PLOT_SIZE;

/// Cumulative progress accounting for one plotting run, fed by writer
/// reports and rendered as the per-batch progress line.
pub struct Progress {
    total_nonces: u64,
    written_nonces: u64,
    hash_ms_total: u64,
    write_ms_total: u64,
    started: Instant,
}

impl Progress {
    pub fn new(total_nonces: u64) -> Self {
        Self {
            total_nonces,
            written_nonces: 0,
            hash_ms_total: 0,
            write_ms_total: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, nonces: usize, hash_ms: u64, write_ms: u64) {
        self.written_nonces += nonces as u64;
        self.hash_ms_total += hash_ms;
        self.write_ms_total += write_ms;
    }

    pub fn written(&self) -> u64 {
        self.written_nonces
    }

    pub fn is_complete(&self) -> bool {
        self.written_nonces >= self.total_nonces
    }

    pub fn percent(&self) -> f64 {
        self.written_nonces as f64 * 100.0 / self.total_nonces.max(1) as f64
    }

    /// Projected seconds to completion from the average pace so far.
    pub fn eta_secs(&self) -> f64 {
        if self.written_nonces == 0 {
            return f64::INFINITY;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let remaining = self.total_nonces.saturating_sub(self.written_nonces);
        elapsed * remaining as f64 / self.written_nonces as f64
    }

    pub fn batch_line(&self, sn: u64, nonces: usize, hash_ms: u64, write_ms: u64) -> String {
        let mib = (nonces * PLOT_SIZE) as f64 / (1024.0 * 1024.0);
        format!(
            "{}/{} nonces ({:.1}%) | [{}, {}) hashed in {} ms, {:.0} MB/s to disk | eta {:.0}s",
            self.written_nonces,
            self.total_nonces,
            self.percent(),
            sn,
            sn + nonces as u64,
            hash_ms,
            mib * 1000.0 / write_ms.max(1) as f64,
            self.eta_secs(),
        )
    }
}

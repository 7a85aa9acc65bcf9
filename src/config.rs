use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

use poc_spec::{LANE, PLOT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    Cuda,
    Cpu,
}

/// GPU proof-of-capacity plot generator.
#[derive(Debug, Parser)]
#[command(name = "furrow", version, about)]
pub struct Config {
    /// Generate plot files.
    #[arg(long)]
    pub plot: bool,

    /// Compare the GPU engine against the reference CPU generator and exit.
    #[arg(long)]
    pub test: bool,

    /// Numeric plot identifier.
    #[arg(long)]
    pub id: u64,

    /// First nonce to generate.
    #[arg(long)]
    pub sn: u64,

    /// Total number of nonces.
    #[arg(long)]
    pub num: u64,

    /// Memory budget for batch buffers, in GiB.
    #[arg(long, default_value_t = 4.0)]
    pub mem: f64,

    /// Maximum size of one plot file, in GiB.
    #[arg(long, default_value_t = 256.0)]
    pub weight: f64,

    /// Comma-separated output directories, one per drive.
    #[arg(long, value_delimiter = ',')]
    pub drivers: Vec<String>,

    /// GPU local work size (threads per block).
    #[arg(long, default_value_t = 64)]
    pub lws: u64,

    /// GPU global work size: nonces per hasher batch.
    #[arg(long, default_value_t = 8192)]
    pub gws: u64,

    /// Hash kernel step parameter, forwarded to the kernel.
    #[arg(long, default_value_t = 8192)]
    pub step: i32,

    /// Engine that fills hasher batches.
    #[arg(long, value_enum, default_value = "cuda")]
    pub engine: EngineKind,

    /// Benchmark bits; bit 0 skips plot writes. Other bits reserved.
    #[arg(long, default_value_t = 0)]
    pub bench_mode: u32,

    /// CUDA kernel source path.
    #[arg(long, default_value = "kernel/plot.cu")]
    pub kernel: PathBuf,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.plot == self.test {
            bail!("select exactly one mode: --plot or --test");
        }
        if self.num == 0 {
            bail!("--num must be positive");
        }
        if self.sn.checked_add(self.num).is_none() {
            bail!("nonce range [{}, {} + {}) overflows", self.sn, self.sn, self.num);
        }
        if self.gws == 0 || self.gws % LANE as u64 != 0 {
            bail!("--gws must be a positive multiple of {LANE}");
        }
        if self.lws == 0 || self.gws % self.lws != 0 {
            bail!("--lws must be positive and divide --gws");
        }
        if self.plot {
            if self.driver_paths().is_empty() {
                bail!("no drive (directory) specified; pass --drivers \"dir1, dir2\"");
            }
            if self.weight_bytes() < PLOT_SIZE as u64 {
                bail!("--weight of {} GiB does not fit a single nonce", self.weight);
            }
            if self.mem_bytes() == 0 {
                bail!("--mem must be positive");
            }
        }
        Ok(())
    }

    pub fn mem_bytes(&self) -> u64 {
        gib_to_bytes(self.mem)
    }

    pub fn weight_bytes(&self) -> u64 {
        gib_to_bytes(self.weight)
    }

    pub fn driver_paths(&self) -> Vec<PathBuf> {
        self.drivers
            .iter()
            .map(|raw| raw.trim())
            .filter(|trimmed| !trimmed.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

fn gib_to_bytes(gib: f64) -> u64 {
    // Scale before truncating so fractional GiB keep MiB precision.
    (gib * 1024.0) as u64 * 1024 * 1024
}

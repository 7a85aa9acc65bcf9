mod block_pool;
mod config;
mod engine;
mod plotter;
mod stop;

use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use poc_spec::{HASH_BYTES, HASH_WORDS, PLOT_SIZE};

use block_pool::Block;
use config::{Config, EngineKind};
use engine::{interleaved_index, CpuEngine, CudaEngine, HashEngine};
use plotter::{Plotter, PlotterParams};
use stop::StopToken;

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Config::parse();
    cfg.validate()?;

    let stop = StopToken::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.stop()).context("failed to install signal handler")?;
    }

    if cfg.test {
        run_test(&cfg)
    } else {
        run_plot(&cfg, stop)
    }
}

fn build_engine(cfg: &Config) -> Result<Box<dyn HashEngine>> {
    match cfg.engine {
        EngineKind::Cuda => Ok(Box::new(CudaEngine::new(
            &cfg.kernel,
            cfg.lws as usize,
            cfg.gws as usize,
            cfg.step,
        )?)),
        EngineKind::Cpu => Ok(Box::new(CpuEngine::new(cfg.gws as usize)?)),
    }
}

fn run_plot(cfg: &Config, stop: StopToken) -> Result<()> {
    let engine = build_engine(cfg)?;
    let plotter = Plotter::new(PlotterParams {
        plot_id: cfg.id,
        start_nonce: cfg.sn,
        total_nonces: cfg.num,
        max_mem_bytes: cfg.mem_bytes(),
        max_weight_bytes: cfg.weight_bytes(),
        drivers: cfg.driver_paths(),
        bench_mode: cfg.bench_mode,
    })?;

    println!(
        "[plot] plotting {} - [{}, {}) | {} file(s) across {} drive(s) | engine={} batch={}",
        cfg.id,
        cfg.sn,
        cfg.sn + cfg.num,
        plotter.file_count(),
        cfg.driver_paths().len(),
        engine.name(),
        engine.global_work_size(),
    );
    if cfg.bench_mode & 0x01 != 0 {
        println!("[plot] bench bit 0 set: hashing only, writes are skipped");
    }

    let summary = plotter.run(engine, stop)?;

    let written_mib = summary.written_nonces * PLOT_SIZE as u64 >> 20;
    let secs = summary.elapsed.as_secs_f64().max(0.001);
    if summary.is_complete() {
        println!(
            "[plot] finished {} nonces ({} MiB) in {:.1}s | {:.0} MB/s overall | peak {} block(s)",
            summary.written_nonces,
            written_mib,
            secs,
            written_mib as f64 / secs,
            summary.peak_blocks,
        );
    } else {
        println!(
            "[plot] stopped after {} of {} nonces ({} MiB written)",
            summary.written_nonces, summary.total_nonces, written_mib,
        );
    }
    Ok(())
}

/// Single-shot comparison of the reference CPU generator against the
/// configured engine, timing both.
fn run_test(cfg: &Config) -> Result<()> {
    println!("[test] reference plot {}_{}_{}", cfg.id, cfg.sn, cfg.num);
    let started = Instant::now();
    let reference = poc_spec::generate_nonce(cfg.id, cfg.sn);
    println!(
        "[test] cpu hash: 0x{} ({} ms)",
        poc_spec::hex(&reference[..HASH_BYTES]),
        started.elapsed().as_millis(),
    );

    let mut engine = build_engine(cfg)?;
    let gws = engine.global_work_size();
    info!("test batch: {} nonces per engine call", gws);
    let mut block = Block::new(gws * PLOT_SIZE);

    let started = Instant::now();
    let mut hashed = 0u64;
    while hashed < cfg.num {
        let nonces = (cfg.num - hashed).min(gws as u64) as usize;
        engine.plot(cfg.id, cfg.sn + hashed, nonces, block.as_mut_slice())?;
        hashed += nonces as u64;
    }
    let elapsed = started.elapsed();
    println!(
        "[test] {} plotted {} nonces in {} ms ({:.0} nonces/min)",
        engine.name(),
        cfg.num,
        elapsed.as_millis(),
        cfg.num as f64 * 60.0 / elapsed.as_secs_f64().max(0.001),
    );

    // The block holds the final batch; compare against the nonce that
    // batch actually began with.
    let batch_sn = cfg.sn + ((cfg.num - 1) / gws as u64) * gws as u64;
    let expected = if batch_sn == cfg.sn {
        reference
    } else {
        poc_spec::generate_nonce(cfg.id, batch_sn)
    };

    let words = block.words();
    let mut engine_hash = [0u8; HASH_BYTES];
    for w in 0..HASH_WORDS {
        engine_hash[w * 4..(w + 1) * 4]
            .copy_from_slice(&words[interleaved_index(0, 0, w)].to_ne_bytes());
    }
    println!(
        "[test] {} hash: 0x{}",
        engine.name(),
        poc_spec::hex(&engine_hash),
    );

    if engine_hash != expected[..HASH_BYTES] {
        bail!("engine output diverges from the reference generator");
    }
    println!("[test] digests match");
    Ok(())
}

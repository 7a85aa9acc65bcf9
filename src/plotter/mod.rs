use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use log::{error, info};

use poc_spec::PLOT_SIZE;

use crate::block_pool::BlockPool;
use crate::engine::HashEngine;
use crate::stop::StopToken;

pub mod hasher;
pub mod plan;
pub mod stats;
pub mod task;
pub mod transpose;
pub mod writer;

use hasher::HasherWorker;
use plan::{plan_drives, DrivePlan};
use stats::Progress;
use task::{Report, TaskCursor};
use writer::WriterWorker;

const REPORT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PlotterParams {
    pub plot_id: u64,
    pub start_nonce: u64,
    pub total_nonces: u64,
    pub max_mem_bytes: u64,
    pub max_weight_bytes: u64,
    pub drivers: Vec<PathBuf>,
    pub bench_mode: u32,
}

#[derive(Debug)]
pub struct Summary {
    pub written_nonces: u64,
    pub total_nonces: u64,
    pub files: usize,
    pub peak_blocks: usize,
    pub elapsed: Duration,
}

impl Summary {
    pub fn is_complete(&self) -> bool {
        self.written_nonces == self.total_nonces
    }
}

/// The top-level pipeline: one writer thread per drive, one hasher thread,
/// and the dispatcher loop on the calling thread pacing both through the
/// block pool.
pub struct Plotter {
    params: PlotterParams,
    plan: Vec<DrivePlan>,
}

impl Plotter {
    pub fn new(params: PlotterParams) -> Result<Self> {
        let plan = plan_drives(
            params.plot_id,
            params.start_nonce,
            params.total_nonces,
            params.max_weight_bytes,
            &params.drivers,
        )?;
        Ok(Self { params, plan })
    }

    pub fn file_count(&self) -> usize {
        self.plan.iter().map(|drive| drive.tasks.len()).sum()
    }

    pub fn run(self, engine: Box<dyn HashEngine>, stop: StopToken) -> Result<Summary> {
        let global_work_size = engine.global_work_size();
        let block_bytes = global_work_size * PLOT_SIZE;
        let pool = Arc::new(BlockPool::new(self.params.max_mem_bytes, block_bytes)?);
        if pool.capacity() < self.plan.len() + 1 {
            bail!(
                "memory budget holds {} block(s) of {} MiB; feeding {} drive(s) needs at \
                 least {}",
                pool.capacity(),
                block_bytes >> 20,
                self.plan.len(),
                self.plan.len() + 1
            );
        }

        let total_files = self.file_count();
        let (report_tx, report_rx) = unbounded::<Report>();
        let (hasher_tx, hasher_rx) = bounded(pool.capacity());

        let mut cursors = Vec::with_capacity(self.plan.len());
        let mut writer_txs = Vec::with_capacity(self.plan.len());
        let mut handles = Vec::with_capacity(self.plan.len() + 1);
        for (writer_id, drive) in self.plan.into_iter().enumerate() {
            info!(
                "writer [{}]: {} file(s), {} nonces",
                drive.driver.display(),
                drive.tasks.len(),
                drive.tasks.iter().map(|t| t.init_nonces).sum::<u64>(),
            );
            let tasks = Arc::new(drive.tasks);
            let (task_tx, task_rx) = bounded(pool.capacity());
            cursors.push(TaskCursor::new(writer_id, Arc::clone(&tasks)));
            writer_txs.push(task_tx);

            let worker = WriterWorker::new(
                writer_id,
                drive.driver,
                tasks,
                task_rx,
                report_tx.clone(),
                Arc::clone(&pool),
                stop.clone(),
                self.params.bench_mode,
            );
            handles.push(
                thread::Builder::new()
                    .name(format!("writer-{writer_id}"))
                    .spawn(move || worker.run())
                    .context("failed to spawn writer worker thread")?,
            );
        }

        let hasher = HasherWorker::new(
            engine,
            hasher_rx,
            writer_txs,
            report_tx.clone(),
            Arc::clone(&pool),
            stop.clone(),
        );
        handles.push(
            thread::Builder::new()
                .name("hasher".to_string())
                .spawn(move || hasher.run())
                .context("failed to spawn hasher worker thread")?,
        );
        drop(report_tx);

        let started = Instant::now();
        let total = self.params.total_nonces;
        let mut progress = Progress::new(total);
        let mut failure: Option<String> = None;
        let mut cursor_pos = 0usize;
        // Dropping this sender once every cursor is dealt out lets the
        // hasher (and then the writers) drain and exit on their own.
        let mut hasher_tx = Some(hasher_tx);

        while !stop.is_stopped() && !progress.is_complete() {
            match report_rx.recv_timeout(REPORT_TIMEOUT) {
                Ok(Report::Written {
                    sn,
                    nonces,
                    hash_ms,
                    write_ms,
                    ..
                }) => {
                    progress.record(nonces, hash_ms, write_ms);
                    println!("[plot] {}", progress.batch_line(sn, nonces, hash_ms, write_ms));
                }
                Ok(Report::Failed { who, error }) => {
                    error!("{who} failed: {error}");
                    failure = Some(format!("{who}: {error}"));
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let Some(task_tx) = hasher_tx.as_ref() else {
                continue;
            };
            let Some(block) = pool.acquire() else {
                continue;
            };

            // Round-robin over the writers only; the hasher is a worker but
            // never a dispatch target.
            if cursor_pos >= cursors.len() {
                cursor_pos = 0;
            }
            let index = cursor_pos;
            cursor_pos += 1;
            match cursors[index].next_hasher_task(global_work_size, block) {
                Ok(hasher_task) => {
                    if let Err(undelivered) = task_tx.send(hasher_task) {
                        pool.release(undelivered.into_inner().block);
                        break;
                    }
                }
                Err(block) => {
                    pool.release(block);
                    if cursors.iter().all(TaskCursor::is_exhausted) {
                        hasher_tx = None;
                    }
                }
            }
        }

        info!("dispatcher stopped");
        stop.stop();
        drop(hasher_tx);
        for handle in handles {
            let _ = handle.join();
        }
        info!("all worker threads stopped");

        if let Some(error) = failure {
            bail!("plotting aborted: {error}");
        }
        Ok(Summary {
            written_nonces: progress.written(),
            total_nonces: total,
            files: total_files,
            peak_blocks: pool.high_water(),
            elapsed: started.elapsed(),
        })
    }
}

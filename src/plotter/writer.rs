use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use fs2::FileExt;
use log::{debug, error, info};

use poc_spec::{SCOOPS_PER_NONCE, SCOOP_BYTES};

use crate::block_pool::BlockPool;
use crate::plotter::task::{HasherTask, Report, WriterTask};
use crate::plotter::transpose::{transpose_scoop, SCOOP_WORDS};
use crate::stop::StopToken;

/// Nonces transposed per write call.
pub const SCOOPS_PER_WRITE: usize = 256;

const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// A plot file being produced: preallocated on open, written positionally.
pub struct PlotFile {
    file: File,
    path: PathBuf,
}

impl PlotFile {
    /// Open or create the file and reserve its full extent. Reopening an
    /// existing partial file leaves its contents in place.
    pub fn open(path: &Path, bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open plot file {}", path.display()))?;
        file.allocate(bytes)
            .with_context(|| format!("failed to preallocate {bytes} bytes for {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek to {offset} failed on {}", self.path.display()))?;
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .with_context(|| format!("write of {} bytes failed on {}", buf.len(), self.path.display()))
    }
}

/// Per-drive consumer: takes completed hasher tasks in any order and lays
/// each batch down scoop band by scoop band.
pub struct WriterWorker {
    writer_id: usize,
    driver: PathBuf,
    tasks: Arc<Vec<WriterTask>>,
    inbound: Receiver<HasherTask>,
    reports: Sender<Report>,
    pool: Arc<BlockPool>,
    stop: StopToken,
    bench_mode: u32,
    file: Option<PlotFile>,
    write_buffer: Vec<u32>,
}

impl WriterWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer_id: usize,
        driver: PathBuf,
        tasks: Arc<Vec<WriterTask>>,
        inbound: Receiver<HasherTask>,
        reports: Sender<Report>,
        pool: Arc<BlockPool>,
        stop: StopToken,
        bench_mode: u32,
    ) -> Self {
        Self {
            writer_id,
            driver,
            tasks,
            inbound,
            reports,
            pool,
            stop,
            bench_mode,
            file: None,
            write_buffer: vec![0u32; SCOOPS_PER_WRITE * SCOOP_WORDS],
        }
    }

    pub fn run(mut self) {
        info!("writer worker [{}] starting", self.driver.display());
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let task = match self.inbound.recv_timeout(POP_TIMEOUT) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.handle(task) {
                break;
            }
        }
        self.file = None;
        info!("writer worker [{}] stopped", self.driver.display());
    }

    /// Returns false when the worker should exit.
    fn handle(&mut self, hasher_task: HasherTask) -> bool {
        let Some(writer_task) = self.tasks.get(hasher_task.writer_task_index).cloned() else {
            self.fail(format!(
                "routed a batch for unknown task index {}",
                hasher_task.writer_task_index
            ));
            self.pool.release(hasher_task.block);
            return false;
        };

        let mut write_ms = 0;
        if self.bench_mode & 0x01 == 0 {
            let started = Instant::now();
            if let Err(err) = self.write_batch(&writer_task, &hasher_task) {
                self.fail(format!("{err:#}"));
                self.pool.release(hasher_task.block);
                return false;
            }
            write_ms = started.elapsed().as_millis() as u64;
        }

        debug!(
            "wrote nonces [{}, {}) to `{}` in {} ms",
            hasher_task.sn,
            hasher_task.sn + hasher_task.nonces as u64,
            writer_task.plot_file().display(),
            write_ms,
        );

        let HasherTask {
            sn,
            nonces,
            writer_id,
            block,
            hash_ms,
            ..
        } = hasher_task;
        self.pool.release(block);
        self.reports
            .send(Report::Written {
                writer_id,
                sn,
                nonces,
                hash_ms,
                write_ms,
            })
            .is_ok()
    }

    fn write_batch(&mut self, writer_task: &WriterTask, hasher_task: &HasherTask) -> Result<()> {
        self.ensure_file(writer_task)?;
        let Some(file) = self.file.as_mut() else {
            bail!("no plot file open for {}", writer_task.plot_file().display());
        };

        let src = hasher_task.block.words();
        let buffer = &mut self.write_buffer;
        for scoop in 0..SCOOPS_PER_NONCE {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let offset = ((hasher_task.sn - writer_task.init_sn)
                + scoop as u64 * writer_task.init_nonces)
                * SCOOP_BYTES as u64;
            file.seek(offset)?;

            let mut nstart = 0;
            while nstart < hasher_task.nonces {
                if self.stop.is_stopped() {
                    return Ok(());
                }
                let n = (hasher_task.nonces - nstart).min(SCOOPS_PER_WRITE);
                transpose_scoop(src, buffer, scoop, nstart, n);
                file.write(bytemuck::cast_slice(&buffer[..n * SCOOP_WORDS]))?;
                nstart += n;
            }
        }
        Ok(())
    }

    /// Close the previous file on a task boundary and open-or-create the
    /// target, preallocating its full extent.
    fn ensure_file(&mut self, writer_task: &WriterTask) -> Result<()> {
        let path = writer_task.plot_file();
        let current = matches!(&self.file, Some(f) if f.path() == path);
        if !current {
            self.file = None;
            info!(
                "writer [{}] opening plot file {}",
                self.writer_id,
                path.display()
            );
            self.file = Some(PlotFile::open(&path, writer_task.plot_bytes())?);
        }
        Ok(())
    }

    fn fail(&self, error: String) {
        error!("writer worker [{}] failed: {error}", self.driver.display());
        let _ = self.reports.send(Report::Failed {
            who: format!("writer [{}]", self.driver.display()),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_pool::Block;
    use crate::engine::interleaved_index;
    use crate::engine::HashEngine;
    use crossbeam_channel::{bounded, unbounded};
    use poc_spec::{HASHES_PER_NONCE, HASH_WORDS, PLOT_SIZE};
    use std::thread;

    fn encode(nonce: u64, hash: usize, word: usize) -> u32 {
        (nonce as u32)
            .wrapping_mul(0x9e37_79b1)
            .wrapping_add(((hash as u32) << 3) | word as u32)
    }

    fn word_at(bytes: &[u8], word: usize) -> u32 {
        u32::from_ne_bytes(bytes[word * 4..word * 4 + 4].try_into().unwrap())
    }

    /// Block filled the way a hash engine would, with synthetic material
    /// keyed by the absolute nonce.
    fn pattern_block(gws: usize, start_nonce: u64, nonces: usize) -> Block {
        let mut block = Block::new(gws * PLOT_SIZE);
        let words = bytemuck::cast_slice_mut::<u8, u32>(block.as_mut_slice());
        for n in 0..nonces {
            for hash in 0..HASHES_PER_NONCE {
                for word in 0..HASH_WORDS {
                    words[interleaved_index(n, hash, word)] =
                        encode(start_nonce + n as u64, hash, word);
                }
            }
        }
        block
    }

    struct Run {
        reports: Vec<Report>,
        dir: tempfile::TempDir,
    }

    fn run_writer(task: WriterTask, batches: Vec<HasherTask>, bench_mode: u32) -> Run {
        let dir = tempfile::tempdir().unwrap();
        let task = WriterTask {
            driver: dir.path().to_path_buf(),
            ..task
        };
        let tasks = Arc::new(vec![task]);
        let (task_tx, task_rx) = bounded(batches.len().max(1));
        let (report_tx, report_rx) = unbounded();
        let pool = Arc::new(BlockPool::new(16 * 16 * PLOT_SIZE as u64, 16 * PLOT_SIZE).unwrap());

        let worker = WriterWorker::new(
            0,
            dir.path().to_path_buf(),
            tasks,
            task_rx,
            report_tx,
            pool,
            StopToken::new(),
            bench_mode,
        );
        let handle = thread::spawn(move || worker.run());
        for batch in batches {
            task_tx.send(batch).unwrap();
        }
        drop(task_tx);
        handle.join().unwrap();
        Run {
            reports: report_rx.try_iter().collect(),
            dir,
        }
    }

    fn batch(task: &WriterTask, sn: u64, nonces: usize) -> HasherTask {
        HasherTask {
            plot_id: task.plot_id,
            sn,
            nonces,
            writer_id: 0,
            writer_task_index: 0,
            block: pattern_block(16, sn, nonces),
            hash_ms: 1,
        }
    }

    fn base_task(init_nonces: u64) -> WriterTask {
        WriterTask {
            plot_id: 42,
            init_sn: 500,
            init_nonces,
            driver: PathBuf::new(),
        }
    }

    #[test]
    fn layout_is_scoop_major_nonce_minor() {
        let task = base_task(16);
        let run = run_writer(task.clone(), vec![batch(&task, 500, 16)], 0);
        assert_eq!(run.reports.len(), 1);

        let path = run.dir.path().join("42_500_16");
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 16 * PLOT_SIZE);

        for scoop in [0usize, 1, 1337, SCOOPS_PER_NONCE - 1] {
            for nonce in [0u64, 5, 15] {
                let offset = (nonce as usize + scoop * 16) * SCOOP_BYTES;
                let record = &contents[offset..offset + SCOOP_BYTES];
                for w in 0..HASH_WORDS {
                    assert_eq!(word_at(record, w), encode(500 + nonce, scoop * 2, w));
                    assert_eq!(
                        word_at(record, HASH_WORDS + w),
                        encode(500 + nonce, HASHES_PER_NONCE - scoop * 2 - 1, w)
                    );
                }
            }
        }
    }

    #[test]
    fn plot_file_round_trips_against_the_reference_hasher() {
        let task = base_task(4);
        let mut engine = crate::engine::CpuEngine::new(16).unwrap();
        let mut block = Block::new(16 * PLOT_SIZE);
        engine.plot(42, 500, 4, block.as_mut_slice()).unwrap();
        let hasher_task = HasherTask {
            plot_id: 42,
            sn: 500,
            nonces: 4,
            writer_id: 0,
            writer_task_index: 0,
            block,
            hash_ms: 0,
        };

        let run = run_writer(task, vec![hasher_task], 0);
        let contents = std::fs::read(run.dir.path().join("42_500_4")).unwrap();
        assert_eq!(contents.len(), 4 * PLOT_SIZE);

        for nonce in 0..4usize {
            let reference = poc_spec::generate_nonce(42, 500 + nonce as u64);
            for scoop in [0usize, 1, 2048, SCOOPS_PER_NONCE - 1] {
                let offset = (nonce + scoop * 4) * SCOOP_BYTES;
                let record = poc_spec::scoop_record(&reference, scoop);
                assert_eq!(
                    &contents[offset..offset + SCOOP_BYTES],
                    &record[..],
                    "nonce {nonce} scoop {scoop}"
                );
            }
        }
    }

    #[test]
    fn out_of_order_batches_produce_identical_files() {
        let task = base_task(48);
        let sns = [500u64, 516, 532];

        let in_order = run_writer(
            task.clone(),
            sns.iter().map(|&sn| batch(&task, sn, 16)).collect(),
            0,
        );
        let reversed = run_writer(
            task.clone(),
            sns.iter().rev().map(|&sn| batch(&task, sn, 16)).collect(),
            0,
        );

        let a = std::fs::read(in_order.dir.path().join("42_500_48")).unwrap();
        let b = std::fs::read(reversed.dir.path().join("42_500_48")).unwrap();
        assert_eq!(a.len(), 48 * PLOT_SIZE);
        assert_eq!(a, b);
    }

    #[test]
    fn bench_bit_zero_skips_the_write_path() {
        let task = base_task(16);
        let run = run_writer(task.clone(), vec![batch(&task, 500, 16)], 0x01);
        assert_eq!(run.reports.len(), 1);
        assert!(matches!(
            run.reports[0],
            Report::Written { nonces: 16, write_ms: 0, .. }
        ));
        assert!(!run.dir.path().join("42_500_16").exists());
    }

    #[test]
    fn tail_batch_smaller_than_a_write_stride_is_laid_out_correctly() {
        let task = base_task(4);
        let run = run_writer(task.clone(), vec![batch(&task, 500, 4)], 0);
        assert_eq!(run.reports.len(), 1);
        let contents = std::fs::read(run.dir.path().join("42_500_4")).unwrap();
        assert_eq!(contents.len(), 4 * PLOT_SIZE);

        let scoop = 9;
        let offset = (2 + scoop * 4) * SCOOP_BYTES;
        let record = &contents[offset..offset + SCOOP_BYTES];
        assert_eq!(word_at(record, 0), encode(502, scoop * 2, 0));
    }
}

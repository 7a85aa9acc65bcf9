use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{error, info};

use crate::block_pool::BlockPool;
use crate::engine::HashEngine;
use crate::plotter::task::{HasherTask, Report};
use crate::stop::StopToken;

const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Owns the hash engine: fills pending batches one at a time and routes
/// each completed batch back to the writer that minted it. The engine
/// saturates the device internally, so there is no cross-task overlap.
pub struct HasherWorker {
    engine: Box<dyn HashEngine>,
    inbound: Receiver<HasherTask>,
    writers: Vec<Sender<HasherTask>>,
    reports: Sender<Report>,
    pool: Arc<BlockPool>,
    stop: StopToken,
}

impl HasherWorker {
    pub fn new(
        engine: Box<dyn HashEngine>,
        inbound: Receiver<HasherTask>,
        writers: Vec<Sender<HasherTask>>,
        reports: Sender<Report>,
        pool: Arc<BlockPool>,
        stop: StopToken,
    ) -> Self {
        Self {
            engine,
            inbound,
            writers,
            reports,
            pool,
            stop,
        }
    }

    pub fn run(mut self) {
        info!("hasher worker ({}) starting", self.engine.name());
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let mut task = match self.inbound.recv_timeout(POP_TIMEOUT) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let started = Instant::now();
            if let Err(err) = self.engine.plot(
                task.plot_id,
                task.sn,
                task.nonces,
                task.block.as_mut_slice(),
            ) {
                error!("hash engine ({}) failed: {err:#}", self.engine.name());
                let _ = self.reports.send(Report::Failed {
                    who: format!("hasher ({})", self.engine.name()),
                    error: format!("{err:#}"),
                });
                self.pool.release(task.block);
                self.stop.stop();
                break;
            }
            task.hash_ms = started.elapsed().as_millis() as u64;

            let writer_id = task.writer_id;
            match self.writers.get(writer_id) {
                Some(tx) => {
                    if let Err(undelivered) = tx.send(task) {
                        // Writer is gone; the run is winding down.
                        self.pool.release(undelivered.into_inner().block);
                        break;
                    }
                }
                None => {
                    error!("hasher worker minted a task for unknown writer {writer_id}");
                    self.pool.release(task.block);
                    self.stop.stop();
                    break;
                }
            }
        }
        info!("hasher worker stopped");
    }
}

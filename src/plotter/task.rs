use std::path::PathBuf;
use std::sync::Arc;

use poc_spec::PLOT_SIZE;

use crate::block_pool::Block;

/// One plot file to produce on one drive. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterTask {
    pub plot_id: u64,
    pub init_sn: u64,
    pub init_nonces: u64,
    pub driver: PathBuf,
}

impl WriterTask {
    /// Deterministic file name; mining tools parse this convention.
    pub fn plot_file(&self) -> PathBuf {
        self.driver.join(format!(
            "{}_{}_{}",
            self.plot_id, self.init_sn, self.init_nonces
        ))
    }

    pub fn plot_bytes(&self) -> u64 {
        self.init_nonces * PLOT_SIZE as u64
    }
}

/// A batch of nonces travelling dispatcher → hasher → writer, carrying the
/// block it will be hashed into. Routed back to its writer by id.
pub struct HasherTask {
    pub plot_id: u64,
    pub sn: u64,
    pub nonces: usize,
    pub writer_id: usize,
    pub writer_task_index: usize,
    pub block: Block,
    pub hash_ms: u64,
}

/// Progress events workers publish to the dispatcher.
pub enum Report {
    Written {
        writer_id: usize,
        sn: u64,
        nonces: usize,
        hash_ms: u64,
        write_ms: u64,
    },
    Failed {
        who: String,
        error: String,
    },
}

/// Dispatcher-owned cursor over one writer's task list: tracks the next
/// nonce to hash and mints hasher tasks from it.
pub struct TaskCursor {
    writer_id: usize,
    tasks: Arc<Vec<WriterTask>>,
    write_cursor: usize,
    nonce_cursor: u64,
}

impl TaskCursor {
    pub fn new(writer_id: usize, tasks: Arc<Vec<WriterTask>>) -> Self {
        Self {
            writer_id,
            tasks,
            write_cursor: 0,
            nonce_cursor: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.write_cursor >= self.tasks.len()
    }

    /// Consume up to `max_nonces` from the current task. Hands the block
    /// back when every task on this writer has been fully dealt out.
    pub fn next_hasher_task(
        &mut self,
        max_nonces: usize,
        block: Block,
    ) -> Result<HasherTask, Block> {
        let Some(task) = self.tasks.get(self.write_cursor) else {
            return Err(block);
        };

        let remaining = task.init_nonces - self.nonce_cursor;
        let nonces = remaining.min(max_nonces as u64) as usize;
        let hasher_task = HasherTask {
            plot_id: task.plot_id,
            sn: task.init_sn + self.nonce_cursor,
            nonces,
            writer_id: self.writer_id,
            writer_task_index: self.write_cursor,
            block,
            hash_ms: 0,
        };

        self.nonce_cursor += nonces as u64;
        if self.nonce_cursor == task.init_nonces {
            self.write_cursor += 1;
            self.nonce_cursor = 0;
        }
        Ok(hasher_task)
    }
}

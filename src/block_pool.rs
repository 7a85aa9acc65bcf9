use std::sync::Mutex;

use anyhow::{bail, Result};

/// Page-aligned byte buffer sized for one hasher batch.
///
/// Backed by an anonymous mmap so the GPU driver sees page-aligned, pinned
/// friendly memory; falls back to a heap allocation when mmap is unavailable.
/// Either backing guarantees word alignment for the `u32` views the engines
/// and the transposer take.
pub struct Block {
    storage: Storage,
    len: usize,
}

enum Storage {
    #[cfg(unix)]
    Mmap(*mut u8),
    Heap(Vec<u64>),
}

// Blocks move through the pipeline one owner at a time; the raw pointer is
// never aliased across threads.
unsafe impl Send for Block {}

impl Block {
    pub fn new(len: usize) -> Self {
        assert!(len > 0 && len % 8 == 0);
        #[cfg(unix)]
        {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if ptr != libc::MAP_FAILED {
                return Self {
                    storage: Storage::Mmap(ptr as *mut u8),
                    len,
                };
            }
        }
        Self {
            storage: Storage::Heap(vec![0u64; len / 8]),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            #[cfg(unix)]
            Storage::Mmap(ptr) => unsafe { std::slice::from_raw_parts(*ptr, self.len) },
            Storage::Heap(words) => bytemuck::cast_slice(words),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            #[cfg(unix)]
            Storage::Mmap(ptr) => unsafe { std::slice::from_raw_parts_mut(*ptr, self.len) },
            Storage::Heap(words) => bytemuck::cast_slice_mut(words),
        }
    }

    pub fn words(&self) -> &[u32] {
        match &self.storage {
            #[cfg(unix)]
            Storage::Mmap(ptr) => unsafe {
                std::slice::from_raw_parts(*ptr as *const u32, self.len / 4)
            },
            Storage::Heap(words) => bytemuck::cast_slice(words),
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Storage::Mmap(ptr) = self.storage {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

struct PoolState {
    free: Vec<Block>,
    in_flight: usize,
    high_water: usize,
}

/// Bounded allocator for hasher batch buffers.
///
/// The byte budget caps how many blocks may be out at once; `acquire` never
/// blocks, so the dispatcher can treat exhaustion as backpressure and stay
/// responsive to the stop token.
pub struct BlockPool {
    block_bytes: usize,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl BlockPool {
    pub fn new(budget_bytes: u64, block_bytes: usize) -> Result<Self> {
        let capacity = (budget_bytes / block_bytes as u64) as usize;
        if capacity == 0 {
            bail!(
                "memory budget of {budget_bytes} bytes does not fit a single \
                 {block_bytes}-byte block"
            );
        }
        Ok(Self {
            block_bytes,
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                in_flight: 0,
                high_water: 0,
            }),
        })
    }

    /// Maximum number of concurrently live blocks the budget allows.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn acquire(&self) -> Option<Block> {
        let mut state = self.state.lock().expect("block pool lock poisoned");
        if state.in_flight >= self.capacity {
            return None;
        }
        state.in_flight += 1;
        state.high_water = state.high_water.max(state.in_flight);
        if let Some(block) = state.free.pop() {
            return Some(block);
        }
        drop(state);
        Some(Block::new(self.block_bytes))
    }

    pub fn release(&self, block: Block) {
        debug_assert_eq!(block.len(), self.block_bytes);
        let mut state = self.state.lock().expect("block pool lock poisoned");
        state.free.push(block);
        state.in_flight -= 1;
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().expect("block pool lock poisoned").in_flight
    }

    /// Most blocks ever simultaneously in flight.
    pub fn high_water(&self) -> usize {
        self.state.lock().expect("block pool lock poisoned").high_water
    }
}

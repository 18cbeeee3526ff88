/// A free list of byte buffers, owned by one store, so the hot read and write
/// paths reuse allocations instead of growing fresh vectors per value.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    block_size: usize,
    max_free: usize,
}

const DEFAULT_MAX_FREE: usize = 16;

impl BufferPool {
    pub fn new(block_size: usize) -> Self {
        BufferPool {
            free: Vec::new(),
            block_size: block_size.max(1),
            max_free: DEFAULT_MAX_FREE,
        }
    }

    /// Hands out an empty buffer that can hold at least `min_capacity` bytes
    /// without reallocating.
    pub fn checkout(&mut self, min_capacity: usize) -> Vec<u8> {
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= min_capacity)
            .min_by_key(|(_, buf)| buf.capacity())
            .map(|(idx, _)| idx);
        match best {
            Some(idx) => self.free.swap_remove(idx),
            None => {
                let blocks = min_capacity.div_ceil(self.block_size).max(1);
                Vec::with_capacity(blocks * self.block_size)
            }
        }
    }

    pub fn give_back(&mut self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        buf.clear();
        if self.free.len() < self.max_free {
            self.free.push(buf);
        } else if let Some(smallest) = self
            .free
            .iter_mut()
            .min_by_key(|b| b.capacity())
            .filter(|b| b.capacity() < buf.capacity())
        {
            *smallest = buf;
        }
    }

    /// Number of buffers waiting to be reused.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

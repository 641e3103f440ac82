//! Chunked outbound data queue
//!
//! One queue per writable characteristic. Arbitrarily large payloads are
//! queued as tasks and drained one MTU-sized chunk at a time under the
//! adapter's ready-to-write flow control. The queue is pure bookkeeping:
//! it decides what to emit, the event loop performs the adapter write.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::adapter::transport::WriteMode;

/// One chunk ready to be written to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub characteristic: Uuid,
    pub mode: WriteMode,
    pub value: Vec<u8>,
}

/// A queued payload with a send cursor.
#[derive(Debug)]
struct SendTask {
    payload: Vec<u8>,
    offset: usize,
}

impl SendTask {
    fn is_done(&self) -> bool {
        self.offset >= self.payload.len()
    }

    fn next_chunk(&mut self, max_chunk: usize) -> Vec<u8> {
        let end = (self.offset + max_chunk).min(self.payload.len());
        let chunk = self.payload[self.offset..end].to_vec();
        self.offset = end;
        chunk
    }
}

/// Serializes payloads into size-bounded writes for one characteristic.
///
/// Drain rule: a cycle emits at most one chunk, then waits for the next
/// resume signal. A task whose bytes are exhausted is popped at the start
/// of a cycle and draining continues into the next task immediately, so
/// task order is preserved and chunks of two tasks never interleave.
#[derive(Debug)]
pub struct ChunkedSendQueue {
    characteristic: Uuid,
    mode: WriteMode,
    max_chunk: usize,
    tasks: VecDeque<SendTask>,
    awaiting_resume: bool,
}

impl ChunkedSendQueue {
    pub fn new(characteristic: Uuid, mode: WriteMode, max_chunk: usize) -> Self {
        Self {
            characteristic,
            mode,
            // A zero write limit would stall the queue forever.
            max_chunk: max_chunk.max(1),
            tasks: VecDeque::new(),
            awaiting_resume: false,
        }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queue a payload. Emits the first chunk right away unless a previous
    /// chunk is still awaiting its resume signal.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> Option<Chunk> {
        self.tasks.push_back(SendTask { payload, offset: 0 });
        if self.awaiting_resume {
            None
        } else {
            self.drain_one()
        }
    }

    /// The adapter signaled it can take more data: emit the next chunk.
    pub fn resume(&mut self) -> Option<Chunk> {
        self.awaiting_resume = false;
        self.drain_one()
    }

    /// Discard every queued task. Partially sent tasks are not resumed.
    pub fn cancel_all(&mut self) {
        self.tasks.clear();
        self.awaiting_resume = false;
    }

    fn drain_one(&mut self) -> Option<Chunk> {
        loop {
            let head = self.tasks.front_mut()?;
            if head.is_done() {
                self.tasks.pop_front();
                continue;
            }
            let value = head.next_chunk(self.max_chunk);
            self.awaiting_resume = true;
            return Some(Chunk {
                characteristic: self.characteristic,
                mode: self.mode,
                value,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_chunk: usize) -> ChunkedSendQueue {
        ChunkedSendQueue::new(Uuid::new_v4(), WriteMode::WithoutResponse, max_chunk)
    }

    #[test]
    fn test_large_payload_split_into_ceil_chunks() {
        let mut q = queue(4);
        let payload: Vec<u8> = (0..10).collect();

        let mut chunks = vec![q.enqueue(payload.clone()).unwrap()];
        while let Some(chunk) = q.resume() {
            chunks.push(chunk);
        }

        // ceil(10 / 4) = 3 chunks, byte order preserved, no gaps or overlaps.
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.value.len() <= 4));
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.value.clone()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_one_chunk_per_resume() {
        let mut q = queue(1);
        assert!(q.enqueue(vec![1, 2, 3]).is_some());
        // A second enqueue while awaiting resume emits nothing.
        assert!(q.enqueue(vec![4]).is_none());
        assert_eq!(q.resume().unwrap().value, vec![2]);
        assert_eq!(q.resume().unwrap().value, vec![3]);
        assert_eq!(q.resume().unwrap().value, vec![4]);
        assert!(q.resume().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_empty_only_after_final_resume() {
        let mut q = queue(2);
        q.enqueue(vec![1, 2, 3, 4]).unwrap();
        q.resume().unwrap();
        // Both chunks are out, but the exhausted task is popped only by
        // the next cycle.
        assert!(!q.is_empty());
        assert!(q.resume().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_tasks_do_not_interleave() {
        let mut q = queue(2);
        q.enqueue(vec![1, 2, 3]).unwrap();
        q.enqueue(vec![9, 9]);

        let mut values = vec![];
        while let Some(chunk) = q.resume() {
            values.push(chunk.value);
        }
        assert_eq!(values, vec![vec![3], vec![9, 9]]);
    }

    #[test]
    fn test_completed_task_pop_continues_into_next() {
        let mut q = queue(8);
        q.enqueue(vec![1]).unwrap();
        q.enqueue(vec![2]);
        // The resume pops the exhausted head and emits the next task's
        // chunk within the same cycle.
        assert_eq!(q.resume().unwrap().value, vec![2]);
    }

    #[test]
    fn test_cancel_all_discards_everything() {
        let mut q = queue(2);
        q.enqueue(vec![1, 2, 3, 4]).unwrap();
        q.enqueue(vec![5, 6]);
        q.cancel_all();
        assert!(q.is_empty());
        assert!(q.resume().is_none());
        // Cancelling an empty queue is a no-op.
        q.cancel_all();
    }

    #[test]
    fn test_empty_payload_emits_nothing() {
        let mut q = queue(4);
        assert!(q.enqueue(Vec::new()).is_none());
        assert!(q.is_empty());
    }
}

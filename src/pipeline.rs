//! Parallel block compression for the write path.
//!
//! # Design
//! A pipeline owns a ring of `workers × blocks_per_worker` slots.  The writer
//! moves each full uncompressed block into the next free slot; when the ring
//! fills (or on an explicit flush) a batch is dispatched: every worker
//! compresses a disjoint share of the slots — worker *i* of *N* takes slots
//! `i, i + N, i + 2N, …` — so the assignment depends only on slot index,
//! never on scheduling.  Worker 0 is the dispatching thread itself; only
//! workers 1..N run on spawned threads, created once when the pipeline is
//! attached and reused across batches.
//!
//! The dispatcher blocks on a completion counter until every worker has
//! finished, then writes the encoded slots to the sink strictly in slot
//! order.  That barrier is what keeps the output byte-identical to a
//! single-threaded writer no matter how compression is scheduled.
//!
//! # Shutdown
//! Cooperative: workers check a shutdown flag only between batches.  Dropping
//! the pipeline sets the flag, wakes everyone, and joins the threads; because
//! dispatch is synchronous, a drop can never race a batch in flight.

use std::io::Write;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use flate2::Compression;

use crate::block::{encode_block, BgzfError};

/// One ring slot: uncompressed bytes before a batch, the encoded block after.
#[derive(Default)]
struct Slot {
    data: Vec<u8>,
}

struct Batch {
    slots: Vec<Slot>,
    /// Slots filled for the batch being built or in flight.
    pending: usize,
    /// Batch generation; every increment runs each worker exactly once.
    seq: u64,
    /// Workers (including worker 0) finished with the current batch.
    completed: usize,
    /// OR of every worker's error bits for the current batch.
    err: u32,
    /// First failure message observed, carried into the returned error.
    failure: Option<String>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<Batch>,
    work: Condvar,
    done: Condvar,
}

/// Compress one worker's share of the batch: take the slots assigned to
/// `index` out under the lock, encode them with the lock released, put the
/// encoded blocks back, and bump the completion counter.
fn compress_share(shared: &Shared, index: usize, n_workers: usize, level: Compression) {
    let share: Vec<(usize, Vec<u8>)> = {
        let mut state = shared.state.lock().unwrap();
        let pending = state.pending;
        (index..pending)
            .step_by(n_workers)
            .map(|slot| (slot, mem::take(&mut state.slots[slot].data)))
            .collect()
    };

    let mut encoded = Vec::with_capacity(share.len());
    let mut err = 0u32;
    let mut failure = None;
    for (slot, raw) in share {
        match encode_block(&raw, level) {
            Ok(block) => encoded.push((slot, block)),
            Err(e) => {
                err |= e.errcode_bit();
                if failure.is_none() {
                    failure = Some(e.to_string());
                }
                encoded.push((slot, Vec::new()));
            }
        }
    }

    let mut state = shared.state.lock().unwrap();
    for (slot, block) in encoded {
        state.slots[slot].data = block;
    }
    state.err |= err;
    if state.failure.is_none() {
        state.failure = failure;
    }
    state.completed += 1;
    if state.completed == n_workers {
        shared.done.notify_one();
    }
}

fn worker_loop(shared: &Shared, index: usize, n_workers: usize, level: Compression) {
    let mut last_seq = 0u64;
    loop {
        {
            let mut state = shared.state.lock().unwrap();
            while state.seq == last_seq && !state.shutdown {
                state = shared.work.wait(state).unwrap();
            }
            if state.shutdown {
                return;
            }
            last_seq = state.seq;
        }
        compress_share(shared, index, n_workers, level);
    }
}

/// A persistent compression worker pool attached to one writer.
pub struct Pipeline {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    n_workers: usize,
    n_slots: usize,
    level: Compression,
}

impl Pipeline {
    /// Spawn `n_workers - 1` threads (worker 0 is the caller) over a ring of
    /// `n_workers * blocks_per_worker` slots.
    pub fn new(n_workers: usize, blocks_per_worker: usize, level: Compression) -> Self {
        let n_slots = n_workers * blocks_per_worker;
        let shared = Arc::new(Shared {
            state: Mutex::new(Batch {
                slots: (0..n_slots).map(|_| Slot::default()).collect(),
                pending: 0,
                seq: 0,
                completed: 0,
                err: 0,
                failure: None,
                shutdown: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });
        let handles = (1..n_workers)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(&shared, index, n_workers, level))
            })
            .collect();
        Self {
            shared,
            handles,
            n_workers,
            n_slots,
            level,
        }
    }

    /// Move the caller's pending uncompressed block into the next free slot.
    /// The buffer is left empty (its allocation swaps with the slot's, so
    /// capacity is recycled across batches).
    pub fn queue(&mut self, buffer: &mut Vec<u8>) -> Result<(), BgzfError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.pending == self.n_slots {
            return Err(BgzfError::Misuse("pipeline ring is full; dispatch first"));
        }
        let slot = state.pending;
        mem::swap(&mut state.slots[slot].data, buffer);
        state.pending += 1;
        buffer.clear();
        Ok(())
    }

    /// Is the slot ring full, so the next queue requires a dispatch?
    pub fn is_full(&self) -> bool {
        self.shared.state.lock().unwrap().pending == self.n_slots
    }

    /// Dispatch the batch: wake every worker, compress worker 0's share on
    /// the calling thread, block until the completion counter reaches the
    /// worker count, then write the encoded slots in ring order.
    ///
    /// Returns the number of compressed bytes written.  On a worker failure
    /// the merged error bits surface as the returned error and nothing is
    /// written for the batch.
    pub fn dispatch<W: Write>(&mut self, sink: &mut W) -> Result<u64, BgzfError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.pending == 0 {
                return Ok(0);
            }
            state.completed = 0;
            state.err = 0;
            state.failure = None;
            state.seq += 1;
            self.shared.work.notify_all();
        }

        compress_share(&self.shared, 0, self.n_workers, self.level);

        let mut state = self.shared.state.lock().unwrap();
        while state.completed < self.n_workers {
            state = self.shared.done.wait(state).unwrap();
        }

        if state.err != 0 {
            let msg = state
                .failure
                .take()
                .unwrap_or_else(|| "worker compression failed".into());
            for slot in &mut state.slots {
                slot.data.clear();
            }
            state.pending = 0;
            return Err(BgzfError::Backend(msg));
        }

        let count = state.pending;
        let mut written = 0u64;
        for slot in state.slots[..count].iter_mut() {
            sink.write_all(&slot.data)?;
            written += slot.data.len() as u64;
            slot.data.clear();
        }
        state.pending = 0;
        Ok(written)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::decode_block;

    #[test]
    fn batch_preserves_slot_order() {
        let mut pipeline = Pipeline::new(3, 2, Compression::default());
        let payloads: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 100 + i as usize]).collect();
        for payload in &payloads {
            let mut buf = payload.clone();
            pipeline.queue(&mut buf).unwrap();
        }
        assert!(pipeline.is_full());

        let mut out = Vec::new();
        pipeline.dispatch(&mut out).unwrap();

        let mut pos = 0;
        for payload in &payloads {
            let length = u16::from_le_bytes([out[pos + 16], out[pos + 17]]) as usize + 1;
            let raw = decode_block(&out[pos..pos + length]).unwrap();
            assert_eq!(&raw, payload);
            pos += length;
        }
        assert_eq!(pos, out.len());
    }

    #[test]
    fn dispatch_of_empty_ring_writes_nothing() {
        let mut pipeline = Pipeline::new(2, 2, Compression::default());
        let mut out = Vec::new();
        assert_eq!(pipeline.dispatch(&mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn queue_past_capacity_is_misuse() {
        let mut pipeline = Pipeline::new(2, 1, Compression::default());
        let mut buf = vec![1u8; 4];
        pipeline.queue(&mut buf).unwrap();
        let mut buf = vec![2u8; 4];
        pipeline.queue(&mut buf).unwrap();
        let mut buf = vec![3u8; 4];
        assert!(pipeline.queue(&mut buf).is_err());
    }

    #[test]
    fn partial_batch_dispatches() {
        let mut pipeline = Pipeline::new(4, 4, Compression::default());
        let mut buf = b"only one block queued".to_vec();
        pipeline.queue(&mut buf).unwrap();
        let mut out = Vec::new();
        let written = pipeline.dispatch(&mut out).unwrap();
        assert_eq!(written as usize, out.len());
        assert_eq!(decode_block(&out).unwrap(), b"only one block queued");
    }
}

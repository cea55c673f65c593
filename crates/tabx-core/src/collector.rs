//! BlockCollector — per-file reassembly of out-of-order subbands into
//! gap-filled, emission-ordered blocks.
//!
//! Subbands for one output file arrive in arbitrary order, from multiple
//! network links, with arbitrary gaps. The collector owns the only authority
//! on what is in flight: a map of assembling [`Block`]s keyed by time-slice
//! index. Two dedicated worker threads run per collector:
//!
//! - the **input loop** drains a bounded, non-dropping subband queue and
//!   routes each chunk into its block, creating blocks on demand, evicting
//!   the oldest when the in-flight window is full, and emitting every block
//!   at or below a freshly completed index;
//! - the **output loop** drains emitted blocks, blocking-acquires a buffer
//!   from the bounded [`BlockPool`] (the pipeline's backpressure point),
//!   transposes with [`Block::write`], and hands the buffer to the filled
//!   queue. Closing the filled queue is the end-of-stream signal downstream.
//!
//! Two operating modes:
//!
//! - **strict** (`max_blocks_in_flight == 0`): unbounded window, emission is
//!   exactly sequential (`0, 1, 2, ...`) with whole-block gaps materialized
//!   as zero-filled blocks; any arrival that would break the sequence is a
//!   protocol violation and aborts.
//! - **drop** (`max_blocks_in_flight > 0`): the window is bounded, overflow
//!   force-emits the oldest block, and stragglers for already-emitted blocks
//!   are counted and discarded. Emission is strictly increasing but may skip
//!   indices that never produced data.
//!
//! The collector's map and emission cursor are touched only by the input
//! loop; `finish` synchronizes by closing the input queue and joining that
//! loop before anything else, so no lock guards the map.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::block::Block;
use crate::pool::{BlockPool, PoolBuffer};
use crate::queue::{BoundedQueue, OverflowPolicy};
use crate::rt::{spawn_worker, WorkerConfig, WorkerPriority};
use crate::stats::TransposeStats;
use crate::subband::Subband;
use crate::types::{Element, SubbandShape};

/// Static parameters of one collector (one output file).
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// File index this collector assembles.
    pub file: u32,
    /// Total expected blocks, or 0 when the stream length is unknown.
    pub nr_blocks: u64,
    /// Subbands per block.
    pub nr_subbands: usize,
    /// Samples per subband.
    pub nr_samples: usize,
    /// Channels per sample.
    pub nr_channels: usize,
    /// Bound on simultaneously assembling blocks; 0 selects strict mode.
    pub max_blocks_in_flight: usize,
    /// Buffers in the output pool.
    pub nr_pool_buffers: usize,
}

impl CollectorConfig {
    pub fn shape(&self) -> SubbandShape {
        SubbandShape::new(self.nr_samples, self.nr_channels)
    }

    /// Whether overflow/late data is discarded instead of awaited.
    pub fn can_drop(&self) -> bool {
        self.max_blocks_in_flight > 0
    }

    fn input_queue_capacity(&self) -> usize {
        (1 + self.max_blocks_in_flight) * self.nr_subbands
    }
}

struct Workers {
    input_loop: JoinHandle<()>,
    output_loop: JoinHandle<()>,
}

/// Per-file collector: owns the in-flight window and its two worker loops.
pub struct BlockCollector<E: Element> {
    cfg: CollectorConfig,
    input: Arc<BoundedQueue<Subband<E>>>,
    filled: Arc<BoundedQueue<PoolBuffer<E>>>,
    stats: Arc<TransposeStats>,
    workers: Mutex<Option<Workers>>,
}

impl<E: Element> BlockCollector<E> {
    /// Spawn a collector and its worker loops.
    pub fn new(cfg: CollectorConfig) -> io::Result<Self> {
        Self::with_priority(cfg, WorkerPriority::Normal)
    }

    /// Spawn with an explicit scheduling class for the worker loops.
    pub fn with_priority(cfg: CollectorConfig, priority: WorkerPriority) -> io::Result<Self> {
        let stats = Arc::new(TransposeStats::new());
        let input = Arc::new(BoundedQueue::new(
            cfg.input_queue_capacity(),
            OverflowPolicy::Block,
        ));
        let emitted: Arc<BoundedQueue<Block<E>>> = Arc::new(BoundedQueue::new(
            cfg.max_blocks_in_flight.max(1) + 1,
            OverflowPolicy::Block,
        ));
        let pool = BlockPool::new(
            cfg.nr_pool_buffers,
            cfg.nr_samples,
            cfg.nr_subbands,
            cfg.nr_channels,
        );
        let filled = Arc::new(BoundedQueue::new(
            cfg.nr_pool_buffers.max(1),
            OverflowPolicy::Block,
        ));

        let input_loop = {
            let input = Arc::clone(&input);
            let stats = Arc::clone(&stats);
            let mut window = Window::new(cfg.clone(), Arc::clone(&emitted), Arc::clone(&stats));
            spawn_worker(
                WorkerConfig::new(format!("collect-in-{}", cfg.file)).priority(priority),
                move || {
                    while let Some(subband) = input.pop() {
                        stats.record_received(1);
                        window.add_subband(subband);
                    }
                    window.flush_remaining();
                    window.assert_strict_count();
                    window.emitted.close();
                },
            )?
        };

        let output_loop = {
            let emitted = Arc::clone(&emitted);
            let filled = Arc::clone(&filled);
            let stats = Arc::clone(&stats);
            spawn_worker(
                WorkerConfig::new(format!("collect-out-{}", cfg.file)).priority(priority),
                move || {
                    while let Some(block) = emitted.pop() {
                        let mut buf = pool.acquire_blocking();
                        block.write(&mut buf, &stats);
                        if filled.push(buf).is_err() {
                            break;
                        }
                    }
                    filled.close();
                },
            )?
        };

        Ok(Self {
            cfg,
            input,
            filled,
            stats,
            workers: Mutex::new(Some(Workers {
                input_loop,
                output_loop,
            })),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.cfg
    }

    /// Hand a subband to the collector. Blocks while the input queue is full;
    /// never drops. Calling after `finish` is a contract violation.
    pub fn append(&self, subband: Subband<E>) {
        if let Err(refused) = self.input.push(subband) {
            panic!(
                "subband {} appended to finished collector for file {}",
                refused.0.id(),
                self.cfg.file
            );
        }
    }

    /// The downstream queue of written block buffers. `pop()` yields buffers
    /// in strictly increasing block order and `None` once the stream is done.
    pub fn filled(&self) -> &Arc<BoundedQueue<PoolBuffer<E>>> {
        &self.filled
    }

    pub fn stats(&self) -> &Arc<TransposeStats> {
        &self.stats
    }

    /// Declare the input stream over: close the input queue, let the input
    /// loop drain and flush every live block in ascending order, then wait
    /// for the output loop to finish writing.
    ///
    /// Idempotent; a second call returns immediately. Worker panics (contract
    /// violations) resurface here.
    pub fn finish(&self) {
        let workers = self.workers.lock().unwrap().take();
        let Some(workers) = workers else { return };
        self.input.close();
        join_propagating(workers.input_loop);
        join_propagating(workers.output_loop);
    }
}

impl<E: Element> Drop for BlockCollector<E> {
    fn drop(&mut self) {
        let workers = self.workers.lock().unwrap().take();
        if let Some(workers) = workers {
            self.input.close();
            let _ = workers.input_loop.join();
            let _ = workers.output_loop.join();
        }
    }
}

fn join_propagating(handle: JoinHandle<()>) {
    if let Err(panic) = handle.join() {
        std::panic::resume_unwind(panic);
    }
}

/// Input-loop state: the live block map and the emission cursor.
///
/// Owned exclusively by the input loop; never shared.
struct Window<E: Element> {
    cfg: CollectorConfig,
    emitted: Arc<BoundedQueue<Block<E>>>,
    stats: Arc<TransposeStats>,
    blocks: BTreeMap<u64, Block<E>>,
    last_emitted: i64,
    nr_emitted: u64,
}

impl<E: Element> Window<E> {
    fn new(cfg: CollectorConfig, emitted: Arc<BoundedQueue<Block<E>>>, stats: Arc<TransposeStats>) -> Self {
        Self {
            cfg,
            emitted,
            stats,
            blocks: BTreeMap::new(),
            last_emitted: -1,
            nr_emitted: 0,
        }
    }

    /// Route one subband into its block, creating, evicting and emitting as
    /// needed.
    fn add_subband(&mut self, subband: Subband<E>) {
        let id = subband.id();
        let idx = u64::from(id.block);
        assert!(
            self.cfg.nr_blocks == 0 || idx < self.cfg.nr_blocks,
            "subband {} beyond the {} blocks of file {}",
            id,
            self.cfg.nr_blocks,
            self.cfg.file
        );

        if !self.blocks.contains_key(&idx) {
            if self.cfg.can_drop() && (idx as i64) <= self.last_emitted {
                // Straggler for a block already handed downstream.
                tracing::trace!("discarding late subband {}", id);
                self.stats.record_late_drop();
                return;
            }
            assert!(
                self.cfg.can_drop() || (idx as i64) > self.last_emitted,
                "subband {} arrived after block {} was emitted",
                id,
                self.last_emitted
            );
            self.fetch(idx);
        }

        let block = self.blocks.get_mut(&idx).unwrap();
        block.add_subband(subband);

        if block.is_complete() {
            // Nothing older can legally receive data once a newer block is
            // complete: flush everything at or below it.
            self.emit_up_to(idx);
            if self.cfg.nr_blocks > 0 && idx == self.cfg.nr_blocks - 1 {
                self.emitted.close();
            }
        }
    }

    /// Create the block for `idx`, first force-emitting the oldest live
    /// block when the bounded window is full.
    fn fetch(&mut self, idx: u64) {
        if self.cfg.can_drop() && self.blocks.len() >= self.cfg.max_blocks_in_flight {
            let oldest = *self.blocks.keys().next().unwrap();
            tracing::debug!(
                "file {}: window full, evicting block {} for block {}",
                self.cfg.file,
                oldest,
                idx
            );
            self.stats.record_eviction();
            self.emit(oldest);
        }
        self.blocks.insert(
            idx,
            Block::new(self.cfg.file, idx, self.cfg.nr_subbands, self.cfg.shape()),
        );
    }

    /// Emit every live block with index `<= idx`, ascending. In strict mode
    /// indices that never saw a subband are materialized as zero-filled
    /// blocks so the emitted sequence has no holes.
    fn emit_up_to(&mut self, idx: u64) {
        if self.cfg.can_drop() {
            loop {
                let Some(oldest) = self.blocks.keys().next().copied() else {
                    break;
                };
                if oldest > idx {
                    break;
                }
                self.emit(oldest);
            }
        } else {
            let mut next = (self.last_emitted + 1) as u64;
            while next <= idx {
                if !self.blocks.contains_key(&next) {
                    self.fetch(next);
                }
                self.emit(next);
                next += 1;
            }
        }
    }

    /// Hand one block to the output loop and advance the cursor.
    fn emit(&mut self, idx: u64) {
        if self.cfg.can_drop() {
            assert!(
                idx as i64 > self.last_emitted,
                "file {}: block {} emitted out of order (last was {})",
                self.cfg.file,
                idx,
                self.last_emitted
            );
        } else {
            assert!(
                idx as i64 == self.last_emitted + 1,
                "file {}: block {} breaks the emission sequence (last was {})",
                self.cfg.file,
                idx,
                self.last_emitted
            );
        }
        let block = self.blocks.remove(&idx).unwrap();
        self.last_emitted = idx as i64;
        self.nr_emitted += 1;
        if self.emitted.push(block).is_err() {
            panic!(
                "file {}: block {} emitted after end of stream",
                self.cfg.file, idx
            );
        }
    }

    /// Flush every still-live block at stream end; in strict mode with a
    /// known length, also materialize the zero-filled tail.
    fn flush_remaining(&mut self) {
        let highest = self.blocks.keys().next_back().copied();
        if let Some(highest) = highest {
            self.emit_up_to(highest);
        }
        if !self.cfg.can_drop() && self.cfg.nr_blocks > 0 {
            while self.nr_emitted < self.cfg.nr_blocks {
                let next = (self.last_emitted + 1) as u64;
                self.fetch(next);
                self.emit(next);
            }
        }
    }

    fn assert_strict_count(&self) {
        if !self.cfg.can_drop() && self.cfg.nr_blocks > 0 {
            assert!(
                self.nr_emitted == self.cfg.nr_blocks,
                "file {}: emitted {} of {} blocks",
                self.cfg.file,
                self.nr_emitted,
                self.cfg.nr_blocks
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockId;
    use rand::seq::SliceRandom;

    fn config(nr_blocks: u64, max_in_flight: usize) -> CollectorConfig {
        CollectorConfig {
            file: 0,
            nr_blocks,
            nr_subbands: 4,
            nr_samples: 2,
            nr_channels: 2,
            max_blocks_in_flight: max_in_flight,
            nr_pool_buffers: 4,
        }
    }

    fn subband(cfg: &CollectorConfig, block: u32, index: u32) -> Subband<f32> {
        let shape = cfg.shape();
        let base = (block * 1000 + index * 100) as f32;
        let data = (0..shape.len()).map(|i| base + i as f32).collect();
        Subband::from_samples(BlockId::new(cfg.file, index, block), shape, data)
    }

    fn drain_indices(collector: &BlockCollector<f32>) -> Vec<(u64, usize)> {
        let mut out = Vec::new();
        while let Some(buf) = collector.filled().pop() {
            out.push((buf.block_index(), buf.subbands_lost()));
        }
        out
    }

    #[test]
    fn test_complete_in_order_delivery() {
        let cfg = config(2, 0);
        let collector = BlockCollector::new(cfg.clone()).unwrap();
        let mut rng = rand::thread_rng();

        for block in 0..2 {
            let mut order: Vec<u32> = (0..4).collect();
            order.shuffle(&mut rng);
            for index in order {
                collector.append(subband(&cfg, block, index));
            }
        }
        collector.finish();

        assert_eq!(drain_indices(&collector), vec![(0, 0), (1, 0)]);
        let snap = collector.stats().snapshot();
        assert_eq!(snap.subbands_received, 8);
        assert_eq!(snap.subbands_lost, 0);
        assert_eq!(snap.blocks_complete, 2);
    }

    #[test]
    fn test_missing_subband_forced_by_next_completion() {
        let cfg = config(2, 0);
        let collector = BlockCollector::new(cfg.clone()).unwrap();

        for index in 0..3 {
            collector.append(subband(&cfg, 0, index));
        }
        for index in 0..4 {
            collector.append(subband(&cfg, 1, index));
        }
        collector.finish();

        // Block 1 completing forces block 0 out first, one slot zero-filled
        assert_eq!(drain_indices(&collector), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let cfg = config(0, 2);
        let collector = BlockCollector::new(cfg.clone()).unwrap();

        collector.append(subband(&cfg, 0, 0));
        collector.append(subband(&cfg, 1, 0));
        // Window (capacity 2) is full: block 2 evicts the oldest, block 0
        collector.append(subband(&cfg, 2, 0));
        collector.finish();

        let emitted = drain_indices(&collector);
        assert_eq!(emitted[0], (0, 3));
        assert_eq!(
            emitted.iter().map(|&(i, _)| i).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(collector.stats().snapshot().blocks_evicted, 1);
    }

    #[test]
    fn test_late_arrival_discarded_in_drop_mode() {
        let cfg = config(0, 1);
        let collector = BlockCollector::new(cfg.clone()).unwrap();

        collector.append(subband(&cfg, 0, 0));
        // Evicts and emits block 0
        collector.append(subband(&cfg, 1, 0));
        // Straggler for block 0: discarded, not fatal, not re-emitted
        collector.append(subband(&cfg, 0, 1));
        collector.finish();

        let emitted = drain_indices(&collector);
        assert_eq!(
            emitted.iter().map(|&(i, _)| i).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(collector.stats().snapshot().subbands_late, 1);
    }

    #[test]
    fn test_stream_end_with_partial_block() {
        let cfg = config(0, 0);
        let collector = BlockCollector::new(cfg.clone()).unwrap();

        collector.append(subband(&cfg, 0, 0));
        collector.append(subband(&cfg, 0, 2));
        collector.finish();

        assert_eq!(drain_indices(&collector), vec![(0, 2)]);
    }

    #[test]
    fn test_strict_mode_materializes_gaps() {
        let cfg = config(3, 0);
        let collector = BlockCollector::new(cfg.clone()).unwrap();

        // Only block 1 ever receives data; 0 and 2 must still come out,
        // zero-filled, in sequence
        for index in 0..4 {
            collector.append(subband(&cfg, 1, index));
        }
        collector.finish();

        assert_eq!(drain_indices(&collector), vec![(0, 4), (1, 0), (2, 4)]);
    }

    #[test]
    fn test_last_block_completion_closes_stream() {
        let cfg = config(1, 0);
        let collector = BlockCollector::new(cfg.clone()).unwrap();
        for index in 0..4 {
            collector.append(subband(&cfg, 0, index));
        }
        // Without finish(): completing the final block alone ends the stream
        assert_eq!(collector.filled().pop().map(|b| b.block_index()), Some(0));
        assert_eq!(collector.filled().pop().map(|b| b.block_index()), None);
        collector.finish();
    }

    #[test]
    fn test_emission_strictly_increasing_under_random_arrival() {
        let cfg = CollectorConfig {
            nr_subbands: 3,
            // Room for every block downstream: this test drains only after
            // finish(), so the pool must hold the whole output
            nr_pool_buffers: 8,
            ..config(0, 3)
        };
        let collector = BlockCollector::new(cfg.clone()).unwrap();
        let mut rng = rand::thread_rng();

        let mut feed: Vec<(u32, u32)> = (0..8)
            .flat_map(|b| (0..3).map(move |s| (b, s)))
            .collect();
        feed.shuffle(&mut rng);
        for (block, index) in feed {
            collector.append(subband(&cfg, block, index));
        }
        collector.finish();

        let emitted: Vec<u64> = drain_indices(&collector).iter().map(|&(i, _)| i).collect();
        assert!(emitted.windows(2).all(|w| w[0] < w[1]));
        assert!(emitted.iter().all(|&i| i < 8));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let cfg = config(0, 0);
        let collector = BlockCollector::new(cfg.clone()).unwrap();
        collector.append(subband(&cfg, 0, 0));
        collector.finish();
        collector.finish();
        assert_eq!(drain_indices(&collector).len(), 1);
    }

    #[test]
    #[should_panic(expected = "appended to finished collector")]
    fn test_append_after_finish_is_fatal() {
        let cfg = config(0, 0);
        let collector = BlockCollector::new(cfg.clone()).unwrap();
        collector.finish();
        collector.append(subband(&cfg, 0, 0));
    }

    #[test]
    fn test_window_never_exceeds_bound() {
        // Feed far more blocks than the window holds; every arrival past the
        // bound must evict, so evictions track the overflow exactly
        let cfg = CollectorConfig {
            nr_pool_buffers: 12,
            ..config(0, 2)
        };
        let collector = BlockCollector::new(cfg.clone()).unwrap();
        for block in 0..10 {
            collector.append(subband(&cfg, block, 0));
        }
        collector.finish();

        assert_eq!(collector.stats().snapshot().blocks_evicted, 8);
        assert_eq!(drain_indices(&collector).len(), 10);
    }
}

//! Block — the fully-assembled set of subbands for one time slice.
//!
//! A block collects zero or more [`Subband`]s for a `(file, block_index)`
//! coordinate in a fixed-size slot array, counts down to completion, and is
//! finally written out into a caller-provided [`BlockBuffer`] shaped
//! `(nr_samples, nr_subbands, nr_channels)`. Writing is where the transpose
//! happens: each subband payload is row-major `(samples, channels)` and lands
//! strided across the buffer's subband dimension; slots that never arrived
//! are zero-filled deterministically.
//!
//! Every precondition here is a producer/consumer contract. A violation
//! (duplicate slot, shape mismatch, foreign identity) means the transport or
//! the configuration is wrong, and continuing would corrupt scientific
//! output — so violations abort rather than return errors.

use crate::stats::TransposeStats;
use crate::subband::Subband;
use crate::types::{Element, SubbandShape};

/// Pre-allocated destination buffer for one written block.
///
/// Layout is sample-major: `data[(sample * nr_subbands + subband) * nr_channels
/// + channel]`. Buffers come from a bounded pool and are recycled; `write`
/// overwrites every element, so no reset pass is needed between uses.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockBuffer<E> {
    block_index: u64,
    nr_samples: usize,
    nr_subbands: usize,
    nr_channels: usize,
    subbands_present: usize,
    subbands_lost: usize,
    data: Vec<E>,
}

impl<E: Element> BlockBuffer<E> {
    pub fn new(nr_samples: usize, nr_subbands: usize, nr_channels: usize) -> Self {
        Self {
            block_index: 0,
            nr_samples,
            nr_subbands,
            nr_channels,
            subbands_present: 0,
            subbands_lost: 0,
            data: vec![E::default(); nr_samples * nr_subbands * nr_channels],
        }
    }

    /// Time-slice index of the block most recently written into this buffer.
    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    /// Subband slots that were present at write time.
    pub fn subbands_present(&self) -> usize {
        self.subbands_present
    }

    /// Subband slots that were zero-filled at write time.
    pub fn subbands_lost(&self) -> usize {
        self.subbands_lost
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.nr_samples, self.nr_subbands, self.nr_channels)
    }

    pub fn as_slice(&self) -> &[E] {
        &self.data
    }

    /// The channel row for one `(sample, subband)` cell.
    pub fn cell(&self, sample: usize, subband: usize) -> &[E] {
        let start = (sample * self.nr_subbands + subband) * self.nr_channels;
        &self.data[start..start + self.nr_channels]
    }

    fn cell_mut(&mut self, sample: usize, subband: usize) -> &mut [E] {
        let start = (sample * self.nr_subbands + subband) * self.nr_channels;
        &mut self.data[start..start + self.nr_channels]
    }
}

/// One in-flight block: sparse subband cache plus completion countdown.
#[derive(Debug)]
pub struct Block<E: Element> {
    file: u32,
    block_index: u64,
    shape: SubbandShape,
    slots: Vec<Option<Subband<E>>>,
    nr_subbands_left: usize,
}

impl<E: Element> Block<E> {
    /// Create an empty block expecting `nr_subbands` subbands of `shape`.
    pub fn new(file: u32, block_index: u64, nr_subbands: usize, shape: SubbandShape) -> Self {
        Self {
            file,
            block_index,
            shape,
            slots: (0..nr_subbands).map(|_| None).collect(),
            nr_subbands_left: nr_subbands,
        }
    }

    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    /// Store an arrived subband in its slot, taking ownership.
    ///
    /// Preconditions (all fatal): the block is still incomplete, the
    /// subband's identity matches this block, its index is in range, the slot
    /// is empty, and the payload shape matches exactly.
    pub fn add_subband(&mut self, subband: Subband<E>) {
        let id = subband.id();
        assert!(
            self.nr_subbands_left > 0,
            "subband {} arrived for an already complete block",
            id
        );
        assert!(
            id.file == self.file && u64::from(id.block) == self.block_index,
            "subband {} routed to block (file {}, block {})",
            id,
            self.file,
            self.block_index
        );
        assert!(
            (id.subband as usize) < self.slots.len(),
            "subband {} out of range: block expects {} subbands",
            id,
            self.slots.len()
        );
        assert!(
            subband.shape() == self.shape,
            "subband {} has shape {}, block expects {}",
            id,
            subband.shape(),
            self.shape
        );

        let slot = &mut self.slots[id.subband as usize];
        assert!(slot.is_none(), "duplicate subband {}", id);
        *slot = Some(subband);
        self.nr_subbands_left -= 1;
    }

    /// True once every expected subband has arrived.
    pub fn is_complete(&self) -> bool {
        self.nr_subbands_left == 0
    }

    /// Number of slots currently filled.
    pub fn nr_present(&self) -> usize {
        self.slots.len() - self.nr_subbands_left
    }

    /// Transpose the subband cache into `out`, zero-filling absent slots.
    ///
    /// `out` must be shaped `(nr_samples, nr_subbands, nr_channels)` for this
    /// block's configuration (fatal otherwise). The result is a pure function
    /// of the cache: writing twice produces identical buffers. Present/lost
    /// counts are recorded on the buffer and in `stats`.
    pub fn write(&self, out: &mut BlockBuffer<E>, stats: &TransposeStats) {
        let nr_subbands = self.slots.len();
        assert!(
            out.shape() == (self.shape.nr_samples, nr_subbands, self.shape.nr_channels),
            "output buffer shape {:?} does not match block (file {}, block {}) shape ({}, {}, {})",
            out.shape(),
            self.file,
            self.block_index,
            self.shape.nr_samples,
            nr_subbands,
            self.shape.nr_channels
        );

        for (s, slot) in self.slots.iter().enumerate() {
            match slot {
                Some(subband) if nr_subbands == 1 => {
                    // Single-subband block: the destination is contiguous,
                    // one straight copy covers every sample.
                    out.data.copy_from_slice(subband.samples());
                }
                Some(subband) => {
                    for sample in 0..self.shape.nr_samples {
                        out.cell_mut(sample, s)
                            .copy_from_slice(subband.sample_row(sample));
                    }
                }
                None => {
                    for sample in 0..self.shape.nr_samples {
                        out.cell_mut(sample, s).fill(E::default());
                    }
                }
            }
        }

        out.block_index = self.block_index;
        out.subbands_present = self.nr_present();
        out.subbands_lost = self.nr_subbands_left;
        stats.record_block_written(
            out.subbands_present as u64,
            out.subbands_lost as u64,
            self.block_index,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockId;

    fn subband(file: u32, block: u32, index: u32, shape: SubbandShape, base: f32) -> Subband<f32> {
        let data: Vec<f32> = (0..shape.len()).map(|i| base + i as f32).collect();
        Subband::from_samples(BlockId::new(file, index, block), shape, data)
    }

    #[test]
    fn test_completion_countdown() {
        let shape = SubbandShape::new(2, 2);
        let mut block = Block::new(0, 0, 3, shape);
        assert!(!block.is_complete());
        block.add_subband(subband(0, 0, 0, shape, 0.0));
        block.add_subband(subband(0, 0, 2, shape, 10.0));
        assert!(!block.is_complete());
        assert_eq!(block.nr_present(), 2);
        block.add_subband(subband(0, 0, 1, shape, 20.0));
        assert!(block.is_complete());
    }

    #[test]
    #[should_panic(expected = "duplicate subband")]
    fn test_duplicate_subband_is_fatal() {
        let shape = SubbandShape::new(2, 2);
        let mut block = Block::new(0, 0, 3, shape);
        block.add_subband(subband(0, 0, 1, shape, 0.0));
        block.add_subband(subband(0, 0, 1, shape, 5.0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_subband_is_fatal() {
        let shape = SubbandShape::new(2, 2);
        let mut block = Block::new(0, 0, 3, shape);
        block.add_subband(subband(0, 0, 3, shape, 0.0));
    }

    #[test]
    #[should_panic(expected = "routed to block")]
    fn test_foreign_block_is_fatal() {
        let shape = SubbandShape::new(2, 2);
        let mut block = Block::new(0, 7, 3, shape);
        block.add_subband(subband(0, 8, 0, shape, 0.0));
    }

    #[test]
    #[should_panic(expected = "has shape")]
    fn test_shape_mismatch_is_fatal() {
        let shape = SubbandShape::new(2, 2);
        let mut block = Block::new(0, 0, 3, shape);
        block.add_subband(subband(0, 0, 0, SubbandShape::new(2, 3), 0.0));
    }

    #[test]
    fn test_write_transposes_rows() {
        // 2 samples, 2 subbands, 2 channels with recognizable values
        let shape = SubbandShape::new(2, 2);
        let stats = TransposeStats::new();
        let mut block = Block::new(0, 4, 2, shape);
        block.add_subband(subband(0, 4, 0, shape, 100.0)); // 100..104
        block.add_subband(subband(0, 4, 1, shape, 200.0)); // 200..204

        let mut out = BlockBuffer::new(2, 2, 2);
        block.write(&mut out, &stats);

        assert_eq!(out.block_index(), 4);
        assert_eq!(out.subbands_present(), 2);
        assert_eq!(out.subbands_lost(), 0);
        // Sample 0: subband 0 channels then subband 1 channels
        assert_eq!(out.as_slice(), &[100.0, 101.0, 200.0, 201.0, 102.0, 103.0, 202.0, 203.0]);
        assert_eq!(out.cell(1, 0), &[102.0, 103.0]);
    }

    #[test]
    fn test_write_zero_fills_missing() {
        let shape = SubbandShape::new(2, 1);
        let stats = TransposeStats::new();
        let mut block = Block::new(0, 0, 3, shape);
        block.add_subband(subband(0, 0, 1, shape, 5.0)); // 5, 6

        let mut out = BlockBuffer::new(2, 3, 1);
        // Dirty buffer from a previous block must be fully overwritten
        out.data.fill(9.9);
        block.write(&mut out, &stats);

        assert_eq!(out.subbands_present(), 1);
        assert_eq!(out.subbands_lost(), 2);
        assert_eq!(out.as_slice(), &[0.0, 5.0, 0.0, 0.0, 6.0, 0.0]);
    }

    #[test]
    fn test_write_is_deterministic() {
        let shape = SubbandShape::new(3, 2);
        let stats = TransposeStats::new();
        let mut block = Block::new(1, 2, 4, shape);
        block.add_subband(subband(1, 2, 0, shape, 1.0));
        block.add_subband(subband(1, 2, 3, shape, 7.0));

        let mut a = BlockBuffer::new(3, 4, 2);
        let mut b = BlockBuffer::new(3, 4, 2);
        block.write(&mut a, &stats);
        block.write(&mut b, &stats);
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_subband_contiguous_path() {
        let shape = SubbandShape::new(4, 2);
        let stats = TransposeStats::new();
        let mut block = Block::new(0, 0, 1, shape);
        block.add_subband(subband(0, 0, 0, shape, 0.0));

        let mut out = BlockBuffer::new(4, 1, 2);
        block.write(&mut out, &stats);
        let expected: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(out.as_slice(), expected.as_slice());
    }

    #[test]
    #[should_panic(expected = "output buffer shape")]
    fn test_wrong_buffer_shape_is_fatal() {
        let shape = SubbandShape::new(2, 2);
        let stats = TransposeStats::new();
        let block = Block::<f32>::new(0, 0, 3, shape);
        let mut out = BlockBuffer::new(2, 2, 2);
        block.write(&mut out, &stats);
    }
}

//! # Station Input Buffer
//!
//! Circular sample buffer between the live station frame stream and the
//! periodic window consumer that feeds the transpose. The writer side runs
//! continuously — the telescope does not pause — depositing timestamped
//! frames of beamlet samples; the reader side periodically extracts a
//! time-aligned window per beamlet, shifted by the whole-sample part of the
//! geometric delay, together with validity flags for whatever never arrived.
//!
//! ## Design
//!
//! - Power-of-two capacity per beamlet, absolute sample index masked into a
//!   slot, old data silently overwritten as the write front advances
//! - Written ranges tracked in a [`SampleFlags`] set that slides with the
//!   write front; a read window's flags are the complement of that set
//! - A read transaction pins its sample range: a writer about to overwrite
//!   pinned samples parks until the transaction drops
//! - Frames may arrive out of order and may duplicate; only frames entirely
//!   below the retained window are refused
//!
//! Flags returned by [`ReadTransaction::get_elements`] are window-relative
//! (`0..length`), and flagged samples in the returned window are zeroed so
//! downstream arithmetic sees deterministic data.

use std::sync::{Condvar, Mutex};

use crate::flags::{SampleFlags, SampleRange};
use crate::types::Element;

struct State<E> {
    /// Beamlet-major sample storage: `data[beamlet * capacity + slot]`.
    data: Vec<E>,
    /// Absolute sample ranges currently held valid in the window.
    valid: SampleFlags,
    /// One past the highest absolute sample index written.
    write_front: u64,
    /// Range pinned by the active read transaction.
    locked: Option<SampleRange>,
}

/// Circular beamlet buffer with sliding validity and pinned reads.
pub struct StationBuffer<E: Element> {
    nr_beamlets: usize,
    capacity: usize,
    mask: u64,
    max_flag_ranges: usize,
    state: Mutex<State<E>>,
    advanced: Condvar,
    released: Condvar,
}

impl<E: Element> StationBuffer<E> {
    /// Create a buffer holding `capacity` samples (rounded up to a power of
    /// two) for each of `nr_beamlets` beamlets. `max_flag_ranges` bounds the
    /// flag metadata handed to readers.
    pub fn new(nr_beamlets: usize, capacity: usize, max_flag_ranges: usize) -> Self {
        assert!(nr_beamlets > 0, "station buffer needs at least one beamlet");
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            nr_beamlets,
            capacity,
            mask: capacity as u64 - 1,
            max_flag_ranges,
            state: Mutex::new(State {
                data: vec![E::default(); nr_beamlets * capacity],
                valid: SampleFlags::unbounded(),
                write_front: 0,
                locked: None,
            }),
            advanced: Condvar::new(),
            released: Condvar::new(),
        }
    }

    pub fn nr_beamlets(&self) -> usize {
        self.nr_beamlets
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One past the highest absolute sample index written so far.
    pub fn write_front(&self) -> u64 {
        self.state.lock().unwrap().write_front
    }

    /// Deposit one frame starting at absolute sample index `timestamp`.
    ///
    /// `frame` is beamlet-major: `nr_beamlets` runs of `frame.len() /
    /// nr_beamlets` samples each. Frames entirely below the retained window
    /// are dropped; a frame that would overwrite samples pinned by a read
    /// transaction parks until the transaction ends.
    pub fn write_frame(&self, timestamp: u64, frame: &[E]) {
        assert!(
            frame.len() % self.nr_beamlets == 0,
            "frame of {} samples does not divide into {} beamlets",
            frame.len(),
            self.nr_beamlets
        );
        let samples_per_beamlet = frame.len() / self.nr_beamlets;
        assert!(
            samples_per_beamlet <= self.capacity,
            "frame of {} samples per beamlet exceeds buffer capacity {}",
            samples_per_beamlet,
            self.capacity
        );
        let end = timestamp + samples_per_beamlet as u64;

        let mut state = self.state.lock().unwrap();
        if end <= state.write_front.saturating_sub(self.capacity as u64) {
            tracing::warn!(
                "dropping frame at {}: older than the retained window",
                timestamp
            );
            return;
        }

        // The slots for [timestamp, end) previously held samples one
        // capacity earlier; wait while any of those are pinned by a reader.
        loop {
            let overwritten_begin = timestamp.saturating_sub(self.capacity as u64);
            let overwritten_end = end.saturating_sub(self.capacity as u64);
            let conflict = state.locked.is_some_and(|lock| {
                overwritten_end > lock.begin && lock.end > overwritten_begin
            });
            if !conflict {
                break;
            }
            state = self.released.wait(state).unwrap();
        }

        for b in 0..self.nr_beamlets {
            let src = &frame[b * samples_per_beamlet..(b + 1) * samples_per_beamlet];
            let base = b * self.capacity;
            for (i, &sample) in src.iter().enumerate() {
                let slot = ((timestamp + i as u64) & self.mask) as usize;
                state.data[base + slot] = sample;
            }
        }

        state.valid.include(timestamp, end);
        if end > state.write_front {
            state.write_front = end;
        }
        let floor = state.write_front.saturating_sub(self.capacity as u64);
        state.valid.exclude_below(floor);
        self.advanced.notify_all();
    }

    /// Open a read transaction on `from..to`, parking until the writer has
    /// passed `to`. At most one transaction may be open (single periodic
    /// consumer); the transaction pins its range against overwrite.
    pub fn start_read(&self, from: u64, to: u64) -> ReadTransaction<'_, E> {
        assert!(from < to, "empty read window {}..{}", from, to);
        assert!(
            (to - from) as usize <= self.capacity,
            "read window {}..{} exceeds buffer capacity {}",
            from,
            to,
            self.capacity
        );

        let mut state = self.state.lock().unwrap();
        while state.write_front < to {
            state = self.advanced.wait(state).unwrap();
        }
        assert!(
            state.locked.is_none(),
            "read transaction already open on this buffer"
        );
        state.locked = Some(SampleRange::new(from, to));
        ReadTransaction {
            buffer: self,
            from,
            to,
        }
    }
}

/// Open read window over a [`StationBuffer`]; ends when dropped.
pub struct ReadTransaction<'a, E: Element> {
    buffer: &'a StationBuffer<E>,
    from: u64,
    to: u64,
}

impl<E: Element> ReadTransaction<'_, E> {
    /// Copy out one beamlet's window, shifted left by `coarse_shift` whole
    /// samples (the coarse delay), returning the samples and window-relative
    /// flags for everything missing or invalid. Flagged samples are zeroed.
    pub fn get_elements(&self, beamlet: usize, coarse_shift: i64) -> (Vec<E>, SampleFlags) {
        assert!(
            beamlet < self.buffer.nr_beamlets,
            "beamlet {} out of range ({} beamlets)",
            beamlet,
            self.buffer.nr_beamlets
        );
        let length = (self.to - self.from) as usize;
        let begin = self.from as i64 - coarse_shift;

        let state = self.buffer.state.lock().unwrap();
        let mut window = vec![E::default(); length];
        let mut flags = SampleFlags::new(self.buffer.max_flag_ranges);

        // Samples before the stream origin can only be flagged
        let valid_from = begin.max(0) as u64;
        let valid_to = (begin + length as i64).max(0) as u64;
        if begin < 0 {
            flags.include(0, (-begin).min(length as i64) as u64);
        }

        if valid_from < valid_to {
            let base = beamlet * self.buffer.capacity;
            for abs in valid_from..valid_to {
                let rel = (abs as i64 - begin) as usize;
                let slot = (abs & self.buffer.mask) as usize;
                window[rel] = state.data[base + slot];
            }
            for gap in state
                .valid
                .gaps_within(valid_from, valid_to, self.buffer.max_flag_ranges)
                .ranges()
            {
                let rel_begin = (gap.begin as i64 - begin) as u64;
                let rel_end = (gap.end as i64 - begin) as u64;
                flags.include(rel_begin, rel_end);
            }
        }

        for gap in flags.ranges() {
            window[gap.begin as usize..gap.end as usize].fill(E::default());
        }
        (window, flags)
    }

    /// Absolute sample range of this window.
    pub fn range(&self) -> (u64, u64) {
        (self.from, self.to)
    }
}

impl<E: Element> Drop for ReadTransaction<'_, E> {
    fn drop(&mut self) {
        let mut state = self.buffer.state.lock().unwrap();
        state.locked = None;
        self.buffer.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// One beamlet-major frame whose sample values encode (beamlet, index).
    fn frame(nr_beamlets: usize, timestamp: u64, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(nr_beamlets * n);
        for b in 0..nr_beamlets {
            for i in 0..n {
                out.push((b * 1000) as f32 + (timestamp + i as u64) as f32);
            }
        }
        out
    }

    #[test]
    fn test_full_window_no_flags() {
        let buf: StationBuffer<f32> = StationBuffer::new(2, 16, 8);
        buf.write_frame(0, &frame(2, 0, 8));
        buf.write_frame(8, &frame(2, 8, 8));

        let txn = buf.start_read(0, 16);
        let (window, flags) = txn.get_elements(1, 0);
        assert!(flags.is_empty());
        assert_eq!(window.len(), 16);
        assert_eq!(window[0], 1000.0);
        assert_eq!(window[15], 1015.0);
    }

    #[test]
    fn test_missing_frame_is_flagged_and_zeroed() {
        let buf: StationBuffer<f32> = StationBuffer::new(1, 16, 8);
        buf.write_frame(0, &frame(1, 0, 4));
        // Samples 4..8 never arrive
        buf.write_frame(8, &frame(1, 8, 8));

        let txn = buf.start_read(0, 16);
        let (window, flags) = txn.get_elements(0, 0);
        assert_eq!(flags.ranges().len(), 1);
        assert_eq!((flags.ranges()[0].begin, flags.ranges()[0].end), (4, 8));
        assert!(window[4..8].iter().all(|&s| s == 0.0));
        assert_eq!(window[8], 8.0);
    }

    #[test]
    fn test_out_of_order_frames() {
        let buf: StationBuffer<f32> = StationBuffer::new(1, 16, 8);
        buf.write_frame(4, &frame(1, 4, 4));
        buf.write_frame(0, &frame(1, 0, 4));

        let txn = buf.start_read(0, 8);
        let (window, flags) = txn.get_elements(0, 0);
        assert!(flags.is_empty());
        assert_eq!(window[3], 3.0);
        assert_eq!(window[4], 4.0);
    }

    #[test]
    fn test_coarse_shift_moves_window() {
        let buf: StationBuffer<f32> = StationBuffer::new(1, 32, 8);
        buf.write_frame(0, &frame(1, 0, 32));

        let txn = buf.start_read(16, 24);
        // Shift of 3: the window reads samples 13..21
        let (window, flags) = txn.get_elements(0, 3);
        assert!(flags.is_empty());
        assert_eq!(window[0], 13.0);
        assert_eq!(window[7], 20.0);
    }

    #[test]
    fn test_shift_before_stream_origin_is_flagged() {
        let buf: StationBuffer<f32> = StationBuffer::new(1, 16, 8);
        buf.write_frame(0, &frame(1, 0, 8));

        let txn = buf.start_read(0, 8);
        let (window, flags) = txn.get_elements(0, 2);
        // First two slots fall before sample 0
        assert_eq!((flags.ranges()[0].begin, flags.ranges()[0].end), (0, 2));
        assert_eq!(window[0], 0.0);
        assert_eq!(window[2], 0.0); // sample index 0
        assert_eq!(window[7], 5.0);
    }

    #[test]
    fn test_wraparound_retains_latest_window() {
        let buf: StationBuffer<f32> = StationBuffer::new(1, 16, 8);
        for t in (0..64).step_by(8) {
            buf.write_frame(t, &frame(1, t, 8));
        }

        let txn = buf.start_read(48, 64);
        let (window, flags) = txn.get_elements(0, 0);
        assert!(flags.is_empty());
        assert_eq!(window[0], 48.0);
        assert_eq!(window[15], 63.0);
    }

    #[test]
    fn test_stale_frame_dropped() {
        let buf: StationBuffer<f32> = StationBuffer::new(1, 16, 8);
        buf.write_frame(32, &frame(1, 32, 8));
        // Entirely below the retained window [24, 40): refused
        buf.write_frame(0, &frame(1, 0, 8));

        let txn = buf.start_read(32, 40);
        let (_, flags) = txn.get_elements(0, 0);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_start_read_blocks_until_writer_passes() {
        let buf: Arc<StationBuffer<f32>> = Arc::new(StationBuffer::new(1, 16, 8));

        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let txn = buf.start_read(0, 8);
                let (window, flags) = txn.get_elements(0, 0);
                (window[7], flags.is_empty())
            })
        };

        thread::sleep(Duration::from_millis(20));
        buf.write_frame(0, &frame(1, 0, 8));

        let (last, clean) = reader.join().unwrap();
        assert_eq!(last, 7.0);
        assert!(clean);
    }

    #[test]
    fn test_writer_parks_until_pinned_range_released() {
        let buf: Arc<StationBuffer<f32>> = Arc::new(StationBuffer::new(1, 8, 8));
        buf.write_frame(0, &frame(1, 0, 8));

        let txn = buf.start_read(0, 8);

        let writer = {
            let buf = Arc::clone(&buf);
            // Overwrites slots of samples 0..8, which are pinned
            thread::spawn(move || buf.write_frame(8, &frame(1, 8, 8)))
        };

        thread::sleep(Duration::from_millis(20));
        let (window, flags) = txn.get_elements(0, 0);
        assert!(flags.is_empty());
        assert_eq!(window[0], 0.0);

        drop(txn);
        writer.join().unwrap();
        assert_eq!(buf.write_front(), 16);
    }
}

//! Core types for the block-transpose pipeline
//!
//! Defines the sample element abstraction, the identity of a subband chunk
//! on the wire, and the transport error taxonomy shared by the receiver and
//! sender sides.
//!
//! The transposition machinery is generic over [`Element`]: it never inspects
//! sample values, it only needs a fixed byte size and a little-endian codec
//! so that payloads can cross the network. The numeric pipeline runs on
//! [`PipelineSample`] (complex float); station beamlets arrive as
//! [`BeamletSample`] (complex 16-bit, the raw digitizer format).

use num_complex::Complex;
use std::fmt;
use std::io;

/// Sample type of the numeric (beamformer/correlator) pipeline.
pub type PipelineSample = Complex<f32>;

/// Sample type of raw station beamlets as produced by the digitizers.
pub type BeamletSample = Complex<i16>;

/// A fixed-size sample element that can cross the wire.
///
/// Implementations must be plain values: `SIZE` bytes, little-endian, no
/// padding. `Default` is the zero sample used to fill missing data.
pub trait Element: Copy + Default + Send + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encode into `buf[..Self::SIZE]`, little-endian.
    fn write_le(&self, buf: &mut [u8]);

    /// Decode from `buf[..Self::SIZE]`, little-endian.
    fn read_le(buf: &[u8]) -> Self;
}

impl Element for i16 {
    const SIZE: usize = 2;

    fn write_le(&self, buf: &mut [u8]) {
        buf[..2].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> Self {
        i16::from_le_bytes(buf[..2].try_into().unwrap())
    }
}

impl Element for f32 {
    const SIZE: usize = 4;

    fn write_le(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> Self {
        f32::from_le_bytes(buf[..4].try_into().unwrap())
    }
}

impl Element for Complex<f32> {
    const SIZE: usize = 8;

    fn write_le(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.re.to_le_bytes());
        buf[4..8].copy_from_slice(&self.im.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> Self {
        let re = f32::from_le_bytes(buf[..4].try_into().unwrap());
        let im = f32::from_le_bytes(buf[4..8].try_into().unwrap());
        Complex::new(re, im)
    }
}

impl Element for Complex<i16> {
    const SIZE: usize = 4;

    fn write_le(&self, buf: &mut [u8]) {
        buf[..2].copy_from_slice(&self.re.to_le_bytes());
        buf[2..4].copy_from_slice(&self.im.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> Self {
        let re = i16::from_le_bytes(buf[..2].try_into().unwrap());
        let im = i16::from_le_bytes(buf[2..4].try_into().unwrap());
        Complex::new(re, im)
    }
}

/// Identity of one subband chunk: which output file, which time slice,
/// which frequency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    /// Logical output stream (observation file) this chunk belongs to.
    pub file: u32,
    /// Frequency-group index within the time slice.
    pub subband: u32,
    /// Sequential time-slice index within the file.
    pub block: u32,
}

impl BlockId {
    pub fn new(file: u32, subband: u32, block: u32) -> Self {
        Self { file, subband, block }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(file {}, block {}, subband {})",
            self.file, self.block, self.subband
        )
    }
}

/// Shape of a subband payload: `(nr_samples, nr_channels)`, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubbandShape {
    pub nr_samples: usize,
    pub nr_channels: usize,
}

impl SubbandShape {
    pub fn new(nr_samples: usize, nr_channels: usize) -> Self {
        Self {
            nr_samples,
            nr_channels,
        }
    }

    /// Total element count of one payload.
    pub fn len(&self) -> usize {
        self.nr_samples * self.nr_channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for SubbandShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.nr_samples, self.nr_channels)
    }
}

/// Errors raised while moving subband records over a byte stream.
///
/// `EndOfStream` is the orderly-shutdown sentinel: the peer closed the
/// connection cleanly between records. Everything else indicates a damaged
/// or misconfigured transport and is treated as fatal by the read loops.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The stream ended cleanly on a record boundary. Expected; signals
    /// that a receiver loop should shut down.
    #[error("end of stream")]
    EndOfStream,

    /// The stream ended inside a record. The transport lost framing.
    #[error("stream truncated inside a subband record ({context})")]
    Truncated { context: &'static str },

    /// A header announced a payload no sane deployment produces.
    #[error("subband header for {id} announces implausible shape {shape}")]
    ImplausibleShape { id: BlockId, shape: SubbandShape },

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(<i16 as Element>::SIZE, 2);
        assert_eq!(<f32 as Element>::SIZE, 4);
        assert_eq!(<Complex<i16> as Element>::SIZE, 4);
        assert_eq!(<Complex<f32> as Element>::SIZE, 8);
    }

    #[test]
    fn test_element_roundtrip_complex_f32() {
        let s = Complex::new(1.5f32, -2.25f32);
        let mut buf = [0u8; 8];
        s.write_le(&mut buf);
        assert_eq!(Complex::<f32>::read_le(&buf), s);
    }

    #[test]
    fn test_element_roundtrip_complex_i16() {
        let s = Complex::new(-32768i16, 32767i16);
        let mut buf = [0u8; 4];
        s.write_le(&mut buf);
        assert_eq!(Complex::<i16>::read_le(&buf), s);
    }

    #[test]
    fn test_element_zero_default() {
        let z: PipelineSample = Default::default();
        assert_eq!(z, Complex::new(0.0, 0.0));
    }

    #[test]
    fn test_block_id_display() {
        let id = BlockId::new(3, 17, 42);
        assert_eq!(format!("{}", id), "(file 3, block 42, subband 17)");
    }

    #[test]
    fn test_shape_len() {
        let shape = SubbandShape::new(16, 4);
        assert_eq!(shape.len(), 64);
        assert!(!shape.is_empty());
        assert!(SubbandShape::new(0, 4).is_empty());
    }
}

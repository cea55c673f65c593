//! Subband — one arrived chunk of samples for a single `(file, block, subband)`
//! coordinate, with its self-describing wire envelope.
//!
//! Wire format, all fields u32 little-endian, in this order:
//!
//! ```text
//! [file] [subband] [block] [dim1 = nr_samples] [dim2 = nr_channels]
//! [payload: dim1 * dim2 * Element::SIZE bytes, row-major]
//! ```
//!
//! There is no length prefix or checksum beyond the shape fields: the reader
//! always knows how many bytes the record still owes from the header it just
//! read, and the transport (TCP) is trusted for integrity. End of stream is
//! only legal *between* records; running dry mid-record means the transport
//! lost framing and is reported as [`WireError::Truncated`].
//!
//! ## Example
//!
//! ```rust
//! use tabx_core::subband::Subband;
//! use tabx_core::types::{BlockId, SubbandShape};
//!
//! let shape = SubbandShape::new(4, 2);
//! let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
//! let sb = Subband::from_samples(BlockId::new(0, 3, 7), shape, data);
//!
//! let mut wire = Vec::new();
//! sb.write_to(&mut wire).unwrap();
//! let back = Subband::<f32>::read_from(&mut wire.as_slice()).unwrap();
//! assert_eq!(back.id(), sb.id());
//! assert_eq!(back.samples(), sb.samples());
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::types::{BlockId, Element, SubbandShape, WireError, WireResult};

/// Upper bound on elements a header may announce. Anything larger is a
/// corrupt header, not a real payload: the largest deployed configuration
/// is orders of magnitude below this.
const MAX_PAYLOAD_ELEMENTS: usize = 1 << 28;

/// One subband chunk: identity plus a row-major `(nr_samples, nr_channels)`
/// payload. Moves through the pipeline by ownership transfer and is consumed
/// exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Subband<E: Element> {
    id: BlockId,
    shape: SubbandShape,
    data: Vec<E>,
}

impl<E: Element> Subband<E> {
    /// Create a zero-filled subband of the given shape.
    pub fn new(id: BlockId, shape: SubbandShape) -> Self {
        Self {
            id,
            shape,
            data: vec![E::default(); shape.len()],
        }
    }

    /// Wrap existing sample data. `data.len()` must equal `shape.len()`.
    pub fn from_samples(id: BlockId, shape: SubbandShape, data: Vec<E>) -> Self {
        assert_eq!(
            data.len(),
            shape.len(),
            "subband {} payload length {} does not match shape {}",
            id,
            data.len(),
            shape
        );
        Self { id, shape, data }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn shape(&self) -> SubbandShape {
        self.shape
    }

    /// All samples, row-major: sample-major, channel-minor.
    pub fn samples(&self) -> &[E] {
        &self.data
    }

    /// The channel row for one sample index.
    pub fn sample_row(&self, sample: usize) -> &[E] {
        let w = self.shape.nr_channels;
        &self.data[sample * w..(sample + 1) * w]
    }

    /// Serialize the record: header fields, then raw payload bytes.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.id.file)?;
        w.write_u32::<LittleEndian>(self.id.subband)?;
        w.write_u32::<LittleEndian>(self.id.block)?;
        w.write_u32::<LittleEndian>(self.shape.nr_samples as u32)?;
        w.write_u32::<LittleEndian>(self.shape.nr_channels as u32)?;

        let mut bytes = vec![0u8; self.data.len() * E::SIZE];
        for (i, e) in self.data.iter().enumerate() {
            e.write_le(&mut bytes[i * E::SIZE..]);
        }
        w.write_all(&bytes)
    }

    /// Deserialize one record.
    ///
    /// A clean EOF before the first header byte yields
    /// [`WireError::EndOfStream`]; EOF anywhere later in the record yields
    /// [`WireError::Truncated`].
    pub fn read_from<R: Read>(r: &mut R) -> WireResult<Self> {
        let file = read_u32_or_eos(r)?;
        let subband = read_field(r, "block id")?;
        let block = read_field(r, "block id")?;
        let id = BlockId::new(file, subband, block);

        let dim1 = read_field(r, "shape")? as usize;
        let dim2 = read_field(r, "shape")? as usize;
        let shape = SubbandShape::new(dim1, dim2);
        if shape.len() > MAX_PAYLOAD_ELEMENTS {
            return Err(WireError::ImplausibleShape { id, shape });
        }

        let mut bytes = vec![0u8; shape.len() * E::SIZE];
        r.read_exact(&mut bytes).map_err(|e| truncated(e, "payload"))?;
        let data = bytes
            .chunks_exact(E::SIZE)
            .map(E::read_le)
            .collect::<Vec<_>>();

        Ok(Self { id, shape, data })
    }
}

/// Read the leading header field, distinguishing a clean end of stream
/// (zero bytes available) from a mid-record truncation.
fn read_u32_or_eos<R: Read>(r: &mut R) -> WireResult<u32> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(WireError::EndOfStream),
            Ok(0) => {
                return Err(WireError::Truncated {
                    context: "block id",
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(u32::from_le_bytes(buf))
}

fn read_field<R: Read>(r: &mut R, context: &'static str) -> WireResult<u32> {
    r.read_u32::<LittleEndian>().map_err(|e| truncated(e, context))
}

fn truncated(e: io::Error, context: &'static str) -> WireError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        WireError::Truncated { context }
    } else {
        WireError::Io(e)
    }
}

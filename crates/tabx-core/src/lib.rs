//! # Tied-Array Block Transpose
//!
//! Real-time data transport and block transposition for radio-telescope
//! correlator/beamformer pipelines. Stations stream per-subband sample
//! chunks over unreliable, variable-latency links; this crate reassembles
//! them — out of order, possibly incomplete — into fixed-shape, gap-filled
//! blocks ready for numerical processing, under bounded memory and latency.
//! The telescope never stops producing, so the pipeline favors forward
//! progress over completeness: data that is too late is dropped and counted,
//! data that never arrives is zero-filled.
//!
//! ## Data Flow
//!
//! ```text
//! station frames → StationBuffer + DelayCompensation → Subband
//!     → MultiSender ═network═ MultiReceiver → Receiver
//!     → BlockCollector (reassemble, evict, zero-fill)
//!     → BlockPool buffers → downstream writer
//! ```
//!
//! ## Modules
//!
//! - [`subband`] / [`block`]: the data entities and the wire format
//! - [`collector`]: the per-file reassembly state machine
//! - [`receiver`] / [`sender`]: TCP fan-in and fan-out of subband streams
//! - [`station`] / [`delay`] / [`flags`]: station-side ring buffer and
//!   delay-compensated window extraction
//! - [`queue`] / [`pool`] / [`rt`] / [`stats`] / [`config`]: the plumbing
//!
//! ## Example
//!
//! ```rust
//! use tabx_core::collector::{BlockCollector, CollectorConfig};
//! use tabx_core::subband::Subband;
//! use tabx_core::types::{BlockId, PipelineSample, SubbandShape};
//!
//! let collector = BlockCollector::<PipelineSample>::new(CollectorConfig {
//!     file: 0,
//!     nr_blocks: 1,
//!     nr_subbands: 2,
//!     nr_samples: 4,
//!     nr_channels: 1,
//!     max_blocks_in_flight: 0,
//!     nr_pool_buffers: 2,
//! })
//! .unwrap();
//!
//! // Subbands may arrive in any order; the collector reassembles
//! for subband in (0..2).rev() {
//!     collector.append(Subband::new(
//!         BlockId::new(0, subband, 0),
//!         SubbandShape::new(4, 1),
//!     ));
//! }
//! collector.finish();
//!
//! let block = collector.filled().pop().unwrap();
//! assert_eq!(block.block_index(), 0);
//! assert_eq!(block.subbands_lost(), 0);
//! ```

pub mod block;
pub mod collector;
pub mod config;
pub mod delay;
pub mod flags;
pub mod pool;
pub mod queue;
pub mod receiver;
pub mod rt;
pub mod sender;
pub mod station;
pub mod stats;
pub mod subband;
pub mod types;

pub use block::{Block, BlockBuffer};
pub use collector::{BlockCollector, CollectorConfig};
pub use config::TabxConfig;
pub use queue::{BoundedQueue, OverflowPolicy};
pub use receiver::{CollectorMap, MultiReceiver, Receiver};
pub use sender::{MultiSender, SenderConfig};
pub use subband::Subband;
pub use types::{BlockId, Element, PipelineSample, SubbandShape, WireError};

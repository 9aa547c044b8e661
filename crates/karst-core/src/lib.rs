#![forbid(unsafe_code)]
//! The karst data-path engine.
//!
//! Karst exposes a fixed logical block address space over a smaller
//! physical pool. Every write is zero-checked, fingerprinted, checked
//! against a dedup index, optionally compressed and bin-packed, and
//! either shared with an existing physical block or written fresh. Reads
//! translate through the block map and decompress packed fragments.
//!
//! The engine is organized as cooperative single-threaded *zones*; each
//! request is carried by a data-VIO that hops between zones through the
//! pipeline. See `engine` for the scheduler and step handlers.
//!
//! ```no_run
//! use asupersync::Cx;
//! use karst_block::{ByteBlockDevice, MemoryByteDevice};
//! use karst_core::{Engine, EngineConfig};
//! use karst_dedup::MemoryAdviceIndex;
//! use karst_types::Lbn;
//! use std::sync::Arc;
//!
//! let cx = Cx::for_testing();
//! let dev = ByteBlockDevice::new(MemoryByteDevice::new(64 << 20), 4096).unwrap();
//! let mut engine = Engine::format(
//!     &cx,
//!     Arc::new(dev),
//!     EngineConfig::default(),
//!     Box::new(MemoryAdviceIndex::new()),
//! )
//! .unwrap();
//! engine.write_blocks(&cx, Lbn(0), &[7_u8; 4096]).unwrap();
//! let back = engine.read_blocks(&cx, Lbn(0), 1).unwrap();
//! assert_eq!(back, vec![7_u8; 4096]);
//! ```

pub mod bio;
pub mod config;
pub mod data_vio;
pub mod engine;
pub mod hash_lock;
pub mod pool;
pub mod stats;
pub mod zones;

pub use bio::{Bio, BioFlags, BioId, BioOp};
pub use config::EngineConfig;
pub use engine::Engine;
pub use stats::EngineStats;

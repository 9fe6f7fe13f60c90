//! # carve-core
//!
//! A declarative engine for recognizing and decoding binary file formats.
//!
//! This crate provides the core functionality for:
//! - Describing binary layouts as trees of typed attributes and structures
//! - Probing inputs against those descriptions and decoding them into a result tree
//! - Materializing compressed substreams and scanning them recursively
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`input`]: Random-access byte sources
//! - [`attribute`]: Typed leaf values and the attributes that read them
//! - [`spec`]: Format specifications and the probe/decode protocol
//! - [`context`]: Scoped attribute bindings threaded through a decode pass
//! - [`result`]: The result tree decodes populate
//! - [`decoder`]: Stream decoders for encoded ranges
//! - [`cache`]: Scratch store for decoded streams
//! - [`format`]: Format providers and their registry
//! - [`scan`]: The queue-driven scheduler
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use carve_core::{FormatRegistry, NullListener, Scheduler, ScannerConfig};
//!
//! let mut scheduler = Scheduler::new(FormatRegistry::builtin(), ScannerConfig::new());
//! scheduler.handle().queue_file("archive.zip")?;
//! let stats = scheduler.run(&mut NullListener)?;
//!
//! scheduler.tree().walk(&mut |node, depth| {
//!     println!("{}{} {:?}", "  ".repeat(depth), node.name(), node.span());
//! });
//! println!("{} derived inputs", stats.derived_inputs);
//! # Ok::<(), carve_core::Error>(())
//! ```
//!
//! ## Extensibility
//!
//! The library provides several traits for customization:
//!
//! - [`Format`]: Add a recognizable format
//! - [`Decoder`]: Add a stream encoding
//! - [`Input`]: Scan bytes from any random-access source
//! - [`ScanListener`]: Observe a scan session
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod attribute;
pub mod cache;
pub mod context;
pub mod decoder;
pub mod error;
pub mod format;
#[cfg(feature = "builtin-formats")]
pub mod formats;
pub mod input;
pub mod result;
pub mod scan;
pub mod spec;

// Re-export primary types for convenience
pub use attribute::{Attribute, AttributeId, DataType, Endian, Length, Value};
pub use cache::{CacheConfig, CachedInput, DecodeCache};
pub use context::{DecodeContext, UndeclaredWrite};
pub use decoder::{Decoder, DeflateDecoder, StoreDecoder, UnsupportedDecoder};
pub use error::{Error, Result};
pub use format::{Format, FormatRegistry, SpecFormat};
pub use input::{FileInput, Input, MemoryInput};
pub use result::{NodeKind, Renderable, ResultNode, ResultSection, ResultTree, SectionHandle};
pub use scan::{
    NullListener, ScanHandle, ScanListener, ScanProgress, ScanState, ScanStats, ScannerConfig, Scheduler,
    StatsListener,
};
pub use spec::{FormatSpec, Probe};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

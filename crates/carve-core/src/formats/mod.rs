//! Built-in format providers.
//!
//! These cover the common containers for compressed data and keep only the
//! structure needed to reach the embedded streams:
//!
//! - [`gzip`]: RFC 1952 member header, deflate body and trailer
//! - [`zip`]: local entries, central directory and end record
//! - [`png`]: signature and chunk sequence

mod gzip;
mod png;
mod zip;

pub use gzip::gzip;
pub use png::png;
pub use zip::zip;

use crate::format::SpecFormat;

/// Every built-in format, in probing order
pub fn all() -> Vec<SpecFormat> {
    vec![gzip(), zip(), png()]
}

//! Pluggable stream decoders.
//!
//! A [`Decoder`] turns the bytes of an encoded region into plain bytes, one
//! output chunk per call. The decode cache drives it until it reports
//! completion and stores whatever it produced.

use flate2::{Decompress, FlushDecompress, Status};
use std::io::{self, Read};
use tracing::trace;

const INPUT_BUFFER_SIZE: usize = 32 * 1024;

/// Trait for decoding an encoded byte stream
pub trait Decoder: Send {
    /// Fills `output` with decoded bytes read from `input`.
    ///
    /// Returns the number of bytes produced; `Ok(0)` means the stream is done.
    /// `output` is never empty.
    fn decode(&mut self, output: &mut [u8], input: &mut dyn Read) -> io::Result<usize>;

    /// Number of encoded bytes the stream occupied so far
    fn consumed(&self) -> u64;

    /// Short name of the scheme, for logs
    fn name(&self) -> &str;
}

/// Passthrough decoder for stored (uncompressed) data
#[derive(Debug, Default)]
pub struct StoreDecoder {
    consumed: u64,
}

impl StoreDecoder {
    /// Creates a new passthrough decoder
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for StoreDecoder {
    fn decode(&mut self, output: &mut [u8], input: &mut dyn Read) -> io::Result<usize> {
        loop {
            match input.read(output) {
                Ok(n) => {
                    self.consumed += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }

    fn name(&self) -> &str {
        "store"
    }
}

/// Deflate decoder with exact accounting of consumed input.
///
/// Input is pulled in blocks, so the reader may be advanced past the end of
/// the deflate stream; [`consumed`](Decoder::consumed) still reports only
/// the bytes the stream itself used, which lets trailing fields be decoded.
pub struct DeflateDecoder {
    inner: Decompress,
    zlib: bool,
    buffer: Box<[u8]>,
    position: usize,
    filled: usize,
    eof: bool,
    done: bool,
}

impl DeflateDecoder {
    /// Decoder for a raw deflate stream
    pub fn new() -> Self {
        Self::with_header(false)
    }

    /// Decoder for a zlib-framed deflate stream
    pub fn zlib() -> Self {
        Self::with_header(true)
    }

    fn with_header(zlib: bool) -> Self {
        Self {
            inner: Decompress::new(zlib),
            zlib,
            buffer: vec![0u8; INPUT_BUFFER_SIZE].into_boxed_slice(),
            position: 0,
            filled: 0,
            eof: false,
            done: false,
        }
    }
}

impl Default for DeflateDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DeflateDecoder {
    fn decode(&mut self, output: &mut [u8], input: &mut dyn Read) -> io::Result<usize> {
        loop {
            if self.done {
                return Ok(0);
            }

            if self.position == self.filled && !self.eof {
                self.filled = match input.read(&mut self.buffer) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                self.position = 0;
                self.eof = self.filled == 0;
            }

            let in_before = self.inner.total_in();
            let out_before = self.inner.total_out();
            let status = self
                .inner
                .decompress(
                    &self.buffer[self.position..self.filled],
                    output,
                    FlushDecompress::None,
                )
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let used = (self.inner.total_in() - in_before) as usize;
            let produced = (self.inner.total_out() - out_before) as usize;
            self.position += used;

            if status == Status::StreamEnd {
                trace!(
                    "deflate stream ended after {} input bytes",
                    self.inner.total_in()
                );
                self.done = true;
            }
            if produced > 0 {
                return Ok(produced);
            }
            if self.done {
                return Ok(0);
            }
            if used == 0 {
                if self.eof {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "deflate stream truncated",
                    ));
                }
                if self.position < self.filled {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "deflate stream made no progress",
                    ));
                }
            }
        }
    }

    fn consumed(&self) -> u64 {
        self.inner.total_in()
    }

    fn name(&self) -> &str {
        if self.zlib {
            "zlib"
        } else {
            "deflate"
        }
    }
}

/// Decoder for schemes the engine cannot handle; always fails
#[derive(Debug, Clone)]
pub struct UnsupportedDecoder {
    scheme: String,
}

impl UnsupportedDecoder {
    /// Creates a decoder that reports `scheme` as unsupported
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
        }
    }
}

impl Decoder for UnsupportedDecoder {
    fn decode(&mut self, _output: &mut [u8], _input: &mut dyn Read) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported encoding: {}", self.scheme),
        ))
    }

    fn consumed(&self) -> u64 {
        0
    }

    fn name(&self) -> &str {
        &self.scheme
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn drain(decoder: &mut dyn Decoder, mut input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = decoder.decode(&mut chunk, &mut input)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_store_decoder() {
        let mut decoder = StoreDecoder::new();
        let out = drain(&mut decoder, b"plain bytes").unwrap();
        assert_eq!(out, b"plain bytes");
        assert_eq!(decoder.consumed(), 11);
    }

    #[test]
    fn test_deflate_reports_exact_consumption() {
        let text = b"the quick brown fox jumps over the lazy dog, twice: the quick brown fox";
        let mut encoded = deflate(text);
        let stream_len = encoded.len() as u64;
        encoded.extend_from_slice(&[0xAA; 8]);

        let mut decoder = DeflateDecoder::new();
        let out = drain(&mut decoder, &encoded).unwrap();
        assert_eq!(out, text);
        assert_eq!(decoder.consumed(), stream_len);
    }

    #[test]
    fn test_zlib_decoder() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(b"zlib framed").unwrap();
        let encoded = encoder.finish().unwrap();

        let mut decoder = DeflateDecoder::zlib();
        assert_eq!(drain(&mut decoder, &encoded).unwrap(), b"zlib framed");
        assert_eq!(decoder.name(), "zlib");
    }

    #[test]
    fn test_deflate_truncated_stream_fails() {
        let encoded = deflate(&[7u8; 4096]);
        let truncated = &encoded[..encoded.len() / 2];
        let mut decoder = DeflateDecoder::new();
        let err = drain(&mut decoder, truncated).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_unsupported_decoder_fails() {
        let mut decoder = UnsupportedDecoder::new("method 14");
        let err = drain(&mut decoder, b"xx").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(err.to_string().contains("method 14"));
    }
}

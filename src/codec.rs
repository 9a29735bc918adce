//! Byte-stream compression for compressed CSV files.
//!
//! Each [`Compression`] variant wraps a reader or writer with the matching
//! streaming codec. Writers must be finished explicitly so trailing frames
//! reach the file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

/// Supported compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Snappy,
    Gzip,
    Lz4,
}

impl Compression {
    /// File extension, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Snappy => "snappy",
            Compression::Gzip => "gz",
            Compression::Lz4 => "lz4",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::Snappy => "snappy",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
        }
    }

    /// Wrap `reader` with a streaming decoder.
    pub fn decoder<'a, R: Read + Send + 'a>(&self, reader: R) -> Box<dyn Read + Send + 'a> {
        match self {
            Compression::Snappy => Box::new(snap::read::FrameDecoder::new(reader)),
            Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
            Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        }
    }

    /// Wrap `writer` with a streaming encoder.
    pub fn encoder<W: Write + Send + 'static>(&self, writer: W) -> Box<dyn CompressWriter> {
        match self {
            Compression::Snappy => Box::new(snap::write::FrameEncoder::new(writer)),
            Compression::Gzip => Box::new(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
            Compression::Lz4 => Box::new(lz4_flex::frame::FrameEncoder::new(writer)),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A writer that must be finished to produce a complete stream.
pub trait CompressWriter: Write + Send {
    /// Write any trailing frame and flush the underlying writer.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

impl<W: Write + Send> CompressWriter for io::BufWriter<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.flush()
    }
}

impl<W: Write + Send> CompressWriter for flate2::write::GzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()
    }
}

impl<W: Write + Send> CompressWriter for snap::write::FrameEncoder<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        // Flushing emits the pending frame and flushes the inner writer.
        self.flush()
    }
}

impl<W: Write + Send> CompressWriter for lz4_flex::frame::FrameEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = (*self).finish().map_err(io::Error::other)?;
        inner.flush()
    }
}

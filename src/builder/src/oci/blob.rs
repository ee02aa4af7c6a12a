//! Content-addressed blob writing.
//!
//! Blobs are streamed into a temporary file under the build directory
//! while a sha256 hasher observes the same bytes, then renamed into
//! `blobs/sha256/<hex>`. The rename is the commit point: a partial blob
//! never appears at a content-addressed path.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use funcforge_core::{BuildError, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use sha2::{Digest, Sha256};

use super::types::{Descriptor, Hash};

/// A writer that hashes and counts everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the writer, returning the inner sink, the digest of the
    /// bytes written, and their count.
    pub fn finalize(self) -> (W, Hash, u64) {
        let digest = Hash::sha256(hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Move a completed temporary file to its content-addressed path.
pub fn place(temp: &Path, blobs_dir: &Path, hex: &str) -> Result<PathBuf> {
    let blob = blobs_dir.join(hex);
    tracing::debug!(from = %temp.display(), to = %blob.display(), "mv");
    std::fs::rename(temp, &blob).map_err(|e| {
        BuildError::Rename(format!("{} -> {}: {}", temp.display(), blob.display(), e))
    })?;
    Ok(blob)
}

/// Encode a value as the builder's canonical JSON: two-space indented,
/// newline terminated.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"  "));
    value.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Serialize `value` to a blob under `blobs_dir`, staging through
/// `build_dir/<temp_name>`.
///
/// The returned descriptor carries digest and size; the caller fills in
/// the media type.
pub fn write_json_blob<T: Serialize>(
    build_dir: &Path,
    blobs_dir: &Path,
    temp_name: &str,
    value: &T,
) -> Result<Descriptor> {
    let temp = build_dir.join(temp_name);
    let file = File::create(&temp)
        .map_err(|e| BuildError::BlobWrite(format!("{}: {}", temp.display(), e)))?;

    let mut writer = HashingWriter::new(BufWriter::new(file));
    let encoded = encode_json(value)?;
    writer
        .write_all(&encoded)
        .map_err(|e| BuildError::BlobWrite(format!("{}: {}", temp.display(), e)))?;

    let (buffered, digest, size) = writer.finalize();
    buffered
        .into_inner()
        .map_err(|e| BuildError::BlobWrite(format!("{}: {}", temp.display(), e)))?;

    place(&temp, blobs_dir, &digest.hex)?;

    Ok(Descriptor {
        media_type: String::new(),
        size: size as i64,
        digest,
        platform: None,
    })
}

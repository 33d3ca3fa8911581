//! Input helpers: transparent gunzip and a SHA-1 digesting reader.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};

/// `Read` adapter that hashes every byte passing through it.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha1,
    bytes: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, hasher: Sha1::new(), bytes: 0 }
    }

    /// Bytes read so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hex SHA-1 of everything read, and the byte count.
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }

    /// Read whatever is left (e.g. bytes a decoder never asked for), then finish.
    pub fn drain_and_finish(mut self) -> io::Result<(String, u64)> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(self.finish())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// A file opened for reading, gunzipped when it is a `.gz`.
pub enum InputReader<R: Read> {
    Plain(R),
    Gzip(GzDecoder<R>),
}

impl<R: Read> InputReader<R> {
    /// Wrap `inner`, decompressing when `gzip` is set.
    pub fn new(inner: R, gzip: bool) -> Self {
        if gzip {
            InputReader::Gzip(GzDecoder::new(inner))
        } else {
            InputReader::Plain(inner)
        }
    }

    /// The underlying (compressed) reader.
    pub fn into_inner(self) -> R {
        match self {
            InputReader::Plain(r) => r,
            InputReader::Gzip(d) => d.into_inner(),
        }
    }
}

impl<R: Read> Read for InputReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputReader::Plain(r) => r.read(buf),
            InputReader::Gzip(d) => d.read(buf),
        }
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

/// Open `path`, transparently gunzipping `*.gz`.
pub fn open_input(path: impl AsRef<Path>) -> io::Result<InputReader<BufReader<File>>> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);
    Ok(InputReader::new(file, is_gzip(path)))
}

/// Like `open_input`, but the raw file bytes are digested on the way in.
/// Recover the digest with `into_inner().drain_and_finish()` once the input is consumed.
pub fn open_digested(
    path: impl AsRef<Path>,
) -> io::Result<InputReader<DigestReader<BufReader<File>>>> {
    let path = path.as_ref();
    let file = DigestReader::new(BufReader::new(File::open(path)?));
    Ok(InputReader::new(file, is_gzip(path)))
}

/// SHA-1 (hex) and size of a whole file.
pub fn digest_file(path: impl AsRef<Path>) -> io::Result<(String, u64)> {
    DigestReader::new(BufReader::new(File::open(path)?)).drain_and_finish()
}

/// Canonical `file://` URI for a local path.
pub fn file_uri(path: impl AsRef<Path>) -> io::Result<String> {
    let canonical = std::fs::canonicalize(path)?;
    Ok(format!("file://{}", canonical.display()))
}

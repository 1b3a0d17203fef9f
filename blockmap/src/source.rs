// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, ExitStatus, Stdio},
};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use liblzma::read::XzDecoder;
use thiserror::Error;
use tracing::debug;

use crate::stream::ReadDiscardExt;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open local file: {0:?}")]
    FileOpen(PathBuf, #[source] io::Error),
    #[error("Unsupported URL scheme: {0:?}")]
    UnsupportedScheme(String),
    #[error("Failed to fetch remote source: {0:?}")]
    Connection(String, #[source] Box<ureq::Error>),
    #[error("Failed to spawn decompressor: {0:?}")]
    Spawn(String, #[source] io::Error),
    #[error("Failed to wait for decompressor: {0:?}")]
    Wait(String, #[source] io::Error),
    #[error("Decompressor {0:?} exited with {1}")]
    DecompressorExit(String, ExitStatus),
}

type Result<T> = std::result::Result<T, Error>;

/// Type-erased sequential byte stream.
pub type BoxedStream = Box<dyn Read + Send>;

/// In-process decompression format. The format is always selected by the
/// caller (eg. from a file extension); this layer performs no content
/// sniffing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Bzip2,
    Xz,
}

impl CompressionFormat {
    /// Map a conventional file extension to a format.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "gz" | "gzip" => Some(Self::Gzip),
            "bz2" => Some(Self::Bzip2),
            "xz" => Some(Self::Xz),
            _ => None,
        }
    }
}

/// In-process decompressor over any sequential byte stream.
pub enum Decoder {
    Gzip(GzDecoder<BoxedStream>),
    Bzip2(BzDecoder<BoxedStream>),
    Xz(XzDecoder<BoxedStream>),
}

impl Decoder {
    pub fn new(inner: BoxedStream, format: CompressionFormat) -> Self {
        match format {
            CompressionFormat::Gzip => Self::Gzip(GzDecoder::new(inner)),
            CompressionFormat::Bzip2 => Self::Bzip2(BzDecoder::new(inner)),
            CompressionFormat::Xz => Self::Xz(XzDecoder::new(inner)),
        }
    }

    pub fn format(&self) -> CompressionFormat {
        match self {
            Self::Gzip(_) => CompressionFormat::Gzip,
            Self::Bzip2(_) => CompressionFormat::Bzip2,
            Self::Xz(_) => CompressionFormat::Xz,
        }
    }
}

impl Read for Decoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(r) => r.read(buf),
            Self::Bzip2(r) => r.read(buf),
            Self::Xz(r) => r.read(buf),
        }
    }
}

/// An external decompressor child process read via its stdout. The child is
/// killed and reaped if the pipe is dropped before [`Self::finish`], so no
/// exit path leaks a zombie process.
pub struct ChildPipe {
    program: String,
    child: Option<Child>,
    stdout: ChildStdout,
}

impl ChildPipe {
    fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Spawn(program.to_owned(), e))?;

        // Always present with Stdio::piped().
        let stdout = child.stdout.take().unwrap();

        Ok(Self {
            program: program.to_owned(),
            child: Some(child),
            stdout,
        })
    }

    /// Wait for the child to exit and report a failing exit status.
    fn finish(mut self) -> Result<()> {
        let mut child = self.child.take().unwrap();

        let status = child
            .wait()
            .map_err(|e| Error::Wait(self.program.clone(), e))?;

        if !status.success() {
            return Err(Error::DecompressorExit(self.program.clone(), status));
        }

        Ok(())
    }
}

impl Drop for ChildPipe {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Read for ChildPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

enum Inner {
    Local(File),
    Stream(BoxedStream),
    Pipe(ChildPipe),
    Decoder(Decoder),
}

/// A source of image bytes: a local file (seekable), a remote or `file:` URL,
/// an external decompressor pipe, or an in-process decoder. Everything except
/// a local file is consumed strictly sequentially.
pub struct Source {
    inner: Inner,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = match self.inner {
            Inner::Local(_) => "Local",
            Inner::Stream(_) => "Stream",
            Inner::Pipe(_) => "Pipe",
            Inner::Decoder(_) => "Decoder",
        };
        f.debug_struct("Source").field("inner", &inner).finish()
    }
}

impl Source {
    /// Open a local file for random-access reads.
    pub fn local(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::FileOpen(path.to_owned(), e))?;

        Ok(Self::local_file(file))
    }

    pub fn local_file(file: File) -> Self {
        Self {
            inner: Inner::Local(file),
        }
    }

    /// Wrap an arbitrary sequential byte stream.
    pub fn stream(reader: BoxedStream) -> Self {
        Self {
            inner: Inner::Stream(reader),
        }
    }

    /// Resolve a URL into a byte stream. `file:` and `file://` are aliases
    /// for a local path; `http://` and `https://` are fetched as sequential
    /// streams. Everything else is rejected.
    pub fn url(url: &str) -> Result<Self> {
        if let Some(path) = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:")) {
            return Self::local(Path::new(path));
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            debug!("Fetching {url}");

            let response = ureq::get(url)
                .call()
                .map_err(|e| Error::Connection(url.to_owned(), Box::new(e)))?;

            return Ok(Self {
                inner: Inner::Stream(Box::new(response.into_reader())),
            });
        }

        Err(Error::UnsupportedScheme(url.to_owned()))
    }

    /// Spawn an external decompressor and use its stdout as the byte stream.
    pub fn pipe(program: &str, args: &[&str]) -> Result<Self> {
        debug!("Spawning decompressor: {program} {args:?}");

        Ok(Self {
            inner: Inner::Pipe(ChildPipe::spawn(program, args)?),
        })
    }

    /// Wrap an already-opened source in an in-process decompressor. The
    /// wrapped source becomes sequential even if it was seekable.
    pub fn decoder(self, format: CompressionFormat) -> Self {
        let stream: BoxedStream = match self.inner {
            Inner::Local(file) => Box::new(file),
            Inner::Stream(reader) => reader,
            Inner::Pipe(pipe) => Box::new(pipe),
            Inner::Decoder(decoder) => Box::new(decoder),
        };

        Self {
            inner: Inner::Decoder(Decoder::new(stream, format)),
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.inner, Inner::Local(_))
    }

    /// Size in bytes, known only for local files.
    pub fn size(&self) -> io::Result<Option<u64>> {
        match &self.inner {
            Inner::Local(file) => Ok(Some(file.metadata()?.len())),
            _ => Ok(None),
        }
    }

    /// Skip `size` bytes: a relative seek when the source supports it and a
    /// read-and-discard otherwise.
    pub fn skip(&mut self, size: u64) -> io::Result<()> {
        match &mut self.inner {
            Inner::Local(file) => {
                let offset = i64::try_from(size).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Skip size too large")
                })?;
                file.seek_relative(offset)
            }
            _ => self.read_discard_exact(size),
        }
    }

    /// Release the source, reporting a decompressor that exited unsuccessfully.
    pub fn finish(self) -> Result<()> {
        match self.inner {
            Inner::Pipe(pipe) => pipe.finish(),
            _ => Ok(()),
        }
    }
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Local(r) => r.read(buf),
            Inner::Stream(r) => r.read(buf),
            Inner::Pipe(r) => r.read(buf),
            Inner::Decoder(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;

    use super::*;

    fn boxed(data: Vec<u8>) -> BoxedStream {
        Box::new(Cursor::new(data))
    }

    #[test]
    fn decoder_gzip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"foobar").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut source = Source::stream(boxed(compressed)).decoder(CompressionFormat::Gzip);
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"foobar");
    }

    #[test]
    fn decoder_bzip2() {
        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(b"foobar").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut source = Source::stream(boxed(compressed)).decoder(CompressionFormat::Bzip2);
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"foobar");
    }

    #[test]
    fn decoder_xz() {
        let mut encoder = liblzma::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(b"foobar").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut source = Source::stream(boxed(compressed)).decoder(CompressionFormat::Xz);
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"foobar");
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            CompressionFormat::from_path(Path::new("image.img.gz")),
            Some(CompressionFormat::Gzip),
        );
        assert_eq!(
            CompressionFormat::from_path(Path::new("image.img.bz2")),
            Some(CompressionFormat::Bzip2),
        );
        assert_eq!(
            CompressionFormat::from_path(Path::new("image.img.xz")),
            Some(CompressionFormat::Xz),
        );
        assert_eq!(CompressionFormat::from_path(Path::new("image.img")), None);
    }

    #[test]
    fn local_skip_seeks() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"foobar").unwrap();
        file.rewind().unwrap();

        let mut source = Source::local_file(file);
        assert!(source.is_seekable());
        source.skip(3).unwrap();

        let mut buf = Vec::new();
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"bar");
    }

    #[test]
    fn stream_skip_discards() {
        let mut source = Source::stream(boxed(b"foobar".to_vec()));
        source.skip(3).unwrap();

        let mut buf = Vec::new();
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"bar");

        let mut source = Source::stream(boxed(b"foo".to_vec()));
        let err = source.skip(4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unsupported_scheme() {
        assert_matches!(Source::url("ftp://host/image"), Err(Error::UnsupportedScheme(_)));
    }

    #[cfg(unix)]
    #[test]
    fn pipe_round_trip() {
        let mut source = Source::pipe("printf", &["foobar"]).unwrap();
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"foobar");

        source.finish().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn pipe_reports_failure() {
        let source = Source::pipe("false", &[]).unwrap();
        assert_matches!(source.finish(), Err(Error::DecompressorExit(_, _)));
    }
}

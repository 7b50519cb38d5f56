//! Parser collaborators.
//!
//! The harness only knows about [`DocumentParser`]. A parser succeeds with the
//! extracted text or fails with an [`anyhow::Error`]; the failure counts as
//! *recognized* when a [`ParseError`] sits somewhere in its source chain.
//! Any other error, and any panic, is a fault the parser did not declare.

use std::io::{self, Read};
use std::time::Duration;

use bzip2::read::BzDecoder;
use thiserror::Error;

/// Default cap on extracted text, in bytes.
pub const DEFAULT_MAX_OUTPUT: usize = 100 * 1000;

/// Failure modes a parser declares as part of its contract.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is structurally invalid.
    #[error("malformed document: {0}")]
    Format(String),
    /// The document ended before the format said it would.
    #[error("document truncated: {0}")]
    Truncated(String),
    /// Reading the input failed.
    #[error("i/o error while reading document")]
    Io(#[source] io::Error),
    /// The parser gave up after its time budget.
    #[error("parse did not finish within {0:?}")]
    Timeout(Duration),
}

/// Returns the declared [`ParseError`] carried by `err`, if there is one.
pub fn recognized(err: &anyhow::Error) -> Option<&ParseError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ParseError>())
}

/// Something that turns a byte stream into text.
pub trait DocumentParser: Send + Sync {
    /// Parses `input` to text. The stream is consumed and released by the
    /// time this returns, whatever the outcome.
    fn parse(&self, input: &mut (dyn Read + Send)) -> anyhow::Result<String>;

    /// Releases resources held by the parser.
    fn close(&self) {}
}

impl<P: DocumentParser + ?Sized> DocumentParser for &P {
    fn parse(&self, input: &mut (dyn Read + Send)) -> anyhow::Result<String> {
        (**self).parse(input)
    }

    fn close(&self) {
        (**self).close()
    }
}

impl<P: DocumentParser + ?Sized> DocumentParser for Box<P> {
    fn parse(&self, input: &mut (dyn Read + Send)) -> anyhow::Result<String> {
        (**self).parse(input)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Compressed container formats understood by [`DecoderParser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Bzip2,
    Zstd,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Codec::Bzip2 => "bzip2",
            Codec::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bzip2" | "bz2" => Ok(Codec::Bzip2),
            "zstd" | "zst" => Ok(Codec::Zstd),
            other => Err(format!("unknown codec '{}'", other)),
        }
    }
}

/// In-process parser: decompresses a document and returns its text.
#[derive(Debug, Clone)]
pub struct DecoderParser {
    codec: Codec,
    max_output: usize,
}

impl DecoderParser {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    /// Caps the extracted text. Output past the cap is dropped, not reported.
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn decode(&self, input: &mut SourceWatch<'_>) -> io::Result<Vec<u8>> {
        let limit = self.max_output as u64;
        let mut out = Vec::new();
        match self.codec {
            Codec::Bzip2 => {
                BzDecoder::new(input).take(limit).read_to_end(&mut out)?;
            }
            Codec::Zstd => {
                zstd::stream::read::Decoder::new(input)?
                    .take(limit)
                    .read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}

impl DocumentParser for DecoderParser {
    fn parse(&self, input: &mut (dyn Read + Send)) -> anyhow::Result<String> {
        let mut watch = SourceWatch {
            inner: input,
            failed: false,
        };
        match self.decode(&mut watch) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if watch.failed => Err(ParseError::Io(e).into()),
            Err(e) => Err(codec_error(self.codec, e).into()),
        }
    }
}

/// Maps a decoder failure that did not come from the source itself.
fn codec_error(codec: Codec, e: io::Error) -> ParseError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => ParseError::Truncated(format!("{}: {}", codec.name(), e)),
        _ => ParseError::Format(format!("{}: {}", codec.name(), e)),
    }
}

/// Remembers whether the underlying source reported an error, so codec
/// complaints can be told apart from I/O failures.
struct SourceWatch<'a> {
    inner: &'a mut (dyn Read + Send),
    failed: bool,
}

impl Read for SourceWatch<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|e| {
            if e.kind() != io::ErrorKind::Interrupted {
                self.failed = true;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::io::Write;

    fn bzip2_bytes(text: &[u8]) -> Vec<u8> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
        encoder.write_all(text).unwrap();
        encoder.finish().unwrap()
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "source vanished"))
        }
    }

    #[test]
    fn test_bzip2_roundtrip() {
        let parser = DecoderParser::new(Codec::Bzip2);
        let data = bzip2_bytes(b"The quick brown fox");
        let text = parser.parse(&mut &data[..]).unwrap();
        assert_eq!(text, "The quick brown fox");
    }

    #[test]
    fn test_zstd_roundtrip() {
        let parser = DecoderParser::new(Codec::Zstd);
        let data = zstd::encode_all(&b"jumps over the lazy dog"[..], 3).unwrap();
        let text = parser.parse(&mut &data[..]).unwrap();
        assert_eq!(text, "jumps over the lazy dog");
    }

    #[test]
    fn test_output_is_capped() {
        let parser = DecoderParser::new(Codec::Bzip2).with_max_output(4);
        let data = bzip2_bytes(b"abcdefgh");
        assert_eq!(parser.parse(&mut &data[..]).unwrap(), "abcd");
    }

    #[test]
    fn test_garbage_is_recognized() {
        let parser = DecoderParser::new(Codec::Bzip2);
        let err = parser.parse(&mut &b"definitely not bzip2"[..]).unwrap_err();
        assert!(matches!(recognized(&err), Some(ParseError::Format(_))));
    }

    #[test]
    fn test_truncated_input() {
        let parser = DecoderParser::new(Codec::Bzip2);
        let data = bzip2_bytes(b"some text that will be cut short");
        let err = parser.parse(&mut &data[..data.len() / 2]).unwrap_err();
        assert!(recognized(&err).is_some());
    }

    #[test]
    fn test_source_failure_is_io() {
        let parser = DecoderParser::new(Codec::Zstd);
        let err = parser.parse(&mut FailingReader).unwrap_err();
        assert!(matches!(recognized(&err), Some(ParseError::Io(_))));
    }

    #[test]
    fn test_recognized_through_context() {
        let err = Err::<(), _>(ParseError::Timeout(Duration::from_secs(1)))
            .context("while parsing sample")
            .unwrap_err();
        assert!(matches!(recognized(&err), Some(ParseError::Timeout(_))));

        let other = anyhow::anyhow!("index out of range");
        assert!(recognized(&other).is_none());
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("bz2".parse::<Codec>().unwrap(), Codec::Bzip2);
        assert_eq!("zstd".parse::<Codec>().unwrap(), Codec::Zstd);
        assert!("gzip".parse::<Codec>().is_err());
    }
}

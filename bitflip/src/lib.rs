//! Single-bit fault injection for document parsers.
//!
//! [`CorruptingReader`] flips one addressable bit of a byte stream on its way
//! into a parser. [`Harness`] repeats that for every bit of a reference
//! document and reports which flips made the parser fail in a way it does not
//! declare.
//!
//! ```no_run
//! use bitflip::{Codec, DecoderParser, Harness, MappedSource};
//!
//! let source = MappedSource::open("sample.bz2")?;
//! let harness = Harness::new(DecoderParser::new(Codec::Bzip2));
//! let report = harness.sweep(&source)?;
//! assert!(report.passed(), "unhandled offsets: {:?}", report.unhandled_offsets());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod corrupt;
pub mod forked;
pub mod harness;
pub mod parser;
pub mod source;

pub use corrupt::{flip_bit, flip_bit_in_byte, CorruptingReader, StreamError};
pub use forked::{ForkedOptions, ForkedParser};
pub use harness::{
    classify, in_attempt, Attempt, Classification, Harness, HarnessError, SweepOptions,
    SweepReport,
};
pub use parser::{recognized, Codec, DecoderParser, DocumentParser, ParseError};
pub use source::{ByteSource, FileSource, MappedSource, MemorySource};

//! Corruption sweeps.
//!
//! The [`Harness`] feeds a parser one corrupted copy of a reference document
//! per bit offset and sorts every attempt into one of three buckets:
//!
//! | parser result                          | [`Classification`] |
//! |----------------------------------------|--------------------|
//! | `Ok(text)`                             | `Clean`            |
//! | `Err(e)` carrying a [`ParseError`]     | `Recovered`        |
//! | any other `Err`, or a panic            | `Unhandled`        |
//!
//! Only `Unhandled` attempts fail a sweep. Parsers are expected to reject
//! corrupted input, just not by crashing.
//!
//! # Ordering
//!
//! A sweep walks offsets in ascending order. With [`SweepOptions::jobs`] set,
//! offsets are processed in fixed-size partitions; each partition runs on a
//! rayon pool and is collected back in offset order before the next one
//! starts, so the report is identical to a sequential run.
//!
//! [`ParseError`]: crate::parser::ParseError

use std::cell::Cell;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::corrupt::CorruptingReader;
use crate::parser::{recognized, DocumentParser};
use crate::source::ByteSource;

/// Offsets handed to the pool at a time.
const PARTITION: u64 = 4096;

thread_local! {
    static IN_ATTEMPT: Cell<bool> = const { Cell::new(false) };
}

/// `true` while the current thread is inside a parser call made by
/// [`Harness::attempt`], where panics are caught and become attempt results.
///
/// Panic hooks can use this to tell parser panics from harness bugs.
pub fn in_attempt() -> bool {
    IN_ATTEMPT.with(Cell::get)
}

/// Marks the current thread as inside an attempt until dropped.
struct AttemptScope {
    outer: bool,
}

impl AttemptScope {
    fn enter() -> Self {
        Self {
            outer: IN_ATTEMPT.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for AttemptScope {
    fn drop(&mut self) {
        IN_ATTEMPT.with(|flag| flag.set(self.outer));
    }
}

/// How one parse attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// The parser returned text.
    Clean,
    /// The parser rejected the input with a declared error.
    Recovered,
    /// The parser failed in a way it does not declare.
    Unhandled,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Classification::Clean => "clean",
            Classification::Recovered => "recovered",
            Classification::Unhandled => "unhandled",
        })
    }
}

/// Maps a parser result, or the panic that replaced it, to a classification
/// and a description of the failure.
pub fn classify(
    result: &thread::Result<anyhow::Result<String>>,
) -> (Classification, Option<String>) {
    match result {
        Ok(Ok(_)) => (Classification::Clean, None),
        Ok(Err(e)) if recognized(e).is_some() => {
            (Classification::Recovered, Some(format!("{:#}", e)))
        }
        Ok(Err(e)) => (Classification::Unhandled, Some(format!("{:#}", e))),
        Err(payload) => (
            Classification::Unhandled,
            Some(format!("panic: {}", panic_message(payload.as_ref()))),
        ),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// One classified parse of one corrupted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Corrupted bit, `None` for the baseline.
    pub offset: Option<u64>,
    pub classification: Classification,
    /// Parser error or panic message, for anything but `Clean`.
    pub detail: Option<String>,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "bit #{}: {}", offset, self.classification)?,
            None => write!(f, "baseline: {}", self.classification)?,
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Errors that stop a sweep before it produces a report.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("cannot read {name}")]
    Source {
        name: String,
        #[source]
        error: io::Error,
    },
    /// The uncorrupted document does not parse cleanly, so corruption results
    /// would mean nothing.
    #[error(
        "baseline parse of {name} was {classification}: {}",
        .detail.as_deref().unwrap_or("no detail")
    )]
    Baseline {
        name: String,
        classification: Classification,
        detail: Option<String>,
    },
    #[error("max_unhandled must be at least 1")]
    ZeroUnhandledLimit,
    #[error("failed to build sweep thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Knobs for [`Harness::sweep`].
#[derive(Debug, Clone, Default)]
pub struct SweepOptions {
    /// Worker threads. `None` runs attempts one after another.
    pub jobs: Option<usize>,
    /// Stop once this many unhandled offsets were found. `Some(0)` is
    /// rejected with [`HarnessError::ZeroUnhandledLimit`] before the baseline
    /// runs.
    pub max_unhandled: Option<usize>,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

/// Outcome of a full sweep.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub source: String,
    /// Size of the offset domain (`length * 8`).
    pub bits: u64,
    /// Classification per offset, indexed by offset. Shorter than `bits` when
    /// the sweep stopped early.
    pub outcomes: Vec<Classification>,
    /// Unhandled attempts in ascending offset order.
    pub unhandled: Vec<Attempt>,
    pub stopped_early: bool,
    pub elapsed: Duration,
}

impl SweepReport {
    /// `true` when no offset produced an unhandled fault.
    pub fn passed(&self) -> bool {
        self.unhandled.is_empty()
    }

    pub fn unhandled_offsets(&self) -> Vec<u64> {
        self.unhandled.iter().filter_map(|a| a.offset).collect()
    }

    pub fn count(&self, classification: Classification) -> usize {
        self.outcomes.iter().filter(|&&c| c == classification).count()
    }

    /// `(offset, classification)` for every offset swept.
    pub fn entries(&self) -> impl Iterator<Item = (u64, Classification)> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .map(|(offset, &c)| (offset as u64, c))
    }
}

/// Drives a parser through corrupted copies of a document.
pub struct Harness<P> {
    parser: P,
    options: SweepOptions,
}

impl<P: DocumentParser> Harness<P> {
    pub fn new(parser: P) -> Self {
        Self::with_options(parser, SweepOptions::default())
    }

    pub fn with_options(parser: P, options: SweepOptions) -> Self {
        Self { parser, options }
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    pub fn options(&self) -> &SweepOptions {
        &self.options
    }

    /// Parses a fresh read of `source` with the bit at `offset` flipped.
    ///
    /// Parser failures, including panics, come back as part of the
    /// [`Attempt`]; only failing to open `source` is an error.
    pub fn attempt(
        &self,
        source: &dyn ByteSource,
        offset: Option<u64>,
    ) -> Result<Attempt, HarnessError> {
        let input = source.open().map_err(|error| HarnessError::Source {
            name: source.describe(),
            error,
        })?;
        let mut reader = CorruptingReader::with_offset(input, offset);
        let result = {
            let _scope = AttemptScope::enter();
            panic::catch_unwind(AssertUnwindSafe(|| self.parser.parse(&mut reader)))
        };
        drop(reader);

        let (classification, detail) = classify(&result);
        match classification {
            Classification::Unhandled => warn!(
                source = %source.describe(),
                offset = ?offset,
                fault = detail.as_deref().unwrap_or_default(),
                "flipped bit caused an unhandled fault"
            ),
            _ => debug!(offset = ?offset, %classification, "attempt finished"),
        }
        Ok(Attempt {
            offset,
            classification,
            detail,
        })
    }

    /// Checks that the uncorrupted document parses cleanly.
    pub fn baseline(&self, source: &dyn ByteSource) -> Result<Attempt, HarnessError> {
        let attempt = self.attempt(source, None)?;
        if attempt.classification != Classification::Clean {
            return Err(HarnessError::Baseline {
                name: source.describe(),
                classification: attempt.classification,
                detail: attempt.detail,
            });
        }
        Ok(attempt)
    }

    /// Runs `attempt` again and tells whether it classifies the same way.
    pub fn reproduce(
        &self,
        source: &dyn ByteSource,
        attempt: &Attempt,
    ) -> Result<bool, HarnessError> {
        let again = self.attempt(source, attempt.offset)?;
        Ok(again.classification == attempt.classification)
    }

    /// Sweeps every bit of `source`.
    pub fn sweep(&self, source: &dyn ByteSource) -> Result<SweepReport, HarnessError> {
        let len = source.len().map_err(|error| HarnessError::Source {
            name: source.describe(),
            error,
        })?;
        self.sweep_len(source, len)
    }

    /// Sweeps the first `len` bytes of `source`, i.e. offsets `0..len * 8`.
    ///
    /// Fails with [`HarnessError::Baseline`] before touching any offset if the
    /// uncorrupted document does not parse cleanly.
    pub fn sweep_len(
        &self,
        source: &dyn ByteSource,
        len: u64,
    ) -> Result<SweepReport, HarnessError> {
        let started = Instant::now();
        if self.options.max_unhandled == Some(0) {
            return Err(HarnessError::ZeroUnhandledLimit);
        }
        self.baseline(source)?;

        let bits = len.saturating_mul(8);
        let name = source.describe();
        info!(source = %name, bits, "sweeping bit flips");

        let pool = match self.options.jobs {
            Some(jobs) => Some(rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?),
            None => None,
        };
        let progress = self.progress_bar(bits);

        let mut outcomes = Vec::new();
        let mut unhandled = Vec::new();
        let mut stopped_early = false;
        let mut next = 0;

        'partitions: while next < bits {
            let end = bits.min(next + PARTITION);
            let offsets: Vec<u64> = (next..end).collect();
            let run = |offset: &u64| {
                let attempt = self.attempt(source, Some(*offset));
                progress.inc(1);
                attempt
            };
            let attempts = match &pool {
                Some(pool) => pool.install(|| {
                    offsets
                        .par_iter()
                        .map(run)
                        .collect::<Result<Vec<_>, _>>()
                })?,
                None => offsets.iter().map(run).collect::<Result<Vec<_>, _>>()?,
            };

            for attempt in attempts {
                outcomes.push(attempt.classification);
                if attempt.classification == Classification::Unhandled {
                    unhandled.push(attempt);
                    if self.options.max_unhandled.is_some_and(|max| unhandled.len() >= max) {
                        stopped_early = true;
                        break 'partitions;
                    }
                }
            }
            next = end;
        }
        progress.finish_and_clear();

        let report = SweepReport {
            source: name,
            bits,
            outcomes,
            unhandled,
            stopped_early,
            elapsed: started.elapsed(),
        };
        info!(
            source = %report.source,
            clean = report.count(Classification::Clean),
            recovered = report.count(Classification::Recovered),
            unhandled = report.unhandled.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "sweep finished"
        );
        Ok(report)
    }

    /// Closes the parser and gives it back.
    pub fn close(self) -> P {
        self.parser.close();
        self.parser
    }

    fn progress_bar(&self, bits: u64) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(bits);
        pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} bits ({eta})",
        ) {
            pb.set_style(style);
        }
        pb
    }
}

//! Process-isolated parser.
//!
//! [`ForkedParser`] streams each document into a child process and reads the
//! extracted text back from its stdout. A crash in the child cannot take the
//! harness down with it, and a hung child is killed once its time budget runs
//! out.
//!
//! # Child protocol
//!
//! - stdin: the (possibly corrupted) document
//! - stdout: extracted text
//! - exit code 0: success
//! - exit code in [`ForkedOptions::recognized_exit_codes`]: declared failure,
//!   reported as [`ParseError::Io`] for [`EXIT_IO`] and [`ParseError::Format`]
//!   otherwise, carrying the child's stderr
//! - anything else (other exit codes, death by signal): undeclared fault
//!
//! At most [`ForkedOptions::pool_size`] children run at once; further callers
//! block until a slot frees up.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::parser::{DocumentParser, ParseError, DEFAULT_MAX_OUTPUT};

/// Exit code a child uses for malformed input (`EX_DATAERR`).
pub const EXIT_FORMAT: i32 = 65;

/// Exit code a child uses for I/O failures (`EX_IOERR`).
pub const EXIT_IO: i32 = 74;

/// Default number of concurrent children.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// How often a running child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Settings for [`ForkedParser`].
#[derive(Debug, Clone)]
pub struct ForkedOptions {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub pool_size: usize,
    /// Per-document time budget. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Bytes of stdout kept as extracted text; the rest is discarded.
    pub max_output: usize,
    pub recognized_exit_codes: Vec<i32>,
}

impl ForkedOptions {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            pool_size: DEFAULT_POOL_SIZE,
            timeout: None,
            max_output: DEFAULT_MAX_OUTPUT,
            recognized_exit_codes: vec![EXIT_FORMAT, EXIT_IO],
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Runs every parse in a fresh child process.
pub struct ForkedParser {
    options: ForkedOptions,
    slots: Receiver<()>,
    release: Sender<()>,
    closed: AtomicBool,
}

impl ForkedParser {
    pub fn new(options: ForkedOptions) -> Self {
        let size = options.pool_size.max(1);
        let (release, slots) = bounded(size);
        for _ in 0..size {
            // Cannot fail: the channel has exactly `size` free places.
            let _ = release.send(());
        }
        Self {
            options,
            slots,
            release,
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ForkedOptions {
        &self.options
    }

    fn acquire(&self) -> anyhow::Result<Slot<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("forked parser is closed"));
        }
        self.slots
            .recv()
            .context("forked parser pool disconnected")?;
        Ok(Slot {
            release: &self.release,
        })
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let mut command = Command::new(&self.options.program);
        command
            .args(&self.options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Group leader, so `kill_group` also reaches anything it starts.
            command.process_group(0);
        }
        command
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn parser process {:?}",
                    self.options.program
                )
            })
    }

    /// Waits for `child`, killing it if the time budget runs out.
    ///
    /// Returns `None` on timeout.
    fn wait(&self, child: &mut Child, started: Instant) -> io::Result<Option<ExitStatus>> {
        let Some(timeout) = self.options.timeout else {
            return child.wait().map(Some);
        };
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if started.elapsed() >= timeout {
                kill_group(child);
                child.wait()?;
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl DocumentParser for ForkedParser {
    fn parse(&self, input: &mut (dyn Read + Send)) -> anyhow::Result<String> {
        let _slot = self.acquire()?;
        let started = Instant::now();
        let mut child = self.spawn()?;

        let stdin = child.stdin.take().context("child stdin not captured")?;
        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().context("child stderr not captured")?;
        let max_output = self.options.max_output as u64;

        let (feed, out, err, status) = thread::scope(|s| {
            let feeder = s.spawn(move || feed_child(input, stdin));
            let out_reader = s.spawn(move || drain(stdout, max_output));
            let err_reader = s.spawn(move || drain(stderr, 64 * 1024));

            let status = self.wait(&mut child, started);
            // Leftover processes from the child's group would keep the pipes
            // open and the drain threads waiting.
            kill_group(&mut child);
            (
                join(feeder.join()),
                join(out_reader.join()),
                join(err_reader.join()),
                status,
            )
        });

        let status = status.context("failed to wait for parser process")?;
        let feed = feed?;
        let out = out.context("failed to read parser output")?;
        let err = err.unwrap_or_default();

        let Some(status) = status else {
            return Err(ParseError::Timeout(self.options.timeout.unwrap_or_default()).into());
        };
        if let Feed::SourceFailed(e) = feed {
            return Err(ParseError::Io(e).into());
        }

        let stderr_text = String::from_utf8_lossy(&err).trim().to_string();
        if status.success() {
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        match status.code() {
            Some(code) if self.options.recognized_exit_codes.contains(&code) => {
                if code == EXIT_IO {
                    Err(ParseError::Io(io::Error::other(stderr_text)).into())
                } else {
                    Err(ParseError::Format(stderr_text).into())
                }
            }
            _ => Err(anyhow!(
                "parser process {:?} failed ({}): {}",
                self.options.program,
                status,
                stderr_text
            )),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A claimed pool slot, handed back on drop.
struct Slot<'a> {
    release: &'a Sender<()>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let _ = self.release.send(());
    }
}

enum Feed {
    Done,
    /// The child stopped reading before the input ran out.
    ChildClosed,
    SourceFailed(io::Error),
}

/// Kills `child` together with every process in its group.
#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: `pgid` is the group `spawn` created for this child. Signalling
    // a group that has already emptied out fails with ESRCH and does nothing.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    // The child may exit on its own between the poll and the kill.
    let _ = child.kill();
}

/// Copies the whole input into the child's stdin, then closes it.
fn feed_child(input: &mut (dyn Read + Send), mut stdin: ChildStdin) -> io::Result<Feed> {
    let mut buf = [0u8; 8192];
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => return Ok(Feed::Done),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Ok(Feed::SourceFailed(e)),
        };
        match stdin.write_all(&buf[..n]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(Feed::ChildClosed),
            Err(e) => return Err(e),
        }
    }
}

/// Reads a pipe to the end, keeping at most `limit` bytes.
fn drain<R: Read>(mut pipe: R, limit: u64) -> io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    (&mut pipe).take(limit).read_to_end(&mut kept)?;
    io::copy(&mut pipe, &mut io::sink())?;
    Ok(kept)
}

fn join<T>(result: thread::Result<io::Result<T>>) -> io::Result<T> {
    result.unwrap_or_else(|_| Err(io::Error::other("pipe thread panicked")))
}

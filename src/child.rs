//! Child process handles used by the supervisor
//!
//! [`ChildProcess`] is the narrow capability the supervisor needs from a
//! running process: liveness, bounded waiting, and signals. [`OsSpawner`]
//! backs it with a real `tokio::process::Child` whose stdout and stderr are
//! captured into one shared buffer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Most recent bytes of child output kept for diagnostics
pub const OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// How long to wait for the output readers after the child has exited
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Program and arguments used to launch a child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Signals the supervisor can send to a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful stop request (SIGTERM)
    Terminate,
    /// Forceful stop (SIGKILL)
    Kill,
}

/// Exit information collected from a child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, `None` when the child was ended by a signal
    pub code: Option<i32>,
    /// Combined stdout and stderr captured so far
    pub output: String,
}

/// A running child process
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Non-blocking check whether the child has exited
    fn has_exited(&mut self) -> bool;

    /// Wait up to `timeout` for the child to exit.
    ///
    /// Returns `None` if it is still running when the timeout elapses.
    async fn collect(&mut self, timeout: Duration) -> Option<ExitReport>;

    /// Deliver a signal without waiting for its effect
    fn signal(&mut self, signal: Signal) -> io::Result<()>;
}

/// Launches child processes
pub trait Spawner: Send + Sync {
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn ChildProcess>>;
}

/// Bounded buffer shared by the stdout and stderr readers
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<VecDeque<u8>>>,
    limit: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            limit,
        }
    }

    /// Append bytes, discarding the oldest ones beyond the limit
    pub fn push(&self, bytes: &[u8]) {
        let mut buf = self.inner.lock();
        buf.extend(bytes);
        if buf.len() > self.limit {
            let excess = buf.len() - self.limit;
            buf.drain(..excess);
        }
    }

    pub fn snapshot(&self) -> String {
        let mut buf = self.inner.lock();
        String::from_utf8_lossy(buf.make_contiguous()).into_owned()
    }
}

/// Spawns real OS processes through `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSpawner;

impl Spawner for OsSpawner {
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn ChildProcess>> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(program = %invocation.program, ?pid, "Child process spawned");

        let output = OutputBuffer::new(OUTPUT_LIMIT_BYTES);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(stdout, output.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(stderr, output.clone())));
        }

        Ok(Box::new(OsChild {
            child,
            output,
            readers,
        }))
    }
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, output: OutputBuffer) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => output.push(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Child output stream closed with error");
                break;
            }
        }
    }
}

/// Child process spawned by [`OsSpawner`]
pub struct OsChild {
    child: Child,
    output: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
}

impl OsChild {
    async fn drain_readers(&mut self) {
        // A grandchild may still hold the pipes open, so never wait for EOF unbounded
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Output reader still busy after child exit");
            }
        }
    }
}

#[async_trait]
impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        exited_from_poll(self.child.try_wait())
    }

    async fn collect(&mut self, timeout: Duration) -> Option<ExitReport> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.drain_readers().await;
                Some(ExitReport {
                    code: status.code(),
                    output: self.output.snapshot(),
                })
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for child to exit");
                None
            }
            Err(_) => None,
        }
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        match signal {
            Signal::Terminate => terminate(&mut self.child),
            Signal::Kill => self.child.start_kill(),
        }
    }
}

/// A child whose status cannot be polled counts as gone, so the caller
/// moves it into shutdown where exit is confirmed by waiting
fn exited_from_poll(poll: io::Result<Option<ExitStatus>>) -> bool {
    match poll {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "Failed to poll child status, treating it as exited");
            true
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    // Already reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

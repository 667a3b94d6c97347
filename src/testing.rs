//! In-memory doubles for child processes, proxy flavors and probes

use crate::child::{ChildProcess, ExitReport, Invocation, Signal, Spawner};
use crate::error::ProbeError;
use crate::healthcheck::HealthProbe;
use crate::process::{ProxyFlavor, ProxyOptions};
use crate::target::Target;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a fake child reacts to signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    ExitsImmediately,
    RunsUntilTerminate,
    IgnoresTerminate,
    NeverExits,
    /// Status polling fails, but the process runs until signalled
    Unpollable,
}

#[derive(Debug, Clone, Default)]
pub struct ChildLog {
    pub signals: Vec<Signal>,
    pub collects: usize,
    pub exited: bool,
}

pub struct FakeChild {
    pid: u32,
    behavior: Behavior,
    log: Arc<Mutex<ChildLog>>,
}

impl FakeChild {
    fn exited(&self) -> bool {
        self.behavior == Behavior::ExitsImmediately || self.log.lock().exited
    }
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.behavior == Behavior::Unpollable || self.exited()
    }

    async fn collect(&mut self, timeout: Duration) -> Option<ExitReport> {
        self.log.lock().collects += 1;
        if self.exited() {
            return Some(ExitReport {
                code: Some(0),
                output: "fake proxy output".to_string(),
            });
        }
        tokio::time::sleep(timeout).await;
        None
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        let mut log = self.log.lock();
        log.signals.push(signal);
        match (self.behavior, signal) {
            (Behavior::RunsUntilTerminate | Behavior::Unpollable, _)
            | (Behavior::IgnoresTerminate, Signal::Kill) => {
                log.exited = true;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Spawns [`FakeChild`]ren and remembers every invocation
pub struct FakeSpawner {
    behavior: Box<dyn Fn(&Invocation) -> Behavior + Send + Sync>,
    fail: bool,
    spawned: Mutex<Vec<(Invocation, Arc<Mutex<ChildLog>>)>>,
}

impl FakeSpawner {
    pub fn new(behavior: Behavior) -> Self {
        Self::with(move |_| behavior)
    }

    pub fn with(behavior: impl Fn(&Invocation) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            behavior: Box::new(behavior),
            fail: false,
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Behavior::NeverExits)
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.spawned.lock().iter().map(|(inv, _)| inv.clone()).collect()
    }

    pub fn child_log(&self, index: usize) -> ChildLog {
        self.spawned.lock()[index].1.lock().clone()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, invocation: &Invocation) -> io::Result<Box<dyn ChildProcess>> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
        }
        let log = Arc::new(Mutex::new(ChildLog::default()));
        let mut spawned = self.spawned.lock();
        spawned.push((invocation.clone(), Arc::clone(&log)));
        Ok(Box::new(FakeChild {
            pid: 1000 + spawned.len() as u32,
            behavior: (self.behavior)(invocation),
            log,
        }))
    }
}

/// Flavor whose readiness is decided per target host
pub struct FakeFlavor {
    ready_hosts: Option<HashSet<String>>,
    checks: AtomicU32,
}

impl FakeFlavor {
    pub fn always_ready() -> Self {
        Self {
            ready_hosts: None,
            checks: AtomicU32::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self::ready_for(&[])
    }

    pub fn ready_for(hosts: &[&str]) -> Self {
        Self {
            ready_hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
            checks: AtomicU32::new(0),
        }
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyFlavor for FakeFlavor {
    fn invocation(&self, target: &Target, options: &ProxyOptions) -> Invocation {
        let mut invocation = Invocation::new("fake-proxy").arg(target.to_string());
        if let Some(cacert) = &options.cacert {
            invocation = invocation.arg(cacert.display().to_string());
        }
        invocation
    }

    async fn is_ready(&self, target: &Target) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.ready_hosts
            .as_ref()
            .map_or(true, |hosts| hosts.contains(&target.host))
    }

    fn listen_addr(&self) -> &str {
        "127.0.0.1:8083"
    }
}

/// Probe that replays scripted verdicts, then repeats the last one
pub struct FakeProbe {
    verdicts: Mutex<Vec<Result<bool, ()>>>,
    probed: Mutex<Vec<Target>>,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self::scripted(vec![Ok(true)])
    }

    /// `Err(())` stands for a network failure
    pub fn scripted(verdicts: Vec<Result<bool, ()>>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts),
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn probed(&self) -> Vec<Target> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check(&self, target: &Target) -> Result<bool, ProbeError> {
        self.probed.lock().push(target.clone());
        let mut verdicts = self.verdicts.lock();
        let verdict = if verdicts.len() > 1 {
            verdicts.remove(0)
        } else {
            verdicts.first().copied().unwrap_or(Ok(true))
        };
        verdict.map_err(|_| ProbeError::Setup("scripted network failure".to_string()))
    }
}

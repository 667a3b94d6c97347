use crate::child::{ChildProcess, ExitReport, Invocation, Signal, Spawner};
use crate::error::{Error, Result};
use crate::target::Target;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a supervised proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Constructed, nothing spawned yet
    Idle,
    /// Process spawned, readiness not yet confirmed
    Starting,
    /// Proxy accepts connections, no health verdict yet
    Ready,
    /// Proxy ready and the last health probe passed
    Running,
    /// Proxy ready but the last health probe failed
    Degraded,
    /// Shutdown escalation in progress
    ShuttingDown,
    /// Process confirmed exited
    Stopped,
}

/// Options passed through to the proxy invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    /// CA bundle the proxy should trust when connecting to the target
    pub cacert: Option<PathBuf>,
    /// Run without a client certificate
    pub disable_authentication: bool,
    /// Extra arguments appended verbatim
    pub extra_args: Vec<String>,
}

/// The proxy-specific half of supervision.
///
/// The supervisor owns spawning, liveness and shutdown; a flavor only
/// knows how to invoke its proxy and how to tell when it is listening.
#[async_trait]
pub trait ProxyFlavor: Send + Sync {
    /// Command line that points the proxy at `target`
    fn invocation(&self, target: &Target, options: &ProxyOptions) -> Invocation;

    /// Whether the proxy started for `target` accepts connections
    async fn is_ready(&self, target: &Target) -> bool;

    /// Local address clients should connect to
    fn listen_addr(&self) -> &str;
}

/// One step of shutdown escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStep {
    /// Wait for an exit that is already underway
    Observe,
    /// SIGTERM, then wait
    Terminate,
    /// SIGKILL, then wait
    Kill,
}

impl EscalationStep {
    fn signal(self) -> Option<Signal> {
        match self {
            EscalationStep::Observe => None,
            EscalationStep::Terminate => Some(Signal::Terminate),
            EscalationStep::Kill => Some(Signal::Kill),
        }
    }
}

/// Ordered escalation steps, each bounded by its own timeout
pub fn escalation_plan(step_timeout: Duration) -> [(EscalationStep, Duration); 3] {
    [
        (EscalationStep::Observe, step_timeout),
        (EscalationStep::Terminate, step_timeout),
        (EscalationStep::Kill, step_timeout),
    ]
}

/// Outcome of a completed shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Step at which the process was confirmed exited
    pub step: EscalationStep,
    /// Signals delivered, in order
    pub signals_sent: Vec<Signal>,
    pub exit: ExitReport,
}

/// Owns a single proxy process from spawn to confirmed exit
pub struct ProcessSupervisor {
    flavor: Arc<dyn ProxyFlavor>,
    spawner: Arc<dyn Spawner>,
    target: Option<Target>,
    child: Option<Box<dyn ChildProcess>>,
    state: SupervisorState,
}

impl ProcessSupervisor {
    pub fn new(flavor: Arc<dyn ProxyFlavor>, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            flavor,
            spawner,
            target: None,
            child: None,
            state: SupervisorState::Idle,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// OS process id of the proxy, while it is owned
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Spawn the proxy against `target`. Does not wait for readiness.
    pub fn start(&mut self, target: &Target, options: &ProxyOptions) -> Result<()> {
        if self.state != SupervisorState::Idle {
            return Err(Error::AlreadyStarted);
        }

        let invocation = self.flavor.invocation(target, options);
        info!(
            upstream = %target,
            program = %invocation.program,
            args = ?invocation.args,
            "Starting proxy"
        );

        let child = self.spawner.spawn(&invocation).map_err(|source| {
            self.state = SupervisorState::Stopped;
            Error::Spawn {
                program: invocation.program.clone(),
                source,
            }
        })?;

        info!(upstream = %target, pid = ?child.id(), "Proxy spawned");
        self.child = Some(child);
        self.target = Some(target.clone());
        self.state = SupervisorState::Starting;
        Ok(())
    }

    /// Poll the flavor's readiness check up to `max_attempts` times.
    ///
    /// Sleeps `poll_interval` after every failed check, so a timeout takes
    /// `max_attempts * poll_interval`. On timeout the process is left
    /// running; the caller decides whether to shut it down.
    pub async fn wait_until_ready(&mut self, max_attempts: u32, poll_interval: Duration) -> Result<()> {
        match self.state {
            SupervisorState::Starting => {}
            SupervisorState::Ready | SupervisorState::Running | SupervisorState::Degraded => {
                return Ok(())
            }
            _ => return Err(Error::NotStarted),
        }

        let flavor = Arc::clone(&self.flavor);
        let (Some(child), Some(target)) = (self.child.as_mut(), self.target.as_ref()) else {
            return Err(Error::NotStarted);
        };

        for attempt in 1..=max_attempts {
            if child.has_exited() {
                warn!(upstream = %target, attempt, "Proxy exited before becoming ready");
                return Err(Error::ExitedBeforeReady);
            }

            if flavor.is_ready(target).await {
                info!(upstream = %target, attempt, listen = flavor.listen_addr(), "Proxy is ready");
                self.state = SupervisorState::Ready;
                return Ok(());
            }

            debug!(upstream = %target, attempt, max_attempts, "Proxy not ready yet");
            tokio::time::sleep(poll_interval).await;
        }

        warn!(upstream = %target, attempts = max_attempts, "Proxy failed to start after several checks");
        Err(Error::ReadinessTimeout {
            attempts: max_attempts,
        })
    }

    /// Non-blocking liveness check; false once the child has exited or was never started
    pub fn is_alive(&mut self) -> bool {
        self.child.as_mut().is_some_and(|child| !child.has_exited())
    }

    /// Record a health probe verdict for a ready proxy
    pub fn record_health(&mut self, healthy: bool) {
        self.state = match (self.state, healthy) {
            (SupervisorState::Ready | SupervisorState::Degraded, true) => {
                if self.state == SupervisorState::Degraded {
                    info!(upstream = ?self.target, "Proxy recovered");
                }
                SupervisorState::Running
            }
            (SupervisorState::Ready | SupervisorState::Running, false) => SupervisorState::Degraded,
            (state, _) => state,
        };
    }

    /// Stop the proxy, escalating from waiting to SIGTERM to SIGKILL.
    ///
    /// Each step gets `step_timeout`. Returns `Ok(None)` when there was
    /// nothing to stop, including repeated calls. Fails with
    /// [`Error::ProcessLeak`] if the process survives SIGKILL.
    pub async fn shutdown(&mut self, step_timeout: Duration) -> Result<Option<ShutdownReport>> {
        info!(upstream = ?self.target, "Shutting down proxy...");

        let Some(mut child) = self.child.take() else {
            info!("Proxy was never started or is already stopped, doing nothing");
            if self.state != SupervisorState::Idle {
                self.state = SupervisorState::Stopped;
            }
            return Ok(None);
        };

        self.state = SupervisorState::ShuttingDown;
        let pid = child.id();
        let mut signals_sent = Vec::new();

        for (step, timeout) in escalation_plan(step_timeout) {
            if let Some(signal) = step.signal() {
                if step == EscalationStep::Kill {
                    warn!(?pid, "Killing proxy...");
                } else {
                    info!(?pid, ?signal, "Signalling proxy...");
                }
                signals_sent.push(signal);
                if let Err(e) = child.signal(signal) {
                    warn!(?pid, ?signal, error = %e, "Failed to signal proxy");
                }
            } else {
                info!(?pid, "Checking if proxy is already stopped...");
            }

            match child.collect(timeout).await {
                Some(exit) => {
                    info!(?pid, ?step, code = ?exit.code, "Proxy stopped");
                    info!(output = %exit.output, "Proxy output was");
                    self.state = SupervisorState::Stopped;
                    return Ok(Some(ShutdownReport {
                        step,
                        signals_sent,
                        exit,
                    }));
                }
                None => {
                    debug!(?pid, ?step, timeout_ms = timeout.as_millis(), "Proxy still running after step");
                }
            }
        }

        error!(?pid, "Proxy is still running, something was likely leaked");
        // Keep ownership so a later retry or the drop guard can try again
        self.child = Some(child);
        Err(Error::ProcessLeak { pid })
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if !child.has_exited() {
                warn!(pid = ?child.id(), "Supervisor dropped with live proxy, killing it");
                if let Err(e) = child.signal(Signal::Kill) {
                    error!(pid = ?child.id(), error = %e, "Failed to kill proxy on drop");
                }
            }
        }
    }
}

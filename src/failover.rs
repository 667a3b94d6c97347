//! The failover control loop
//!
//! One target at a time: pick it, start a proxy against it, wait for
//! readiness, then probe until the probe fails or the proxy dies. Every
//! proxy is fully shut down before the next target is picked.

use crate::child::Spawner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::healthcheck::HealthProbe;
use crate::process::{ProcessSupervisor, ProxyFlavor, ProxyOptions, SupervisorState};
use crate::target::{FileTargetSource, Target, TargetRotator, TargetSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Timing and proxy options for the loop
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub options: ProxyOptions,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    pub step_timeout: Duration,
    pub health_interval: Duration,
    pub unhealthy_threshold: u32,
    pub spam_protection: Duration,
}

impl FailoverSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            options: ProxyOptions {
                cacert: config.proxy.cacert.clone(),
                disable_authentication: config.proxy.disable_authentication,
                extra_args: config.proxy.extra_args()?,
            },
            readiness_attempts: config.readiness.max_attempts,
            readiness_interval: config.readiness.poll_interval(),
            step_timeout: config.shutdown.step_timeout(),
            health_interval: config.health.interval(),
            unhealthy_threshold: config.health.unhealthy_threshold,
            spam_protection: config.failover.spam_protection(),
        })
    }
}

/// Snapshot of what the loop is doing, published on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub target: Option<Target>,
    pub state: SupervisorState,
    pub pid: Option<u32>,
    /// Number of targets picked so far
    pub rotations: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            target: None,
            state: SupervisorState::Idle,
            pid: None,
            rotations: 0,
        }
    }
}

/// Why supervision of one target ended
enum Outcome {
    /// Readiness, liveness or health failed; rotate
    TargetFailed,
    /// A stop was requested
    Stopped,
    /// Unrecoverable; abort the loop
    Fatal(Error),
}

/// Supervises one proxy at a time, rotating targets on failure
pub struct FailoverLoop<S = FileTargetSource> {
    rotator: TargetRotator<S>,
    flavor: Arc<dyn ProxyFlavor>,
    spawner: Arc<dyn Spawner>,
    probe: Arc<dyn HealthProbe>,
    settings: FailoverSettings,
    shutdown_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<LoopStatus>,
}

impl<S: TargetSource> FailoverLoop<S> {
    pub fn new(
        rotator: TargetRotator<S>,
        flavor: Arc<dyn ProxyFlavor>,
        spawner: Arc<dyn Spawner>,
        probe: Arc<dyn HealthProbe>,
        settings: FailoverSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (status_tx, _) = watch::channel(LoopStatus::default());
        Self {
            rotator,
            flavor,
            spawner,
            probe,
            settings,
            shutdown_rx,
            status_tx,
        }
    }

    /// Subscribe to loop status updates
    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status_tx.subscribe()
    }

    /// Run until a stop is requested or a fatal error occurs.
    ///
    /// Returns `Ok(())` only after a requested stop, with the active proxy
    /// shut down. Configuration errors and process leaks are returned as-is.
    pub async fn run(mut self) -> Result<()> {
        info!(
            readiness_attempts = self.settings.readiness_attempts,
            health_interval_secs = self.settings.health_interval.as_secs(),
            "Failover loop started"
        );
        let mut rotations = 0u64;

        while !*self.shutdown_rx.borrow() {
            let target = self.rotator.pick_next()?;
            rotations += 1;
            info!(upstream = %target, rotations, "Picked new target");

            let mut supervisor =
                ProcessSupervisor::new(Arc::clone(&self.flavor), Arc::clone(&self.spawner));
            let outcome = self.supervise(&mut supervisor, &target, rotations).await;

            // The proxy is reset no matter why supervision ended
            let shutdown = supervisor.shutdown(self.settings.step_timeout).await;
            self.publish(&supervisor, rotations);
            if let Err(e) = shutdown {
                error!(upstream = %target, error = %e, "Cannot continue with an unaccounted proxy");
                return Err(e);
            }

            match outcome {
                Outcome::Stopped => break,
                Outcome::Fatal(e) => {
                    error!(upstream = %target, error = %e, "Fatal error while supervising proxy");
                    return Err(e);
                }
                Outcome::TargetFailed => {}
            }

            info!(
                delay_secs = self.settings.spam_protection.as_secs(),
                "Spam protection - waiting before picking a new target"
            );
            if self.sleep_or_stop(self.settings.spam_protection).await {
                break;
            }
        }

        info!("Failover loop stopped");
        Ok(())
    }

    async fn supervise(
        &self,
        supervisor: &mut ProcessSupervisor,
        target: &Target,
        rotations: u64,
    ) -> Outcome {
        if let Err(e) = supervisor.start(target, &self.settings.options) {
            return Outcome::Fatal(e);
        }
        self.publish(supervisor, rotations);

        let mut shutdown_rx = self.shutdown_rx.clone();
        let ready = tokio::select! {
            result = supervisor.wait_until_ready(
                self.settings.readiness_attempts,
                self.settings.readiness_interval,
            ) => result,
            _ = stop_requested(&mut shutdown_rx) => return Outcome::Stopped,
        };
        match ready {
            Ok(()) => self.publish(supervisor, rotations),
            Err(e) if e.is_fatal() => return Outcome::Fatal(e),
            Err(e) => {
                warn!(upstream = %target, error = %e, "Proxy never became ready, will switch target");
                return Outcome::TargetFailed;
            }
        }

        let mut consecutive_failures = 0u32;
        loop {
            if !supervisor.is_alive() {
                warn!(upstream = %target, "Proxy not alive, there is an issue with this target. Changing target.");
                return Outcome::TargetFailed;
            }

            let healthy = tokio::select! {
                result = self.probe.check(target) => match result {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        warn!(upstream = %target, error = %e, "Health check failed with error");
                        false
                    }
                },
                _ = stop_requested(&mut shutdown_rx) => return Outcome::Stopped,
            };
            supervisor.record_health(healthy);
            self.publish(supervisor, rotations);

            if healthy {
                consecutive_failures = 0;
                debug!(upstream = %target, "Nothing to do, sleeping");
            } else {
                consecutive_failures += 1;
                warn!(
                    upstream = %target,
                    failures = consecutive_failures,
                    threshold = self.settings.unhealthy_threshold,
                    "Health check failed"
                );
                if consecutive_failures >= self.settings.unhealthy_threshold {
                    return Outcome::TargetFailed;
                }
            }

            if self.sleep_or_stop(self.settings.health_interval).await {
                return Outcome::Stopped;
            }
        }
    }

    /// Sleep for `duration`; true if a stop was requested meanwhile
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = stop_requested(&mut shutdown_rx) => true,
        }
    }

    fn publish(&self, supervisor: &ProcessSupervisor, rotations: u64) {
        self.status_tx.send_replace(LoopStatus {
            target: supervisor.target().cloned(),
            state: supervisor.state(),
            pid: supervisor.pid(),
            rotations,
        });
    }
}

/// Resolves once the stop flag is set; never resolves if the sender is gone
async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

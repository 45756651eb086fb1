//! Lifecycle owner of the backend service process.
//!
//! All handle mutations go through [`ServiceHandle::transition`] while the
//! handle lock is held; everything else reads the published [`ServiceStatus`].
//! Exits are reported asynchronously by a per-instance monitor task and
//! folded into the state machine by a single watchdog task, which also runs
//! the restart loop.

use crate::port;
use crate::probe::{HttpProber, ReadinessProbe, HEALTH_PATH};
use crate::process::{DataPaths, ExitInfo, LaunchSpec, Launcher, ServiceProcess, TokioLauncher};
use parking_lot::Mutex;
use shared::error::ServiceError;
use shared::settings::ServiceLaunchSettings;
use shared::status::{ServiceState, ServiceStatus};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Upper bound for the restart delay when backoff is enabled.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(300);

/// Supervision policy.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub preferred_port: u16,
    pub port_span: u16,
    pub restart_delay: Duration,
    /// `None` keeps restarting forever.
    pub max_restarts: Option<u32>,
    pub backoff_factor: f64,
    pub shutdown_grace: Duration,
}

impl From<&ServiceLaunchSettings> for SupervisorConfig {
    fn from(s: &ServiceLaunchSettings) -> Self {
        Self {
            preferred_port: s.preferred_port,
            port_span: s.port_span,
            restart_delay: s.restart_delay(),
            max_restarts: s.max_restarts,
            backoff_factor: s.backoff_factor,
            shutdown_grace: s.shutdown_grace(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&ServiceLaunchSettings::default())
    }
}

type ExitOutcome = Result<ExitInfo, String>;

/// Messages from monitors and failed starts to the watchdog.
#[derive(Debug)]
enum Notice {
    Exited { generation: u64, outcome: ExitOutcome },
    StartFailed { generation: u64 },
}

/// Dropping this terminates the child.
struct ChildControl {
    terminate: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// The supervised process and its bookkeeping.
struct ServiceHandle {
    state: ServiceState,
    port: Option<u16>,
    pid: Option<u32>,
    child: Option<ChildControl>,
    restart_count: u32,
    /// Failures since the service was last Ready; drives the cap and backoff.
    consecutive_failures: u32,
    /// Bumped by every start attempt and by stop. Stale notices and
    /// pending restarts compare against it.
    generation: u64,
    last_error: Option<String>,
}

impl ServiceHandle {
    fn new() -> Self {
        Self {
            state: ServiceState::NotStarted,
            port: None,
            pid: None,
            child: None,
            restart_count: 0,
            consecutive_failures: 0,
            generation: 0,
            last_error: None,
        }
    }

    fn transition(&mut self, next: ServiceState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::error!("Refusing service transition {} -> {}", self.state, next);
            return false;
        }
        tracing::info!("Service {} -> {}", self.state, next);
        self.state = next;
        true
    }

    fn snapshot(&self) -> ServiceStatus {
        let address = match (self.state, self.port) {
            (ServiceState::Ready, Some(port)) => Some(port::loopback(port)),
            _ => None,
        };
        ServiceStatus {
            state: self.state,
            address,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
        }
    }

    fn release_child(&mut self) -> Option<ChildControl> {
        self.port = None;
        self.pid = None;
        self.child.take()
    }
}

struct Inner {
    config: SupervisorConfig,
    spec_for_port: Box<dyn Fn(u16) -> LaunchSpec + Send + Sync>,
    launcher: Arc<dyn Launcher>,
    prober: Arc<dyn ReadinessProbe>,
    handle: Mutex<ServiceHandle>,
    /// Written only by `stop()`, checked first by the exit handler.
    expected_shutdown: AtomicBool,
    status_tx: watch::Sender<ServiceStatus>,
    /// Ticks on every `stop()`; wakes probes and restart delays.
    stop_tx: watch::Sender<u64>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<Notice>>>,
}

/// Starts, watches and restarts the backend. Cheap to clone; all clones share
/// one handle.
#[derive(Clone)]
pub struct ServiceSupervisor {
    inner: Arc<Inner>,
}

impl ServiceSupervisor {
    pub fn new(
        config: SupervisorConfig,
        spec_for_port: impl Fn(u16) -> LaunchSpec + Send + Sync + 'static,
        launcher: Arc<dyn Launcher>,
        prober: Arc<dyn ReadinessProbe>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ServiceStatus::default());
        let (stop_tx, _) = watch::channel(0u64);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                spec_for_port: Box::new(spec_for_port),
                launcher,
                prober,
                handle: Mutex::new(ServiceHandle::new()),
                expected_shutdown: AtomicBool::new(false),
                status_tx,
                stop_tx,
                notices_tx,
                notices_rx: Mutex::new(Some(notices_rx)),
            }),
        }
    }

    /// Supervisor for the real backend: tokio child processes probed over HTTP.
    pub fn for_backend(settings: &ServiceLaunchSettings, paths: DataPaths) -> Self {
        let launch_settings = settings.clone();
        let prober = HttpProber::new(settings.probe_interval(), settings.probe_attempts);
        Self::new(
            SupervisorConfig::from(settings),
            move |port| LaunchSpec::for_backend(&launch_settings, &paths, port),
            Arc::new(TokioLauncher),
            Arc::new(prober),
        )
    }

    // ---- read side -------------------------------------------------------

    pub fn status(&self) -> ServiceStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.handle.lock().state
    }

    /// Current address, only while Ready. Do not cache: restarts may move it.
    pub fn address(&self) -> Option<SocketAddr> {
        self.inner.handle.lock().snapshot().address
    }

    pub fn is_ready(&self) -> bool {
        self.address().is_some()
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.handle.lock().restart_count
    }

    /// Status updates, one per transition.
    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.inner.status_tx.subscribe()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Start the service and wait until it answers its health check.
    ///
    /// A failure leaves the handle `Crashed` with a restart scheduled, and
    /// is also returned here.
    pub async fn start(&self) -> Result<SocketAddr, ServiceError> {
        self.ensure_watchdog();
        let generation = {
            let mut h = self.inner.handle.lock();
            if h.state.is_active() || h.state == ServiceState::Restarting {
                return Err(ServiceError::AlreadyRunning(h.state));
            }
            self.inner.expected_shutdown.store(false, Ordering::SeqCst);
            h.generation += 1;
            h.consecutive_failures = 0;
            h.last_error = None;
            h.transition(ServiceState::Starting);
            self.publish(&h);
            h.generation
        };
        self.launch(generation).await
    }

    /// Terminate the service and disable restarts. Idempotent.
    pub async fn stop(&self) {
        self.inner.expected_shutdown.store(true, Ordering::SeqCst);
        let child = {
            let mut h = self.inner.handle.lock();
            h.generation += 1;
            h.restart_count = 0;
            h.consecutive_failures = 0;
            let child = h.release_child();
            if h.state != ServiceState::Stopped {
                h.transition(ServiceState::Stopped);
            }
            self.publish(&h);
            child
        };
        self.inner.stop_tx.send_modify(|ticks| *ticks += 1);

        if let Some(child) = child {
            let _ = child.terminate.send(());
            let budget = self.inner.config.shutdown_grace + Duration::from_secs(2);
            if tokio::time::timeout(budget, child.monitor).await.is_err() {
                tracing::error!("Service did not exit within {:?} of stop", budget);
            }
        }
    }

    fn publish(&self, h: &ServiceHandle) {
        self.inner.status_tx.send_replace(h.snapshot());
    }

    async fn launch(&self, generation: u64) -> Result<SocketAddr, ServiceError> {
        let result = self.try_launch(generation).await;
        if let Err(err) = &result {
            self.fail_start(generation, err);
        }
        result
    }

    async fn try_launch(&self, generation: u64) -> Result<SocketAddr, ServiceError> {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let config = &self.inner.config;

        let port = port::allocate(config.preferred_port, config.port_span)?;
        let spec = (self.inner.spec_for_port)(port);
        let process = self.inner.launcher.launch(&spec).map_err(|e| {
            ServiceError::StartFailed(format!("could not spawn {}: {}", spec.program, e))
        })?;
        let pid = process.id();

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (early_exit_tx, early_exit_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            process,
            terminate_rx,
            early_exit_tx,
            self.inner.notices_tx.clone(),
            generation,
            config.shutdown_grace,
        ));
        let child = ChildControl {
            terminate: terminate_tx,
            monitor,
        };

        {
            let mut h = self.inner.handle.lock();
            if h.generation != generation {
                // Stopped while spawning; dropping `child` terminates it.
                return Err(ServiceError::Stopped);
            }
            h.port = Some(port);
            h.pid = pid;
            h.child = Some(child);
            h.transition(ServiceState::Probing);
            self.publish(&h);
        }

        let addr = port::loopback(port);
        let ready = tokio::select! {
            ready = self.inner.prober.probe(addr) => ready,
            exit = early_exit_rx => {
                let reason = match exit {
                    Ok(Ok(info)) => info.to_string(),
                    Ok(Err(e)) => e,
                    Err(_) => "monitor lost".to_string(),
                };
                return Err(ServiceError::StartFailed(format!(
                    "service exited during startup ({})",
                    reason
                )));
            }
            _ = stop_rx.changed() => return Err(ServiceError::Stopped),
        };
        if !ready {
            return Err(ServiceError::StartFailed(format!(
                "no answer on {}{} within the probe budget",
                addr, HEALTH_PATH
            )));
        }

        let mut h = self.inner.handle.lock();
        if h.generation != generation {
            return Err(ServiceError::Stopped);
        }
        h.transition(ServiceState::Ready);
        h.consecutive_failures = 0;
        h.last_error = None;
        self.publish(&h);
        tracing::info!("Service ready on {} (pid {:?})", addr, h.pid);
        Ok(addr)
    }

    /// Tear down a half-started instance and hand the retry to the watchdog.
    fn fail_start(&self, generation: u64, err: &ServiceError) {
        let mut h = self.inner.handle.lock();
        if h.generation != generation || h.state == ServiceState::Stopped {
            return;
        }
        tracing::error!("Service start failed: {}", err);
        drop(h.release_child());
        h.consecutive_failures += 1;
        h.last_error = Some(err.to_string());
        h.transition(ServiceState::Crashed);
        self.publish(&h);
        let _ = self.inner.notices_tx.send(Notice::StartFailed { generation });
    }

    /// Returns the generation to restart if this exit was a crash.
    fn handle_exit(&self, generation: u64, outcome: ExitOutcome) -> Option<u64> {
        if self.inner.expected_shutdown.load(Ordering::SeqCst) {
            tracing::debug!("Service exit during shutdown: {:?}", outcome);
            return None;
        }
        let mut h = self.inner.handle.lock();
        if h.generation != generation || h.state != ServiceState::Ready {
            return None;
        }
        // Any exit while Ready is a crash; the exit code is informational only.
        let code = outcome.as_ref().ok().and_then(|info| info.code);
        tracing::warn!("Service exited unexpectedly: {:?}", outcome);
        h.release_child();
        h.consecutive_failures += 1;
        h.last_error = Some(ServiceError::Crashed { code }.to_string());
        h.transition(ServiceState::Crashed);
        self.publish(&h);
        Some(generation)
    }

    /// Delay before the next restart, or `None` if the restart is moot or
    /// the cap is exhausted (which moves the handle to `Failed`).
    fn next_restart_delay(&self, generation: u64) -> Option<Duration> {
        let config = &self.inner.config;
        let mut h = self.inner.handle.lock();
        if h.generation != generation || h.state != ServiceState::Crashed {
            return None;
        }
        if let Some(max) = config.max_restarts {
            if h.consecutive_failures > max {
                tracing::error!("Giving up after {} restart attempts", max);
                h.last_error = Some(format!(
                    "Service keeps failing; gave up after {} restarts",
                    max
                ));
                h.transition(ServiceState::Failed);
                self.publish(&h);
                return None;
            }
        }
        let exponent = h.consecutive_failures.saturating_sub(1).min(64) as i32;
        let secs = config.restart_delay.as_secs_f64() * config.backoff_factor.max(1.0).powi(exponent);
        Some(Duration::from_secs_f64(
            secs.min(MAX_RESTART_DELAY.as_secs_f64()),
        ))
    }

    async fn restart(&self, generation: u64) {
        let next = {
            let mut h = self.inner.handle.lock();
            if h.generation != generation || h.state != ServiceState::Crashed {
                return;
            }
            h.restart_count += 1;
            h.transition(ServiceState::Restarting);
            self.publish(&h);
            h.generation += 1;
            h.transition(ServiceState::Starting);
            self.publish(&h);
            h.generation
        };
        if let Err(e) = self.launch(next).await {
            tracing::warn!("Restart attempt failed: {}", e);
        }
    }

    fn ensure_watchdog(&self) {
        let Some(rx) = self.inner.notices_rx.lock().take() else {
            return;
        };
        tokio::spawn(watchdog(Arc::downgrade(&self.inner), rx));
    }
}

/// Owns one child: reports its exit, or terminates it on request (or when
/// the control sender is dropped).
async fn monitor(
    mut process: Box<dyn ServiceProcess>,
    mut terminate: oneshot::Receiver<()>,
    early_exit: oneshot::Sender<ExitOutcome>,
    notices: mpsc::UnboundedSender<Notice>,
    generation: u64,
    grace: Duration,
) {
    let outcome = tokio::select! {
        res = process.wait() => res,
        _ = &mut terminate => process.terminate(grace).await,
    };
    let outcome = outcome.map_err(|e| e.to_string());
    let _ = early_exit.send(outcome.clone());
    let _ = notices.send(Notice::Exited {
        generation,
        outcome,
    });
}

/// Serialises crash handling and the restart loop.
async fn watchdog(inner: Weak<Inner>, mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let supervisor = ServiceSupervisor { inner };

        let generation = match notice {
            Notice::Exited {
                generation,
                outcome,
            } => match supervisor.handle_exit(generation, outcome) {
                Some(generation) => generation,
                None => continue,
            },
            Notice::StartFailed { generation } => generation,
        };

        let Some(delay) = supervisor.next_restart_delay(generation) else {
            continue;
        };
        tracing::info!("Restarting service in {:?}", delay);
        let mut stop_rx = supervisor.inner.stop_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => continue,
        }
        supervisor.restart(generation).await;
    }
}
